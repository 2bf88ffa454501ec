//! One keyspace: values, expire times and the expiry logic.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::dict::{BytesType, Dict};
use crate::object::RObj;
use crate::util;

/// Keys sampled per database in one active expire round.
pub const ACTIVE_EXPIRE_CYCLE_LOOKUPS_PER_LOOP: usize = 20;

/// Tables whose fill drops under this percentage are shrunk.
const HASHTABLE_MIN_FILL: usize = 10;

/// Observer for keyspace changes. Persistence or replication layers plug
/// in here; the core never waits on them.
pub trait KeyspaceEvents {
    fn key_expired(&mut self, _db: usize, _key: &[u8]) {}

    fn key_modified(&mut self, _db: usize, _key: &[u8]) {}

    /// Every key in `db` was removed at once.
    fn db_flushed(&mut self, _db: usize) {}
}

/// Ignores every event.
#[derive(Debug, Default)]
pub struct NoopEvents;

impl KeyspaceEvents for NoopEvents {}

#[derive(Debug)]
pub struct Db {
    id: usize,
    dict: Dict<Vec<u8>, RObj, BytesType>,
    expires: Dict<Vec<u8>, i64, BytesType>,
    expired_keys: u64,
}

impl Db {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            dict: Dict::new(BytesType),
            expires: Dict::new(BytesType),
            expired_keys: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn expires_len(&self) -> usize {
        self.expires.len()
    }

    /// Keys removed by lazy or active expiry so far.
    pub fn expired_keys(&self) -> u64 {
        self.expired_keys
    }

    pub fn reset_stats(&mut self) {
        self.expired_keys = 0;
    }

    pub fn dict(&self) -> &Dict<Vec<u8>, RObj, BytesType> {
        &self.dict
    }

    /// Absolute expire time of `key` in Unix milliseconds.
    pub fn get_expire(&mut self, key: &[u8]) -> Option<i64> {
        if self.expires.is_empty() {
            return None;
        }
        self.expires.get(&key.to_vec()).copied()
    }

    /// Sets an expire on an existing key.
    pub fn set_expire(&mut self, key: &[u8], when: i64) {
        let key = key.to_vec();
        debug_assert!(self.dict.peek(&key).is_some(), "expire set on a missing key");
        self.expires.replace(key, when);
    }

    pub fn remove_expire(&mut self, key: &[u8]) -> bool {
        self.expires.delete(&key.to_vec()).is_ok()
    }

    /// Deletes `key` if its expire time has passed. Returns whether it did.
    pub fn expire_if_needed(&mut self, key: &[u8], now: i64, events: &mut dyn KeyspaceEvents) -> bool {
        match self.get_expire(key) {
            Some(when) if now > when => {
                self.delete(key);
                self.expired_keys += 1;
                events.key_expired(self.id, key);
                trace!(db = self.id, key = %String::from_utf8_lossy(key), "expired key");
                true
            }
            _ => false,
        }
    }

    /// Looks up a live key, expiring it first if due, and refreshes its
    /// LRU stamp.
    pub fn lookup(&mut self, key: &[u8], now: i64, events: &mut dyn KeyspaceEvents) -> Option<&mut RObj> {
        self.expire_if_needed(key, now, events);
        let obj = self.dict.get_mut(&key.to_vec())?;
        obj.touch();
        Some(obj)
    }

    /// Like [`Db::lookup`] but leaves the LRU stamp alone.
    pub fn lookup_quiet(&mut self, key: &[u8], now: i64, events: &mut dyn KeyspaceEvents) -> Option<&RObj> {
        self.expire_if_needed(key, now, events);
        self.dict.peek(&key.to_vec())
    }

    /// Whether `key` is live, without touching its LRU stamp.
    pub fn exists(&mut self, key: &[u8], now: i64, events: &mut dyn KeyspaceEvents) -> bool {
        self.expire_if_needed(key, now, events);
        self.dict.contains_key(&key.to_vec())
    }

    /// Adds a key that must not exist yet.
    pub fn add(&mut self, key: Vec<u8>, val: RObj) {
        let added = self.dict.add(key, val);
        debug_assert!(added.is_ok(), "db add on an existing key");
    }

    /// Adds or overwrites `key` and clears any expire it had.
    pub fn set_key(&mut self, key: Vec<u8>, val: RObj) {
        self.remove_expire(&key);
        self.dict.replace(key, val);
    }

    /// Removes `key` and its expire. Returns whether it existed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let key = key.to_vec();
        if !self.expires.is_empty() {
            let _ = self.expires.delete(&key);
        }
        self.dict.delete(&key).is_ok()
    }

    /// Moves the value (and expire) of `from` to `to`, overwriting `to`.
    pub fn rename(&mut self, from: &[u8], to: Vec<u8>) -> bool {
        let Some((_, val)) = self.dict.unlink(&from.to_vec()) else {
            return false;
        };
        let expire = self.expires.unlink(&from.to_vec()).map(|(_, when)| when);
        self.set_key(to.clone(), val);
        if let Some(when) = expire {
            self.set_expire(&to, when);
        }
        true
    }

    /// Empties the database, returning the number of keys removed.
    pub fn flush(&mut self) -> usize {
        let removed = self.dict.len();
        self.dict.clear();
        self.expires.clear();
        removed
    }

    /// A random live key. Expired keys met along the way are deleted.
    pub fn random_key(&mut self, now: i64, events: &mut dyn KeyspaceEvents) -> Option<Vec<u8>> {
        loop {
            let key = self.dict.random_entry()?.key().clone();
            if !self.expire_if_needed(&key, now, events) {
                return Some(key);
            }
        }
    }

    /// Live keys matching `pattern`. Walks with a safe iterator so expired
    /// keys can be deleted on the way.
    pub fn keys(&mut self, pattern: &[u8], now: i64, events: &mut dyn KeyspaceEvents) -> Vec<Vec<u8>> {
        let all = pattern == b"*";
        let mut out = Vec::new();
        let mut it = self.dict.get_safe_iterator();
        while let Some((key, _)) = self.dict.next_entry(&mut it) {
            if !all && !util::string_match(pattern, key, false) {
                continue;
            }
            let key = key.clone();
            if !self.expire_if_needed(&key, now, events) {
                out.push(key);
            }
        }
        self.dict.release_iterator(it);
        out
    }

    /// One step of a SCAN walk over the keyspace.
    pub fn scan(&self, cursor: u64, mut f: impl FnMut(&[u8])) -> u64 {
        self.dict.scan(cursor, |k, _| f(k))
    }

    /// Samples volatile keys and deletes the expired ones, repeating while
    /// more than a quarter of a sample was expired and time remains.
    /// Returns the number of keys expired.
    pub fn active_expire_cycle(&mut self, now: i64, deadline: Instant, events: &mut dyn KeyspaceEvents) -> usize {
        let mut total = 0;
        let mut iteration = 0u32;
        loop {
            let volatile = self.expires.len();
            if volatile == 0 {
                break;
            }
            let samples = volatile.min(ACTIVE_EXPIRE_CYCLE_LOOKUPS_PER_LOOP);
            let mut expired = 0;
            for _ in 0..samples {
                let Some(entry) = self.expires.random_entry() else {
                    break;
                };
                let (key, when) = (entry.key().clone(), *entry.val());
                if now > when {
                    self.delete(&key);
                    self.expired_keys += 1;
                    events.key_expired(self.id, &key);
                    expired += 1;
                }
            }
            total += expired;

            iteration += 1;
            // Check the clock every 16 rounds.
            if iteration % 16 == 0 && Instant::now() >= deadline {
                break;
            }
            if expired <= ACTIVE_EXPIRE_CYCLE_LOOKUPS_PER_LOOP / 4 {
                break;
            }
        }
        if total > 0 {
            debug!(db = self.id, expired = total, "active expire cycle");
        }
        total
    }

    /// Shrinks the keyspace and expire tables when they are mostly empty.
    pub fn try_resize(&mut self) {
        if needs_resize(&self.dict) {
            let _ = self.dict.resize();
        }
        if needs_resize(&self.expires) {
            let _ = self.expires.resize();
        }
    }

    /// Spends about `ms` milliseconds rehashing. Returns true if there was
    /// rehash work to do.
    pub fn incremental_rehash(&mut self, ms: u64) -> bool {
        if self.dict.is_rehashing() {
            let moved = self.dict.rehash_milliseconds(ms);
            trace!(db = self.id, buckets = moved, "rehashed keyspace");
            return true;
        }
        if self.expires.is_rehashing() {
            self.expires.rehash_milliseconds(ms);
            return true;
        }
        false
    }
}

fn needs_resize<V>(d: &Dict<Vec<u8>, V, BytesType>) -> bool {
    let (size, used) = (d.slots(), d.len());
    size > crate::dict::DICT_HT_INITIAL_SIZE && used * 100 / size < HASHTABLE_MIN_FILL
}

/// Deadline for an active expire pass given the cron frequency: a quarter
/// of the cron period.
pub fn active_expire_deadline(hz: u32) -> Instant {
    let budget_us = 1_000_000 / hz.max(1) as u64 / 4;
    Instant::now() + Duration::from_micros(budget_us)
}
