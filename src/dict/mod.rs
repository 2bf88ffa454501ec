//! Chained hash table with incremental rehashing.
//!
//! A [`Dict`] keeps two generations of bucket arrays. When the primary
//! generation fills up a second one of twice the size is allocated and
//! entries migrate bucket by bucket: every lookup, insert and delete moves
//! one bucket while a rehash is in progress, and the server cron can move
//! larger batches with [`Dict::rehash_milliseconds`]. Large tables therefore
//! resize without a latency spike.
//!
//! While rehashing, lookups probe both generations. Inserts always go to the
//! incoming generation so the outgoing one only shrinks.

pub mod hash;
mod iter;

use std::time::Instant;

use rand::Rng;

use crate::error::DictError;

pub use iter::{DictIterator, Iter};

/// Initial number of buckets of every table.
pub const DICT_HT_INITIAL_SIZE: usize = 4;

/// Load factor above which a table grows even while resizing is disabled.
const DICT_FORCE_RESIZE_RATIO: usize = 5;

/// Buckets moved per batch by [`Dict::rehash_milliseconds`].
const REHASH_BATCH: usize = 100;

/// Per-table behaviour: hashing, key equality and ownership hooks.
///
/// The dup hooks run when a key or value is stored, the drop hooks when the
/// table gives up an entry it owns (delete, overwrite, clear). Entries
/// handed back by [`Dict::unlink`] bypass the drop hooks.
pub trait DictType<K, V> {
    fn hash(&self, key: &K) -> u64;

    fn key_eq(&self, a: &K, b: &K) -> bool;

    fn dup_key(&self, key: K) -> K {
        key
    }

    fn dup_val(&self, val: V) -> V {
        val
    }

    fn drop_key(&self, _key: K) {}

    fn drop_val(&self, _val: V) {}
}

/// Byte-string keys hashed with the seeded MurmurHash2.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesType;

impl<V> DictType<Vec<u8>, V> for BytesType {
    fn hash(&self, key: &Vec<u8>) -> u64 {
        hash::gen_hash(key) as u64
    }

    fn key_eq(&self, a: &Vec<u8>, b: &Vec<u8>) -> bool {
        a == b
    }
}

pub(crate) type Chain<K, V> = Option<Box<DictEntry<K, V>>>;

#[derive(Debug)]
pub struct DictEntry<K, V> {
    key: K,
    val: V,
    next: Chain<K, V>,
}

impl<K, V> DictEntry<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn val(&self) -> &V {
        &self.val
    }

    pub fn val_mut(&mut self) -> &mut V {
        &mut self.val
    }
}

/// One generation of buckets.
#[derive(Debug)]
pub(crate) struct DictHt<K, V> {
    table: Vec<Chain<K, V>>,
    size: usize,
    size_mask: usize,
    used: usize,
}

impl<K, V> DictHt<K, V> {
    fn empty() -> Self {
        Self {
            table: Vec::new(),
            size: 0,
            size_mask: 0,
            used: 0,
        }
    }

    fn with_size(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let mut table = Vec::with_capacity(size);
        table.resize_with(size, || None);
        Self {
            table,
            size,
            size_mask: size - 1,
            used: 0,
        }
    }

    fn push_front(&mut self, idx: usize, mut entry: Box<DictEntry<K, V>>) {
        entry.next = self.table[idx].take();
        self.table[idx] = Some(entry);
        self.used += 1;
    }
}

pub struct Dict<K, V, T: DictType<K, V>> {
    ty: T,
    ht: [DictHt<K, V>; 2],
    rehash_idx: Option<usize>,
    /// Live safe iterators; automatic rehash steps pause while non-zero.
    iterators: usize,
    /// Bumped on every structural mutation; checked by unsafe iterators.
    version: u64,
    resize_allowed: bool,
}

impl<K, V, T: DictType<K, V>> Dict<K, V, T> {
    /// Creates an empty table. No buckets are allocated until the first insert.
    pub fn new(ty: T) -> Self {
        Self {
            ty,
            ht: [DictHt::empty(), DictHt::empty()],
            rehash_idx: None,
            iterators: 0,
            version: 0,
            resize_allowed: true,
        }
    }

    pub fn len(&self) -> usize {
        self.ht[0].used + self.ht[1].used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of buckets across both generations.
    pub fn slots(&self) -> usize {
        self.ht[0].size + self.ht[1].size
    }

    /// Bucket counts of the outgoing and incoming generation.
    pub fn table_sizes(&self) -> (usize, usize) {
        (self.ht[0].size, self.ht[1].size)
    }

    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx.is_some()
    }

    /// Next bucket of the outgoing generation awaiting migration.
    pub fn rehash_index(&self) -> Option<usize> {
        self.rehash_idx
    }

    pub fn dict_type(&self) -> &T {
        &self.ty
    }

    /// Allows or forbids growing at the normal load factor. Growth still
    /// happens once the load factor passes the force ratio.
    pub fn set_resize_allowed(&mut self, allowed: bool) {
        self.resize_allowed = allowed;
    }

    /// Shrinks the table to the smallest power of two that holds every
    /// element, but never below the initial size.
    pub fn resize(&mut self) -> Result<(), DictError> {
        if !self.resize_allowed || self.is_rehashing() {
            return Err(DictError::Resizing);
        }
        let minimal = self.ht[0].used.max(DICT_HT_INITIAL_SIZE);
        self.expand(minimal)
    }

    /// Allocates a table of at least `size` buckets and starts migrating
    /// into it (or installs it directly when the table is still empty).
    pub fn expand(&mut self, size: usize) -> Result<(), DictError> {
        if self.is_rehashing() {
            return Err(DictError::Resizing);
        }
        if self.ht[0].used > size {
            return Err(DictError::TooSmall {
                requested: size,
                used: self.ht[0].used,
            });
        }
        let real_size = next_power(size);
        if real_size == self.ht[0].size {
            return Err(DictError::TooSmall {
                requested: size,
                used: self.ht[0].used,
            });
        }

        let table = DictHt::with_size(real_size);
        self.version += 1;
        if self.ht[0].size == 0 {
            self.ht[0] = table;
        } else {
            self.ht[1] = table;
            self.rehash_idx = Some(0);
        }
        Ok(())
    }

    /// Migrates up to `n` non-empty buckets. Returns `true` while there is
    /// still work left.
    pub fn rehash(&mut self, mut n: usize) -> bool {
        let Some(mut idx) = self.rehash_idx else {
            return false;
        };
        // Bound the number of empty buckets visited per call.
        let mut empty_visits = n * 10;

        while n > 0 && self.ht[0].used != 0 {
            n -= 1;
            assert!(idx < self.ht[0].size, "rehash index past the end of the table");

            while self.ht[0].table[idx].is_none() {
                idx += 1;
                empty_visits -= 1;
                if empty_visits == 0 {
                    self.rehash_idx = Some(idx);
                    return true;
                }
            }

            let mut chain = self.ht[0].table[idx].take();
            while let Some(mut entry) = chain {
                chain = entry.next.take();
                let h = self.ty.hash(&entry.key) as usize & self.ht[1].size_mask;
                self.ht[0].used -= 1;
                self.ht[1].push_front(h, entry);
            }
            idx += 1;
        }
        self.version += 1;

        if self.ht[0].used == 0 {
            self.ht[0] = std::mem::replace(&mut self.ht[1], DictHt::empty());
            self.rehash_idx = None;
            return false;
        }
        self.rehash_idx = Some(idx);
        true
    }

    /// Rehashes in batches for roughly `ms` milliseconds. Returns the number
    /// of buckets processed.
    pub fn rehash_milliseconds(&mut self, ms: u64) -> usize {
        if self.iterators > 0 {
            return 0;
        }
        let start = Instant::now();
        let mut rehashes = 0;
        while self.rehash(REHASH_BATCH) {
            rehashes += REHASH_BATCH;
            if start.elapsed().as_millis() as u64 > ms {
                break;
            }
        }
        rehashes
    }

    /// The single step performed on every touch while rehashing.
    fn rehash_step(&mut self) {
        if self.iterators == 0 {
            self.rehash(1);
        }
    }

    fn expand_if_needed(&mut self) -> Result<(), DictError> {
        if self.is_rehashing() {
            return Ok(());
        }
        if self.ht[0].size == 0 {
            return self.expand(DICT_HT_INITIAL_SIZE);
        }
        let (used, size) = (self.ht[0].used, self.ht[0].size);
        if used >= size && (self.resize_allowed || used / size > DICT_FORCE_RESIZE_RATIO) {
            return self.expand(used * 2);
        }
        Ok(())
    }

    /// Adds a new key. Fails with [`DictError::Exists`] if the key is present.
    pub fn add(&mut self, key: K, val: V) -> Result<(), DictError> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        self.expand_if_needed()?;

        let h = self.ty.hash(&key);
        if self.locate(&key, h).is_some() {
            return Err(DictError::Exists);
        }

        let table = if self.is_rehashing() { 1 } else { 0 };
        let idx = h as usize & self.ht[table].size_mask;
        let entry = Box::new(DictEntry {
            key: self.ty.dup_key(key),
            val: self.ty.dup_val(val),
            next: None,
        });
        self.ht[table].push_front(idx, entry);
        self.version += 1;
        Ok(())
    }

    /// Add-or-overwrite. Returns `true` when the key was newly added.
    ///
    /// On overwrite the new value is installed before the old one is handed
    /// to the drop hook, so a value replaced by itself stays valid.
    pub fn replace(&mut self, key: K, val: V) -> bool {
        if self.find(&key).is_none() {
            return self.add(key, val).is_ok();
        }
        let val = self.ty.dup_val(val);
        if let Some(entry) = self.find_mut(&key) {
            let old = std::mem::replace(&mut entry.val, val);
            self.ty.drop_val(old);
        }
        false
    }

    /// Finds the generation and bucket holding `key`, without side effects.
    fn locate(&self, key: &K, h: u64) -> Option<(usize, usize)> {
        if self.ht[0].size == 0 {
            return None;
        }
        for table in 0..2 {
            let idx = h as usize & self.ht[table].size_mask;
            let mut he = self.ht[table].table.get(idx).and_then(|c| c.as_deref());
            while let Some(entry) = he {
                if self.ty.key_eq(&entry.key, key) {
                    return Some((table, idx));
                }
                he = entry.next.as_deref();
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    /// Looks up `key`, advancing the rehash by one bucket as a side effect.
    pub fn find(&mut self, key: &K) -> Option<&DictEntry<K, V>> {
        self.find_mut(key).map(|e| &*e)
    }

    pub fn find_mut(&mut self, key: &K) -> Option<&mut DictEntry<K, V>> {
        if self.ht[0].size == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let h = self.ty.hash(key);
        let (table, idx) = self.locate(key, h)?;

        let ty = &self.ty;
        let mut he = self.ht[table].table[idx].as_deref_mut();
        while let Some(entry) = he {
            if ty.key_eq(&entry.key, key) {
                return Some(entry);
            }
            he = entry.next.as_deref_mut();
        }
        None
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.find(key).map(|e| &e.val)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.find_mut(key).map(|e| &mut e.val)
    }

    pub fn contains_key(&mut self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Side-effect free lookup, usable through a shared reference.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let h = self.ty.hash(key);
        let (table, idx) = self.locate(key, h)?;
        let mut he = self.ht[table].table[idx].as_deref();
        while let Some(entry) = he {
            if self.ty.key_eq(&entry.key, key) {
                return Some(&entry.val);
            }
            he = entry.next.as_deref();
        }
        None
    }

    /// Removes `key` from whichever generation holds it and returns the
    /// entry's key and value without running the drop hooks.
    pub fn unlink(&mut self, key: &K) -> Option<(K, V)> {
        if self.ht[0].size == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let h = self.ty.hash(key);
        let (table, idx) = self.locate(key, h)?;

        let ty = &self.ty;
        let mut link = &mut self.ht[table].table[idx];
        while link.as_ref().is_some_and(|e| !ty.key_eq(&e.key, key)) {
            link = &mut link.as_mut()?.next;
        }
        let mut removed = link.take()?;
        *link = removed.next.take();

        self.ht[table].used -= 1;
        self.version += 1;
        let DictEntry { key, val, .. } = *removed;
        Some((key, val))
    }

    /// Removes `key`, running the drop hooks on the key and value.
    pub fn delete(&mut self, key: &K) -> Result<(), DictError> {
        let (key, val) = self.unlink(key).ok_or(DictError::NotFound)?;
        self.ty.drop_key(key);
        self.ty.drop_val(val);
        Ok(())
    }

    /// Empties both generations. `callback` runs every 65536 buckets so
    /// long clears can keep serving housekeeping.
    pub fn clear_with(&mut self, mut callback: impl FnMut()) {
        for table in 0..2 {
            let ht = std::mem::replace(&mut self.ht[table], DictHt::empty());
            for (i, mut chain) in ht.table.into_iter().enumerate() {
                if (i & 65535) == 0 && i > 0 {
                    callback();
                }
                while let Some(mut entry) = chain {
                    chain = entry.next.take();
                    let DictEntry { key, val, .. } = *entry;
                    self.ty.drop_key(key);
                    self.ty.drop_val(val);
                }
            }
        }
        self.rehash_idx = None;
        self.version += 1;
    }

    pub fn clear(&mut self) {
        self.clear_with(|| {});
    }

    /// Returns a uniformly chosen bucket's random entry, or `None` when empty.
    pub fn random_entry(&mut self) -> Option<&DictEntry<K, V>> {
        if self.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }

        let mut rng = rand::rng();
        let head = loop {
            let chain = match self.rehash_idx {
                Some(rehash_idx) => {
                    // Buckets below the rehash index in the outgoing table are empty.
                    let (s0, s1) = (self.ht[0].size, self.ht[1].size);
                    let h = rehash_idx + rng.random_range(0..(s0 + s1 - rehash_idx));
                    if h >= s0 {
                        &self.ht[1].table[h - s0]
                    } else {
                        &self.ht[0].table[h]
                    }
                }
                None => {
                    let h = rng.random_range(0..self.ht[0].size);
                    &self.ht[0].table[h]
                }
            };
            if let Some(entry) = chain.as_deref() {
                break entry;
            }
        };

        let mut len = 0;
        let mut he = Some(head);
        while let Some(entry) = he {
            len += 1;
            he = entry.next.as_deref();
        }
        let mut pick = rng.random_range(0..len);
        let mut he = head;
        while pick > 0 {
            he = he.next.as_deref()?;
            pick -= 1;
        }
        Some(he)
    }

    /// Samples up to `count` entries by walking consecutive buckets from a
    /// random offset. Faster than repeated [`Dict::random_entry`] calls but
    /// the result is not uniformly distributed and may repeat an entry.
    pub fn random_entries(&mut self, count: usize) -> Vec<&DictEntry<K, V>> {
        let count = count.min(self.len());
        if count == 0 {
            return Vec::new();
        }
        for _ in 0..count {
            if self.is_rehashing() {
                self.rehash_step();
            } else {
                break;
            }
        }

        let tables = if self.is_rehashing() { 2 } else { 1 };
        let max_mask = self.ht[0].size_mask.max(if tables == 2 { self.ht[1].size_mask } else { 0 });
        let mut rng = rand::rng();
        let mut i = rng.random_range(0..=max_mask);
        let mut empty_len = 0;
        let mut max_steps = count * 10;
        let mut out = Vec::with_capacity(count);

        while out.len() < count && max_steps > 0 {
            max_steps -= 1;
            for j in 0..tables {
                if let (2, 0, Some(rehash_idx)) = (tables, j, self.rehash_idx) {
                    // Already migrated part of the outgoing table: skip it.
                    if i < rehash_idx {
                        if i >= self.ht[1].size {
                            i = rehash_idx;
                        }
                        continue;
                    }
                }
                if i >= self.ht[j].size {
                    continue;
                }
                match self.ht[j].table[i].as_deref() {
                    None => {
                        empty_len += 1;
                        if empty_len >= 5 && empty_len > count {
                            i = rng.random_range(0..=max_mask);
                            empty_len = 0;
                        }
                    }
                    Some(mut entry) => {
                        empty_len = 0;
                        loop {
                            out.push(entry);
                            if out.len() == count {
                                return out;
                            }
                            match entry.next.as_deref() {
                                Some(next) => entry = next,
                                None => break,
                            }
                        }
                    }
                }
            }
            i = (i + 1) & max_mask;
        }
        out
    }

    /// Visits the buckets addressed by `cursor` and returns the next cursor,
    /// `0` once the walk is complete.
    ///
    /// The cursor is incremented in bit-reversed order, so growing or
    /// shrinking between calls never skips an element that was present for
    /// the whole walk. Elements may be reported more than once.
    pub fn scan(&self, cursor: u64, mut f: impl FnMut(&K, &V)) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let mut v = cursor;
        let emit = |chain: &Chain<K, V>, f: &mut dyn FnMut(&K, &V)| {
            let mut he = chain.as_deref();
            while let Some(entry) = he {
                f(&entry.key, &entry.val);
                he = entry.next.as_deref();
            }
        };

        let m0;
        if !self.is_rehashing() {
            let t0 = &self.ht[0];
            m0 = t0.size_mask as u64;
            emit(&t0.table[(v & m0) as usize], &mut f);
        } else {
            let (mut t0, mut t1) = (&self.ht[0], &self.ht[1]);
            // Walk the smaller table once, then every expansion of that
            // bucket in the larger one.
            if t0.size > t1.size {
                std::mem::swap(&mut t0, &mut t1);
            }
            m0 = t0.size_mask as u64;
            let m1 = t1.size_mask as u64;

            emit(&t0.table[(v & m0) as usize], &mut f);
            loop {
                emit(&t1.table[(v & m1) as usize], &mut f);
                v = ((v | m0).wrapping_add(1) & !m0) | (v & m0);
                if v & (m0 ^ m1) == 0 {
                    break;
                }
            }
        }

        v |= !m0;
        v = v.reverse_bits();
        v = v.wrapping_add(1);
        v.reverse_bits()
    }

    /// Borrowing iterator over every entry. The borrow forbids mutation
    /// for its whole lifetime.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.ht)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(k, _)| k)
    }
}

impl<K, V, T: DictType<K, V> + Default> Default for Dict<K, V, T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<K, V, T: DictType<K, V>> Drop for Dict<K, V, T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug, T: DictType<K, V>> std::fmt::Debug for Dict<K, V, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dict")
            .field("len", &self.len())
            .field("sizes", &self.table_sizes())
            .field("rehash_idx", &self.rehash_idx)
            .field("iterators", &self.iterators)
            .finish()
    }
}

fn next_power(size: usize) -> usize {
    if size >= isize::MAX as usize {
        return isize::MAX as usize + 1;
    }
    let mut i = DICT_HT_INITIAL_SIZE;
    while i < size {
        i *= 2;
    }
    i
}
