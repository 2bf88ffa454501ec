use std::collections::VecDeque;

use super::{Dict, DictEntry, DictHt, DictType};

/// Borrowing iterator over both generations of a [`Dict`].
pub struct Iter<'a, K, V> {
    ht: &'a [DictHt<K, V>; 2],
    table: usize,
    index: usize,
    entry: Option<&'a DictEntry<K, V>>,
}

impl<'a, K, V> Iter<'a, K, V> {
    pub(super) fn new(ht: &'a [DictHt<K, V>; 2]) -> Self {
        Self {
            ht,
            table: 0,
            index: 0,
            entry: None,
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.entry {
                self.entry = entry.next.as_deref();
                return Some((&entry.key, &entry.val));
            }
            if self.index >= self.ht[self.table].size {
                if self.table == 0 && self.ht[1].size > 0 {
                    self.table = 1;
                    self.index = 0;
                    continue;
                }
                return None;
            }
            self.entry = self.ht[self.table].table[self.index].as_deref();
            self.index += 1;
        }
    }
}

/// A cursor that does not borrow the table between steps.
///
/// A *safe* cursor pauses automatic rehashing until it is released, so the
/// caller may add and delete keys while walking. An *unsafe* cursor records
/// the table's structural version on its first step and panics on release
/// if the table changed in between.
///
/// Keys of the current bucket are copied when the cursor enters it, which
/// keeps the walk valid when the caller deletes the entry just returned.
#[derive(Debug)]
pub struct DictIterator<K> {
    safe: bool,
    started: bool,
    table: usize,
    index: usize,
    pending: VecDeque<K>,
    version: u64,
}

impl<K> DictIterator<K> {
    fn new(safe: bool) -> Self {
        Self {
            safe,
            started: false,
            table: 0,
            index: 0,
            pending: VecDeque::new(),
            version: 0,
        }
    }

    pub fn is_safe(&self) -> bool {
        self.safe
    }
}

impl<K: Clone, V, T: DictType<K, V>> Dict<K, V, T> {
    pub fn get_iterator(&self) -> DictIterator<K> {
        DictIterator::new(false)
    }

    pub fn get_safe_iterator(&self) -> DictIterator<K> {
        DictIterator::new(true)
    }

    /// Advances `it`, returning the next live entry.
    pub fn next_entry(&mut self, it: &mut DictIterator<K>) -> Option<(&K, &mut V)> {
        if !it.started {
            it.started = true;
            if it.safe {
                self.iterators += 1;
            } else {
                it.version = self.version;
            }
        }

        loop {
            while let Some(key) = it.pending.pop_front() {
                let bucket = it.index - 1;
                if self.bucket_holds(it.table, bucket, &key) {
                    return self.bucket_entry_mut(it.table, bucket, &key);
                }
            }

            if it.index >= self.ht[it.table].size {
                if self.is_rehashing() && it.table == 0 {
                    it.table = 1;
                    it.index = 0;
                    continue;
                }
                return None;
            }

            let mut he = self.ht[it.table].table[it.index].as_deref();
            while let Some(entry) = he {
                it.pending.push_back(entry.key.clone());
                he = entry.next.as_deref();
            }
            it.index += 1;
        }
    }

    /// Releases `it`, resuming rehashing for a safe cursor.
    ///
    /// # Panics
    ///
    /// Panics if `it` is unsafe and the table was structurally modified
    /// since its first step.
    pub fn release_iterator(&mut self, it: DictIterator<K>) {
        if !it.started {
            return;
        }
        if it.safe {
            self.iterators -= 1;
        } else {
            assert_eq!(
                it.version, self.version,
                "dict modified while an unsafe iterator was active"
            );
        }
    }

    fn bucket_holds(&self, table: usize, bucket: usize, key: &K) -> bool {
        let Some(chain) = self.ht[table].table.get(bucket) else {
            return false;
        };
        let mut he = chain.as_deref();
        while let Some(entry) = he {
            if self.ty.key_eq(&entry.key, key) {
                return true;
            }
            he = entry.next.as_deref();
        }
        false
    }

    fn bucket_entry_mut(&mut self, table: usize, bucket: usize, key: &K) -> Option<(&K, &mut V)> {
        let ty = &self.ty;
        let mut he = self.ht[table].table.get_mut(bucket)?.as_deref_mut();
        while let Some(entry) = he {
            if ty.key_eq(&entry.key, key) {
                return Some((&entry.key, &mut entry.val));
            }
            he = entry.next.as_deref_mut();
        }
        None
    }
}
