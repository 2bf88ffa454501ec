//! Sorted set: a member index for O(1) score lookups next to a skip list
//! for ordered access. Both structures always hold the same members.

use crate::dict::{BytesType, Dict};
use crate::skiplist::{NodeId, RangeSpec, SkipList};

#[derive(Debug, Default)]
pub struct ZSet {
    dict: Dict<Vec<u8>, f64, BytesType>,
    zsl: SkipList,
}

/// Outcome of [`ZSet::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZAddResult {
    Added,
    Updated,
    Unchanged,
}

impl ZSet {
    pub fn new() -> Self {
        Self {
            dict: Dict::new(BytesType),
            zsl: SkipList::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.zsl.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zsl.is_empty()
    }

    pub fn skiplist(&self) -> &SkipList {
        &self.zsl
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.dict.peek(&member.to_vec()).copied()
    }

    /// Sets `member` to `score`, inserting it when missing.
    pub fn add(&mut self, score: f64, member: &[u8]) -> ZAddResult {
        let key = member.to_vec();
        match self.dict.get_mut(&key) {
            Some(cur) if *cur == score => ZAddResult::Unchanged,
            Some(cur) => {
                let old = std::mem::replace(cur, score);
                self.zsl.update_score(old, member, score);
                ZAddResult::Updated
            }
            None => {
                self.zsl.insert(score, key.clone());
                let _ = self.dict.add(key, score);
                ZAddResult::Added
            }
        }
    }

    /// Adds `delta` to the member's score (from 0 when missing). Returns
    /// `None` when the result is NaN, leaving the set untouched.
    pub fn incr(&mut self, delta: f64, member: &[u8]) -> Option<f64> {
        let score = self.score(member).unwrap_or(0.0) + delta;
        if score.is_nan() {
            return None;
        }
        self.add(score, member);
        Some(score)
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.dict.unlink(&member.to_vec()) {
            Some((_, score)) => {
                self.zsl.delete(score, member);
                true
            }
            None => false,
        }
    }

    /// 0-based rank, counted from the highest score when `reverse`.
    pub fn rank(&self, member: &[u8], reverse: bool) -> Option<usize> {
        let score = self.score(member)?;
        let rank = self.zsl.get_rank(score, member);
        debug_assert!(rank != 0, "member index and skiplist disagree");
        if reverse {
            Some(self.len() - rank)
        } else {
            Some(rank - 1)
        }
    }

    /// Elements with 0-based ranks `start..=end` (already clamped).
    pub fn range_by_rank(&self, start: usize, end: usize, reverse: bool) -> Vec<(Vec<u8>, f64)> {
        if start > end || start >= self.len() {
            return Vec::new();
        }
        let end = end.min(self.len() - 1);
        let first = if reverse {
            self.zsl.get_element_by_rank(self.len() - start)
        } else {
            self.zsl.get_element_by_rank(start + 1)
        };
        self.walk(first, reverse, end - start + 1)
    }

    /// Elements inside `range`, skipping `offset` and returning at most
    /// `limit` (all when `None`).
    pub fn range_by_score(
        &self,
        range: &RangeSpec,
        reverse: bool,
        offset: usize,
        limit: Option<usize>,
    ) -> Vec<(Vec<u8>, f64)> {
        let mut cur = if reverse {
            self.zsl.last_in_range(range)
        } else {
            self.zsl.first_in_range(range)
        };
        for _ in 0..offset {
            match cur {
                Some(id) => cur = self.step(id, reverse),
                None => break,
            }
        }

        let mut out = Vec::new();
        while let Some(id) = cur {
            if limit.is_some_and(|l| out.len() >= l) {
                break;
            }
            let score = self.zsl.score(id);
            let inside = if reverse {
                range.value_gte_min(score)
            } else {
                range.value_lte_max(score)
            };
            if !inside {
                break;
            }
            out.push((self.zsl.member(id).to_vec(), score));
            cur = self.step(id, reverse);
        }
        out
    }

    /// Number of elements inside `range`.
    pub fn count(&self, range: &RangeSpec) -> usize {
        let Some(first) = self.zsl.first_in_range(range) else {
            return 0;
        };
        let Some(last) = self.zsl.last_in_range(range) else {
            return 0;
        };
        let first_rank = self.zsl.get_rank(self.zsl.score(first), self.zsl.member(first));
        let last_rank = self.zsl.get_rank(self.zsl.score(last), self.zsl.member(last));
        last_rank + 1 - first_rank
    }

    pub fn remove_range_by_score(&mut self, range: &RangeSpec) -> usize {
        self.zsl.delete_range_by_score(range, &mut self.dict)
    }

    /// Removes 0-based ranks `start..=end` (already clamped).
    pub fn remove_range_by_rank(&mut self, start: usize, end: usize) -> usize {
        self.zsl.delete_range_by_rank(start + 1, end + 1, &mut self.dict)
    }

    fn step(&self, id: NodeId, reverse: bool) -> Option<NodeId> {
        if reverse {
            self.zsl.prev(id)
        } else {
            self.zsl.next(id)
        }
    }

    fn walk(&self, mut cur: Option<NodeId>, reverse: bool, n: usize) -> Vec<(Vec<u8>, f64)> {
        let mut out = Vec::with_capacity(n);
        while let Some(id) = cur {
            if out.len() == n {
                break;
            }
            out.push((self.zsl.member(id).to_vec(), self.zsl.score(id)));
            cur = self.step(id, reverse);
        }
        out
    }
}

/// Converts Redis-style signed indexes (negative counts from the end) to
/// a clamped inclusive range, or `None` when the range is empty.
pub fn normalize_range(start: i64, end: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut end = if end < 0 { len + end } else { end };
    if start < 0 {
        start = 0;
    }
    if start > end || start >= len {
        return None;
    }
    if end >= len {
        end = len - 1;
    }
    Some((start as usize, end as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ZSet {
        let mut z = ZSet::new();
        for (s, m) in [(1.0, "a"), (2.0, "b"), (3.0, "c"), (4.0, "d"), (5.0, "e")] {
            assert_eq!(z.add(s, m.as_bytes()), ZAddResult::Added);
        }
        z
    }

    fn names(v: &[(Vec<u8>, f64)]) -> Vec<&str> {
        v.iter().map(|(m, _)| std::str::from_utf8(m).unwrap()).collect()
    }

    #[test]
    fn test_add_update_remove() {
        let mut z = sample();
        assert_eq!(z.add(1.0, b"a"), ZAddResult::Unchanged);
        assert_eq!(z.add(10.0, b"a"), ZAddResult::Updated);
        assert_eq!(z.score(b"a"), Some(10.0));
        assert_eq!(z.rank(b"a", false), Some(4));
        assert_eq!(z.rank(b"a", true), Some(0));

        assert!(z.remove(b"c"));
        assert!(!z.remove(b"c"));
        assert_eq!(z.len(), 4);
        assert_eq!(z.score(b"c"), None);
        assert_eq!(z.rank(b"c", false), None);
    }

    #[test]
    fn test_incr() {
        let mut z = sample();
        assert_eq!(z.incr(2.5, b"a"), Some(3.5));
        assert_eq!(z.incr(1.0, b"new"), Some(1.0));
        assert_eq!(z.len(), 6);

        z.add(f64::INFINITY, b"inf");
        assert_eq!(z.incr(f64::NEG_INFINITY, b"inf"), None);
        assert_eq!(z.score(b"inf"), Some(f64::INFINITY));
    }

    #[test]
    fn test_range_by_rank() {
        let z = sample();
        assert_eq!(names(&z.range_by_rank(0, 2, false)), ["a", "b", "c"]);
        assert_eq!(names(&z.range_by_rank(0, 1, true)), ["e", "d"]);
        assert_eq!(names(&z.range_by_rank(3, 100, false)), ["d", "e"]);
        assert!(z.range_by_rank(7, 9, false).is_empty());
    }

    #[test]
    fn test_range_by_score_with_limit() {
        let z = sample();
        let r = RangeSpec::parse(b"(1", b"4").unwrap();
        assert_eq!(names(&z.range_by_score(&r, false, 0, None)), ["b", "c", "d"]);
        assert_eq!(names(&z.range_by_score(&r, true, 0, None)), ["d", "c", "b"]);
        assert_eq!(names(&z.range_by_score(&r, false, 1, Some(1))), ["c"]);
        assert!(z.range_by_score(&r, false, 5, None).is_empty());
        assert_eq!(z.count(&r), 3);
        assert_eq!(z.count(&RangeSpec::inclusive(10.0, 20.0)), 0);
    }

    #[test]
    fn test_remove_ranges_keep_index_in_sync() {
        let mut z = sample();
        assert_eq!(z.remove_range_by_score(&RangeSpec::inclusive(2.0, 3.0)), 2);
        assert_eq!(z.score(b"b"), None);
        assert_eq!(z.remove_range_by_rank(0, 0), 1);
        assert_eq!(z.score(b"a"), None);
        assert_eq!(z.len(), 2);
        assert_eq!(z.rank(b"e", false), Some(1));
    }

    #[test]
    fn test_normalize_range() {
        assert_eq!(normalize_range(0, -1, 5), Some((0, 4)));
        assert_eq!(normalize_range(-2, -1, 5), Some((3, 4)));
        assert_eq!(normalize_range(-100, 2, 5), Some((0, 2)));
        assert_eq!(normalize_range(3, 1, 5), None);
        assert_eq!(normalize_range(5, 10, 5), None);
        assert_eq!(normalize_range(0, -1, 0), None);
    }
}
