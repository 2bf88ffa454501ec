//! Indexable skip list ordered by `(score, member)`.
//!
//! Nodes live in an arena and link to each other by index. Every forward
//! link carries a span, the number of level-0 nodes it jumps over, so the
//! 1-based rank of a node is the sum of the spans on the path to it.
//!
//! Ties on score are broken by comparing members byte-wise. The list never
//! holds two identical `(score, member)` pairs; callers deduplicate
//! members through the sorted set's member index.

use ordered_float::OrderedFloat;
use rand::Rng;

use crate::dict::{Dict, DictType};
use crate::util;

pub const ZSKIPLIST_MAXLEVEL: usize = 32;
pub const ZSKIPLIST_P: f64 = 0.25;

const HEADER: usize = 0;

/// Handle to a node. Invalidated when the node is deleted; the slot may be
/// reused by a later insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, Default)]
struct Level {
    forward: Option<usize>,
    span: usize,
}

#[derive(Debug)]
struct Node {
    member: Vec<u8>,
    score: f64,
    backward: Option<usize>,
    levels: Vec<Level>,
}

impl Node {
    fn key(&self) -> (OrderedFloat<f64>, &[u8]) {
        (OrderedFloat(self.score), self.member.as_slice())
    }
}

/// A score interval with independently open or closed ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeSpec {
    pub min: f64,
    pub max: f64,
    pub minex: bool,
    pub maxex: bool,
}

impl RangeSpec {
    pub fn inclusive(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            minex: false,
            maxex: false,
        }
    }

    /// Parses command-style bounds: a number, `(number` for an exclusive
    /// bound, or `-inf` / `+inf`.
    pub fn parse(min: &[u8], max: &[u8]) -> Option<Self> {
        let (min, minex) = parse_bound(min)?;
        let (max, maxex) = parse_bound(max)?;
        Some(Self {
            min,
            max,
            minex,
            maxex,
        })
    }

    pub fn value_gte_min(&self, value: f64) -> bool {
        if self.minex {
            value > self.min
        } else {
            value >= self.min
        }
    }

    pub fn value_lte_max(&self, value: f64) -> bool {
        if self.maxex {
            value < self.max
        } else {
            value <= self.max
        }
    }

    /// True when no value can satisfy both bounds.
    pub fn is_empty(&self) -> bool {
        self.min > self.max || (self.min == self.max && (self.minex || self.maxex))
    }
}

fn parse_bound(s: &[u8]) -> Option<(f64, bool)> {
    match s.split_first() {
        Some((b'(', rest)) => util::parse_f64(rest).map(|v| (v, true)),
        _ => util::parse_f64(s).map(|v| (v, false)),
    }
}

fn random_level() -> usize {
    let mut rng = rand::rng();
    let threshold = (ZSKIPLIST_P * 0xFFFF as f64) as u32;
    let mut level = 1;
    while (rng.random::<u32>() & 0xFFFF) < threshold {
        level += 1;
    }
    level.min(ZSKIPLIST_MAXLEVEL)
}

#[derive(Debug)]
pub struct SkipList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    tail: Option<usize>,
    length: usize,
    level: usize,
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipList {
    pub fn new() -> Self {
        let header = Node {
            member: Vec::new(),
            score: 0.0,
            backward: None,
            levels: vec![Level::default(); ZSKIPLIST_MAXLEVEL],
        };
        Self {
            nodes: vec![header],
            free: Vec::new(),
            tail: None,
            length: 0,
            level: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Highest level in use.
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn member(&self, id: NodeId) -> &[u8] {
        &self.nodes[id.0].member
    }

    pub fn score(&self, id: NodeId) -> f64 {
        self.nodes[id.0].score
    }

    pub fn first(&self) -> Option<NodeId> {
        self.nodes[HEADER].levels[0].forward.map(NodeId)
    }

    pub fn last(&self) -> Option<NodeId> {
        self.tail.map(NodeId)
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].levels[0].forward.map(NodeId)
    }

    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].backward.map(NodeId)
    }

    /// Ascending `(member, score)` pairs.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.first(),
            reverse: false,
        }
    }

    /// Descending `(member, score)` pairs, walked through backward links.
    pub fn iter_rev(&self) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.last(),
            reverse: true,
        }
    }

    fn lt(&self, x: usize, score: f64, member: &[u8]) -> bool {
        self.nodes[x].key() < (OrderedFloat(score), member)
    }

    fn alloc(&mut self, level: usize, score: f64, member: Vec<u8>) -> usize {
        let node = Node {
            member,
            score,
            backward: None,
            levels: vec![Level::default(); level],
        };
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Releases a slot and hands back its member.
    fn release(&mut self, x: usize) -> Vec<u8> {
        let node = &mut self.nodes[x];
        node.levels = Vec::new();
        node.backward = None;
        self.free.push(x);
        std::mem::take(&mut node.member)
    }

    /// Predecessor of `(score, member)` at every active level.
    fn find_update(&self, score: f64, member: &[u8]) -> [usize; ZSKIPLIST_MAXLEVEL] {
        let mut update = [HEADER; ZSKIPLIST_MAXLEVEL];
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].levels[i].forward {
                if !self.lt(next, score, member) {
                    break;
                }
                x = next;
            }
            update[i] = x;
        }
        update
    }

    /// Inserts a new node. The pair must not already be present.
    ///
    /// # Panics
    ///
    /// Panics if `score` is NaN.
    pub fn insert(&mut self, score: f64, member: Vec<u8>) -> NodeId {
        assert!(!score.is_nan(), "skiplist score must not be NaN");

        let mut update = [HEADER; ZSKIPLIST_MAXLEVEL];
        let mut rank = [0usize; ZSKIPLIST_MAXLEVEL];
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while let Some(next) = self.nodes[x].levels[i].forward {
                if !self.lt(next, score, &member) {
                    break;
                }
                rank[i] += self.nodes[x].levels[i].span;
                x = next;
            }
            update[i] = x;
        }

        let level = random_level();
        if level > self.level {
            for i in self.level..level {
                rank[i] = 0;
                update[i] = HEADER;
                self.nodes[HEADER].levels[i].span = self.length;
            }
            self.level = level;
        }

        let x = self.alloc(level, score, member);
        for i in 0..level {
            let prev = update[i];
            let prev_level = self.nodes[prev].levels[i];
            self.nodes[x].levels[i] = Level {
                forward: prev_level.forward,
                span: prev_level.span - (rank[0] - rank[i]),
            };
            self.nodes[prev].levels[i] = Level {
                forward: Some(x),
                span: rank[0] - rank[i] + 1,
            };
        }
        // Levels above the new node now jump over one more node.
        for i in level..self.level {
            self.nodes[update[i]].levels[i].span += 1;
        }

        self.nodes[x].backward = (update[0] != HEADER).then_some(update[0]);
        match self.nodes[x].levels[0].forward {
            Some(next) => self.nodes[next].backward = Some(x),
            None => self.tail = Some(x),
        }
        self.length += 1;
        NodeId(x)
    }

    fn delete_node(&mut self, x: usize, update: &[usize; ZSKIPLIST_MAXLEVEL]) {
        for i in 0..self.level {
            let prev = update[i];
            if self.nodes[prev].levels[i].forward == Some(x) {
                let removed = self.nodes[x].levels[i];
                let prev_level = &mut self.nodes[prev].levels[i];
                prev_level.span = prev_level.span + removed.span - 1;
                prev_level.forward = removed.forward;
            } else {
                self.nodes[prev].levels[i].span -= 1;
            }
        }

        let backward = self.nodes[x].backward;
        match self.nodes[x].levels[0].forward {
            Some(next) => self.nodes[next].backward = backward,
            None => self.tail = backward,
        }

        while self.level > 1 && self.nodes[HEADER].levels[self.level - 1].forward.is_none() {
            self.level -= 1;
        }
        self.length -= 1;
    }

    /// Removes `(score, member)`. Returns whether it was present.
    pub fn delete(&mut self, score: f64, member: &[u8]) -> bool {
        let update = self.find_update(score, member);
        match self.nodes[update[0]].levels[0].forward {
            Some(x) if self.nodes[x].score == score && self.nodes[x].member == member => {
                self.delete_node(x, &update);
                self.release(x);
                true
            }
            _ => false,
        }
    }

    /// Moves `member` from `cur_score` to `new_score`, updating in place
    /// when the node keeps its position.
    ///
    /// # Panics
    ///
    /// Panics if `(cur_score, member)` is not in the list.
    pub fn update_score(&mut self, cur_score: f64, member: &[u8], new_score: f64) -> NodeId {
        assert!(!new_score.is_nan(), "skiplist score must not be NaN");
        let update = self.find_update(cur_score, member);
        let x = match self.nodes[update[0]].levels[0].forward {
            Some(x) if self.nodes[x].score == cur_score && self.nodes[x].member == member => x,
            _ => panic!("updated element is not in the skiplist"),
        };

        let after_prev = self.nodes[x]
            .backward
            .is_none_or(|b| self.lt(b, new_score, member));
        let before_next = self.nodes[x].levels[0]
            .forward
            .is_none_or(|f| self.nodes[f].key() > (OrderedFloat(new_score), member));
        if after_prev && before_next {
            self.nodes[x].score = new_score;
            return NodeId(x);
        }

        self.delete_node(x, &update);
        let member = self.release(x);
        self.insert(new_score, member)
    }

    /// 1-based rank of `(score, member)`, or 0 when absent.
    pub fn get_rank(&self, score: f64, member: &[u8]) -> usize {
        let target = (OrderedFloat(score), member);
        let mut rank = 0;
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].levels[i].forward {
                if self.nodes[next].key() > target {
                    break;
                }
                rank += self.nodes[x].levels[i].span;
                x = next;
            }
            if x != HEADER && self.nodes[x].score == score && self.nodes[x].member == member {
                return rank;
            }
        }
        0
    }

    /// Node at 1-based `rank`.
    pub fn get_element_by_rank(&self, rank: usize) -> Option<NodeId> {
        if rank == 0 || rank > self.length {
            return None;
        }
        let mut traversed = 0;
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].levels[i].forward {
                if traversed + self.nodes[x].levels[i].span > rank {
                    break;
                }
                traversed += self.nodes[x].levels[i].span;
                x = next;
            }
            if traversed == rank {
                return Some(NodeId(x));
            }
        }
        None
    }

    /// True if some node's score may fall inside `range`.
    pub fn is_in_range(&self, range: &RangeSpec) -> bool {
        if range.is_empty() {
            return false;
        }
        match self.tail {
            Some(t) if range.value_gte_min(self.nodes[t].score) => {}
            _ => return false,
        }
        match self.nodes[HEADER].levels[0].forward {
            Some(f) => range.value_lte_max(self.nodes[f].score),
            None => false,
        }
    }

    /// Lowest node inside `range`.
    pub fn first_in_range(&self, range: &RangeSpec) -> Option<NodeId> {
        if !self.is_in_range(range) {
            return None;
        }
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].levels[i].forward {
                if range.value_gte_min(self.nodes[next].score) {
                    break;
                }
                x = next;
            }
        }
        // The tail is >= min, so a successor exists.
        let x = self.nodes[x].levels[0].forward?;
        range.value_lte_max(self.nodes[x].score).then_some(NodeId(x))
    }

    /// Highest node inside `range`.
    pub fn last_in_range(&self, range: &RangeSpec) -> Option<NodeId> {
        if !self.is_in_range(range) {
            return None;
        }
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].levels[i].forward {
                if !range.value_lte_max(self.nodes[next].score) {
                    break;
                }
                x = next;
            }
        }
        // The head is <= max, so `x` moved past the header.
        if x == HEADER {
            return None;
        }
        range.value_gte_min(self.nodes[x].score).then_some(NodeId(x))
    }

    /// Deletes every node inside `range`, removing each member from `index`
    /// as well. Returns the number removed.
    pub fn delete_range_by_score<V, T>(
        &mut self,
        range: &RangeSpec,
        index: &mut Dict<Vec<u8>, V, T>,
    ) -> usize
    where
        T: DictType<Vec<u8>, V>,
    {
        let mut update = [HEADER; ZSKIPLIST_MAXLEVEL];
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].levels[i].forward {
                if range.value_gte_min(self.nodes[next].score) {
                    break;
                }
                x = next;
            }
            update[i] = x;
        }

        let mut removed = 0;
        let mut cur = self.nodes[x].levels[0].forward;
        while let Some(x) = cur {
            if !range.value_lte_max(self.nodes[x].score) {
                break;
            }
            cur = self.nodes[x].levels[0].forward;
            self.delete_node(x, &update);
            let member = self.release(x);
            let deleted = index.delete(&member);
            debug_assert!(deleted.is_ok(), "member missing from the score index");
            removed += 1;
        }
        removed
    }

    /// Deletes ranks `start..=end` (1-based), removing each member from
    /// `index` as well. Returns the number removed.
    pub fn delete_range_by_rank<V, T>(
        &mut self,
        start: usize,
        end: usize,
        index: &mut Dict<Vec<u8>, V, T>,
    ) -> usize
    where
        T: DictType<Vec<u8>, V>,
    {
        let mut update = [HEADER; ZSKIPLIST_MAXLEVEL];
        let mut traversed = 0;
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].levels[i].forward {
                if traversed + self.nodes[x].levels[i].span >= start {
                    break;
                }
                traversed += self.nodes[x].levels[i].span;
                x = next;
            }
            update[i] = x;
        }

        traversed += 1;
        let mut removed = 0;
        let mut cur = self.nodes[x].levels[0].forward;
        while let Some(x) = cur {
            if traversed > end {
                break;
            }
            cur = self.nodes[x].levels[0].forward;
            self.delete_node(x, &update);
            let member = self.release(x);
            let deleted = index.delete(&member);
            debug_assert!(deleted.is_ok(), "member missing from the score index");
            removed += 1;
            traversed += 1;
        }
        removed
    }
}

pub struct Iter<'a> {
    list: &'a SkipList,
    cur: Option<NodeId>,
    reverse: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], f64);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        self.cur = if self.reverse {
            self.list.prev(id)
        } else {
            self.list.next(id)
        };
        let node = &self.list.nodes[id.0];
        Some((&node.member, node.score))
    }
}
