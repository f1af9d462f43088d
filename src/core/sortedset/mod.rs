//! The sorted set data structure: a dual index of member→score plus a
//! score-then-member ordered tree, giving O(log n) range queries by rank,
//! score, or lexicographic order.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{btree_set, BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Bound;

/// A single (score, member) pair. Order is by score, then lexicographically
/// by member, which is what lets a `BTreeSet<ZSetEntry>` double as the
/// score-ordered index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZSetEntry {
    pub score: f64,
    pub member: Bytes,
}

impl Ord for ZSetEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.member.cmp(&other.member))
    }
}

impl PartialOrd for ZSetEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ZSetEntry {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.member == other.member
    }
}

impl Eq for ZSetEntry {}

impl Hash for ZSetEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.member.hash(state);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScoreBoundary {
    Inclusive(f64),
    Exclusive(f64),
    NegInfinity,
    PosInfinity,
}

impl fmt::Display for ScoreBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreBoundary::Inclusive(score) => write!(f, "{score}"),
            ScoreBoundary::Exclusive(score) => write!(f, "({score}"),
            ScoreBoundary::NegInfinity => write!(f, "-inf"),
            ScoreBoundary::PosInfinity => write!(f, "+inf"),
        }
    }
}

impl Default for ScoreBoundary {
    fn default() -> Self {
        ScoreBoundary::Inclusive(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum LexBoundary {
    Inclusive(Bytes),
    Exclusive(Bytes),
    #[default]
    Min,
    Max,
}

impl fmt::Display for LexBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexBoundary::Inclusive(b) => write!(f, "[{}", String::from_utf8_lossy(b)),
            LexBoundary::Exclusive(b) => write!(f, "({}", String::from_utf8_lossy(b)),
            LexBoundary::Min => write!(f, "-"),
            LexBoundary::Max => write!(f, "+"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SortedSet {
    members: HashMap<Bytes, f64>,
    sorted: BTreeSet<ZSetEntry>,
}

impl SortedSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, ZSetEntry> {
        self.sorted.iter()
    }

    /// Precondition for lexicographical range commands: Redis leaves the
    /// result undefined unless every member shares a score, so callers check
    /// this before trusting a lex query.
    pub fn scores_are_all_equal(&self) -> bool {
        if self.len() < 2 {
            return true;
        }
        let first_score = self.sorted.iter().next().unwrap().score;
        self.sorted
            .iter()
            .all(|e| (e.score - first_score).abs() < f64::EPSILON)
    }

    /// Returns `true` if a new member was added or an existing one's score changed.
    pub fn add(&mut self, score: f64, member: Bytes) -> bool {
        if let Some(old_score) = self.members.insert(member.clone(), score) {
            if (old_score - score).abs() < f64::EPSILON {
                return false;
            }
            self.sorted.remove(&ZSetEntry {
                score: old_score,
                member: member.clone(),
            });
        }
        self.sorted.insert(ZSetEntry { score, member });
        true
    }

    pub fn increment_score(&mut self, member: &Bytes, increment: f64) -> f64 {
        let current_score = self.members.get(member).copied().unwrap_or(0.0);
        let new_score = current_score + increment;
        self.add(new_score, member.clone());
        new_score
    }

    pub fn remove(&mut self, member: &Bytes) -> bool {
        if let Some(score) = self.members.remove(member) {
            self.sorted.remove(&ZSetEntry {
                score,
                member: member.clone(),
            });
            true
        } else {
            false
        }
    }

    pub fn get_score(&self, member: &Bytes) -> Option<f64> {
        self.members.get(member).copied()
    }

    pub fn contains_member(&self, member: &Bytes) -> bool {
        self.members.contains_key(member)
    }

    pub fn get_rank(&self, member: &Bytes) -> Option<usize> {
        self.members
            .get(member)
            .and_then(|_score| self.sorted.iter().position(|entry| entry.member == *member))
    }

    pub fn get_rev_rank(&self, member: &Bytes) -> Option<usize> {
        self.members.get(member).and_then(|_score| {
            self.sorted
                .iter()
                .rev()
                .position(|entry| entry.member == *member)
        })
    }

    pub fn pop_first(&mut self) -> Option<ZSetEntry> {
        if let Some(entry) = self.sorted.pop_first() {
            self.members.remove(&entry.member);
            Some(entry)
        } else {
            None
        }
    }

    pub fn pop_last(&mut self) -> Option<ZSetEntry> {
        if let Some(entry) = self.sorted.pop_last() {
            self.members.remove(&entry.member);
            Some(entry)
        } else {
            None
        }
    }

    pub fn get_range(&self, start: i64, stop: i64) -> Vec<ZSetEntry> {
        let len = self.len() as i64;
        if len == 0 {
            return vec![];
        }
        let start = if start < 0 { len + start } else { start }.max(0);
        let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
        if start > stop || start >= len {
            return vec![];
        }
        self.sorted
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect()
    }

    pub fn get_rev_range(&self, start: i64, stop: i64) -> Vec<ZSetEntry> {
        let len = self.len() as i64;
        if len == 0 {
            return vec![];
        }
        let start = if start < 0 { len + start } else { start }.max(0);
        let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
        if start > stop || start >= len {
            return vec![];
        }
        self.sorted
            .iter()
            .rev()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect()
    }

    pub fn get_range_by_score(&self, min: ScoreBoundary, max: ScoreBoundary) -> Vec<ZSetEntry> {
        let min_bound = match min {
            ScoreBoundary::Inclusive(score) => Bound::Included(ZSetEntry {
                score,
                member: Bytes::new(),
            }),
            ScoreBoundary::Exclusive(score) => Bound::Excluded(ZSetEntry {
                score,
                member: Bytes::from_static(&[255; 64]),
            }),
            ScoreBoundary::NegInfinity => Bound::Unbounded,
            ScoreBoundary::PosInfinity => return vec![],
        };

        let max_bound = match max {
            ScoreBoundary::Inclusive(score) => Bound::Included(ZSetEntry {
                score,
                member: Bytes::from_static(&[255; 64]),
            }),
            ScoreBoundary::Exclusive(score) => Bound::Excluded(ZSetEntry {
                score,
                member: Bytes::new(),
            }),
            ScoreBoundary::PosInfinity => Bound::Unbounded,
            ScoreBoundary::NegInfinity => return vec![],
        };

        self.sorted.range((min_bound, max_bound)).cloned().collect()
    }

    pub fn remove_range_by_score(&mut self, min: ScoreBoundary, max: ScoreBoundary) -> usize {
        let to_remove: Vec<ZSetEntry> = self.get_range_by_score(min, max);
        let count = to_remove.len();
        for entry in to_remove {
            self.remove(&entry.member);
        }
        count
    }

    pub fn get_range_by_lex(&self, min: &LexBoundary, max: &LexBoundary) -> Vec<ZSetEntry> {
        const LEX_SCORE: f64 = 0.0;

        let min_bound = match min {
            LexBoundary::Inclusive(b) => Bound::Included(ZSetEntry {
                score: LEX_SCORE,
                member: b.clone(),
            }),
            LexBoundary::Exclusive(b) => Bound::Excluded(ZSetEntry {
                score: LEX_SCORE,
                member: b.clone(),
            }),
            LexBoundary::Min => Bound::Unbounded,
            LexBoundary::Max => return vec![],
        };

        let max_bound = match max {
            LexBoundary::Inclusive(b) => Bound::Included(ZSetEntry {
                score: LEX_SCORE,
                member: b.clone(),
            }),
            LexBoundary::Exclusive(b) => Bound::Excluded(ZSetEntry {
                score: LEX_SCORE,
                member: b.clone(),
            }),
            LexBoundary::Max => Bound::Unbounded,
            LexBoundary::Min => return vec![],
        };

        self.sorted.range((min_bound, max_bound)).cloned().collect()
    }

    pub fn remove_range_by_lex(&mut self, min: &LexBoundary, max: &LexBoundary) -> usize {
        let to_remove = self.get_range_by_lex(min, max);
        let count = to_remove.len();
        for entry in to_remove {
            self.remove(&entry.member);
        }
        count
    }

    pub fn remove_range_by_rank(&mut self, start: i64, stop: i64) -> usize {
        let to_remove: Vec<ZSetEntry> = self.get_range(start, stop);
        let count = to_remove.len();
        for entry in to_remove {
            self.remove(&entry.member);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn add_updates_score_and_reorders() {
        let mut z = SortedSet::new();
        assert!(z.add(1.0, b("a")));
        assert!(z.add(2.0, b("b")));
        assert!(z.add(0.5, b("a")));
        assert_eq!(z.get_score(&b("a")), Some(0.5));
        assert_eq!(
            z.iter().map(|e| e.member.clone()).collect::<Vec<_>>(),
            vec![b("a"), b("b")]
        );
    }

    #[test]
    fn rank_and_rev_rank() {
        let mut z = SortedSet::new();
        z.add(1.0, b("a"));
        z.add(2.0, b("b"));
        z.add(3.0, b("c"));
        assert_eq!(z.get_rank(&b("a")), Some(0));
        assert_eq!(z.get_rev_rank(&b("a")), Some(2));
    }

    #[test]
    fn range_by_score_inclusive_bounds() {
        let mut z = SortedSet::new();
        z.add(1.0, b("a"));
        z.add(2.0, b("b"));
        z.add(3.0, b("c"));
        let got = z.get_range_by_score(ScoreBoundary::Inclusive(2.0), ScoreBoundary::PosInfinity);
        assert_eq!(got.len(), 2);
    }
}
