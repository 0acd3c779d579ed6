//! Logical clocks
//!
//! Scalar (Lamport) and vector clocks. Both advance on local events and
//! merge on receive; neither ever moves backwards for its owner. The
//! encoding is a plain sequence of counters.

use core::fmt;
use serde::{Deserialize, Serialize};

/// A Lamport clock: one monotonically non-decreasing counter
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ScalarTime(u64);

impl ScalarTime {
    pub const fn new(t: u64) -> Self {
        ScalarTime(t)
    }

    /// Record a local event
    #[inline]
    pub fn advance(&mut self) {
        self.0 += 1;
    }

    /// Fold in a remote observation
    #[inline]
    pub fn merge(&mut self, other: ScalarTime) {
        self.0 = self.0.max(other.0);
    }

    #[inline]
    pub fn time(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScalarTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A vector clock: one counter per participant, owned entry `idx`
///
/// Comparison is the component-wise partial order; incomparable clocks
/// mean causally concurrent events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorTime {
    entries: Vec<u64>,
    idx: usize,
}

impl VectorTime {
    /// Clock for participant `idx` out of `count`
    pub fn new(idx: usize, count: usize) -> Self {
        debug_assert!(idx < count);
        VectorTime {
            entries: vec![0; count],
            idx,
        }
    }

    /// Record a local event: bump the owned entry
    pub fn advance(&mut self) {
        self.entries[self.idx] += 1;
    }

    /// Element-wise max with a remote observation
    pub fn merge(&mut self, other: &VectorTime) {
        debug_assert_eq!(self.entries.len(), other.entries.len());
        for (mine, theirs) in self.entries.iter_mut().zip(&other.entries) {
            *mine = (*mine).max(*theirs);
        }
    }

    pub fn entries(&self) -> &[u64] {
        &self.entries
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    /// `self <= other` in the component-wise partial order
    pub fn le(&self, other: &VectorTime) -> bool {
        self.entries
            .iter()
            .zip(&other.entries)
            .all(|(a, b)| a <= b)
    }

    /// Strictly-before: `<=` with at least one strict component
    pub fn lt(&self, other: &VectorTime) -> bool {
        self.le(other) && self.entries != other.entries
    }

    /// Neither before nor after: causally concurrent
    pub fn concurrent(&self, other: &VectorTime) -> bool {
        !self.le(other) && !other.le(self)
    }
}

impl PartialOrd for VectorTime {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        use core::cmp::Ordering;
        if self.entries == other.entries {
            Some(Ordering::Equal)
        } else if self.le(other) {
            Some(Ordering::Less)
        } else if other.le(self) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl fmt::Display for VectorTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", entry)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_advance_merge() {
        let mut a = ScalarTime::default();
        a.advance();
        a.advance();
        assert_eq!(a.time(), 2);

        let mut b = ScalarTime::new(5);
        b.merge(a);
        assert_eq!(b.time(), 5);
        a.merge(b);
        assert_eq!(a.time(), 5);
    }

    #[test]
    fn test_scalar_never_backwards() {
        let mut t = ScalarTime::new(9);
        t.merge(ScalarTime::new(3));
        assert_eq!(t.time(), 9);
    }

    #[test]
    fn test_scalar_serde_round_trip() {
        let t = ScalarTime::new(123_456_789);
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "123456789");
        let back: ScalarTime = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn test_vector_advance_own_entry() {
        let mut v = VectorTime::new(1, 3);
        v.advance();
        v.advance();
        assert_eq!(v.entries(), &[0, 2, 0]);
    }

    #[test]
    fn test_vector_merge_elementwise() {
        let mut a = VectorTime::new(0, 3);
        let mut b = VectorTime::new(2, 3);
        a.advance();
        b.advance();
        b.advance();
        a.merge(&b);
        assert_eq!(a.entries(), &[1, 0, 2]);
    }

    #[test]
    fn test_vector_partial_order() {
        let mut a = VectorTime::new(0, 2);
        let mut b = VectorTime::new(1, 2);
        // a = [1,0], b = [0,1]: concurrent
        a.advance();
        b.advance();
        assert!(a.concurrent(&b));
        assert_eq!(a.partial_cmp(&b), None);

        // after merge+advance, b dominates a
        b.merge(&a);
        b.advance();
        assert!(a.lt(&b));
        assert!(a.le(&b));
        assert!(!b.le(&a));
    }

    #[test]
    fn test_vector_serde_round_trip() {
        let mut v = VectorTime::new(1, 4);
        v.advance();
        let json = serde_json::to_string(&v).unwrap();
        let back: VectorTime = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
