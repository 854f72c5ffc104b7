//! Persistent set of snapshot ids.
//!
//! Snapshot ids are allocated in increasing order and the ids a snapshot
//! needs to ask about are almost always close to the newest ones. The set
//! therefore keeps a 128 id window as two words anchored at `lower_bound`
//! and stores everything older in a sorted array that is shared between the
//! sets derived from it.
//!
//! Every operation returns a new set; the receiver is never modified.
use std::fmt;
use std::sync::Arc;

pub type SnapshotId = u64;

const WORD_BITS: SnapshotId = u64::BITS as SnapshotId;
const WINDOW_BITS: SnapshotId = WORD_BITS * 2;

#[derive(Clone)]
pub struct SnapshotIdSet {
    /// Bits for ids `lower_bound + 64 .. lower_bound + 128`.
    upper: u64,
    /// Bits for ids `lower_bound .. lower_bound + 64`.
    lower: u64,
    lower_bound: SnapshotId,
    /// Sorted ids below `lower_bound`. `None` when there are none.
    below_bound: Option<Arc<[SnapshotId]>>,
}

impl SnapshotIdSet {
    pub const EMPTY: SnapshotIdSet = SnapshotIdSet {
        upper: 0,
        lower: 0,
        lower_bound: 0,
        below_bound: None,
    };

    pub const fn new() -> Self {
        Self::EMPTY
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.upper == 0 && self.lower == 0 && self.below_bound.is_none()
    }

    /// Returns true if `id` is a member of the set.
    #[inline]
    pub fn contains(&self, id: SnapshotId) -> bool {
        if id >= self.lower_bound {
            let offset = id - self.lower_bound;
            if offset < WORD_BITS {
                self.lower & (1u64 << offset) != 0
            } else if offset < WINDOW_BITS {
                self.upper & (1u64 << (offset - WORD_BITS)) != 0
            } else {
                false
            }
        } else {
            self.below_bound
                .as_deref()
                .is_some_and(|below| below.binary_search(&id).is_ok())
        }
    }

    /// Returns a set that also contains `id`.
    ///
    /// When `id` is already a member the result shares everything with
    /// `self` (see [`SnapshotIdSet::is_identical`]).
    pub fn with(&self, id: SnapshotId) -> Self {
        if id < self.lower_bound {
            return self.with_below(id);
        }
        let offset = id - self.lower_bound;
        if offset < WORD_BITS {
            let mask = 1u64 << offset;
            if self.lower & mask == 0 {
                return Self {
                    lower: self.lower | mask,
                    ..self.clone()
                };
            }
        } else if offset < WINDOW_BITS {
            let mask = 1u64 << (offset - WORD_BITS);
            if self.upper & mask == 0 {
                return Self {
                    upper: self.upper | mask,
                    ..self.clone()
                };
            }
        } else {
            return self.reanchored(id).with(id);
        }
        self.clone()
    }

    fn with_below(&self, id: SnapshotId) -> Self {
        let Some(below) = self.below_bound.as_deref() else {
            return Self {
                below_bound: Some(vec![id].into()),
                ..self.clone()
            };
        };
        match below.binary_search(&id) {
            Ok(_) => self.clone(),
            Err(position) => {
                let mut ids = Vec::with_capacity(below.len() + 1);
                ids.extend_from_slice(&below[..position]);
                ids.push(id);
                ids.extend_from_slice(&below[position..]);
                Self {
                    below_bound: Some(ids.into()),
                    ..self.clone()
                }
            }
        }
    }

    /// Moves the window up in word-sized steps until `id` lands in the upper
    /// word. Bits leaving the window are appended to the below-bound array.
    fn reanchored(&self, id: SnapshotId) -> Self {
        let target = (id / WORD_BITS - 1) * WORD_BITS;
        debug_assert!(
            target > self.lower_bound,
            "re-anchoring must move the window up (id={id}, lower_bound={})",
            self.lower_bound
        );

        let mut upper = self.upper;
        let mut lower = self.lower;
        let mut lower_bound = self.lower_bound;
        let mut evicted: Option<Vec<SnapshotId>> = None;

        while lower_bound < target {
            if lower != 0 {
                let below = evicted.get_or_insert_with(|| {
                    self.below_bound
                        .as_deref()
                        .map(<[SnapshotId]>::to_vec)
                        .unwrap_or_default()
                });
                push_bits(below, lower, lower_bound);
            }
            if upper == 0 {
                lower_bound = target;
                lower = 0;
                break;
            }
            lower = upper;
            upper = 0;
            lower_bound += WORD_BITS;
        }

        if let Some(below) = evicted.as_deref() {
            debug_assert!(
                below.windows(2).all(|pair| pair[0] < pair[1]),
                "below-bound ids must stay sorted after re-anchoring"
            );
        }
        debug_assert_eq!(lower_bound % WORD_BITS, 0);

        Self {
            upper,
            lower,
            lower_bound,
            below_bound: evicted
                .map(Into::into)
                .or_else(|| self.below_bound.clone()),
        }
    }

    /// Returns a set without `id`. Removing a non-member returns a set
    /// identical to `self`.
    pub fn without(&self, id: SnapshotId) -> Self {
        if id >= self.lower_bound {
            let offset = id - self.lower_bound;
            if offset < WORD_BITS {
                let mask = 1u64 << offset;
                if self.lower & mask != 0 {
                    return Self {
                        lower: self.lower & !mask,
                        ..self.clone()
                    };
                }
            } else if offset < WINDOW_BITS {
                let mask = 1u64 << (offset - WORD_BITS);
                if self.upper & mask != 0 {
                    return Self {
                        upper: self.upper & !mask,
                        ..self.clone()
                    };
                }
            }
            return self.clone();
        }

        let Some(below) = self.below_bound.as_deref() else {
            return self.clone();
        };
        match below.binary_search(&id) {
            Ok(position) => {
                let below_bound = if below.len() == 1 {
                    None
                } else {
                    let mut ids = Vec::with_capacity(below.len() - 1);
                    ids.extend_from_slice(&below[..position]);
                    ids.extend_from_slice(&below[position + 1..]);
                    Some(ids.into())
                };
                Self {
                    below_bound,
                    ..self.clone()
                }
            }
            Err(_) => self.clone(),
        }
    }

    /// Members of either set.
    pub fn union(&self, other: &SnapshotIdSet) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        if self.same_layout(other) {
            return Self {
                upper: self.upper | other.upper,
                lower: self.lower | other.lower,
                lower_bound: self.lower_bound,
                below_bound: self.below_bound.clone(),
            };
        }
        if self.below_bound.is_none() {
            // Likely the smaller of the two.
            self.iter().fold(other.clone(), |acc, id| acc.with(id))
        } else {
            other.iter().fold(self.clone(), |acc, id| acc.with(id))
        }
    }

    /// Members of both sets.
    pub fn intersect(&self, other: &SnapshotIdSet) -> Self {
        if self.is_empty() || other.is_empty() {
            return Self::EMPTY;
        }
        if self.same_layout(other) {
            let upper = self.upper & other.upper;
            let lower = self.lower & other.lower;
            if upper == 0 && lower == 0 && self.below_bound.is_none() {
                return Self::EMPTY;
            }
            return Self {
                upper,
                lower,
                lower_bound: self.lower_bound,
                below_bound: self.below_bound.clone(),
            };
        }
        if self.below_bound.is_none() {
            self.iter().filter(|&id| other.contains(id)).collect()
        } else {
            other.iter().filter(|&id| self.contains(id)).collect()
        }
    }

    /// Members of `self` that are not in `other`.
    pub fn subtract(&self, other: &SnapshotIdSet) -> Self {
        if self.is_empty() || other.is_empty() {
            return self.clone();
        }
        if self.same_layout(other) {
            // A shared below-bound array is removed as a whole.
            return Self {
                upper: self.upper & !other.upper,
                lower: self.lower & !other.lower,
                lower_bound: self.lower_bound,
                below_bound: None,
            };
        }
        other.iter().fold(self.clone(), |acc, id| acc.without(id))
    }

    /// Returns a set that also contains every id in `from..until`.
    pub fn add_range(&self, from: SnapshotId, until: SnapshotId) -> Self {
        (from..until).fold(self.clone(), |acc, id| acc.with(id))
    }

    /// The smallest member, if any.
    pub fn lowest_member(&self) -> Option<SnapshotId> {
        if let Some(first) = self.below_bound.as_deref().and_then(<[_]>::first) {
            return Some(*first);
        }
        if self.lower != 0 {
            return Some(self.lower_bound + SnapshotId::from(self.lower.trailing_zeros()));
        }
        if self.upper != 0 {
            return Some(
                self.lower_bound + WORD_BITS + SnapshotId::from(self.upper.trailing_zeros()),
            );
        }
        None
    }

    /// The smallest member, or `default` for an empty set.
    #[inline]
    pub fn lowest(&self, default: SnapshotId) -> SnapshotId {
        self.lowest_member().unwrap_or(default)
    }

    /// Members in ascending order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            below: self.below_bound.as_deref().unwrap_or(&[]).iter(),
            lower: self.lower,
            upper: self.upper,
            lower_bound: self.lower_bound,
        }
    }

    /// True when both sets share the same storage: equal window words and
    /// anchor, and the same below-bound allocation. Two sets with the same
    /// members built along different paths are generally not identical.
    pub fn is_identical(&self, other: &SnapshotIdSet) -> bool {
        self.upper == other.upper
            && self.lower == other.lower
            && self.lower_bound == other.lower_bound
            && self.same_below(other)
    }

    #[inline]
    fn same_layout(&self, other: &SnapshotIdSet) -> bool {
        self.lower_bound == other.lower_bound && self.same_below(other)
    }

    #[inline]
    fn same_below(&self, other: &SnapshotIdSet) -> bool {
        match (&self.below_bound, &other.below_bound) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn push_bits(out: &mut Vec<SnapshotId>, mut word: u64, base: SnapshotId) {
    while word != 0 {
        out.push(base + SnapshotId::from(word.trailing_zeros()));
        word &= word - 1;
    }
}

impl Default for SnapshotIdSet {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for SnapshotIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl FromIterator<SnapshotId> for SnapshotIdSet {
    fn from_iter<I: IntoIterator<Item = SnapshotId>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SnapshotIdSet::EMPTY, |acc, id| acc.with(id))
    }
}

impl<'a> IntoIterator for &'a SnapshotIdSet {
    type Item = SnapshotId;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Ascending iterator over a [`SnapshotIdSet`].
pub struct Iter<'a> {
    below: std::slice::Iter<'a, SnapshotId>,
    lower: u64,
    upper: u64,
    lower_bound: SnapshotId,
}

impl Iterator for Iter<'_> {
    type Item = SnapshotId;

    fn next(&mut self) -> Option<SnapshotId> {
        if let Some(&id) = self.below.next() {
            return Some(id);
        }
        if self.lower != 0 {
            let bit = SnapshotId::from(self.lower.trailing_zeros());
            self.lower &= self.lower - 1;
            return Some(self.lower_bound + bit);
        }
        if self.upper != 0 {
            let bit = SnapshotId::from(self.upper.trailing_zeros());
            self.upper &= self.upper - 1;
            return Some(self.lower_bound + WORD_BITS + bit);
        }
        None
    }
}
