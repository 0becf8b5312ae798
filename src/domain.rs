use crate::layout::FieldSpaceId;

use serde::{Deserialize, Serialize};

/// Names one logical point of a collective instance (or one element of a domain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainPoint(pub i64);

impl From<i64> for DomainPoint {
    fn from(p: i64) -> Self {
        DomainPoint(p)
    }
}

/// A one dimensional half open rectangle `[lo, hi)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Domain {
    lo: i64,
    hi: i64,
}

impl Domain {
    pub fn new(lo: i64, hi: i64) -> Domain {
        Domain { lo, hi: hi.max(lo) }
    }

    pub fn empty() -> Domain {
        Domain { lo: 0, hi: 0 }
    }

    pub fn lo(&self) -> i64 {
        self.lo
    }

    pub fn hi(&self) -> i64 {
        self.hi
    }

    pub fn dim(&self) -> u32 {
        1
    }

    pub fn volume(&self) -> usize {
        (self.hi - self.lo) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.hi <= self.lo
    }

    pub fn contains(&self, point: DomainPoint) -> bool {
        point.0 >= self.lo && point.0 < self.hi
    }

    pub fn contains_domain(&self, other: &Domain) -> bool {
        other.is_empty() || (other.lo >= self.lo && other.hi <= self.hi)
    }

    pub fn intersection(&self, other: &Domain) -> Domain {
        let lo = self.lo.max(other.lo);
        let hi = self.hi.min(other.hi);
        if hi <= lo {
            Domain::empty()
        } else {
            Domain { lo, hi }
        }
    }

    pub fn intersects(&self, other: &Domain) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Smallest domain covering both
    pub fn hull(&self, other: &Domain) -> Domain {
        if self.is_empty() {
            *other
        } else if other.is_empty() {
            *self
        } else {
            Domain {
                lo: self.lo.min(other.lo),
                hi: self.hi.max(other.hi),
            }
        }
    }

    /// Linearized position of `point` inside this domain
    pub fn offset_of(&self, point: DomainPoint) -> Option<usize> {
        if self.contains(point) {
            Some((point.0 - self.lo) as usize)
        } else {
            None
        }
    }

    pub fn points(&self) -> impl Iterator<Item = DomainPoint> {
        (self.lo..self.hi).map(DomainPoint)
    }
}

/// A logical region names a domain of elements and the field space describing each element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalRegion {
    pub tree_id: u32,
    pub field_space: FieldSpaceId,
    pub domain: Domain,
}

impl LogicalRegion {
    pub fn new(tree_id: u32, field_space: FieldSpaceId, domain: Domain) -> LogicalRegion {
        LogicalRegion {
            tree_id,
            field_space,
            domain,
        }
    }
}
