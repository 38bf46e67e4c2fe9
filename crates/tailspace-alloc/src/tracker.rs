//! Per-member end-of-allocation bookkeeping.

use tailspace_error::{Result, TailspaceError};
use tailspace_types::MemberId;

/// Result of a [`AllocationTracker::free`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// The range was the trailing block; EOA dropped to its offset.
    Reclaimed { new_eoa: u64 },
    /// The range sits below other allocations; EOA is unchanged and the
    /// hole is left to free-space management.
    Retained,
}

/// Tracks the logical high-water mark (EOA) of one member file.
///
/// Allocation always happens at the current EOA. Only freeing the trailing
/// block lowers it. The tracker is mode-agnostic: whether a lowered EOA is
/// reflected in the physical file is decided at close.
///
/// Space below the floor belongs to the container itself and can never be
/// freed, so EOA never drops below it.
#[derive(Debug, Clone)]
pub struct AllocationTracker {
    member: MemberId,
    eoa: u64,
    floor: u64,
    limit: u64,
    dirty: bool,
}

impl AllocationTracker {
    /// Create a tracker seeded at `eoa`. Allocations may never push EOA
    /// past `limit`.
    #[must_use]
    pub const fn new(member: MemberId, eoa: u64, limit: u64) -> Self {
        Self {
            member,
            eoa,
            floor: 0,
            limit,
            dirty: false,
        }
    }

    /// Reserve `[0, floor)` permanently.
    #[must_use]
    pub const fn with_floor(mut self, floor: u64) -> Self {
        self.floor = floor;
        self
    }

    #[must_use]
    pub const fn member(&self) -> MemberId {
        self.member
    }

    #[must_use]
    pub const fn eoa(&self) -> u64 {
        self.eoa
    }

    /// Whether any allocate or free succeeded since the tracker was seeded.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Reserve `size` bytes at the current EOA and return their offset.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        let offset = self.eoa;
        let new_eoa = offset
            .checked_add(size)
            .filter(|&end| end <= self.limit)
            .ok_or(TailspaceError::AllocationOverflow {
                member: self.member.get(),
                eoa: offset,
                size,
            })?;
        self.dirty = true;
        self.eoa = new_eoa;
        Ok(offset)
    }

    /// Release `[offset, offset + size)`. The range must lie between the
    /// floor and EOA.
    pub fn free(&mut self, offset: u64, size: u64) -> Result<FreeOutcome> {
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= self.eoa && offset >= self.floor)
            .ok_or(TailspaceError::InvalidRange {
                member: self.member.get(),
                offset,
                size,
                eoa: self.eoa,
            })?;
        self.dirty = true;
        if end == self.eoa && size > 0 {
            self.eoa = offset;
            Ok(FreeOutcome::Reclaimed { new_eoa: offset })
        } else {
            Ok(FreeOutcome::Retained)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tracker(eoa: u64) -> AllocationTracker {
        AllocationTracker::new(MemberId::SUPER, eoa, u64::MAX)
    }

    #[test]
    fn allocate_advances_eoa() {
        let mut t = tracker(100);
        assert!(!t.is_dirty());
        assert_eq!(t.allocate(28).unwrap(), 100);
        assert_eq!(t.allocate(8).unwrap(), 128);
        assert_eq!(t.eoa(), 136);
        assert!(t.is_dirty());
    }

    #[test]
    fn trailing_free_reclaims() {
        let mut t = tracker(0);
        let a = t.allocate(10).unwrap();
        let b = t.allocate(20).unwrap();
        assert_eq!(t.free(b, 20).unwrap(), FreeOutcome::Reclaimed { new_eoa: 10 });
        assert_eq!(t.free(a, 10).unwrap(), FreeOutcome::Reclaimed { new_eoa: 0 });
        assert_eq!(t.eoa(), 0);
    }

    #[test]
    fn interior_free_is_retained() {
        let mut t = tracker(0);
        let a = t.allocate(10).unwrap();
        t.allocate(20).unwrap();
        assert_eq!(t.free(a, 10).unwrap(), FreeOutcome::Retained);
        assert_eq!(t.eoa(), 30);
    }

    #[test]
    fn overflow_is_reported() {
        let mut t = tracker(u64::MAX - 4);
        let err = t.allocate(5).unwrap_err();
        assert!(matches!(err, TailspaceError::AllocationOverflow { size: 5, .. }));
        assert_eq!(t.eoa(), u64::MAX - 4);

        let mut limited = AllocationTracker::new(MemberId::SUPER, 0, 64);
        assert_eq!(limited.allocate(64).unwrap(), 0);
        assert!(limited.allocate(1).is_err());
    }

    #[test]
    fn free_beyond_eoa_is_rejected() {
        let mut t = tracker(0);
        t.allocate(16).unwrap();
        assert!(matches!(
            t.free(8, 16),
            Err(TailspaceError::InvalidRange { eoa: 16, .. })
        ));
        assert!(t.free(u64::MAX, 2).is_err());
    }

    #[test]
    fn free_below_floor_is_rejected() {
        let mut t = AllocationTracker::new(MemberId::SUPER, 0, u64::MAX).with_floor(2304);
        assert_eq!(t.allocate(2304).unwrap(), 0);
        let data = t.allocate(100).unwrap();
        assert!(t.is_dirty());

        let mut clean = t.clone();
        clean.dirty = false;
        assert!(matches!(
            clean.free(0, 2304),
            Err(TailspaceError::InvalidRange { offset: 0, eoa: 2404, .. })
        ));
        assert!(clean.free(2300, 104).is_err());
        assert!(!clean.is_dirty());
        assert_eq!(clean.eoa(), 2404);

        assert_eq!(t.free(data, 100).unwrap(), FreeOutcome::Reclaimed { new_eoa: 2304 });
        assert!(t.free(0, 2304).is_err());
        assert_eq!(t.eoa(), 2304);
    }

    #[test]
    fn zero_size_operations_do_not_move_eoa() {
        let mut t = tracker(32);
        assert_eq!(t.allocate(0).unwrap(), 32);
        assert_eq!(t.free(32, 0).unwrap(), FreeOutcome::Retained);
        assert_eq!(t.eoa(), 32);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn eoa_never_exceeds_total_allocated(sizes in prop::collection::vec(0u64..4096, 1..32),
                                             frees in prop::collection::vec(any::<bool>(), 32)) {
            let mut t = tracker(0);
            let mut live: Vec<(u64, u64)> = Vec::new();
            let mut total = 0u64;
            for (i, size) in sizes.iter().enumerate() {
                let off = t.allocate(*size).unwrap();
                total += size;
                live.push((off, *size));
                if frees[i % frees.len()] {
                    if let Some((off, size)) = live.pop() {
                        t.free(off, size).unwrap();
                    }
                }
                prop_assert!(t.eoa() <= total);
                let high = live.iter().map(|(o, s)| o + s).max().unwrap_or(0);
                prop_assert_eq!(t.eoa(), high);
            }
        }
    }
}
