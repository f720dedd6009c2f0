//! Unified conflict predicate across byte-range locks, leases and
//! share-mode reservations (spec §4.1).

use super::types::{LeaseState, LockType, UnifiedLock};

/// Evaluates whether `a` conflicts with `b`.
///
/// Order of evaluation follows spec §4.1 exactly. The predicate is
/// required to be symmetric; see the property tests below.
pub fn conflicts_with(a: &UnifiedLock, b: &UnifiedLock) -> bool {
    // 1. Same owner never conflicts.
    if a.owner.owner_id == b.owner.owner_id {
        return false;
    }

    // 2. Share-mode reservations: any two non-None access modes conflict.
    if !a.access_mode.is_none() && !b.access_mode.is_none() {
        return true;
    }

    match (&a.lease, &b.lease) {
        // 3. Both leases.
        (Some(la), Some(lb)) => {
            if la.lease_key == lb.lease_key {
                return false;
            }
            let sa = la.effective_state();
            let sb = lb.effective_state();
            lease_states_conflict(sa, sb)
        }
        // 4. Exactly one is a lease.
        (Some(la), None) => lease_vs_byte_range_conflict(la.effective_state(), b.lock_type),
        (None, Some(lb)) => lease_vs_byte_range_conflict(lb.effective_state(), a.lock_type),
        // 5. Both byte-range.
        (None, None) => {
            if !a.range().overlaps(&b.range()) {
                return false;
            }
            matches!(a.lock_type, LockType::Exclusive) || matches!(b.lock_type, LockType::Exclusive)
        }
    }
}

/// Read-only and handle-only leases across different keys coexist;
/// a conflict exists iff the requested Write bit overlaps any existing
/// Read or Write bit, or vice versa.
fn lease_states_conflict(a: LeaseState, b: LeaseState) -> bool {
    let a_write_hits_b = a.contains(LeaseState::WRITE) && b.intersects(LeaseState::READ | LeaseState::WRITE);
    let b_write_hits_a = b.contains(LeaseState::WRITE) && a.intersects(LeaseState::READ | LeaseState::WRITE);
    a_write_hits_b || b_write_hits_a
}

/// A lease and a byte-range lock conflict iff the lease holds the
/// Write bit and the byte lock is Exclusive (spec §4.1 step 4).
fn lease_vs_byte_range_conflict(lease_state: LeaseState, lock_type: LockType) -> bool {
    lease_state.contains(LeaseState::WRITE) && matches!(lock_type, LockType::Exclusive)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::lock::types::AccessMode;
    use crate::lock::types::LockType::{Exclusive, Shared};

    #[test]
    fn same_owner_never_conflicts() {
        let a = byte_lock("o1", 0, 100, Exclusive);
        let mut b = byte_lock("o1", 0, 100, Exclusive);
        b.id.0 = 1;
        assert!(!conflicts_with(&a, &b));
        assert!(!conflicts_with(&b, &a));
    }

    #[test]
    fn same_lease_key_never_conflicts() {
        let a = lease("o1", 42, LeaseState::READ | LeaseState::WRITE);
        let b = lease("o2", 42, LeaseState::READ | LeaseState::WRITE);
        assert!(!conflicts_with(&a, &b));
        assert!(!conflicts_with(&b, &a));
    }

    #[test]
    fn overlapping_exclusive_byte_locks_conflict() {
        let a = byte_lock("o1", 0, 100, Exclusive);
        let b = byte_lock("o2", 50, 100, Shared);
        assert!(conflicts_with(&a, &b));
        assert!(conflicts_with(&b, &a));
    }

    #[test]
    fn overlapping_shared_byte_locks_do_not_conflict() {
        let a = byte_lock("o1", 0, 100, Shared);
        let b = byte_lock("o2", 50, 100, Shared);
        assert!(!conflicts_with(&a, &b));
        assert!(!conflicts_with(&b, &a));
    }

    #[test]
    fn non_overlapping_byte_locks_do_not_conflict() {
        let a = byte_lock("o1", 0, 50, Exclusive);
        let b = byte_lock("o2", 50, 50, Exclusive);
        assert!(!conflicts_with(&a, &b));
    }

    #[test]
    fn write_lease_conflicts_with_exclusive_byte_lock() {
        let a = lease("o1", 1, LeaseState::READ | LeaseState::WRITE);
        let b = byte_lock("o2", 0, 0, Exclusive);
        assert!(conflicts_with(&a, &b));
        assert!(conflicts_with(&b, &a));
    }

    #[test]
    fn read_lease_does_not_conflict_with_exclusive_byte_lock() {
        let a = lease("o1", 1, LeaseState::READ);
        let b = byte_lock("o2", 0, 0, Exclusive);
        assert!(!conflicts_with(&a, &b));
        assert!(!conflicts_with(&b, &a));
    }

    #[test]
    fn write_lease_does_not_conflict_with_shared_byte_lock() {
        let a = lease("o1", 1, LeaseState::READ | LeaseState::WRITE);
        let b = byte_lock("o2", 0, 0, Shared);
        assert!(!conflicts_with(&a, &b));
    }

    #[test]
    fn read_only_leases_across_keys_coexist() {
        let a = lease("o1", 1, LeaseState::READ);
        let b = lease("o2", 2, LeaseState::READ);
        assert!(!conflicts_with(&a, &b));
    }

    #[test]
    fn handle_only_leases_across_keys_coexist() {
        let a = lease("o1", 1, LeaseState::READ | LeaseState::HANDLE);
        let b = lease("o2", 2, LeaseState::READ | LeaseState::HANDLE);
        assert!(!conflicts_with(&a, &b));
    }

    #[test]
    fn two_write_leases_across_keys_conflict() {
        let a = lease("o1", 1, LeaseState::READ | LeaseState::WRITE);
        let b = lease("o2", 2, LeaseState::READ | LeaseState::WRITE);
        assert!(conflicts_with(&a, &b));
        assert!(conflicts_with(&b, &a));
    }

    #[test]
    fn access_modes_conflict_independent_of_range() {
        let mut a = byte_lock("o1", 0, 0, Shared);
        a.access_mode = AccessMode::DenyWrite;
        let mut b = byte_lock("o2", 1000, 1, Shared);
        b.access_mode = AccessMode::DenyRead;
        assert!(conflicts_with(&a, &b));
    }

    /// Property test: symmetry holds across a grid of representative pairs.
    #[test]
    fn conflict_symmetry_property() {
        let locks = vec![
            byte_lock("a", 0, 100, Exclusive),
            byte_lock("b", 50, 100, Shared),
            byte_lock("c", 200, 0, Exclusive),
            lease("d", 1, LeaseState::READ),
            lease("e", 1, LeaseState::READ | LeaseState::WRITE),
            lease("f", 2, LeaseState::READ | LeaseState::WRITE),
            lease("g", 3, LeaseState::READ | LeaseState::HANDLE),
        ];
        for x in &locks {
            for y in &locks {
                assert_eq!(conflicts_with(x, y), conflicts_with(y, x), "asymmetric for {x:?} / {y:?}");
            }
        }
    }
}
