//! Register-backed group membership manager.
//!
//! Each bound (group, member) pair owns one register index; the cell at that
//! index is the member's activation bit. Four structures track the binding:
//!
//! - member -> index
//! - index -> member
//! - group -> set of owned indices (ascending)
//! - a free-index allocator over the register array
//!
//! # Locking
//!
//! The maps sit behind one mutex, separate from the register array's lock.
//! Mutating operations update the maps, release the mutex, and only then
//! take the register lock to write the activation bit. Selection takes the
//! mutex first and the register lock second and holds both for the scan.
//! No path takes the register lock before the mutex, so the two never
//! deadlock.
//!
//! A member being added concurrently with a selection on the same group
//! takes part in that selection only if its activation bit was written
//! before the selection acquired the register lock.
//!
//! The manager's change notifier is removed from the register when the
//! manager is dropped.

use super::handles::HandleMgr;
use super::{GroupMembership, GroupSelection, GrpHdl, Index, MbrHdl, MembershipError};
use crate::device::{NotifierId, RegisterArray};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A bound (group, member) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Member {
    /// Group handle.
    pub grp: GrpHdl,
    /// Member handle.
    pub mbr: MbrHdl,
}

impl Member {
    /// Pair a group and member handle.
    pub fn new(grp: GrpHdl, mbr: MbrHdl) -> Self {
        Self { grp, mbr }
    }
}

struct MembershipMaps {
    mbr_to_index: HashMap<Member, Index>,
    index_to_mbr: HashMap<Index, Member>,
    group_indexes: HashMap<GrpHdl, BTreeSet<Index>>,
    index_mgr: HandleMgr,
}

impl MembershipMaps {
    fn index_of(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<Index, MembershipError> {
        self.mbr_to_index
            .get(&Member::new(grp, mbr))
            .copied()
            .ok_or(MembershipError::UnknownMember { grp, mbr })
    }
}

/// Maps group members to activation bits in a register array.
pub struct GroupMembershipMgr {
    register: Arc<RegisterArray>,
    maps: Mutex<MembershipMaps>,
    notifier: NotifierId,
}

impl GroupMembershipMgr {
    /// Create a manager over `register`; one index per cell.
    pub fn new(register: Arc<RegisterArray>) -> Self {
        let capacity = u32::try_from(register.size()).unwrap_or(u32::MAX);
        let name = register.name().to_string();
        let notifier = register.register_notifier(move |index| register_notify(&name, index));

        Self {
            register,
            notifier,
            maps: Mutex::new(MembershipMaps {
                mbr_to_index: HashMap::new(),
                index_to_mbr: HashMap::new(),
                group_indexes: HashMap::new(),
                index_mgr: HandleMgr::new(capacity),
            }),
        }
    }

    /// Name of the backing register array.
    pub fn register_name(&self) -> &str {
        self.register.name()
    }

    /// Indices currently owned by `grp`, ascending. Empty for an unknown
    /// group.
    pub fn group_indexes(&self, grp: GrpHdl) -> Vec<Index> {
        self.maps
            .lock()
            .group_indexes
            .get(&grp)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the member's activation bit is set.
    pub fn is_active(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<bool, MembershipError> {
        let index = self.maps.lock().index_of(grp, mbr)?;
        Ok(self.register.lock().at(index as usize) != 0)
    }

    /// Number of bound members across all groups.
    pub fn member_count(&self) -> usize {
        self.maps.lock().mbr_to_index.len()
    }

    fn write_bit(&self, index: Index, value: u64) {
        let mut cells = self.register.lock();
        cells.set(index as usize, value);
    }
}

impl Drop for GroupMembershipMgr {
    fn drop(&mut self) {
        self.register.unregister_notifier(self.notifier);
    }
}

/// Change hook for the backing register.
///
/// Selection rescans the group's indices on every call, so nothing is cached
/// and there is nothing to invalidate here. Runs with the register lock held.
fn register_notify(register: &str, index: usize) {
    log::trace!("{}[{}] written", register, index);
}

impl GroupMembership for GroupMembershipMgr {
    fn get_assigned_index(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<Index, MembershipError> {
        self.maps.lock().index_of(grp, mbr)
    }

    fn activate_member(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<(), MembershipError> {
        let index = self.maps.lock().index_of(grp, mbr)?;
        self.write_bit(index, 1);
        log::debug!("activated member {} of group {} (index {})", mbr, grp, index);
        Ok(())
    }

    fn deactivate_member(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<(), MembershipError> {
        let index = self.maps.lock().index_of(grp, mbr)?;
        self.write_bit(index, 0);
        log::debug!("deactivated member {} of group {} (index {})", mbr, grp, index);
        Ok(())
    }
}

impl GroupSelection for GroupMembershipMgr {
    fn add_member_to_group(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<(), MembershipError> {
        let member = Member::new(grp, mbr);
        let index = {
            let mut maps = self.maps.lock();
            if maps.mbr_to_index.contains_key(&member) {
                return Err(MembershipError::MemberExists { grp, mbr });
            }
            let capacity = maps.index_mgr.capacity();
            let index = maps
                .index_mgr
                .acquire()
                .ok_or(MembershipError::IndicesExhausted { capacity })?;
            maps.group_indexes.entry(grp).or_default().insert(index);
            maps.mbr_to_index.insert(member, index);
            maps.index_to_mbr.insert(index, member);
            index
        };

        self.write_bit(index, 1);
        log::debug!("added member {} to group {} at index {}", mbr, grp, index);
        Ok(())
    }

    fn remove_member_from_group(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<(), MembershipError> {
        let index = {
            let mut maps = self.maps.lock();
            let member = Member::new(grp, mbr);
            let index = maps.index_of(grp, mbr)?;
            let consistent = maps.index_to_mbr.get(&index) == Some(&member)
                && maps.group_indexes.get(&grp).is_some_and(|set| set.contains(&index))
                && maps.index_mgr.is_allocated(index);
            if !consistent {
                return Err(MembershipError::Inconsistent(index));
            }
            if let Some(set) = maps.group_indexes.get_mut(&grp) {
                set.remove(&index);
            }
            maps.index_mgr.release(index);
            maps.mbr_to_index.remove(&member);
            maps.index_to_mbr.remove(&index);
            index
        };

        self.write_bit(index, 0);
        log::debug!("removed member {} from group {} (index {})", mbr, grp, index);
        Ok(())
    }

    fn get_from_hash(&self, grp: GrpHdl, hash: u64) -> Result<MbrHdl, MembershipError> {
        let maps = self.maps.lock();
        let cells = self.register.lock();
        let indexes = maps
            .group_indexes
            .get(&grp)
            .ok_or(MembershipError::UnknownGroup(grp))?;

        let is_active = |index: &&Index| cells.at(**index as usize) != 0;
        let active_count = indexes.iter().filter(is_active).count();
        if active_count == 0 {
            return Err(MembershipError::NoActiveMembers(grp));
        }

        let rank = (hash % active_count as u64) as usize;
        let index = indexes
            .iter()
            .filter(is_active)
            .nth(rank)
            .copied()
            .ok_or(MembershipError::NoActiveMembers(grp))?;
        match maps.index_to_mbr.get(&index) {
            Some(member) if member.grp == grp => Ok(member.mbr),
            _ => Err(MembershipError::Inconsistent(index)),
        }
    }

    fn reset(&self) {
        let mut maps = self.maps.lock();
        maps.mbr_to_index.clear();
        maps.index_to_mbr.clear();
        maps.group_indexes.clear();
        maps.index_mgr.clear();
        log::debug!("membership on {} reset", self.register.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn mgr(size: usize) -> (Arc<RegisterArray>, GroupMembershipMgr) {
        let reg = Arc::new(RegisterArray::new("sel", size, 1));
        let mgr = GroupMembershipMgr::new(reg.clone());
        (reg, mgr)
    }

    #[test]
    fn test_add_assigns_fresh_active_index() {
        let (reg, mgr) = mgr(8);
        mgr.add_member_to_group(1, 10).unwrap();
        mgr.add_member_to_group(1, 11).unwrap();
        mgr.add_member_to_group(2, 10).unwrap();

        assert_eq!(mgr.get_assigned_index(1, 10).unwrap(), 0);
        assert_eq!(mgr.get_assigned_index(1, 11).unwrap(), 1);
        assert_eq!(mgr.get_assigned_index(2, 10).unwrap(), 2);
        assert_eq!(mgr.group_indexes(1), vec![0, 1]);
        assert_eq!(mgr.group_indexes(2), vec![2]);
        assert_eq!(reg.snapshot(), vec![1, 1, 1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_add_remove_sequence_tracks_index_set() {
        let (reg, mgr) = mgr(8);
        for m in 0..5 {
            mgr.add_member_to_group(7, m).unwrap();
        }
        mgr.remove_member_from_group(7, 1).unwrap();
        mgr.remove_member_from_group(7, 3).unwrap();
        assert_eq!(mgr.group_indexes(7), vec![0, 2, 4]);
        assert_eq!(reg.snapshot()[..5], [1, 0, 1, 0, 1]);

        // Lowest released index is reused
        mgr.add_member_to_group(7, 9).unwrap();
        assert_eq!(mgr.get_assigned_index(7, 9).unwrap(), 1);
        assert_eq!(mgr.group_indexes(7), vec![0, 1, 2, 4]);
        assert_eq!(mgr.member_count(), 4);

        for (mbr, index) in [(0, 0), (9, 1), (2, 2), (4, 4)] {
            assert_eq!(mgr.get_assigned_index(7, mbr).unwrap(), index);
            assert!(mgr.is_active(7, mbr).unwrap());
        }
    }

    #[test]
    fn test_unknown_member_errors() {
        let (_reg, mgr) = mgr(4);
        assert_eq!(
            mgr.get_assigned_index(0, 0),
            Err(MembershipError::UnknownMember { grp: 0, mbr: 0 })
        );
        assert!(mgr.activate_member(0, 0).is_err());
        assert!(mgr.deactivate_member(0, 0).is_err());
        assert!(mgr.remove_member_from_group(0, 0).is_err());
    }

    #[test]
    fn test_duplicate_and_exhaustion() {
        let (_reg, mgr) = mgr(2);
        mgr.add_member_to_group(0, 1).unwrap();
        assert_eq!(
            mgr.add_member_to_group(0, 1),
            Err(MembershipError::MemberExists { grp: 0, mbr: 1 })
        );
        mgr.add_member_to_group(0, 2).unwrap();
        assert_eq!(
            mgr.add_member_to_group(0, 3),
            Err(MembershipError::IndicesExhausted { capacity: 2 })
        );
    }

    #[test]
    fn test_activate_deactivate_does_not_touch_allocation() {
        let (reg, mgr) = mgr(4);
        mgr.add_member_to_group(3, 5).unwrap();
        mgr.deactivate_member(3, 5).unwrap();
        assert!(!mgr.is_active(3, 5).unwrap());
        assert_eq!(reg.snapshot()[0], 0);
        assert_eq!(mgr.group_indexes(3), vec![0]);

        mgr.activate_member(3, 5).unwrap();
        assert!(mgr.is_active(3, 5).unwrap());
        assert_eq!(mgr.get_assigned_index(3, 5).unwrap(), 0);
    }

    #[test]
    fn test_get_from_hash_skips_inactive() {
        let (_reg, mgr) = mgr(8);
        for m in [100, 101, 102, 103] {
            mgr.add_member_to_group(1, m).unwrap();
        }
        mgr.deactivate_member(1, 101).unwrap();

        // Active, ascending by index: 100, 102, 103
        assert_eq!(mgr.get_from_hash(1, 0).unwrap(), 100);
        assert_eq!(mgr.get_from_hash(1, 1).unwrap(), 102);
        assert_eq!(mgr.get_from_hash(1, 2).unwrap(), 103);
        assert_eq!(mgr.get_from_hash(1, 3).unwrap(), 100);

        for h in 0..64 {
            let mbr = mgr.get_from_hash(1, h).unwrap();
            assert!(mgr.is_active(1, mbr).unwrap());
        }
    }

    #[test]
    fn test_get_from_hash_sees_external_register_writes() {
        let (reg, mgr) = mgr(4);
        mgr.add_member_to_group(0, 1).unwrap();
        mgr.add_member_to_group(0, 2).unwrap();

        // Data plane clears member 1's bit directly
        reg.lock().set(0, 0);
        for h in 0..8 {
            assert_eq!(mgr.get_from_hash(0, h).unwrap(), 2);
        }
    }

    #[test]
    fn test_get_from_hash_zero_active_fails() {
        let (_reg, mgr) = mgr(4);
        assert_eq!(mgr.get_from_hash(5, 0), Err(MembershipError::UnknownGroup(5)));

        mgr.add_member_to_group(5, 1).unwrap();
        mgr.deactivate_member(5, 1).unwrap();
        assert_eq!(mgr.get_from_hash(5, 9), Err(MembershipError::NoActiveMembers(5)));

        mgr.remove_member_from_group(5, 1).unwrap();
        assert_eq!(mgr.get_from_hash(5, 9), Err(MembershipError::NoActiveMembers(5)));
    }

    #[test]
    fn test_reset_keeps_register_contents() {
        let (reg, mgr) = mgr(4);
        mgr.add_member_to_group(0, 1).unwrap();
        mgr.reset();
        assert_eq!(mgr.member_count(), 0);
        assert!(mgr.group_indexes(0).is_empty());
        assert_eq!(reg.snapshot()[0], 1);

        mgr.add_member_to_group(0, 9).unwrap();
        assert_eq!(mgr.get_assigned_index(0, 9).unwrap(), 0);
    }

    #[test]
    fn test_remove_refuses_inconsistent_maps() {
        let (reg, mgr) = mgr(4);
        mgr.add_member_to_group(2, 20).unwrap();
        mgr.add_member_to_group(2, 21).unwrap();
        let index = mgr.get_assigned_index(2, 21).unwrap();
        mgr.maps.lock().group_indexes.get_mut(&2).unwrap().remove(&index);

        assert_eq!(
            mgr.remove_member_from_group(2, 21),
            Err(MembershipError::Inconsistent(index))
        );
        // Nothing was released or unmapped
        assert_eq!(mgr.get_assigned_index(2, 21).unwrap(), index);
        assert!(mgr.maps.lock().index_mgr.is_allocated(index));
        assert_eq!(mgr.maps.lock().index_to_mbr.get(&index), Some(&Member::new(2, 21)));
        assert_eq!(reg.snapshot()[index as usize], 1);
        assert_eq!(mgr.member_count(), 2);

        // The fresh add must not reuse the still-owned index
        mgr.add_member_to_group(2, 22).unwrap();
        assert_ne!(mgr.get_assigned_index(2, 22).unwrap(), index);
    }

    #[test]
    fn test_drop_unregisters_notifier() {
        let reg = Arc::new(RegisterArray::new("sel", 4, 1));
        let mgr = GroupMembershipMgr::new(reg.clone());
        assert_eq!(reg.notifier_count(), 1);
        mgr.add_member_to_group(0, 1).unwrap();
        drop(mgr);
        assert_eq!(reg.notifier_count(), 0);

        let again = GroupMembershipMgr::new(reg.clone());
        assert_eq!(reg.notifier_count(), 1);
        drop(again);
        assert_eq!(reg.notifier_count(), 0);
        assert_eq!(reg.snapshot()[0], 1);
    }

    #[test]
    fn test_concurrent_membership_and_selection() {
        let (reg, mgr) = mgr(64);
        let mgr = Arc::new(mgr);
        mgr.add_member_to_group(0, 1000).unwrap();

        let writers: Vec<_> = (0..4u32)
            .map(|t| {
                let mgr = mgr.clone();
                thread::spawn(move || {
                    for i in 0..8u32 {
                        let mbr = t * 100 + i;
                        mgr.add_member_to_group(0, mbr).unwrap();
                        mgr.deactivate_member(0, mbr).unwrap();
                        mgr.activate_member(0, mbr).unwrap();
                        if i % 2 == 0 {
                            mgr.remove_member_from_group(0, mbr).unwrap();
                        }
                    }
                })
            })
            .collect();

        let reader = {
            let mgr = mgr.clone();
            thread::spawn(move || {
                for h in 0..500u64 {
                    // Member 1000 is never touched, so a result always exists
                    mgr.get_from_hash(0, h).unwrap();
                }
            })
        };

        // Data plane clearing activation bits under the register lock alone
        let data_plane = {
            let reg = reg.clone();
            thread::spawn(move || {
                for round in 0..50 {
                    for index in 1..64 {
                        reg.lock().set(index, (round + index) as u64 & 1);
                    }
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        data_plane.join().unwrap();
        assert_eq!(reg.snapshot()[0], 1);

        assert_eq!(mgr.group_indexes(0).len(), 1 + 4 * 4);
        for idx in mgr.group_indexes(0) {
            assert!(idx < 64);
        }
    }
}
