//! Indirect match tables with a selector.
//!
//! A [`SelectorTable`] resolves a packet to one member of a group through
//! its [`ActionProfile`]. The profile owns member and group handles and
//! delegates "which member for this hash" to its [`GroupSelector`] slot.

use crate::selector::{
    GroupMembership, GroupMembershipMgr, GroupSelection, GroupSelector, GrpHdl, MbrHdl,
    MembershipError,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct ProfileState {
    next_member: MbrHdl,
    next_group: GrpHdl,
    members: Vec<MbrHdl>,
    /// Group -> members in insertion order.
    groups: BTreeMap<GrpHdl, Vec<MbrHdl>>,
}

/// Action profile: member and group handles plus the selector slot.
///
/// Lock order: profile state, then the selector's own locks.
#[derive(Debug)]
pub struct ActionProfile {
    name: String,
    selector: RwLock<GroupSelector>,
    state: Mutex<ProfileState>,
}

impl ActionProfile {
    /// Create an empty profile with no selector installed.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: RwLock::new(GroupSelector::NoSelector),
            state: Mutex::new(ProfileState::default()),
        }
    }

    /// Profile name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the selector slot.
    pub fn set_group_selector(&self, selector: GroupSelector) {
        log::debug!("{}: group selector set to {:?}", self.name, selector);
        *self.selector.write() = selector;
    }

    /// Current selector slot.
    pub fn group_selector(&self) -> GroupSelector {
        self.selector.read().clone()
    }

    /// Installed membership manager, if any.
    pub fn membership(&self) -> Option<Arc<GroupMembershipMgr>> {
        self.selector.read().membership().cloned()
    }

    /// Allocate a member handle.
    pub fn create_member(&self) -> MbrHdl {
        let mut state = self.state.lock();
        let mbr = state.next_member;
        state.next_member += 1;
        state.members.push(mbr);
        mbr
    }

    /// Allocate an empty group.
    pub fn create_group(&self) -> GrpHdl {
        let mut state = self.state.lock();
        let grp = state.next_group;
        state.next_group += 1;
        state.groups.insert(grp, Vec::new());
        grp
    }

    /// Members of `grp` in insertion order.
    pub fn group_members(&self, grp: GrpHdl) -> Result<Vec<MbrHdl>, MembershipError> {
        self.state
            .lock()
            .groups
            .get(&grp)
            .cloned()
            .ok_or(MembershipError::UnknownGroup(grp))
    }

    /// Add a member to a group, forwarding to the selector.
    pub fn add_member_to_group(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<(), MembershipError> {
        let mut state = self.state.lock();
        if !state.members.contains(&mbr) {
            return Err(MembershipError::UnknownMember { grp, mbr });
        }
        let members = state
            .groups
            .get_mut(&grp)
            .ok_or(MembershipError::UnknownGroup(grp))?;
        if members.contains(&mbr) {
            return Err(MembershipError::MemberExists { grp, mbr });
        }
        if let Some(mgr) = self.membership() {
            mgr.add_member_to_group(grp, mbr)?;
        }
        members.push(mbr);
        Ok(())
    }

    /// Remove a member from a group, forwarding to the selector.
    pub fn remove_member_from_group(
        &self,
        grp: GrpHdl,
        mbr: MbrHdl,
    ) -> Result<(), MembershipError> {
        let mut state = self.state.lock();
        let members = state
            .groups
            .get_mut(&grp)
            .ok_or(MembershipError::UnknownGroup(grp))?;
        let pos = members
            .iter()
            .position(|&m| m == mbr)
            .ok_or(MembershipError::UnknownMember { grp, mbr })?;
        if let Some(mgr) = self.membership() {
            mgr.remove_member_from_group(grp, mbr)?;
        }
        members.remove(pos);
        Ok(())
    }

    /// Pick a member of `grp` for `hash`.
    ///
    /// Without a membership manager every group member is eligible, in
    /// insertion order.
    pub fn select(&self, grp: GrpHdl, hash: u64) -> Result<MbrHdl, MembershipError> {
        if let Some(mgr) = self.membership() {
            return mgr.get_from_hash(grp, hash);
        }
        let state = self.state.lock();
        let members = state
            .groups
            .get(&grp)
            .ok_or(MembershipError::UnknownGroup(grp))?;
        if members.is_empty() {
            return Err(MembershipError::NoActiveMembers(grp));
        }
        Ok(members[(hash % members.len() as u64) as usize])
    }

    /// Empty every group and reset the selector.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        for members in state.groups.values_mut() {
            members.clear();
        }
        if let Some(mgr) = self.membership() {
            mgr.reset();
        }
    }
}

/// Indirect match table with a selector.
#[derive(Debug)]
pub struct SelectorTable {
    name: String,
    action_profile: ActionProfile,
}

impl SelectorTable {
    /// Create a table and its action profile.
    pub fn new(name: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_profile: ActionProfile::new(profile),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table's action profile.
    pub fn action_profile(&self) -> &ActionProfile {
        &self.action_profile
    }

    /// Control-plane membership surface, present once a master ALU is bound.
    pub fn group_membership(&self) -> Option<Arc<dyn GroupMembership>> {
        self.action_profile
            .membership()
            .map(|mgr| mgr as Arc<dyn GroupMembership>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RegisterArray;

    #[test]
    fn test_no_selector_uses_insertion_order() {
        let table = SelectorTable::new("lb", "lb_profile");
        let profile = table.action_profile();
        let grp = profile.create_group();
        let a = profile.create_member();
        let b = profile.create_member();
        let c = profile.create_member();
        for m in [c, a, b] {
            profile.add_member_to_group(grp, m).unwrap();
        }
        assert_eq!(profile.group_members(grp).unwrap(), vec![c, a, b]);
        assert_eq!(profile.select(grp, 0).unwrap(), c);
        assert_eq!(profile.select(grp, 4).unwrap(), a);
        assert!(table.group_membership().is_none());

        profile.remove_member_from_group(grp, a).unwrap();
        assert_eq!(profile.select(grp, 1).unwrap(), b);
    }

    #[test]
    fn test_profile_errors() {
        let profile = ActionProfile::new("p");
        let grp = profile.create_group();
        let m = profile.create_member();
        assert_eq!(
            profile.add_member_to_group(grp, 42),
            Err(MembershipError::UnknownMember { grp, mbr: 42 })
        );
        assert_eq!(
            profile.add_member_to_group(9, m),
            Err(MembershipError::UnknownGroup(9))
        );
        assert_eq!(profile.select(grp, 0), Err(MembershipError::NoActiveMembers(grp)));
        profile.add_member_to_group(grp, m).unwrap();
        assert_eq!(
            profile.add_member_to_group(grp, m),
            Err(MembershipError::MemberExists { grp, mbr: m })
        );
    }

    #[test]
    fn test_membership_selector_forwarding() {
        let reg = Arc::new(RegisterArray::new("bits", 4, 1));
        let mgr = Arc::new(GroupMembershipMgr::new(reg.clone()));
        let table = SelectorTable::new("lb", "lb_profile");
        let profile = table.action_profile();
        profile.set_group_selector(GroupSelector::Membership(mgr.clone()));

        let grp = profile.create_group();
        let a = profile.create_member();
        let b = profile.create_member();
        profile.add_member_to_group(grp, a).unwrap();
        profile.add_member_to_group(grp, b).unwrap();
        assert_eq!(reg.snapshot(), vec![1, 1, 0, 0]);

        let control = table.group_membership().unwrap();
        control.deactivate_member(grp, a).unwrap();
        for h in 0..4 {
            assert_eq!(profile.select(grp, h).unwrap(), b);
        }

        profile.remove_member_from_group(grp, b).unwrap();
        assert_eq!(profile.select(grp, 0), Err(MembershipError::NoActiveMembers(grp)));

        profile.reset();
        assert_eq!(mgr.member_count(), 0);
        assert!(profile.group_members(grp).unwrap().is_empty());
    }
}
