//! Selector group membership backed by a register array.
//!
//! An action profile with a selector picks one member of a group per packet
//! from a hash value. When a stateful ALU is bound to the selector table
//! and is the group's master, selection is restricted to *active* members,
//! where activity is an activation bit stored in the ALU's register array.
//! The data plane can then deactivate members by writing that register.
//!
//! Two capability surfaces are exposed:
//!
//! - [`GroupMembership`]: offered to the bound selector table's control
//!   plane (activate, deactivate, index lookup).
//! - [`GroupSelection`]: plugged into the action profile's selector slot
//!   (add/remove member, select from hash, reset).
//!
//! The slot itself is a [`GroupSelector`], chosen by configuration.

pub mod handles;
pub mod membership;

pub use handles::HandleMgr;
pub use membership::{GroupMembershipMgr, Member};

use std::sync::Arc;
use thiserror::Error;

/// Group handle, as assigned by the action profile.
pub type GrpHdl = u32;

/// Member handle, as assigned by the action profile.
pub type MbrHdl = u32;

/// Register index assigned to a group member.
pub type Index = u32;

/// Errors raised by membership operations.
///
/// Each of these indicates a broken program or corrupted prior state; the
/// hosting pipeline treats them as fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MembershipError {
    /// The (group, member) pair is not bound.
    #[error("member {mbr} is not in group {grp}")]
    UnknownMember {
        /// Group handle.
        grp: GrpHdl,
        /// Member handle.
        mbr: MbrHdl,
    },

    /// The group has never had a member.
    #[error("unknown group {0}")]
    UnknownGroup(GrpHdl),

    /// The (group, member) pair is already bound.
    #[error("member {mbr} is already in group {grp}")]
    MemberExists {
        /// Group handle.
        grp: GrpHdl,
        /// Member handle.
        mbr: MbrHdl,
    },

    /// Every register index is already assigned.
    #[error("no free register index (capacity {capacity})")]
    IndicesExhausted {
        /// Number of indices in the register array.
        capacity: u32,
    },

    /// Selection requires at least one active member.
    #[error("group {0} has no active member")]
    NoActiveMembers(GrpHdl),

    /// The internal maps disagree about an index.
    #[error("membership maps inconsistent at index {0}")]
    Inconsistent(Index),
}

/// Control-plane surface offered to a selector table bound to a master ALU.
pub trait GroupMembership: Send + Sync {
    /// Register index assigned to a member.
    fn get_assigned_index(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<Index, MembershipError>;

    /// Set the member's activation bit.
    fn activate_member(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<(), MembershipError>;

    /// Clear the member's activation bit.
    fn deactivate_member(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<(), MembershipError>;
}

/// Surface plugged into an action profile's selector slot.
pub trait GroupSelection: Send + Sync {
    /// Bind a member to a fresh index and activate it.
    fn add_member_to_group(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<(), MembershipError>;

    /// Unbind a member, release its index and clear its activation bit.
    fn remove_member_from_group(&self, grp: GrpHdl, mbr: MbrHdl) -> Result<(), MembershipError>;

    /// Pick an active member of `grp` from a hash value.
    fn get_from_hash(&self, grp: GrpHdl, hash: u64) -> Result<MbrHdl, MembershipError>;

    /// Forget every binding. Register contents are left alone.
    fn reset(&self);
}

/// What fills an action profile's selector slot.
#[derive(Clone, Default)]
pub enum GroupSelector {
    /// Default selection over all group members.
    #[default]
    NoSelector,
    /// Register-backed selection over active members.
    Membership(Arc<GroupMembershipMgr>),
}

impl GroupSelector {
    /// The membership manager, if this slot holds one.
    pub fn membership(&self) -> Option<&Arc<GroupMembershipMgr>> {
        match self {
            GroupSelector::NoSelector => None,
            GroupSelector::Membership(mgr) => Some(mgr),
        }
    }
}

impl std::fmt::Debug for GroupSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupSelector::NoSelector => write!(f, "NoSelector"),
            GroupSelector::Membership(mgr) => {
                write!(f, "Membership({})", mgr.register_name())
            }
        }
    }
}
