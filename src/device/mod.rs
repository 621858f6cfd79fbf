//! Host data-plane state consumed by the stateful ALUs.
//!
//! This module provides the pieces of a switch pipeline that the ALU engine
//! and the group membership manager are built on:
//! - Register arrays (indexed, fixed-width, lock-guarded persistent storage)
//! - The packet header vector and per-packet state
//! - Named hash calculations used to derive register indices
//!
//! # Example
//!
//! ```
//! use salu_emu::device::RegisterArray;
//!
//! let reg = RegisterArray::new("counters", 16, 32);
//! {
//!     let mut cells = reg.lock();
//!     let v = cells.at(3);
//!     cells.set(3, v + 1);
//! }
//! assert_eq!(reg.snapshot()[3], 1);
//! ```

pub mod hash;
pub mod phv;
pub mod register;

pub use hash::{HashAlgorithm, NamedCalculation};
pub use phv::{FieldInfo, Packet, Phv, PhvLayout};
pub use register::{width_mask, NotifierId, RegisterArray, RegisterGuard, MAX_REGISTER_BITWIDTH};

use thiserror::Error;

/// Errors raised by host data-plane state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// A field name that the PHV layout does not declare.
    #[error("unknown PHV field '{0}'")]
    UnknownField(String),
}
