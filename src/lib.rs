//! salu-emu library
//!
//! Software model of a programmable-switch stateful ALU and the
//! register-backed selector group membership manager built on it.

pub mod alu;
pub mod config;
pub mod device;
pub mod expr;
pub mod pipeline;
pub mod program;
pub mod selector;
pub mod testing;
