//! Stateful ALU execution engine.
//!
//! One [`StatefulAlu`] exists per declared `stateful_alu` instance. It is
//! bound to exactly one register array and runs a predicated
//! read-modify-write on one cell of it per call, optionally producing an
//! output value into a PHV field.
//!
//! # Execution Paths
//!
//! - **Single-bit** (`bitwidth == 1`): the update expression computes the new
//!   bit directly from set/clear/read locals.
//! - **General**: two conditions, four predicated update slots (two per
//!   half), passthrough when no slot fires, optional predicated output.
//!
//! # Reduction-or
//!
//! ALUs that share a `reduction_or_group` build one output field together:
//! the first to run for a packet overwrites the field, later ones OR into
//! it. The pipeline runs its control sequence in declaration order and each
//! ALU at most once per packet, which fixes who overwrites.

pub mod attributes;
pub mod engine;

pub use attributes::{AluAttributes, AluConfig, LoggingMode, MathUnit, UpdateSlot};
pub use engine::StatefulAlu;

use crate::device::DeviceError;
use crate::expr::ExprError;
use thiserror::Error;

/// Load-time configuration errors. An instance that raises one is never
/// created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric attribute did not parse.
    #[error("attribute '{attribute}': invalid number '{value}'")]
    InvalidNumber {
        /// Attribute name.
        attribute: &'static str,
        /// Offending text.
        value: String,
    },

    /// A boolean attribute was neither `True` nor `False`.
    #[error("attribute '{attribute}': invalid boolean '{value}'")]
    InvalidBool {
        /// Attribute name.
        attribute: &'static str,
        /// Offending text.
        value: String,
    },

    /// `_bitwidth_` is outside 1..=64.
    #[error("invalid ALU bitwidth {0}")]
    InvalidBitwidth(i64),

    /// Dual-width mode needs an even bitwidth.
    #[error("dual-width ALU needs an even bitwidth, got {0}")]
    OddDualWidth(usize),

    /// The math unit lookup table does not have 16 entries.
    #[error("math unit lookup table has {0} entries, expected 16")]
    LookupTableSize(usize),

    /// Unrecognized `stateful_logging_mode`.
    #[error("unknown stateful logging mode '{0}'")]
    UnknownLoggingMode(String),

    /// An expression attribute did not parse.
    #[error("attribute '{attribute}': {source}")]
    Expression {
        /// Attribute name.
        attribute: &'static str,
        /// Parse error.
        #[source]
        source: ExprError,
    },

    /// A required attribute was omitted.
    #[error("missing required attribute '{0}'")]
    MissingAttribute(&'static str),

    /// Reference to an undeclared register array.
    #[error("unknown register array '{0}'")]
    UnknownRegister(String),

    /// Register arrays need at least one cell.
    #[error("register array '{0}' has no cells")]
    EmptyRegister(String),

    /// The ALU is wider than its register.
    #[error("ALU bitwidth {bitwidth} exceeds register '{register}' width {register_bitwidth}")]
    BitwidthExceedsRegister {
        /// ALU bitwidth.
        bitwidth: usize,
        /// Register name.
        register: String,
        /// Register cell width.
        register_bitwidth: usize,
    },

    /// Reference to an undeclared selector table.
    #[error("unknown selector table '{0}'")]
    UnknownSelectorTable(String),

    /// Reference to an undeclared PHV field.
    #[error("{context}: unknown field '{field}'")]
    UnknownField {
        /// Where the reference was found.
        context: String,
        /// Field name.
        field: String,
    },

    /// Reference to an undeclared hash calculation.
    #[error("unknown hash calculation '{0}'")]
    UnknownHash(String),

    /// Reference to an undeclared ALU instance.
    #[error("unknown stateful ALU '{0}'")]
    UnknownAlu(String),

    /// Extern type with no registered implementation.
    #[error("unknown extern type '{0}'")]
    UnknownExternType(String),

    /// Two objects of one kind share a name.
    #[error("duplicate {kind} '{name}'")]
    Duplicate {
        /// Object kind.
        kind: &'static str,
        /// Name.
        name: String,
    },

    /// Error inside one named instance.
    #[error("stateful_alu '{name}': {source}")]
    Instance {
        /// Instance name.
        name: String,
        /// Underlying error.
        #[source]
        source: Box<ConfigError>,
    },
}

/// Per-packet execution errors. Each means a broken program or corrupted
/// state, not a recoverable packet event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AluError {
    /// Explicit or entry index outside the register array.
    #[error("{alu}: index {index} out of range for register of size {size}")]
    IndexOutOfRange {
        /// ALU name.
        alu: String,
        /// Requested index.
        index: u64,
        /// Register array size.
        size: usize,
    },

    /// The ALU already ran for this packet.
    #[error("{alu}: executed twice for packet {packet}")]
    AlreadyExecuted {
        /// ALU name.
        alu: String,
        /// Packet id.
        packet: u64,
    },

    /// A single-bit register cell held something other than 0 or 1.
    #[error("{alu}: single-bit register cell {index} holds {value}")]
    InvalidSingleBit {
        /// ALU name.
        alu: String,
        /// Cell index.
        index: usize,
        /// Cell value.
        value: u64,
    },

    /// The operation has no implementation.
    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    /// Expression evaluation failed.
    #[error(transparent)]
    Expr(#[from] ExprError),

    /// PHV access failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let e = ConfigError::Instance {
            name: "count".to_string(),
            source: Box::new(ConfigError::LookupTableSize(3)),
        };
        assert_eq!(
            e.to_string(),
            "stateful_alu 'count': math unit lookup table has 3 entries, expected 16"
        );
    }

    #[test]
    fn test_alu_error_from_expr() {
        let e: AluError = ExprError::LocalOutOfRange { index: 2, supplied: 1 }.into();
        assert!(matches!(e, AluError::Expr(_)));
        assert!(AluError::Unimplemented("execute_stateful_log")
            .to_string()
            .contains("not implemented"));
    }
}
