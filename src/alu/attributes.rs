//! Declared attributes of a stateful ALU and their validated form.
//!
//! [`AluAttributes`] mirrors the attribute block the compiler emits for one
//! `stateful_alu` instance: every value is a string, and omitted attributes
//! are empty. [`AluConfig::from_attributes`] parses and validates all of
//! them up front; any malformed attribute refuses the whole instance.
//!
//! # Local slots
//!
//! Each expression attribute is parsed against the locals the engine will
//! supply when evaluating it:
//!
//! | attribute                         | locals                                   |
//! |-----------------------------------|------------------------------------------|
//! | `condition_lo/hi`, update values  | `register_lo`, `register_hi`             |
//! | update and output predicates      | `condition_lo`, `condition_hi`           |
//! | `output_value`                    | `alu_lo`, `alu_hi`, `register_lo`, `register_hi`, `predicate`, `combined_predicate` |
//! | single-bit update/output          | `alu_lo`, `alu_hi`, `set_bit`, `set_bitc`, `clr_bit`, `clr_bitc`, `read_bit`, `read_bitc` |

use super::ConfigError;
use crate::device::{width_mask, Phv, MAX_REGISTER_BITWIDTH};
use crate::expr::{parse_number, ExprError, Expression, LocalAliases};
use serde::Deserialize;
use std::fmt;

/// Raw attribute block, as declared for one ALU instance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct AluAttributes {
    pub reg: String,
    pub selector_binding: String,
    pub initial_register_lo_value: String,
    pub initial_register_hi_value: String,
    pub condition_hi: String,
    pub condition_lo: String,
    pub update_lo_1_predicate: String,
    pub update_lo_1_value: String,
    pub update_lo_2_predicate: String,
    pub update_lo_2_value: String,
    pub update_hi_1_predicate: String,
    pub update_hi_1_value: String,
    pub update_hi_2_predicate: String,
    pub update_hi_2_value: String,
    pub output_predicate: String,
    pub output_value: String,
    pub output_dst: String,
    pub math_unit_input: String,
    pub math_unit_output_scale: String,
    pub math_unit_exponent_shift: String,
    pub math_unit_exponent_invert: String,
    pub math_unit_lookup_table: String,
    pub reduction_or_group: String,
    pub stateful_logging_mode: String,
    #[serde(rename = "_dual_width_")]
    pub dual_width: String,
    #[serde(rename = "_bitwidth_")]
    pub bitwidth: String,
    #[serde(rename = "_master_")]
    pub master: String,
}

/// Stateful logging mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoggingMode {
    /// No stateful logging.
    #[default]
    None,
    /// Log on table hit.
    TableHit,
    /// Log on table miss.
    TableMiss,
    /// Log when the gateway inhibits the table.
    GatewayInhibit,
    /// Log by address.
    Address,
}

impl LoggingMode {
    /// Parse the attribute value. Empty means [`LoggingMode::None`].
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "" | "none" => Ok(LoggingMode::None),
            "table_hit" => Ok(LoggingMode::TableHit),
            "table_miss" => Ok(LoggingMode::TableMiss),
            "gateway_inhibit" => Ok(LoggingMode::GatewayInhibit),
            "address" => Ok(LoggingMode::Address),
            other => Err(ConfigError::UnknownLoggingMode(other.to_string())),
        }
    }
}

/// Number of entries in the math unit lookup table.
pub const MATH_UNIT_TABLE_SIZE: usize = 16;

/// Math unit configuration.
///
/// Parsed and validated at load; the execute path does not use it.
#[derive(Debug, Clone, Default)]
pub struct MathUnit {
    /// Input expression (register locals).
    pub input: Expression,
    /// Output scale.
    pub output_scale: i64,
    /// Exponent shift.
    pub exponent_shift: i64,
    /// Whether the exponent is inverted.
    pub exponent_invert: bool,
    /// Lookup table, all zero when omitted.
    pub lookup_table: [u8; MATH_UNIT_TABLE_SIZE],
}

impl MathUnit {
    /// Whether any math unit attribute was set.
    pub fn is_configured(&self) -> bool {
        !self.input.empty()
            || self.output_scale != 0
            || self.exponent_shift != 0
            || self.exponent_invert
            || self.lookup_table.iter().any(|&v| v != 0)
    }
}

/// A (predicate, value) pair for one update or output slot.
#[derive(Debug, Clone, Default)]
pub struct UpdateSlot {
    /// Predicate over `condition_lo` / `condition_hi`.
    pub predicate: Expression,
    /// Value expression.
    pub value: Expression,
}

impl UpdateSlot {
    /// Whether the slot fires.
    ///
    /// - both expressions omitted: never (no-op slot)
    /// - only the predicate omitted: always
    /// - otherwise: the predicate's value
    pub fn holds(&self, phv: &Phv, conditions: &[i64]) -> Result<bool, ExprError> {
        if self.predicate.empty() && self.value.empty() {
            return Ok(false);
        }
        if self.predicate.empty() {
            return Ok(true);
        }
        self.predicate.eval_bool(phv, conditions)
    }

    /// Whether both expressions were omitted.
    pub fn is_noop(&self) -> bool {
        self.predicate.empty() && self.value.empty()
    }
}

/// Locals for `condition_lo/hi` and the update value expressions.
pub fn register_locals() -> LocalAliases {
    LocalAliases::new(
        2,
        &[("register_lo", 0), ("lo", 0), ("register_hi", 1), ("hi", 1)],
    )
}

/// Locals for update and output predicates.
pub fn condition_locals() -> LocalAliases {
    LocalAliases::new(2, &[("condition_lo", 0), ("condition_hi", 1)])
}

/// Locals for the output value in the general path.
pub fn output_locals() -> LocalAliases {
    LocalAliases::new(
        6,
        &[
            ("alu_lo", 0),
            ("alu_hi", 1),
            ("register_lo", 2),
            ("register_hi", 3),
            ("predicate", 4),
            ("combined_predicate", 5),
        ],
    )
}

/// Locals for the single-bit update and output expressions.
pub fn single_bit_locals() -> LocalAliases {
    LocalAliases::new(
        8,
        &[
            ("alu_lo", 0),
            ("alu_hi", 1),
            ("set_bit", 2),
            ("register_lo", 2),
            ("set_bitc", 3),
            ("clr_bit", 4),
            ("clr_bitc", 5),
            ("read_bit", 6),
            ("read_bitc", 7),
        ],
    )
}

/// Validated ALU configuration.
#[derive(Debug, Clone)]
pub struct AluConfig {
    /// Pack two half-width values into one register word.
    pub dual_width: bool,
    /// ALU width in bits.
    pub bitwidth: usize,
    /// Owner of the selector group membership, if selector-bound.
    pub master: bool,
    /// Initial low half (or full value) of every register cell.
    pub initial_lo: u64,
    /// Initial high half of every register cell.
    pub initial_hi: u64,
    /// Low condition.
    pub condition_lo: Expression,
    /// High condition.
    pub condition_hi: Expression,
    /// `update_lo_1`, `update_lo_2`.
    pub update_lo: [UpdateSlot; 2],
    /// `update_hi_1`, `update_hi_2`.
    pub update_hi: [UpdateSlot; 2],
    /// Output predicate and value.
    pub output: UpdateSlot,
    /// Output destination field.
    pub output_dst: Option<String>,
    /// Math unit.
    pub math_unit: MathUnit,
    /// Reduction-or scratch field shared by cooperating ALUs.
    pub reduction_or_group: Option<String>,
    /// Stateful logging mode.
    pub logging_mode: LoggingMode,
}

impl AluConfig {
    /// Parse and validate an attribute block.
    pub fn from_attributes(attrs: &AluAttributes) -> Result<Self, ConfigError> {
        let dual_width = parse_bool("_dual_width_", &attrs.dual_width)?;
        let master = parse_bool("_master_", &attrs.master)?;
        let bitwidth = parse_int("_bitwidth_", &attrs.bitwidth)?;
        if bitwidth < 1 || bitwidth > MAX_REGISTER_BITWIDTH as i64 {
            return Err(ConfigError::InvalidBitwidth(bitwidth));
        }
        let bitwidth = bitwidth as usize;
        if dual_width && bitwidth % 2 != 0 {
            return Err(ConfigError::OddDualWidth(bitwidth));
        }

        let initial_lo = parse_int("initial_register_lo_value", &attrs.initial_register_lo_value)?;
        let initial_hi = parse_int("initial_register_hi_value", &attrs.initial_register_hi_value)?;

        let (update_aliases, output_aliases) = if bitwidth == 1 {
            (single_bit_locals(), single_bit_locals())
        } else {
            (register_locals(), output_locals())
        };
        let regs = register_locals();
        let conds = condition_locals();

        let slot = |name_p, pred: &str, name_v, value: &str, value_aliases: &LocalAliases| {
            Ok::<_, ConfigError>(UpdateSlot {
                predicate: parse_expr(name_p, pred, &conds)?,
                value: parse_expr(name_v, value, value_aliases)?,
            })
        };

        let update_lo = [
            slot(
                "update_lo_1_predicate",
                &attrs.update_lo_1_predicate,
                "update_lo_1_value",
                &attrs.update_lo_1_value,
                &update_aliases,
            )?,
            slot(
                "update_lo_2_predicate",
                &attrs.update_lo_2_predicate,
                "update_lo_2_value",
                &attrs.update_lo_2_value,
                &regs,
            )?,
        ];
        let update_hi = [
            slot(
                "update_hi_1_predicate",
                &attrs.update_hi_1_predicate,
                "update_hi_1_value",
                &attrs.update_hi_1_value,
                &regs,
            )?,
            slot(
                "update_hi_2_predicate",
                &attrs.update_hi_2_predicate,
                "update_hi_2_value",
                &attrs.update_hi_2_value,
                &regs,
            )?,
        ];
        let output = slot(
            "output_predicate",
            &attrs.output_predicate,
            "output_value",
            &attrs.output_value,
            &output_aliases,
        )?;

        let math_unit = MathUnit {
            input: parse_expr("math_unit_input", &attrs.math_unit_input, &regs)?,
            output_scale: parse_int("math_unit_output_scale", &attrs.math_unit_output_scale)?,
            exponent_shift: parse_int("math_unit_exponent_shift", &attrs.math_unit_exponent_shift)?,
            exponent_invert: parse_bool("math_unit_exponent_invert", &attrs.math_unit_exponent_invert)?,
            lookup_table: parse_lookup_table(&attrs.math_unit_lookup_table)?,
        };

        Ok(Self {
            dual_width,
            bitwidth,
            master,
            initial_lo: initial_lo as u64,
            initial_hi: initial_hi as u64,
            condition_lo: parse_expr("condition_lo", &attrs.condition_lo, &regs)?,
            condition_hi: parse_expr("condition_hi", &attrs.condition_hi, &regs)?,
            update_lo,
            update_hi,
            output,
            output_dst: non_empty(&attrs.output_dst),
            math_unit,
            reduction_or_group: non_empty(&attrs.reduction_or_group),
            logging_mode: LoggingMode::parse(attrs.stateful_logging_mode.trim())?,
        })
    }

    /// Single-bit mode.
    pub fn is_single_bit(&self) -> bool {
        self.bitwidth == 1
    }

    /// Width of one register half (the full width outside dual-width mode).
    pub fn half_width(&self) -> usize {
        if self.dual_width {
            self.bitwidth / 2
        } else {
            self.bitwidth
        }
    }

    /// Pack halves into a register word. Each half is truncated to its width.
    pub fn pack(&self, lo: u64, hi: u64) -> u64 {
        let mask = width_mask(self.half_width());
        if self.dual_width {
            (lo & mask) | ((hi & mask) << self.half_width())
        } else {
            lo & mask
        }
    }

    /// Split a register word into `(lo, hi)`; `hi` is 0 outside dual-width
    /// mode.
    pub fn unpack(&self, word: u64) -> (u64, u64) {
        let mask = width_mask(self.half_width());
        if self.dual_width {
            (word & mask, (word >> self.half_width()) & mask)
        } else {
            (word & mask, 0)
        }
    }

    /// Expressions with their attribute names, for reference checking.
    pub fn expressions(&self) -> Vec<(&'static str, &Expression)> {
        vec![
            ("condition_lo", &self.condition_lo),
            ("condition_hi", &self.condition_hi),
            ("update_lo_1_predicate", &self.update_lo[0].predicate),
            ("update_lo_1_value", &self.update_lo[0].value),
            ("update_lo_2_predicate", &self.update_lo[1].predicate),
            ("update_lo_2_value", &self.update_lo[1].value),
            ("update_hi_1_predicate", &self.update_hi[0].predicate),
            ("update_hi_1_value", &self.update_hi[0].value),
            ("update_hi_2_predicate", &self.update_hi[1].predicate),
            ("update_hi_2_value", &self.update_hi[1].value),
            ("output_predicate", &self.output.predicate),
            ("output_value", &self.output.value),
            ("math_unit_input", &self.math_unit.input),
        ]
    }
}

impl fmt::Display for AluConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}b", self.bitwidth)?;
        if self.dual_width {
            write!(f, " dual")?;
        }
        if self.is_single_bit() {
            write!(f, " single-bit")?;
        }
        if self.master {
            write!(f, " master")?;
        }
        if let Some(dst) = &self.output_dst {
            write!(f, " -> {}", dst)?;
        }
        if let Some(group) = &self.reduction_or_group {
            write!(f, " (or-group {})", group)?;
        }
        Ok(())
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn parse_bool(attribute: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "" | "False" | "false" => Ok(false),
        "True" | "true" => Ok(true),
        other => Err(ConfigError::InvalidBool {
            attribute,
            value: other.to_string(),
        }),
    }
}

fn parse_int(attribute: &'static str, value: &str) -> Result<i64, ConfigError> {
    let text = value.trim();
    if text.is_empty() {
        return Ok(0);
    }
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let v = parse_number(digits, 0).map_err(|_| ConfigError::InvalidNumber {
        attribute,
        value: text.to_string(),
    })?;
    Ok(if negative { v.wrapping_neg() } else { v })
}

fn parse_expr(
    attribute: &'static str,
    src: &str,
    aliases: &LocalAliases,
) -> Result<Expression, ConfigError> {
    Expression::parse(src, aliases).map_err(|source| ConfigError::Expression { attribute, source })
}

fn parse_lookup_table(value: &str) -> Result<[u8; MATH_UNIT_TABLE_SIZE], ConfigError> {
    let mut table = [0u8; MATH_UNIT_TABLE_SIZE];
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.is_empty() {
        return Ok(table);
    }
    if tokens.len() != MATH_UNIT_TABLE_SIZE {
        return Err(ConfigError::LookupTableSize(tokens.len()));
    }
    for (slot, token) in table.iter_mut().zip(tokens) {
        let v = parse_int("math_unit_lookup_table", token)?;
        *slot = u8::try_from(v).map_err(|_| ConfigError::InvalidNumber {
            attribute: "math_unit_lookup_table",
            value: token.to_string(),
        })?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(bitwidth: &str) -> AluAttributes {
        AluAttributes {
            reg: "r".to_string(),
            bitwidth: bitwidth.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = AluConfig::from_attributes(&attrs("32")).unwrap();
        assert!(!cfg.dual_width);
        assert!(!cfg.master);
        assert_eq!(cfg.bitwidth, 32);
        assert_eq!(cfg.initial_lo, 0);
        assert!(cfg.update_lo.iter().all(UpdateSlot::is_noop));
        assert!(cfg.output_dst.is_none());
        assert_eq!(cfg.logging_mode, LoggingMode::None);
        assert!(!cfg.math_unit.is_configured());
    }

    #[test]
    fn test_bool_and_int_parsing() {
        let mut a = attrs("0x10");
        a.dual_width = "True".to_string();
        a.master = "True".to_string();
        a.initial_register_lo_value = "0x5".to_string();
        a.initial_register_hi_value = "9".to_string();
        let cfg = AluConfig::from_attributes(&a).unwrap();
        assert!(cfg.dual_width && cfg.master);
        assert_eq!(cfg.bitwidth, 16);
        assert_eq!((cfg.initial_lo, cfg.initial_hi), (5, 9));
    }

    #[test]
    fn test_invalid_attributes() {
        let mut a = attrs("abc");
        assert!(matches!(
            AluConfig::from_attributes(&a),
            Err(ConfigError::InvalidNumber { attribute: "_bitwidth_", .. })
        ));

        a.bitwidth = "0".to_string();
        assert!(matches!(AluConfig::from_attributes(&a), Err(ConfigError::InvalidBitwidth(0))));

        a.bitwidth = "7".to_string();
        a.dual_width = "True".to_string();
        assert!(matches!(AluConfig::from_attributes(&a), Err(ConfigError::OddDualWidth(7))));

        let mut a = attrs("8");
        a.master = "yes".to_string();
        assert!(matches!(AluConfig::from_attributes(&a), Err(ConfigError::InvalidBool { .. })));

        let mut a = attrs("8");
        a.stateful_logging_mode = "sometimes".to_string();
        assert!(matches!(
            AluConfig::from_attributes(&a),
            Err(ConfigError::UnknownLoggingMode(_))
        ));

        let mut a = attrs("8");
        a.condition_lo = "register_lo +".to_string();
        assert!(matches!(
            AluConfig::from_attributes(&a),
            Err(ConfigError::Expression { attribute: "condition_lo", .. })
        ));
    }

    #[test]
    fn test_lookup_table() {
        let mut a = attrs("32");
        a.math_unit_lookup_table = "1 2 3".to_string();
        assert!(matches!(AluConfig::from_attributes(&a), Err(ConfigError::LookupTableSize(3))));

        a.math_unit_lookup_table = (0..16).map(|i| format!("0x{:x}", i * 16)).collect::<Vec<_>>().join(" ");
        let cfg = AluConfig::from_attributes(&a).unwrap();
        assert_eq!(cfg.math_unit.lookup_table[15], 0xF0);
        assert!(cfg.math_unit.is_configured());

        a.math_unit_lookup_table = (0..16).map(|_| "256").collect::<Vec<_>>().join(" ");
        assert!(matches!(AluConfig::from_attributes(&a), Err(ConfigError::InvalidNumber { .. })));
    }

    #[test]
    fn test_logging_modes() {
        assert_eq!(LoggingMode::parse("table_hit").unwrap(), LoggingMode::TableHit);
        assert_eq!(LoggingMode::parse("table_miss").unwrap(), LoggingMode::TableMiss);
        assert_eq!(LoggingMode::parse("gateway_inhibit").unwrap(), LoggingMode::GatewayInhibit);
        assert_eq!(LoggingMode::parse("address").unwrap(), LoggingMode::Address);
    }

    #[test]
    fn test_dual_width_pack_round_trip() {
        let mut a = attrs("8");
        a.dual_width = "True".to_string();
        let cfg = AluConfig::from_attributes(&a).unwrap();
        let word = cfg.pack(5, 9);
        assert_eq!(word, 0x95);
        assert_eq!(cfg.unpack(word), (5, 9));

        // Halves are truncated to 4 bits
        assert_eq!(cfg.pack(0x1F, 0), 0x0F);
    }

    #[test]
    fn test_single_bit_aliases() {
        let mut a = attrs("1");
        a.update_lo_1_value = "read_bitc".to_string();
        a.output_value = "alu_lo | register_lo".to_string();
        let cfg = AluConfig::from_attributes(&a).unwrap();
        assert!(cfg.is_single_bit());
        assert_eq!(cfg.to_string(), "1b single-bit");
    }

    #[test]
    fn test_slot_holds_rules() {
        use crate::device::PhvLayout;
        use std::sync::Arc;

        let phv = Phv::new(Arc::new(PhvLayout::new()));
        let conds = condition_locals();
        let regs = register_locals();

        let noop = UpdateSlot::default();
        assert!(!noop.holds(&phv, &[1, 1]).unwrap());

        let always = UpdateSlot {
            predicate: Expression::default(),
            value: Expression::parse("register_lo + 1", &regs).unwrap(),
        };
        assert!(always.holds(&phv, &[0, 0]).unwrap());

        let gated = UpdateSlot {
            predicate: Expression::parse("condition_lo && !condition_hi", &conds).unwrap(),
            value: Expression::default(),
        };
        assert!(gated.holds(&phv, &[1, 0]).unwrap());
        assert!(!gated.holds(&phv, &[1, 1]).unwrap());
    }
}
