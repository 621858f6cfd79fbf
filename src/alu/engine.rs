//! Per-packet stateful ALU execution.

use super::attributes::{AluAttributes, AluConfig, UpdateSlot};
use super::{AluError, ConfigError};
use crate::device::{NamedCalculation, Packet, Phv, RegisterArray, RegisterGuard};
use crate::expr::ExprError;
use crate::pipeline::{P4Objects, SelectorTable};
use crate::selector::{GroupMembershipMgr, GroupSelector};
use std::sync::Arc;

/// Predicate code handed to the output expression.
///
/// 8: both conditions, 4: `condition_hi` only, 2: `condition_lo` only,
/// 1: neither.
#[inline]
pub fn predicate_code(cond_hi: bool, cond_lo: bool) -> i64 {
    match (cond_hi, cond_lo) {
        (true, true) => 8,
        (true, false) => 4,
        (false, true) => 2,
        (false, false) => 1,
    }
}

/// One stateful ALU instance.
pub struct StatefulAlu {
    id: usize,
    name: String,
    config: AluConfig,
    register: Arc<RegisterArray>,
    selector_binding: Option<Arc<SelectorTable>>,
    membership: Option<Arc<GroupMembershipMgr>>,
}

impl StatefulAlu {
    /// Build an instance from its attribute block.
    ///
    /// Resolves the register and selector binding against `objects`, fills
    /// every register cell with the initial value, and, for the master of a
    /// selector binding, installs a group membership manager in the bound
    /// table's action profile.
    pub fn init(
        id: usize,
        name: &str,
        attrs: &AluAttributes,
        objects: &P4Objects,
    ) -> Result<Self, ConfigError> {
        let config = AluConfig::from_attributes(attrs)?;

        let reg_name = attrs.reg.trim();
        if reg_name.is_empty() {
            return Err(ConfigError::MissingAttribute("reg"));
        }
        let register = objects
            .register(reg_name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownRegister(reg_name.to_string()))?;
        if config.bitwidth > register.bitwidth() {
            return Err(ConfigError::BitwidthExceedsRegister {
                bitwidth: config.bitwidth,
                register: register.name().to_string(),
                register_bitwidth: register.bitwidth(),
            });
        }

        let mut selector_binding = None;
        let mut membership = None;
        let binding = attrs.selector_binding.trim();
        if !binding.is_empty() {
            let table = objects
                .selector_table(binding)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownSelectorTable(binding.to_string()))?;
            if config.master {
                let mgr = Arc::new(GroupMembershipMgr::new(register.clone()));
                table
                    .action_profile()
                    .set_group_selector(GroupSelector::Membership(mgr.clone()));
                log::info!(
                    "{}: group membership for '{}' stored in register '{}'",
                    name,
                    table.name(),
                    register.name()
                );
                membership = Some(mgr);
            }
            selector_binding = Some(table);
        }

        if config.math_unit.is_configured() {
            log::warn!("{}: math unit configured but not modelled; ignoring it", name);
        }
        if config.logging_mode != super::LoggingMode::None {
            log::warn!(
                "{}: stateful logging mode {:?} is not modelled",
                name,
                config.logging_mode
            );
        }

        let alu = Self {
            id,
            name: name.to_string(),
            config,
            register,
            selector_binding,
            membership,
        };

        let initial = alu.config.pack(alu.config.initial_lo, alu.config.initial_hi);
        {
            let mut cells = alu.register.lock();
            for index in 0..cells.size() {
                cells.set(index, initial);
            }
        }
        log::info!("{}: {} on '{}'", alu.name, alu.config, alu.register.name());

        Ok(alu)
    }

    /// Pipeline-assigned instance id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validated configuration.
    pub fn config(&self) -> &AluConfig {
        &self.config
    }

    /// Backing register array.
    pub fn register(&self) -> &Arc<RegisterArray> {
        &self.register
    }

    /// Whether this instance owns the selector group membership.
    pub fn is_master(&self) -> bool {
        self.config.master
    }

    /// Whether this instance is bound to a selector table.
    pub fn is_bound_to_selector(&self) -> bool {
        self.selector_binding.is_some()
    }

    /// Bound selector table, if any.
    pub fn selector_binding(&self) -> Option<&Arc<SelectorTable>> {
        self.selector_binding.as_ref()
    }

    /// Membership manager; `None` unless this is a selector-bound master.
    pub fn group_membership_mgr(&self) -> Option<&Arc<GroupMembershipMgr>> {
        self.membership.as_ref()
    }

    // ------------------------------------------------------------------
    // Packet entry points
    // ------------------------------------------------------------------

    /// `execute_stateful_alu_w_index`: run on an explicit index.
    pub fn execute_with_index(&self, pkt: &mut Packet, index: u64) -> Result<(), AluError> {
        self.execute(pkt, index)
    }

    /// `execute_stateful_alu`: run on the packet's table-entry index.
    pub fn execute_with_entry_index(&self, pkt: &mut Packet) -> Result<(), AluError> {
        let index = pkt.entry_index as u64;
        self.execute(pkt, index)
    }

    /// `execute_stateful_alu_from_hash`: run on `hash(packet) % size`.
    pub fn execute_from_hash(
        &self,
        pkt: &mut Packet,
        hash: &NamedCalculation,
    ) -> Result<(), AluError> {
        let size = self.register.size() as u64;
        let index = hash.output(pkt)? % size.max(1);
        self.execute(pkt, index)
    }

    /// `execute_stateful_log`: not implemented.
    pub fn execute_stateful_log(&self, _pkt: &mut Packet) -> Result<(), AluError> {
        Err(AluError::Unimplemented("execute_stateful_log"))
    }

    fn execute(&self, pkt: &mut Packet, index: u64) -> Result<(), AluError> {
        let size = self.register.size();
        if index >= size as u64 {
            return Err(AluError::IndexOutOfRange {
                alu: self.name.clone(),
                index,
                size,
            });
        }
        if !pkt.mark_executed(self.id) {
            return Err(AluError::AlreadyExecuted {
                alu: self.name.clone(),
                packet: pkt.id,
            });
        }

        // This register is never a parameter of the calling action, so the
        // lock is not already held by this thread.
        let mut cells = self.register.lock();
        log::trace!("{}: packet {} index {}", self.name, pkt.id, index);
        if self.config.is_single_bit() {
            self.execute_single_bit(pkt, &mut cells, index as usize)
        } else {
            self.execute_general(pkt, &mut cells, index as usize)
        }
    }

    fn execute_general(
        &self,
        pkt: &mut Packet,
        cells: &mut RegisterGuard<'_>,
        index: usize,
    ) -> Result<(), AluError> {
        let cfg = &self.config;
        let (lo, hi) = cfg.unpack(cells.at(index));
        let registers = [lo as i64, hi as i64];

        let phv = &pkt.phv;
        let cond_lo = cfg.condition_lo.eval_bool(phv, &registers)?;
        let cond_hi = cfg.condition_hi.eval_bool(phv, &registers)?;
        let conditions = [cond_lo as i64, cond_hi as i64];

        let new_lo = update_half(&cfg.update_lo, lo, phv, &conditions, &registers)?;
        let new_hi = update_half(&cfg.update_hi, hi, phv, &conditions, &registers)?;
        let word = cfg.pack(new_lo, new_hi);
        let (alu_lo, alu_hi) = cfg.unpack(word);

        let output = match &cfg.output_dst {
            Some(dst) if cfg.output.holds(phv, &conditions)? => {
                let locals = [
                    alu_lo as i64,
                    alu_hi as i64,
                    lo as i64,
                    hi as i64,
                    predicate_code(cond_hi, cond_lo),
                    1,
                ];
                Some((dst, cfg.output.value.eval_arith(phv, &locals)?))
            }
            _ => None,
        };
        if let Some((dst, value)) = output {
            self.write_output(&mut pkt.phv, dst, value)?;
        }

        cells.set(index, word);
        log::trace!(
            "{}: [{}] lo {} -> {}, hi {} -> {}",
            self.name,
            index,
            lo,
            alu_lo,
            hi,
            alu_hi
        );
        Ok(())
    }

    fn execute_single_bit(
        &self,
        pkt: &mut Packet,
        cells: &mut RegisterGuard<'_>,
        index: usize,
    ) -> Result<(), AluError> {
        let cfg = &self.config;
        let bit = cells.at(index);
        if bit > 1 {
            return Err(AluError::InvalidSingleBit {
                alu: self.name.clone(),
                index,
                value: bit,
            });
        }
        let bit = bit as i64;
        let update = &cfg.update_lo[0].value;

        // alu_lo, alu_hi, set_bit, set_bitc, clr_bit, clr_bitc, read_bit, read_bitc
        let locals = [0, 0, 1, 1, 0, 0, bit, bit];
        let new_bit = update.eval_arith(&pkt.phv, &locals)?;
        cells.set(index, cfg.pack(new_bit as u64, 0));

        if let Some(dst) = &cfg.output_dst {
            let cbit = 1 - bit;
            let mut locals = [0, 0, bit, cbit, bit, cbit, bit, cbit];
            locals[0] = update.eval_arith(&pkt.phv, &locals)?;
            // register_lo shares slot 2 and reads the pre-update bit
            locals[2] = bit;
            let value = cfg.output.value.eval_arith(&pkt.phv, &locals)?;
            self.write_output(&mut pkt.phv, dst, value)?;
        }

        log::trace!("{}: [{}] bit {} -> {}", self.name, index, bit, cells.at(index));
        Ok(())
    }

    /// Write an output value, honoring the reduction-or group.
    fn write_output(&self, phv: &mut Phv, dst: &str, value: i64) -> Result<(), AluError> {
        let value = value as u64;
        match &self.config.reduction_or_group {
            None => phv.set(dst, value)?,
            Some(scratch) => {
                if phv.get(scratch)? == 0 {
                    phv.set(scratch, 1)?;
                    phv.set(dst, value)?;
                } else {
                    let current = phv.get(dst)?;
                    phv.set(dst, current | value)?;
                }
            }
        }
        Ok(())
    }
}

/// Compute one register half from its two update slots.
///
/// If neither slot fires the half passes through unchanged; otherwise the
/// fired values are ORed, with a non-firing slot counted as 0.
fn update_half(
    slots: &[UpdateSlot; 2],
    current: u64,
    phv: &Phv,
    conditions: &[i64],
    registers: &[i64],
) -> Result<u64, ExprError> {
    let fired_1 = slots[0].holds(phv, conditions)?;
    let fired_2 = slots[1].holds(phv, conditions)?;
    if !fired_1 && !fired_2 {
        return Ok(current);
    }
    let v1 = if fired_1 { slots[0].value.eval_arith(phv, registers)? } else { 0 };
    let v2 = if fired_2 { slots[1].value.eval_arith(phv, registers)? } else { 0 };
    Ok((v1 | v2) as u64)
}

impl std::fmt::Debug for StatefulAlu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulAlu")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("register", &self.register.name())
            .field("config", &self.config.to_string())
            .field("selector_binding", &self.selector_binding.as_ref().map(|t| t.name()))
            .finish()
    }
}
