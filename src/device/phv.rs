//! Packet header vector (PHV) and per-packet state.
//!
//! The pipeline declares every field once in a [`PhvLayout`]; each packet
//! gets its own [`Phv`] instance built from that layout. Writes are
//! truncated to the declared field width, the way a hardware container
//! drops high bits.
//!
//! A [`Packet`] also records which stateful ALUs already ran for it, so the
//! pipeline can enforce that each ALU executes at most once per packet.

use super::register::width_mask;
use super::DeviceError;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// A declared PHV field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Fully-qualified field name, e.g. `meta.out`.
    pub name: String,
    /// Width in bits (1..=64).
    pub bitwidth: usize,
}

/// Field declarations shared by all packets of a pipeline.
#[derive(Debug, Clone, Default)]
pub struct PhvLayout {
    fields: Vec<FieldInfo>,
    by_name: HashMap<String, usize>,
}

impl PhvLayout {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field. Re-declaring an existing name keeps the first
    /// declaration and returns `false`.
    pub fn declare(&mut self, name: impl Into<String>, bitwidth: usize) -> bool {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return false;
        }
        self.by_name.insert(name.clone(), self.fields.len());
        self.fields.push(FieldInfo {
            name,
            bitwidth: bitwidth.clamp(1, 64),
        });
        true
    }

    /// Whether a field is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Look up a field declaration.
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    /// All declared fields, in declaration order.
    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    fn slot(&self, name: &str) -> Result<usize, DeviceError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| DeviceError::UnknownField(name.to_string()))
    }
}

/// Field values of one packet.
#[derive(Debug, Clone)]
pub struct Phv {
    layout: Arc<PhvLayout>,
    values: Vec<u64>,
}

impl Phv {
    /// Create a zeroed PHV for `layout`.
    pub fn new(layout: Arc<PhvLayout>) -> Self {
        let values = vec![0; layout.fields.len()];
        Self { layout, values }
    }

    /// Layout this PHV was built from.
    pub fn layout(&self) -> &PhvLayout {
        &self.layout
    }

    /// Read a field.
    pub fn get(&self, name: &str) -> Result<u64, DeviceError> {
        Ok(self.values[self.layout.slot(name)?])
    }

    /// Write a field, truncating to its width.
    pub fn set(&mut self, name: &str, value: u64) -> Result<(), DeviceError> {
        let slot = self.layout.slot(name)?;
        self.values[slot] = value & width_mask(self.layout.fields[slot].bitwidth);
        Ok(())
    }

    /// Iterate over `(name, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.layout
            .fields
            .iter()
            .zip(self.values.iter())
            .map(|(f, &v)| (f.name.as_str(), v))
    }
}

/// One packet in flight.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet sequence number (for logging).
    pub id: u64,
    /// Index of the table entry the packet hit, used by
    /// `execute_stateful_alu`.
    pub entry_index: usize,
    /// Field values.
    pub phv: Phv,
    executed: SmallVec<[usize; 8]>,
}

impl Packet {
    /// Create a packet with a zeroed PHV.
    pub fn new(id: u64, entry_index: usize, layout: Arc<PhvLayout>) -> Self {
        Self {
            id,
            entry_index,
            phv: Phv::new(layout),
            executed: SmallVec::new(),
        }
    }

    /// Record that the ALU with `alu_id` ran for this packet.
    ///
    /// Returns `false` if it already ran.
    pub fn mark_executed(&mut self, alu_id: usize) -> bool {
        if self.executed.contains(&alu_id) {
            return false;
        }
        self.executed.push(alu_id);
        true
    }

    /// Number of ALUs executed so far for this packet.
    pub fn executed_count(&self) -> usize {
        self.executed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Arc<PhvLayout> {
        let mut layout = PhvLayout::new();
        layout.declare("meta.a", 8);
        layout.declare("meta.b", 32);
        Arc::new(layout)
    }

    #[test]
    fn test_declare_is_idempotent() {
        let mut layout = PhvLayout::new();
        assert!(layout.declare("x", 8));
        assert!(!layout.declare("x", 16));
        assert_eq!(layout.field("x").map(|f| f.bitwidth), Some(8));
    }

    #[test]
    fn test_set_truncates() {
        let mut phv = Phv::new(layout());
        phv.set("meta.a", 0x1234).unwrap();
        assert_eq!(phv.get("meta.a").unwrap(), 0x34);
        assert_eq!(phv.get("meta.b").unwrap(), 0);
    }

    #[test]
    fn test_unknown_field() {
        let phv = Phv::new(layout());
        assert!(matches!(phv.get("meta.nope"), Err(DeviceError::UnknownField(_))));
    }

    #[test]
    fn test_mark_executed_once() {
        let mut pkt = Packet::new(0, 0, layout());
        assert!(pkt.mark_executed(3));
        assert!(pkt.mark_executed(1));
        assert!(!pkt.mark_executed(3));
        assert_eq!(pkt.executed_count(), 2);
    }
}
