//! Host pipeline: the objects a program declares, wired together.
//!
//! [`Pipeline::load`] builds, in order:
//!
//! 1. register arrays
//! 2. the PHV layout, plus one 1-bit scratch field per reduction-or group
//! 3. hash calculations
//! 4. selector tables
//! 5. extern instances, in declaration order (this fills registers with
//!    initial values and installs membership managers into bound tables)
//! 6. the control sequence
//!
//! Any configuration error aborts the load; no partially configured
//! instance is ever returned.
//!
//! # Packet Processing
//!
//! [`Pipeline::process_packet`] runs the control sequence in declaration
//! order. Independent packets may run concurrently
//! ([`Pipeline::process_batch`]); they serialize only on the register
//! arrays they touch.

pub mod externs;
pub mod table;

pub use externs::{ExternInstance, ExternRegistry, STATEFUL_ALU};
pub use table::{ActionProfile, SelectorTable};

use crate::alu::{AluError, ConfigError, StatefulAlu};
use crate::device::{
    NamedCalculation, Packet, PhvLayout, RegisterArray, MAX_REGISTER_BITWIDTH,
};
use crate::program::{ControlMethod, Program};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while processing packets.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stateful ALU failed on a packet.
    #[error("packet {packet}: {source}")]
    Packet {
        /// Packet id.
        packet: u64,
        /// ALU error.
        #[source]
        source: AluError,
    },

    /// The worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Named objects declared by a program.
#[derive(Debug, Default)]
pub struct P4Objects {
    layout: Arc<PhvLayout>,
    registers: BTreeMap<String, Arc<RegisterArray>>,
    hashes: BTreeMap<String, Arc<NamedCalculation>>,
    tables: BTreeMap<String, Arc<SelectorTable>>,
}

impl P4Objects {
    /// Create an empty object set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a PHV field. Returns `false` if it already exists.
    pub fn declare_field(&mut self, name: &str, bitwidth: usize) -> bool {
        Arc::make_mut(&mut self.layout).declare(name, bitwidth)
    }

    /// Add a register array.
    pub fn add_register(&mut self, register: RegisterArray) -> Result<Arc<RegisterArray>, ConfigError> {
        if register.size() == 0 {
            return Err(ConfigError::EmptyRegister(register.name().to_string()));
        }
        insert_unique(&mut self.registers, "register", register.name().to_string(), Arc::new(register))
    }

    /// Add a hash calculation.
    pub fn add_hash(&mut self, hash: NamedCalculation) -> Result<Arc<NamedCalculation>, ConfigError> {
        insert_unique(&mut self.hashes, "hash", hash.name().to_string(), Arc::new(hash))
    }

    /// Add a selector table.
    pub fn add_selector_table(&mut self, table: SelectorTable) -> Result<Arc<SelectorTable>, ConfigError> {
        insert_unique(&mut self.tables, "selector table", table.name().to_string(), Arc::new(table))
    }

    /// PHV layout.
    pub fn layout(&self) -> &PhvLayout {
        &self.layout
    }

    /// Shared PHV layout, for creating packets.
    pub fn layout_arc(&self) -> Arc<PhvLayout> {
        self.layout.clone()
    }

    /// Register array by name.
    pub fn register(&self, name: &str) -> Option<&Arc<RegisterArray>> {
        self.registers.get(name)
    }

    /// All register arrays, by name.
    pub fn registers(&self) -> impl Iterator<Item = &Arc<RegisterArray>> {
        self.registers.values()
    }

    /// Hash calculation by name.
    pub fn hash(&self, name: &str) -> Option<&Arc<NamedCalculation>> {
        self.hashes.get(name)
    }

    /// Selector table by name.
    pub fn selector_table(&self, name: &str) -> Option<&Arc<SelectorTable>> {
        self.tables.get(name)
    }

    /// All selector tables, by name.
    pub fn selector_tables(&self) -> impl Iterator<Item = &Arc<SelectorTable>> {
        self.tables.values()
    }
}

fn insert_unique<T>(
    map: &mut BTreeMap<String, Arc<T>>,
    kind: &'static str,
    name: String,
    value: Arc<T>,
) -> Result<Arc<T>, ConfigError> {
    if map.contains_key(&name) {
        return Err(ConfigError::Duplicate { kind, name });
    }
    map.insert(name, value.clone());
    Ok(value)
}

fn check_bitwidth(bitwidth: usize) -> Result<(), ConfigError> {
    if bitwidth == 0 || bitwidth > MAX_REGISTER_BITWIDTH {
        return Err(ConfigError::InvalidBitwidth(bitwidth as i64));
    }
    Ok(())
}

/// A resolved control-sequence call.
#[derive(Debug, Clone)]
enum Call {
    Index(u64),
    IndexField(String),
    EntryIndex,
    Hash(Arc<NamedCalculation>),
    StatefulLog,
}

#[derive(Debug, Clone)]
struct ControlStep {
    alu: Arc<StatefulAlu>,
    call: Call,
}

/// A loaded program, ready to process packets.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    objects: P4Objects,
    externs: ExternRegistry,
    control: Vec<ControlStep>,
    next_packet: AtomicU64,
}

impl Pipeline {
    /// Build a pipeline from a program description.
    pub fn load(program: &Program) -> Result<Self, ConfigError> {
        let mut objects = P4Objects::new();

        for decl in &program.registers {
            check_bitwidth(decl.bitwidth)?;
            objects.add_register(RegisterArray::new(&decl.name, decl.size, decl.bitwidth))?;
        }

        for decl in &program.fields {
            check_bitwidth(decl.bitwidth)?;
            if !objects.declare_field(&decl.name, decl.bitwidth) {
                return Err(ConfigError::Duplicate {
                    kind: "field",
                    name: decl.name.clone(),
                });
            }
        }
        for decl in &program.externs {
            let group = decl.attributes.reduction_or_group.trim();
            if !group.is_empty() && objects.declare_field(group, 1) {
                log::debug!("declared reduction-or scratch field '{}'", group);
            }
        }

        for decl in &program.hashes {
            for field in &decl.fields {
                if !objects.layout().contains(field) {
                    return Err(ConfigError::UnknownField {
                        context: format!("hash '{}'", decl.name),
                        field: field.clone(),
                    });
                }
            }
            objects.add_hash(NamedCalculation::new(&decl.name, decl.algorithm, decl.fields.clone()))?;
        }

        for decl in &program.selector_tables {
            objects.add_selector_table(SelectorTable::new(&decl.name, decl.profile_name()))?;
        }

        let mut externs = ExternRegistry::new();
        for decl in &program.externs {
            let instance = externs.instantiate(&decl.type_name, &decl.name, &decl.attributes, &objects)?;
            if let Some(alu) = instance.as_stateful_alu() {
                check_field_references(alu, objects.layout()).map_err(|e| ConfigError::Instance {
                    name: decl.name.clone(),
                    source: Box::new(e),
                })?;
            }
        }

        let mut control = Vec::with_capacity(program.control.len());
        for call in &program.control {
            let alu = externs
                .stateful_alu(&call.alu)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownAlu(call.alu.clone()))?;
            if control.iter().any(|s: &ControlStep| Arc::ptr_eq(&s.alu, &alu)) {
                log::warn!(
                    "'{}' appears more than once in the control sequence; packets will fail on the second call",
                    call.alu
                );
            }
            let call = resolve_call(&call.method, &objects)?;
            control.push(ControlStep { alu, call });
        }

        log::info!(
            "Loaded pipeline '{}': {} registers, {} fields, {} externs, {} control steps",
            program.name,
            objects.registers.len(),
            objects.layout().fields().len(),
            externs.len(),
            control.len()
        );

        Ok(Self {
            name: program.name.clone(),
            objects,
            externs,
            control,
            next_packet: AtomicU64::new(0),
        })
    }

    /// Program name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared objects.
    pub fn objects(&self) -> &P4Objects {
        &self.objects
    }

    /// Extern instances.
    pub fn externs(&self) -> &ExternRegistry {
        &self.externs
    }

    /// Register array by name.
    pub fn register(&self, name: &str) -> Option<&Arc<RegisterArray>> {
        self.objects.register(name)
    }

    /// Selector table by name.
    pub fn selector_table(&self, name: &str) -> Option<&Arc<SelectorTable>> {
        self.objects.selector_table(name)
    }

    /// Hash calculation by name.
    pub fn hash(&self, name: &str) -> Option<&Arc<NamedCalculation>> {
        self.objects.hash(name)
    }

    /// Stateful ALU by name.
    pub fn stateful_alu(&self, name: &str) -> Option<&Arc<StatefulAlu>> {
        self.externs.stateful_alu(name)
    }

    /// Number of control-sequence steps.
    pub fn control_len(&self) -> usize {
        self.control.len()
    }

    /// Create a packet with a fresh id and a zeroed PHV.
    pub fn new_packet(&self, entry_index: usize) -> Packet {
        let id = self.next_packet.fetch_add(1, Ordering::Relaxed);
        Packet::new(id, entry_index, self.objects.layout_arc())
    }

    /// Run the control sequence on one packet.
    pub fn process_packet(&self, pkt: &mut Packet) -> Result<(), AluError> {
        for step in &self.control {
            match &step.call {
                Call::Index(index) => step.alu.execute_with_index(pkt, *index)?,
                Call::IndexField(field) => {
                    let index = pkt.phv.get(field)?;
                    step.alu.execute_with_index(pkt, index)?
                }
                Call::EntryIndex => step.alu.execute_with_entry_index(pkt)?,
                Call::Hash(hash) => step.alu.execute_from_hash(pkt, hash)?,
                Call::StatefulLog => step.alu.execute_stateful_log(pkt)?,
            }
        }
        Ok(())
    }

    /// Process independent packets on a pool of `workers` threads.
    ///
    /// Stops at the first failing packet.
    pub fn process_batch(&self, packets: &mut [Packet], workers: usize) -> Result<(), PipelineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()?;
        log::debug!("processing {} packets on {} workers", packets.len(), pool.current_num_threads());
        pool.install(|| {
            packets.par_iter_mut().try_for_each(|pkt| {
                self.process_packet(pkt).map_err(|source| PipelineError::Packet {
                    packet: pkt.id,
                    source,
                })
            })
        })
    }
}

fn resolve_call(method: &ControlMethod, objects: &P4Objects) -> Result<Call, ConfigError> {
    Ok(match method {
        ControlMethod::WithIndex { index: Some(index), index_field: None } => Call::Index(*index),
        ControlMethod::WithIndex { index: None, index_field: Some(field) } => {
            if !objects.layout().contains(field) {
                return Err(ConfigError::UnknownField {
                    context: "execute_stateful_alu_w_index".to_string(),
                    field: field.clone(),
                });
            }
            Call::IndexField(field.clone())
        }
        ControlMethod::WithIndex { .. } => return Err(ConfigError::MissingAttribute("index")),
        ControlMethod::EntryIndex => Call::EntryIndex,
        ControlMethod::FromHash { hash } => Call::Hash(
            objects
                .hash(hash)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownHash(hash.clone()))?,
        ),
        ControlMethod::StatefulLog => Call::StatefulLog,
    })
}

/// Every field an ALU's expressions and output name must be declared.
fn check_field_references(alu: &StatefulAlu, layout: &PhvLayout) -> Result<(), ConfigError> {
    let config = alu.config();
    for (attribute, expr) in config.expressions() {
        if let Some(field) = expr.fields().into_iter().find(|f| !layout.contains(f)) {
            return Err(ConfigError::UnknownField {
                context: attribute.to_string(),
                field: field.to_string(),
            });
        }
    }
    if let Some(dst) = config.output_dst.as_deref().filter(|d| !layout.contains(d)) {
        return Err(ConfigError::UnknownField {
            context: "output_dst".to_string(),
            field: dst.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: &str = r#"
name = "counter"

[[register]]
name = "counts"
size = 16
bitwidth = 32

[[field]]
name = "meta.idx"
bitwidth = 8

[[field]]
name = "meta.out"
bitwidth = 32

[[hash]]
name = "h"
algorithm = "identity"
fields = ["meta.idx"]

[[extern]]
type = "stateful_alu"
name = "count"
reg = "counts"
_bitwidth_ = "32"
update_lo_1_value = "register_lo + 1"
output_value = "alu_lo"
output_dst = "meta.out"

[[control]]
alu = "count"
method = "execute_stateful_alu_w_index"
index_field = "meta.idx"
"#;

    fn load(src: &str) -> Result<Pipeline, ConfigError> {
        Pipeline::load(&Program::from_str(src).unwrap())
    }

    #[test]
    fn test_load_and_process() {
        let pipeline = load(COUNTER).unwrap();
        assert_eq!(pipeline.name(), "counter");
        assert_eq!(pipeline.control_len(), 1);

        for expected in 1..=3 {
            let mut pkt = pipeline.new_packet(0);
            pkt.phv.set("meta.idx", 4).unwrap();
            pipeline.process_packet(&mut pkt).unwrap();
            assert_eq!(pkt.phv.get("meta.out").unwrap(), expected);
        }
        assert_eq!(pipeline.register("counts").unwrap().snapshot()[4], 3);
    }

    #[test]
    fn test_packet_ids_are_unique() {
        let pipeline = load(COUNTER).unwrap();
        let a = pipeline.new_packet(0);
        let b = pipeline.new_packet(0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_process_batch_counts_every_packet() {
        let pipeline = load(COUNTER).unwrap();
        let mut packets: Vec<Packet> = (0..400)
            .map(|i| {
                let mut pkt = pipeline.new_packet(0);
                pkt.phv.set("meta.idx", i % 2).unwrap();
                pkt
            })
            .collect();
        pipeline.process_batch(&mut packets, 4).unwrap();
        let counts = pipeline.register("counts").unwrap().snapshot();
        assert_eq!(counts[0], 200);
        assert_eq!(counts[1], 200);
    }

    #[test]
    fn test_batch_reports_failing_packet() {
        let pipeline = load(COUNTER).unwrap();
        let mut pkt = pipeline.new_packet(0);
        pkt.phv.set("meta.idx", 200).unwrap();
        let id = pkt.id;
        let err = pipeline.process_batch(std::slice::from_mut(&mut pkt), 2).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Packet { packet, source: AluError::IndexOutOfRange { index: 200, .. } }
                if packet == id
        ));
    }

    #[test]
    fn test_reduction_or_scratch_declared() {
        let src = r#"
[[register]]
name = "r"
size = 1
bitwidth = 8

[[field]]
name = "meta.out"
bitwidth = 8

[[extern]]
type = "stateful_alu"
name = "a"
reg = "r"
_bitwidth_ = "8"
output_value = "1"
output_dst = "meta.out"
reduction_or_group = "meta.or_a"

[[extern]]
type = "stateful_alu"
name = "b"
reg = "r"
_bitwidth_ = "8"
output_value = "2"
output_dst = "meta.out"
reduction_or_group = "meta.or_a"

[[control]]
alu = "a"
method = "execute_stateful_alu"

[[control]]
alu = "b"
method = "execute_stateful_alu"
"#;
        let pipeline = load(src).unwrap();
        assert_eq!(pipeline.objects().layout().field("meta.or_a").unwrap().bitwidth, 1);
        let mut pkt = pipeline.new_packet(0);
        pkt.phv.set("meta.out", 0x80).unwrap();
        pipeline.process_packet(&mut pkt).unwrap();
        assert_eq!(pkt.phv.get("meta.out").unwrap(), 3);
    }

    #[test]
    fn test_load_errors() {
        let bad_field = COUNTER.replace("output_dst = \"meta.out\"", "output_dst = \"meta.nope\"");
        let err = load(&bad_field).unwrap_err();
        assert!(matches!(
            &err,
            ConfigError::Instance { source, .. }
                if matches!(**source, ConfigError::UnknownField { .. })
        ));

        let bad_expr = COUNTER.replace("register_lo + 1", "register_lo + meta.missing");
        assert!(load(&bad_expr).is_err());

        let bad_alu = COUNTER.replace("alu = \"count\"", "alu = \"nope\"");
        assert_eq!(load(&bad_alu).unwrap_err(), ConfigError::UnknownAlu("nope".to_string()));

        let bad_index = COUNTER.replace("index_field = \"meta.idx\"", "");
        assert_eq!(load(&bad_index).unwrap_err(), ConfigError::MissingAttribute("index"));

        let empty_reg = COUNTER.replace("size = 16", "size = 0");
        assert!(matches!(load(&empty_reg), Err(ConfigError::EmptyRegister(_))));

        let bad_hash = COUNTER.replace("fields = [\"meta.idx\"]", "fields = [\"meta.zzz\"]");
        assert!(matches!(load(&bad_hash), Err(ConfigError::UnknownField { .. })));

        let bad_type = COUNTER.replace("type = \"stateful_alu\"", "type = \"counter\"");
        assert!(matches!(load(&bad_type), Err(ConfigError::UnknownExternType(_))));
    }

    #[test]
    fn test_hash_and_log_calls() {
        let src = COUNTER.replace(
            "method = \"execute_stateful_alu_w_index\"\nindex_field = \"meta.idx\"",
            "method = \"execute_stateful_alu_from_hash\"\nhash = \"h\"",
        );
        let pipeline = load(&src).unwrap();
        let mut pkt = pipeline.new_packet(0);
        pkt.phv.set("meta.idx", 21).unwrap();
        pipeline.process_packet(&mut pkt).unwrap();
        // 21 % 16
        assert_eq!(pipeline.register("counts").unwrap().snapshot()[5], 1);

        let src = COUNTER.replace(
            "method = \"execute_stateful_alu_w_index\"\nindex_field = \"meta.idx\"",
            "method = \"execute_stateful_log\"",
        );
        let pipeline = load(&src).unwrap();
        let mut pkt = pipeline.new_packet(0);
        assert_eq!(
            pipeline.process_packet(&mut pkt),
            Err(AluError::Unimplemented("execute_stateful_log"))
        );
    }
}
