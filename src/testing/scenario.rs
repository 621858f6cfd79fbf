//! Scenario runner: scripted control-plane and packet steps against a
//! loaded pipeline, with expectations checked along the way.
//!
//! # Example Scenario
//!
//! ```toml
//! [scenario]
//! name = "deactivate_backend"
//! program = "load_balancer.toml"   # relative to this file
//!
//! [[step]]
//! action = "add_member"
//! table = "lb"
//! group = "web"
//! member = "backend_a"
//!
//! [[step]]
//! action = "packet"
//! fields = { "meta.member_index" = 0 }
//!
//! [[step]]
//! action = "select"
//! table = "lb"
//! group = "web"
//! hash = 7
//! expect = "backend_b"
//!
//! [[step]]
//! action = "expect_register"
//! register = "lb_bits"
//! index = 0
//! value = 0
//! ```
//!
//! Group and member names are scenario-local. The runner creates the
//! handles in the table's action profile the first time a name appears in
//! an `add_member` step.

use crate::alu::{AluError, ConfigError};
use crate::config::Config;
use crate::device::DeviceError;
use crate::pipeline::{Pipeline, PipelineError, SelectorTable};
use crate::program::{Program, ProgramError};
use crate::selector::{GrpHdl, MbrHdl, MembershipError};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// A scenario file.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub scenario: ScenarioInfo,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

/// Scenario metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioInfo {
    pub name: String,
    /// Program path, relative to the scenario file.
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// One scripted step.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Process one packet and check output fields.
    Packet {
        #[serde(default)]
        entry_index: usize,
        #[serde(default)]
        fields: BTreeMap<String, u64>,
        #[serde(default)]
        expect: BTreeMap<String, u64>,
    },
    /// Process `count` identical packets concurrently.
    Burst {
        count: usize,
        #[serde(default)]
        entry_index: usize,
        #[serde(default)]
        fields: BTreeMap<String, u64>,
        #[serde(default)]
        workers: Option<usize>,
    },
    AddMember { table: String, group: String, member: String },
    RemoveMember { table: String, group: String, member: String },
    Activate { table: String, group: String, member: String },
    Deactivate { table: String, group: String, member: String },
    /// Forget all memberships of a table.
    Reset { table: String },
    /// Select a member for a hash value.
    Select {
        table: String,
        group: String,
        hash: u64,
        #[serde(default)]
        expect: Option<String>,
    },
    /// Check a register cell. `lo`/`hi` split it with the named ALU's
    /// configuration.
    ExpectRegister {
        register: String,
        index: usize,
        #[serde(default)]
        value: Option<u64>,
        #[serde(default)]
        alu: Option<String>,
        #[serde(default)]
        lo: Option<u64>,
        #[serde(default)]
        hi: Option<u64>,
    },
    ExpectAssignedIndex {
        table: String,
        group: String,
        member: String,
        index: u32,
    },
}

impl Step {
    /// Action name as written in the scenario.
    pub fn action(&self) -> &'static str {
        match self {
            Step::Packet { .. } => "packet",
            Step::Burst { .. } => "burst",
            Step::AddMember { .. } => "add_member",
            Step::RemoveMember { .. } => "remove_member",
            Step::Activate { .. } => "activate",
            Step::Deactivate { .. } => "deactivate",
            Step::Reset { .. } => "reset",
            Step::Select { .. } => "select",
            Step::ExpectRegister { .. } => "expect_register",
            Step::ExpectAssignedIndex { .. } => "expect_assigned_index",
        }
    }
}

/// Errors that prevent a scenario from starting.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("scenario names no program and none is configured")]
    MissingProgram,
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("invalid program: {0}")]
    Config(#[from] ConfigError),
}

/// Errors that fail a single step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Alu(#[from] AluError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },
    #[error("table '{0}' has no group membership manager")]
    NoMembership(String),
    #[error("{what}: expected {expected}, got {actual}")]
    Mismatch {
        what: String,
        expected: String,
        actual: String,
    },
}

/// Outcome of one executed step.
#[derive(Debug)]
pub struct StepOutcome {
    pub index: usize,
    pub action: &'static str,
    pub detail: String,
}

/// Result of running a scenario.
#[derive(Debug)]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    /// Steps that completed, in order.
    pub steps: Vec<StepOutcome>,
    pub total_steps: usize,
    /// The failing step and why.
    pub failure: Option<(usize, String)>,
}

impl Scenario {
    /// Load a scenario from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Parse a scenario from TOML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ScenarioError> {
        Ok(toml::from_str(content)?)
    }
}

/// Scenario-local names for group and member handles.
#[derive(Default)]
struct Handles {
    groups: HashMap<(String, String), GrpHdl>,
    members: HashMap<(String, String), MbrHdl>,
}

impl Handles {
    fn group(&self, table: &str, name: &str) -> Result<GrpHdl, StepError> {
        self.groups
            .get(&(table.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| StepError::Unknown {
                kind: "group",
                name: name.to_string(),
            })
    }

    fn member(&self, table: &str, name: &str) -> Result<MbrHdl, StepError> {
        self.members
            .get(&(table.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| StepError::Unknown {
                kind: "member",
                name: name.to_string(),
            })
    }

    fn member_name(&self, table: &str, mbr: MbrHdl) -> String {
        self.members
            .iter()
            .find(|(key, h)| key.0 == table && **h == mbr)
            .map(|(key, _)| key.1.clone())
            .unwrap_or_else(|| format!("#{}", mbr))
    }
}

/// Runs scenarios against pipelines.
pub struct ScenarioRunner {
    workers: usize,
}

impl ScenarioRunner {
    /// Create a runner using the configured worker count.
    pub fn new() -> Self {
        Self {
            workers: Config::get().workers(),
        }
    }

    /// Override the worker count for bursts.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Load a scenario file and its program, then run it.
    ///
    /// `program_override` takes precedence over the scenario's own program,
    /// which in turn takes precedence over the configured default.
    pub fn run_file(
        &self,
        path: &Path,
        program_override: Option<&Path>,
    ) -> Result<(Pipeline, ScenarioResult), ScenarioError> {
        let scenario = Scenario::from_file(path)?;
        let program_path = match (program_override, &scenario.scenario.program) {
            (Some(p), _) => p.to_path_buf(),
            (None, Some(rel)) => path.parent().unwrap_or(Path::new(".")).join(rel),
            (None, None) => Config::get()
                .program_path()
                .ok_or(ScenarioError::MissingProgram)?,
        };
        let program = Program::from_file(&program_path)?;
        let pipeline = Pipeline::load(&program)?;
        let result = self.run(&scenario, &pipeline);
        Ok((pipeline, result))
    }

    /// Run every step in order, stopping at the first failure.
    pub fn run(&self, scenario: &Scenario, pipeline: &Pipeline) -> ScenarioResult {
        let mut handles = Handles::default();
        let mut result = ScenarioResult {
            name: scenario.scenario.name.clone(),
            passed: false,
            steps: Vec::with_capacity(scenario.steps.len()),
            total_steps: scenario.steps.len(),
            failure: None,
        };

        for (index, step) in scenario.steps.iter().enumerate() {
            match self.run_step(step, pipeline, &mut handles) {
                Ok(detail) => {
                    log::debug!("step {} ({}): {}", index, step.action(), detail);
                    result.steps.push(StepOutcome {
                        index,
                        action: step.action(),
                        detail,
                    });
                }
                Err(e) => {
                    log::error!("step {} ({}) failed: {}", index, step.action(), e);
                    result.failure = Some((index, e.to_string()));
                    return result;
                }
            }
        }

        result.passed = true;
        result
    }

    fn run_step(
        &self,
        step: &Step,
        pipeline: &Pipeline,
        handles: &mut Handles,
    ) -> Result<String, StepError> {
        match step {
            Step::Packet {
                entry_index,
                fields,
                expect,
            } => {
                let mut pkt = pipeline.new_packet(*entry_index);
                for (name, value) in fields {
                    pkt.phv.set(name, *value)?;
                }
                pipeline.process_packet(&mut pkt)?;
                for (name, expected) in expect {
                    let actual = pkt.phv.get(name)?;
                    check(name, *expected, actual)?;
                }
                Ok(format!("packet {} processed", pkt.id))
            }

            Step::Burst {
                count,
                entry_index,
                fields,
                workers,
            } => {
                let mut packets = Vec::with_capacity(*count);
                for _ in 0..*count {
                    let mut pkt = pipeline.new_packet(*entry_index);
                    for (name, value) in fields {
                        pkt.phv.set(name, *value)?;
                    }
                    packets.push(pkt);
                }
                let workers = workers.unwrap_or(self.workers);
                pipeline.process_batch(&mut packets, workers)?;
                Ok(format!("{} packets on {} workers", count, workers))
            }

            Step::AddMember {
                table,
                group,
                member,
            } => {
                let t = lookup_table(pipeline, table)?;
                let profile = t.action_profile();
                let key = |name: &str| (table.clone(), name.to_string());
                let grp = *handles
                    .groups
                    .entry(key(group.as_str()))
                    .or_insert_with(|| profile.create_group());
                let mbr = *handles
                    .members
                    .entry(key(member.as_str()))
                    .or_insert_with(|| profile.create_member());
                profile.add_member_to_group(grp, mbr)?;
                Ok(format!("{} added to {}", member, group))
            }

            Step::RemoveMember {
                table,
                group,
                member,
            } => {
                let t = lookup_table(pipeline, table)?;
                let grp = handles.group(table, group)?;
                let mbr = handles.member(table, member)?;
                t.action_profile().remove_member_from_group(grp, mbr)?;
                Ok(format!("{} removed from {}", member, group))
            }

            Step::Activate {
                table,
                group,
                member,
            }
            | Step::Deactivate {
                table,
                group,
                member,
            } => {
                let t = lookup_table(pipeline, table)?;
                let control = t
                    .group_membership()
                    .ok_or_else(|| StepError::NoMembership(table.clone()))?;
                let grp = handles.group(table, group)?;
                let mbr = handles.member(table, member)?;
                if matches!(step, Step::Activate { .. }) {
                    control.activate_member(grp, mbr)?;
                    Ok(format!("{} activated", member))
                } else {
                    control.deactivate_member(grp, mbr)?;
                    Ok(format!("{} deactivated", member))
                }
            }

            Step::Reset { table } => {
                lookup_table(pipeline, table)?.action_profile().reset();
                Ok(format!("{} reset", table))
            }

            Step::Select {
                table,
                group,
                hash,
                expect,
            } => {
                let t = lookup_table(pipeline, table)?;
                let grp = handles.group(table, group)?;
                let mbr = t.action_profile().select(grp, *hash)?;
                let selected = handles.member_name(table, mbr);
                if let Some(expected) = expect {
                    if *expected != selected {
                        return Err(StepError::Mismatch {
                            what: format!("select({}, {})", group, hash),
                            expected: expected.clone(),
                            actual: selected,
                        });
                    }
                }
                Ok(format!("hash {} -> {}", hash, selected))
            }

            Step::ExpectRegister {
                register,
                index,
                value,
                alu,
                lo,
                hi,
            } => {
                let reg = pipeline.register(register).ok_or_else(|| StepError::Unknown {
                    kind: "register",
                    name: register.clone(),
                })?;
                let cells = reg.snapshot();
                let word = *cells.get(*index).ok_or_else(|| StepError::Unknown {
                    kind: "register index",
                    name: format!("{}[{}]", register, index),
                })?;
                let what = format!("{}[{}]", register, index);
                if let Some(expected) = value {
                    check(&what, *expected, word)?;
                }
                if lo.is_some() || hi.is_some() {
                    let alu_name = alu.as_deref().unwrap_or_default();
                    let alu = pipeline.stateful_alu(alu_name).ok_or_else(|| StepError::Unknown {
                        kind: "stateful_alu",
                        name: alu_name.to_string(),
                    })?;
                    let (actual_lo, actual_hi) = alu.config().unpack(word);
                    if let Some(expected) = lo {
                        check(&format!("{}.lo", what), *expected, actual_lo)?;
                    }
                    if let Some(expected) = hi {
                        check(&format!("{}.hi", what), *expected, actual_hi)?;
                    }
                }
                Ok(format!("{} = {:#x}", what, word))
            }

            Step::ExpectAssignedIndex {
                table,
                group,
                member,
                index,
            } => {
                let t = lookup_table(pipeline, table)?;
                let control = t
                    .group_membership()
                    .ok_or_else(|| StepError::NoMembership(table.clone()))?;
                let grp = handles.group(table, group)?;
                let mbr = handles.member(table, member)?;
                let actual = control.get_assigned_index(grp, mbr)?;
                check(&format!("index of {}", member), *index as u64, actual as u64)?;
                Ok(format!("{} at index {}", member, actual))
            }
        }
    }
}

impl Default for ScenarioRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup_table<'a>(pipeline: &'a Pipeline, name: &str) -> Result<&'a Arc<SelectorTable>, StepError> {
    pipeline.selector_table(name).ok_or_else(|| StepError::Unknown {
        kind: "selector table",
        name: name.to_string(),
    })
}

fn check(what: &str, expected: u64, actual: u64) -> Result<(), StepError> {
    if expected == actual {
        return Ok(());
    }
    Err(StepError::Mismatch {
        what: what.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    })
}
