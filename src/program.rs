//! Program descriptions.
//!
//! A program declares everything a pipeline needs: register arrays, PHV
//! fields, hash calculations, selector tables, extern instances with their
//! attribute blocks, and the ordered control sequence run for each packet.
//!
//! # Format
//!
//! ```toml
//! name = "flow_counter"
//!
//! [[register]]
//! name = "counts"
//! size = 1024
//! bitwidth = 32
//!
//! [[field]]
//! name = "ipv4.src"
//! bitwidth = 32
//!
//! [[hash]]
//! name = "flow_hash"
//! algorithm = "crc16"
//! fields = ["ipv4.src"]
//!
//! [[extern]]
//! type = "stateful_alu"
//! name = "count"
//! reg = "counts"
//! _bitwidth_ = "32"
//! update_lo_1_value = "register_lo + 1"
//!
//! [[control]]
//! alu = "count"
//! method = "execute_stateful_alu_from_hash"
//! hash = "flow_hash"
//! ```
//!
//! Extern attribute values are strings, as the compiler emits them.

use crate::alu::AluAttributes;
use crate::device::HashAlgorithm;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors loading a program description.
#[derive(Debug, Error)]
pub enum ProgramError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not a valid program.
    #[error("failed to parse program: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A complete program description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Program {
    /// Program name, for logs.
    pub name: String,
    /// Register arrays.
    #[serde(rename = "register")]
    pub registers: Vec<RegisterDecl>,
    /// PHV fields.
    #[serde(rename = "field")]
    pub fields: Vec<FieldDecl>,
    /// Hash calculations.
    #[serde(rename = "hash")]
    pub hashes: Vec<HashDecl>,
    /// Selector tables.
    #[serde(rename = "selector_table")]
    pub selector_tables: Vec<SelectorTableDecl>,
    /// Extern instances, in declaration order.
    #[serde(rename = "extern")]
    pub externs: Vec<ExternDecl>,
    /// Per-packet control sequence, in execution order.
    pub control: Vec<ControlCall>,
}

/// One register array.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterDecl {
    pub name: String,
    pub size: usize,
    pub bitwidth: usize,
}

/// One PHV field.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub bitwidth: usize,
}

/// One named hash calculation.
#[derive(Debug, Clone, Deserialize)]
pub struct HashDecl {
    pub name: String,
    pub algorithm: HashAlgorithm,
    pub fields: Vec<String>,
}

/// One selector table and its action profile.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorTableDecl {
    pub name: String,
    /// Defaults to `<name>_profile`.
    #[serde(default)]
    pub action_profile: Option<String>,
}

impl SelectorTableDecl {
    /// Action profile name.
    pub fn profile_name(&self) -> String {
        self.action_profile
            .clone()
            .unwrap_or_else(|| format!("{}_profile", self.name))
    }
}

/// One extern instance.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternDecl {
    /// Extern type name, e.g. `stateful_alu`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Instance name.
    pub name: String,
    /// Attribute block.
    #[serde(flatten)]
    pub attributes: AluAttributes,
}

/// One call in the control sequence.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlCall {
    /// Target instance.
    pub alu: String,
    /// Method and its arguments.
    #[serde(flatten)]
    pub method: ControlMethod,
}

/// Packet-facing methods of a stateful ALU.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "method")]
pub enum ControlMethod {
    /// Explicit index: a constant or the value of a PHV field.
    #[serde(rename = "execute_stateful_alu_w_index")]
    WithIndex {
        #[serde(default)]
        index: Option<u64>,
        #[serde(default)]
        index_field: Option<String>,
    },
    /// The packet's table-entry index.
    #[serde(rename = "execute_stateful_alu")]
    EntryIndex,
    /// A named hash calculation modulo the register size.
    #[serde(rename = "execute_stateful_alu_from_hash")]
    FromHash { hash: String },
    /// Stateful logging.
    #[serde(rename = "execute_stateful_log")]
    StatefulLog,
}

impl ControlMethod {
    /// Method name as declared.
    pub fn name(&self) -> &'static str {
        match self {
            ControlMethod::WithIndex { .. } => "execute_stateful_alu_w_index",
            ControlMethod::EntryIndex => "execute_stateful_alu",
            ControlMethod::FromHash { .. } => "execute_stateful_alu_from_hash",
            ControlMethod::StatefulLog => "execute_stateful_log",
        }
    }
}

impl Program {
    /// Load a program from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ProgramError> {
        let content = std::fs::read_to_string(path).map_err(|source| ProgramError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let program = Self::from_str(&content)?;
        log::info!("Loaded program '{}' from {}", program.name, path.display());
        Ok(program)
    }

    /// Parse a program from TOML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ProgramError> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM: &str = r#"
name = "lb"

[[register]]
name = "bits"
size = 8
bitwidth = 1

[[field]]
name = "meta.key"
bitwidth = 16

[[hash]]
name = "h"
algorithm = "crc32"
fields = ["meta.key"]

[[selector_table]]
name = "lb"

[[extern]]
type = "stateful_alu"
name = "sel"
reg = "bits"
selector_binding = "lb"
_bitwidth_ = "1"
_master_ = "True"
update_lo_1_value = "clr_bit"

[[control]]
alu = "sel"
method = "execute_stateful_alu_w_index"
index_field = "meta.key"

[[control]]
alu = "sel"
method = "execute_stateful_alu_from_hash"
hash = "h"

[[control]]
alu = "sel"
method = "execute_stateful_alu"
"#;

    #[test]
    fn test_parse_program() {
        let program = Program::from_str(PROGRAM).unwrap();
        assert_eq!(program.name, "lb");
        assert_eq!(program.registers[0].bitwidth, 1);
        assert_eq!(program.hashes[0].algorithm, HashAlgorithm::Crc32);
        assert_eq!(program.selector_tables[0].profile_name(), "lb_profile");

        let ext = &program.externs[0];
        assert_eq!(ext.type_name, "stateful_alu");
        assert_eq!(ext.attributes.reg, "bits");
        assert_eq!(ext.attributes.master, "True");
        assert_eq!(ext.attributes.bitwidth, "1");
        assert_eq!(ext.attributes.update_lo_1_value, "clr_bit");

        assert_eq!(
            program.control[0].method,
            ControlMethod::WithIndex {
                index: None,
                index_field: Some("meta.key".to_string())
            }
        );
        assert_eq!(
            program.control[1].method,
            ControlMethod::FromHash { hash: "h".to_string() }
        );
        assert_eq!(program.control[2].method, ControlMethod::EntryIndex);
        assert_eq!(program.control[2].method.name(), "execute_stateful_alu");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Program::from_str("[[register]]\nname = \"r\"\n"),
            Err(ProgramError::Parse(_))
        ));
        assert!(matches!(
            Program::from_str("[[control]]\nalu = \"a\"\nmethod = \"bogus\"\n"),
            Err(ProgramError::Parse(_))
        ));
        assert!(matches!(
            Program::from_file(Path::new("/nonexistent/program.toml")),
            Err(ProgramError::Io { .. })
        ));
    }
}
