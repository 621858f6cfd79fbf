//! Extern instance registry.
//!
//! Externs are declared in a program by type name. Each known type maps to
//! one [`ExternInstance`] variant, so callers get the concrete instance back
//! without downcasting.

use crate::alu::{AluAttributes, ConfigError, StatefulAlu};
use crate::pipeline::P4Objects;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Extern type name of the stateful ALU.
pub const STATEFUL_ALU: &str = "stateful_alu";

/// A constructed extern instance.
#[derive(Debug, Clone)]
pub enum ExternInstance {
    /// A stateful ALU.
    StatefulAlu(Arc<StatefulAlu>),
}

impl ExternInstance {
    /// Declared type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            ExternInstance::StatefulAlu(_) => STATEFUL_ALU,
        }
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        match self {
            ExternInstance::StatefulAlu(alu) => alu.name(),
        }
    }

    /// The stateful ALU, if that is what this is.
    pub fn as_stateful_alu(&self) -> Option<&Arc<StatefulAlu>> {
        match self {
            ExternInstance::StatefulAlu(alu) => Some(alu),
        }
    }
}

/// Named extern instances, in declaration order of their ids.
#[derive(Debug, Default)]
pub struct ExternRegistry {
    instances: Vec<ExternInstance>,
    by_name: BTreeMap<String, usize>,
}

impl ExternRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct and register an instance of `type_name`.
    ///
    /// The instance id is its position in the registry.
    pub fn instantiate(
        &mut self,
        type_name: &str,
        name: &str,
        attrs: &AluAttributes,
        objects: &P4Objects,
    ) -> Result<ExternInstance, ConfigError> {
        if self.by_name.contains_key(name) {
            return Err(ConfigError::Duplicate {
                kind: "extern",
                name: name.to_string(),
            });
        }
        let id = self.instances.len();
        let instance = match type_name {
            STATEFUL_ALU => {
                let alu = StatefulAlu::init(id, name, attrs, objects).map_err(|e| {
                    ConfigError::Instance {
                        name: name.to_string(),
                        source: Box::new(e),
                    }
                })?;
                ExternInstance::StatefulAlu(Arc::new(alu))
            }
            other => return Err(ConfigError::UnknownExternType(other.to_string())),
        };
        self.by_name.insert(name.to_string(), id);
        self.instances.push(instance.clone());
        Ok(instance)
    }

    /// Instance by name.
    pub fn get(&self, name: &str) -> Option<&ExternInstance> {
        self.by_name.get(name).map(|&id| &self.instances[id])
    }

    /// Stateful ALU by name.
    pub fn stateful_alu(&self, name: &str) -> Option<&Arc<StatefulAlu>> {
        self.get(name).and_then(ExternInstance::as_stateful_alu)
    }

    /// All stateful ALUs, in id order.
    pub fn stateful_alus(&self) -> impl Iterator<Item = &Arc<StatefulAlu>> {
        self.instances.iter().filter_map(ExternInstance::as_stateful_alu)
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RegisterArray;

    fn objects() -> P4Objects {
        let mut objects = P4Objects::new();
        objects.add_register(RegisterArray::new("r", 4, 16)).unwrap();
        objects
    }

    fn attrs() -> AluAttributes {
        AluAttributes {
            reg: "r".to_string(),
            bitwidth: "16".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_instantiate_stateful_alu() {
        let objects = objects();
        let mut registry = ExternRegistry::new();
        let a = registry.instantiate(STATEFUL_ALU, "a", &attrs(), &objects).unwrap();
        let b = registry.instantiate(STATEFUL_ALU, "b", &attrs(), &objects).unwrap();
        assert_eq!(a.type_name(), "stateful_alu");
        assert_eq!(b.as_stateful_alu().unwrap().id(), 1);
        assert_eq!(registry.stateful_alu("a").unwrap().name(), "a");
        assert_eq!(registry.stateful_alus().count(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_errors() {
        let objects = objects();
        let mut registry = ExternRegistry::new();
        let err = registry
            .instantiate("meter", "m", &attrs(), &objects)
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownExternType("meter".to_string()));
        assert_eq!(err.to_string(), "unknown extern type 'meter'");
        assert!(registry.is_empty());
        registry.instantiate(STATEFUL_ALU, "a", &attrs(), &objects).unwrap();
        assert!(matches!(
            registry.instantiate(STATEFUL_ALU, "a", &attrs(), &objects),
            Err(ConfigError::Duplicate { kind: "extern", .. })
        ));

        let mut bad = attrs();
        bad.bitwidth = "32".to_string();
        let err = registry
            .instantiate(STATEFUL_ALU, "wide", &bad, &objects)
            .unwrap_err();
        assert!(err.to_string().starts_with("stateful_alu 'wide':"));
        assert!(registry.get("wide").is_none());
    }
}
