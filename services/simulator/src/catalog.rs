//! Instance type catalog.

use std::collections::BTreeMap;

use serde::Serialize;

/// Metadata for one simulated instance type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceType {
    pub name: String,
    pub cpu: u32,
    pub memory_mb: u64,
}

impl InstanceType {
    pub fn new(name: impl Into<String>, cpu: u32, memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            cpu,
            memory_mb,
        }
    }
}

/// Read-only source of instance type metadata.
pub trait InstanceTypeProvider: Send + Sync {
    /// All known types, ordered by name.
    fn list(&self) -> Vec<InstanceType>;

    fn get(&self, name: &str) -> Option<InstanceType>;

    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// Fixed in-process catalog.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    types: BTreeMap<String, InstanceType>,
}

impl StaticCatalog {
    pub fn new(types: impl IntoIterator<Item = InstanceType>) -> Self {
        Self {
            types: types.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// The built-in `sim.*` family.
    pub fn builtin() -> Self {
        Self::new([
            InstanceType::new("sim.small", 2, 2048),
            InstanceType::new("sim.medium", 4, 8192),
            InstanceType::new("sim.large", 8, 16384),
            InstanceType::new("sim.xlarge", 16, 32768),
        ])
    }
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl InstanceTypeProvider for StaticCatalog {
    fn list(&self) -> Vec<InstanceType> {
        self.types.values().cloned().collect()
    }

    fn get(&self, name: &str) -> Option<InstanceType> {
        self.types.get(name).cloned()
    }
}
