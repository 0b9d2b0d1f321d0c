//! Port declarations for DAG nodes.
//!
//! Each node declares its data and metadata ports up front. Data and metadata
//! ports live in separate namespaces. The DAG uses these declarations to
//! validate connections and to detect name collisions before start.

use crate::queue::Schema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which plane a port or edge belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortPlane {
    /// Bulk records on ring buffers.
    Data,
    /// Control messages on metadata queues.
    Metadata,
}

/// Whether a port is an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

/// A declared data port. `schema`, when set, must match any queue bound to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPort {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
}

impl DataPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
        }
    }

    pub fn typed(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema: Some(schema),
        }
    }
}

/// All ports declared by a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePorts {
    #[serde(default)]
    pub data_inputs: Vec<DataPort>,
    #[serde(default)]
    pub data_outputs: Vec<DataPort>,
    #[serde(default)]
    pub metadata_inputs: Vec<String>,
    #[serde(default)]
    pub metadata_outputs: Vec<String>,
}

impl NodePorts {
    pub fn data_port(&self, direction: PortDirection, name: &str) -> Option<&DataPort> {
        let ports = match direction {
            PortDirection::Input => &self.data_inputs,
            PortDirection::Output => &self.data_outputs,
        };
        ports.iter().find(|p| p.name == name)
    }

    pub fn has(&self, plane: PortPlane, direction: PortDirection, name: &str) -> bool {
        match plane {
            PortPlane::Data => self.data_port(direction, name).is_some(),
            PortPlane::Metadata => match direction {
                PortDirection::Input => self.metadata_inputs.iter().any(|p| p == name),
                PortDirection::Output => self.metadata_outputs.iter().any(|p| p == name),
            },
        }
    }

    /// Port names that are declared more than once within a plane, either twice
    /// in the same direction or as both input and output.
    pub fn collisions(&self) -> Vec<(PortPlane, String)> {
        let mut out = Vec::new();
        let data = self
            .data_inputs
            .iter()
            .chain(self.data_outputs.iter())
            .map(|p| p.name.as_str());
        Self::collect_duplicates(PortPlane::Data, data, &mut out);
        let meta = self
            .metadata_inputs
            .iter()
            .chain(self.metadata_outputs.iter())
            .map(String::as_str);
        Self::collect_duplicates(PortPlane::Metadata, meta, &mut out);
        out
    }

    fn collect_duplicates<'a>(
        plane: PortPlane,
        names: impl Iterator<Item = &'a str>,
        out: &mut Vec<(PortPlane, String)>,
    ) {
        let mut seen = BTreeSet::new();
        let mut reported = BTreeSet::new();
        for name in names {
            if !seen.insert(name) && reported.insert(name) {
                out.push((plane, name.to_string()));
            }
        }
    }
}
