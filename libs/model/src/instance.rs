//! Per-node state objects ("OSInstance").

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{labels, Configs, ModelError, ObjectMeta};

/// Per-node mailbox: the operator writes a work order here and the node
/// agent resets the status to `idle` once the work is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInstance {
    pub metadata: ObjectMeta,
    pub spec: OsInstanceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInstanceSpec {
    #[serde(rename = "nodestatus")]
    pub node_status: NodeStatus,

    #[serde(rename = "upgradeconfigs", default)]
    pub upgrade_configs: Configs,

    #[serde(rename = "sysconfigs", default)]
    pub sys_configs: Configs,
}

impl OsInstance {
    /// An idle per-node object for `node`, labeled with its owning node.
    pub fn idle(namespace: impl Into<String>, node: impl Into<String>) -> Self {
        let node = node.into();
        Self {
            metadata: ObjectMeta::namespaced(namespace, node.clone())
                .with_label(labels::OSINSTANCE_NODE, node),
            spec: OsInstanceSpec::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn status(&self) -> NodeStatus {
        self.spec.node_status
    }
}

/// Status of a per-node object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Idle,
    Upgrading,
    Configuring,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Idle => "idle",
            NodeStatus::Upgrading => "upgrading",
            NodeStatus::Configuring => "configuring",
        }
    }

    /// Returns true if the node has work in flight.
    pub fn is_busy(&self) -> bool {
        !matches!(self, NodeStatus::Idle)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(NodeStatus::Idle),
            "upgrading" => Ok(NodeStatus::Upgrading),
            "configuring" => Ok(NodeStatus::Configuring),
            other => Err(ModelError::UnknownNodeStatus(other.to_string())),
        }
    }
}
