//! Desired cluster-wide OS state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Configs, ModelError, ObjectMeta};

/// Desired-state object. Mutated only by cluster operators; read-only to the
/// rollout controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Os {
    pub metadata: ObjectMeta,
    pub spec: OsSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsSpec {
    /// Operation kind. Kept as a string so an unknown kind degrades to a
    /// logged no-op instead of a decode failure; see [`OsSpec::ops`].
    #[serde(rename = "opstype")]
    pub ops_type: String,

    /// Target OS version, compared against each node's observed OS image.
    #[serde(rename = "osversion")]
    pub os_version: String,

    /// Ceiling on simultaneously disrupted nodes.
    #[serde(rename = "maxunavailable")]
    pub max_unavailable: i64,

    #[serde(rename = "upgradeconfigs", default)]
    pub upgrade_configs: Configs,

    #[serde(rename = "sysconfigs", default)]
    pub sys_configs: Configs,

    #[serde(rename = "imagetype", default, skip_serializing_if = "String::is_empty")]
    pub image_type: String,

    #[serde(rename = "containerimage", default, skip_serializing_if = "String::is_empty")]
    pub container_image: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,

    #[serde(rename = "evictpodforce", default)]
    pub evict_pod_force: bool,
}

impl OsSpec {
    /// Parsed operation kind.
    pub fn ops(&self) -> Result<OpsType, ModelError> {
        self.ops_type.parse()
    }
}

impl Os {
    pub fn new(metadata: ObjectMeta, spec: OsSpec) -> Self {
        Self { metadata, spec }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Namespace the per-node objects for this rollout live in.
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }
}

/// Rollout operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpsType {
    Upgrade,
    Rollback,
    Config,
}

impl OpsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpsType::Upgrade => "upgrade",
            OpsType::Rollback => "rollback",
            OpsType::Config => "config",
        }
    }
}

impl fmt::Display for OpsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpsType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upgrade" => Ok(OpsType::Upgrade),
            "rollback" => Ok(OpsType::Rollback),
            "config" => Ok(OpsType::Config),
            other => Err(ModelError::UnknownOpsType(other.to_string())),
        }
    }
}
