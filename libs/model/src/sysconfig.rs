//! Configuration bundles and the config model table.
//!
//! A bundle carries a version string and an ordered list of config groups.
//! Each group names its kind in `model`; the kinds known to the platform are
//! kept in a table built once on first use and never mutated afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// A versioned configuration bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configs {
    /// Opaque version string. Equality decides whether a copy is current.
    #[serde(default)]
    pub version: String,

    /// Config groups, in application order.
    #[serde(default)]
    pub configs: Vec<SysConfig>,
}

impl Configs {
    /// Create an empty bundle with the given version.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            configs: Vec::new(),
        }
    }

    /// Append a config group, returning the updated bundle.
    pub fn with_config(mut self, config: SysConfig) -> Self {
        self.configs.push(config);
        self
    }

    /// Swap the grub command line `current` and `next` variants so the node
    /// stages the new payload into the slot that is not active.
    ///
    /// Applying it twice restores the original tags. Returns the model names
    /// that are not in the model table; those entries are left untouched.
    pub fn stage(&mut self) -> Vec<String> {
        let mut unrecognized = Vec::new();
        for config in &mut self.configs {
            match ConfigModel::lookup(&config.model) {
                Some(model) => config.model = model.staged().name().to_string(),
                None => unrecognized.push(config.model.clone()),
            }
        }
        unrecognized
    }
}

/// A named group of key/value settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysConfig {
    /// Config kind name, e.g. `kernel.sysctl`.
    pub model: String,

    /// File the agent persists the settings to, when the kind persists.
    #[serde(default, rename = "configpath", skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,

    #[serde(default)]
    pub contents: BTreeMap<String, String>,
}

impl SysConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.contents.insert(key.into(), value.into());
        self
    }

    pub fn with_config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}

/// Config kinds understood by node agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigModel {
    /// Written straight into the live parameter tree.
    KernelSysctl,
    /// Merged into a persisted key=value file.
    KernelSysctlPersist,
    /// Active kernel command line.
    GrubCmdlineCurrent,
    /// Kernel command line for the next boot.
    GrubCmdlineNext,
}

static MODELS: OnceLock<HashMap<&'static str, ConfigModel>> = OnceLock::new();

impl ConfigModel {
    pub const ALL: [ConfigModel; 4] = [
        ConfigModel::KernelSysctl,
        ConfigModel::KernelSysctlPersist,
        ConfigModel::GrubCmdlineCurrent,
        ConfigModel::GrubCmdlineNext,
    ];

    /// Canonical name as carried in `SysConfig::model`.
    pub fn name(self) -> &'static str {
        match self {
            ConfigModel::KernelSysctl => "kernel.sysctl",
            ConfigModel::KernelSysctlPersist => "kernel.sysctl.persist",
            ConfigModel::GrubCmdlineCurrent => "grub.cmdline.current",
            ConfigModel::GrubCmdlineNext => "grub.cmdline.next",
        }
    }

    /// Resolve a model name through the shared table.
    pub fn lookup(name: &str) -> Option<ConfigModel> {
        MODELS
            .get_or_init(|| Self::ALL.iter().map(|m| (m.name(), *m)).collect())
            .get(name)
            .copied()
    }

    /// The kind a copied entry is retagged to when staged onto a node.
    pub fn staged(self) -> ConfigModel {
        match self {
            ConfigModel::GrubCmdlineCurrent => ConfigModel::GrubCmdlineNext,
            ConfigModel::GrubCmdlineNext => ConfigModel::GrubCmdlineCurrent,
            other => other,
        }
    }
}
