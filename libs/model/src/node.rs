//! Platform-owned node objects.

use serde::{Deserialize, Serialize};

use crate::{labels, ObjectMeta};

/// A physical or virtual machine. Created and deleted by the platform; the
/// rollout controller only touches its labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,

    /// OS image string the node currently reports.
    #[serde(rename = "osImage", default)]
    pub os_image: String,
}

impl Node {
    pub fn new(name: impl Into<String>, os_image: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::cluster_scoped(name),
            os_image: os_image.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_control_plane(&self) -> bool {
        self.metadata.has_label(labels::CONTROL_PLANE)
    }

    pub fn is_upgrading(&self) -> bool {
        self.metadata.has_label(labels::UPGRADING)
    }

    /// Add the busy marker.
    pub fn mark_upgrading(&mut self) {
        self.metadata
            .labels
            .insert(labels::UPGRADING.to_string(), String::new());
    }
}
