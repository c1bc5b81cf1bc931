//! # kos-model
//!
//! Cluster object model for the kos rolling-upgrade operator.
//!
//! Three object kinds are involved in a rollout:
//!
//! - [`Os`]: the desired cluster-wide state (operation kind, target OS
//!   version, max-unavailable ceiling and configuration bundles).
//! - [`Node`]: a machine owned by the platform. The operator only reads and
//!   writes its labels and reads its observed OS image.
//! - [`OsInstance`]: the per-node mailbox. The operator writes work orders
//!   into it and the node agent resets it to `idle` when done.
//!
//! Versions are opaque strings; equality, not ordering, decides whether a
//! node is up to date.

mod error;
mod instance;
mod meta;
mod node;
mod os;
mod sysconfig;

pub use error::ModelError;
pub use instance::{NodeStatus, OsInstance, OsInstanceSpec};
pub use meta::{ObjectKey, ObjectMeta};
pub use node::Node;
pub use os::{OpsType, Os, OsSpec};
pub use sysconfig::{ConfigModel, Configs, SysConfig};

/// Well-known label keys.
pub mod labels {
    /// Marks control-plane nodes. Such nodes are never rollout targets.
    pub const CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";

    /// Marks a node with an in-flight upgrade. Key-only.
    pub const UPGRADING: &str = "upgrade.kos.dev/upgrading";

    /// Links a per-node state object to the node it describes.
    pub const OSINSTANCE_NODE: &str = "upgrade.kos.dev/osinstance-node";
}
