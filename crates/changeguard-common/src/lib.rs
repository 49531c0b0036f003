//! Common types for changeguard: CRDs, errors, resolvers and utilities

#![deny(missing_docs)]

pub mod batch;
pub mod brief;
pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_client;
pub mod retry;
pub mod revision;
pub mod telemetry;
pub mod wait;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group shared by every changeguard CRD
pub const API_GROUP: &str = "changeguard.dev";

/// Field manager used for server-side apply and status writes
pub const FIELD_MANAGER: &str = "changeguard-operator";

/// Annotation on the target workload carrying the JSON execution brief
pub const BRIEF_ANNOTATION_KEY: &str = "changeguard.dev/latest-defense-exec";

/// Label on execution objects naming the policy that owns them
pub const CHANGE_DEFENSE_LABEL_KEY: &str = "changeguard.dev/change-defense";

/// Label written on the target workload to resume paused rollouts.
///
/// The value is the unix-millisecond timestamp of the resume.
pub const CONTINUE_LABEL_KEY: &str = "changeguard.dev/continue";

/// Pod label carrying the Deployment template revision
pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Pod label carrying the StatefulSet controller revision
pub const CONTROLLER_REVISION_HASH_LABEL: &str = "controller-revision-hash";
