//! Admission webhooks for changeguard
//!
//! - `/mutate/workloads`: the admission trigger. A Deployment or StatefulSet
//!   update whose pod template changed is held until the review service
//!   clears its pre-check, then admitted with a fresh execution brief.
//! - `/validate/pods`: the deletion guard. Pods of a superseded revision are
//!   kept while an execution is comparing against them.

#![deny(missing_docs)]

pub mod mutate;
pub mod template;
pub mod validate;

use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use tokio_util::sync::CancellationToken;

use changeguard_common::config::ConfigHandle;
use changeguard_common::kube_client::{DefenseKube, WorkloadReader};
use changeguard_review::ReviewService;

/// Path of the mutating admission trigger
pub const MUTATE_PATH: &str = "/mutate/workloads";

/// Path of the validating deletion guard
pub const VALIDATE_PATH: &str = "/validate/pods";

/// State shared by webhook handlers
pub struct WebhookState {
    /// Policy and execution access
    pub kube: Arc<dyn DefenseKube>,
    /// Workload, ReplicaSet and pod reads
    pub workloads: Arc<dyn WorkloadReader>,
    /// Review-service client
    pub review: Arc<dyn ReviewService>,
    /// Runtime tuning snapshot
    pub config: ConfigHandle,
    /// Fires on shutdown; pending pre-check waits end denied
    pub cancel: CancellationToken,
}

/// Build the webhook router
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_PATH, post(mutate::mutate_handler))
        .route(VALIDATE_PATH, post(validate::validate_handler))
        .with_state(state)
}
