//! Shared reconciler context

use std::sync::Arc;

use kube::Client;

use changeguard_common::config::ConfigHandle;
use changeguard_common::events::{EventPublisher, KubeEventPublisher};
use changeguard_common::kube_client::{DefenseKube, KubeClientImpl, WorkloadReader};
use changeguard_review::ReviewService;

/// Name reported on Kubernetes Events
pub const CONTROLLER_NAME: &str = "changeguard-controller";

/// Shared context for the policy and execution reconcilers
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, review)
///     .config(handle)
///     .build();
/// ```
pub struct Context {
    /// Policy and execution access (trait object for testability)
    pub kube: Arc<dyn DefenseKube>,
    /// Workload, ReplicaSet and pod reads
    pub workloads: Arc<dyn WorkloadReader>,
    /// Review-service client
    pub review: Arc<dyn ReviewService>,
    /// Event publisher for phase transitions
    pub events: Arc<dyn EventPublisher>,
    /// Runtime tuning snapshot
    pub config: ConfigHandle,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, review: Arc<dyn ReviewService>) -> ContextBuilder {
        ContextBuilder::new(client, review)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn DefenseKube>,
        workloads: Arc<dyn WorkloadReader>,
        review: Arc<dyn ReviewService>,
    ) -> Self {
        Self {
            kube,
            workloads,
            review,
            events: Arc::new(changeguard_common::events::NoopEventPublisher),
            config: ConfigHandle::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    review: Arc<dyn ReviewService>,
    kube: Option<Arc<dyn DefenseKube>>,
    workloads: Option<Arc<dyn WorkloadReader>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: Option<ConfigHandle>,
}

impl ContextBuilder {
    fn new(client: Client, review: Arc<dyn ReviewService>) -> Self {
        Self {
            client,
            review,
            kube: None,
            workloads: None,
            events: None,
            config: None,
        }
    }

    /// Override the policy/execution client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn DefenseKube>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the workload reader (primarily for testing)
    pub fn workload_reader(mut self, workloads: Arc<dyn WorkloadReader>) -> Self {
        self.workloads = Some(workloads);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Read tuning from a published configuration snapshot
    pub fn config(mut self, config: ConfigHandle) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let shared = Arc::new(KubeClientImpl::new(self.client.clone()));
        Context {
            kube: self.kube.unwrap_or_else(|| shared.clone()),
            workloads: self.workloads.unwrap_or_else(|| shared.clone()),
            review: self.review,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME))),
            config: self.config.unwrap_or_default(),
        }
    }
}
