//! Kubernetes Event recording for changeguard
//!
//! Executions publish an Event for every phase transition so that
//! `kubectl describe changedefenseexecution` tells the rollout's story.
//! Publishing is fire-and-forget: a failed Event is logged and never fails a
//! reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::crd::DefensePhase;

/// Publishes Events about a resource
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event; failures are logged, not returned
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every Event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    /// Batch entered a new phase
    pub const PHASE_CHANGED: &str = "PhaseChanged";
    /// Batch or execution was rejected
    pub const DEFENSE_FAILED: &str = "DefenseFailed";
    /// Every batch passed review
    pub const DEFENSE_PASSED: &str = "DefensePassed";
    /// A newer update superseded this execution
    pub const SUPERSEDED: &str = "Superseded";
    /// Review service call failed
    pub const REVIEW_ERROR: &str = "ReviewError";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Reconcile loop
    pub const RECONCILE: &str = "Reconcile";
    /// Review-service callback
    pub const CALLBACK: &str = "Callback";
}

/// Event type and reason for entering `phase`
pub fn phase_event(phase: DefensePhase) -> (EventType, &'static str) {
    match phase {
        DefensePhase::Failed => (EventType::Warning, reasons::DEFENSE_FAILED),
        _ => (EventType::Normal, reasons::PHASE_CHANGED),
    }
}
