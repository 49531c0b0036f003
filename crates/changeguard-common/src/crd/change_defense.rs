//! ChangeDefense CRD types
//!
//! A `ChangeDefense` protects one workload in its namespace: it names the
//! target and the batch plan every reviewed update of that workload follows.

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{DefensePhase, DefenseStrategy, RiskPolicy, TargetRef};

/// Policy binding a workload to the change-defense review process
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "changeguard.dev",
    version = "v1alpha1",
    kind = "ChangeDefense",
    plural = "changedefenses",
    shortname = "cd",
    namespaced,
    status = "ChangeDefenseStatus",
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.target.objectRef.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Execution","type":"string","jsonPath":".status.currentExecutionID"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDefenseSpec {
    /// Workload to protect
    pub target: TargetRef,

    /// Batch plan
    #[serde(default)]
    pub defense_strategy: DefenseStrategy,

    /// Reserved for review-service tuning
    #[serde(default)]
    pub risk_policy: RiskPolicy,
}

/// Status of a ChangeDefense
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDefenseStatus {
    /// Review-service execution id of the update under review
    #[serde(
        rename = "currentExecutionID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub current_execution_id: Option<String>,

    /// Message attached to the latest verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,

    /// Aggregate phase of the current execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DefensePhase>,
}

impl ChangeDefense {
    /// Execution id currently tracked by this policy
    pub fn current_execution_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.current_execution_id.as_deref())
    }

    /// Aggregate phase, if any execution has been tracked
    pub fn phase(&self) -> Option<DefensePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// True if this policy protects the given workload and is not being deleted
    pub fn protects(&self, group: &str, kind: &str, name: &str) -> bool {
        self.metadata.deletion_timestamp.is_none()
            && self.spec.target.object_ref.matches(group, kind, name)
    }

    /// `namespace/name` for logs and errors
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}
