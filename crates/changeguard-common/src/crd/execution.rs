//! ChangeDefenseExecution CRD types
//!
//! One execution exists per reviewed update generation. Its spec is a frozen
//! copy of the policy at the time the update was admitted; its status is the
//! batch state machine.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{DefensePhase, DefenseStrategy, RiskPolicy, TargetRef};
use crate::Error;

/// One run of the batch state machine for a reviewed update
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "changeguard.dev",
    version = "v1alpha1",
    kind = "ChangeDefenseExecution",
    plural = "changedefenseexecutions",
    shortname = "cde",
    namespaced,
    status = "ChangeDefenseExecutionStatus",
    printcolumn = r#"{"name":"Batch","type":"integer","jsonPath":".status.defenseStatus.currentBatch"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.defenseStatus.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDefenseExecutionSpec {
    /// Review-service execution id
    pub id: String,

    /// Workload under review (copied from the policy)
    pub target: TargetRef,

    /// Batch plan (copied from the policy)
    #[serde(default)]
    pub defense_strategy: DefenseStrategy,

    /// Risk policy (copied from the policy)
    #[serde(default)]
    pub risk_policy: RiskPolicy,
}

/// Status of a ChangeDefenseExecution
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDefenseExecutionStatus {
    /// Batch state machine
    #[serde(default)]
    pub defense_status: DefenseStatus,
}

/// Identity of a pod recorded in a batch
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    /// Pod name
    pub name: String,
    /// Pod IP at observation time
    #[serde(default)]
    pub ip: String,
    /// Pod UID
    pub uid: String,
}

/// Pods observed for one completed batch
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchPodInfo {
    /// Pods rolled out in this batch
    #[serde(default)]
    pub pods: Vec<PodInfo>,
}

/// Observed workload state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DefenseTargetStatus {
    /// One entry per observed batch, in batch order
    #[serde(default)]
    pub pod_batches: Vec<BatchPodInfo>,
}

/// Batch state machine position
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DefenseStatus {
    /// 1-based batch number; 0 until initialized
    #[serde(default)]
    pub current_batch: u32,

    /// Phase of the current batch; absent until initialized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DefensePhase>,

    /// Message attached to the latest verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,

    /// Pods recorded per batch
    #[serde(default)]
    pub target_status: DefenseTargetStatus,

    /// Review-service node id of the in-flight check
    #[serde(rename = "nodeID", default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// When the phase last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl DefenseStatus {
    /// Status of a fresh execution: batch 1, `Initial`, nothing recorded
    pub fn initialized(now: DateTime<Utc>) -> Self {
        Self {
            current_batch: 1,
            phase: Some(DefensePhase::Initial),
            verdict: None,
            target_status: DefenseTargetStatus::default(),
            node_id: None,
            last_transition_time: Some(now),
        }
    }

    /// Move to `next`, stamping the transition time.
    ///
    /// Rejects moves that break the phase ordering. An uninitialized status
    /// may only enter `Initial` or `Failed`.
    pub fn transition(&mut self, next: DefensePhase, now: DateTime<Utc>) -> Result<(), Error> {
        let allowed = match self.phase {
            Some(current) => current.can_transition_to(next),
            None => matches!(next, DefensePhase::Initial | DefensePhase::Failed),
        };
        if !allowed {
            return Err(Error::internal_with_context(
                "phase",
                format!(
                    "illegal transition {} -> {} at batch {}",
                    self.phase.map(|p| p.as_str()).unwrap_or("<none>"),
                    next,
                    self.current_batch
                ),
            ));
        }
        self.phase = Some(next);
        self.last_transition_time = Some(now);
        Ok(())
    }

    /// Advance to the next batch out of `Passed`/`Skipped`
    pub fn advance_batch(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        match self.phase {
            Some(phase) if phase.is_batch_complete() => {}
            other => {
                return Err(Error::internal_with_context(
                    "phase",
                    format!(
                        "batch {} cannot advance from {}",
                        self.current_batch,
                        other.map(|p| p.as_str()).unwrap_or("<none>")
                    ),
                ))
            }
        }
        self.transition(DefensePhase::Initial, now)?;
        self.current_batch += 1;
        Ok(())
    }

    /// UIDs recorded by batches before `batch`
    pub fn recorded_uids_before(&self, batch: u32) -> HashSet<&str> {
        let prior = (batch as usize).saturating_sub(1);
        self.target_status
            .pod_batches
            .iter()
            .take(prior)
            .flat_map(|b| b.pods.iter().map(|p| p.uid.as_str()))
            .collect()
    }

    /// Record `pods` as the log entry for `batch`.
    ///
    /// Pods already recorded by an earlier batch are dropped, so each UID
    /// appears in at most one batch. Returns the number of pods recorded.
    pub fn record_batch(&mut self, batch: u32, pods: Vec<PodInfo>) -> usize {
        let Some(index) = (batch as usize).checked_sub(1) else {
            return 0;
        };
        let fresh: Vec<PodInfo> = {
            let seen = self.recorded_uids_before(batch);
            pods.into_iter()
                .filter(|p| !seen.contains(p.uid.as_str()))
                .collect()
        };
        let count = fresh.len();
        let batches = &mut self.target_status.pod_batches;
        if batches.len() <= index {
            batches.resize_with(index + 1, BatchPodInfo::default);
        }
        batches[index] = BatchPodInfo { pods: fresh };
        count
    }
}

impl ChangeDefenseExecution {
    /// Current batch state, or the zero value if the status is unset
    pub fn defense_status(&self) -> DefenseStatus {
        self.status
            .as_ref()
            .map(|s| s.defense_status.clone())
            .unwrap_or_default()
    }

    /// Phase of the current batch
    pub fn phase(&self) -> Option<DefensePhase> {
        self.status.as_ref().and_then(|s| s.defense_status.phase)
    }
}
