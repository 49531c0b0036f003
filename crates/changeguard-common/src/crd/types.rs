//! Types shared by the ChangeDefense and ChangeDefenseExecution CRDs

use std::fmt;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::workload::WorkloadKind;
use crate::Error;

// =============================================================================
// Target
// =============================================================================

/// What a policy protects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TargetType {
    /// A replicated workload (Deployment or StatefulSet)
    #[default]
    #[serde(rename = "workload")]
    Workload,
}

/// Reference to the protected workload, in the policy's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetObjectRef {
    /// API version of the workload (e.g. "apps/v1")
    pub api_version: String,
    /// Kind of the workload (e.g. "Deployment")
    pub kind: String,
    /// Name of the workload
    pub name: String,
}

impl TargetObjectRef {
    /// API group portion of `apiVersion` ("" for the core group)
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    /// Resolve the referenced kind to a supported workload kind
    pub fn workload_kind(&self) -> Result<WorkloadKind, Error> {
        WorkloadKind::from_group_kind(self.group(), &self.kind)
            .filter(|kind| kind.is_target())
            .ok_or_else(|| {
                Error::validation_for_field(
                    &self.name,
                    "spec.target.objectRef",
                    format!("{} {} is not a supported workload", self.api_version, self.kind),
                )
            })
    }

    /// True if this reference names the given group/kind/name
    pub fn matches(&self, group: &str, kind: &str, name: &str) -> bool {
        self.group() == group && self.kind == kind && self.name == name
    }
}

/// Target of a change defense
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// Target type
    #[serde(rename = "type", default)]
    pub type_: TargetType,
    /// The protected object
    pub object_ref: TargetObjectRef,
}

// =============================================================================
// Strategy
// =============================================================================

/// One batch of a rolling update
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DefenseStep {
    /// Pods that must run the new revision before the batch is observed.
    ///
    /// Either an absolute pod count or a percentage string such as "20%".
    pub partition: IntOrString,

    /// Seconds to observe the batch before requesting the post-check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_after_complete: Option<i32>,
}

impl DefenseStep {
    /// Observation delay for this step; negative values count as zero
    pub fn observe_delay(&self) -> Duration {
        let secs = self.check_after_complete.unwrap_or(0).max(0);
        Duration::from_secs(secs as u64)
    }
}

/// Batch plan for a workload target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDefenseStrategy {
    /// Ordered batches
    #[serde(default)]
    pub steps: Vec<DefenseStep>,
}

/// How a change is released
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DefenseStrategy {
    /// Strategy for workload targets
    #[serde(default)]
    pub workload: WorkloadDefenseStrategy,
}

impl DefenseStrategy {
    /// Number of batches in the plan
    pub fn total_batches(&self) -> u32 {
        self.workload.steps.len() as u32
    }

    /// The step for a 1-based batch number
    pub fn step(&self, batch: u32) -> Option<&DefenseStep> {
        let index = (batch as usize).checked_sub(1)?;
        self.workload.steps.get(index)
    }
}

/// Risk policy, reserved for review-service tuning
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RiskPolicy {}

// =============================================================================
// Phase
// =============================================================================

/// Position of an execution (or policy) in the batch state machine
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum DefensePhase {
    /// Batch selected, resume label and batch-start notify pending
    Initial,
    /// Waiting for the pre-check verdict
    PreCheck,
    /// Waiting for the batch's pods to roll out
    Progressing,
    /// Watching the rolled-out batch before the post-check
    Observing,
    /// Waiting for the post-check verdict
    PostCheck,
    /// Batch passed review
    Passed,
    /// Batch was rejected; absorbing
    Failed,
    /// Batch was skipped by the review service
    Skipped,
}

impl DefensePhase {
    /// Position along `Initial < PreCheck < Progressing < Observing < PostCheck < Passed|Skipped`
    fn rank(self) -> u8 {
        match self {
            DefensePhase::Initial => 0,
            DefensePhase::PreCheck => 1,
            DefensePhase::Progressing => 2,
            DefensePhase::Observing => 3,
            DefensePhase::PostCheck => 4,
            DefensePhase::Passed | DefensePhase::Skipped => 5,
            DefensePhase::Failed => 6,
        }
    }

    /// True once a batch has cleared its post-check
    pub fn is_batch_complete(self) -> bool {
        matches!(self, DefensePhase::Passed | DefensePhase::Skipped)
    }

    /// Phases during which pods of a superseded revision must not be deleted.
    ///
    /// `Progressing` is absent: the workload controller is
    /// replacing old pods at that point.
    pub fn guards_old_pods(self) -> bool {
        matches!(
            self,
            DefensePhase::Initial
                | DefensePhase::PreCheck
                | DefensePhase::Observing
                | DefensePhase::PostCheck
                | DefensePhase::Failed
        )
    }

    /// Whether moving from `self` to `next` keeps the phase ordering.
    ///
    /// Forward moves are allowed, `Failed` is reachable from anywhere and has
    /// no way out, and `Passed`/`Skipped` may restart at `Initial` for the
    /// next batch.
    pub fn can_transition_to(self, next: DefensePhase) -> bool {
        match (self, next) {
            (DefensePhase::Failed, _) => false,
            (_, DefensePhase::Failed) => true,
            (DefensePhase::Passed | DefensePhase::Skipped, DefensePhase::Initial) => true,
            _ => next.rank() > self.rank(),
        }
    }

    /// Wire name of the phase
    pub fn as_str(self) -> &'static str {
        match self {
            DefensePhase::Initial => "Initial",
            DefensePhase::PreCheck => "PreCheck",
            DefensePhase::Progressing => "Progressing",
            DefensePhase::Observing => "Observing",
            DefensePhase::PostCheck => "PostCheck",
            DefensePhase::Passed => "Passed",
            DefensePhase::Failed => "Failed",
            DefensePhase::Skipped => "Skipped",
        }
    }
}

impl fmt::Display for DefensePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DefensePhase; 8] = [
        DefensePhase::Initial,
        DefensePhase::PreCheck,
        DefensePhase::Progressing,
        DefensePhase::Observing,
        DefensePhase::PostCheck,
        DefensePhase::Passed,
        DefensePhase::Failed,
        DefensePhase::Skipped,
    ];

    #[test]
    fn failed_is_absorbing() {
        for next in ALL {
            assert!(!DefensePhase::Failed.can_transition_to(next), "Failed -> {next}");
        }
    }

    #[test]
    fn every_live_phase_can_fail() {
        for from in ALL.into_iter().filter(|p| *p != DefensePhase::Failed) {
            assert!(from.can_transition_to(DefensePhase::Failed), "{from} -> Failed");
        }
    }

    #[test]
    fn only_batch_advance_moves_backwards() {
        for from in ALL {
            for next in ALL {
                let backwards = next != DefensePhase::Failed && next.rank() <= from.rank();
                if !backwards || !from.can_transition_to(next) {
                    continue;
                }
                assert!(
                    from.is_batch_complete() && next == DefensePhase::Initial,
                    "unexpected backwards edge {from} -> {next}"
                );
            }
        }
    }

    #[test]
    fn happy_path_edges_are_allowed() {
        let path = [
            DefensePhase::Initial,
            DefensePhase::PreCheck,
            DefensePhase::Progressing,
            DefensePhase::Observing,
            DefensePhase::PostCheck,
            DefensePhase::Passed,
            DefensePhase::Initial,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!DefensePhase::Passed.can_transition_to(DefensePhase::Skipped));
    }

    #[test]
    fn progressing_does_not_guard_old_pods() {
        let guarded: Vec<_> = ALL.into_iter().filter(|p| p.guards_old_pods()).collect();
        assert_eq!(
            guarded,
            vec![
                DefensePhase::Initial,
                DefensePhase::PreCheck,
                DefensePhase::Observing,
                DefensePhase::PostCheck,
                DefensePhase::Failed,
            ]
        );
    }

    #[test]
    fn phase_wire_names_round_trip_through_serde() {
        let json = serde_json::to_string(&DefensePhase::PreCheck).unwrap();
        assert_eq!(json, "\"PreCheck\"");
        assert_eq!(DefensePhase::PostCheck.to_string(), "PostCheck");
    }

    #[test]
    fn strategy_steps_are_one_based() {
        let strategy = DefenseStrategy {
            workload: WorkloadDefenseStrategy {
                steps: vec![
                    DefenseStep {
                        partition: IntOrString::String("50%".into()),
                        check_after_complete: Some(-3),
                    },
                    DefenseStep {
                        partition: IntOrString::Int(4),
                        check_after_complete: None,
                    },
                ],
            },
        };
        assert_eq!(strategy.total_batches(), 2);
        assert!(strategy.step(0).is_none());
        assert_eq!(strategy.step(2).unwrap().partition, IntOrString::Int(4));
        assert!(strategy.step(3).is_none());
        assert_eq!(strategy.step(1).unwrap().observe_delay(), Duration::ZERO);
    }

    #[test]
    fn target_ref_resolves_group_and_kind() {
        let target = TargetObjectRef {
            api_version: "apps/v1".into(),
            kind: "StatefulSet".into(),
            name: "db".into(),
        };
        assert_eq!(target.group(), "apps");
        assert_eq!(target.workload_kind().unwrap(), WorkloadKind::StatefulSet);
        assert!(target.matches("apps", "StatefulSet", "db"));
        assert!(!target.matches("apps", "Deployment", "db"));

        let core = TargetObjectRef {
            api_version: "v1".into(),
            kind: "Pod".into(),
            name: "p".into(),
        };
        assert_eq!(core.group(), "");
        assert!(core.workload_kind().is_err());
    }
}
