//! Custom Resource Definitions for changeguard
//!
//! `ChangeDefense` is the policy an administrator creates;
//! `ChangeDefenseExecution` is created by the operator, one per reviewed update.

mod change_defense;
mod execution;
mod types;

pub use change_defense::{ChangeDefense, ChangeDefenseSpec, ChangeDefenseStatus};
pub use execution::{
    BatchPodInfo, ChangeDefenseExecution, ChangeDefenseExecutionSpec,
    ChangeDefenseExecutionStatus, DefenseStatus, DefenseTargetStatus, PodInfo,
};
pub use types::{
    DefensePhase, DefenseStep, DefenseStrategy, RiskPolicy, TargetObjectRef, TargetRef,
    TargetType, WorkloadDefenseStrategy,
};
