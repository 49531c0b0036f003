//! Reconcilers for ChangeDefense and ChangeDefenseExecution
//!
//! The policy reconciler keeps exactly one execution per policy in step with
//! the brief on the target workload. The execution reconciler drives the
//! batch state machine. Verdicts arrive through the callback endpoint, which
//! moves executions out of `PreCheck` and `PostCheck`.

#![deny(missing_docs)]

pub mod callback;
pub mod context;
pub mod execution;
pub mod mappers;
pub mod policy;

pub use callback::{callback_router, CallbackState};
pub use context::{Context, ContextBuilder, CONTROLLER_NAME};
