//! Client for the external change review service
//!
//! The review service renders pass/fail verdicts for each batch of a
//! rollout. Requests go out as signed JSON POSTs; verdicts come back
//! asynchronously through the operator's callback endpoint, whose payload
//! types live in [`types`] as well.

#![deny(missing_docs)]

pub mod client;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub use client::MockReviewService;
pub use client::{sign, BatchStart, ReviewClient, ReviewClientConfig, ReviewService};
pub use types::{
    ChangeCheckCallback, ChangeCheckCallbackRequest, ChangeCheckType, ChangeCheckVerdict,
    DefenseStage, NodeAssignment, OrderSubmitted, VerdictKind,
};
