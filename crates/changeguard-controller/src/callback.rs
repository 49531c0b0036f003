//! Review-service verdict callbacks
//!
//! Verdicts for pre- and post-checks arrive asynchronously on
//! `POST /openapi/altershield/callback`:
//! - `CHANGE_ORDER` resolves the admission pre-check on the policy
//! - `CHANGE_BATCH` resolves a batch check on the execution
//!
//! Callbacks for a phase that is not waiting on a verdict are acknowledged
//! without change, so redelivery is harmless.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use changeguard_common::crd::{ChangeDefenseStatus, DefensePhase};
use changeguard_common::events::{actions, phase_event, EventPublisher};
use changeguard_common::kube_client::{update_execution_status, update_policy_status, DefenseKube};
use changeguard_common::Error;
use changeguard_review::{ChangeCheckCallback, ChangeCheckCallbackRequest, ChangeCheckType, DefenseStage};

/// Path the review service posts verdicts to
pub const CALLBACK_PATH: &str = "/openapi/altershield/callback";

/// State shared by callback handlers
pub struct CallbackState {
    /// Policy and execution access
    pub kube: Arc<dyn DefenseKube>,
    /// Event publisher for verdict transitions
    pub events: Arc<dyn EventPublisher>,
}

/// Build the callback router
pub fn callback_router(state: Arc<CallbackState>) -> Router {
    Router::new()
        .route(CALLBACK_PATH, post(handle_callback))
        .with_state(state)
}

/// Callback handler errors
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// Undecodable body
    #[error("invalid callback body: {0}")]
    InvalidBody(String),

    /// No policy or execution tracks the execution id
    #[error("{0}")]
    NotFound(String),

    /// Status update failed
    #[error("{0}")]
    Internal(Error),
}

impl From<Error> for CallbackError {
    fn from(e: Error) -> Self {
        if e.is_not_found() {
            CallbackError::NotFound(e.to_string())
        } else {
            CallbackError::Internal(e)
        }
    }
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let status = match &self {
            CallbackError::InvalidBody(_) | CallbackError::NotFound(_) => StatusCode::BAD_REQUEST,
            CallbackError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, CallbackError> {
    let callback: ChangeCheckCallback = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Rejecting undecodable callback");
        CallbackError::InvalidBody(e.to_string())
    })?;
    let request = &callback.callback_request;
    info!(
        check = ?callback.change_check_type,
        execution_id = %request.biz_exec_order_id,
        node_id = %request.node_id,
        stage = ?request.defense_stage_enum,
        verdict = ?request.verdict.verdict,
        "Received verdict callback"
    );

    match callback.change_check_type {
        ChangeCheckType::ChangeOrder => resolve_order(&state, request).await?,
        ChangeCheckType::ChangeBatch => resolve_batch(&state, request).await?,
    }
    Ok(Json(json!({ "message": "SUCCESS" })))
}

/// Phase a verdict moves `stage` out of, and where it lands
fn verdict_target(stage: DefenseStage, passed: bool) -> (DefensePhase, DefensePhase) {
    let waiting = match stage {
        DefenseStage::Pre => DefensePhase::PreCheck,
        DefenseStage::Post => DefensePhase::PostCheck,
    };
    let next = match (stage, passed) {
        (_, false) => DefensePhase::Failed,
        (DefenseStage::Pre, true) => DefensePhase::Progressing,
        (DefenseStage::Post, true) => DefensePhase::Passed,
    };
    (waiting, next)
}

/// Resolve the admission pre-check on the policy tracking the execution id
async fn resolve_order(
    state: &CallbackState,
    request: &ChangeCheckCallbackRequest,
) -> Result<(), Error> {
    let id = request.biz_exec_order_id.as_str();
    if request.defense_stage_enum != DefenseStage::Pre {
        debug!(execution_id = %id, "Order callbacks only resolve pre-checks, ignoring");
        return Ok(());
    }
    let policy = state
        .kube
        .find_policy_by_execution_id(id)
        .await?
        .ok_or_else(|| Error::not_found("ChangeDefense", format!("tracking execution {id}")))?;
    let namespace = policy.namespace().unwrap_or_default();
    let (_, next) = verdict_target(DefenseStage::Pre, request.verdict.verdict.passed());

    let written = update_policy_status(state.kube.as_ref(), &namespace, &policy.name_any(), |_, current| {
        if current.current_execution_id.as_deref() != Some(id)
            || current.phase != Some(DefensePhase::PreCheck)
        {
            return Ok(None);
        }
        Ok(Some(ChangeDefenseStatus {
            current_execution_id: Some(id.to_string()),
            verdict: Some(request.verdict.msg.clone()),
            phase: Some(next),
        }))
    })
    .await?;

    if written.is_some() {
        info!(policy = %policy.key(), execution_id = %id, phase = %next, "Pre-check resolved");
    } else {
        debug!(policy = %policy.key(), execution_id = %id, "Policy not waiting on this pre-check");
    }
    Ok(())
}

/// Resolve a batch check on the execution with the given id
async fn resolve_batch(
    state: &CallbackState,
    request: &ChangeCheckCallbackRequest,
) -> Result<(), Error> {
    let id = request.biz_exec_order_id.as_str();
    let execution = state
        .kube
        .find_execution_by_id(id)
        .await?
        .ok_or_else(|| Error::not_found("ChangeDefenseExecution", id.to_string()))?;
    let namespace = execution.namespace().unwrap_or_default();
    let name = execution.name_any();
    let (waiting, next) =
        verdict_target(request.defense_stage_enum, request.verdict.verdict.passed());
    let now = Utc::now();

    let written = update_execution_status(state.kube.as_ref(), &namespace, &name, |fresh, current| {
        if fresh.spec.id != id {
            return Ok(None);
        }
        if current.node_id.as_deref() != Some(request.node_id.as_str()) {
            debug!(
                execution = %name,
                expected = current.node_id.as_deref().unwrap_or("<none>"),
                received = %request.node_id,
                "Callback for another session, ignoring"
            );
            return Ok(None);
        }
        if current.phase != Some(waiting) {
            return Ok(None);
        }
        let mut status = current.clone();
        status.verdict = Some(request.verdict.msg.clone());
        status.transition(next, now)?;
        Ok(Some(status))
    })
    .await?;

    let Some(written) = written else {
        return Ok(());
    };
    info!(execution = %name, batch = written.current_batch, phase = %next, "Batch check resolved");
    let (type_, reason) = phase_event(next);
    state
        .events
        .publish(
            &execution.object_ref(&()),
            type_,
            reason,
            actions::CALLBACK,
            Some(format!(
                "batch {} {}: {}",
                written.current_batch,
                waiting.as_str(),
                request.verdict.msg
            )),
        )
        .await;
    Ok(())
}
