//! Admission trigger
//!
//! Handles UPDATE reviews for Deployments and StatefulSets:
//! 1. Skip unless the pod template changed and a policy targets the workload
//! 2. Open a change order with the review service under a fresh execution id
//! 3. Point the policy at the new execution (`PreCheck`)
//! 4. Wait, bounded, for the pre-check verdict callback
//! 5. Admit with a brief annotation patch on pass; deny otherwise
//!
//! Every failure after step 1 denies the update.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::ResourceExt;
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use changeguard_common::brief::ExecutionBrief;
use changeguard_common::crd::{ChangeDefense, ChangeDefenseStatus, DefensePhase};
use changeguard_common::kube_client::update_policy_status;
use changeguard_common::wait::poll_until;
use changeguard_common::workload::WorkloadKind;
use changeguard_common::{Error, BRIEF_ANNOTATION_KEY};

use crate::template::template_changed;
use crate::WebhookState;

/// Length of the random suffix of an execution id
const EXECUTION_ID_SUFFIX_LEN: usize = 5;

/// Outcome of reviewing one update
#[derive(Debug)]
enum Decision {
    /// Admit unchanged
    Allow,
    /// Admit with a patch
    Patch(Vec<PatchOperation>),
    /// Reject with a reason
    Deny(String),
}

/// Handle mutating admission reviews for workloads
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(admit_update(&state, &req).await.into_review())
}

/// Review one workload update
pub async fn admit_update(
    state: &WebhookState,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    match review_update(state, req).await {
        Ok(Decision::Allow) => response,
        Ok(Decision::Patch(ops)) => match response.with_patch(json_patch::Patch(ops)) {
            Ok(patched) => patched,
            Err(e) => {
                error!(uid = %req.uid, error = %e, "Failed to serialize patch");
                AdmissionResponse::from(req).deny(format!("patch serialization error: {e}"))
            }
        },
        Ok(Decision::Deny(reason)) => {
            info!(uid = %req.uid, workload = %req.name, reason = %reason, "Denying workload update");
            response.deny(reason)
        }
        Err(e) => {
            warn!(uid = %req.uid, workload = %req.name, error = %e, "Admission failed, denying");
            response.deny(e.to_string())
        }
    }
}

#[instrument(skip_all, fields(uid = %req.uid, workload = %req.name))]
async fn review_update(
    state: &WebhookState,
    req: &AdmissionRequest<DynamicObject>,
) -> Result<Decision, Error> {
    if req.operation != Operation::Update {
        return Ok(Decision::Allow);
    }
    let Some(kind) =
        WorkloadKind::from_group_kind(&req.kind.group, &req.kind.kind).filter(|k| k.is_target())
    else {
        return Ok(Decision::Allow);
    };
    let (Some(new), Some(old)) = (&req.object, &req.old_object) else {
        return Ok(Decision::Allow);
    };
    if !template_changed(&serde_json::to_value(old)?, &serde_json::to_value(new)?) {
        debug!("Pod template unchanged");
        return Ok(Decision::Allow);
    }
    let namespace = req
        .namespace
        .as_deref()
        .ok_or_else(|| Error::validation_for(&req.name, "workload update has no namespace"))?;
    if req.dry_run {
        debug!("Dry-run update, not contacting review service");
        return Ok(Decision::Allow);
    }

    let Some(policy) = find_policy(state, namespace, kind, &req.name).await? else {
        debug!("No ChangeDefense targets this workload");
        return Ok(Decision::Allow);
    };
    let policy_name = policy.name_any();
    let generation = old.metadata.generation.unwrap_or(0) + 1;
    let id = execution_id(namespace, &req.name, generation);
    info!(policy = %policy.key(), execution_id = %id, "Template changed, requesting pre-check");

    let app = format!("{namespace}-{}", req.name);
    let order = state.review.submit_change_exec_order(&id, &app).await?;
    let node = state.review.submit_change_exec_order_start_notify(&id).await?;
    if node.skip_check {
        debug!(execution_id = %id, "Review service reported skipCheck for order start");
    }
    debug!(execution_id = %id, order = %order.url, node_id = %node.node_id, "Change order opened");

    update_policy_status(state.kube.as_ref(), namespace, &policy_name, |_, _| {
        Ok(Some(ChangeDefenseStatus {
            current_execution_id: Some(id.clone()),
            verdict: None,
            phase: Some(DefensePhase::PreCheck),
        }))
    })
    .await?;

    let config = state.config.current();
    let kube = &state.kube;
    let (phase, verdict) = poll_until(
        config.precheck_poll_interval,
        config.precheck_timeout,
        &state.cancel,
        "pre-check verdict",
        || {
            let (policy_name, id) = (&policy_name, &id);
            async move {
                let policy = kube.get_policy(namespace, policy_name).await?.ok_or_else(|| {
                    Error::not_found("ChangeDefense", format!("{namespace}/{policy_name}"))
                })?;
                let current = policy.current_execution_id().unwrap_or("<none>");
                if current != id.as_str() {
                    return Err(Error::superseded(id.as_str(), current));
                }
                Ok(match policy.phase() {
                    None | Some(DefensePhase::PreCheck) => None,
                    Some(phase) => {
                        let verdict = policy.status.as_ref().and_then(|s| s.verdict.clone());
                        Some((phase, verdict))
                    }
                })
            }
        },
    )
    .await?;

    if phase != DefensePhase::Progressing {
        return Ok(Decision::Deny(format!(
            "pre-check for execution {id} ended in {phase}: {}",
            verdict.as_deref().unwrap_or("no verdict message")
        )));
    }
    let brief = ExecutionBrief::new(generation, &id, &policy_name);
    info!(execution_id = %id, "Pre-check passed, admitting with brief");
    Ok(Decision::Patch(brief_patch(new, &brief)?))
}

/// First non-deleting policy in the namespace targeting the workload
async fn find_policy(
    state: &WebhookState,
    namespace: &str,
    kind: WorkloadKind,
    name: &str,
) -> Result<Option<ChangeDefense>, Error> {
    Ok(state
        .kube
        .list_policies(namespace)
        .await?
        .into_iter()
        .find(|p| p.protects(WorkloadKind::GROUP, kind.as_str(), name)))
}

/// `{namespace}-{workload}-{generation}-{random lowercase suffix}`
fn execution_id(namespace: &str, workload: &str, generation: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..EXECUTION_ID_SUFFIX_LEN)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect();
    format!("{namespace}-{workload}-{generation}-{suffix}")
}

/// Patch setting the brief annotation on the admitted object
pub fn brief_patch(
    object: &DynamicObject,
    brief: &ExecutionBrief,
) -> Result<Vec<PatchOperation>, Error> {
    let encoded = brief.encode()?;
    let op = match object.metadata.annotations {
        Some(_) => AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations", BRIEF_ANNOTATION_KEY]),
            value: serde_json::Value::String(encoded),
        },
        None => AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations"]),
            value: serde_json::json!({ BRIEF_ANNOTATION_KEY: encoded }),
        },
    };
    Ok(vec![PatchOperation::Add(op)])
}
