//! Pod deletion guard
//!
//! While an execution is comparing the new revision against the old one, the
//! old pods are its baseline. Deleting a pod of a superseded revision is
//! denied until the current batch leaves the guarded phases. Pods already on
//! the latest revision are ordinary churn and always allowed.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, error, info, warn};

use changeguard_common::revision::{is_consistent_with_revision, latest_template_revision, owner_workload};
use changeguard_common::Error;

use crate::WebhookState;

/// Handle validating admission reviews for pod deletions
pub async fn validate_handler(
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
    Json(guard_deletion(&state, &req).await.into_review())
}

/// Decide one pod deletion
pub async fn guard_deletion(
    state: &WebhookState,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    match deletion_blocker(state, req).await {
        Ok(None) => response,
        Ok(Some(reason)) => {
            info!(pod = %req.name, reason = %reason, "Denying pod deletion");
            response.deny(reason)
        }
        Err(e) => {
            warn!(pod = %req.name, error = %e, "Deletion guard failed, denying");
            response.deny(e.to_string())
        }
    }
}

/// Reason the deletion must wait, if any
async fn deletion_blocker(
    state: &WebhookState,
    req: &AdmissionRequest<DynamicObject>,
) -> Result<Option<String>, Error> {
    if req.operation != Operation::Delete || req.kind.kind != "Pod" {
        return Ok(None);
    }
    let Some(old) = &req.old_object else {
        return Ok(None);
    };
    let pod: Pod = serde_json::from_value(serde_json::to_value(old)?)?;

    let reader = state.workloads.as_ref();
    let Some(workload) = owner_workload(reader, &pod.metadata).await? else {
        debug!(pod = %req.name, "Pod has no reviewed owner");
        return Ok(None);
    };
    let revision = latest_template_revision(reader, &workload).await?;
    if is_consistent_with_revision(&pod, &revision) {
        return Ok(None);
    }

    let Some(brief) = workload.brief()? else {
        return Ok(None);
    };
    let name = brief.execution_name();
    let Some(execution) = state.kube.get_execution(workload.namespace(), &name).await? else {
        debug!(execution = %name, "Execution not created yet");
        return Ok(None);
    };
    Ok(execution
        .phase()
        .filter(|phase| phase.guards_old_pods())
        .map(|phase| format!("current defense execution {name} phase is {phase}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use changeguard_common::brief::ExecutionBrief;
    use changeguard_common::config::ConfigHandle;
    use changeguard_common::crd::{
        ChangeDefenseExecution, ChangeDefenseExecutionStatus, DefensePhase, DefenseStatus,
    };
    use changeguard_common::kube_client::{MockDefenseKube, MockWorkloadReader};
    use changeguard_common::workload::{Workload, WorkloadKind};
    use changeguard_common::BRIEF_ANNOTATION_KEY;
    use changeguard_review::MockReviewService;
    use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    const EXEC_NAME: &str = "guard-prod-web-5-abcde";

    fn deployment() -> Deployment {
        serde_json::from_value(json!({
            "metadata": {
                "name": "web", "namespace": "prod", "uid": "dep-uid",
                "annotations": {
                    BRIEF_ANNOTATION_KEY: ExecutionBrief::new(5, "prod-web-5-abcde", "guard").encode().unwrap()
                }
            },
            "spec": {"selector": {"matchLabels": {"app": "web"}}, "template": {}}
        }))
        .unwrap()
    }

    fn replica_set(hash: &str, created: &str) -> ReplicaSet {
        serde_json::from_value(json!({
            "metadata": {
                "name": format!("web-{hash}"), "namespace": "prod", "uid": format!("rs-{hash}"),
                "creationTimestamp": created,
                "labels": {"app": "web", "pod-template-hash": hash},
                "ownerReferences": [{
                    "apiVersion": "apps/v1", "kind": "Deployment", "name": "web",
                    "uid": "dep-uid", "controller": true
                }]
            }
        }))
        .unwrap()
    }

    fn reader() -> MockWorkloadReader {
        let mut reader = MockWorkloadReader::new();
        reader.expect_get_workload().returning(|_, kind, name| {
            Ok(match (kind, name) {
                (WorkloadKind::Deployment, "web") => Some(Workload::Deployment(deployment())),
                (WorkloadKind::ReplicaSet, "web-v1") => {
                    Some(Workload::ReplicaSet(replica_set("v1", "2026-01-01T00:00:00Z")))
                }
                (WorkloadKind::ReplicaSet, "web-v2") => {
                    Some(Workload::ReplicaSet(replica_set("v2", "2026-01-02T00:00:00Z")))
                }
                _ => None,
            })
        });
        reader.expect_list_replica_sets().returning(|_, _| {
            Ok(vec![
                replica_set("v1", "2026-01-01T00:00:00Z"),
                replica_set("v2", "2026-01-02T00:00:00Z"),
            ])
        });
        reader
    }

    fn execution(phase: DefensePhase) -> ChangeDefenseExecution {
        let mut exec: ChangeDefenseExecution = serde_json::from_value(json!({
            "apiVersion": "changeguard.dev/v1alpha1",
            "kind": "ChangeDefenseExecution",
            "metadata": {"name": EXEC_NAME, "namespace": "prod"},
            "spec": {
                "id": "prod-web-5-abcde",
                "target": {"type": "workload", "objectRef": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "web"}},
                "defenseStrategy": {"workload": {"steps": [{"partition": "50%"}, {"partition": "100%"}]}}
            }
        }))
        .unwrap();
        exec.status = Some(ChangeDefenseExecutionStatus {
            defense_status: DefenseStatus {
                current_batch: 1,
                phase: Some(phase),
                ..Default::default()
            },
        });
        exec
    }

    fn state(phase: Option<DefensePhase>) -> WebhookState {
        let mut kube = MockDefenseKube::new();
        kube.expect_get_execution()
            .withf(|ns, name| ns == "prod" && name == EXEC_NAME)
            .returning(move |_, _| Ok(phase.map(execution)));
        WebhookState {
            kube: Arc::new(kube),
            workloads: Arc::new(reader()),
            review: Arc::new(MockReviewService::new()),
            config: ConfigHandle::default(),
            cancel: CancellationToken::new(),
        }
    }

    fn delete_request(hash: &str) -> AdmissionRequest<DynamicObject> {
        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": format!("web-{hash}-x"), "namespace": "prod",
                "labels": {"app": "web", "pod-template-hash": hash},
                "ownerReferences": [{
                    "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": format!("web-{hash}"),
                    "uid": format!("rs-{hash}"), "controller": true
                }]
            }
        });
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "req-2",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "name": format!("web-{hash}-x"),
                "namespace": "prod",
                "operation": "DELETE",
                "userInfo": {},
                "object": null,
                "oldObject": pod,
                "dryRun": false
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    #[tokio::test]
    async fn story_old_pod_is_kept_while_observing() {
        let response = guard_deletion(&state(Some(DefensePhase::Observing)), &delete_request("v1")).await;
        assert!(!response.allowed);
        assert_eq!(
            response.result.message,
            format!("current defense execution {EXEC_NAME} phase is Observing")
        );
    }

    #[tokio::test]
    async fn story_old_pod_may_go_while_progressing() {
        let response =
            guard_deletion(&state(Some(DefensePhase::Progressing)), &delete_request("v1")).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn story_current_revision_pod_is_always_allowed() {
        let response = guard_deletion(&state(Some(DefensePhase::PostCheck)), &delete_request("v2")).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn story_failed_execution_still_guards_old_pods() {
        let response = guard_deletion(&state(Some(DefensePhase::Failed)), &delete_request("v1")).await;
        assert!(!response.allowed);
    }

    #[tokio::test]
    async fn story_missing_execution_allows_deletion() {
        let response = guard_deletion(&state(None), &delete_request("v1")).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn story_lookup_failure_denies() {
        let mut kube = MockDefenseKube::new();
        kube.expect_get_execution()
            .returning(|_, _| Err(Error::internal("apiserver unavailable")));
        let state = WebhookState {
            kube: Arc::new(kube),
            ..state(None)
        };

        let response = guard_deletion(&state, &delete_request("v1")).await;
        assert!(!response.allowed);
        assert!(response.result.message.contains("apiserver unavailable"));
    }

    #[tokio::test]
    async fn story_garbled_review_is_invalid() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let router = crate::webhook_router(Arc::new(state(None)));
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(crate::VALIDATE_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .unwrap();
        let review: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(review["response"]["allowed"], false);
    }
}
