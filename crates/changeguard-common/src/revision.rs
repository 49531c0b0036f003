//! Revision resolution: which workload owns a pod, and is the pod current?
//!
//! Pods are attributed to a workload by walking controller owner references
//! (pod -> ReplicaSet -> Deployment, or pod -> StatefulSet), and to a template
//! revision by their `pod-template-hash` / `controller-revision-hash` label.

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, trace};

use crate::brief::ExecutionBrief;
use crate::crd::PodInfo;
use crate::kube_client::WorkloadReader;
use crate::workload::{controller_owner, selector_string, Workload, WorkloadKind};
use crate::{Error, CONTROLLER_REVISION_HASH_LABEL, POD_TEMPLATE_HASH_LABEL};

/// Owner walks stop after this many hops
const MAX_OWNER_DEPTH: usize = 8;

/// Walk controller owners from `meta` to the top-most ancestor carrying an
/// execution brief.
///
/// Returns `None` when no annotated ancestor exists or when the walk meets an
/// owner kind outside the supported set. A missing owner ends the walk with
/// whatever was found so far.
pub async fn owner_workload(
    reader: &dyn WorkloadReader,
    meta: &ObjectMeta,
) -> Result<Option<Workload>, Error> {
    let namespace = meta.namespace.as_deref().unwrap_or_default();
    let mut owner_ref = controller_owner(meta).cloned();
    let mut annotated = None;

    for _ in 0..MAX_OWNER_DEPTH {
        let Some(owner) = owner_ref.take() else {
            break;
        };
        let Some(kind) = WorkloadKind::from_owner(&owner) else {
            trace!(kind = %owner.kind, owner = %owner.name, "Owner kind not supported");
            return Ok(None);
        };
        let Some(workload) = reader.get_workload(namespace, kind, &owner.name).await? else {
            debug!(kind = %kind, owner = %owner.name, "Owner not found, ending walk");
            break;
        };
        if workload.uid() != Some(owner.uid.as_str()) {
            debug!(kind = %kind, owner = %owner.name, "Owner UID changed, ending walk");
            break;
        }
        owner_ref = workload.controller_owner().cloned();
        if ExecutionBrief::is_present(workload.annotations()) {
            annotated = Some(workload);
        }
    }

    Ok(annotated)
}

/// Latest template revision of a workload.
///
/// For a Deployment this is the `pod-template-hash` of the most recently
/// created ReplicaSet it controls; other kinds record it on the object.
pub async fn latest_template_revision(
    reader: &dyn WorkloadReader,
    workload: &Workload,
) -> Result<String, Error> {
    if workload.kind() != WorkloadKind::Deployment {
        return workload
            .template_hash()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::validation_for(workload.key(), "workload has no recorded update revision")
            });
    }

    let selector = workload
        .selector()
        .ok_or_else(|| Error::validation_for(workload.key(), "workload has no selector"))?;
    let selector = selector_string(selector)?;
    let sets = reader
        .list_replica_sets(workload.namespace(), &selector)
        .await?;

    let newest = sets
        .iter()
        .filter(|rs| is_controlled_by(&rs.metadata, workload))
        .max_by_key(|rs| rs.metadata.creation_timestamp.clone().map(|t| t.0))
        .ok_or_else(|| Error::not_found("ReplicaSet", format!("owned by {}", workload.key())))?;

    replica_set_hash(newest)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::validation_for(
                format!("ReplicaSet {}", newest.metadata.name.as_deref().unwrap_or_default()),
                format!("missing {POD_TEMPLATE_HASH_LABEL} label"),
            )
        })
}

fn replica_set_hash(rs: &ReplicaSet) -> Option<&str> {
    rs.metadata
        .labels
        .as_ref()?
        .get(POD_TEMPLATE_HASH_LABEL)
        .map(String::as_str)
        .filter(|h| !h.is_empty())
}

fn is_controlled_by(meta: &ObjectMeta, workload: &Workload) -> bool {
    match (controller_owner(meta), workload.uid()) {
        (Some(owner), Some(uid)) => owner.uid == uid,
        _ => false,
    }
}

/// Revision label of a pod, under either convention
pub fn pod_revision(pod: &Pod) -> Option<&str> {
    let labels = pod.metadata.labels.as_ref()?;
    [POD_TEMPLATE_HASH_LABEL, CONTROLLER_REVISION_HASH_LABEL]
        .iter()
        .filter_map(|key| labels.get(*key))
        .map(String::as_str)
        .find(|v| !v.is_empty())
}

/// True if the pod's revision label is a suffix of `revision`.
///
/// StatefulSet revisions are `<name>-<hash>` while the pod label may carry
/// either form, so suffix matching covers both.
pub fn is_consistent_with_revision(pod: &Pod, revision: &str) -> bool {
    pod_revision(pod).is_some_and(|label| revision.ends_with(label))
}

/// Pods selected by the workload and truly owned by it.
///
/// Failed and Succeeded pods are skipped. Ownership is verified by walking
/// each pod's owners back to the workload's UID, so label overlap with another
/// workload does not leak pods in.
pub async fn list_owned_pods(
    reader: &dyn WorkloadReader,
    workload: &Workload,
) -> Result<Vec<Pod>, Error> {
    let selector = workload
        .selector()
        .ok_or_else(|| Error::validation_for(workload.key(), "workload has no selector"))?;
    let selector = selector_string(selector)?;
    let uid = workload.uid().ok_or_else(|| {
        Error::internal_with_context("revision", format!("{} has no UID", workload.key()))
    })?;

    let pods = reader.list_pods(workload.namespace(), &selector).await?;
    let mut owned = Vec::with_capacity(pods.len());
    for pod in pods {
        if is_terminal(&pod) {
            continue;
        }
        match owner_workload(reader, &pod.metadata).await? {
            Some(owner) if owner.uid() == Some(uid) => owned.push(pod),
            _ => trace!(pod = ?pod.metadata.name, "Pod matches selector but is not owned"),
        }
    }
    Ok(owned)
}

/// Owned, non-deleting pods on the latest template revision
pub async fn pods_of_latest_revision(
    reader: &dyn WorkloadReader,
    workload: &Workload,
) -> Result<Vec<Pod>, Error> {
    let revision = latest_template_revision(reader, workload).await?;
    let pods = list_owned_pods(reader, workload).await?;
    Ok(pods
        .into_iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .filter(|p| is_consistent_with_revision(p, &revision))
        .collect())
}

/// Ready pods on the latest template revision
pub async fn ready_pods_of_latest_revision(
    reader: &dyn WorkloadReader,
    workload: &Workload,
) -> Result<Vec<Pod>, Error> {
    Ok(pods_of_latest_revision(reader, workload)
        .await?
        .into_iter()
        .filter(is_pod_ready)
        .collect())
}

/// True if the pod's Ready condition is True
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Failed") | Some("Succeeded")
    )
}

/// Identity of a pod as recorded in a batch log
pub fn pod_info(pod: &Pod) -> PodInfo {
    PodInfo {
        name: pod.metadata.name.clone().unwrap_or_default(),
        ip: pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .unwrap_or_default(),
        uid: pod.metadata.uid.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockWorkloadReader;
    use crate::BRIEF_ANNOTATION_KEY;
    use k8s_openapi::api::apps::v1::Deployment;

    fn brief_annotation() -> serde_json::Value {
        let brief = ExecutionBrief::new(2, "prod-web-2-abcde", "guard");
        serde_json::json!({ BRIEF_ANNOTATION_KEY: brief.encode().unwrap() })
    }

    fn deployment() -> Workload {
        Workload::Deployment(
            serde_json::from_value::<Deployment>(serde_json::json!({
                "metadata": {
                    "name": "web", "namespace": "prod", "uid": "dep-uid",
                    "annotations": brief_annotation()
                },
                "spec": {
                    "replicas": 3,
                    "selector": {"matchLabels": {"app": "web"}},
                    "template": {}
                }
            }))
            .unwrap(),
        )
    }

    fn replica_set(name: &str, hash: &str, created: &str, annotated: bool) -> ReplicaSet {
        let annotations = if annotated {
            brief_annotation()
        } else {
            serde_json::json!({})
        };
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": name, "namespace": "prod", "uid": format!("{name}-uid"),
                "creationTimestamp": created,
                "labels": {"app": "web", "pod-template-hash": hash},
                "annotations": annotations,
                "ownerReferences": [{
                    "apiVersion": "apps/v1", "kind": "Deployment", "name": "web",
                    "uid": "dep-uid", "controller": true
                }]
            },
            "spec": {"selector": {"matchLabels": {"app": "web"}}}
        }))
        .unwrap()
    }

    fn pod(name: &str, rs: &str, hash: &str, ready: bool) -> Pod {
        let ready = if ready { "True" } else { "False" };
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": name, "namespace": "prod", "uid": format!("{name}-uid"),
                "labels": {"app": "web", "pod-template-hash": hash},
                "ownerReferences": [{
                    "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": rs,
                    "uid": format!("{rs}-uid"), "controller": true
                }]
            },
            "status": {
                "phase": "Running",
                "podIP": "10.0.0.9",
                "conditions": [{"type": "Ready", "status": ready}]
            }
        }))
        .unwrap()
    }

    fn reader_with(sets: Vec<ReplicaSet>, pods: Vec<Pod>) -> MockWorkloadReader {
        let mut reader = MockWorkloadReader::new();
        let by_name = sets.clone();
        reader
            .expect_get_workload()
            .returning(move |_, kind, name| match kind {
                WorkloadKind::Deployment if name == "web" => Ok(Some(deployment())),
                WorkloadKind::ReplicaSet => Ok(by_name
                    .iter()
                    .find(|rs| rs.metadata.name.as_deref() == Some(name))
                    .cloned()
                    .map(Workload::ReplicaSet)),
                _ => Ok(None),
            });
        reader
            .expect_list_replica_sets()
            .withf(|ns, selector| ns == "prod" && selector == "app=web")
            .returning(move |_, _| Ok(sets.clone()));
        reader
            .expect_list_pods()
            .returning(move |_, _| Ok(pods.clone()));
        reader
    }

    #[tokio::test]
    async fn owner_walk_reaches_the_top_most_annotated_workload() {
        // Deployments copy annotations to their ReplicaSets; the walk must not stop there
        let reader = reader_with(
            vec![replica_set("web-new", "new", "2024-01-02T00:00:00Z", true)],
            vec![],
        );
        let p = pod("web-1", "web-new", "new", true);
        let owner = owner_workload(&reader, &p.metadata).await.unwrap().unwrap();
        assert_eq!(owner.kind(), WorkloadKind::Deployment);
        assert_eq!(owner.uid(), Some("dep-uid"));
    }

    #[tokio::test]
    async fn owner_walk_stops_at_unsupported_kinds() {
        let reader = MockWorkloadReader::new();
        let p: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "job-pod", "namespace": "prod",
                "ownerReferences": [{
                    "apiVersion": "batch/v1", "kind": "Job", "name": "nightly",
                    "uid": "job-uid", "controller": true
                }]
            }
        }))
        .unwrap();
        assert!(owner_workload(&reader, &p.metadata).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pod_without_owner_has_no_workload() {
        let reader = MockWorkloadReader::new();
        let p: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "bare", "namespace": "prod"}
        }))
        .unwrap();
        assert!(owner_workload(&reader, &p.metadata).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_revision_is_newest_owned_replica_set() {
        let reader = reader_with(
            vec![
                replica_set("web-old", "old", "2024-01-01T00:00:00Z", false),
                replica_set("web-new", "new", "2024-01-02T00:00:00Z", true),
            ],
            vec![],
        );
        let revision = latest_template_revision(&reader, &deployment())
            .await
            .unwrap();
        assert_eq!(revision, "new");
    }

    #[tokio::test]
    async fn deployment_without_replica_sets_has_no_revision() {
        let reader = reader_with(vec![], vec![]);
        let err = latest_template_revision(&reader, &deployment())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn revision_matching_is_suffix_based() {
        let p = pod("db-0", "unused", "7f9c", true);
        assert!(is_consistent_with_revision(&p, "db-7f9c"));
        assert!(is_consistent_with_revision(&p, "7f9c"));
        assert!(!is_consistent_with_revision(&p, "db-8a1b"));

        let unlabeled: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "x"}
        }))
        .unwrap();
        assert!(!is_consistent_with_revision(&unlabeled, "db-7f9c"));
    }

    #[tokio::test]
    async fn latest_revision_pods_exclude_old_terminal_and_deleting_pods() {
        let mut finished = pod("web-done", "web-new", "new", false);
        finished.status.as_mut().unwrap().phase = Some("Succeeded".into());
        let mut deleting = pod("web-del", "web-new", "new", true);
        deleting.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );

        let reader = reader_with(
            vec![
                replica_set("web-old", "old", "2024-01-01T00:00:00Z", false),
                replica_set("web-new", "new", "2024-01-02T00:00:00Z", true),
            ],
            vec![
                pod("web-a", "web-new", "new", true),
                pod("web-b", "web-new", "new", false),
                pod("web-c", "web-old", "old", true),
                finished,
                deleting,
            ],
        );
        let workload = deployment();

        let latest = pods_of_latest_revision(&reader, &workload).await.unwrap();
        let names: Vec<_> = latest
            .iter()
            .map(|p| p.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["web-a", "web-b"]);

        let ready = ready_pods_of_latest_revision(&reader, &workload)
            .await
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(pod_info(&ready[0]).uid, "web-a-uid");
        assert_eq!(pod_info(&ready[0]).ip, "10.0.0.9");
    }

    #[tokio::test]
    async fn pods_of_another_workload_are_not_owned() {
        let stranger = pod("other-1", "other-rs", "new", true);
        let reader = reader_with(
            vec![replica_set("web-new", "new", "2024-01-02T00:00:00Z", true)],
            vec![pod("web-a", "web-new", "new", true), stranger],
        );
        let owned = list_owned_pods(&reader, &deployment()).await.unwrap();
        assert_eq!(owned.len(), 1);
    }
}
