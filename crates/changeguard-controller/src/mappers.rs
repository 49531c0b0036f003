//! Watch mappers: translate a changed object into the keys to reconcile
//!
//! Mappers run synchronously inside the watch stream, so everything here reads
//! from reflector caches and never calls the API server.

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::{debug, trace};

use changeguard_common::brief::ExecutionBrief;
use changeguard_common::crd::{ChangeDefense, ChangeDefenseExecution};
use changeguard_common::workload::{controller_owner, WorkloadKind};
use changeguard_common::CHANGE_DEFENSE_LABEL_KEY;

/// Owner walks stop after this many hops
const MAX_OWNER_DEPTH: usize = 8;

// =============================================================================
// Policy controller
// =============================================================================

/// Policies in the workload's namespace that target it.
///
/// Resolved against the policy controller's own cache; deleting policies are
/// skipped.
pub fn policies_for_workload(
    policies: &Store<ChangeDefense>,
    kind: WorkloadKind,
    meta: &ObjectMeta,
) -> Vec<ObjectRef<ChangeDefense>> {
    let (Some(namespace), Some(name)) = (meta.namespace.as_deref(), meta.name.as_deref()) else {
        return vec![];
    };
    policies
        .state()
        .iter()
        .filter(|p| p.namespace().as_deref() == Some(namespace))
        .filter(|p| p.protects(WorkloadKind::GROUP, kind.as_str(), name))
        .map(|p| ObjectRef::from_obj(p.as_ref()))
        .collect()
}

/// The policy an execution belongs to, from its label
pub fn policy_for_execution(execution: &ChangeDefenseExecution) -> Option<ObjectRef<ChangeDefense>> {
    let namespace = execution.namespace()?;
    let policy = execution.labels().get(CHANGE_DEFENSE_LABEL_KEY)?;
    Some(ObjectRef::new(policy).within(&namespace))
}

// =============================================================================
// Execution controller
// =============================================================================

/// The execution named by a workload's brief
pub fn execution_for_workload(meta: &ObjectMeta) -> Option<ObjectRef<ChangeDefenseExecution>> {
    let namespace = meta.namespace.as_deref()?;
    let annotations = meta.annotations.as_ref()?;
    match ExecutionBrief::from_annotations(annotations) {
        Ok(Some(brief)) => Some(ObjectRef::new(&brief.execution_name()).within(namespace)),
        Ok(None) => None,
        Err(e) => {
            debug!(
                workload = meta.name.as_deref().unwrap_or_default(),
                error = %e,
                "Ignoring workload with undecodable brief"
            );
            None
        }
    }
}

/// Reflector caches of the workload kinds a pod can be owned through
#[derive(Clone)]
pub struct OwnerCaches {
    /// ReplicaSets (Deployment intermediates)
    pub replica_sets: Store<ReplicaSet>,
    /// Deployments
    pub deployments: Store<Deployment>,
    /// StatefulSets
    pub stateful_sets: Store<StatefulSet>,
}

impl OwnerCaches {
    fn lookup(&self, namespace: &str, kind: WorkloadKind, name: &str) -> Option<ObjectMeta> {
        match kind {
            WorkloadKind::ReplicaSet => self
                .replica_sets
                .get(&ObjectRef::new(name).within(namespace))
                .map(|o| o.metadata.clone()),
            WorkloadKind::Deployment => self
                .deployments
                .get(&ObjectRef::new(name).within(namespace))
                .map(|o| o.metadata.clone()),
            WorkloadKind::StatefulSet => self
                .stateful_sets
                .get(&ObjectRef::new(name).within(namespace))
                .map(|o| o.metadata.clone()),
        }
    }

    /// Top-most annotated controller ancestor of `meta`, from the caches.
    ///
    /// Mirrors the API-backed owner walk: an unsupported owner kind yields
    /// nothing, a missing or replaced owner ends the walk.
    pub fn annotated_owner(&self, meta: &ObjectMeta) -> Option<ObjectMeta> {
        let namespace = meta.namespace.as_deref()?;
        let mut owner_ref = controller_owner(meta).cloned();
        let mut annotated = None;

        for _ in 0..MAX_OWNER_DEPTH {
            let Some(owner) = owner_ref.take() else {
                break;
            };
            let kind = WorkloadKind::from_owner(&owner)?;
            let Some(found) = self.lookup(namespace, kind, &owner.name) else {
                trace!(kind = %kind, owner = %owner.name, "Owner not cached, ending walk");
                break;
            };
            if found.uid.as_deref() != Some(owner.uid.as_str()) {
                break;
            }
            owner_ref = controller_owner(&found).cloned();
            if found
                .annotations
                .as_ref()
                .is_some_and(ExecutionBrief::is_present)
            {
                annotated = Some(found);
            }
        }
        annotated
    }

    /// The execution reviewing the workload that owns `pod`
    pub fn execution_for_pod(&self, pod: &Pod) -> Option<ObjectRef<ChangeDefenseExecution>> {
        let owner = self.annotated_owner(&pod.metadata)?;
        execution_for_workload(&owner)
    }
}
