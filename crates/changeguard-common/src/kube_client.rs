//! Kubernetes access for reconcilers, webhooks and the callback endpoint
//!
//! Two traits split the surface: [`WorkloadReader`] is the read-only view the
//! revision resolver needs, [`DefenseKube`] covers the policy and execution
//! objects plus the one workload write (the resume label). Both are mocked in
//! tests; [`KubeClientImpl`] implements them against the API server.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use tracing::{debug, warn};

use crate::crd::{
    ChangeDefense, ChangeDefenseExecution, ChangeDefenseExecutionStatus, ChangeDefenseStatus,
    DefenseStatus,
};
use crate::retry::{retry_if, RetryConfig};
use crate::workload::{Workload, WorkloadKind};
use crate::{Error, CHANGE_DEFENSE_LABEL_KEY, CONTINUE_LABEL_KEY, FIELD_MANAGER};

/// Read access to workloads, their ReplicaSets and their pods
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait WorkloadReader: Send + Sync {
    /// Fetch a workload, `None` if it does not exist
    async fn get_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<Option<Workload>, Error>;

    /// List pods matching a selector string
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// List ReplicaSets matching a selector string
    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ReplicaSet>, Error>;
}

/// Operations on ChangeDefense and ChangeDefenseExecution objects
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait DefenseKube: Send + Sync {
    /// Get a ChangeDefense, `None` if it does not exist
    async fn get_policy(&self, namespace: &str, name: &str)
        -> Result<Option<ChangeDefense>, Error>;

    /// List ChangeDefenses in a namespace
    async fn list_policies(&self, namespace: &str) -> Result<Vec<ChangeDefense>, Error>;

    /// Find the ChangeDefense whose status tracks the given execution id
    async fn find_policy_by_execution_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<ChangeDefense>, Error>;

    /// Write a policy status.
    ///
    /// The write is conditional on `policy.metadata.resourceVersion`; a stale
    /// version fails with a 409 conflict.
    async fn replace_policy_status(
        &self,
        policy: &ChangeDefense,
        status: &ChangeDefenseStatus,
    ) -> Result<(), Error>;

    /// Get an execution, `None` if it does not exist
    async fn get_execution(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ChangeDefenseExecution>, Error>;

    /// Find the execution with the given review-service id
    async fn find_execution_by_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<ChangeDefenseExecution>, Error>;

    /// List executions labeled for a policy
    async fn list_executions(
        &self,
        namespace: &str,
        policy: &str,
    ) -> Result<Vec<ChangeDefenseExecution>, Error>;

    /// Create or update an execution's spec and labels.
    ///
    /// Fails if an execution with the same name is being deleted.
    async fn apply_execution(
        &self,
        execution: &ChangeDefenseExecution,
    ) -> Result<ChangeDefenseExecution, Error>;

    /// Delete an execution; a missing execution is not an error
    async fn delete_execution(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Write an execution status, conditional on its resourceVersion
    async fn replace_execution_status(
        &self,
        execution: &ChangeDefenseExecution,
        status: &DefenseStatus,
    ) -> Result<(), Error>;

    /// Stamp the resume label on a workload
    async fn mark_workload_resumed(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
        stamp: &str,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadReader for KubeClientImpl {
    async fn get_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<Option<Workload>, Error> {
        let client = self.client.clone();
        let workload = match kind {
            WorkloadKind::Deployment => Api::<Deployment>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::Deployment),
            WorkloadKind::StatefulSet => Api::<StatefulSet>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::StatefulSet),
            WorkloadKind::ReplicaSet => Api::<ReplicaSet>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::ReplicaSet),
        };
        Ok(workload)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items)
    }

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ReplicaSet>, Error> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let sets = api.list(&ListParams::default().labels(selector)).await?;
        Ok(sets.items)
    }
}

#[async_trait]
impl DefenseKube for KubeClientImpl {
    async fn get_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ChangeDefense>, Error> {
        let api: Api<ChangeDefense> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_policies(&self, namespace: &str) -> Result<Vec<ChangeDefense>, Error> {
        let api: Api<ChangeDefense> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn find_policy_by_execution_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<ChangeDefense>, Error> {
        let api: Api<ChangeDefense> = Api::all(self.client.clone());
        let policies = api.list(&ListParams::default()).await?;
        Ok(policies
            .items
            .into_iter()
            .find(|p| p.current_execution_id() == Some(execution_id)))
    }

    async fn replace_policy_status(
        &self,
        policy: &ChangeDefense,
        status: &ChangeDefenseStatus,
    ) -> Result<(), Error> {
        let namespace = policy.namespace().unwrap_or_default();
        let api: Api<ChangeDefense> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": policy.resource_version() },
            "status": status,
        });
        api.patch_status(
            &policy.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn get_execution(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ChangeDefenseExecution>, Error> {
        let api: Api<ChangeDefenseExecution> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn find_execution_by_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<ChangeDefenseExecution>, Error> {
        let api: Api<ChangeDefenseExecution> = Api::all(self.client.clone());
        let executions = api.list(&ListParams::default()).await?;
        Ok(executions
            .items
            .into_iter()
            .find(|e| e.spec.id == execution_id))
    }

    async fn list_executions(
        &self,
        namespace: &str,
        policy: &str,
    ) -> Result<Vec<ChangeDefenseExecution>, Error> {
        let api: Api<ChangeDefenseExecution> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{}={}", CHANGE_DEFENSE_LABEL_KEY, policy);
        Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
    }

    async fn apply_execution(
        &self,
        execution: &ChangeDefenseExecution,
    ) -> Result<ChangeDefenseExecution, Error> {
        let namespace = execution
            .namespace()
            .ok_or_else(|| Error::validation("execution must be namespaced"))?;
        let name = execution.name_any();
        let api: Api<ChangeDefenseExecution> = Api::namespaced(self.client.clone(), &namespace);

        if let Some(existing) = api.get_opt(&name).await? {
            if existing.metadata.deletion_timestamp.is_some() {
                return Err(Error::internal_with_context(
                    "apply_execution",
                    format!("execution {namespace}/{name} is being deleted"),
                ));
            }
        }

        let applied = api
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(execution),
            )
            .await?;
        debug!(execution = %name, namespace = %namespace, "Execution applied via SSA");
        Ok(applied)
    }

    async fn delete_execution(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ChangeDefenseExecution> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(execution = %name, "Execution already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_execution_status(
        &self,
        execution: &ChangeDefenseExecution,
        status: &DefenseStatus,
    ) -> Result<(), Error> {
        let namespace = execution.namespace().unwrap_or_default();
        let api: Api<ChangeDefenseExecution> = Api::namespaced(self.client.clone(), &namespace);
        let status = ChangeDefenseExecutionStatus {
            defense_status: status.clone(),
        };
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": execution.resource_version() },
            "status": status,
        });
        api.patch_status(
            &execution.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn mark_workload_resumed(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
        stamp: &str,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": { "labels": { CONTINUE_LABEL_KEY: stamp } }
        });
        let params = PatchParams::default();
        let client = self.client.clone();
        match kind {
            WorkloadKind::Deployment => {
                Api::<Deployment>::namespaced(client, namespace)
                    .patch(name, &params, &Patch::Merge(&patch))
                    .await?;
            }
            WorkloadKind::StatefulSet => {
                Api::<StatefulSet>::namespaced(client, namespace)
                    .patch(name, &params, &Patch::Merge(&patch))
                    .await?;
            }
            WorkloadKind::ReplicaSet => {
                warn!(workload = %name, "Refusing to label a ReplicaSet as resumed");
                return Err(Error::validation_for(
                    name,
                    "ReplicaSets are not protected workloads",
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Optimistic-concurrency status updates
// =============================================================================

/// Conflicts tolerated before a status update gives up
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Pause before the first conflict retry; later pauses double, with jitter
const CONFLICT_BACKOFF: Duration = Duration::from_millis(50);

fn conflict_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: MAX_CONFLICT_RETRIES,
        initial_delay: CONFLICT_BACKOFF,
        max_delay: Duration::from_secs(1),
        ..Default::default()
    }
}

/// Update an execution's status against its latest stored version.
///
/// `decide` sees the freshly read status and returns the status to write, or
/// `None` when nothing should change. A 409 conflict re-reads the execution
/// and asks `decide` again. Returns the status that was written.
pub async fn update_execution_status<F>(
    kube: &dyn DefenseKube,
    namespace: &str,
    name: &str,
    decide: F,
) -> Result<Option<DefenseStatus>, Error>
where
    F: FnMut(&ChangeDefenseExecution, &DefenseStatus) -> Result<Option<DefenseStatus>, Error>,
{
    let decide = Mutex::new(decide);
    retry_if(
        &conflict_retry(),
        "update execution status",
        || write_execution_status(kube, namespace, name, &decide),
        Error::is_conflict,
    )
    .await
}

async fn write_execution_status<F>(
    kube: &dyn DefenseKube,
    namespace: &str,
    name: &str,
    decide: &Mutex<F>,
) -> Result<Option<DefenseStatus>, Error>
where
    F: FnMut(&ChangeDefenseExecution, &DefenseStatus) -> Result<Option<DefenseStatus>, Error>,
{
    let execution = kube
        .get_execution(namespace, name)
        .await?
        .ok_or_else(|| Error::not_found("ChangeDefenseExecution", format!("{namespace}/{name}")))?;
    let current = execution.defense_status();
    let decision = {
        let mut decide = decide.lock().unwrap_or_else(PoisonError::into_inner);
        (*decide)(&execution, &current)?
    };
    let Some(next) = decision else {
        return Ok(None);
    };
    if next == current {
        return Ok(None);
    }
    kube.replace_execution_status(&execution, &next).await?;
    debug!(execution = %name, phase = ?next.phase, "Execution status written");
    Ok(Some(next))
}

/// Update a policy's status against its latest stored version.
///
/// Same contract as [`update_execution_status`].
pub async fn update_policy_status<F>(
    kube: &dyn DefenseKube,
    namespace: &str,
    name: &str,
    decide: F,
) -> Result<Option<ChangeDefenseStatus>, Error>
where
    F: FnMut(&ChangeDefense, &ChangeDefenseStatus) -> Result<Option<ChangeDefenseStatus>, Error>,
{
    let decide = Mutex::new(decide);
    retry_if(
        &conflict_retry(),
        "update policy status",
        || write_policy_status(kube, namespace, name, &decide),
        Error::is_conflict,
    )
    .await
}

async fn write_policy_status<F>(
    kube: &dyn DefenseKube,
    namespace: &str,
    name: &str,
    decide: &Mutex<F>,
) -> Result<Option<ChangeDefenseStatus>, Error>
where
    F: FnMut(&ChangeDefense, &ChangeDefenseStatus) -> Result<Option<ChangeDefenseStatus>, Error>,
{
    let policy = kube
        .get_policy(namespace, name)
        .await?
        .ok_or_else(|| Error::not_found("ChangeDefense", format!("{namespace}/{name}")))?;
    let current = policy.status.clone().unwrap_or_default();
    let decision = {
        let mut decide = decide.lock().unwrap_or_else(PoisonError::into_inner);
        (*decide)(&policy, &current)?
    };
    let Some(next) = decision else {
        return Ok(None);
    };
    if next == current {
        return Ok(None);
    }
    kube.replace_policy_status(&policy, &next).await?;
    debug!(policy = %name, phase = ?next.phase, "Policy status written");
    Ok(Some(next))
}
