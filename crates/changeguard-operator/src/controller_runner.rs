//! Controller runner - builds controller futures
//!
//! Each `build_*` function returns boxed futures that the caller composes.
//! This keeps controller construction pure and testable.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use changeguard_common::crd::{ChangeDefense, ChangeDefenseExecution};
use changeguard_common::workload::WorkloadKind;
use changeguard_controller::mappers::{self, OwnerCaches};
use changeguard_controller::{execution, policy, Context};

/// Boxed controller or reflector future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Reconciles in flight per controller
const CONTROLLER_CONCURRENCY: u16 = 100;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn controller_config() -> ControllerConfig {
    ControllerConfig::default().concurrency(CONTROLLER_CONCURRENCY)
}

/// Build the ChangeDefense controller
///
/// Workload changes map to the policies targeting them (resolved against the
/// controller's own policy cache); execution changes map to their policy.
pub fn build_policy_controller(client: Client, ctx: Arc<Context>) -> ControllerFuture {
    let policies: Api<ChangeDefense> = Api::all(client.clone());
    let controller = Controller::new(policies, watcher_config()).with_config(controller_config());
    let for_deployments = controller.store();
    let for_stateful_sets = controller.store();

    tracing::info!("- ChangeDefense controller");
    Box::pin(
        controller
            .watches(
                Api::<Deployment>::all(client.clone()),
                watcher_config(),
                move |d| {
                    mappers::policies_for_workload(&for_deployments, WorkloadKind::Deployment, &d.metadata)
                },
            )
            .watches(
                Api::<StatefulSet>::all(client.clone()),
                watcher_config(),
                move |s| {
                    mappers::policies_for_workload(
                        &for_stateful_sets,
                        WorkloadKind::StatefulSet,
                        &s.metadata,
                    )
                },
            )
            .watches(
                Api::<ChangeDefenseExecution>::all(client),
                watcher_config(),
                |e| mappers::policy_for_execution(&e),
            )
            .shutdown_on_signal()
            .run(policy::reconcile, policy::error_policy, ctx)
            .for_each(log_reconcile_result("ChangeDefense")),
    )
}

/// Build the ChangeDefenseExecution controller
///
/// Workload changes map to the execution in their brief; pod changes map
/// through `owners` to the owning workload's brief.
pub fn build_execution_controller(
    client: Client,
    ctx: Arc<Context>,
    owners: OwnerCaches,
) -> ControllerFuture {
    let executions: Api<ChangeDefenseExecution> = Api::all(client.clone());

    tracing::info!("- ChangeDefenseExecution controller");
    Box::pin(
        Controller::new(executions, watcher_config())
            .with_config(controller_config())
            .watches(
                Api::<Deployment>::all(client.clone()),
                watcher_config(),
                |d| mappers::execution_for_workload(&d.metadata),
            )
            .watches(
                Api::<StatefulSet>::all(client.clone()),
                watcher_config(),
                |s| mappers::execution_for_workload(&s.metadata),
            )
            .watches(Api::<Pod>::all(client), watcher_config(), move |pod| {
                owners.execution_for_pod(&pod)
            })
            .shutdown_on_signal()
            .run(execution::reconcile, execution::error_policy, ctx)
            .for_each(log_reconcile_result("ChangeDefenseExecution")),
    )
}

/// Build the reflector caches used by the pod mapper, plus the futures that
/// keep them filled
pub fn build_owner_caches(client: &Client) -> (OwnerCaches, Vec<ControllerFuture>) {
    let (replica_sets, rs_future) = reflect::<ReplicaSet>(client);
    let (deployments, deploy_future) = reflect::<Deployment>(client);
    let (stateful_sets, sts_future) = reflect::<StatefulSet>(client);
    (
        OwnerCaches {
            replica_sets,
            deployments,
            stateful_sets,
        },
        vec![rs_future, deploy_future, sts_future],
    )
}

fn reflect<K>(client: &Client) -> (Store<K>, ControllerFuture)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(
        writer,
        watcher::watcher(Api::<K>::all(client.clone()), watcher_config()),
    )
    .default_backoff();
    let future = stream.for_each(|event| {
        if let Err(e) = event {
            tracing::warn!(error = %e, "Owner cache watch error");
        }
        std::future::ready(())
    });
    (reader, Box::pin(future))
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
