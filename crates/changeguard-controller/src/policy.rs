//! ChangeDefense reconciliation
//!
//! Each reconcile makes the cluster hold exactly one execution for the policy:
//! the one named by the brief on the target workload. Executions for older
//! briefs are deleted, the current one is created or refreshed from the
//! policy spec, and a finished execution flips the policy to `Passed`.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{stream, StreamExt};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use changeguard_common::brief::{execution_name, ExecutionBrief};
use changeguard_common::crd::{
    ChangeDefense, ChangeDefenseExecution, ChangeDefenseExecutionSpec, DefensePhase,
};
use changeguard_common::kube_client::update_policy_status;
use changeguard_common::{Error, CHANGE_DEFENSE_LABEL_KEY};

use crate::context::Context;

/// Error policy for the ChangeDefense controller.
///
/// Logs the error and requeues after the configured error delay.
pub fn error_policy(policy: Arc<ChangeDefense>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(policy = %policy.key(), error = %error, "ChangeDefense reconcile error, will retry");
    Action::requeue(ctx.config.current().error_requeue)
}

/// Reconcile a ChangeDefense against the brief on its target workload
#[instrument(skip(policy, ctx), fields(policy = %policy.key()))]
pub async fn reconcile(policy: Arc<ChangeDefense>, ctx: Arc<Context>) -> Result<Action, Error> {
    if policy.metadata.deletion_timestamp.is_some() {
        debug!("ChangeDefense is being deleted");
        return Ok(Action::await_change());
    }
    let namespace = policy
        .namespace()
        .ok_or_else(|| Error::validation_for(policy.key(), "ChangeDefense must be namespaced"))?;
    let name = policy.name_any();

    let target = &policy.spec.target.object_ref;
    let kind = target.workload_kind()?;
    let workload = ctx
        .workloads
        .get_workload(&namespace, kind, &target.name)
        .await?
        .ok_or_else(|| Error::not_found(kind.as_str(), format!("{namespace}/{}", target.name)))?;

    let Some(brief) = workload.brief()? else {
        debug!(workload = %workload.key(), "No execution brief on target, nothing to track");
        return Ok(Action::await_change());
    };

    recycle_stale_executions(&ctx, &namespace, &name, &brief.defense_exec_id).await?;

    let desired = build_execution(&policy, &namespace, &brief);
    let execution = ctx.kube.apply_execution(&desired).await?;

    aggregate_outcome(&ctx, &policy, &namespace, &execution).await?;
    Ok(Action::await_change())
}

// =============================================================================
// Stale execution recycling
// =============================================================================

/// Delete every execution of the policy whose id differs from `current_id`.
///
/// Deletions run concurrently up to the configured fan-out. All of them are
/// attempted; the first error is returned afterwards.
async fn recycle_stale_executions(
    ctx: &Context,
    namespace: &str,
    policy_name: &str,
    current_id: &str,
) -> Result<(), Error> {
    let stale: Vec<String> = ctx
        .kube
        .list_executions(namespace, policy_name)
        .await?
        .into_iter()
        .filter(|e| e.spec.id != current_id)
        .map(|e| e.name_any())
        .collect();
    if stale.is_empty() {
        return Ok(());
    }

    info!(count = stale.len(), current = %current_id, "Recycling stale executions");
    let concurrency = ctx.config.current().stale_delete_concurrency;
    let results: Vec<Result<(), Error>> = stream::iter(stale)
        .map(|name| async move {
            let result = ctx.kube.delete_execution(namespace, &name).await;
            if let Err(e) = &result {
                warn!(execution = %name, error = %e, "Failed to delete stale execution");
            }
            result
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    results.into_iter().collect::<Result<Vec<()>, Error>>()?;
    Ok(())
}

// =============================================================================
// Execution materialization
// =============================================================================

/// Execution object for `brief`, snapshotting the policy spec
pub fn build_execution(
    policy: &ChangeDefense,
    namespace: &str,
    brief: &ExecutionBrief,
) -> ChangeDefenseExecution {
    let mut execution = ChangeDefenseExecution::new(
        &execution_name(&policy.name_any(), &brief.defense_exec_id),
        ChangeDefenseExecutionSpec {
            id: brief.defense_exec_id.clone(),
            target: policy.spec.target.clone(),
            defense_strategy: policy.spec.defense_strategy.clone(),
            risk_policy: policy.spec.risk_policy.clone(),
        },
    );
    execution.metadata.namespace = Some(namespace.to_string());
    execution.metadata.labels = Some(BTreeMap::from([(
        CHANGE_DEFENSE_LABEL_KEY.to_string(),
        policy.name_any(),
    )]));
    execution
}

/// Mark the policy `Passed` once its execution cleared the final batch
async fn aggregate_outcome(
    ctx: &Context,
    policy: &ChangeDefense,
    namespace: &str,
    execution: &ChangeDefenseExecution,
) -> Result<(), Error> {
    let status = execution.defense_status();
    let finished = status.current_batch == execution.spec.defense_strategy.total_batches()
        && status.phase.is_some_and(DefensePhase::is_batch_complete);
    if !finished {
        return Ok(());
    }

    let execution_id = execution.spec.id.clone();
    let written = update_policy_status(ctx.kube.as_ref(), namespace, &policy.name_any(), |_, current| {
        let tracks_execution = current
            .current_execution_id
            .as_deref()
            .is_none_or(|id| id == execution_id);
        if !tracks_execution || current.phase == Some(DefensePhase::Passed) {
            return Ok(None);
        }
        let mut next = current.clone();
        next.phase = Some(DefensePhase::Passed);
        Ok(Some(next))
    })
    .await?;

    if written.is_some() {
        info!(execution = %execution.name_any(), "All batches passed, policy marked Passed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use changeguard_common::crd::{
        ChangeDefenseExecutionStatus, ChangeDefenseSpec, ChangeDefenseStatus, DefenseStatus,
    };
    use changeguard_common::kube_client::{MockDefenseKube, MockWorkloadReader};
    use changeguard_common::workload::Workload;
    use changeguard_common::BRIEF_ANNOTATION_KEY;
    use changeguard_review::MockReviewService;
    use k8s_openapi::api::apps::v1::Deployment;

    fn policy(steps: usize) -> ChangeDefense {
        let steps: Vec<_> = (0..steps)
            .map(|_| serde_json::json!({"partition": "50%", "checkAfterComplete": 0}))
            .collect();
        let mut cd = ChangeDefense::new(
            "guard",
            serde_json::from_value::<ChangeDefenseSpec>(serde_json::json!({
                "target": {
                    "type": "workload",
                    "objectRef": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "web"}
                },
                "defenseStrategy": {"workload": {"steps": steps}}
            }))
            .unwrap(),
        );
        cd.metadata.namespace = Some("prod".into());
        cd.metadata.resource_version = Some("1".into());
        cd.status = Some(ChangeDefenseStatus {
            current_execution_id: Some("prod-web-2-abcde".into()),
            verdict: None,
            phase: Some(DefensePhase::Progressing),
        });
        cd
    }

    fn workload(brief_id: Option<&str>) -> Workload {
        let annotations = match brief_id {
            Some(id) => serde_json::json!({
                BRIEF_ANNOTATION_KEY: ExecutionBrief::new(2, id, "guard").encode().unwrap()
            }),
            None => serde_json::json!({}),
        };
        Workload::Deployment(
            serde_json::from_value::<Deployment>(serde_json::json!({
                "metadata": {
                    "name": "web", "namespace": "prod", "uid": "dep-uid",
                    "annotations": annotations
                },
                "spec": {"selector": {"matchLabels": {"app": "web"}}, "template": {}}
            }))
            .unwrap(),
        )
    }

    fn execution(policy: &ChangeDefense, id: &str) -> ChangeDefenseExecution {
        build_execution(policy, "prod", &ExecutionBrief::new(2, id, "guard"))
    }

    fn reader(brief_id: Option<&'static str>) -> MockWorkloadReader {
        let mut reader = MockWorkloadReader::new();
        reader
            .expect_get_workload()
            .returning(move |_, _, _| Ok(Some(workload(brief_id))));
        reader
    }

    fn context(kube: MockDefenseKube, reader: MockWorkloadReader) -> Arc<Context> {
        Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(reader),
            Arc::new(MockReviewService::new()),
        ))
    }

    #[test]
    fn execution_snapshots_policy_and_is_labeled() {
        let cd = policy(2);
        let exec = execution(&cd, "prod-web-2-abcde");
        assert_eq!(exec.name_any(), "guard-prod-web-2-abcde");
        assert_eq!(exec.namespace().as_deref(), Some("prod"));
        assert_eq!(exec.spec.id, "prod-web-2-abcde");
        assert_eq!(exec.spec.defense_strategy.total_batches(), 2);
        assert_eq!(
            exec.labels().get(CHANGE_DEFENSE_LABEL_KEY).map(String::as_str),
            Some("guard")
        );
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    #[tokio::test]
    async fn story_workload_without_brief_is_left_alone() {
        // No list, apply or status expectations: any call would panic
        let ctx = context(MockDefenseKube::new(), reader(None));
        let action = reconcile(Arc::new(policy(1)), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn story_stale_executions_are_recycled_before_apply() {
        let cd = policy(2);
        let existing = vec![
            execution(&cd, "prod-web-1-zzzzz"),
            execution(&cd, "prod-web-2-abcde"),
            execution(&cd, "prod-web-0-yyyyy"),
        ];
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let deleted_clone = deleted.clone();

        let mut kube = MockDefenseKube::new();
        kube.expect_list_executions()
            .withf(|ns, policy| ns == "prod" && policy == "guard")
            .returning(move |_, _| Ok(existing.clone()));
        kube.expect_delete_execution().returning(move |_, name| {
            deleted_clone.lock().unwrap().push(name.to_string());
            Ok(())
        });
        kube.expect_apply_execution()
            .withf(|exec| exec.spec.id == "prod-web-2-abcde")
            .times(1)
            .returning(|exec| Ok(exec.clone()));

        reconcile(Arc::new(cd), context(kube, reader(Some("prod-web-2-abcde"))))
            .await
            .unwrap();

        let mut deleted = deleted.lock().unwrap().clone();
        deleted.sort();
        assert_eq!(
            deleted,
            vec!["guard-prod-web-0-yyyyy", "guard-prod-web-1-zzzzz"]
        );
    }

    #[tokio::test]
    async fn story_every_deletion_is_attempted_and_first_error_wins() {
        let cd = policy(1);
        let existing = vec![execution(&cd, "old-a"), execution(&cd, "old-b")];
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let mut kube = MockDefenseKube::new();
        kube.expect_list_executions()
            .returning(move |_, _| Ok(existing.clone()));
        kube.expect_delete_execution().returning(move |_, name| {
            *attempts_clone.lock().unwrap() += 1;
            if name.ends_with("old-a") {
                Err(Error::internal("etcd unavailable"))
            } else {
                Ok(())
            }
        });
        kube.expect_apply_execution().never();

        let err = reconcile(Arc::new(cd), context(kube, reader(Some("current"))))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("etcd unavailable"));
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn story_finished_execution_marks_policy_passed() {
        let cd = policy(2);
        let stored = cd.clone();
        let written = Arc::new(Mutex::new(None));
        let written_clone = written.clone();

        let mut kube = MockDefenseKube::new();
        kube.expect_list_executions().returning(|_, _| Ok(vec![]));
        kube.expect_apply_execution().returning(|exec| {
            let mut exec = exec.clone();
            let mut status = DefenseStatus::initialized(chrono::Utc::now());
            status.current_batch = 2;
            status.phase = Some(DefensePhase::Passed);
            exec.status = Some(ChangeDefenseExecutionStatus {
                defense_status: status,
            });
            Ok(exec)
        });
        kube.expect_get_policy()
            .returning(move |_, _| Ok(Some(stored.clone())));
        kube.expect_replace_policy_status()
            .times(1)
            .returning(move |_, status| {
                *written_clone.lock().unwrap() = Some(status.clone());
                Ok(())
            });

        reconcile(Arc::new(cd), context(kube, reader(Some("prod-web-2-abcde"))))
            .await
            .unwrap();

        let status = written.lock().unwrap().clone().unwrap();
        assert_eq!(status.phase, Some(DefensePhase::Passed));
        assert_eq!(status.current_execution_id.as_deref(), Some("prod-web-2-abcde"));
    }

    #[tokio::test]
    async fn story_unfinished_execution_leaves_policy_status_alone() {
        let cd = policy(2);
        let mut kube = MockDefenseKube::new();
        kube.expect_list_executions().returning(|_, _| Ok(vec![]));
        kube.expect_apply_execution().returning(|exec| {
            let mut exec = exec.clone();
            let mut status = DefenseStatus::initialized(chrono::Utc::now());
            status.phase = Some(DefensePhase::Passed);
            exec.status = Some(ChangeDefenseExecutionStatus {
                defense_status: status,
            });
            Ok(exec)
        });
        kube.expect_replace_policy_status().never();

        reconcile(Arc::new(cd), context(kube, reader(Some("prod-web-2-abcde"))))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_newer_admission_is_not_overwritten_by_old_outcome() {
        let mut cd = policy(1);
        if let Some(status) = cd.status.as_mut() {
            status.current_execution_id = Some("prod-web-3-newer".into());
            status.phase = Some(DefensePhase::PreCheck);
        }
        let stored = cd.clone();

        let mut kube = MockDefenseKube::new();
        kube.expect_list_executions().returning(|_, _| Ok(vec![]));
        kube.expect_apply_execution().returning(|exec| {
            let mut exec = exec.clone();
            let mut status = DefenseStatus::initialized(chrono::Utc::now());
            status.phase = Some(DefensePhase::Passed);
            exec.status = Some(ChangeDefenseExecutionStatus {
                defense_status: status,
            });
            Ok(exec)
        });
        kube.expect_get_policy()
            .returning(move |_, _| Ok(Some(stored.clone())));
        kube.expect_replace_policy_status().never();

        reconcile(Arc::new(cd), context(kube, reader(Some("prod-web-2-abcde"))))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_missing_target_is_an_error() {
        let mut reader = MockWorkloadReader::new();
        reader.expect_get_workload().returning(|_, _, _| Ok(None));
        let err = reconcile(Arc::new(policy(1)), context(MockDefenseKube::new(), reader))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
