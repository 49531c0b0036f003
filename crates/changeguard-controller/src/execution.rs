//! ChangeDefenseExecution reconciliation: the batch state machine
//!
//! Per batch:
//! - `Initial` → stamp the resume label, announce the batch → `PreCheck`
//! - `PreCheck` → wait for the pre-check callback
//! - `Progressing` → wait until enough pods of the new revision are ready → `Observing`
//! - `Observing` → after the step's delay, record the batch's pods and
//!   request the post-check → `PostCheck`
//! - `PostCheck` → wait for the post-check callback
//! - `Passed`/`Skipped` → next batch at `Initial`, or done
//! - `Failed` → terminal
//!
//! An execution whose id no longer matches the brief on its workload has been
//! superseded and is left untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use changeguard_common::batch::batch_replicas_bound;
use changeguard_common::crd::{
    ChangeDefenseExecution, DefensePhase, DefenseStatus, DefenseStep,
};
use changeguard_common::events::{actions, phase_event, reasons};
use changeguard_common::kube_client::update_execution_status;
use changeguard_common::revision::{pod_info, pods_of_latest_revision, ready_pods_of_latest_revision};
use changeguard_common::workload::Workload;
use changeguard_common::Error;
use changeguard_review::BatchStart;

use crate::context::Context;

/// Error policy for the ChangeDefenseExecution controller.
///
/// Supersession is final and waits for the next change; everything else
/// requeues after the configured error delay.
pub fn error_policy(
    execution: Arc<ChangeDefenseExecution>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    if matches!(error, Error::Superseded { .. }) {
        debug!(execution = %execution.name_any(), error = %error, "Execution superseded");
        return Action::await_change();
    }
    warn!(execution = %execution.name_any(), error = %error, "Execution reconcile error, will retry");
    Action::requeue(ctx.config.current().error_requeue)
}

/// Reconcile one step of an execution's batch state machine
#[instrument(skip(execution, ctx), fields(execution = %execution.name_any()))]
pub async fn reconcile(
    execution: Arc<ChangeDefenseExecution>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    if execution.metadata.deletion_timestamp.is_some() {
        debug!("Execution is being deleted");
        return Ok(Action::await_change());
    }
    let namespace = execution.namespace().ok_or_else(|| {
        Error::validation_for(execution.name_any(), "ChangeDefenseExecution must be namespaced")
    })?;

    let target = &execution.spec.target.object_ref;
    let kind = target.workload_kind()?;
    let workload = ctx
        .workloads
        .get_workload(&namespace, kind, &target.name)
        .await?
        .ok_or_else(|| Error::not_found(kind.as_str(), format!("{namespace}/{}", target.name)))?;

    let latest = workload.brief()?.map(|b| b.defense_exec_id);
    if latest.as_deref() != Some(execution.spec.id.as_str()) {
        debug!(
            latest = latest.as_deref().unwrap_or("<none>"),
            "Not the latest execution for its workload, skipping"
        );
        return Ok(Action::await_change());
    }

    let now = Utc::now();
    let stored = execution.defense_status();
    let working = if stored.phase.is_none() {
        DefenseStatus::initialized(now)
    } else {
        stored.clone()
    };
    let phase = working.phase.unwrap_or(DefensePhase::Initial);
    info!(batch = working.current_batch, %phase, "Reconciling execution");

    let step = Step {
        ctx: &ctx,
        execution: &execution,
        workload: &workload,
        now,
    };
    let (next, action) = match phase {
        DefensePhase::Initial => step.initial(working).await?,
        DefensePhase::Progressing => step.progressing(working).await?,
        DefensePhase::Observing => step.observing(working).await?,
        DefensePhase::Passed | DefensePhase::Skipped => step.proceed(working)?,
        DefensePhase::PreCheck | DefensePhase::PostCheck | DefensePhase::Failed => {
            (working, Action::await_change())
        }
    };

    commit(&ctx, &execution, &namespace, &stored, next).await?;
    Ok(action)
}

// =============================================================================
// Phase handlers
// =============================================================================

/// Inputs shared by the phase handlers of one reconcile
struct Step<'a> {
    ctx: &'a Context,
    execution: &'a ChangeDefenseExecution,
    workload: &'a Workload,
    now: DateTime<Utc>,
}

impl Step<'_> {
    fn current_step(&self, status: &DefenseStatus) -> Result<&DefenseStep, Error> {
        self.execution
            .spec
            .defense_strategy
            .step(status.current_batch)
            .ok_or_else(|| {
                Error::validation_for_field(
                    self.execution.name_any(),
                    "spec.defenseStrategy.workload.steps",
                    format!("no step for batch {}", status.current_batch),
                )
            })
    }

    /// Resume the rollout and announce the batch
    async fn initial(&self, mut status: DefenseStatus) -> Result<(DefenseStatus, Action), Error> {
        let stamp = self.now.timestamp_millis().to_string();
        self.ctx
            .kube
            .mark_workload_resumed(
                self.workload.namespace(),
                self.workload.kind(),
                self.workload.name(),
                &stamp,
            )
            .await?;

        let batch = BatchStart {
            execution_id: self.execution.spec.id.clone(),
            batch: status.current_batch,
            total_batches: self.execution.spec.defense_strategy.total_batches(),
            namespace: self.workload.namespace().to_string(),
            workload_name: self.workload.name().to_string(),
            workload_kind: self.workload.kind().as_str().to_string(),
        };
        let node = self
            .ctx
            .review
            .submit_change_exec_batch_start_notify(&batch)
            .await?;
        if node.skip_check {
            debug!(batch = batch.batch, "Review service reported skipCheck for batch start");
        }

        status.node_id = Some(node.node_id);
        status.transition(DefensePhase::PreCheck, self.now)?;
        Ok((status, Action::await_change()))
    }

    /// Wait for enough ready pods on the latest revision
    async fn progressing(
        &self,
        mut status: DefenseStatus,
    ) -> Result<(DefenseStatus, Action), Error> {
        let step = self.current_step(&status)?;
        let ready = ready_pods_of_latest_revision(self.ctx.workloads.as_ref(), self.workload)
            .await?
            .len();
        let bound = batch_replicas_bound(&step.partition, self.workload.replicas());

        if ready < usize::try_from(bound).unwrap_or(0) {
            debug!(ready, bound, "Batch still rolling out");
            return Ok((
                status,
                Action::requeue(self.ctx.config.current().progressing_requeue),
            ));
        }
        info!(ready, bound, "Batch rolled out, observing");
        status.transition(DefensePhase::Observing, self.now)?;
        Ok((status, Action::await_change()))
    }

    /// Record the batch's pods and request the post-check once the delay elapsed
    async fn observing(&self, mut status: DefenseStatus) -> Result<(DefenseStatus, Action), Error> {
        let step = self.current_step(&status)?;
        let entered = match status.last_transition_time {
            Some(entered) => entered,
            None => {
                debug!("Observing without a transition time, starting the delay now");
                status.last_transition_time = Some(self.now);
                self.now
            }
        };
        let delay = chrono::Duration::from_std(step.observe_delay())
            .map_err(|e| Error::internal_with_context("observe", e.to_string()))?;
        if entered + delay > self.now {
            return Ok((
                status,
                Action::requeue(self.ctx.config.current().observe_requeue),
            ));
        }

        let pods = pods_of_latest_revision(self.ctx.workloads.as_ref(), self.workload).await?;
        let batch = status.current_batch;
        let recorded = status.record_batch(batch, pods.iter().map(pod_info).collect());

        let node_id = status.node_id.clone().unwrap_or_default();
        let node = self
            .ctx
            .review
            .submit_change_finish_notify(&self.execution.spec.id, &node_id)
            .await?;
        info!(batch, recorded, "Batch observed, post-check requested");

        status.node_id = Some(node.node_id);
        status.transition(DefensePhase::PostCheck, self.now)?;
        Ok((status, Action::await_change()))
    }

    /// Advance to the next batch, or stop after the last one
    fn proceed(&self, mut status: DefenseStatus) -> Result<(DefenseStatus, Action), Error> {
        let total = self.execution.spec.defense_strategy.total_batches();
        if status.current_batch < total {
            status.advance_batch(self.now)?;
            info!(batch = status.current_batch, total, "Advancing to next batch");
        }
        Ok((status, Action::await_change()))
    }
}

// =============================================================================
// Status commit
// =============================================================================

/// Write `next` if the stored status is still the one this reconcile read.
///
/// A status moved by someone else in the meantime (typically a verdict
/// callback) wins; the next reconcile starts from it.
async fn commit(
    ctx: &Context,
    execution: &ChangeDefenseExecution,
    namespace: &str,
    baseline: &DefenseStatus,
    next: DefenseStatus,
) -> Result<(), Error> {
    if next == *baseline {
        return Ok(());
    }
    let name = execution.name_any();
    let written = update_execution_status(ctx.kube.as_ref(), namespace, &name, |fresh, current| {
        if fresh.spec.id != execution.spec.id {
            return Err(Error::superseded(&execution.spec.id, &fresh.spec.id));
        }
        if current != baseline {
            debug!(execution = %name, "Status changed underneath, dropping update");
            return Ok(None);
        }
        Ok(Some(next.clone()))
    })
    .await?;

    let Some(written) = written else {
        return Ok(());
    };
    if written.phase != baseline.phase || written.current_batch != baseline.current_batch {
        publish_transition(ctx, execution, baseline, &written).await;
    }
    Ok(())
}

async fn publish_transition(
    ctx: &Context,
    execution: &ChangeDefenseExecution,
    from: &DefenseStatus,
    to: &DefenseStatus,
) {
    let Some(phase) = to.phase else {
        return;
    };
    let (type_, reason) = phase_event(phase);
    let note = format!(
        "batch {}: {} -> {}",
        to.current_batch,
        from.phase.map(|p| p.as_str()).unwrap_or("<none>"),
        phase
    );
    ctx.events
        .publish(
            &execution.object_ref(&()),
            type_,
            reason,
            actions::RECONCILE,
            Some(note),
        )
        .await;

    let total = execution.spec.defense_strategy.total_batches();
    if phase.is_batch_complete() && to.current_batch >= total {
        ctx.events
            .publish(
                &execution.object_ref(&()),
                kube::runtime::events::EventType::Normal,
                reasons::DEFENSE_PASSED,
                actions::RECONCILE,
                Some(format!("all {total} batches passed review")),
            )
            .await;
    }
}
