//! Plan executor
//!
//! Drives the head of each queue through its state machine. Every step is
//! persisted right away through a compare-and-swap status write that only
//! applies while the head is still the entry that was executed, so a plan
//! replaced concurrently is never corrupted by a stale tick.

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::events::EventType;
use tracing::{debug, error, info, instrument, warn};

use arango_common::crd::{
    ActionPriority, DeploymentStatus, Plan, PlanAction, MEMBER_ID_PREVIOUS_ACTION,
};
use arango_common::events::reasons;
use arango_common::metrics;
use arango_common::{Error, Result};

use crate::action::{Action, ActionRegistry, Progress};
use crate::context::ActionContext;

const ABORT: &str = "abort";
const TIMEOUT: &str = "timeout";

fn queue(status: &DeploymentStatus, priority: ActionPriority) -> &Plan {
    match priority {
        ActionPriority::High => &status.high_priority_plan,
        ActionPriority::Normal => &status.plan,
    }
}

fn queue_mut(status: &mut DeploymentStatus, priority: ActionPriority) -> &mut Plan {
    match priority {
        ActionPriority::High => &mut status.high_priority_plan,
        ActionPriority::Normal => &mut status.plan,
    }
}

/// What happened to the head of a queue in one step
enum Step {
    /// Popped; the next entry can run right away
    Completed,
    /// Waiting for a later tick
    Waiting,
    /// The whole queue was dropped
    Aborted,
}

/// Executes the high-priority queue, then the normal one
#[derive(Clone)]
pub struct PlanExecutor {
    registry: Arc<ActionRegistry>,
}

impl PlanExecutor {
    /// Executor over a registry built at startup
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self { registry }
    }

    /// Run both queues as far as they go without waiting
    ///
    /// Returns true if the caller should come back soon because an action
    /// is waiting or a queue was dropped and must be rebuilt. The normal
    /// queue only runs once the high-priority queue is drained.
    #[instrument(skip(self, ctx), fields(deployment = %ctx.deployment_name()))]
    pub async fn execute(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let high = self.execute_queue(ctx, ActionPriority::High).await?;
        let pending = !queue(&ctx.status().await?, ActionPriority::High).is_empty();
        if pending {
            return Ok(true);
        }
        let normal = self.execute_queue(ctx, ActionPriority::Normal).await?;
        Ok(high || normal)
    }

    async fn execute_queue(&self, ctx: &dyn ActionContext, priority: ActionPriority) -> Result<bool> {
        loop {
            let status = ctx.status().await?;
            let Some(head) = queue(&status, priority).first().cloned() else {
                return Ok(false);
            };

            let action = match self.registry.create(&head) {
                Ok(action) => action,
                Err(e @ Error::UnknownAction { .. }) => {
                    error!(action = %head.type_, id = %head.id, "plan holds an action type without factory");
                    return Err(e);
                }
                Err(e) => {
                    warn!(action = %head.type_, id = %head.id, error = %e, "cannot build action, dropping plan");
                    ctx.publish_event(
                        EventType::Warning,
                        reasons::PLAN_ACTION_FAILED,
                        format!("Action {} is invalid: {e}", head.type_),
                    )
                    .await;
                    self.abort(ctx, priority, &head, ABORT).await?;
                    return Ok(true);
                }
            };

            match self.step(ctx, priority, &head, action.as_ref()).await? {
                Step::Completed => continue,
                Step::Waiting | Step::Aborted => return Ok(true),
            }
        }
    }

    async fn step(
        &self,
        ctx: &dyn ActionContext,
        priority: ActionPriority,
        head: &PlanAction,
        action: &dyn Action,
    ) -> Result<Step> {
        let type_ = head.type_.as_str();

        if !head.is_started() {
            debug!(action = type_, member_id = %head.member_id, "starting action");
            let done = match action.start(ctx).await {
                Ok(done) => done,
                Err(e) => return self.start_failed(ctx, priority, head, action, e).await,
            };
            if !done {
                self.mark_started(ctx, priority, head).await?;
                metrics::record_action_current(type_, 1);
                return Ok(Step::Waiting);
            }
        } else {
            match action.check_progress(ctx).await {
                Ok(Progress::Wait) if expired(head, action, ctx) => {
                    metrics::record_action_current(type_, -1);
                    self.time_out(ctx, priority, head).await?;
                    return Ok(Step::Aborted);
                }
                Ok(Progress::Wait) => return Ok(Step::Waiting),
                Ok(Progress::Ready) => metrics::record_action_current(type_, -1),
                Ok(Progress::Abort) => {
                    info!(action = type_, member_id = %head.member_id, "action aborted, dropping plan");
                    metrics::record_action_current(type_, -1);
                    metrics::record_action_failed(type_);
                    ctx.publish_event(
                        EventType::Warning,
                        reasons::PLAN_ABORTED,
                        format!("Action {type_} on {} aborted the plan", describe_target(head)),
                    )
                    .await;
                    self.abort(ctx, priority, head, ABORT).await?;
                    return Ok(Step::Aborted);
                }
                Err(e) if expired(head, action, ctx) => {
                    warn!(action = type_, member_id = %head.member_id, error = %e, "progress check failed past deadline");
                    metrics::record_action_current(type_, -1);
                    self.time_out(ctx, priority, head).await?;
                    return Ok(Step::Aborted);
                }
                Err(e) => {
                    warn!(action = type_, member_id = %head.member_id, error = %e, "progress check failed");
                    return Err(e);
                }
            }
        }

        self.complete(ctx, priority, head, action).await?;
        Ok(Step::Completed)
    }

    /// Failed starts are retried silently inside the grace window. Outside
    /// of it the queue is dropped and the error surfaces.
    async fn start_failed(
        &self,
        ctx: &dyn ActionContext,
        priority: ActionPriority,
        head: &PlanAction,
        action: &dyn Action,
        e: Error,
    ) -> Result<Step> {
        let type_ = head.type_.as_str();
        if let Some(grace) = action.start_failure_grace_period() {
            if age(head) < grace && !expired(head, action, ctx) {
                debug!(action = type_, error = %e, "start failed within grace period, retrying");
                return Ok(Step::Waiting);
            }
        }
        if expired(head, action, ctx) {
            self.time_out(ctx, priority, head).await?;
            return Err(e);
        }
        metrics::record_action_failed(type_);
        warn!(action = type_, member_id = %head.member_id, error = %e, "action start failed, dropping plan");
        ctx.publish_event(
            EventType::Warning,
            reasons::PLAN_ACTION_FAILED,
            format!("Action {type_} on {} failed: {e}", describe_target(head)),
        )
        .await;
        self.abort(ctx, priority, head, ABORT).await?;
        Err(e)
    }

    async fn time_out(
        &self,
        ctx: &dyn ActionContext,
        priority: ActionPriority,
        head: &PlanAction,
    ) -> Result<()> {
        let type_ = head.type_.as_str();
        warn!(action = type_, member_id = %head.member_id, "action timed out, dropping plan");
        metrics::record_action_failed(type_);
        ctx.publish_event(
            EventType::Warning,
            reasons::PLAN_TIMEOUT,
            format!("Action {type_} on {} timed out", describe_target(head)),
        )
        .await;
        self.abort(ctx, priority, head, TIMEOUT).await
    }

    async fn mark_started(
        &self,
        ctx: &dyn ActionContext,
        priority: ActionPriority,
        head: &PlanAction,
    ) -> Result<()> {
        let id = head.id.clone();
        let now = Utc::now();
        ctx.mutate_status(Box::new(move |s| {
            let Some(entry) = queue_mut(s, priority).0.first_mut() else {
                return false;
            };
            if entry.id != id || entry.start_time.is_some() {
                return false;
            }
            entry.start_time = Some(now);
            true
        }))
        .await?;
        Ok(())
    }

    async fn complete(
        &self,
        ctx: &dyn ActionContext,
        priority: ActionPriority,
        head: &PlanAction,
        action: &dyn Action,
    ) -> Result<()> {
        let type_ = head.type_.as_str();
        if let Err(e) = action.post(ctx).await {
            warn!(action = type_, error = %e, "post-completion step failed");
        }
        metrics::record_action_succeeded(type_);

        let id = head.id.clone();
        let appended = action.append_plan();
        let member_id = action.member_id();
        let popped = ctx
            .mutate_status(Box::new(move |s| {
                let plan = queue_mut(s, priority);
                if plan.first().map(|a| a.id.as_str()) != Some(id.as_str()) {
                    return false;
                }
                let rest = plan.0.split_off(1);
                let mut next: Vec<PlanAction> = appended.clone();
                next.extend(rest);
                if let Some(head) = next.first_mut() {
                    if head.member_id == MEMBER_ID_PREVIOUS_ACTION {
                        head.member_id = member_id.clone();
                    }
                }
                *plan = Plan::from(next);
                true
            }))
            .await?;
        if popped {
            debug!(action = type_, member_id = %head.member_id, "action completed");
        }

        if action.reload_cached_status() {
            ctx.reload_cached_status().await?;
        }
        Ok(())
    }

    async fn abort(
        &self,
        ctx: &dyn ActionContext,
        priority: ActionPriority,
        head: &PlanAction,
        reason: &'static str,
    ) -> Result<()> {
        metrics::record_plan_abort(reason);
        let id = head.id.clone();
        ctx.mutate_status(Box::new(move |s| {
            let plan = queue_mut(s, priority);
            if plan.first().map(|a| a.id.as_str()) != Some(id.as_str()) {
                return false;
            }
            *plan = Plan::new();
            true
        }))
        .await?;
        Ok(())
    }
}

fn age(head: &PlanAction) -> std::time::Duration {
    Utc::now()
        .signed_duration_since(head.creation_time)
        .to_std()
        .unwrap_or_default()
}

fn expired(head: &PlanAction, action: &dyn Action, ctx: &dyn ActionContext) -> bool {
    age(head) > action.timeout(ctx.spec())
}

fn describe_target(head: &PlanAction) -> String {
    match (&head.group, head.member_id.as_str()) {
        (Some(group), id) if !id.is_empty() => format!("{group} member {id}"),
        (Some(group), _) => group.to_string(),
        (None, _) => "deployment".to_string(),
    }
}
