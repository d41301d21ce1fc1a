//! Plan builder and plan executor
//!
//! Two queues live on the deployment status. The high-priority queue carries
//! urgent bookkeeping (phase initialisation, condition repair) and the normal
//! queue carries everything that changes the shape of the deployment.
//!
//! Building is a pure function of spec, status and the per-tick snapshots:
//! a queue that still holds entries is returned unchanged, otherwise a fixed
//! chain of builders runs until the first one produces work. Only
//! [`create_plan`] talks to the outside world, and only to persist the result
//! and publish events.

mod appender;
mod cluster;
mod executor;
mod high;
mod normal;
mod recovery;
mod rotate;
mod scale;
mod security;
mod storage;

use chrono::{DateTime, Utc};
use kube::runtime::events::EventType;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use arango_common::crd::{
    ActionPriority, BackOff, ConditionType, DeploymentMode, DeploymentSpec, DeploymentStatus,
    MemberPhase, MemberStatus, Plan,
};
use arango_common::events::reasons;
use arango_common::metrics::{self, PRIORITY_HIGH, PRIORITY_NORMAL};
use arango_common::Result;

use crate::agency::{AgencyCache, ClusterHealth};
use crate::context::{ActionContext, Inspector};

pub use appender::{PlanAppender, PlanBuilderFn, SubPlanWrap};
pub use executor::PlanExecutor;
pub use high::build_high_plan;
pub use normal::build_normal_plan;
pub use scale::{select_member_to_remove, ScaleFilter};

/// Subsystems that apply to the deployment this tick
///
/// Evaluated once per tick so that every builder of a subsystem agrees on
/// whether it runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Preconditions {
    /// Cluster mode
    pub cluster: bool,
    /// Encryption at rest is configured and the edition supports rotation
    pub encryption: bool,
    /// Requests are authenticated with a JWT
    pub jwt: bool,
    /// Traffic is TLS encrypted
    pub tls: bool,
    /// An upgrade is running somewhere in the deployment
    pub upgrade_in_progress: bool,
}

impl Preconditions {
    /// Derive the preconditions from spec and status
    pub fn evaluate(spec: &DeploymentSpec, status: &DeploymentStatus) -> Self {
        let enterprise = status
            .current_image
            .as_ref()
            .map(|i| i.enterprise)
            .unwrap_or(false);
        Self {
            cluster: spec.mode == DeploymentMode::Cluster,
            encryption: spec.encryption.key_secret_name.is_some() && enterprise,
            jwt: spec.authentication.is_authenticated(),
            tls: spec.tls.is_secure(),
            upgrade_in_progress: status.conditions.is_true(&ConditionType::UpgradeInProgress)
                || status
                    .members
                    .iter()
                    .any(|(_, m)| m.phase == MemberPhase::Upgrading),
        }
    }
}

/// Event a builder asked to publish once the plan is stored
#[derive(Clone, Debug, PartialEq)]
pub struct PlanEvent {
    /// Normal or Warning
    pub type_: EventType,
    /// Machine-readable reason
    pub reason: &'static str,
    /// Human-readable message
    pub note: String,
}

/// Read-only inputs of one plan computation
pub struct PlanContext<'a> {
    /// Deployment name
    pub deployment: &'a str,
    /// Desired state
    pub spec: &'a DeploymentSpec,
    /// Status the plan is computed against
    pub status: &'a DeploymentStatus,
    /// Cached Kubernetes objects
    pub inspector: &'a dyn Inspector,
    /// Agency snapshot, None when the agency could not be read
    pub agency: Option<&'a AgencyCache>,
    /// Cluster health, None when it could not be read
    pub health: Option<&'a ClusterHealth>,
    /// Subsystem switches for this tick
    pub preconditions: Preconditions,
    /// Wall clock of this tick
    pub now: DateTime<Utc>,
    events: Mutex<Vec<PlanEvent>>,
}

impl<'a> PlanContext<'a> {
    /// Context without agency or health snapshots
    pub fn new(
        deployment: &'a str,
        spec: &'a DeploymentSpec,
        status: &'a DeploymentStatus,
        inspector: &'a dyn Inspector,
    ) -> Self {
        Self {
            deployment,
            spec,
            status,
            inspector,
            agency: None,
            health: None,
            preconditions: Preconditions::evaluate(spec, status),
            now: Utc::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Attach the agency snapshot
    pub fn with_agency(mut self, agency: Option<&'a AgencyCache>) -> Self {
        self.agency = agency;
        self
    }

    /// Attach the cluster health
    pub fn with_health(mut self, health: Option<&'a ClusterHealth>) -> Self {
        self.health = health;
        self
    }

    /// Pin the wall clock
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Queue an event for publication
    pub fn event(&self, type_: EventType, reason: &'static str, note: impl Into<String>) {
        self.events.lock().push(PlanEvent {
            type_,
            reason,
            note: note.into(),
        });
    }

    /// Drain queued events
    pub fn take_events(&self) -> Vec<PlanEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Pod of a member from the cache
    pub(crate) fn member_pod(
        &self,
        member: &MemberStatus,
    ) -> Option<k8s_openapi::api::core::v1::Pod> {
        if member.pod_name.is_empty() {
            return None;
        }
        self.inspector.pod(&member.pod_name)
    }
}

/// Output of one builder chain
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuiltPlan {
    /// Plan for the queue
    pub plan: Plan,
    /// Back-off state after the chain ran
    pub back_off: BackOff,
    /// Returns true if plan or back-off have to be persisted
    pub changed: bool,
}

impl BuiltPlan {
    /// The queue still holds entries; nothing is recomputed
    pub(crate) fn in_flight(plan: &Plan, back_off: &BackOff) -> Self {
        Self {
            plan: plan.clone(),
            back_off: back_off.clone(),
            changed: false,
        }
    }
}

/// Compute both queues for a deployment and persist what changed
///
/// Returns true if a new plan was stored.
#[instrument(skip(ctx), fields(deployment = %ctx.deployment_name()))]
pub async fn create_plan(ctx: &dyn ActionContext) -> Result<bool> {
    let status = ctx.status().await?;
    let inspector = ctx.inspector();
    let agency = ctx.agency();
    let health = ctx.health();

    let plan_ctx = PlanContext::new(ctx.deployment_name(), ctx.spec(), &status, inspector.as_ref())
        .with_agency(agency.as_deref())
        .with_health(health.as_deref());

    let high = build_high_plan(&plan_ctx);
    let normal = build_normal_plan(&plan_ctx);
    let events = plan_ctx.take_events();

    let mut stored = false;
    if high.changed {
        stored |= store_plan(ctx, ActionPriority::High, high).await?;
    }
    if normal.changed {
        stored |= store_plan(ctx, ActionPriority::Normal, normal).await?;
    }

    for event in events {
        ctx.publish_event(event.type_, event.reason, event.note).await;
    }
    Ok(stored)
}

fn priority_label(priority: ActionPriority) -> &'static str {
    match priority {
        ActionPriority::High => PRIORITY_HIGH,
        ActionPriority::Normal => PRIORITY_NORMAL,
    }
}

/// Persist a built plan unless the queue was filled concurrently
async fn store_plan(
    ctx: &dyn ActionContext,
    priority: ActionPriority,
    built: BuiltPlan,
) -> Result<bool> {
    let BuiltPlan { plan, back_off, .. } = built;
    let stored_plan = plan.clone();
    let written = ctx
        .mutate_status(Box::new(move |s| {
            let mut changed = false;
            let queue = match priority {
                ActionPriority::High => &mut s.high_priority_plan,
                ActionPriority::Normal => &mut s.plan,
            };
            if !stored_plan.is_empty() && queue.is_empty() {
                *queue = stored_plan.clone();
                changed = true;
            }
            for (key, next) in &back_off.0 {
                if s.back_off.0.get(key) != Some(next) {
                    s.back_off.0.insert(key.clone(), *next);
                    changed = true;
                }
            }
            changed
        }))
        .await?;

    if !written || plan.is_empty() {
        debug!(priority = priority_label(priority), "no new plan stored");
        return Ok(false);
    }

    let label = priority_label(priority);
    for action in plan.iter() {
        metrics::record_action_generated(label, action.type_.as_str());
    }
    let types: Vec<&str> = plan.iter().map(|a| a.type_.as_str()).collect();
    info!(priority = label, actions = ?types, "plan stored");
    ctx.publish_event(
        EventType::Normal,
        reasons::PLAN_APPENDED,
        format!("Plan ({label}) appended: {}", types.join(", ")),
    )
    .await;
    Ok(true)
}
