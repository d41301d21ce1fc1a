//! Composable wrappers around actions

use std::time::Duration;

use async_trait::async_trait;

use arango_common::crd::{DeploymentSpec, PlanAction};
use arango_common::Result;

use super::{Action, Progress};
use crate::context::ActionContext;

/// Retries failing starts silently while the entry is younger than `grace`
///
/// Most actions talk to the database over the network; a member that is
/// briefly unreachable must not drop the whole plan.
pub struct StartFailureGracePeriod {
    inner: Box<dyn Action>,
    grace: Duration,
}

impl StartFailureGracePeriod {
    /// Wrap an action
    pub fn new(inner: Box<dyn Action>, grace: Duration) -> Self {
        Self { inner, grace }
    }
}

#[async_trait]
impl Action for StartFailureGracePeriod {
    fn entry(&self) -> &PlanAction {
        self.inner.entry()
    }

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        self.inner.start(ctx).await
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        self.inner.check_progress(ctx).await
    }

    async fn post(&self, ctx: &dyn ActionContext) -> Result<()> {
        self.inner.post(ctx).await
    }

    fn timeout(&self, spec: &DeploymentSpec) -> Duration {
        self.inner.timeout(spec)
    }

    fn member_id(&self) -> String {
        self.inner.member_id()
    }

    fn append_plan(&self) -> Vec<PlanAction> {
        self.inner.append_plan()
    }

    fn reload_cached_status(&self) -> bool {
        self.inner.reload_cached_status()
    }

    fn start_failure_grace_period(&self) -> Option<Duration> {
        Some(self.grace)
    }
}

/// Replaces the spec-derived deadline with a fixed one
pub struct TimeoutOverride {
    inner: Box<dyn Action>,
    timeout: Duration,
}

impl TimeoutOverride {
    /// Wrap an action
    pub fn new(inner: Box<dyn Action>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl Action for TimeoutOverride {
    fn entry(&self) -> &PlanAction {
        self.inner.entry()
    }

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        self.inner.start(ctx).await
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        self.inner.check_progress(ctx).await
    }

    async fn post(&self, ctx: &dyn ActionContext) -> Result<()> {
        self.inner.post(ctx).await
    }

    fn timeout(&self, _spec: &DeploymentSpec) -> Duration {
        self.timeout
    }

    fn member_id(&self) -> String {
        self.inner.member_id()
    }

    fn append_plan(&self) -> Vec<PlanAction> {
        self.inner.append_plan()
    }

    fn reload_cached_status(&self) -> bool {
        self.inner.reload_cached_status()
    }

    fn start_failure_grace_period(&self) -> Option<Duration> {
        self.inner.start_failure_grace_period()
    }
}
