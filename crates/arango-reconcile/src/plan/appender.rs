//! Builder chaining
//!
//! A chain is a sequence of builders where each one only runs while the
//! plan is still empty. The appender isolates builders from each other: a
//! panicking builder is logged and skipped, and the chain continues with the
//! plan it had before.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tracing::{debug, error};

use arango_common::crd::{BackOff, Plan};

use super::PlanContext;

/// A policy turning the tick inputs into actions
pub type PlanBuilderFn = fn(&PlanContext<'_>) -> Plan;

/// Post-processing of the combined output of a sub-plan
pub type SubPlanWrap = fn(&PlanContext<'_>, Plan) -> Plan;

/// Accumulates the output of a builder chain
pub struct PlanAppender<'c, 'a> {
    ctx: &'c PlanContext<'a>,
    plan: Plan,
    back_off: BackOff,
}

impl<'c, 'a> PlanAppender<'c, 'a> {
    /// Start a chain with the back-off state persisted on the status
    pub fn new(ctx: &'c PlanContext<'a>) -> Self {
        Self {
            ctx,
            plan: Plan::new(),
            back_off: ctx.status.back_off.clone(),
        }
    }

    /// Run a builder unconditionally and append its output
    pub fn apply<F>(mut self, name: &str, builder: F) -> Self
    where
        F: FnOnce(&PlanContext<'a>) -> Plan,
    {
        if let Some(plan) = self.run(name, builder) {
            self.plan = std::mem::take(&mut self.plan).after(plan);
        }
        self
    }

    /// Run a builder if nothing was produced so far
    pub fn apply_if_empty<F>(self, name: &str, builder: F) -> Self
    where
        F: FnOnce(&PlanContext<'a>) -> Plan,
    {
        if !self.plan.is_empty() {
            return self;
        }
        self.apply(name, builder)
    }

    /// Run a group of builders up to the first one with work and hand its
    /// output to `wrap`
    pub fn apply_sub_plan_if_empty(
        self,
        name: &str,
        wrap: SubPlanWrap,
        builders: &[PlanBuilderFn],
    ) -> Self {
        if !self.plan.is_empty() {
            return self;
        }
        self.apply(name, |ctx| {
            let inner = builders
                .iter()
                .map(|b| b(ctx))
                .find(|p| !p.is_empty())
                .unwrap_or_default();
            wrap(ctx, inner)
        })
    }

    /// Run a builder if nothing was produced and its back-off key is due
    ///
    /// The key is re-armed whenever the builder produced work, so a policy
    /// whose actions do not converge cannot emit them back to back.
    pub fn apply_if_empty_with_back_off<F>(mut self, key: &str, delay: Duration, builder: F) -> Self
    where
        F: FnOnce(&PlanContext<'a>) -> Plan,
    {
        if !self.plan.is_empty() {
            return self;
        }
        if !self.back_off.is_due(key, self.ctx.now) {
            debug!(builder = key, "builder is backing off");
            return self;
        }
        self = self.apply(key, builder);
        if !self.plan.is_empty() {
            self.back_off.arm(key, self.ctx.now, delay);
        }
        self
    }

    /// Returns true if no builder produced work yet
    pub fn is_empty(&self) -> bool {
        self.plan.is_empty()
    }

    /// The accumulated plan and back-off state
    pub fn finish(self) -> (Plan, BackOff) {
        (self.plan, self.back_off)
    }

    fn run<F>(&self, name: &str, builder: F) -> Option<Plan>
    where
        F: FnOnce(&PlanContext<'a>) -> Plan,
    {
        let ctx = self.ctx;
        match catch_unwind(AssertUnwindSafe(|| builder(ctx))) {
            Ok(plan) => {
                if !plan.is_empty() {
                    debug!(builder = name, actions = plan.len(), "builder produced actions");
                }
                Some(plan)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(builder = name, panic = %message, "recovered from panicking plan builder");
                None
            }
        }
    }
}
