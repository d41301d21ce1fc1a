//! Plan actions
//!
//! An action is one idempotent step of a plan. The executor drives it
//! through `start`, then `check_progress` on later ticks until it is ready,
//! aborts or runs past its deadline. Because the operator can restart at any
//! point, and `start` can run again when the previous tick died before the
//! start time was persisted, every `start` must check live state before
//! acting.

/// Implements `Action::entry` for structs holding an `entry` field
macro_rules! entry_accessor {
    () => {
        fn entry(&self) -> &arango_common::crd::PlanAction {
            &self.entry
        }
    };
}
pub(crate) use entry_accessor;

mod cleanout;
mod cluster;
mod decorators;
mod member;
pub mod params;
mod registry;
mod rotate;
pub(crate) mod security;
pub(crate) mod storage;

use std::time::Duration;

use async_trait::async_trait;

use arango_common::crd::{DeploymentSpec, PlanAction, ServerGroup};
use arango_common::Result;

use crate::context::ActionContext;

pub use decorators::{StartFailureGracePeriod, TimeoutOverride};
pub use registry::{ActionFactory, ActionRegistry, ActionRegistryBuilder};
pub use security::sha256_hex;

/// Result of polling an action that is waiting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Not finished, poll again next tick
    Wait,
    /// Finished, pop it
    Ready,
    /// The plan no longer applies; drop all of it
    Abort,
}

/// One executable plan step
#[async_trait]
pub trait Action: Send + Sync {
    /// The persisted entry this action was built from
    fn entry(&self) -> &PlanAction;

    /// Perform the side effect or issue the request
    ///
    /// Returns true when the action is complete, false when the executor
    /// has to record a start time and poll [`Action::check_progress`].
    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool>;

    /// Poll a started action
    ///
    /// Actions that complete in `start` keep the default, which reports
    /// ready right away.
    async fn check_progress(&self, _ctx: &dyn ActionContext) -> Result<Progress> {
        Ok(Progress::Ready)
    }

    /// Side effect run after the action completed
    async fn post(&self, _ctx: &dyn ActionContext) -> Result<()> {
        Ok(())
    }

    /// Deadline measured from the creation time of the entry
    fn timeout(&self, spec: &DeploymentSpec) -> Duration {
        spec.action_timeout(&self.entry().type_)
    }

    /// Member this action worked on, used to resolve `@previous`
    fn member_id(&self) -> String {
        self.entry().member_id.clone()
    }

    /// Entries to insert right behind this action once it completed
    fn append_plan(&self) -> Vec<PlanAction> {
        Vec::new()
    }

    /// Returns true if cached objects must be refreshed after completion
    fn reload_cached_status(&self) -> bool {
        false
    }

    /// Window, measured from creation, in which failing starts are retried
    fn start_failure_grace_period(&self) -> Option<Duration> {
        None
    }
}

/// Group of an entry; member actions cannot run without one
pub(crate) fn entry_group(entry: &PlanAction) -> Result<ServerGroup> {
    entry.group.ok_or_else(|| {
        arango_common::Error::validation(format!("{} {} has no group", entry.type_, entry.id))
    })
}
