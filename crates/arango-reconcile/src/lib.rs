//! Plan builder and plan executor for ArangoDB deployments
//!
//! Every reconciliation tick builds a plan of corrective actions from the
//! difference between desired and observed state, persists it on the
//! deployment status and then executes it one action at a time.
//!
//! Related crates:
//! - `arango-common`: CRD types, errors, events and metrics
//! - `arango-operator`: the binary running the controller

pub mod action;
pub mod agency;
pub mod client;
pub mod context;
pub mod controller;
pub mod images;
pub mod plan;

#[cfg(test)]
pub(crate) mod testing;

pub use action::{Action, ActionRegistry, Progress};
pub use context::{ActionContext, DatabaseClient, Inspector, ServerClient, StatusStore};
pub use controller::{error_policy, reconcile, Context, ContextBuilder, OperatorConfig};
pub use plan::{create_plan, PlanExecutor};

pub use arango_common::{Error, Result};
