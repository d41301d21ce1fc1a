//! Kubernetes Event recording for the deployment reconciler.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that plan aborts, plan timeouts and policy refusals leave an audit
//! trail visible via `kubectl describe arangodeployment`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "PlanAborted")
    /// * `action` - What the controller was doing (e.g. "ExecutePlan")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// A new plan was stored on the deployment
    pub const PLAN_APPENDED: &str = "PlanAppended";
    /// An action asked for the whole plan to be dropped
    pub const PLAN_ABORTED: &str = "PlanAborted";
    /// An action exceeded its deadline and the plan was dropped
    pub const PLAN_TIMEOUT: &str = "PlanTimeout";
    /// An action failed outside its grace period and the plan was dropped
    pub const PLAN_ACTION_FAILED: &str = "PlanActionFailed";
    /// The storage class of a group that cannot be migrated was changed
    pub const STORAGE_CLASS_CHANGE_NOT_SUPPORTED: &str = "StorageClassChangeNotSupported";
    /// The requested image version change is not an allowed upgrade path
    pub const UPGRADE_NOT_ALLOWED: &str = "UpgradeNotAllowed";
    /// A member was added to the deployment
    pub const MEMBER_ADDED: &str = "MemberAdded";
    /// A member was removed from the deployment
    pub const MEMBER_REMOVED: &str = "MemberRemoved";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Driving the head of a plan
    pub const EXECUTE_PLAN: &str = "ExecutePlan";
}
