//! Custom Resource Definitions for ArangoDB deployments

mod arango_member;
mod deployment;
mod member;
mod plan;
mod types;

pub use arango_member::{ArangoMember, ArangoMemberSpec, ArangoMemberStatus};
pub use deployment::{
    AgencyStatus, ArangoDeployment, AuthenticationSpec, BootstrapSpec, DeploymentHashes,
    DeploymentMode, DeploymentSpec, DeploymentStatus, EncryptionSpec, ImageInfo, KeyHashes,
    LicenseSpec, LicenseStatus, PvcResizeMode, RebalancerSpec, RebalancerStatus, RestoreState,
    RestoreStatus, ServerGroupSpec, SyncSpec, Timeouts, TlsSniSpec, TlsSpec, Version,
    SECRET_NAME_NONE,
};
pub use member::{DeploymentMembers, MemberPhase, MemberStatus, ServerGroup};
pub use plan::{
    ActionPriority, ActionType, BackOff, Plan, PlanAction, DEFAULT_ACTION_TIMEOUT,
    MEMBER_ID_PREVIOUS_ACTION,
};
pub use types::{quantity_to_bytes, Condition, ConditionList, ConditionStatus, ConditionType};
