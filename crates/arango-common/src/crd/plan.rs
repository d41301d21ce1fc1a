//! Persisted plan entries
//!
//! A plan is the queue of pending actions stored on the deployment status.
//! Every field of [`PlanAction`] is plain serializable data because a plan
//! has to survive operator restarts between any two steps.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::member::{MemberStatus, ServerGroup};

/// Placeholder member ID meaning "the member the previous action worked on"
pub const MEMBER_ID_PREVIOUS_ACTION: &str = "@previous";

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Deadline applied to actions without a specific default
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10 * MINUTE);

/// Queue an action belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionPriority {
    /// Drained after the high-priority plan
    Normal,
    /// Drained first every tick
    High,
}

macro_rules! action_types {
    ($( $(#[$doc:meta])* $variant:ident => $timeout:expr ),+ $(,)?) => {
        /// Closed catalogue of action types
        ///
        /// The string form of each variant is the persisted identifier. Types
        /// that this build does not know survive deserialization as
        /// [`ActionType::Unknown`] so that the executor can refuse them
        /// explicitly instead of failing to read the whole status.
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum ActionType {
            $( $(#[$doc])* $variant, )+
            /// A type persisted by another build
            Unknown(String),
        }

        impl ActionType {
            /// Every known action type
            pub const ALL: &'static [ActionType] = &[ $( ActionType::$variant, )+ ];

            /// Persisted identifier
            pub fn as_str(&self) -> &str {
                match self {
                    $( ActionType::$variant => stringify!($variant), )+
                    ActionType::Unknown(name) => name,
                }
            }

            /// Resolve a persisted identifier
            pub fn from_name(name: &str) -> Self {
                match name {
                    $( stringify!($variant) => ActionType::$variant, )+
                    other => ActionType::Unknown(other.to_string()),
                }
            }

            /// Deadline measured from creation when the spec does not override it
            pub fn default_timeout(&self) -> Duration {
                match self {
                    $( ActionType::$variant => $timeout, )+
                    ActionType::Unknown(_) => DEFAULT_ACTION_TIMEOUT,
                }
            }
        }
    };
}

action_types! {
    /// Triggers a fresh plan computation
    Idle => DEFAULT_ACTION_TIMEOUT,
    /// Adds a member to a group
    AddMember => Duration::from_secs(10 * MINUTE),
    /// Marks a member to be replaced
    MarkToRemoveMember => DEFAULT_ACTION_TIMEOUT,
    /// Removes a member from status and the cluster
    RemoveMember => Duration::from_secs(15 * MINUTE),
    /// Recreates a member in place, keeping ID and volume
    RecreateMember => Duration::from_secs(15 * MINUTE),
    /// Moves all shards away from a DBServer
    CleanOutMember => Duration::from_secs(48 * HOUR),
    /// Shuts a member down
    ShutdownMember => Duration::from_secs(30 * MINUTE),
    /// Deletes a member pod
    KillMemberPod => DEFAULT_ACTION_TIMEOUT,
    /// Moves shard leadership away from a DBServer
    ResignLeadership => Duration::from_secs(30 * MINUTE),
    /// Waits until a member answers requests
    WaitForMemberUp => Duration::from_secs(30 * MINUTE),
    /// Waits until all shards are in sync
    WaitForMemberInSync => Duration::from_secs(30 * MINUTE),
    /// Waits until a member pod is ready
    WaitForMemberReady => Duration::from_secs(30 * MINUTE),
    /// Sets the phase of a member
    MemberPhaseUpdate => DEFAULT_ACTION_TIMEOUT,
    /// Sets or clears member conditions
    SetMemberCondition => DEFAULT_ACTION_TIMEOUT,
    /// Sets or clears deployment conditions
    SetCondition => DEFAULT_ACTION_TIMEOUT,
    /// Ensures the ArangoMember resource exists with the desired template
    ArangoMemberUpdatePodSpec => DEFAULT_ACTION_TIMEOUT,
    /// Records the applied template on the ArangoMember resource
    ArangoMemberUpdatePodStatus => DEFAULT_ACTION_TIMEOUT,
    /// Restarts a member pod
    RotateMember => Duration::from_secs(15 * MINUTE),
    /// Starts a member restart without waiting for the pod to return
    RotateStartMember => Duration::from_secs(15 * MINUTE),
    /// Finishes a restart started by RotateStartMember
    RotateStopMember => DEFAULT_ACTION_TIMEOUT,
    /// Restarts a member with auto-upgrade
    UpgradeMember => Duration::from_secs(6 * HOUR),
    /// Records the deployment image
    SetCurrentImage => DEFAULT_ACTION_TIMEOUT,
    /// Records the image of a member
    SetMemberCurrentImage => DEFAULT_ACTION_TIMEOUT,
    /// Swaps the member container image without recreating the pod
    RuntimeContainerImageUpdate => DEFAULT_ACTION_TIMEOUT,
    /// Enables agency maintenance mode
    EnableMaintenance => DEFAULT_ACTION_TIMEOUT,
    /// Disables agency maintenance mode
    DisableMaintenance => DEFAULT_ACTION_TIMEOUT,
    /// Syncs the maintenance condition with the agency
    SetMaintenanceCondition => DEFAULT_ACTION_TIMEOUT,
    /// Sets the password of a bootstrapped user
    BootstrapSetPassword => DEFAULT_ACTION_TIMEOUT,
    /// Marks bootstrap as complete
    BootstrapUpdate => DEFAULT_ACTION_TIMEOUT,
    /// Removes a failed server the operator does not know from the cluster
    ClusterMemberCleanup => DEFAULT_ACTION_TIMEOUT,
    /// Restores a backup
    BackupRestore => Duration::from_secs(15 * MINUTE),
    /// Clears restore bookkeeping
    BackupRestoreClean => DEFAULT_ACTION_TIMEOUT,
    /// Pushes the license key to the cluster
    LicenseSet => DEFAULT_ACTION_TIMEOUT,
    /// Computes and starts shard moves
    RebalancerGenerate => DEFAULT_ACTION_TIMEOUT,
    /// Checks progress of running shard moves
    RebalancerCheck => DEFAULT_ACTION_TIMEOUT,
    /// Requests a bigger volume
    PVCResize => Duration::from_secs(30 * MINUTE),
    /// Waits for a volume resize to finish
    PVCResized => Duration::from_secs(15 * MINUTE),
    /// Adds an encryption key to the keyfolder
    EncryptionKeyAdd => DEFAULT_ACTION_TIMEOUT,
    /// Removes an encryption key from the keyfolder
    EncryptionKeyRemove => DEFAULT_ACTION_TIMEOUT,
    /// Makes members reload their encryption keys
    EncryptionKeyRefresh => DEFAULT_ACTION_TIMEOUT,
    /// Records encryption key hashes in status
    EncryptionKeyStatusUpdate => DEFAULT_ACTION_TIMEOUT,
    /// Sets the encryption propagated flag
    EncryptionKeyPropagated => DEFAULT_ACTION_TIMEOUT,
    /// Records JWT hashes in status
    JWTStatusUpdate => DEFAULT_ACTION_TIMEOUT,
    /// Changes the active JWT
    JWTSetActive => DEFAULT_ACTION_TIMEOUT,
    /// Adds a JWT to the folder
    JWTAdd => DEFAULT_ACTION_TIMEOUT,
    /// Removes an old JWT from the folder
    JWTClean => DEFAULT_ACTION_TIMEOUT,
    /// Makes members reload their JWTs
    JWTRefresh => DEFAULT_ACTION_TIMEOUT,
    /// Sets the JWT propagated flag
    JWTPropagated => DEFAULT_ACTION_TIMEOUT,
    /// Records CA hashes in status
    TLSKeyStatusUpdate => DEFAULT_ACTION_TIMEOUT,
    /// Replaces an expiring CA
    RenewTLSCACertificate => Duration::from_secs(30 * MINUTE),
    /// Adds a CA to the truststore
    AppendTLSCACertificate => Duration::from_secs(30 * MINUTE),
    /// Removes an old CA from the truststore
    CleanTLSCACertificate => Duration::from_secs(30 * MINUTE),
    /// Deletes the server keyfile so it gets regenerated
    CleanTLSKeyfileCertificate => Duration::from_secs(30 * MINUTE),
    /// Makes a member reload its keyfile
    RefreshTLSKeyfileCertificate => Duration::from_secs(30 * MINUTE),
    /// Makes a member reload its SNI certificates
    UpdateTLSSNI => Duration::from_secs(30 * MINUTE),
    /// Sets the TLS propagated flag
    TLSPropagated => DEFAULT_ACTION_TIMEOUT,
}

impl ActionType {
    /// Queue this type belongs to when generated by a builder
    pub fn priority(&self) -> ActionPriority {
        match self {
            ActionType::MemberPhaseUpdate
            | ActionType::SetMemberCondition
            | ActionType::SetCondition => ActionPriority::High,
            _ => ActionPriority::Normal,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ActionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(ActionType::from_name(&name))
    }
}

impl JsonSchema for ActionType {
    fn schema_name() -> String {
        "ActionType".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

/// One persisted step of a plan
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanAction {
    /// Unique ID of this entry
    pub id: String,

    /// Action type
    #[serde(rename = "type")]
    pub type_: ActionType,

    /// Member the action works on, empty for deployment-wide actions
    #[serde(rename = "memberID", default, skip_serializing_if = "String::is_empty")]
    pub member_id: String,

    /// Group the action works on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<ServerGroup>,

    /// When the builder created the entry; timeouts count from here
    pub creation_time: DateTime<Utc>,

    /// Set once Start asked to wait for progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Why the builder created the entry
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Image for image-related actions
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Action specific parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl PlanAction {
    /// Create a new entry stamped with a fresh ID and the current time
    pub fn new(
        type_: ActionType,
        group: Option<ServerGroup>,
        member_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            type_,
            member_id: member_id.into(),
            group,
            creation_time: Utc::now(),
            start_time: None,
            reason: reason.into(),
            image: String::new(),
            params: BTreeMap::new(),
        }
    }

    /// Entry working on a specific member
    pub fn for_member(
        type_: ActionType,
        group: ServerGroup,
        member: &MemberStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(type_, Some(group), member.id.clone(), reason)
    }

    /// Entry working on a group without a known member yet
    pub fn for_group(type_: ActionType, group: ServerGroup, reason: impl Into<String>) -> Self {
        Self::new(type_, Some(group), String::new(), reason)
    }

    /// Deployment-wide entry
    pub fn for_cluster(type_: ActionType, reason: impl Into<String>) -> Self {
        Self::new(type_, None, String::new(), reason)
    }

    /// Set a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Set the image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Read a parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns true once Start asked to wait
    pub fn is_started(&self) -> bool {
        self.start_time.is_some()
    }
}

/// Ordered queue of actions; only the head ever executes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct Plan(pub Vec<PlanAction>);

impl Plan {
    /// Empty plan
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns true if there is nothing to do
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of pending actions
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Head of the plan
    pub fn first(&self) -> Option<&PlanAction> {
        self.0.first()
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = &PlanAction> {
        self.0.iter()
    }

    /// Append entries at the end
    pub fn after(mut self, actions: impl IntoIterator<Item = PlanAction>) -> Self {
        self.0.extend(actions);
        self
    }

    /// Surround the plan with a leading and a trailing entry
    pub fn wrap(self, before: PlanAction, after: PlanAction) -> Self {
        let mut out = Vec::with_capacity(self.0.len() + 2);
        out.push(before);
        out.extend(self.0);
        out.push(after);
        Self(out)
    }

    /// Keep only entries matching the predicate
    pub fn filter(self, keep: impl Fn(&PlanAction) -> bool) -> Self {
        Self(self.0.into_iter().filter(|a| keep(a)).collect())
    }

    /// Returns true if any entry has the given type
    pub fn contains_type(&self, type_: &ActionType) -> bool {
        self.0.iter().any(|a| &a.type_ == type_)
    }
}

impl From<Vec<PlanAction>> for Plan {
    fn from(actions: Vec<PlanAction>) -> Self {
        Self(actions)
    }
}

impl FromIterator<PlanAction> for Plan {
    fn from_iter<T: IntoIterator<Item = PlanAction>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Plan {
    type Item = PlanAction;
    type IntoIter = std::vec::IntoIter<PlanAction>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Next-allowed run times of back-off gated builders, keyed by builder
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct BackOff(pub BTreeMap<String, DateTime<Utc>>);

impl BackOff {
    /// Returns true if the keyed builder may run at `now`
    pub fn is_due(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.0.get(key).map(|next| *next <= now).unwrap_or(true)
    }

    /// Forbid the keyed builder until `now + delay`
    pub fn arm(&mut self, key: &str, now: DateTime<Utc>, delay: Duration) {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.0.insert(key.to_string(), now + delay);
    }

    /// Returns true if no builder is gated
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
