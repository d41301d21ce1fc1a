//! ArangoDeployment custom resource

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::member::{DeploymentMembers, ServerGroup};
use super::plan::{ActionType, BackOff, Plan};
use super::types::ConditionList;

/// Secret name value that disables a secret-backed feature
pub const SECRET_NAME_NONE: &str = "None";

/// Topology of the deployment
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentMode {
    /// One single server
    Single,
    /// Leader/follower single servers with an agency
    ActiveFailover,
    /// Agents, DBServers and Coordinators
    #[default]
    Cluster,
}

/// How a volume grows when its requested size increases
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PvcResizeMode {
    /// Resize the claim while the pod runs
    #[default]
    Runtime,
    /// Shut the member down, resize, start again
    Rotate,
}

/// Desired shape of one server group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroupSpec {
    /// Number of members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,

    /// Storage class of member volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Requested size of member volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<Quantity>,

    /// How volumes grow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_resize_mode: Option<PvcResizeMode>,

    /// Allow failed members to be replaced by new ones instead of recreated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_member_recreation: Option<bool>,
}

impl ServerGroupSpec {
    /// Desired member count, defaulting per group
    pub fn count_or(&self, default: usize) -> usize {
        self.count.unwrap_or(default)
    }
}

/// Datacenter-to-datacenter replication settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    /// Run sync masters and workers
    #[serde(default)]
    pub enabled: bool,
}

/// SNI certificate mapping
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSniSpec {
    /// Secret name to served host names
    #[serde(default)]
    pub mapping: BTreeMap<String, Vec<String>>,
}

/// TLS settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Secret holding the CA; `None` disables TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_secret_name: Option<String>,

    /// SNI certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<TlsSniSpec>,
}

impl TlsSpec {
    /// Returns true if members serve TLS
    pub fn is_secure(&self) -> bool {
        self.ca_secret_name.as_deref() != Some(SECRET_NAME_NONE)
    }

    /// Secret holding the CA
    pub fn ca_secret_name(&self, deployment: &str) -> String {
        self.ca_secret_name
            .clone()
            .unwrap_or_else(|| format!("{deployment}-ca"))
    }
}

/// Authentication settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    /// Secret holding the JWT signing token; `None` disables authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret_name: Option<String>,
}

impl AuthenticationSpec {
    /// Returns true if members require authentication
    pub fn is_authenticated(&self) -> bool {
        self.jwt_secret_name.as_deref() != Some(SECRET_NAME_NONE)
    }

    /// Secret holding the JWT signing token
    pub fn jwt_secret_name(&self, deployment: &str) -> String {
        self.jwt_secret_name
            .clone()
            .unwrap_or_else(|| format!("{deployment}-jwt"))
    }
}

/// Encryption at rest settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSpec {
    /// Secret holding the active encryption key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_secret_name: Option<String>,
}

/// Per-action timeout overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    /// Action type name to timeout in seconds
    #[serde(default)]
    pub actions: BTreeMap<String, u64>,
}

/// Shard rebalancer settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RebalancerSpec {
    /// Run the rebalancer
    #[serde(default)]
    pub enabled: bool,

    /// Maximum number of concurrent shard moves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_moves: Option<u32>,
}

/// License settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LicenseSpec {
    /// Secret holding the license key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// Bootstrap settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSpec {
    /// User name to secret holding its initial password
    #[serde(default)]
    pub password_secret_names: BTreeMap<String, String>,
}

/// Desired state of an ArangoDB deployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "database.arangodb.com",
    version = "v1",
    kind = "ArangoDeployment",
    plural = "arangodeployments",
    shortname = "arangodb",
    status = "DeploymentStatus",
    namespaced,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Deployment topology
    #[serde(default)]
    pub mode: DeploymentMode,

    /// ArangoDB image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Single servers
    #[serde(default)]
    pub single: ServerGroupSpec,
    /// Agents
    #[serde(default)]
    pub agents: ServerGroupSpec,
    /// DBServers
    #[serde(default)]
    pub dbservers: ServerGroupSpec,
    /// Coordinators
    #[serde(default)]
    pub coordinators: ServerGroupSpec,
    /// Sync masters
    #[serde(default)]
    pub syncmasters: ServerGroupSpec,
    /// Sync workers
    #[serde(default)]
    pub syncworkers: ServerGroupSpec,

    /// Datacenter-to-datacenter replication
    #[serde(default)]
    pub sync: SyncSpec,

    /// TLS
    #[serde(default)]
    pub tls: TlsSpec,

    /// Authentication
    #[serde(default)]
    pub authentication: AuthenticationSpec,

    /// Encryption at rest
    #[serde(default)]
    pub encryption: EncryptionSpec,

    /// Timeout overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<Timeouts>,

    /// Shard rebalancer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebalancer: Option<RebalancerSpec>,

    /// License
    #[serde(default)]
    pub license: LicenseSpec,

    /// Bootstrap
    #[serde(default)]
    pub bootstrap: BootstrapSpec,

    /// Backup to restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_from: Option<String>,

    /// Restart members for upgrades even when the cluster is not healthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unsafe_upgrade: Option<bool>,
}

impl DeploymentSpec {
    /// Spec of one group
    pub fn group(&self, group: ServerGroup) -> &ServerGroupSpec {
        match group {
            ServerGroup::Single => &self.single,
            ServerGroup::Agents => &self.agents,
            ServerGroup::DBServers => &self.dbservers,
            ServerGroup::Coordinators => &self.coordinators,
            ServerGroup::SyncMasters => &self.syncmasters,
            ServerGroup::SyncWorkers => &self.syncworkers,
        }
    }

    /// Desired member count of a group in the current mode
    pub fn member_count(&self, group: ServerGroup) -> usize {
        let spec = self.group(group);
        match (self.mode, group) {
            (DeploymentMode::Single, ServerGroup::Single) => 1,
            (DeploymentMode::ActiveFailover, ServerGroup::Single) => spec.count_or(2),
            (DeploymentMode::ActiveFailover | DeploymentMode::Cluster, ServerGroup::Agents) => {
                spec.count_or(3)
            }
            (DeploymentMode::Cluster, ServerGroup::DBServers) => spec.count_or(3),
            (DeploymentMode::Cluster, ServerGroup::Coordinators) => spec.count_or(3),
            (DeploymentMode::Cluster, ServerGroup::SyncMasters | ServerGroup::SyncWorkers)
                if self.sync.enabled =>
            {
                spec.count_or(3)
            }
            _ => 0,
        }
    }

    /// Returns true if sync masters and workers run
    pub fn supports_sync(&self) -> bool {
        self.mode == DeploymentMode::Cluster && self.sync.enabled
    }

    /// Returns true if failed members of the group may be replaced
    pub fn allow_member_recreation(&self, group: ServerGroup) -> bool {
        self.group(group).allow_member_recreation.unwrap_or(true)
    }

    /// Deadline for an action type, honouring spec overrides
    pub fn action_timeout(&self, action: &ActionType) -> Duration {
        self.timeouts
            .as_ref()
            .and_then(|t| t.actions.get(action.as_str()))
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| action.default_timeout())
    }

    /// Returns true if the rebalancer is enabled
    pub fn rebalancer_enabled(&self) -> bool {
        self.mode == DeploymentMode::Cluster
            && self.rebalancer.as_ref().map(|r| r.enabled).unwrap_or(false)
    }

    /// Validate spec invariants the reconciler relies on
    pub fn validate(&self, deployment: &str) -> crate::Result<()> {
        if self.image.is_empty() {
            return Err(crate::Error::validation_for_field(
                deployment,
                "spec.image",
                "image must be set",
            ));
        }
        if self.mode == DeploymentMode::Cluster && self.member_count(ServerGroup::DBServers) < 1 {
            return Err(crate::Error::validation_for_field(
                deployment,
                "spec.dbservers.count",
                "cluster needs at least one dbserver",
            ));
        }
        Ok(())
    }
}

/// Version and edition of an image
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    /// Image reference as written in the spec
    pub image: String,
    /// Resolved image digest
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_id: String,
    /// ArangoDB version, e.g. 3.11.4
    pub arangodb_version: String,
    /// Enterprise edition
    #[serde(default)]
    pub enterprise: bool,
}

/// Agency sizing recorded at creation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgencyStatus {
    /// Number of agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

/// Hashes of one family of security material
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyHashes {
    /// Checksum of the active key or certificate
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active: String,
    /// Checksums of accepted but inactive keys or certificates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passive: Vec<String>,
    /// All live members confirmed the current material
    #[serde(default)]
    pub propagated: bool,
}

/// Security material hashes per subsystem
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentHashes {
    /// CA truststore
    #[serde(default)]
    pub tls: KeyHashes,
    /// JWT folder
    #[serde(default)]
    pub jwt: KeyHashes,
    /// Encryption keyfolder
    #[serde(default)]
    pub encryption: KeyHashes,
    /// Fingerprint of the SNI certificates every coordinator serves
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sni: String,
}

/// State of a backup restore
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub enum RestoreState {
    /// Restore request sent
    Restoring,
    /// Restore finished
    Restored,
    /// Restore failed
    Failed,
}

/// Restore bookkeeping
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    /// Backup the restore was requested from
    pub requested_from: String,
    /// Restore state
    pub state: RestoreState,
    /// Failure details
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// License bookkeeping
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LicenseStatus {
    /// Checksum of the applied license key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

/// Rebalancer bookkeeping
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RebalancerStatus {
    /// Agency job ids of running shard moves
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub moves_in_progress: Vec<String>,
    /// Last time moves were generated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<DateTime<Utc>>,
}

/// Observed and operator-authored state of a deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// Members by group
    #[serde(default)]
    pub members: DeploymentMembers,

    /// Normal plan
    #[serde(default, skip_serializing_if = "Plan::is_empty")]
    pub plan: Plan,

    /// High-priority plan, drained before the normal one
    #[serde(default, skip_serializing_if = "Plan::is_empty")]
    pub high_priority_plan: Plan,

    /// Deployment conditions
    #[serde(default, skip_serializing_if = "ConditionList::is_empty")]
    pub conditions: ConditionList,

    /// Security material hashes
    #[serde(default)]
    pub hashes: DeploymentHashes,

    /// Known images
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageInfo>,

    /// Image the deployment runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_image: Option<ImageInfo>,

    /// Agency sizing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency: Option<AgencyStatus>,

    /// Restore bookkeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreStatus>,

    /// License bookkeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<LicenseStatus>,

    /// Rebalancer bookkeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebalancer: Option<RebalancerStatus>,

    /// Back-off of gated builders
    #[serde(default, skip_serializing_if = "BackOff::is_empty")]
    pub back_off: BackOff,
}

impl DeploymentStatus {
    /// Image info for an image reference or digest
    pub fn image_info(&self, image: &str) -> Option<&ImageInfo> {
        self.images
            .iter()
            .find(|i| i.image == image)
            .or_else(|| self.images.iter().find(|i| i.image_id == image))
    }
}

/// Parsed `major.minor.patch` version
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    /// Major
    pub major: u32,
    /// Minor
    pub minor: u32,
    /// Patch
    pub patch: u32,
}

impl std::str::FromStr for Version {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let core = s.split(['-', '+']).next().unwrap_or(s);
        let mut parts = core.split('.').map(|p| p.parse::<u32>());
        let mut next = |name: &str| -> crate::Result<u32> {
            match parts.next() {
                Some(Ok(v)) => Ok(v),
                Some(Err(_)) => Err(crate::Error::validation(format!(
                    "invalid {name} in version {s}"
                ))),
                None => Ok(0),
            }
        };
        Ok(Version {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch")?,
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;
    use rstest::rstest;

    #[test]
    fn crd_generates() {
        let crd = ArangoDeployment::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("arangodeployments.database.arangodb.com")
        );
        let yaml = serde_yaml::to_string(&crd).expect("crd yaml");
        assert!(yaml.contains("ArangoDeployment"));
    }

    #[rstest]
    #[case(DeploymentMode::Single, ServerGroup::Single, 1)]
    #[case(DeploymentMode::Single, ServerGroup::DBServers, 0)]
    #[case(DeploymentMode::ActiveFailover, ServerGroup::Single, 2)]
    #[case(DeploymentMode::Cluster, ServerGroup::Agents, 3)]
    #[case(DeploymentMode::Cluster, ServerGroup::DBServers, 3)]
    #[case(DeploymentMode::Cluster, ServerGroup::SyncMasters, 0)]
    fn default_member_counts(
        #[case] mode: DeploymentMode,
        #[case] group: ServerGroup,
        #[case] expected: usize,
    ) {
        let spec = DeploymentSpec {
            mode,
            ..Default::default()
        };
        assert_eq!(spec.member_count(group), expected);
    }

    #[test]
    fn action_timeout_override_wins() {
        let mut spec = DeploymentSpec::default();
        assert_eq!(
            spec.action_timeout(&ActionType::AddMember),
            ActionType::AddMember.default_timeout()
        );
        spec.timeouts = Some(Timeouts {
            actions: BTreeMap::from([("AddMember".to_string(), 42)]),
        });
        assert_eq!(
            spec.action_timeout(&ActionType::AddMember),
            Duration::from_secs(42)
        );
    }

    #[test]
    fn none_secret_disables_features() {
        let mut spec = DeploymentSpec::default();
        assert!(spec.tls.is_secure());
        assert!(spec.authentication.is_authenticated());
        spec.tls.ca_secret_name = Some(SECRET_NAME_NONE.to_string());
        spec.authentication.jwt_secret_name = Some(SECRET_NAME_NONE.to_string());
        assert!(!spec.tls.is_secure());
        assert!(!spec.authentication.is_authenticated());
        assert_eq!(spec.tls.ca_secret_name("prod"), "None");
    }

    #[rstest]
    #[case("3.11.4", Version { major: 3, minor: 11, patch: 4 })]
    #[case("3.12", Version { major: 3, minor: 12, patch: 0 })]
    #[case("3.10.1-1", Version { major: 3, minor: 10, patch: 1 })]
    fn versions_parse(#[case] input: &str, #[case] expected: Version) {
        assert_eq!(input.parse::<Version>().ok(), Some(expected));
    }

    #[test]
    fn validate_requires_image() {
        let spec = DeploymentSpec::default();
        assert!(spec.validate("prod").is_err());
        let spec = DeploymentSpec {
            image: "arangodb/arangodb:3.11.4".to_string(),
            ..Default::default()
        };
        assert!(spec.validate("prod").is_ok());
    }
}
