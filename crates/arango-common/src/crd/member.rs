//! Server groups and per-member status

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::deployment::ImageInfo;
use super::types::{ConditionList, ConditionType};

/// Role of a member inside a deployment
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum ServerGroup {
    /// Single server (single and active-failover modes)
    Single,
    /// Agency members
    Agents,
    /// Data-bearing cluster members
    DBServers,
    /// Stateless cluster query frontends
    Coordinators,
    /// Datacenter-to-datacenter sync masters
    SyncMasters,
    /// Datacenter-to-datacenter sync workers
    SyncWorkers,
}

impl ServerGroup {
    /// All groups in status order
    pub const ALL: [ServerGroup; 6] = [
        Self::Single,
        Self::Agents,
        Self::DBServers,
        Self::Coordinators,
        Self::SyncMasters,
        Self::SyncWorkers,
    ];

    /// Role name used in labels and resource names
    pub fn as_role(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Agents => "agent",
            Self::DBServers => "dbserver",
            Self::Coordinators => "coordinator",
            Self::SyncMasters => "syncmaster",
            Self::SyncWorkers => "syncworker",
        }
    }

    /// Prefix of generated member IDs
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::Single => "SNGL",
            Self::Agents => "AGNT",
            Self::DBServers => "PRMR",
            Self::Coordinators => "CRDN",
            Self::SyncMasters => "SYNM",
            Self::SyncWorkers => "SYNW",
        }
    }

    /// Returns true if members of this group hold no persistent data
    pub fn is_stateless(&self) -> bool {
        matches!(
            self,
            Self::Coordinators | Self::SyncMasters | Self::SyncWorkers
        )
    }

    /// Returns true if members of this group are ArangoDB servers
    /// (as opposed to sync processes)
    pub fn is_arangod(&self) -> bool {
        matches!(
            self,
            Self::Single | Self::Agents | Self::DBServers | Self::Coordinators
        )
    }

    /// Generate a fresh member ID for this group
    pub fn new_member_id(&self) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();
        format!("{}-{}", self.id_prefix(), suffix)
    }
}

impl std::fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_role())
    }
}

impl std::str::FromStr for ServerGroup {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|g| g.as_role() == s || format!("{g:?}") == s)
            .copied()
            .ok_or_else(|| crate::Error::validation(format!("invalid server group: {s}")))
    }
}

/// Lifecycle phase of a member
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MemberPhase {
    /// Member was added to status but nothing exists yet
    #[default]
    None,
    /// Member resources are being prepared
    Pending,
    /// Member pod was created
    Created,
    /// Member failed and needs recovery
    Failed,
    /// DBServer clean-out job is running
    CleanOut,
    /// Member is draining before removal
    Drain,
    /// Member restarts with `--database.auto-upgrade`
    Upgrading,
    /// Member was shut down
    Shutdown,
}

impl MemberPhase {
    /// Returns true for phases in which a pod is expected to run
    pub fn is_created_or_drain(&self) -> bool {
        matches!(self, Self::Created | Self::Drain)
    }

    /// Phase name used in status and action params
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Pending => "Pending",
            Self::Created => "Created",
            Self::Failed => "Failed",
            Self::CleanOut => "CleanOut",
            Self::Drain => "Drain",
            Self::Upgrading => "Upgrading",
            Self::Shutdown => "Shutdown",
        }
    }
}

impl std::str::FromStr for MemberPhase {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" | "" => Ok(Self::None),
            "Pending" => Ok(Self::Pending),
            "Created" => Ok(Self::Created),
            "Failed" => Ok(Self::Failed),
            "CleanOut" => Ok(Self::CleanOut),
            "Drain" => Ok(Self::Drain),
            "Upgrading" => Ok(Self::Upgrading),
            "Shutdown" => Ok(Self::Shutdown),
            _ => Err(crate::Error::validation(format!("invalid member phase: {s}"))),
        }
    }
}

impl std::fmt::Display for MemberPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of one database server instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Stable member ID, never reused while the member exists
    pub id: String,

    /// Lifecycle phase
    #[serde(default)]
    pub phase: MemberPhase,

    /// When the member entry was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Member conditions
    #[serde(default, skip_serializing_if = "ConditionList::is_empty")]
    pub conditions: ConditionList,

    /// Name of the member pod
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,

    /// Name of the member persistent volume claim
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub persistent_volume_claim_name: String,

    /// Image the member currently runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageInfo>,

    /// Agency job id of a running clean-out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanout_job_id: Option<String>,
}

impl MemberStatus {
    /// Create a fresh member in phase None
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Name of the ArangoMember resource for this member
    pub fn arango_member_name(&self, deployment: &str, group: ServerGroup) -> String {
        format!(
            "{}-{}-{}",
            deployment,
            group.as_role(),
            self.id.to_lowercase()
        )
    }

    /// Shorthand for a True member condition
    pub fn has_condition(&self, type_: &ConditionType) -> bool {
        self.conditions.is_true(type_)
    }
}

/// Members of a deployment, grouped by role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMembers {
    /// Single servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub single: Vec<MemberStatus>,
    /// Agents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<MemberStatus>,
    /// DBServers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dbservers: Vec<MemberStatus>,
    /// Coordinators
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coordinators: Vec<MemberStatus>,
    /// Sync masters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub syncmasters: Vec<MemberStatus>,
    /// Sync workers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub syncworkers: Vec<MemberStatus>,
}

impl DeploymentMembers {
    /// Members of one group
    pub fn group(&self, group: ServerGroup) -> &[MemberStatus] {
        match group {
            ServerGroup::Single => &self.single,
            ServerGroup::Agents => &self.agents,
            ServerGroup::DBServers => &self.dbservers,
            ServerGroup::Coordinators => &self.coordinators,
            ServerGroup::SyncMasters => &self.syncmasters,
            ServerGroup::SyncWorkers => &self.syncworkers,
        }
    }

    /// Mutable members of one group
    pub fn group_mut(&mut self, group: ServerGroup) -> &mut Vec<MemberStatus> {
        match group {
            ServerGroup::Single => &mut self.single,
            ServerGroup::Agents => &mut self.agents,
            ServerGroup::DBServers => &mut self.dbservers,
            ServerGroup::Coordinators => &mut self.coordinators,
            ServerGroup::SyncMasters => &mut self.syncmasters,
            ServerGroup::SyncWorkers => &mut self.syncworkers,
        }
    }

    /// Iterate over every member with its group, in group order
    pub fn iter(&self) -> impl Iterator<Item = (ServerGroup, &MemberStatus)> {
        ServerGroup::ALL
            .into_iter()
            .flat_map(move |g| self.group(g).iter().map(move |m| (g, m)))
    }

    /// Iterate over the members of the given groups, in the given order
    pub fn iter_groups<'a>(
        &'a self,
        groups: &'a [ServerGroup],
    ) -> impl Iterator<Item = (ServerGroup, &'a MemberStatus)> + 'a {
        groups
            .iter()
            .flat_map(move |g| self.group(*g).iter().map(move |m| (*g, m)))
    }

    /// Find a member by ID across all groups
    pub fn by_id(&self, id: &str) -> Option<(ServerGroup, &MemberStatus)> {
        self.iter().find(|(_, m)| m.id == id)
    }

    /// Total number of members
    pub fn len(&self) -> usize {
        ServerGroup::ALL.iter().map(|g| self.group(*g).len()).sum()
    }

    /// Returns true if there are no members at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a member to a group
    ///
    /// Fails if a member with the same ID already exists in any group.
    pub fn add(&mut self, group: ServerGroup, member: MemberStatus) -> crate::Result<()> {
        if self.by_id(&member.id).is_some() {
            return Err(crate::Error::validation(format!(
                "member {} already exists",
                member.id
            )));
        }
        self.group_mut(group).push(member);
        Ok(())
    }

    /// Replace a member, matching on ID within the group
    ///
    /// Returns false when the member does not exist.
    pub fn update(&mut self, group: ServerGroup, member: MemberStatus) -> bool {
        match self.group_mut(group).iter_mut().find(|m| m.id == member.id) {
            Some(existing) => {
                *existing = member;
                true
            }
            None => false,
        }
    }

    /// Remove a member by ID, returning true if it existed
    pub fn remove(&mut self, group: ServerGroup, id: &str) -> bool {
        let members = self.group_mut(group);
        let before = members.len();
        members.retain(|m| m.id != id);
        before != members.len()
    }

    /// Returns true if every member of the group reports Serving
    pub fn all_members_serving(&self, group: ServerGroup) -> bool {
        self.group(group)
            .iter()
            .all(|m| m.has_condition(&ConditionType::Serving))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> MemberStatus {
        MemberStatus::new(id)
    }

    #[test]
    fn member_ids_are_unique_across_groups() {
        let mut members = DeploymentMembers::default();
        members
            .add(ServerGroup::DBServers, member("PRMR-1"))
            .expect("first add");
        assert!(members.add(ServerGroup::Agents, member("PRMR-1")).is_err());
        assert_eq!(members.len(), 1);
    }

    #[test]
    fn update_and_remove_match_on_id() {
        let mut members = DeploymentMembers::default();
        members
            .add(ServerGroup::Coordinators, member("CRDN-1"))
            .expect("add");

        let mut changed = member("CRDN-1");
        changed.phase = MemberPhase::Created;
        assert!(members.update(ServerGroup::Coordinators, changed));
        assert!(!members.update(ServerGroup::Coordinators, member("CRDN-2")));
        assert_eq!(
            members.by_id("CRDN-1").map(|(_, m)| m.phase.clone()),
            Some(MemberPhase::Created)
        );

        assert!(members.remove(ServerGroup::Coordinators, "CRDN-1"));
        assert!(members.is_empty());
    }

    #[test]
    fn iteration_follows_group_order() {
        let mut members = DeploymentMembers::default();
        members.add(ServerGroup::Coordinators, member("C")).expect("add");
        members.add(ServerGroup::Agents, member("A")).expect("add");
        members.add(ServerGroup::DBServers, member("D")).expect("add");

        let order: Vec<_> = members.iter().map(|(_, m)| m.id.clone()).collect();
        assert_eq!(order, vec!["A", "D", "C"]);
    }

    #[test]
    fn generated_ids_carry_group_prefix() {
        let id = ServerGroup::DBServers.new_member_id();
        assert!(id.starts_with("PRMR-"));
        assert_eq!(id.len(), "PRMR-".len() + 8);
        assert_ne!(id, ServerGroup::DBServers.new_member_id());
    }

    #[test]
    fn server_group_parses_role_and_variant_names() {
        assert_eq!("dbserver".parse::<ServerGroup>().ok(), Some(ServerGroup::DBServers));
        assert_eq!("Agents".parse::<ServerGroup>().ok(), Some(ServerGroup::Agents));
        assert!("nodes".parse::<ServerGroup>().is_err());
    }

    #[test]
    fn arango_member_name_is_lowercase() {
        let m = member("PRMR-AbC");
        assert_eq!(
            m.arango_member_name("prod", ServerGroup::DBServers),
            "prod-dbserver-prmr-abc"
        );
    }
}
