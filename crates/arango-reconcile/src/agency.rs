//! Read-only snapshots of cluster-internal state
//!
//! The agency cache and cluster health are fetched once per tick and then
//! consulted by both the plan builder and the actions. Nothing here talks to
//! the network; see [`crate::client`] for how the snapshots are produced.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

/// Servers holding each shard of one collection
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CollectionShards {
    /// Shard name to server IDs; the first server is the leader
    #[serde(default)]
    pub shards: BTreeMap<String, Vec<String>>,
}

/// Database name to collection name to shard placement
pub type CollectionsByDatabase = BTreeMap<String, BTreeMap<String, CollectionShards>>;

/// Snapshot of the agency state the reconciler cares about
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgencyCache {
    /// Planned shard placement
    #[serde(default)]
    pub plan_collections: CollectionsByDatabase,

    /// Servers currently in sync per shard
    #[serde(default)]
    pub current_collections: CollectionsByDatabase,

    /// DBServers the agency considers cleaned out
    #[serde(default)]
    pub cleaned_servers: BTreeSet<String>,

    /// DBServers the agency is about to clean out
    #[serde(default)]
    pub to_be_cleaned_servers: BTreeSet<String>,

    /// Supervision maintenance mode
    #[serde(default)]
    pub maintenance: bool,
}

impl AgencyCache {
    fn planned_shards(&self) -> impl Iterator<Item = (&String, &String, &String, &Vec<String>)> {
        self.plan_collections.iter().flat_map(|(db, cols)| {
            cols.iter().flat_map(move |(col, c)| {
                c.shards
                    .iter()
                    .map(move |(shard, servers)| (db, col, shard, servers))
            })
        })
    }

    /// Returns true if the server appears in any planned shard
    pub fn is_dbserver_present(&self, id: &str) -> bool {
        self.planned_shards()
            .any(|(_, _, _, servers)| servers.iter().any(|s| s == id))
    }

    /// Returns true if the server leads any planned shard
    pub fn is_leader(&self, id: &str) -> bool {
        self.planned_shards()
            .any(|(_, _, _, servers)| servers.first().map(String::as_str) == Some(id))
    }

    /// Number of planned shards per server
    pub fn shards_by_dbservers(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for (_, _, _, servers) in self.planned_shards() {
            for server in servers {
                *out.entry(server.clone()).or_insert(0) += 1;
            }
        }
        out
    }

    /// Returns true if every planned replica of every shard the server
    /// holds is reported in sync
    pub fn is_dbserver_in_sync(&self, id: &str) -> bool {
        self.planned_shards()
            .filter(|(_, _, _, servers)| servers.iter().any(|s| s == id))
            .all(|(db, col, shard, planned)| self.shard_in_sync(db, col, shard, planned))
    }

    /// Returns true if every planned shard has all its replicas in sync
    pub fn all_shards_in_sync(&self) -> bool {
        self.planned_shards()
            .all(|(db, col, shard, planned)| self.shard_in_sync(db, col, shard, planned))
    }

    fn shard_in_sync(&self, db: &str, col: &str, shard: &str, planned: &[String]) -> bool {
        let current = self
            .current_collections
            .get(db)
            .and_then(|cols| cols.get(col))
            .and_then(|c| c.shards.get(shard));
        match current {
            Some(current) => planned.iter().all(|p| current.contains(p)),
            None => false,
        }
    }

    /// Returns true if the agency lists the server as cleaned out
    pub fn is_cleaned(&self, id: &str) -> bool {
        self.cleaned_servers.contains(id)
    }

    /// Returns true if the agency is about to clean the server out
    pub fn is_to_be_cleaned(&self, id: &str) -> bool {
        self.to_be_cleaned_servers.contains(id)
    }
}

/// Health of one server as reported by the cluster
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerHealthStatus {
    /// Server answers and is in sync
    Good,
    /// Server missed heartbeats
    Bad,
    /// Supervision gave up on the server
    Failed,
    /// Anything else
    #[serde(other)]
    Unknown,
}

/// Health entry of one server
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ServerHealth {
    /// Role as reported by the cluster, e.g. `DBServer`
    #[serde(default)]
    pub role: String,
    /// Health status
    pub status: ServerHealthStatus,
}

/// Cluster health keyed by server ID
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterHealth {
    /// Server ID to health
    #[serde(default)]
    pub health: BTreeMap<String, ServerHealth>,
}

impl ClusterHealth {
    /// Health status of a server, if reported
    pub fn status(&self, id: &str) -> Option<ServerHealthStatus> {
        self.health.get(id).map(|h| h.status)
    }

    /// IDs of coordinators and DBServers reported as failed
    pub fn failed_servers(&self) -> impl Iterator<Item = (&str, &ServerHealth)> {
        self.health
            .iter()
            .filter(|(_, h)| h.status == ServerHealthStatus::Failed)
            .filter(|(_, h)| h.role == "Coordinator" || h.role == "DBServer")
            .map(|(id, h)| (id.as_str(), h))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Agency snapshot with one collection whose shards live on the given
    /// servers; every replica is reported in sync.
    pub(crate) fn agency_with_shards(shards: &[(&str, &[&str])]) -> AgencyCache {
        let placement = CollectionShards {
            shards: shards
                .iter()
                .map(|(shard, servers)| {
                    (
                        shard.to_string(),
                        servers.iter().map(|s| s.to_string()).collect(),
                    )
                })
                .collect(),
        };
        let collections =
            BTreeMap::from([("_system".to_string(), BTreeMap::from([("c".to_string(), placement)]))]);
        AgencyCache {
            plan_collections: collections.clone(),
            current_collections: collections,
            ..Default::default()
        }
    }

    #[test]
    fn shard_placement_queries() {
        // PRMR-b leads both shards, PRMR-a only follows on s1.
        let agency = agency_with_shards(&[("s1", &["PRMR-b", "PRMR-a"]), ("s2", &["PRMR-b"])]);

        assert!(agency.is_dbserver_present("PRMR-a"));
        assert!(!agency.is_dbserver_present("PRMR-c"));
        assert!(agency.is_leader("PRMR-b"));
        assert!(!agency.is_leader("PRMR-a"));
        assert!(!agency.is_leader("PRMR-c"));

        let counts = agency.shards_by_dbservers();
        assert_eq!(counts.get("PRMR-a"), Some(&1));
        assert_eq!(counts.get("PRMR-b"), Some(&2));
    }

    #[test]
    fn sync_requires_every_planned_replica() {
        let mut agency = agency_with_shards(&[("s1", &["PRMR-a", "PRMR-b"])]);
        assert!(agency.all_shards_in_sync());
        assert!(agency.is_dbserver_in_sync("PRMR-b"));

        if let Some(c) = agency
            .current_collections
            .get_mut("_system")
            .and_then(|cols| cols.get_mut("c"))
        {
            c.shards.insert("s1".to_string(), vec!["PRMR-a".to_string()]);
        }
        assert!(!agency.all_shards_in_sync());
        assert!(!agency.is_dbserver_in_sync("PRMR-b"));
        // A server without shards has nothing to sync.
        assert!(agency.is_dbserver_in_sync("PRMR-z"));
    }

    #[test]
    fn cluster_health_parses_failed_servers() {
        let json = r#"{"Health":{
            "PRMR-1":{"Role":"DBServer","Status":"FAILED"},
            "CRDN-1":{"Role":"Coordinator","Status":"GOOD"},
            "AGNT-1":{"Role":"Agent","Status":"FAILED"},
            "PRMR-2":{"Role":"DBServer","Status":"WHATEVER"}
        }}"#;
        let health: ClusterHealth = serde_json::from_str(json).expect("parse health");
        let failed: Vec<_> = health.failed_servers().map(|(id, _)| id).collect();
        assert_eq!(failed, vec!["PRMR-1"]);
        assert_eq!(health.status("PRMR-2"), Some(ServerHealthStatus::Unknown));
    }
}
