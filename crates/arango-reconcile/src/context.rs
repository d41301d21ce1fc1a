//! Collaborator interfaces of the plan builder and executor
//!
//! Everything the core needs from the outside world goes through the traits
//! in this module: the compare-and-swap status store, the read-only object
//! snapshot, the database clients and the capability object handed to every
//! action. Production implementations live in [`crate::controller`] and
//! [`crate::client`]; tests substitute mocks or in-memory fakes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::runtime::events::EventType;

#[cfg(test)]
use mockall::automock;

use arango_common::crd::{
    ArangoMember, DeploymentMode, DeploymentSpec, DeploymentStatus, MemberStatus, ServerGroup,
};
use arango_common::Result;

use crate::agency::{AgencyCache, ClusterHealth};

/// A change to apply to a fresh copy of the status
///
/// Returns true if the status changed and has to be written back. The
/// mutation may run more than once when the write loses a version race.
pub type StatusMutation = Box<dyn Fn(&mut DeploymentStatus) -> bool + Send + Sync>;

/// Compare-and-swap persistence of the deployment status
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Fetch a fresh copy of the status together with its version
    async fn get(&self) -> Result<(DeploymentStatus, String)>;

    /// Persist the status if the stored version still equals `expected_version`
    ///
    /// Returns the new version, or [`arango_common::Error::Conflict`] when
    /// another writer got there first.
    async fn update(&self, status: &DeploymentStatus, expected_version: &str) -> Result<String>;
}

/// Read a status, apply a mutation and write it back, retrying on conflicts
///
/// Returns whether anything was written.
pub async fn mutate_with_retry<F>(store: &dyn StatusStore, retries: usize, mutation: F) -> Result<bool>
where
    F: Fn(&mut DeploymentStatus) -> bool + Send + Sync,
{
    let mut attempt = 0;
    loop {
        let (mut status, version) = store.get().await?;
        if !mutation(&mut status) {
            return Ok(false);
        }
        match store.update(&status, &version).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_conflict() && attempt < retries => {
                attempt += 1;
                tracing::debug!(attempt, "status conflict, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read-only lookups into the cached Kubernetes objects of one deployment
#[cfg_attr(test, automock)]
pub trait Inspector: Send + Sync {
    /// Pod by name
    fn pod(&self, name: &str) -> Option<Pod>;

    /// Secret by name
    fn secret(&self, name: &str) -> Option<Secret>;

    /// Persistent volume claim by name
    fn persistent_volume_claim(&self, name: &str) -> Option<PersistentVolumeClaim>;

    /// ArangoMember by name
    fn arango_member(&self, name: &str) -> Option<ArangoMember>;
}

/// Point-in-time copy of the objects an [`Inspector`] serves
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Pods by name
    pub pods: BTreeMap<String, Pod>,
    /// Secrets by name
    pub secrets: BTreeMap<String, Secret>,
    /// Claims by name
    pub persistent_volume_claims: BTreeMap<String, PersistentVolumeClaim>,
    /// ArangoMembers by name
    pub arango_members: BTreeMap<String, ArangoMember>,
}

impl Inspector for Snapshot {
    fn pod(&self, name: &str) -> Option<Pod> {
        self.pods.get(name).cloned()
    }

    fn secret(&self, name: &str) -> Option<Secret> {
        self.secrets.get(name).cloned()
    }

    fn persistent_volume_claim(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.persistent_volume_claims.get(name).cloned()
    }

    fn arango_member(&self, name: &str) -> Option<ArangoMember> {
        self.arango_members.get(name).cloned()
    }
}

/// State of an agency job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued
    Pending,
    /// Running
    Running,
    /// Finished successfully
    Finished,
    /// Failed with a reason
    Failed(String),
    /// The agency does not know the job
    NotFound,
}

/// Key material hashes a server reports after reloading
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyState {
    /// Hash of the active key or certificate
    pub active: String,
    /// Hashes of the accepted keys or certificates
    pub accepted: Vec<String>,
}

/// Cluster-wide database operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Fetch the agency snapshot
    async fn agency_cache(&self) -> Result<AgencyCache>;

    /// Fetch cluster health
    async fn cluster_health(&self) -> Result<ClusterHealth>;

    /// Start a clean-out job; None when the cluster does not know the server
    async fn clean_out_server(&self, id: &str) -> Result<Option<String>>;

    /// Start a resign-leadership job; None when the cluster does not know the server
    async fn resign_server(&self, id: &str) -> Result<Option<String>>;

    /// State of an agency job
    async fn job_status(&self, job_id: &str) -> Result<JobStatus>;

    /// Returns true if the server is cleaned out
    async fn is_cleaned_out(&self, id: &str) -> Result<bool>;

    /// Remove a server from the cluster; unknown servers are not an error
    async fn remove_server(&self, id: &str) -> Result<()>;

    /// Toggle supervision maintenance mode
    async fn set_maintenance(&self, enabled: bool) -> Result<()>;

    /// Set the password of a user
    async fn set_user_password(&self, user: &str, password: &str) -> Result<()>;

    /// Restore a hot backup
    async fn restore_backup(&self, backup_id: &str) -> Result<()>;

    /// Apply a license key
    async fn set_license(&self, license: &str) -> Result<()>;

    /// Compute and start shard moves, returning the job ids
    async fn start_rebalance(&self, max_moves: u32) -> Result<Vec<String>>;
}

/// Operations against one member
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerClient: Send + Sync {
    /// Returns true if the server answers requests
    async fn is_up(&self) -> Result<bool>;

    /// Ask the server to shut down
    async fn shutdown(&self, remove_from_cluster: bool) -> Result<()>;

    /// Reload JWT secrets and report the loaded hashes
    async fn reload_jwt(&self) -> Result<KeyState>;

    /// Reload encryption keys and report the loaded hashes
    async fn reload_encryption(&self) -> Result<KeyState>;

    /// Reload the TLS keyfile and SNI certificates and report the loaded hashes
    async fn reload_tls(&self) -> Result<KeyState>;
}

/// Capabilities handed to every action
///
/// Status reads always return a fresh copy; writes go through
/// [`ActionContext::mutate_status`], which retries on version conflicts.
#[async_trait]
pub trait ActionContext: Send + Sync {
    /// Name of the deployment
    fn deployment_name(&self) -> &str;

    /// Desired state
    fn spec(&self) -> &DeploymentSpec;

    /// Cached Kubernetes objects
    fn inspector(&self) -> Arc<dyn Inspector>;

    /// Agency snapshot, None when it could not be fetched
    fn agency(&self) -> Option<Arc<AgencyCache>>;

    /// Cluster health, None when it could not be fetched
    fn health(&self) -> Option<Arc<ClusterHealth>>;

    /// Fresh copy of the status
    async fn status(&self) -> Result<DeploymentStatus>;

    /// Apply a mutation to the status and persist it
    async fn mutate_status(&self, mutation: StatusMutation) -> Result<bool>;

    /// Client for cluster-wide operations
    fn database(&self) -> Result<Arc<dyn DatabaseClient>>;

    /// Client for one member
    fn server(&self, group: ServerGroup, member_id: &str) -> Result<Arc<dyn ServerClient>>;

    /// Delete a pod; absent pods are not an error
    async fn delete_pod(&self, name: &str) -> Result<()>;

    /// Delete a claim; absent claims are not an error
    async fn delete_pvc(&self, name: &str) -> Result<()>;

    /// Request a new size for a claim
    async fn resize_pvc(&self, name: &str, size: &Quantity) -> Result<()>;

    /// Delete a secret; absent secrets are not an error
    async fn delete_secret(&self, name: &str) -> Result<()>;

    /// Insert and remove data keys of a secret, creating it when missing
    async fn patch_secret(
        &self,
        name: &str,
        insert: BTreeMap<String, Vec<u8>>,
        remove: Vec<String>,
    ) -> Result<()>;

    /// Create or update the ArangoMember of a member
    async fn ensure_arango_member(&self, group: ServerGroup, member: &MemberStatus) -> Result<()>;

    /// Record the desired template of an ArangoMember as applied
    async fn mark_template_applied(&self, group: ServerGroup, member: &MemberStatus) -> Result<()>;

    /// Replace the server container image of a running pod
    async fn update_container_image(&self, pod_name: &str, image: &str) -> Result<()>;

    /// Refresh cached objects after an action changed them
    async fn reload_cached_status(&self) -> Result<()>;

    /// Publish an event on the deployment
    async fn publish_event(&self, type_: EventType, reason: &str, note: String);

    /// Deployment mode shorthand
    fn mode(&self) -> DeploymentMode {
        self.spec().mode
    }

    /// Look up a member by ID in a fresh status
    async fn member(&self, id: &str) -> Result<Option<(ServerGroup, MemberStatus)>> {
        let status = self.status().await?;
        Ok(status.members.by_id(id).map(|(g, m)| (g, m.clone())))
    }

    /// Replace a member in the status
    async fn update_member(&self, group: ServerGroup, member: MemberStatus) -> Result<bool> {
        self.mutate_status(Box::new(move |s| {
            match s.members.group(group).iter().find(|m| m.id == member.id) {
                Some(existing) if *existing == member => false,
                _ => s.members.update(group, member.clone()),
            }
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arango_common::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn mutate_with_retry_retries_conflicts() {
        let mut store = MockStatusStore::new();
        store
            .expect_get()
            .returning(|| Ok((DeploymentStatus::default(), "1".to_string())));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store.expect_update().returning(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::conflict("1", "2"))
            } else {
                Ok("3".to_string())
            }
        });

        let written = mutate_with_retry(&store, 3, |s| {
            s.conditions
                .update(arango_common::crd::ConditionType::UpToDate, true, "", "", "")
        })
        .await
        .expect("mutation succeeds");

        assert!(written);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mutate_with_retry_skips_noop_writes() {
        let mut store = MockStatusStore::new();
        store
            .expect_get()
            .returning(|| Ok((DeploymentStatus::default(), "1".to_string())));
        store.expect_update().never();

        let written = mutate_with_retry(&store, 3, |_| false)
            .await
            .expect("noop succeeds");
        assert!(!written);
    }

    #[tokio::test]
    async fn mutate_with_retry_gives_up_after_budget() {
        let mut store = MockStatusStore::new();
        store
            .expect_get()
            .returning(|| Ok((DeploymentStatus::default(), "1".to_string())));
        store
            .expect_update()
            .times(2)
            .returning(|_, _| Err(Error::conflict("1", "2")));

        let result = mutate_with_retry(&store, 1, |_| true).await;
        assert!(result.map_err(|e| e.is_conflict()).err().unwrap_or(false));
    }
}
