//! In-memory collaborators for tests
//!
//! [`FakeContext`] is both the status store and the action context of a
//! single deployment. Side effects on Kubernetes objects are applied to its
//! snapshot so that a following tick observes them, and every persisted
//! status is captured for assertions.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod, PodSpec, Container, Secret,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::runtime::events::EventType;
use parking_lot::{Mutex, RwLock};

use arango_common::crd::{
    ArangoMember, ArangoMemberSpec, ArangoMemberStatus, DeploymentSpec, DeploymentStatus,
    MemberStatus, ServerGroup,
};
use arango_common::{Error, Result};

use crate::agency::{AgencyCache, ClusterHealth};
use crate::context::{
    ActionContext, DatabaseClient, Inspector, ServerClient, Snapshot, StatusMutation, StatusStore,
};

/// Single-deployment fake of every collaborator the core talks to
pub(crate) struct FakeContext {
    pub name: String,
    pub spec: DeploymentSpec,
    state: Mutex<(DeploymentStatus, u64)>,
    snapshot: RwLock<Arc<Snapshot>>,
    pub agency: Option<Arc<AgencyCache>>,
    pub health: Option<Arc<ClusterHealth>>,
    pub database: Option<Arc<dyn DatabaseClient>>,
    pub servers: BTreeMap<String, Arc<dyn ServerClient>>,
    calls: Mutex<Vec<String>>,
    events: Mutex<Vec<(String, String)>>,
    writes: Mutex<Vec<DeploymentStatus>>,
}

impl FakeContext {
    pub fn new() -> Self {
        Self {
            name: "prod".to_string(),
            spec: DeploymentSpec {
                image: "arangodb/enterprise:3.11.4".to_string(),
                ..Default::default()
            },
            state: Mutex::new((DeploymentStatus::default(), 1)),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            agency: None,
            health: None,
            database: None,
            servers: BTreeMap::new(),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_spec(mut self, spec: DeploymentSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_status(self, status: DeploymentStatus) -> Self {
        self.state.lock().0 = status;
        self
    }

    pub fn with_snapshot(self, snapshot: Snapshot) -> Self {
        *self.snapshot.write() = Arc::new(snapshot);
        self
    }

    pub fn with_agency(mut self, agency: AgencyCache) -> Self {
        self.agency = Some(Arc::new(agency));
        self
    }

    pub fn with_health(mut self, health: ClusterHealth) -> Self {
        self.health = Some(Arc::new(health));
        self
    }

    pub fn with_database(mut self, database: impl DatabaseClient + 'static) -> Self {
        self.database = Some(Arc::new(database));
        self
    }

    pub fn with_server(mut self, member_id: &str, server: impl ServerClient + 'static) -> Self {
        self.servers.insert(member_id.to_string(), Arc::new(server));
        self
    }

    /// Current persisted status
    pub fn current(&self) -> DeploymentStatus {
        self.state.lock().0.clone()
    }

    /// Current snapshot
    pub fn objects(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Recorded side effects, e.g. `delete_pod:prod-dbserver-prmr-1`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Published event reasons
    pub fn event_reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(r, _)| r.clone()).collect()
    }

    /// Number of persisted status writes
    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn edit_snapshot(&self, edit: impl FnOnce(&mut Snapshot)) {
        let mut guard = self.snapshot.write();
        let mut next = (**guard).clone();
        edit(&mut next);
        *guard = Arc::new(next);
    }
}

#[async_trait]
impl StatusStore for FakeContext {
    async fn get(&self) -> Result<(DeploymentStatus, String)> {
        let state = self.state.lock();
        Ok((state.0.clone(), state.1.to_string()))
    }

    async fn update(&self, status: &DeploymentStatus, expected_version: &str) -> Result<String> {
        let mut state = self.state.lock();
        let actual = state.1.to_string();
        if actual != expected_version {
            return Err(Error::conflict(expected_version, actual));
        }
        state.0 = status.clone();
        state.1 += 1;
        self.writes.lock().push(status.clone());
        Ok(state.1.to_string())
    }
}

#[async_trait]
impl ActionContext for FakeContext {
    fn deployment_name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> &DeploymentSpec {
        &self.spec
    }

    fn inspector(&self) -> Arc<dyn Inspector> {
        self.objects()
    }

    fn agency(&self) -> Option<Arc<AgencyCache>> {
        self.agency.clone()
    }

    fn health(&self) -> Option<Arc<ClusterHealth>> {
        self.health.clone()
    }

    async fn status(&self) -> Result<DeploymentStatus> {
        Ok(self.current())
    }

    async fn mutate_status(&self, mutation: StatusMutation) -> Result<bool> {
        crate::context::mutate_with_retry(self, 3, |s| mutation(s)).await
    }

    fn database(&self) -> Result<Arc<dyn DatabaseClient>> {
        self.database
            .clone()
            .ok_or_else(|| Error::database("fake", "no database client configured"))
    }

    fn server(&self, _group: ServerGroup, member_id: &str) -> Result<Arc<dyn ServerClient>> {
        self.servers
            .get(member_id)
            .cloned()
            .ok_or_else(|| Error::database(member_id, "no server client configured"))
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.record(format!("delete_pod:{name}"));
        self.edit_snapshot(|s| {
            s.pods.remove(name);
        });
        Ok(())
    }

    async fn delete_pvc(&self, name: &str) -> Result<()> {
        self.record(format!("delete_pvc:{name}"));
        self.edit_snapshot(|s| {
            s.persistent_volume_claims.remove(name);
        });
        Ok(())
    }

    async fn resize_pvc(&self, name: &str, size: &Quantity) -> Result<()> {
        self.record(format!("resize_pvc:{name}:{}", size.0));
        self.edit_snapshot(|s| {
            if let Some(pvc) = s.persistent_volume_claims.get_mut(name) {
                let spec = pvc.spec.get_or_insert_with(Default::default);
                let resources = spec.resources.get_or_insert_with(Default::default);
                resources
                    .requests
                    .get_or_insert_with(Default::default)
                    .insert("storage".to_string(), size.clone());
            }
        });
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.record(format!("delete_secret:{name}"));
        self.edit_snapshot(|s| {
            s.secrets.remove(name);
        });
        Ok(())
    }

    async fn patch_secret(
        &self,
        name: &str,
        insert: BTreeMap<String, Vec<u8>>,
        remove: Vec<String>,
    ) -> Result<()> {
        self.record(format!("patch_secret:{name}"));
        self.edit_snapshot(|s| {
            let secret = s.secrets.entry(name.to_string()).or_insert_with(|| Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            });
            let data = secret.data.get_or_insert_with(Default::default);
            for (k, v) in insert {
                data.insert(k, ByteString(v));
            }
            for k in remove {
                data.remove(&k);
            }
        });
        Ok(())
    }

    async fn ensure_arango_member(&self, group: ServerGroup, member: &MemberStatus) -> Result<()> {
        let name = member.arango_member_name(&self.name, group);
        self.record(format!("ensure_arango_member:{name}"));
        let deployment = self.name.clone();
        let id = member.id.clone();
        self.edit_snapshot(|s| {
            s.arango_members.entry(name.clone()).or_insert_with(|| {
                ArangoMember::new(
                    &name,
                    ArangoMemberSpec {
                        deployment_name: deployment,
                        group,
                        id,
                        template_checksum: String::new(),
                        deletion_priority: None,
                    },
                )
            });
        });
        Ok(())
    }

    async fn mark_template_applied(&self, group: ServerGroup, member: &MemberStatus) -> Result<()> {
        let name = member.arango_member_name(&self.name, group);
        self.record(format!("mark_template_applied:{name}"));
        self.edit_snapshot(|s| {
            if let Some(am) = s.arango_members.get_mut(&name) {
                am.status = Some(ArangoMemberStatus {
                    template_checksum: am.spec.template_checksum.clone(),
                });
            }
        });
        Ok(())
    }

    async fn update_container_image(&self, pod_name: &str, image: &str) -> Result<()> {
        self.record(format!("update_container_image:{pod_name}:{image}"));
        self.edit_snapshot(|s| {
            if let Some(container) = s
                .pods
                .get_mut(pod_name)
                .and_then(|p| p.spec.as_mut())
                .and_then(|spec| spec.containers.first_mut())
            {
                container.image = Some(image.to_string());
            }
        });
        Ok(())
    }

    async fn reload_cached_status(&self) -> Result<()> {
        self.record("reload_cached_status".to_string());
        Ok(())
    }

    async fn publish_event(&self, _type_: EventType, reason: &str, note: String) {
        self.events.lock().push((reason.to_string(), note));
    }
}

/// Member in phase Created with Ready, Serving and Started set
pub(crate) fn created_member(id: &str) -> MemberStatus {
    use arango_common::crd::{ConditionType, MemberPhase};
    let mut m = MemberStatus::new(id);
    m.phase = MemberPhase::Created;
    m.pod_name = format!("pod-{}", id.to_lowercase());
    m.persistent_volume_claim_name = format!("pvc-{}", id.to_lowercase());
    for c in [
        ConditionType::Ready,
        ConditionType::Serving,
        ConditionType::Started,
    ] {
        m.conditions.update(c, true, "", "", "");
    }
    m
}

/// Running pod with one server container
pub(crate) fn pod(name: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "server".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Claim requesting `size`
pub(crate) fn pvc(name: &str, storage_class: &str, size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some(storage_class.to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Secret with the given data
pub(crate) fn secret(name: &str, data: &[(&str, &[u8])]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}
