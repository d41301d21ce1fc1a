//! ArangoDeployment controller
//!
//! Each reconciliation builds a fresh [`DeploymentContext`] for one
//! deployment: a snapshot of its Kubernetes objects, the agency state and
//! a status store that writes through the status subresource with the
//! observed resourceVersion as the compare-and-swap version. The plan
//! builder and the executor then run against that context.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolumeClaim, Pod, Secret,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use arango_common::crd::{
    ArangoDeployment, ArangoMember, ArangoMemberSpec, ArangoMemberStatus, DeploymentMode,
    DeploymentSpec, DeploymentStatus, MemberStatus, ServerGroup,
};
use arango_common::events::{actions, EventPublisher, KubeEventPublisher};
use arango_common::{
    metrics, Error, Result, DEPLOYMENT_LABEL_KEY, FIELD_MANAGER, ROLE_LABEL_KEY, SECRET_KEY_TOKEN,
};

use crate::action::ActionRegistry;
use crate::agency::{AgencyCache, ClusterHealth};
use crate::client::{superuser_token, ClientFactory, ClientTarget, HttpClientFactory};
use crate::context::{
    mutate_with_retry, ActionContext, DatabaseClient, Inspector, ServerClient, Snapshot,
    StatusMutation, StatusStore,
};
use crate::images::{inspect_images, SERVER_CONTAINER};
use crate::plan::{create_plan, PlanExecutor};

/// Name the controller reports events under
pub const CONTROLLER_NAME: &str = "arango-deployment-operator";

/// Tunables of the controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Requeue delay when nothing is waiting
    pub requeue_interval: Duration,
    /// Requeue delay when an action is waiting or a plan was dropped
    pub short_requeue: Duration,
    /// How long failing starts of network-bound actions are retried quietly
    pub start_failure_grace: Duration,
    /// Conflict retries of a single status mutation
    pub status_update_retries: usize,
    /// Timeout of every request to a database server
    pub database_request_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            requeue_interval: Duration::from_secs(30),
            short_requeue: Duration::from_secs(2),
            start_failure_grace: Duration::from_secs(10),
            status_update_retries: 5,
            database_request_timeout: Duration::from_secs(30),
        }
    }
}

/// Kubernetes operations of the controller
///
/// Everything is namespaced; absent objects on delete are not an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Fetch a deployment
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<ArangoDeployment>>;

    /// Replace the status subresource, conditioned on the object's resourceVersion
    async fn replace_deployment_status(
        &self,
        namespace: &str,
        deployment: &ArangoDeployment,
    ) -> Result<ArangoDeployment>;

    /// List the objects of one deployment
    async fn snapshot(&self, namespace: &str, deployment: &str) -> Result<Snapshot>;

    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete a persistent volume claim
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    /// Request a new storage size on a claim
    async fn resize_pvc(&self, namespace: &str, name: &str, size: &Quantity) -> Result<()>;

    /// Delete a secret
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// Insert and remove data keys of a secret, creating it when missing
    async fn patch_secret(
        &self,
        namespace: &str,
        name: &str,
        insert: BTreeMap<String, Vec<u8>>,
        remove: Vec<String>,
    ) -> Result<()>;

    /// Server-side apply an ArangoMember
    async fn apply_arango_member(&self, namespace: &str, member: &ArangoMember) -> Result<()>;

    /// Patch the status of an ArangoMember
    async fn patch_arango_member_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ArangoMemberStatus,
    ) -> Result<()>;

    /// Replace the image of one container of a running pod
    async fn patch_container_image(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        image: &str,
    ) -> Result<()>;
}

fn ignore_not_found(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result.map_err(Error::from) {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// [`KubeApi`] over a kube client
pub struct KubeApiImpl {
    client: Client,
}

impl KubeApiImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeApi for KubeApiImpl {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<ArangoDeployment>> {
        Ok(self.api::<ArangoDeployment>(namespace).get_opt(name).await?)
    }

    async fn replace_deployment_status(
        &self,
        namespace: &str,
        deployment: &ArangoDeployment,
    ) -> Result<ArangoDeployment> {
        let name = deployment.name_any();
        let data = serde_json::to_vec(deployment)
            .map_err(|e| Error::serialization_for_kind("ArangoDeployment", e.to_string()))?;
        Ok(self
            .api::<ArangoDeployment>(namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await?)
    }

    async fn snapshot(&self, namespace: &str, deployment: &str) -> Result<Snapshot> {
        let owned = ListParams::default().labels(&format!("{DEPLOYMENT_LABEL_KEY}={deployment}"));
        let pods = self.api::<Pod>(namespace);
        let pvcs = self.api::<PersistentVolumeClaim>(namespace);
        let secrets = self.api::<Secret>(namespace);
        let members = self.api::<ArangoMember>(namespace);

        let all = ListParams::default();
        let (pods, pvcs, secrets, members) = futures::try_join!(
            pods.list(&owned),
            pvcs.list(&owned),
            secrets.list(&all),
            members.list(&all),
        )?;

        fn by_name<K: ResourceExt>(items: Vec<K>) -> BTreeMap<String, K> {
            items.into_iter().map(|o| (o.name_any(), o)).collect()
        }

        Ok(Snapshot {
            pods: by_name(pods.items),
            persistent_volume_claims: by_name(pvcs.items),
            secrets: by_name(secrets.items),
            arango_members: by_name(
                members
                    .items
                    .into_iter()
                    .filter(|m| m.spec.deployment_name == deployment)
                    .collect(),
            ),
        })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let result = self
            .api::<Pod>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let result = self
            .api::<PersistentVolumeClaim>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn resize_pvc(&self, namespace: &str, name: &str, size: &Quantity) -> Result<()> {
        let patch = json!({ "spec": { "resources": { "requests": { "storage": size } } } });
        self.api::<PersistentVolumeClaim>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let result = self
            .api::<Secret>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn patch_secret(
        &self,
        namespace: &str,
        name: &str,
        insert: BTreeMap<String, Vec<u8>>,
        remove: Vec<String>,
    ) -> Result<()> {
        let api = self.api::<Secret>(namespace);
        let mut data: BTreeMap<String, Option<ByteString>> = remove
            .into_iter()
            .map(|k| (k, None))
            .collect();
        for (k, v) in insert {
            data.insert(k, Some(ByteString(v)));
        }

        let patch = json!({ "data": data });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(secret = name, "secret missing, creating it");
                let mut secret = Secret::default();
                secret.metadata.name = Some(name.to_string());
                secret.data = Some(
                    data.into_iter()
                        .filter_map(|(k, v)| v.map(|v| (k, v)))
                        .collect(),
                );
                api.create(&PostParams::default(), &secret).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_arango_member(&self, namespace: &str, member: &ArangoMember) -> Result<()> {
        let name = member.name_any();
        self.api::<ArangoMember>(namespace)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(member),
            )
            .await?;
        Ok(())
    }

    async fn patch_arango_member_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ArangoMemberStatus,
    ) -> Result<()> {
        let patch = json!({ "status": status });
        self.api::<ArangoMember>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_container_image(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        image: &str,
    ) -> Result<()> {
        let patch = json!({
            "spec": { "containers": [{ "name": container, "image": image }] }
        });
        self.api::<Pod>(namespace)
            .patch(pod, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }
}

/// Status subresource of one deployment as a compare-and-swap store
///
/// The version is the object's resourceVersion; a replace carrying a stale
/// one is refused by the API server with 409.
pub struct KubeStatusStore {
    kube: Arc<dyn KubeApi>,
    namespace: String,
    name: String,
}

impl KubeStatusStore {
    /// Store for the named deployment
    pub fn new(kube: Arc<dyn KubeApi>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kube,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn get(&self) -> Result<(DeploymentStatus, String)> {
        let deployment = self
            .kube
            .get_deployment(&self.namespace, &self.name)
            .await?
            .ok_or_else(|| {
                Error::internal_with_context("status", format!("deployment {} is gone", self.name))
            })?;
        let version = deployment.metadata.resource_version.clone().unwrap_or_default();
        Ok((deployment.status.unwrap_or_default(), version))
    }

    async fn update(&self, status: &DeploymentStatus, expected_version: &str) -> Result<String> {
        let mut deployment = ArangoDeployment::new(&self.name, DeploymentSpec::default());
        deployment.metadata.namespace = Some(self.namespace.clone());
        deployment.metadata.resource_version = Some(expected_version.to_string());
        deployment.status = Some(status.clone());

        match self
            .kube
            .replace_deployment_status(&self.namespace, &deployment)
            .await
        {
            Ok(updated) => Ok(updated.metadata.resource_version.unwrap_or_default()),
            Err(e) if e.is_conflict() => {
                debug!(deployment = %self.name, expected = expected_version, "status write lost the race");
                Err(Error::conflict(expected_version, "newer"))
            }
            Err(e) => Err(e),
        }
    }
}

/// Action context of one deployment for one tick
pub struct DeploymentContext {
    name: String,
    namespace: String,
    spec: DeploymentSpec,
    kube: Arc<dyn KubeApi>,
    store: KubeStatusStore,
    snapshot: RwLock<Arc<Snapshot>>,
    agency: Option<Arc<AgencyCache>>,
    health: Option<Arc<ClusterHealth>>,
    clients: Arc<dyn ClientFactory>,
    target: ClientTarget,
    events: Arc<dyn EventPublisher>,
    object_ref: ObjectReference,
    retries: usize,
}

#[async_trait]
impl ActionContext for DeploymentContext {
    fn deployment_name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> &DeploymentSpec {
        &self.spec
    }

    fn inspector(&self) -> Arc<dyn Inspector> {
        self.snapshot.read().clone()
    }

    fn agency(&self) -> Option<Arc<AgencyCache>> {
        self.agency.clone()
    }

    fn health(&self) -> Option<Arc<ClusterHealth>> {
        self.health.clone()
    }

    async fn status(&self) -> Result<DeploymentStatus> {
        Ok(self.store.get().await?.0)
    }

    async fn mutate_status(&self, mutation: StatusMutation) -> Result<bool> {
        mutate_with_retry(&self.store, self.retries, |s| mutation(s)).await
    }

    fn database(&self) -> Result<Arc<dyn DatabaseClient>> {
        self.clients.database(&self.target)
    }

    fn server(&self, group: ServerGroup, member_id: &str) -> Result<Arc<dyn ServerClient>> {
        self.clients.server(&self.target, group, member_id)
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        info!(pod = name, "deleting pod");
        self.kube.delete_pod(&self.namespace, name).await
    }

    async fn delete_pvc(&self, name: &str) -> Result<()> {
        info!(pvc = name, "deleting persistent volume claim");
        self.kube.delete_pvc(&self.namespace, name).await
    }

    async fn resize_pvc(&self, name: &str, size: &Quantity) -> Result<()> {
        info!(pvc = name, size = %size.0, "resizing persistent volume claim");
        self.kube.resize_pvc(&self.namespace, name, size).await
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.kube.delete_secret(&self.namespace, name).await
    }

    async fn patch_secret(
        &self,
        name: &str,
        insert: BTreeMap<String, Vec<u8>>,
        remove: Vec<String>,
    ) -> Result<()> {
        self.kube
            .patch_secret(&self.namespace, name, insert, remove)
            .await
    }

    async fn ensure_arango_member(&self, group: ServerGroup, member: &MemberStatus) -> Result<()> {
        let name = member.arango_member_name(&self.name, group);
        let existing = self.snapshot.read().arango_member(&name);
        let mut resource = ArangoMember::new(
            &name,
            ArangoMemberSpec {
                deployment_name: self.name.clone(),
                group,
                id: member.id.clone(),
                template_checksum: existing
                    .as_ref()
                    .map(|m| m.spec.template_checksum.clone())
                    .unwrap_or_default(),
                deletion_priority: existing.as_ref().and_then(|m| m.spec.deletion_priority),
            },
        );
        resource.metadata.namespace = Some(self.namespace.clone());
        resource.metadata.labels = Some(BTreeMap::from([
            (DEPLOYMENT_LABEL_KEY.to_string(), self.name.clone()),
            (ROLE_LABEL_KEY.to_string(), group.as_role().to_string()),
        ]));
        self.kube.apply_arango_member(&self.namespace, &resource).await
    }

    async fn mark_template_applied(&self, group: ServerGroup, member: &MemberStatus) -> Result<()> {
        let name = member.arango_member_name(&self.name, group);
        let Some(resource) = self.snapshot.read().arango_member(&name) else {
            debug!(arango_member = %name, "no ArangoMember to mark");
            return Ok(());
        };
        let status = ArangoMemberStatus {
            template_checksum: resource.spec.template_checksum.clone(),
        };
        self.kube
            .patch_arango_member_status(&self.namespace, &name, &status)
            .await
    }

    async fn update_container_image(&self, pod_name: &str, image: &str) -> Result<()> {
        info!(pod = pod_name, image, "updating container image in place");
        self.kube
            .patch_container_image(&self.namespace, pod_name, SERVER_CONTAINER, image)
            .await
    }

    async fn reload_cached_status(&self) -> Result<()> {
        let fresh = self.kube.snapshot(&self.namespace, &self.name).await?;
        *self.snapshot.write() = Arc::new(fresh);
        Ok(())
    }

    async fn publish_event(&self, type_: EventType, reason: &str, note: String) {
        self.events
            .publish(&self.object_ref, type_, reason, actions::EXECUTE_PLAN, Some(note))
            .await;
    }
}

/// Shared context for the ArangoDeployment controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .build()?;
/// ```
pub struct Context {
    /// Kubernetes operations
    pub kube: Arc<dyn KubeApi>,
    /// Database client factory
    pub clients: Arc<dyn ClientFactory>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Plan executor over the registry built at startup
    pub executor: PlanExecutor,
    /// Tunables
    pub config: OperatorConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeApi>,
        clients: Arc<dyn ClientFactory>,
        config: OperatorConfig,
    ) -> Result<Self> {
        let registry = ActionRegistry::standard(config.start_failure_grace)?;
        Ok(Self {
            kube,
            clients,
            events: Arc::new(arango_common::events::NoopEventPublisher),
            executor: PlanExecutor::new(Arc::new(registry)),
            config,
        })
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeApi>>,
    clients: Option<Arc<dyn ClientFactory>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: OperatorConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            clients: None,
            events: None,
            config: OperatorConfig::default(),
        }
    }

    /// Override the Kubernetes operations (primarily for testing)
    pub fn kube_api(mut self, kube: Arc<dyn KubeApi>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the database client factory
    pub fn client_factory(mut self, clients: Arc<dyn ClientFactory>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the tunables
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    ///
    /// Fails when the action registry is inconsistent or the HTTP client
    /// cannot be created.
    pub fn build(self) -> Result<Context> {
        let registry = ActionRegistry::standard(self.config.start_failure_grace)?;
        info!(actions = registry.len(), "action registry ready");
        let clients: Arc<dyn ClientFactory> = match self.clients {
            Some(clients) => clients,
            None => Arc::new(HttpClientFactory::new(self.config.database_request_timeout)?),
        };
        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeApiImpl::new(self.client.clone()))),
            clients,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))),
            executor: PlanExecutor::new(Arc::new(registry)),
            config: self.config,
        })
    }
}

/// Superuser token from the deployment JWT secret
fn client_token(spec: &DeploymentSpec, name: &str, snapshot: &Snapshot) -> Result<Option<String>> {
    if !spec.authentication.is_authenticated() {
        return Ok(None);
    }
    let secret_name = spec.authentication.jwt_secret_name(name);
    let token = snapshot
        .secret(&secret_name)
        .and_then(|s| s.data)
        .and_then(|mut d| d.remove(SECRET_KEY_TOKEN));
    match token {
        Some(secret) => superuser_token(&secret.0).map(Some),
        None => {
            warn!(secret = %secret_name, "JWT secret missing, database requests will be refused");
            Ok(None)
        }
    }
}

/// Agency snapshot and cluster health, each None when it cannot be read
async fn cluster_state(
    clients: &dyn ClientFactory,
    target: &ClientTarget,
) -> (Option<Arc<AgencyCache>>, Option<Arc<ClusterHealth>>) {
    let database = match clients.database(target) {
        Ok(database) => database,
        Err(e) => {
            debug!(error = %e, "no database client");
            return (None, None);
        }
    };
    let agency = match database.agency_cache().await {
        Ok(agency) => Some(Arc::new(agency)),
        Err(e) => {
            debug!(error = %e, "agency not readable");
            None
        }
    };
    let health = match database.cluster_health().await {
        Ok(health) => Some(Arc::new(health)),
        Err(e) => {
            debug!(error = %e, "cluster health not readable");
            None
        }
    };
    (agency, health)
}

/// Reconcile an ArangoDeployment resource
///
/// Builds and stores a plan, then executes as much of it as possible
/// without waiting. Requeues soon while an action is waiting.
#[instrument(skip(deployment, ctx), fields(deployment = %deployment.name_any()))]
pub async fn reconcile(deployment: Arc<ArangoDeployment>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_deployment(&deployment, &ctx).await;
    metrics::record_reconcile_duration(started.elapsed().as_secs_f64(), result.is_ok());
    result
}

async fn reconcile_deployment(deployment: &ArangoDeployment, ctx: &Context) -> Result<Action> {
    let name = deployment.name_any();
    let namespace = deployment.namespace().ok_or_else(|| {
        Error::validation_for_field(&name, "metadata.namespace", "deployment must be namespaced")
    })?;

    if deployment.metadata.deletion_timestamp.is_some() {
        debug!("deployment is being deleted");
        return Ok(Action::await_change());
    }

    if let Err(e) = deployment.spec.validate(&name) {
        warn!(error = %e, "deployment validation failed");
        // Don't requeue for validation errors - they require spec changes
        return Ok(Action::await_change());
    }

    let snapshot = ctx.kube.snapshot(&namespace, &name).await?;
    let status = deployment.status.clone().unwrap_or_default();
    let target = ClientTarget {
        deployment: name.clone(),
        namespace: namespace.clone(),
        tls: deployment.spec.tls.is_secure(),
        token: client_token(&deployment.spec, &name, &snapshot)?,
        agents: status
            .members
            .group(ServerGroup::Agents)
            .iter()
            .map(|m| m.id.clone())
            .collect(),
    };

    let (agency, health) = if deployment.spec.mode == DeploymentMode::Cluster {
        cluster_state(ctx.clients.as_ref(), &target).await
    } else {
        (None, None)
    };

    let dctx = DeploymentContext {
        name: name.clone(),
        namespace: namespace.clone(),
        spec: deployment.spec.clone(),
        kube: ctx.kube.clone(),
        store: KubeStatusStore::new(ctx.kube.clone(), &namespace, &name),
        snapshot: RwLock::new(Arc::new(snapshot)),
        agency,
        health,
        clients: ctx.clients.clone(),
        target,
        events: ctx.events.clone(),
        object_ref: deployment.object_ref(&()),
        retries: ctx.config.status_update_retries,
    };

    inspect_images(&dctx).await?;
    create_plan(&dctx).await?;
    let call_again = ctx.executor.execute(&dctx).await?;

    Ok(if call_again {
        Action::requeue(ctx.config.short_requeue)
    } else {
        Action::requeue(ctx.config.requeue_interval)
    })
}

/// Error policy for the controller
///
/// Retryable errors come back quickly; the rest waits for the regular
/// interval, since repeating right away will not change the outcome.
pub fn error_policy(deployment: Arc<ArangoDeployment>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        deployment = %deployment.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(ctx.config.requeue_interval)
    }
}
