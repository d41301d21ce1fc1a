//! HTTP clients for ArangoDB servers and the agency
//!
//! The operator talks to the cluster through the deployment service for
//! cluster-wide operations, directly to single members for key reloads and
//! shutdowns, and to the agents for the agency snapshot. Requests carry a
//! superuser JWT signed with the deployment's JWT secret.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use arango_common::crd::ServerGroup;
use arango_common::{Error, Result};

use crate::agency::{AgencyCache, ClusterHealth, CollectionShards, CollectionsByDatabase};
use crate::context::{DatabaseClient, JobStatus, KeyState, ServerClient};

/// Port every arangod listens on
pub const ARANGO_PORT: u16 = 8529;

const AGENCY_READ_PATHS: [&str; 6] = [
    "/arango/Plan/Collections",
    "/arango/Current/Collections",
    "/arango/Target/CleanedServers",
    "/arango/Target/ToBeCleanedServers",
    "/arango/Target/ToDo",
    "/arango/Supervision/Maintenance",
];

/// Where and how to reach one deployment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientTarget {
    /// Deployment name
    pub deployment: String,
    /// Namespace of the deployment
    pub namespace: String,
    /// Whether members serve TLS
    pub tls: bool,
    /// Superuser JWT, None when authentication is disabled
    pub token: Option<String>,
    /// IDs of the agents, tried in order for agency reads
    pub agents: Vec<String>,
}

impl ClientTarget {
    fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// Endpoint of the deployment service
    pub fn deployment_endpoint(&self) -> String {
        format!(
            "{}://{}.{}.svc:{ARANGO_PORT}",
            self.scheme(),
            self.deployment,
            self.namespace
        )
    }

    /// Endpoint of one member through the internal headless service
    pub fn member_endpoint(&self, group: ServerGroup, id: &str) -> String {
        format!(
            "{}://{}-{}-{}.{}-int.{}.svc:{ARANGO_PORT}",
            self.scheme(),
            self.deployment,
            group.as_role(),
            id.to_lowercase(),
            self.deployment,
            self.namespace
        )
    }
}

/// Produces clients for a deployment
#[cfg_attr(test, automock)]
pub trait ClientFactory: Send + Sync {
    /// Client for cluster-wide operations
    fn database(&self, target: &ClientTarget) -> Result<Arc<dyn DatabaseClient>>;

    /// Client for one member
    fn server(
        &self,
        target: &ClientTarget,
        group: ServerGroup,
        member_id: &str,
    ) -> Result<Arc<dyn ServerClient>>;
}

#[derive(Serialize)]
struct SuperuserClaims<'a> {
    iss: &'a str,
    server_id: &'a str,
}

/// Sign a superuser token with the deployment JWT secret
pub fn superuser_token(secret: &[u8]) -> Result<String> {
    let claims = SuperuserClaims {
        iss: "arangodb",
        server_id: "arango-operator",
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| Error::internal_with_context("client", format!("cannot sign JWT: {e}")))
}

/// [`ClientFactory`] issuing plain HTTP requests
#[derive(Clone)]
pub struct HttpClientFactory {
    http: reqwest::Client,
}

impl HttpClientFactory {
    /// Create a factory whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        // Member certificates are signed by the deployment CA, which the
        // operator does not load into its trust store.
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::internal_with_context("client", format!("cannot build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

impl ClientFactory for HttpClientFactory {
    fn database(&self, target: &ClientTarget) -> Result<Arc<dyn DatabaseClient>> {
        let agents = target
            .agents
            .iter()
            .map(|id| target.member_endpoint(ServerGroup::Agents, id))
            .collect();
        Ok(Arc::new(HttpDatabaseClient {
            http: Http {
                client: self.http.clone(),
                token: target.token.clone(),
            },
            endpoint: target.deployment_endpoint(),
            agents,
        }))
    }

    fn server(
        &self,
        target: &ClientTarget,
        group: ServerGroup,
        member_id: &str,
    ) -> Result<Arc<dyn ServerClient>> {
        Ok(Arc::new(HttpServerClient {
            http: Http {
                client: self.http.clone(),
                token: target.token.clone(),
            },
            endpoint: target.member_endpoint(group, member_id),
        }))
    }
}

/// Request helpers shared by both clients
#[derive(Clone)]
struct Http {
    client: reqwest::Client,
    token: Option<String>,
}

impl Http {
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, endpoint: &str, builder: RequestBuilder) -> Result<Response> {
        builder
            .send()
            .await
            .map_err(|e| Error::database(endpoint, format!("request failed: {e}")))
    }

    /// Send and require a 2xx answer
    async fn call(&self, endpoint: &str, builder: RequestBuilder) -> Result<Response> {
        let response = self.send(endpoint, builder).await?;
        ensure_success(endpoint, response)
    }
}

fn ensure_success(endpoint: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = format!("HTTP {status}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(Error::database(endpoint, message))
    } else {
        Err(Error::database_permanent(endpoint, message))
    }
}

async fn read_json<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::database(endpoint, format!("invalid JSON: {e}")))
}

// =============================================================================
// Agency
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct AgencyRoot {
    #[serde(default)]
    arango: AgencyTree,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgencyTree {
    #[serde(default)]
    plan: PlanTree,
    #[serde(default)]
    current: CurrentTree,
    #[serde(default)]
    target: TargetTree,
    #[serde(default)]
    supervision: SupervisionTree,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PlanTree {
    #[serde(default)]
    collections: CollectionsByDatabase,
}

#[derive(Debug, Default, Deserialize)]
struct CurrentShard {
    #[serde(default)]
    servers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CurrentTree {
    #[serde(default)]
    collections: BTreeMap<String, BTreeMap<String, BTreeMap<String, CurrentShard>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgencyJob {
    #[serde(default, rename = "type")]
    type_: String,
    #[serde(default)]
    shard: String,
    #[serde(default)]
    to_server: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetTree {
    #[serde(default)]
    cleaned_servers: BTreeSet<String>,
    #[serde(default)]
    to_be_cleaned_servers: BTreeSet<String>,
    #[serde(default)]
    to_do: BTreeMap<String, AgencyJob>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SupervisionTree {
    #[serde(default)]
    maintenance: Option<Value>,
}

impl AgencyTree {
    fn into_cache(self) -> AgencyCache {
        let current_collections = self
            .current
            .collections
            .into_iter()
            .map(|(db, cols)| {
                let cols = cols
                    .into_iter()
                    .map(|(col, shards)| {
                        let shards = shards
                            .into_iter()
                            .map(|(shard, s)| (shard, s.servers))
                            .collect();
                        (col, CollectionShards { shards })
                    })
                    .collect();
                (db, cols)
            })
            .collect();

        AgencyCache {
            plan_collections: self.plan.collections,
            current_collections,
            cleaned_servers: self.target.cleaned_servers,
            to_be_cleaned_servers: self.target.to_be_cleaned_servers,
            maintenance: self.supervision.maintenance.is_some(),
        }
    }
}

fn parse_agency(body: Vec<AgencyRoot>) -> AgencyTree {
    body.into_iter().next().unwrap_or_default().arango
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgencyJobStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

fn job_status_from(job: AgencyJobStatus) -> JobStatus {
    match job.status.as_str() {
        "ToDo" => JobStatus::Pending,
        "Pending" => JobStatus::Running,
        "Finished" => JobStatus::Finished,
        "Failed" => JobStatus::Failed(job.reason.unwrap_or_default()),
        other => {
            debug!(status = other, "unexpected agency job status");
            JobStatus::Pending
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ShardMove {
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    shard: String,
    #[serde(flatten)]
    rest: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RebalanceResult {
    #[serde(default)]
    moves: Vec<ShardMove>,
}

#[derive(Debug, Deserialize)]
struct Wrapped<T> {
    result: T,
}

/// Job ids of queued moveShard jobs matching the executed moves
fn move_job_ids(moves: &[ShardMove], todo: &BTreeMap<String, AgencyJob>) -> Vec<String> {
    todo.iter()
        .filter(|(_, job)| job.type_ == "moveShard")
        .filter(|(_, job)| {
            moves
                .iter()
                .any(|m| m.shard == job.shard && m.to == job.to_server)
        })
        .map(|(id, _)| id.clone())
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct NumberOfServers {
    #[serde(default, rename = "cleanedServers")]
    cleaned_servers: Vec<String>,
}

/// Cluster-wide operations through the deployment service
pub struct HttpDatabaseClient {
    http: Http,
    endpoint: String,
    agents: Vec<String>,
}

impl HttpDatabaseClient {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    async fn read_agency(&self) -> Result<AgencyTree> {
        let body = json!([AGENCY_READ_PATHS]);
        let mut last = Error::database("agency", "no agents known");
        for agent in &self.agents {
            let url = format!("{agent}/_api/agency/read");
            let request = self.http.request(Method::POST, &url).json(&body);
            match self.http.call(agent, request).await {
                Ok(response) => {
                    let roots: Vec<AgencyRoot> = read_json(agent, response).await?;
                    return Ok(parse_agency(roots));
                }
                Err(e) => {
                    debug!(agent = %agent, error = %e, "agent did not answer");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// POST a `{"server": id}` job request; None when the server is unknown
    async fn start_server_job(&self, path: &str, id: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct JobId {
            id: String,
        }

        let url = self.url(path);
        let request = self
            .http
            .request(Method::POST, &url)
            .json(&json!({ "server": id }));
        let response = self.http.send(&url, request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let job: JobId = read_json(&url, ensure_success(&url, response)?).await?;
        Ok(Some(job.id))
    }
}

#[async_trait]
impl DatabaseClient for HttpDatabaseClient {
    async fn agency_cache(&self) -> Result<AgencyCache> {
        Ok(self.read_agency().await?.into_cache())
    }

    async fn cluster_health(&self) -> Result<ClusterHealth> {
        let url = self.url("/_admin/cluster/health");
        let response = self
            .http
            .call(&url, self.http.request(Method::GET, &url))
            .await?;
        read_json(&url, response).await
    }

    async fn clean_out_server(&self, id: &str) -> Result<Option<String>> {
        self.start_server_job("/_admin/cluster/cleanOutServer", id)
            .await
    }

    async fn resign_server(&self, id: &str) -> Result<Option<String>> {
        self.start_server_job("/_admin/cluster/resignLeadership", id)
            .await
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        let url = self.url("/_admin/cluster/queryAgencyJob");
        let request = self
            .http
            .request(Method::GET, &url)
            .query(&[("id", job_id)]);
        let response = self.http.send(&url, request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(JobStatus::NotFound);
        }
        let job: AgencyJobStatus = read_json(&url, ensure_success(&url, response)?).await?;
        Ok(job_status_from(job))
    }

    async fn is_cleaned_out(&self, id: &str) -> Result<bool> {
        let url = self.url("/_admin/cluster/numberOfServers");
        let response = self
            .http
            .call(&url, self.http.request(Method::GET, &url))
            .await?;
        let servers: NumberOfServers = read_json(&url, response).await?;
        Ok(servers.cleaned_servers.iter().any(|s| s == id))
    }

    async fn remove_server(&self, id: &str) -> Result<()> {
        let url = self.url("/_admin/cluster/removeServer");
        let request = self.http.request(Method::POST, &url).json(&id);
        let response = self.http.send(&url, request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(server_id = id, "server already gone from cluster");
            return Ok(());
        }
        ensure_success(&url, response)?;
        Ok(())
    }

    async fn set_maintenance(&self, enabled: bool) -> Result<()> {
        let url = self.url("/_admin/cluster/maintenance");
        let mode = if enabled { "on" } else { "off" };
        self.http
            .call(&url, self.http.request(Method::PUT, &url).json(&mode))
            .await?;
        Ok(())
    }

    async fn set_user_password(&self, user: &str, password: &str) -> Result<()> {
        let url = self.url(&format!("/_api/user/{user}"));
        let request = self
            .http
            .request(Method::PATCH, &url)
            .json(&json!({ "passwd": password }));
        self.http.call(&url, request).await?;
        Ok(())
    }

    async fn restore_backup(&self, backup_id: &str) -> Result<()> {
        let url = self.url("/_admin/backup/restore");
        let request = self
            .http
            .request(Method::POST, &url)
            .json(&json!({ "id": backup_id }));
        self.http.call(&url, request).await?;
        Ok(())
    }

    async fn set_license(&self, license: &str) -> Result<()> {
        let url = self.url("/_admin/license");
        self.http
            .call(&url, self.http.request(Method::PUT, &url).json(&license))
            .await?;
        Ok(())
    }

    async fn start_rebalance(&self, max_moves: u32) -> Result<Vec<String>> {
        let url = self.url("/_admin/cluster/rebalance");
        let request = self.http.request(Method::POST, &url).json(&json!({
            "version": 1,
            "maximumNumberOfMoves": max_moves,
            "leaderChanges": true,
            "moveLeaders": true,
            "moveFollowers": true,
        }));
        let response = self.http.call(&url, request).await?;
        let computed: Wrapped<RebalanceResult> = read_json(&url, response).await?;
        let moves = computed.result.moves;
        if moves.is_empty() {
            return Ok(Vec::new());
        }

        let execute = self.url("/_admin/cluster/rebalance/execute");
        let request = self
            .http
            .request(Method::POST, &execute)
            .json(&json!({ "version": 1, "moves": moves }));
        self.http.call(&execute, request).await?;

        let jobs = move_job_ids(&moves, &self.read_agency().await?.target.to_do);
        if jobs.len() < moves.len() {
            warn!(
                moves = moves.len(),
                jobs = jobs.len(),
                "not every executed move shows up as a queued job"
            );
        }
        Ok(jobs)
    }
}

// =============================================================================
// Members
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct Sha {
    #[serde(default)]
    sha256: String,
}

#[derive(Debug, Default, Deserialize)]
struct JwtState {
    #[serde(default)]
    active: Sha,
    #[serde(default)]
    passive: Vec<Sha>,
}

#[derive(Debug, Default, Deserialize)]
struct EncryptionState {
    #[serde(default, rename = "encryption-keys")]
    keys: Vec<Sha>,
}

#[derive(Debug, Default, Deserialize)]
struct TlsState {
    #[serde(default)]
    keyfile: Sha,
    #[serde(default, rename = "SNI")]
    sni: BTreeMap<String, Sha>,
}

impl From<JwtState> for KeyState {
    fn from(state: JwtState) -> Self {
        let mut accepted = vec![state.active.sha256.clone()];
        accepted.extend(state.passive.into_iter().map(|s| s.sha256));
        KeyState {
            active: state.active.sha256,
            accepted,
        }
    }
}

impl From<EncryptionState> for KeyState {
    fn from(state: EncryptionState) -> Self {
        let accepted: Vec<String> = state.keys.into_iter().map(|s| s.sha256).collect();
        KeyState {
            active: accepted.first().cloned().unwrap_or_default(),
            accepted,
        }
    }
}

impl From<TlsState> for KeyState {
    fn from(state: TlsState) -> Self {
        KeyState {
            active: state.keyfile.sha256,
            accepted: state.sni.into_values().map(|s| s.sha256).collect(),
        }
    }
}

/// Operations against one member
pub struct HttpServerClient {
    http: Http,
    endpoint: String,
}

impl HttpServerClient {
    async fn reload<T>(&self, path: &str) -> Result<KeyState>
    where
        T: DeserializeOwned + Into<KeyState>,
    {
        let url = format!("{}{path}", self.endpoint);
        let response = self
            .http
            .call(&url, self.http.request(Method::POST, &url))
            .await?;
        let state: Wrapped<T> = read_json(&url, response).await?;
        Ok(state.result.into())
    }
}

#[async_trait]
impl ServerClient for HttpServerClient {
    async fn is_up(&self) -> Result<bool> {
        let url = format!("{}/_api/version", self.endpoint);
        match self.http.send(&url, self.http.request(Method::GET, &url)).await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "member not reachable");
                Ok(false)
            }
        }
    }

    async fn shutdown(&self, remove_from_cluster: bool) -> Result<()> {
        let url = format!("{}/_admin/shutdown", self.endpoint);
        let mut request = self.http.request(Method::DELETE, &url);
        if remove_from_cluster {
            request = request.query(&[("remove_from_cluster", "1")]);
        }
        self.http.call(&url, request).await?;
        Ok(())
    }

    async fn reload_jwt(&self) -> Result<KeyState> {
        self.reload::<JwtState>("/_admin/server/jwt").await
    }

    async fn reload_encryption(&self) -> Result<KeyState> {
        self.reload::<EncryptionState>("/_admin/server/encryption")
            .await
    }

    async fn reload_tls(&self) -> Result<KeyState> {
        self.reload::<TlsState>("/_admin/server/tls").await
    }
}
