//! ArangoDB operator - plans and executes changes to ArangoDeployments

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, ResourceExt};

use arango_common::crd::{ArangoDeployment, ArangoMember};
use arango_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use arango_common::{DEPLOYMENT_LABEL_KEY, FIELD_MANAGER};
use arango_reconcile::{error_policy, reconcile, Context, OperatorConfig};

/// Kubernetes operator for ArangoDB deployments
#[derive(Parser, Debug)]
#[command(name = "arango-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, env = "ARANGO_LOG_FORMAT", value_enum, default_value = "json")]
    log_format: Format,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller(ControllerArgs),
}

#[derive(clap::Args, Debug)]
struct ControllerArgs {
    /// Only watch deployments in this namespace
    #[arg(long, env = "ARANGO_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds between reconciliations of a converged deployment
    #[arg(long, env = "ARANGO_REQUEUE_INTERVAL_SECS", default_value_t = 30)]
    requeue_interval_secs: u64,

    /// Seconds before looking again at a waiting action
    #[arg(long, env = "ARANGO_SHORT_REQUEUE_SECS", default_value_t = 2)]
    short_requeue_secs: u64,

    /// Seconds a failing action start is retried before the plan fails
    #[arg(long, env = "ARANGO_START_FAILURE_GRACE_SECS", default_value_t = 10)]
    start_failure_grace_secs: u64,

    /// Conflict retries of one status write
    #[arg(long, env = "ARANGO_STATUS_UPDATE_RETRIES", default_value_t = 5)]
    status_update_retries: usize,

    /// Timeout of requests to database servers, in seconds
    #[arg(long, env = "ARANGO_DATABASE_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    database_request_timeout_secs: u64,
}

impl ControllerArgs {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            requeue_interval: Duration::from_secs(self.requeue_interval_secs),
            short_requeue: Duration::from_secs(self.short_requeue_secs),
            start_failure_grace: Duration::from_secs(self.start_failure_grace_secs),
            status_update_retries: self.status_update_retries,
            database_request_timeout: Duration::from_secs(self.database_request_timeout_secs),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Format {
    Json,
    Pretty,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in [ArangoDeployment::crd(), ArangoMember::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "arango-operator".to_string(),
        format: match cli.log_format {
            Format::Json => LogFormat::Json,
            Format::Pretty => LogFormat::Pretty,
        },
    })?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::parse_defaults()).await,
    }
}

impl ControllerArgs {
    /// Defaults plus environment overrides, used when no subcommand is given
    fn parse_defaults() -> Self {
        #[derive(Parser)]
        struct Only {
            #[command(flatten)]
            args: ControllerArgs,
        }
        Only::parse_from(["arango-operator"]).args
    }
}

/// Ensure the operator's CRDs are installed
///
/// Installed with server-side apply on every start so the schema always
/// matches the running operator.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [ArangoDeployment::crd(), ArangoMember::crd()] {
        let name = crd.name_any();
        tracing::info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }
    Ok(())
}

/// Deployment that owns an object, from its deployment label
fn owning_deployment<K: ResourceExt>(object: &K) -> Option<ObjectRef<ArangoDeployment>> {
    let name = object.labels().get(DEPLOYMENT_LABEL_KEY)?;
    let mut owner = ObjectRef::new(name);
    if let Some(ns) = object.namespace() {
        owner = owner.within(&ns);
    }
    Some(owner)
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let (deployments, pods, members): (Api<ArangoDeployment>, Api<Pod>, Api<ArangoMember>) =
        match args.namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            ),
            None => (
                Api::all(client.clone()),
                Api::all(client.clone()),
                Api::all(client.clone()),
            ),
        };

    let config = args.operator_config();
    tracing::info!(?config, namespace = ?args.namespace, "starting ArangoDeployment controller");
    let ctx = Arc::new(Context::builder(client).config(config).build()?);

    let owned = WatcherConfig::default().labels(DEPLOYMENT_LABEL_KEY);
    Controller::new(deployments, WatcherConfig::default())
        .watches(pods, owned, |pod| owning_deployment(&pod))
        .watches(members, WatcherConfig::default(), |member| {
            let mut owner = ObjectRef::new(&member.spec.deployment_name);
            if let Some(ns) = member.namespace() {
                owner = owner.within(&ns);
            }
            Some(owner)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "deployment reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "deployment reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_flags_map_to_operator_config() {
        let cli = Cli::parse_from([
            "arango-operator",
            "controller",
            "--requeue-interval-secs",
            "60",
            "--start-failure-grace-secs",
            "20",
        ]);
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller subcommand");
        };
        let config = args.operator_config();
        assert_eq!(config.requeue_interval, Duration::from_secs(60));
        assert_eq!(config.start_failure_grace, Duration::from_secs(20));
        assert_eq!(config.short_requeue, Duration::from_secs(2));
        assert_eq!(config.status_update_retries, 5);
    }

    #[test]
    fn defaults_match_operator_defaults() {
        let cli = Cli::parse_from(["arango-operator", "controller"]);
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller subcommand");
        };
        assert_eq!(args.operator_config(), OperatorConfig::default());
    }

    #[test]
    fn pods_map_to_their_deployment() {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("db".to_string());
        pod.metadata.labels = Some(
            [(DEPLOYMENT_LABEL_KEY.to_string(), "prod".to_string())]
                .into_iter()
                .collect(),
        );
        let owner = owning_deployment(&pod).expect("labelled pod");
        assert_eq!(owner.name, "prod");
        assert_eq!(owner.namespace.as_deref(), Some("db"));

        assert!(owning_deployment(&Pod::default()).is_none());
    }
}
