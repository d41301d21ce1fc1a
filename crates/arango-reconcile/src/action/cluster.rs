//! Deployment-wide actions: maintenance, bootstrap, restore, license and
//! the shard rebalancer

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use arango_common::crd::{
    ActionType, ConditionType, DeploymentMode, LicenseStatus, PlanAction, RebalancerStatus,
    RestoreState, RestoreStatus,
};
use arango_common::{metrics, Error, Result, SECRET_KEY_LICENSE};

use super::params::{BackupParams, PlanActionParams, UserParams};
use super::security::{secret_value, sha256_hex};
use super::{entry_accessor, Action, ActionRegistryBuilder};
use crate::context::{ActionContext, JobStatus};

/// Data key holding a bootstrap password
pub const SECRET_KEY_PASSWORD: &str = "password";

/// Shard moves started per rebalancer round when the spec does not say
pub const DEFAULT_PARALLEL_MOVES: u32 = 10;

pub(super) fn register(builder: &mut ActionRegistryBuilder, grace: Duration) {
    builder
        .register_with_grace(ActionType::EnableMaintenance, enable_maintenance, grace)
        .register_with_grace(ActionType::DisableMaintenance, disable_maintenance, grace)
        .register(ActionType::SetMaintenanceCondition, set_maintenance_condition)
        .register_with_grace(ActionType::BootstrapSetPassword, bootstrap_set_password, grace)
        .register(ActionType::BootstrapUpdate, bootstrap_update)
        .register_with_grace(ActionType::ClusterMemberCleanup, cluster_member_cleanup, grace)
        .register(ActionType::BackupRestore, backup_restore)
        .register(ActionType::BackupRestoreClean, backup_restore_clean)
        .register_with_grace(ActionType::LicenseSet, license_set, grace)
        .register_with_grace(ActionType::RebalancerGenerate, rebalancer_generate, grace)
        .register_with_grace(ActionType::RebalancerCheck, rebalancer_check, grace);
}

fn enable_maintenance(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(SetMaintenance {
        entry,
        enabled: true,
    }))
}

fn disable_maintenance(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(SetMaintenance {
        entry,
        enabled: false,
    }))
}

fn set_maintenance_condition(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(SyncMaintenanceCondition { entry }))
}

fn bootstrap_set_password(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(BootstrapSetPassword { entry, params }))
}

fn bootstrap_update(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(BootstrapUpdate { entry }))
}

fn cluster_member_cleanup(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(ClusterMemberCleanup { entry }))
}

fn backup_restore(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(BackupRestore { entry, params }))
}

fn backup_restore_clean(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(BackupRestoreClean { entry }))
}

fn license_set(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(LicenseSet { entry }))
}

fn rebalancer_generate(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(RebalancerGenerate { entry }))
}

fn rebalancer_check(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(RebalancerCheck { entry }))
}

async fn set_deployment_condition(
    ctx: &dyn ActionContext,
    type_: ConditionType,
    value: bool,
    reason: &'static str,
) -> Result<bool> {
    ctx.mutate_status(Box::new(move |s| {
        s.conditions.update(type_.clone(), value, reason, "", "")
    }))
    .await
}

fn utf8(kind: &str, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|e| Error::serialization_for_kind(kind, format!("not valid UTF-8: {e}")))
}

// =============================================================================
// Maintenance
// =============================================================================

/// Toggles supervision maintenance and mirrors it as a condition
struct SetMaintenance {
    entry: PlanAction,
    enabled: bool,
}

#[async_trait]
impl Action for SetMaintenance {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        if ctx.mode() != DeploymentMode::Cluster {
            return Ok(true);
        }
        info!(enabled = self.enabled, "setting maintenance mode");
        ctx.database()?.set_maintenance(self.enabled).await?;
        set_deployment_condition(
            ctx,
            ConditionType::MaintenanceMode,
            self.enabled,
            "Maintenance",
        )
        .await?;
        Ok(true)
    }
}

/// Copies the agency maintenance flag into the deployment conditions
struct SyncMaintenanceCondition {
    entry: PlanAction,
}

#[async_trait]
impl Action for SyncMaintenanceCondition {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some(agency) = ctx.agency() else {
            debug!("no agency snapshot, keeping maintenance condition");
            return Ok(true);
        };
        let enabled = agency.maintenance;
        ctx.mutate_status(Box::new(move |s| {
            if enabled {
                s.conditions
                    .update(ConditionType::MaintenanceMode, true, "Maintenance", "", "")
            } else {
                s.conditions.remove(&ConditionType::MaintenanceMode)
            }
        }))
        .await?;
        Ok(true)
    }
}

// =============================================================================
// Bootstrap
// =============================================================================

/// Sets the initial password of a user from its spec secret
struct BootstrapSetPassword {
    entry: PlanAction,
    params: UserParams,
}

#[async_trait]
impl Action for BootstrapSetPassword {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let user = &self.params.user;
        let Some(secret) = ctx.spec().bootstrap.password_secret_names.get(user) else {
            warn!(user = %user, "no password secret configured");
            return Ok(true);
        };
        let password = secret_value(ctx.inspector().as_ref(), secret, SECRET_KEY_PASSWORD)
            .ok_or_else(|| {
                Error::action_failed(
                    "BootstrapSetPassword",
                    format!("secret {secret} has no {SECRET_KEY_PASSWORD}"),
                )
            })?;
        let password = utf8("secret", password)?;
        ctx.database()?.set_user_password(user, &password).await?;
        info!(user = %user, "bootstrap password set");
        Ok(true)
    }
}

struct BootstrapUpdate {
    entry: PlanAction,
}

#[async_trait]
impl Action for BootstrapUpdate {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        set_deployment_condition(
            ctx,
            ConditionType::BootstrapCompleted,
            true,
            "BootstrapCompleted",
        )
        .await?;
        Ok(true)
    }
}

/// Removes a failed server the status does not know from the cluster
struct ClusterMemberCleanup {
    entry: PlanAction,
}

#[async_trait]
impl Action for ClusterMemberCleanup {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        if ctx.member(&self.entry.member_id).await?.is_some() {
            warn!(member_id = %self.entry.member_id, "server is a known member, not removing");
            return Ok(true);
        }
        ctx.database()?.remove_server(&self.entry.member_id).await?;
        info!(member_id = %self.entry.member_id, "removed unknown server from cluster");
        Ok(true)
    }
}

// =============================================================================
// Restore
// =============================================================================

/// Restores a hot backup and records the outcome
///
/// A failed restore is recorded in the status instead of failing the plan,
/// so that the builder stops asking for it until the spec changes.
struct BackupRestore {
    entry: PlanAction,
    params: BackupParams,
}

#[async_trait]
impl Action for BackupRestore {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let backup = self.params.backup.clone();
        let status = ctx.status().await?;
        if let Some(restore) = &status.restore {
            if restore.requested_from == backup && restore.state != RestoreState::Restoring {
                return Ok(true);
            }
        }

        let requested = backup.clone();
        ctx.mutate_status(Box::new(move |s| {
            let next = Some(RestoreStatus {
                requested_from: requested.clone(),
                state: RestoreState::Restoring,
                message: String::new(),
            });
            if s.restore == next {
                return false;
            }
            s.restore = next;
            true
        }))
        .await?;

        let outcome = match ctx.database() {
            Ok(db) => db.restore_backup(&backup).await,
            Err(e) => Err(e),
        };
        let (state, message) = match outcome {
            Ok(()) => {
                info!(backup = %backup, "backup restored");
                (RestoreState::Restored, String::new())
            }
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(backup = %backup, error = %e, "backup restore failed");
                (RestoreState::Failed, e.to_string())
            }
        };
        ctx.mutate_status(Box::new(move |s| {
            s.restore = Some(RestoreStatus {
                requested_from: backup.clone(),
                state: state.clone(),
                message: message.clone(),
            });
            true
        }))
        .await?;
        Ok(true)
    }
}

struct BackupRestoreClean {
    entry: PlanAction,
}

#[async_trait]
impl Action for BackupRestoreClean {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        ctx.mutate_status(Box::new(|s| s.restore.take().is_some()))
            .await?;
        Ok(true)
    }
}

// =============================================================================
// License
// =============================================================================

/// Pushes the license key and remembers its hash
struct LicenseSet {
    entry: PlanAction,
}

#[async_trait]
impl Action for LicenseSet {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some(secret) = ctx.spec().license.secret_name.clone() else {
            return Ok(true);
        };
        let Some(license) = secret_value(ctx.inspector().as_ref(), &secret, SECRET_KEY_LICENSE)
        else {
            warn!(secret = %secret, "license secret missing");
            return Ok(true);
        };
        let hash = sha256_hex(&license);
        let status = ctx.status().await?;
        if status.license.as_ref().map(|l| l.hash.as_str()) == Some(hash.as_str()) {
            return Ok(true);
        }

        let license = utf8("secret", license)?;
        ctx.database()?.set_license(license.trim()).await?;
        info!(hash = %hash, "license applied");
        ctx.mutate_status(Box::new(move |s| {
            s.license = Some(LicenseStatus { hash: hash.clone() });
            true
        }))
        .await?;
        Ok(true)
    }
}

// =============================================================================
// Rebalancer
// =============================================================================

/// Starts a round of shard moves
struct RebalancerGenerate {
    entry: PlanAction,
}

#[async_trait]
impl Action for RebalancerGenerate {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let status = ctx.status().await?;
        if status
            .rebalancer
            .as_ref()
            .is_some_and(|r| !r.moves_in_progress.is_empty())
        {
            debug!("previous moves still running");
            return Ok(true);
        }
        let parallel = ctx
            .spec()
            .rebalancer
            .as_ref()
            .and_then(|r| r.parallel_moves)
            .unwrap_or(DEFAULT_PARALLEL_MOVES);

        let jobs = ctx.database()?.start_rebalance(parallel).await?;
        metrics::record_rebalancer_moves(jobs.len() as u64, 0, 0);
        info!(moves = jobs.len(), "rebalancer moves started");
        ctx.mutate_status(Box::new(move |s| {
            s.rebalancer = Some(RebalancerStatus {
                moves_in_progress: jobs.clone(),
                last_check_time: Some(Utc::now()),
            });
            true
        }))
        .await?;
        Ok(true)
    }
}

/// Drops finished shard moves from the status
struct RebalancerCheck {
    entry: PlanAction,
}

#[async_trait]
impl Action for RebalancerCheck {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let status = ctx.status().await?;
        let moves = status
            .rebalancer
            .map(|r| r.moves_in_progress)
            .unwrap_or_default();
        if moves.is_empty() {
            return Ok(true);
        }

        let database = ctx.database()?;
        let mut running = Vec::new();
        let (mut succeeded, mut failed) = (0u64, 0u64);
        for job in moves {
            match database.job_status(&job).await? {
                JobStatus::Pending | JobStatus::Running => running.push(job),
                JobStatus::Finished => succeeded += 1,
                JobStatus::Failed(reason) => {
                    debug!(job_id = %job, reason = %reason, "shard move failed");
                    failed += 1;
                }
                JobStatus::NotFound => failed += 1,
            }
        }
        metrics::record_rebalancer_moves(0, succeeded, failed);

        ctx.mutate_status(Box::new(move |s| {
            let r = s.rebalancer.get_or_insert_with(Default::default);
            if r.moves_in_progress == running {
                return false;
            }
            r.moves_in_progress = running.clone();
            r.last_check_time = Some(Utc::now());
            true
        }))
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MockDatabaseClient, Snapshot};
    use crate::testing::{created_member, secret, FakeContext};
    use arango_common::crd::{
        DeploymentSpec, DeploymentStatus, LicenseSpec, RebalancerSpec, ServerGroup,
    };
    use std::collections::BTreeMap;

    fn cluster_spec() -> DeploymentSpec {
        DeploymentSpec {
            mode: DeploymentMode::Cluster,
            image: "arangodb/enterprise:3.11.4".to_string(),
            ..Default::default()
        }
    }

    fn with_secrets(ctx: FakeContext, secrets: Vec<k8s_openapi::api::core::v1::Secret>) -> FakeContext {
        let mut snapshot = Snapshot::default();
        for s in secrets {
            let name = s.metadata.name.clone().unwrap_or_default();
            snapshot.secrets.insert(name, s);
        }
        ctx.with_snapshot(snapshot)
    }

    #[tokio::test]
    async fn maintenance_toggles_cluster_and_condition() {
        let mut db = MockDatabaseClient::new();
        db.expect_set_maintenance()
            .withf(|enabled| *enabled)
            .times(1)
            .returning(|_| Ok(()));
        db.expect_set_maintenance()
            .withf(|enabled| !*enabled)
            .times(1)
            .returning(|_| Ok(()));
        let ctx = FakeContext::new().with_spec(cluster_spec()).with_database(db);

        enable_maintenance(PlanAction::for_cluster(ActionType::EnableMaintenance, ""))
            .expect("build")
            .start(&ctx)
            .await
            .expect("enable");
        assert!(ctx.current().conditions.is_true(&ConditionType::MaintenanceMode));

        disable_maintenance(PlanAction::for_cluster(ActionType::DisableMaintenance, ""))
            .expect("build")
            .start(&ctx)
            .await
            .expect("disable");
        assert!(!ctx.current().conditions.is_true(&ConditionType::MaintenanceMode));
    }

    #[tokio::test]
    async fn maintenance_is_a_noop_outside_cluster_mode() {
        let spec = arango_common::crd::DeploymentSpec {
            mode: arango_common::crd::DeploymentMode::Single,
            image: "arangodb/arangodb:3.11.4".to_string(),
            ..Default::default()
        };
        // No expectations: any database call fails the test.
        let ctx = FakeContext::new()
            .with_spec(spec)
            .with_database(MockDatabaseClient::new());
        let done = enable_maintenance(PlanAction::for_cluster(ActionType::EnableMaintenance, ""))
            .expect("build")
            .start(&ctx)
            .await
            .expect("start");
        assert!(done);
        assert_eq!(ctx.write_count(), 0);
    }

    #[tokio::test]
    async fn maintenance_condition_follows_agency() {
        let agency = crate::agency::AgencyCache {
            maintenance: true,
            ..Default::default()
        };
        let ctx = FakeContext::new().with_agency(agency);
        let action =
            set_maintenance_condition(PlanAction::for_cluster(ActionType::SetMaintenanceCondition, ""))
                .expect("build");
        action.start(&ctx).await.expect("start");
        assert!(ctx.current().conditions.is_true(&ConditionType::MaintenanceMode));
    }

    #[tokio::test]
    async fn bootstrap_password_comes_from_secret() {
        let mut db = MockDatabaseClient::new();
        db.expect_set_user_password()
            .withf(|user, password| user == "root" && password == "s3cret")
            .times(1)
            .returning(|_, _| Ok(()));
        let mut spec = cluster_spec();
        spec.bootstrap.password_secret_names =
            BTreeMap::from([("root".to_string(), "root-pw".to_string())]);
        let ctx = with_secrets(
            FakeContext::new().with_spec(spec).with_database(db),
            vec![secret("root-pw", &[("password", b"s3cret")])],
        );

        let action = bootstrap_set_password(
            PlanAction::for_cluster(ActionType::BootstrapSetPassword, "")
                .with_params(&UserParams {
                    user: "root".to_string(),
                }),
        )
        .expect("build");
        assert!(action.start(&ctx).await.expect("start"));
    }

    #[tokio::test]
    async fn cluster_member_cleanup_spares_known_members() {
        let mut status = DeploymentStatus::default();
        status
            .members
            .add(ServerGroup::DBServers, created_member("PRMR-1"))
            .expect("add");
        let mut db = MockDatabaseClient::new();
        db.expect_remove_server()
            .withf(|id| id == "PRMR-9")
            .times(1)
            .returning(|_| Ok(()));
        let ctx = FakeContext::new()
            .with_spec(cluster_spec())
            .with_status(status)
            .with_database(db);

        for id in ["PRMR-1", "PRMR-9"] {
            let entry = PlanAction::new(ActionType::ClusterMemberCleanup, None, id, "");
            cluster_member_cleanup(entry)
                .expect("build")
                .start(&ctx)
                .await
                .expect("start");
        }
    }

    #[tokio::test]
    async fn failed_restore_is_recorded_not_retried() {
        let mut db = MockDatabaseClient::new();
        db.expect_restore_backup()
            .times(1)
            .returning(|_| Err(Error::database_permanent("restore", "backup not found")));
        let ctx = FakeContext::new().with_spec(cluster_spec()).with_database(db);
        let action = backup_restore(
            PlanAction::for_cluster(ActionType::BackupRestore, "").with_params(&BackupParams {
                backup: "b1".to_string(),
            }),
        )
        .expect("build");

        assert!(action.start(&ctx).await.expect("start"));
        let restore = ctx.current().restore.expect("restore status");
        assert_eq!(restore.state, RestoreState::Failed);
        assert!(restore.message.contains("backup not found"));

        // A second run sees the recorded outcome and does not call again.
        assert!(action.start(&ctx).await.expect("repeat"));

        backup_restore_clean(PlanAction::for_cluster(ActionType::BackupRestoreClean, ""))
            .expect("build")
            .start(&ctx)
            .await
            .expect("clean");
        assert_eq!(ctx.current().restore, None);
    }

    #[tokio::test]
    async fn license_is_applied_once_per_key() {
        let mut db = MockDatabaseClient::new();
        db.expect_set_license()
            .withf(|l| l == "LICENSE-KEY")
            .times(1)
            .returning(|_| Ok(()));
        let spec = DeploymentSpec {
            license: LicenseSpec {
                secret_name: Some("lic".to_string()),
            },
            ..cluster_spec()
        };
        let ctx = with_secrets(
            FakeContext::new().with_spec(spec).with_database(db),
            vec![secret("lic", &[("license", b"LICENSE-KEY\n")])],
        );
        let action =
            license_set(PlanAction::for_cluster(ActionType::LicenseSet, "")).expect("build");

        action.start(&ctx).await.expect("start");
        action.start(&ctx).await.expect("repeat");
        assert_eq!(
            ctx.current().license.map(|l| l.hash),
            Some(sha256_hex(b"LICENSE-KEY\n"))
        );
    }

    /// Story: the rebalancer starts two moves; one finishes, one keeps
    /// running; a new round is refused until the running move is gone.
    #[tokio::test]
    async fn story_rebalancer_round() {
        let mut db = MockDatabaseClient::new();
        db.expect_start_rebalance()
            .withf(|max| *max == 2)
            .times(1)
            .returning(|_| Ok(vec!["m1".to_string(), "m2".to_string()]));
        db.expect_job_status().returning(|job| {
            Ok(if job == "m1" {
                JobStatus::Finished
            } else {
                JobStatus::Running
            })
        });
        let spec = DeploymentSpec {
            rebalancer: Some(RebalancerSpec {
                enabled: true,
                parallel_moves: Some(2),
            }),
            ..cluster_spec()
        };
        let ctx = FakeContext::new().with_spec(spec).with_database(db);

        let generate =
            rebalancer_generate(PlanAction::for_cluster(ActionType::RebalancerGenerate, ""))
                .expect("build");
        generate.start(&ctx).await.expect("generate");

        rebalancer_check(PlanAction::for_cluster(ActionType::RebalancerCheck, ""))
            .expect("build")
            .start(&ctx)
            .await
            .expect("check");
        let rebalancer = ctx.current().rebalancer.expect("rebalancer status");
        assert_eq!(rebalancer.moves_in_progress, vec!["m2".to_string()]);

        // start_rebalance is expected exactly once.
        generate.start(&ctx).await.expect("second round skipped");
    }
}
