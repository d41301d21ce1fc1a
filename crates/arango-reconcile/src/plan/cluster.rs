//! Deployment-wide builders: maintenance, restore, cleanup of unknown
//! servers, bootstrap, license and the shard rebalancer

use std::time::Duration;

use tracing::{debug, info};

use arango_common::crd::{ActionType, ConditionType, Plan, PlanAction, RestoreState, ServerGroup};
use arango_common::SECRET_KEY_LICENSE;

use super::PlanContext;
use crate::action::params::{BackupParams, PlanActionParams, UserParams};
use crate::action::security::{secret_value, sha256_hex};

/// Maintenance changes are not acted on again within this window
pub(super) const MAINTENANCE_DEBOUNCE: Duration = Duration::from_secs(30);

/// Delay between two rounds of shard moves
pub(super) const REBALANCER_BACK_OFF: Duration = Duration::from_secs(10 * 60);

/// Delay between two license checks
pub(super) const LICENSE_BACK_OFF: Duration = Duration::from_secs(30);

/// Delay between two polls of running shard moves
pub(super) const REBALANCER_CHECK_BACK_OFF: Duration = Duration::from_secs(30);

/// Keep supervision maintenance and the `MaintenanceMode` condition in line
pub(super) fn maintenance(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.cluster {
        return Plan::new();
    }
    let Some(agency) = ctx.agency else {
        return Plan::new();
    };
    let condition = ctx.status.conditions.get(&ConditionType::MaintenanceMode);
    if let Some(c) = condition {
        let since = ctx.now.signed_duration_since(c.last_transition_time);
        if since.num_seconds() < MAINTENANCE_DEBOUNCE.as_secs() as i64 {
            debug!("maintenance condition changed recently");
            return Plan::new();
        }
    }
    let recorded = condition.map(|c| c.is_true()).unwrap_or(false);

    if agency.maintenance && !recorded && !ctx.preconditions.upgrade_in_progress {
        info!("supervision maintenance is enabled without the operator asking for it");
        return Plan::from(vec![PlanAction::for_cluster(
            ActionType::DisableMaintenance,
            "Maintenance enabled outside of the operator",
        )]);
    }
    if recorded && !agency.maintenance {
        return Plan::from(vec![PlanAction::for_cluster(
            ActionType::SetMaintenanceCondition,
            "Maintenance condition out of sync",
        )]);
    }
    Plan::new()
}

/// Restore the requested backup, or forget a finished restore once the
/// request is gone
pub(super) fn restore(ctx: &PlanContext<'_>) -> Plan {
    match (&ctx.spec.restore_from, &ctx.status.restore) {
        (Some(backup), Some(r))
            if &r.requested_from == backup && r.state != RestoreState::Restoring =>
        {
            Plan::new()
        }
        (Some(backup), _) => {
            info!(backup = %backup, "restore requested");
            Plan::from(vec![PlanAction::for_cluster(
                ActionType::BackupRestore,
                "Restore from backup",
            )
            .with_params(&BackupParams {
                backup: backup.clone(),
            })])
        }
        (None, Some(r)) if r.state != RestoreState::Restoring => {
            Plan::from(vec![PlanAction::for_cluster(
                ActionType::BackupRestoreClean,
                "Restore request removed",
            )])
        }
        (None, _) => Plan::new(),
    }
}

/// Remove coordinators and DBServers the cluster reports as failed but the
/// status does not know
pub(super) fn cluster_operation(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.cluster {
        return Plan::new();
    }
    let Some(health) = ctx.health else {
        return Plan::new();
    };
    health
        .failed_servers()
        .filter(|(id, _)| ctx.status.members.by_id(id).is_none())
        .map(|(id, h)| {
            debug!(server = id, role = %h.role, "failed server is not a member");
            PlanAction::new(
                ActionType::ClusterMemberCleanup,
                None,
                id,
                "Remove unknown failed server",
            )
        })
        .collect()
}

/// Start a round of shard moves
pub(super) fn rebalancer_generate(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.cluster || !ctx.spec.rebalancer_enabled() {
        return Plan::new();
    }
    if moves_in_progress(ctx) {
        return Plan::new();
    }
    Plan::from(vec![PlanAction::for_cluster(
        ActionType::RebalancerGenerate,
        "Generate shard moves",
    )])
}

/// Poll shard moves started earlier
pub(super) fn rebalancer_check(ctx: &PlanContext<'_>) -> Plan {
    if !moves_in_progress(ctx) {
        return Plan::new();
    }
    Plan::from(vec![PlanAction::for_cluster(
        ActionType::RebalancerCheck,
        "Check shard moves",
    )])
}

fn moves_in_progress(ctx: &PlanContext<'_>) -> bool {
    ctx.status
        .rebalancer
        .as_ref()
        .is_some_and(|r| !r.moves_in_progress.is_empty())
}

/// Initial passwords, then the `BootstrapCompleted` condition
///
/// Waits until every coordinator (or the single server) serves requests.
pub(super) fn bootstrap(ctx: &PlanContext<'_>) -> Plan {
    if ctx.status.conditions.is_true(&ConditionType::BootstrapCompleted) {
        return Plan::new();
    }
    let members = &ctx.status.members;
    let serving = [ServerGroup::Single, ServerGroup::Coordinators]
        .into_iter()
        .all(|g| members.all_members_serving(g));
    if members.is_empty() || !serving {
        debug!("deployment not serving yet, bootstrap postponed");
        return Plan::new();
    }

    let passwords = ctx
        .spec
        .bootstrap
        .password_secret_names
        .keys()
        .map(|user| {
            PlanAction::for_cluster(ActionType::BootstrapSetPassword, "Set initial password")
                .with_params(&UserParams { user: user.clone() })
        });
    Plan::from_iter(passwords).after([PlanAction::for_cluster(
        ActionType::BootstrapUpdate,
        "Bootstrap completed",
    )])
}

/// Push the license when its key changed
pub(super) fn license(ctx: &PlanContext<'_>) -> Plan {
    let Some(secret) = ctx.spec.license.secret_name.as_deref() else {
        return Plan::new();
    };
    let enterprise = ctx
        .status
        .current_image
        .as_ref()
        .is_some_and(|i| i.enterprise);
    if !enterprise {
        return Plan::new();
    }
    let Some(license) = secret_value(ctx.inspector, secret, SECRET_KEY_LICENSE) else {
        debug!(secret, "license secret missing");
        return Plan::new();
    };
    let hash = sha256_hex(&license);
    if ctx.status.license.as_ref().map(|l| l.hash.as_str()) == Some(hash.as_str()) {
        return Plan::new();
    }
    Plan::from(vec![PlanAction::for_cluster(
        ActionType::LicenseSet,
        "License changed",
    )])
}
