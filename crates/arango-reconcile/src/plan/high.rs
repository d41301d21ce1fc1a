//! High-priority builder chain
//!
//! Bookkeeping that must not wait behind a long-running normal plan: new
//! members get their ArangoMember and phase, stale conditions are repaired
//! and template changes are turned into rotation conditions that the normal
//! chain acts on.

use tracing::{debug, info, instrument};

use arango_common::crd::{
    ActionType, ConditionType, MemberPhase, MemberStatus, Plan, PlanAction, ServerGroup,
};

use super::cluster::{self, LICENSE_BACK_OFF, REBALANCER_CHECK_BACK_OFF};
use super::{BuiltPlan, PlanAppender, PlanContext};
use crate::action::params::{ConditionParams, PhaseParams, PlanActionParams};

/// Compute the high-priority queue
#[instrument(skip(ctx), fields(deployment = %ctx.deployment))]
pub fn build_high_plan(ctx: &PlanContext<'_>) -> BuiltPlan {
    if !ctx.status.high_priority_plan.is_empty() {
        return BuiltPlan::in_flight(&ctx.status.high_priority_plan, &ctx.status.back_off);
    }

    let (plan, back_off) = PlanAppender::new(ctx)
        .apply_if_empty("MemberPhaseInit", member_phase_init)
        .apply_if_empty("CleanOutRepair", clean_out_repair)
        .apply_if_empty("FailedUpdateCleanup", failed_update_cleanup)
        .apply_if_empty("RotationConditions", rotation_conditions)
        .apply_if_empty("VolumeUnschedulable", volume_unschedulable)
        .apply_if_empty_with_back_off("LicenseCheck", LICENSE_BACK_OFF, cluster::license)
        .apply_if_empty_with_back_off(
            "RebalancerCheck",
            REBALANCER_CHECK_BACK_OFF,
            cluster::rebalancer_check,
        )
        .finish();

    let changed = !plan.is_empty() || back_off != ctx.status.back_off;
    BuiltPlan {
        plan,
        back_off,
        changed,
    }
}

fn set_conditions(
    group: ServerGroup,
    member: &MemberStatus,
    reason: &str,
    params: ConditionParams,
) -> PlanAction {
    PlanAction::for_member(ActionType::SetMemberCondition, group, member, reason)
        .with_params(&params)
}

fn member_phase_init(ctx: &PlanContext<'_>) -> Plan {
    ctx.status
        .members
        .iter()
        .filter(|(_, m)| m.phase == MemberPhase::None)
        .flat_map(|(group, m)| {
            debug!(group = %group, member_id = %m.id, "initialising member");
            [
                PlanAction::for_member(ActionType::ArangoMemberUpdatePodSpec, group, m, "Propagating spec of pod"),
                PlanAction::for_member(ActionType::ArangoMemberUpdatePodStatus, group, m, "Propagating status of pod"),
                PlanAction::for_member(ActionType::MemberPhaseUpdate, group, m, "Move to Pending phase")
                    .with_params(&PhaseParams {
                        phase: MemberPhase::Pending,
                    }),
            ]
        })
        .collect()
}

/// DBServers carrying `CleanedOut` although the agency no longer lists them
/// as cleaned would never be removed; drop the stale condition
fn clean_out_repair(ctx: &PlanContext<'_>) -> Plan {
    let Some(agency) = ctx.agency else {
        return Plan::new();
    };
    ctx.status
        .members
        .iter_groups(&[ServerGroup::DBServers])
        .filter(|(_, m)| {
            m.has_condition(&ConditionType::CleanedOut)
                && !m.has_condition(&ConditionType::MarkedToRemove)
                && !agency.is_cleaned(&m.id)
        })
        .map(|(group, m)| {
            info!(member_id = %m.id, "dbserver is no longer cleaned out in agency");
            set_conditions(
                group,
                m,
                "Cleaned out condition without agency record",
                ConditionParams::default().remove(ConditionType::CleanedOut),
            )
        })
        .collect()
}

/// An `Updating` condition outliving its plan means the in-place update
/// died; fall back to a restart
fn failed_update_cleanup(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.status.plan.is_empty() {
        return Plan::new();
    }
    ctx.status
        .members
        .iter()
        .filter(|(_, m)| m.has_condition(&ConditionType::Updating))
        .map(|(group, m)| {
            info!(member_id = %m.id, "in-place update did not finish, restarting member");
            set_conditions(
                group,
                m,
                "Clean update actions after failure",
                ConditionParams::default()
                    .remove(ConditionType::PendingUpdate)
                    .remove(ConditionType::Updating)
                    .set(ConditionType::UpdateFailed, true)
                    .set(ConditionType::PendingRestart, true),
            )
        })
        .collect()
}

const ROTATION_CONDITIONS: [ConditionType; 5] = [
    ConditionType::PendingUpdate,
    ConditionType::Updating,
    ConditionType::UpdateFailed,
    ConditionType::PendingRestart,
    ConditionType::Restart,
];

/// Members whose ArangoMember template moved on get a rotation condition
fn rotation_conditions(ctx: &PlanContext<'_>) -> Plan {
    ctx.status
        .members
        .iter()
        .filter(|(_, m)| m.phase == MemberPhase::Created)
        .filter(|(_, m)| !ROTATION_CONDITIONS.iter().any(|c| m.has_condition(c)))
        .filter(|(group, m)| {
            ctx.inspector
                .arango_member(&m.arango_member_name(ctx.deployment, *group))
                .is_some_and(|am| am.template_changed())
        })
        .map(|(group, m)| {
            if in_place_capable(ctx, m) {
                debug!(group = %group, member_id = %m.id, "template changed, update in place");
                set_conditions(
                    group,
                    m,
                    "Pod template changed",
                    ConditionParams::default().set(ConditionType::PendingUpdate, true),
                )
            } else {
                debug!(group = %group, member_id = %m.id, "template changed, restart required");
                set_conditions(
                    group,
                    m,
                    "Pod template changed",
                    ConditionParams::default()
                        .set(ConditionType::PendingRestart, true)
                        .set(ConditionType::Restart, true),
                )
            }
        })
        .collect()
}

/// The running pod differs from the target only by an image reference that
/// carries the same server version
fn in_place_capable(ctx: &PlanContext<'_>, member: &MemberStatus) -> bool {
    let Some(pod_image) = ctx.member_pod(member).and_then(|p| {
        p.spec
            .and_then(|s| s.containers.into_iter().next())
            .and_then(|c| c.image)
    }) else {
        return false;
    };
    if pod_image == ctx.spec.image {
        return false;
    }
    match (
        ctx.status.image_info(&pod_image),
        ctx.status.image_info(&ctx.spec.image),
    ) {
        (Some(running), Some(target)) => {
            running.arangodb_version == target.arangodb_version
                && running.enterprise == target.enterprise
        }
        _ => false,
    }
}

fn volume_unschedulable(ctx: &PlanContext<'_>) -> Plan {
    ctx.status
        .members
        .iter()
        .filter(|(_, m)| !m.has_condition(&ConditionType::MemberVolumeUnschedulable))
        .filter(|(_, m)| {
            ctx.member_pod(m)
                .is_some_and(|p| unschedulable_due_to_volume(&p))
        })
        .map(|(group, m)| {
            info!(member_id = %m.id, "member pod cannot be scheduled because of its volume");
            set_conditions(
                group,
                m,
                "Volume is unschedulable",
                ConditionParams::default().set(ConditionType::MemberVolumeUnschedulable, true),
            )
        })
        .collect()
}

fn unschedulable_due_to_volume(pod: &k8s_openapi::api::core::v1::Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some("Unschedulable")
                && c.message
                    .as_deref()
                    .is_some_and(|msg| msg.to_lowercase().contains("volume"))
        })
}
