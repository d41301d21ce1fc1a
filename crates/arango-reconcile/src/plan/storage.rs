//! Storage class changes and volume growth

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use arango_common::crd::{
    ActionType, ConditionType, MemberPhase, MemberStatus, Plan, PlanAction, PvcResizeMode,
    ServerGroup, MEMBER_ID_PREVIOUS_ACTION,
};
use arango_common::events::reasons;

use super::rotate::with_resign_leadership;
use super::PlanContext;
use crate::action::storage::{is_smaller, requested_size};

/// Plan for the first member whose volume no longer matches its group
pub(super) fn storage(ctx: &PlanContext<'_>) -> Plan {
    for (group, member) in ctx.status.members.iter() {
        if member.phase != MemberPhase::Created
            || member.persistent_volume_claim_name.is_empty()
            || member.has_condition(&ConditionType::MarkedToRemove)
        {
            continue;
        }
        let Some(pvc) = ctx
            .inspector
            .persistent_volume_claim(&member.persistent_volume_claim_name)
        else {
            continue;
        };

        let plan = storage_class_change(ctx, group, member, &pvc);
        if !plan.is_empty() {
            return plan;
        }
        let plan = volume_growth(ctx, group, member, &pvc);
        if !plan.is_empty() {
            return plan;
        }
    }
    Plan::new()
}

fn storage_class_change(
    ctx: &PlanContext<'_>,
    group: ServerGroup,
    member: &MemberStatus,
    pvc: &PersistentVolumeClaim,
) -> Plan {
    let Some(wanted) = ctx.spec.group(group).storage_class_name.as_deref() else {
        return Plan::new();
    };
    let current = pvc
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.as_deref())
        .unwrap_or_default();
    if current == wanted {
        return Plan::new();
    }

    match group {
        ServerGroup::DBServers => {
            info!(member_id = %member.id, from = current, to = wanted, "storage class changed, replacing dbserver");
            Plan::from(vec![PlanAction::for_member(
                ActionType::MarkToRemoveMember,
                group,
                member,
                "Storage class changed",
            )])
        }
        ServerGroup::Agents => {
            info!(member_id = %member.id, from = current, to = wanted, "storage class changed, replacing agent");
            Plan::from(vec![
                PlanAction::for_member(ActionType::KillMemberPod, group, member, "Storage class changed"),
                PlanAction::for_member(ActionType::ShutdownMember, group, member, "Storage class changed"),
                PlanAction::for_member(ActionType::RemoveMember, group, member, "Storage class changed"),
                PlanAction::new(
                    ActionType::AddMember,
                    Some(group),
                    group.new_member_id(),
                    "Storage class changed",
                ),
                PlanAction::new(
                    ActionType::WaitForMemberUp,
                    Some(group),
                    MEMBER_ID_PREVIOUS_ACTION,
                    "Wait for replacement agent",
                ),
            ])
        }
        _ => {
            debug!(member_id = %member.id, group = %group, "storage class change not supported");
            ctx.event(
                EventType::Warning,
                reasons::STORAGE_CLASS_CHANGE_NOT_SUPPORTED,
                format!(
                    "Storage class of {} member {} cannot change from {current:?} to {wanted:?}",
                    group, member.id
                ),
            );
            Plan::new()
        }
    }
}

fn volume_growth(
    ctx: &PlanContext<'_>,
    group: ServerGroup,
    member: &MemberStatus,
    pvc: &PersistentVolumeClaim,
) -> Plan {
    let group_spec = ctx.spec.group(group);
    let Some(wanted) = group_spec.volume_size.as_ref() else {
        return Plan::new();
    };
    let Some(requested) = requested_size(pvc) else {
        return Plan::new();
    };
    if !is_smaller(requested, wanted) {
        if is_smaller(wanted, requested) {
            debug!(member_id = %member.id, "volume shrink requested, ignoring");
        }
        return Plan::new();
    }

    info!(member_id = %member.id, from = %requested.0, to = %wanted.0, "growing member volume");
    let resize = |type_| PlanAction::for_member(type_, group, member, "Volume size changed");
    match group_spec.volume_resize_mode.unwrap_or_default() {
        PvcResizeMode::Runtime => Plan::from(vec![
            resize(ActionType::PVCResize),
            resize(ActionType::PVCResized),
        ]),
        PvcResizeMode::Rotate => with_resign_leadership(
            group,
            member,
            Plan::from(vec![
                resize(ActionType::ShutdownMember),
                resize(ActionType::PVCResize),
                resize(ActionType::PVCResized),
                resize(ActionType::RotateStartMember),
                resize(ActionType::RotateStopMember),
                resize(ActionType::WaitForMemberUp),
            ]),
        ),
    }
}
