//! Restart, in-place update and version upgrade of single members

use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use arango_common::crd::{
    ActionType, ConditionType, ImageInfo, MemberPhase, MemberStatus, Plan, PlanAction,
    ServerGroup, Version,
};
use arango_common::events::reasons;
use arango_common::POD_REPLACE_ANNOTATION;

use super::PlanContext;
use crate::action::params::{ConditionParams, PlanActionParams};

const ANNOTATION_ORDER: [ServerGroup; 6] = [
    ServerGroup::Agents,
    ServerGroup::Single,
    ServerGroup::Coordinators,
    ServerGroup::DBServers,
    ServerGroup::SyncMasters,
    ServerGroup::SyncWorkers,
];

/// Members whose pod carries the replace annotation get marked to remove
pub(super) fn mark_to_remove(ctx: &PlanContext<'_>) -> Plan {
    ctx.status
        .members
        .iter_groups(&ANNOTATION_ORDER)
        .filter(|(group, _)| {
            matches!(
                group,
                ServerGroup::Agents | ServerGroup::Coordinators | ServerGroup::DBServers
            )
        })
        .filter(|(_, m)| m.phase == MemberPhase::Created)
        .filter(|(_, m)| !m.has_condition(&ConditionType::MarkedToRemove))
        .filter(|(_, m)| {
            ctx.member_pod(m)
                .and_then(|p| p.metadata.annotations)
                .map(|a| a.contains_key(POD_REPLACE_ANNOTATION))
                .unwrap_or(false)
        })
        .map(|(group, m)| {
            PlanAction::for_member(
                ActionType::MarkToRemoveMember,
                group,
                m,
                "Replace flag present",
            )
        })
        .collect()
}

/// Outcome of comparing a member image with the spec image
#[derive(Clone, Debug, Default, PartialEq)]
struct UpgradeDecision {
    from: String,
    to: String,
    needed: bool,
    allowed: bool,
    auto_upgrade: bool,
    hold: bool,
}

fn upgrade_decision(ctx: &PlanContext<'_>, member: &MemberStatus) -> UpgradeDecision {
    let Some(target) = ctx.status.image_info(&ctx.spec.image) else {
        return UpgradeDecision {
            hold: true,
            ..Default::default()
        };
    };
    let current = member.image.as_ref().unwrap_or(target);
    if current.image == target.image {
        return UpgradeDecision::default();
    }

    let from = current.arangodb_version.parse::<Version>();
    let to = target.arangodb_version.parse::<Version>();
    let (Ok(from_version), Ok(to_version)) = (from, to) else {
        warn!(
            member_id = %member.id,
            from = %current.arangodb_version,
            to = %target.arangodb_version,
            "cannot parse image versions, holding upgrade"
        );
        return UpgradeDecision {
            hold: true,
            ..Default::default()
        };
    };

    UpgradeDecision {
        from: describe(current),
        to: describe(target),
        needed: true,
        allowed: upgrade_allowed(from_version, current.enterprise, to_version, target.enterprise),
        auto_upgrade: from_version.major != to_version.major
            || from_version.minor != to_version.minor,
        hold: false,
    }
}

fn describe(info: &ImageInfo) -> String {
    let edition = if info.enterprise {
        "enterprise"
    } else {
        "community"
    };
    format!("{} ({edition})", info.arangodb_version)
}

fn upgrade_allowed(from: Version, from_enterprise: bool, to: Version, to_enterprise: bool) -> bool {
    if to.major < from.major || to.major > from.major + 1 {
        return false;
    }
    !(from_enterprise && !to_enterprise)
}

/// Returns true if restarting the member leaves the group able to serve
fn group_ready_for_restart(ctx: &PlanContext<'_>, group: ServerGroup, member: &MemberStatus) -> bool {
    if ctx.spec.allow_unsafe_upgrade.unwrap_or(false) {
        return true;
    }
    if !ctx.status.conditions.is_true(&ConditionType::BootstrapCompleted) {
        return true;
    }
    // A member that never came up cannot make things worse.
    if !member.has_condition(&ConditionType::Started) || !member.has_condition(&ConditionType::Serving)
    {
        return true;
    }
    let serving = ctx.status.members.all_members_serving(group);
    match group {
        ServerGroup::DBServers => {
            serving && ctx.agency.map(|a| a.all_shards_in_sync()).unwrap_or(false)
        }
        _ => serving,
    }
}

fn rotation_possible(member: &MemberStatus) -> bool {
    member.phase == MemberPhase::Created
        && !member.pod_name.is_empty()
        && !member.has_condition(&ConditionType::Terminating)
}

/// Upgrade the first member running an outdated image, otherwise restart
/// or update the first member asking for it
pub(super) fn rotate_or_upgrade(ctx: &PlanContext<'_>) -> Plan {
    let upgrade = ctx
        .status
        .members
        .iter()
        .filter(|(_, m)| m.phase == MemberPhase::Created && !m.pod_name.is_empty())
        .map(|(g, m)| (g, m, upgrade_decision(ctx, m)))
        .find(|(_, _, d)| d.needed || d.hold);

    if let Some((group, member, decision)) = upgrade {
        return upgrade_plan(ctx, group, member, decision);
    }

    let candidate = ctx.status.members.iter().find(|(group, m)| {
        group_ready_for_restart(ctx, *group, m)
            && rotation_possible(m)
            && (m.has_condition(&ConditionType::Restart)
                || (m.has_condition(&ConditionType::PendingUpdate)
                    && !m.has_condition(&ConditionType::Updating)
                    && !m.has_condition(&ConditionType::UpdateFailed)))
    });
    let Some((group, member)) = candidate else {
        return Plan::new();
    };

    if member.has_condition(&ConditionType::Restart) {
        debug!(group = %group, member_id = %member.id, "restarting member");
        let plan = Plan::from(vec![
            PlanAction::for_member(ActionType::RotateMember, group, member, "Restart flag present"),
            PlanAction::for_member(ActionType::WaitForMemberUp, group, member, "Restart flag present"),
        ]);
        return with_resign_leadership(group, member, plan);
    }
    in_place_update_plan(ctx, group, member)
}

fn upgrade_plan(
    ctx: &PlanContext<'_>,
    group: ServerGroup,
    member: &MemberStatus,
    decision: UpgradeDecision,
) -> Plan {
    if decision.hold || !decision.needed {
        return Plan::new();
    }
    if !decision.allowed {
        ctx.event(
            EventType::Warning,
            reasons::UPGRADE_NOT_ALLOWED,
            format!(
                "Upgrade of {} from {} to {} is not allowed",
                member.id, decision.from, decision.to
            ),
        );
        return Plan::new();
    }
    if !group_ready_for_restart(ctx, group, member) {
        info!(group = %group, member_id = %member.id, "member needs upgrade but group is not ready");
        return Plan::from(vec![PlanAction::for_cluster(
            ActionType::Idle,
            "Waiting for group to become ready for upgrade",
        )]);
    }

    let reason = "Version upgrade";
    let restart = if !decision.auto_upgrade || group.is_stateless() {
        ActionType::RotateMember
    } else {
        ActionType::UpgradeMember
    };
    info!(
        group = %group,
        member_id = %member.id,
        from = %decision.from,
        to = %decision.to,
        action = %restart,
        "creating upgrade plan"
    );

    let image = &ctx.spec.image;
    let mut plan = Plan::from(vec![PlanAction::for_member(
        ActionType::CleanTLSKeyfileCertificate,
        group,
        member,
        "Remove server keyfile and enforce renewal",
    )]);
    if ctx.status.current_image.as_ref().map(|i| &i.image) != Some(image) {
        plan = plan.after([
            PlanAction::for_group(ActionType::SetCurrentImage, group, reason).with_image(image.clone()),
        ]);
    }
    if member.image.as_ref().map(|i| &i.image) != Some(image) {
        plan = plan.after([
            PlanAction::for_member(ActionType::SetMemberCurrentImage, group, member, reason)
                .with_image(image.clone()),
        ]);
    }
    plan = plan.after([
        PlanAction::for_member(restart, group, member, reason),
        PlanAction::for_member(ActionType::WaitForMemberUp, group, member, reason),
    ]);
    with_resign_leadership(group, member, plan)
}

fn in_place_update_plan(ctx: &PlanContext<'_>, group: ServerGroup, member: &MemberStatus) -> Plan {
    let name = member.arango_member_name(ctx.deployment, group);
    if ctx.inspector.arango_member(&name).is_none() {
        debug!(member_id = %member.id, "no ArangoMember, skipping in-place update");
        return Plan::new();
    }

    let start = ConditionParams::default()
        .remove(ConditionType::PendingUpdate)
        .set(ConditionType::Updating, true);
    let pod_image = ctx.member_pod(member).and_then(|p| {
        p.spec
            .and_then(|s| s.containers.into_iter().next())
            .and_then(|c| c.image)
    });
    // Without a pod there is nothing to patch; the high chain turns the
    // stuck Updating condition into a restart.
    if pod_image.is_none() || pod_image.as_deref() == Some(ctx.spec.image.as_str()) {
        return Plan::from(vec![PlanAction::for_member(
            ActionType::SetMemberCondition,
            group,
            member,
            "Cleaning update",
        )
        .with_params(&start)]);
    }

    let reason = "Image changed";
    debug!(group = %group, member_id = %member.id, "creating in-place update plan");
    Plan::from(vec![
        PlanAction::for_member(ActionType::RuntimeContainerImageUpdate, group, member, reason)
            .with_image(ctx.spec.image.clone()),
        PlanAction::for_member(ActionType::WaitForMemberUp, group, member, reason),
        PlanAction::for_member(ActionType::WaitForMemberInSync, group, member, reason),
    ])
    .wrap(
        PlanAction::for_member(ActionType::SetMemberCondition, group, member, reason)
            .with_params(&start),
        PlanAction::for_member(ActionType::SetMemberCondition, group, member, reason)
            .with_params(&ConditionParams::default().remove(ConditionType::Updating)),
    )
}

/// DBServers hand their shard leadership away before going down
pub(super) fn with_resign_leadership(group: ServerGroup, member: &MemberStatus, plan: Plan) -> Plan {
    if group != ServerGroup::DBServers || plan.is_empty() {
        return plan;
    }
    Plan::from(vec![PlanAction::for_member(
        ActionType::ResignLeadership,
        group,
        member,
        "ResignLeadership",
    )])
    .after(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agency::tests::agency_with_shards;
    use crate::context::Snapshot;
    use crate::plan::tests::{healthy_cluster, pods_for};
    use arango_common::crd::{ArangoMember, ArangoMemberSpec, DeploymentSpec, DeploymentStatus};
    use std::collections::BTreeMap;

    fn types(plan: &Plan) -> Vec<ActionType> {
        plan.iter().map(|a| a.type_.clone()).collect()
    }

    fn image(name: &str, version: &str, enterprise: bool) -> ImageInfo {
        ImageInfo {
            image: name.to_string(),
            image_id: format!("sha256:{version}"),
            arangodb_version: version.to_string(),
            enterprise,
        }
    }

    /// Cluster whose spec moved to `target`; members listed in `upgraded`
    /// already run it
    fn cluster_moving_to(target: ImageInfo, upgraded: &[ServerGroup]) -> (DeploymentSpec, DeploymentStatus) {
        let (mut spec, mut status) = healthy_cluster();
        spec.image = target.image.clone();
        status.images.push(target.clone());
        for group in upgraded {
            for m in status.members.group_mut(*group) {
                m.image = Some(target.clone());
            }
        }
        (spec, status)
    }

    // =========================================================================
    // Mark to remove
    // =========================================================================

    #[test]
    fn replace_annotation_marks_member() {
        let (spec, mut status) = healthy_cluster();
        let mut snapshot = pods_for(&status, &spec.image);
        if let Some(pod) = snapshot.pods.get_mut("pod-crdn-2") {
            pod.metadata.annotations = Some(BTreeMap::from([(
                POD_REPLACE_ANNOTATION.to_string(),
                "true".to_string(),
            )]));
        }
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);
        let plan = mark_to_remove(&ctx);
        assert_eq!(types(&plan), vec![ActionType::MarkToRemoveMember]);
        assert_eq!(plan.0[0].member_id, "CRDN-2");

        status.members.group_mut(ServerGroup::Coordinators)[1]
            .conditions
            .update(ConditionType::MarkedToRemove, true, "", "", "");
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);
        assert!(mark_to_remove(&ctx).is_empty());
    }

    // =========================================================================
    // Upgrades
    // =========================================================================

    /// Story: a patch release only needs a plain restart of each member,
    /// one at a time, with the recorded images moved forward first.
    #[test]
    fn patch_release_rotates_first_member() {
        let target = image("arangodb/enterprise:3.11.5", "3.11.5", true);
        let (spec, status) = cluster_moving_to(target, &[]);
        let snapshot = pods_for(&status, "arangodb/enterprise:3.11.4");
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        let plan = rotate_or_upgrade(&ctx);
        assert_eq!(
            types(&plan),
            vec![
                ActionType::CleanTLSKeyfileCertificate,
                ActionType::SetCurrentImage,
                ActionType::SetMemberCurrentImage,
                ActionType::RotateMember,
                ActionType::WaitForMemberUp,
            ]
        );
        assert!(plan
            .iter()
            .filter(|a| !a.member_id.is_empty())
            .all(|a| a.member_id == "AGNT-1"));
        assert_eq!(plan.0[2].image, "arangodb/enterprise:3.11.5");
    }

    #[test]
    fn minor_upgrade_of_dbserver_resigns_leadership_first() {
        let target = image("arangodb/enterprise:3.12.0", "3.12.0", true);
        let (spec, mut status) =
            cluster_moving_to(target.clone(), &[ServerGroup::Agents, ServerGroup::Coordinators]);
        status.current_image = Some(target);
        let snapshot = pods_for(&status, "arangodb/enterprise:3.11.4");
        let agency = agency_with_shards(&[("s1", &["PRMR-1", "PRMR-2"])]);
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));

        let plan = rotate_or_upgrade(&ctx);
        assert_eq!(
            types(&plan),
            vec![
                ActionType::ResignLeadership,
                ActionType::CleanTLSKeyfileCertificate,
                ActionType::SetMemberCurrentImage,
                ActionType::UpgradeMember,
                ActionType::WaitForMemberUp,
            ]
        );
        assert_eq!(plan.0[0].member_id, "PRMR-1");
    }

    #[test]
    fn upgrade_waits_while_shards_are_out_of_sync() {
        let target = image("arangodb/enterprise:3.12.0", "3.12.0", true);
        let (spec, status) =
            cluster_moving_to(target, &[ServerGroup::Agents, ServerGroup::Coordinators]);
        let snapshot = Snapshot::default();
        // No agency snapshot: shard sync cannot be confirmed.
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        assert_eq!(types(&rotate_or_upgrade(&ctx)), vec![ActionType::Idle]);
    }

    #[test]
    fn unsafe_upgrade_skips_readiness() {
        let target = image("arangodb/enterprise:3.12.0", "3.12.0", true);
        let (mut spec, status) =
            cluster_moving_to(target, &[ServerGroup::Agents, ServerGroup::Coordinators]);
        spec.allow_unsafe_upgrade = Some(true);
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        assert!(rotate_or_upgrade(&ctx).contains_type(&ActionType::UpgradeMember));
    }

    #[rstest::rstest]
    #[case(image("arangodb/enterprise:2.8.0", "2.8.0", true))]
    #[case(image("arangodb/enterprise:5.0.0", "5.0.0", true))]
    #[case(image("arangodb/arangodb:3.11.5", "3.11.5", false))]
    fn forbidden_version_change_publishes_event(#[case] target: ImageInfo) {
        let (spec, status) = cluster_moving_to(target, &[]);
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        assert!(rotate_or_upgrade(&ctx).is_empty());
        let events = ctx.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, reasons::UPGRADE_NOT_ALLOWED);
        assert_eq!(events[0].type_, EventType::Warning);
    }

    #[test]
    fn unknown_spec_image_holds_everything() {
        let (mut spec, mut status) = healthy_cluster();
        spec.image = "arangodb/enterprise:3.12.1".to_string();
        status.members.group_mut(ServerGroup::Coordinators)[0]
            .conditions
            .update(ConditionType::Restart, true, "", "", "");
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        assert!(rotate_or_upgrade(&ctx).is_empty());
        assert!(ctx.take_events().is_empty());
    }

    // =========================================================================
    // Restarts and in-place updates
    // =========================================================================

    #[rstest::rstest]
    #[case(ServerGroup::Coordinators, vec![ActionType::RotateMember, ActionType::WaitForMemberUp])]
    #[case(ServerGroup::DBServers, vec![ActionType::ResignLeadership, ActionType::RotateMember, ActionType::WaitForMemberUp])]
    fn restart_condition_rotates_member(#[case] group: ServerGroup, #[case] expected: Vec<ActionType>) {
        let (spec, mut status) = healthy_cluster();
        status.members.group_mut(group)[1]
            .conditions
            .update(ConditionType::Restart, true, "", "", "");
        let snapshot = pods_for(&status, &spec.image);
        let agency = agency_with_shards(&[("s1", &["PRMR-1"])]);
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));

        assert_eq!(types(&rotate_or_upgrade(&ctx)), expected);
    }

    #[test]
    fn pending_update_patches_image_in_place() {
        let (mut spec, mut status) = healthy_cluster();
        // Same version, different build: eligible for an in-place swap.
        let rebuilt = image("arangodb/enterprise:3.11.4-1", "3.11.4", true);
        spec.image = rebuilt.image.clone();
        status.images.push(rebuilt.clone());
        for group in ServerGroup::ALL {
            for m in status.members.group_mut(group) {
                m.image = Some(rebuilt.clone());
            }
        }
        let member = &mut status.members.group_mut(ServerGroup::Coordinators)[0];
        member
            .conditions
            .update(ConditionType::PendingUpdate, true, "", "", "");
        let am_name = member.arango_member_name("prod", ServerGroup::Coordinators);

        let mut snapshot = pods_for(&status, "arangodb/enterprise:3.11.4");
        snapshot.arango_members.insert(
            am_name.clone(),
            ArangoMember::new(
                &am_name,
                ArangoMemberSpec {
                    deployment_name: "prod".to_string(),
                    group: ServerGroup::Coordinators,
                    id: "CRDN-1".to_string(),
                    template_checksum: "new".to_string(),
                    deletion_priority: None,
                },
            ),
        );
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        let plan = rotate_or_upgrade(&ctx);
        assert_eq!(
            types(&plan),
            vec![
                ActionType::SetMemberCondition,
                ActionType::RuntimeContainerImageUpdate,
                ActionType::WaitForMemberUp,
                ActionType::WaitForMemberInSync,
                ActionType::SetMemberCondition,
            ]
        );
        let start: ConditionParams = plan.0[0].params_as().expect("params");
        assert_eq!(start.changes.get(&ConditionType::Updating), Some(&Some(true)));
        assert_eq!(start.changes.get(&ConditionType::PendingUpdate), Some(&None));
        assert_eq!(plan.0[1].image, spec.image);
    }

    #[test]
    fn failed_update_is_not_retried_in_place() {
        let (spec, mut status) = healthy_cluster();
        let member = &mut status.members.group_mut(ServerGroup::Coordinators)[0];
        for c in [ConditionType::PendingUpdate, ConditionType::UpdateFailed] {
            member.conditions.update(c, true, "", "", "");
        }
        let snapshot = pods_for(&status, &spec.image);
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        assert!(rotate_or_upgrade(&ctx).is_empty());
    }
}
