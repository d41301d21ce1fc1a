//! Failed member recovery and removal of cleaned-out DBServers

use tracing::{debug, info, warn};

use arango_common::crd::{
    ActionType, ConditionType, DeploymentMode, MemberPhase, MemberStatus, Plan, PlanAction,
    ServerGroup, MEMBER_ID_PREVIOUS_ACTION,
};

use super::PlanContext;

/// Plan for the first failed member that can be recovered
///
/// Agents and single servers are always recreated in place: their data
/// cannot be rebuilt from the rest of the deployment. DBServers are only
/// replaced when the agency confirms they hold no shards.
pub(super) fn failed_member_recovery(ctx: &PlanContext<'_>) -> Plan {
    let mut skipped_without_agency = false;

    for group in ServerGroup::ALL {
        let members = ctx.status.members.group(group);
        let failed = members
            .iter()
            .filter(|m| m.phase == MemberPhase::Failed)
            .count();

        for member in members.iter().filter(|m| m.phase == MemberPhase::Failed) {
            if group == ServerGroup::DBServers && ctx.spec.mode == DeploymentMode::Cluster {
                let Some(agency) = ctx.agency else {
                    info!(member_id = %member.id, "agency state is not present, not touching dbserver");
                    skipped_without_agency = true;
                    continue;
                };
                if agency.is_cleaned(&member.id) {
                    debug!(member_id = %member.id, "failed dbserver is cleaned out");
                    continue;
                }
                if agency.is_leader(&member.id) {
                    info!(member_id = %member.id, "recreating leader dbserver, it cannot be removed gracefully");
                    return recreate(group, member);
                }
                if ctx.spec.member_count(group) <= members.len() - failed {
                    continue;
                }
                if agency.is_dbserver_present(&member.id) {
                    info!(member_id = %member.id, "recreating dbserver still present in agency plan");
                    return recreate(group, member);
                }
            }

            return match group {
                ServerGroup::Agents | ServerGroup::Single => {
                    info!(member_id = %member.id, group = %group, "restoring failed member in place");
                    recreate(group, member)
                }
                _ if ctx.spec.allow_member_recreation(group) => {
                    info!(member_id = %member.id, group = %group, "replacing failed member");
                    replace(group, member)
                }
                _ => {
                    info!(member_id = %member.id, group = %group, "member recreation disabled, restoring in place");
                    recreate(group, member)
                }
            };
        }
    }

    if skipped_without_agency {
        warn!("unable to build further plan without access to agency");
        return Plan::from(vec![PlanAction::for_cluster(
            ActionType::Idle,
            "Agency state is not available",
        )]);
    }
    Plan::new()
}

fn recreate(group: ServerGroup, member: &MemberStatus) -> Plan {
    Plan::from(vec![PlanAction::for_member(
        ActionType::RecreateMember,
        group,
        member,
        "Restore failed member",
    )])
}

fn replace(group: ServerGroup, member: &MemberStatus) -> Plan {
    Plan::from(vec![
        PlanAction::for_member(ActionType::RemoveMember, group, member, "Remove failed member"),
        PlanAction::new(
            ActionType::AddMember,
            Some(group),
            group.new_member_id(),
            "Replace failed member",
        ),
        PlanAction::new(
            ActionType::WaitForMemberUp,
            Some(group),
            MEMBER_ID_PREVIOUS_ACTION,
            "Wait for replacement member",
        ),
    ])
}

/// Clean-out, shutdown and removal of one DBServer
pub(super) fn clean_out_member(member: &MemberStatus, reason: &str) -> Plan {
    let group = ServerGroup::DBServers;
    Plan::from(vec![
        PlanAction::for_member(ActionType::CleanOutMember, group, member, reason),
        PlanAction::for_member(ActionType::ShutdownMember, group, member, reason),
        PlanAction::for_member(ActionType::RemoveMember, group, member, reason),
    ])
}

/// Removal of a DBServer that is cleaned out but still serving
pub(super) fn cleaned_out_dbservers(ctx: &PlanContext<'_>) -> Plan {
    ctx.status
        .members
        .group(ServerGroup::DBServers)
        .iter()
        .find(|m| m.phase.is_created_or_drain() && m.has_condition(&ConditionType::CleanedOut))
        .map(|m| {
            debug!(member_id = %m.id, "removing cleaned out dbserver");
            clean_out_member(m, "DBServer is cleaned out")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agency::tests::agency_with_shards;
    use crate::agency::AgencyCache;
    use crate::context::Snapshot;
    use crate::plan::tests::healthy_cluster;
    use crate::testing::created_member;
    use arango_common::crd::{DeploymentSpec, DeploymentStatus};
    use rstest::rstest;

    fn types(plan: &Plan) -> Vec<ActionType> {
        plan.iter().map(|a| a.type_.clone()).collect()
    }

    fn with_failed(group: ServerGroup, id: &str, phase: MemberPhase) -> DeploymentStatus {
        let mut status = DeploymentStatus::default();
        let mut member = created_member(id);
        member.phase = phase;
        status.members.add(group, member).expect("add member");
        status
    }

    // =========================================================================
    // Stateful groups are never replaced
    // =========================================================================

    /// Story: agents and single servers own data nothing else can rebuild.
    /// Whatever the deployment looks like, a failed one is recreated in
    /// place and never removed and re-added.
    #[rstest]
    #[case(ServerGroup::Agents, DeploymentMode::Cluster, true)]
    #[case(ServerGroup::Agents, DeploymentMode::Cluster, false)]
    #[case(ServerGroup::Agents, DeploymentMode::ActiveFailover, true)]
    #[case(ServerGroup::Single, DeploymentMode::Single, true)]
    #[case(ServerGroup::Single, DeploymentMode::ActiveFailover, false)]
    fn stateful_groups_are_recreated(
        #[case] group: ServerGroup,
        #[case] mode: DeploymentMode,
        #[case] allow_recreation: bool,
    ) {
        let mut spec = DeploymentSpec {
            mode,
            ..Default::default()
        };
        spec.agents.allow_member_recreation = Some(allow_recreation);
        spec.single.allow_member_recreation = Some(allow_recreation);
        let status = with_failed(group, "M-1", MemberPhase::Failed);
        let agency = AgencyCache::default();
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));

        let plan = failed_member_recovery(&ctx);
        assert_eq!(types(&plan), vec![ActionType::RecreateMember]);
        assert!(!plan.contains_type(&ActionType::RemoveMember));
        assert!(!plan.contains_type(&ActionType::AddMember));
    }

    #[rstest]
    #[case(MemberPhase::None)]
    #[case(MemberPhase::Pending)]
    #[case(MemberPhase::Created)]
    #[case(MemberPhase::CleanOut)]
    #[case(MemberPhase::Drain)]
    #[case(MemberPhase::Upgrading)]
    #[case(MemberPhase::Shutdown)]
    fn only_failed_members_are_recovered(#[case] phase: MemberPhase) {
        let spec = DeploymentSpec::default();
        let status = with_failed(ServerGroup::Agents, "AGNT-1", phase);
        let agency = AgencyCache::default();
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));
        assert!(failed_member_recovery(&ctx).is_empty());
    }

    // =========================================================================
    // Stateless groups
    // =========================================================================

    #[test]
    fn failed_coordinator_is_replaced_with_new_member() {
        let spec = DeploymentSpec::default();
        let status = with_failed(ServerGroup::Coordinators, "CRDN-1", MemberPhase::Failed);
        let agency = AgencyCache::default();
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));

        let plan = failed_member_recovery(&ctx);
        assert_eq!(
            types(&plan),
            vec![
                ActionType::RemoveMember,
                ActionType::AddMember,
                ActionType::WaitForMemberUp
            ]
        );
        let add = &plan.0[1];
        assert!(add.member_id.starts_with("CRDN-"));
        assert_ne!(add.member_id, "CRDN-1");
        assert_eq!(plan.0[2].member_id, MEMBER_ID_PREVIOUS_ACTION);
    }

    #[test]
    fn disabled_recreation_restores_in_place() {
        let mut spec = DeploymentSpec::default();
        spec.coordinators.allow_member_recreation = Some(false);
        let status = with_failed(ServerGroup::Coordinators, "CRDN-1", MemberPhase::Failed);
        let agency = AgencyCache::default();
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));

        assert_eq!(
            types(&failed_member_recovery(&ctx)),
            vec![ActionType::RecreateMember]
        );
    }

    // =========================================================================
    // DBServers consult the agency
    // =========================================================================

    fn failed_dbserver() -> (DeploymentSpec, DeploymentStatus) {
        let (spec, mut status) = healthy_cluster();
        status.members.group_mut(ServerGroup::DBServers)[0].phase = MemberPhase::Failed;
        (spec, status)
    }

    #[test]
    fn dbserver_without_agency_yields_idle() {
        let (spec, status) = failed_dbserver();
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);
        assert_eq!(types(&failed_member_recovery(&ctx)), vec![ActionType::Idle]);
    }

    #[test]
    fn leader_dbserver_is_recreated() {
        let (spec, status) = failed_dbserver();
        let agency = agency_with_shards(&[("s1", &["PRMR-1", "PRMR-2"])]);
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));
        let plan = failed_member_recovery(&ctx);
        assert_eq!(types(&plan), vec![ActionType::RecreateMember]);
        assert_eq!(plan.0[0].member_id, "PRMR-1");
    }

    #[test]
    fn follower_dbserver_in_agency_plan_is_recreated() {
        let (spec, status) = failed_dbserver();
        let agency = agency_with_shards(&[("s1", &["PRMR-2", "PRMR-1"])]);
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));
        assert_eq!(
            types(&failed_member_recovery(&ctx)),
            vec![ActionType::RecreateMember]
        );
    }

    #[test]
    fn dbserver_without_shards_is_replaced() {
        let (spec, status) = failed_dbserver();
        let agency = agency_with_shards(&[("s1", &["PRMR-2", "PRMR-3"])]);
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));
        assert_eq!(
            types(&failed_member_recovery(&ctx)),
            vec![
                ActionType::RemoveMember,
                ActionType::AddMember,
                ActionType::WaitForMemberUp
            ]
        );
    }

    #[test]
    fn dbserver_is_left_alone_when_enough_members_live() {
        let (mut spec, status) = failed_dbserver();
        spec.dbservers.count = Some(2);
        let agency = AgencyCache::default();
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));
        assert!(failed_member_recovery(&ctx).is_empty());
    }

    #[test]
    fn cleaned_failed_dbserver_is_skipped() {
        let (spec, status) = failed_dbserver();
        let mut agency = AgencyCache::default();
        agency.cleaned_servers.insert("PRMR-1".to_string());
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));
        assert!(failed_member_recovery(&ctx).is_empty());
    }

    // =========================================================================
    // Cleaned-out DBServers
    // =========================================================================

    #[test]
    fn cleaned_out_dbserver_is_removed() {
        let (spec, mut status) = healthy_cluster();
        status.members.group_mut(ServerGroup::DBServers)[1]
            .conditions
            .update(ConditionType::CleanedOut, true, "", "", "");
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        let plan = cleaned_out_dbservers(&ctx);
        assert_eq!(
            types(&plan),
            vec![
                ActionType::CleanOutMember,
                ActionType::ShutdownMember,
                ActionType::RemoveMember
            ]
        );
        assert!(plan.iter().all(|a| a.member_id == "PRMR-2"));
    }
}
