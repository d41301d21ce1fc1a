//! Scaling and member replacement
//!
//! Scale-up adds one member per missing slot in a single plan. Scale-down
//! removes exactly one member per plan, picked by [`select_member_to_remove`].

use rand::seq::SliceRandom;
use tracing::debug;

use arango_common::crd::{
    ActionType, ConditionType, DeploymentMode, MemberStatus, Plan, PlanAction, ServerGroup,
};

use super::recovery::clean_out_member;
use super::PlanContext;
use crate::action::params::{AddMemberParams, PlanActionParams};

/// One narrowing stage of the scale-down selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleFilter {
    /// Members already marked to be removed
    MarkedToRemove,
    /// Members with the CleanedOut condition
    CleanedOutCondition,
    /// DBServers the agency lists as cleaned
    AgencyCleaned,
    /// DBServers the agency is about to clean
    AgencyToBeCleaned,
    /// Members whose ArangoMember carries the highest deletion priority
    DeletionPriority,
}

impl ScaleFilter {
    /// Stages in the order they narrow the candidates
    pub const PIPELINE: [ScaleFilter; 5] = [
        Self::MarkedToRemove,
        Self::CleanedOutCondition,
        Self::AgencyCleaned,
        Self::AgencyToBeCleaned,
        Self::DeletionPriority,
    ];

    /// Candidates matching this stage; empty when nothing matches or the
    /// stage does not apply to the group
    pub fn apply<'m>(
        self,
        ctx: &PlanContext<'_>,
        group: ServerGroup,
        candidates: &[&'m MemberStatus],
    ) -> Vec<&'m MemberStatus> {
        let keep = |pred: &dyn Fn(&MemberStatus) -> bool| -> Vec<&'m MemberStatus> {
            candidates.iter().copied().filter(|m| pred(*m)).collect()
        };
        match self {
            Self::MarkedToRemove => keep(&|m| m.has_condition(&ConditionType::MarkedToRemove)),
            Self::CleanedOutCondition => keep(&|m| m.has_condition(&ConditionType::CleanedOut)),
            Self::AgencyCleaned => match (group, ctx.agency) {
                (ServerGroup::DBServers, Some(agency)) => keep(&|m| agency.is_cleaned(&m.id)),
                _ => Vec::new(),
            },
            Self::AgencyToBeCleaned => match (group, ctx.agency) {
                (ServerGroup::DBServers, Some(agency)) => {
                    keep(&|m| agency.is_to_be_cleaned(&m.id))
                }
                _ => Vec::new(),
            },
            Self::DeletionPriority => {
                let priority = |m: &MemberStatus| {
                    ctx.inspector
                        .arango_member(&m.arango_member_name(ctx.deployment, group))
                        .map(|am| am.deletion_priority())
                        .unwrap_or(0)
                };
                let max = candidates.iter().map(|m| priority(*m)).max().unwrap_or(0);
                if max == 0 {
                    return Vec::new();
                }
                keep(&|m| priority(m) == max)
            }
        }
    }
}

/// Pick the member a scale-down removes
///
/// Every stage of [`ScaleFilter::PIPELINE`] narrows the candidates; a stage
/// that matches nothing keeps the wider set. DBServers then go for the
/// member holding the fewest shards, everything else is picked at random.
pub fn select_member_to_remove<'m>(
    ctx: &PlanContext<'_>,
    group: ServerGroup,
    members: &'m [MemberStatus],
) -> Option<&'m MemberStatus> {
    let mut candidates: Vec<&MemberStatus> = members.iter().collect();
    for filter in ScaleFilter::PIPELINE {
        let narrowed = filter.apply(ctx, group, &candidates);
        if !narrowed.is_empty() {
            debug!(?filter, remaining = narrowed.len(), "narrowed scale-down candidates");
            candidates = narrowed;
        }
    }

    if let (ServerGroup::DBServers, Some(agency)) = (group, ctx.agency) {
        let shards = agency.shards_by_dbservers();
        if let Some(m) = candidates
            .iter()
            .copied()
            .min_by_key(|m| shards.get(&m.id).copied().unwrap_or(0))
        {
            return Some(m);
        }
    }
    candidates.choose(&mut rand::thread_rng()).copied()
}

/// Scale every group of the current mode towards its desired count
pub(super) fn scale(ctx: &PlanContext<'_>) -> Plan {
    let spec = ctx.spec;
    let agent_target = ctx.status.agency.as_ref().and_then(|a| a.size);
    let mut plan = Plan::new();

    match spec.mode {
        DeploymentMode::Single => {
            plan = plan.after(scale_up_only(scale_group(ctx, ServerGroup::Single, 1)));
        }
        DeploymentMode::ActiveFailover => {
            if let Some(size) = agent_target {
                plan = plan.after(scale_up_only(scale_group(ctx, ServerGroup::Agents, size)));
            }
            plan = plan.after(scale_group(
                ctx,
                ServerGroup::Single,
                spec.member_count(ServerGroup::Single),
            ));
        }
        DeploymentMode::Cluster => {
            if let Some(size) = agent_target {
                plan = plan.after(scale_up_only(scale_group(ctx, ServerGroup::Agents, size)));
            }
            for group in [ServerGroup::DBServers, ServerGroup::Coordinators] {
                plan = plan.after(scale_group(ctx, group, spec.member_count(group)));
            }
        }
    }
    if spec.supports_sync() {
        for group in [ServerGroup::SyncMasters, ServerGroup::SyncWorkers] {
            plan = plan.after(scale_group(ctx, group, spec.member_count(group)));
        }
    }
    plan
}

fn scale_up_only(plan: Plan) -> Plan {
    plan.filter(|a| a.type_ == ActionType::AddMember)
}

fn scale_group(ctx: &PlanContext<'_>, group: ServerGroup, count: usize) -> Plan {
    let members = ctx.status.members.group(group);
    if members.len() < count {
        let missing = count - members.len();
        debug!(group = %group, count, actual = members.len(), missing, "creating scale-up plan");
        return (0..missing)
            .map(|_| {
                PlanAction::new(
                    ActionType::AddMember,
                    Some(group),
                    group.new_member_id(),
                    "Scale up",
                )
            })
            .collect();
    }
    if members.len() > count {
        let Some(member) = select_member_to_remove(ctx, group, members) else {
            return Plan::new();
        };
        debug!(group = %group, count, actual = members.len(), member_id = %member.id, "creating scale-down plan");
        return scale_down_member(group, member);
    }
    Plan::new()
}

fn scale_down_member(group: ServerGroup, member: &MemberStatus) -> Plan {
    if group == ServerGroup::DBServers {
        return clean_out_member(member, "Scale down");
    }
    Plan::from(vec![
        PlanAction::for_member(ActionType::ShutdownMember, group, member, "Scale down"),
        PlanAction::for_member(ActionType::RemoveMember, group, member, "Scale down"),
    ])
}

/// Replacement of the first member marked to be removed
pub(super) fn replace_member(ctx: &PlanContext<'_>) -> Plan {
    let waits = AddMemberParams {
        wait_for_up: true,
        wait_for_sync: true,
    };
    let add = |group: ServerGroup| {
        PlanAction::new(
            ActionType::AddMember,
            Some(group),
            group.new_member_id(),
            "Replace member",
        )
        .with_params(&waits)
    };

    let groups = [
        ServerGroup::Agents,
        ServerGroup::DBServers,
        ServerGroup::Coordinators,
    ];
    let Some((group, member)) = ctx
        .status
        .members
        .iter_groups(&groups)
        .find(|(_, m)| m.has_condition(&ConditionType::MarkedToRemove))
    else {
        return Plan::new();
    };

    debug!(group = %group, member_id = %member.id, "creating replacement plan");
    match group {
        // The marked DBServer is removed by scale-down once its replacement
        // is in sync.
        ServerGroup::DBServers => Plan::from(vec![add(group)]),
        ServerGroup::Coordinators => Plan::from(vec![PlanAction::for_member(
            ActionType::RemoveMember,
            group,
            member,
            "Replace member",
        )]),
        _ => Plan::from(vec![
            PlanAction::for_member(ActionType::RemoveMember, group, member, "Replace member"),
            add(group),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agency::tests::agency_with_shards;
    use crate::agency::AgencyCache;
    use crate::context::Snapshot;
    use crate::plan::tests::healthy_cluster;
    use arango_common::crd::{ArangoMember, ArangoMemberSpec, DeploymentSpec, DeploymentStatus};
    use rstest::rstest;

    fn types(plan: &Plan) -> Vec<ActionType> {
        plan.iter().map(|a| a.type_.clone()).collect()
    }

    fn mark(status: &mut DeploymentStatus, group: ServerGroup, id: &str, c: ConditionType) {
        if let Some(m) = status.members.group_mut(group).iter_mut().find(|m| m.id == id) {
            m.conditions.update(c, true, "", "", "");
        }
    }

    // =========================================================================
    // Scale up
    // =========================================================================

    /// Story: scale-up is additive. Every missing slot gets its own
    /// AddMember with a member ID chosen up front.
    #[rstest]
    #[case(3, 2, 1)]
    #[case(5, 2, 3)]
    #[case(3, 0, 3)]
    fn scale_up_adds_one_member_per_missing_slot(
        #[case] desired: usize,
        #[case] present: usize,
        #[case] expected: usize,
    ) {
        let (mut spec, mut status) = healthy_cluster();
        spec.dbservers.count = Some(desired);
        let ids: Vec<String> = status
            .members
            .group(ServerGroup::DBServers)
            .iter()
            .skip(present)
            .map(|m| m.id.clone())
            .collect();
        for id in ids {
            status.members.remove(ServerGroup::DBServers, &id);
        }
        let agency = AgencyCache::default();
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));

        let plan = scale(&ctx);
        assert_eq!(plan.len(), expected);
        assert!(plan.iter().all(|a| a.type_ == ActionType::AddMember
            && a.group == Some(ServerGroup::DBServers)
            && a.member_id.starts_with("PRMR-")));
        let mut ids: Vec<_> = plan.iter().map(|a| a.member_id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), expected);
    }

    #[test]
    fn agents_follow_recorded_agency_size_and_never_shrink() {
        let (spec, mut status) = healthy_cluster();
        let snapshot = Snapshot::default();

        status.agency = Some(arango_common::crd::AgencyStatus { size: Some(5) });
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);
        let plan = scale(&ctx);
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|a| a.group == Some(ServerGroup::Agents)));

        status.agency = Some(arango_common::crd::AgencyStatus { size: Some(1) });
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);
        assert!(scale(&ctx).is_empty());
    }

    #[test]
    fn single_server_never_scales_down() {
        let spec = DeploymentSpec {
            mode: DeploymentMode::Single,
            ..Default::default()
        };
        let mut status = DeploymentStatus::default();
        for id in ["SNGL-1", "SNGL-2"] {
            status
                .members
                .add(ServerGroup::Single, crate::testing::created_member(id))
                .expect("add");
        }
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);
        assert!(scale(&ctx).is_empty());
    }

    // =========================================================================
    // Scale down
    // =========================================================================

    /// Story: DBServers go from 3 to 1. Only one member leaves per plan and
    /// its data is moved away before it is shut down.
    #[test]
    fn scale_down_removes_one_dbserver_at_a_time() {
        let (mut spec, status) = healthy_cluster();
        spec.dbservers.count = Some(1);
        let agency = agency_with_shards(&[("s1", &["PRMR-1", "PRMR-2"]), ("s2", &["PRMR-1"])]);
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));

        let plan = scale(&ctx);
        assert_eq!(
            types(&plan),
            vec![
                ActionType::CleanOutMember,
                ActionType::ShutdownMember,
                ActionType::RemoveMember
            ]
        );
        // PRMR-3 is absent from the shard map and holds nothing.
        assert!(plan.iter().all(|a| a.member_id == "PRMR-3"));
    }

    #[test]
    fn coordinator_scale_down_skips_clean_out() {
        let (mut spec, status) = healthy_cluster();
        spec.coordinators.count = Some(2);
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        let plan = scale(&ctx);
        assert_eq!(
            types(&plan),
            vec![ActionType::ShutdownMember, ActionType::RemoveMember]
        );
        assert_eq!(plan.0[0].member_id, plan.0[1].member_id);
    }

    // =========================================================================
    // Selection pipeline
    // =========================================================================

    #[test]
    fn marked_member_wins_over_fewest_shards() {
        let (_, mut status) = healthy_cluster();
        mark(&mut status, ServerGroup::DBServers, "PRMR-1", ConditionType::MarkedToRemove);
        let spec = DeploymentSpec::default();
        let agency = agency_with_shards(&[("s1", &["PRMR-1"]), ("s2", &["PRMR-1"])]);
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));

        let members = status.members.group(ServerGroup::DBServers);
        let picked = select_member_to_remove(&ctx, ServerGroup::DBServers, members);
        assert_eq!(picked.map(|m| m.id.as_str()), Some("PRMR-1"));
    }

    #[test]
    fn empty_stage_keeps_the_wider_set() {
        let (_, mut status) = healthy_cluster();
        mark(&mut status, ServerGroup::DBServers, "PRMR-2", ConditionType::CleanedOut);
        mark(&mut status, ServerGroup::DBServers, "PRMR-3", ConditionType::CleanedOut);
        let spec = DeploymentSpec::default();
        // Nothing is marked to remove and the agency has no opinion; the
        // cleaned-out pair survives and the fewer-shards rule decides.
        let agency = agency_with_shards(&[("s1", &["PRMR-2"]), ("s2", &["PRMR-2"]), ("s3", &["PRMR-3"])]);
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));

        let members = status.members.group(ServerGroup::DBServers);
        let picked = select_member_to_remove(&ctx, ServerGroup::DBServers, members);
        assert_eq!(picked.map(|m| m.id.as_str()), Some("PRMR-3"));
    }

    #[test]
    fn agency_cleaned_servers_narrow_dbservers_only() {
        let (_, status) = healthy_cluster();
        let spec = DeploymentSpec::default();
        let mut agency = agency_with_shards(&[("s1", &["PRMR-1"])]);
        agency.to_be_cleaned_servers.insert("PRMR-1".to_string());
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).with_agency(Some(&agency));

        let members = status.members.group(ServerGroup::DBServers);
        let candidates: Vec<&MemberStatus> = members.iter().collect();
        let narrowed = ScaleFilter::AgencyToBeCleaned.apply(&ctx, ServerGroup::DBServers, &candidates);
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].id, "PRMR-1");

        let coordinators = status.members.group(ServerGroup::Coordinators);
        let candidates: Vec<&MemberStatus> = coordinators.iter().collect();
        assert!(ScaleFilter::AgencyToBeCleaned
            .apply(&ctx, ServerGroup::Coordinators, &candidates)
            .is_empty());

        let picked = select_member_to_remove(&ctx, ServerGroup::DBServers, members);
        assert_eq!(picked.map(|m| m.id.as_str()), Some("PRMR-1"));
    }

    #[test]
    fn highest_deletion_priority_is_preferred() {
        let (_, status) = healthy_cluster();
        let spec = DeploymentSpec::default();
        let mut snapshot = Snapshot::default();
        let member = &status.members.group(ServerGroup::Coordinators)[1];
        let name = member.arango_member_name("prod", ServerGroup::Coordinators);
        snapshot.arango_members.insert(
            name.clone(),
            ArangoMember::new(
                &name,
                ArangoMemberSpec {
                    deployment_name: "prod".to_string(),
                    group: ServerGroup::Coordinators,
                    id: member.id.clone(),
                    template_checksum: String::new(),
                    deletion_priority: Some(10),
                },
            ),
        );
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        let members = status.members.group(ServerGroup::Coordinators);
        let picked = select_member_to_remove(&ctx, ServerGroup::Coordinators, members);
        assert_eq!(picked.map(|m| m.id.as_str()), Some("CRDN-2"));
    }

    // =========================================================================
    // Replacement
    // =========================================================================

    #[rstest]
    #[case(ServerGroup::DBServers, "PRMR-2", vec![ActionType::AddMember])]
    #[case(ServerGroup::Coordinators, "CRDN-2", vec![ActionType::RemoveMember])]
    #[case(ServerGroup::Agents, "AGNT-2", vec![ActionType::RemoveMember, ActionType::AddMember])]
    fn marked_members_are_replaced_per_group(
        #[case] group: ServerGroup,
        #[case] id: &str,
        #[case] expected: Vec<ActionType>,
    ) {
        let (spec, mut status) = healthy_cluster();
        mark(&mut status, group, id, ConditionType::MarkedToRemove);
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        let plan = replace_member(&ctx);
        assert_eq!(types(&plan), expected);
        if let Some(add) = plan.iter().find(|a| a.type_ == ActionType::AddMember) {
            let params: AddMemberParams = add.params_as().expect("params");
            assert!(params.wait_for_up && params.wait_for_sync);
            assert_ne!(add.member_id, id);
        };
    }
}
