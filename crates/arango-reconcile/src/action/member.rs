//! Member lifecycle actions

use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use arango_common::crd::{
    ActionType, ConditionType, DeploymentMode, MemberPhase, MemberStatus, PlanAction, ServerGroup,
    MEMBER_ID_PREVIOUS_ACTION,
};
use arango_common::events::reasons;
use arango_common::{Error, Result};

use super::params::{AddMemberParams, ConditionParams, PhaseParams, PlanActionParams};
use super::{entry_accessor, entry_group, Action, ActionRegistryBuilder, Progress};
use crate::agency::ServerHealthStatus;
use crate::context::ActionContext;

pub(super) fn register(builder: &mut ActionRegistryBuilder, grace: Duration) {
    builder
        .register(ActionType::Idle, idle)
        .register(ActionType::AddMember, add_member)
        .register_with_grace(ActionType::RemoveMember, remove_member, grace)
        .register(ActionType::RecreateMember, recreate_member)
        .register(ActionType::MarkToRemoveMember, mark_to_remove_member)
        .register_with_grace(ActionType::ShutdownMember, shutdown_member, grace)
        .register(ActionType::KillMemberPod, kill_member_pod)
        .register_with_grace(ActionType::WaitForMemberUp, wait_for_member_up, grace)
        .register_with_grace(ActionType::WaitForMemberInSync, wait_for_member_in_sync, grace)
        .register(ActionType::WaitForMemberReady, wait_for_member_ready)
        .register(ActionType::MemberPhaseUpdate, member_phase_update)
        .register(ActionType::SetMemberCondition, set_member_condition)
        .register(ActionType::SetCondition, set_condition)
        .register(ActionType::ArangoMemberUpdatePodSpec, arango_member_update_pod_spec)
        .register(
            ActionType::ArangoMemberUpdatePodStatus,
            arango_member_update_pod_status,
        );
}

fn idle(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(Idle { entry }))
}

fn add_member(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    let member_id = if entry.member_id.is_empty() || entry.member_id == MEMBER_ID_PREVIOUS_ACTION {
        entry.group.map(|g| g.new_member_id()).unwrap_or_default()
    } else {
        entry.member_id.clone()
    };
    Ok(Box::new(AddMember {
        entry,
        params,
        member_id,
    }))
}

fn remove_member(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(RemoveMember { entry }))
}

fn recreate_member(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(RecreateMember { entry }))
}

fn mark_to_remove_member(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(MarkToRemoveMember { entry }))
}

fn shutdown_member(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(ShutdownMember { entry }))
}

fn kill_member_pod(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(KillMemberPod { entry }))
}

fn wait_for_member_up(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(WaitForMemberUp { entry }))
}

fn wait_for_member_in_sync(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(WaitForMemberInSync { entry }))
}

fn wait_for_member_ready(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(WaitForMemberReady { entry }))
}

fn member_phase_update(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(MemberPhaseUpdate { entry, params }))
}

fn set_member_condition(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(SetMemberCondition { entry, params }))
}

fn set_condition(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(SetCondition { entry, params }))
}

fn arango_member_update_pod_spec(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(ArangoMemberUpdatePodSpec { entry }))
}

fn arango_member_update_pod_status(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(ArangoMemberUpdatePodStatus { entry }))
}

/// Does nothing; its only effect is that the builder runs again once it
/// is popped
struct Idle {
    entry: PlanAction,
}

#[async_trait]
impl Action for Idle {
    entry_accessor!();

    async fn start(&self, _ctx: &dyn ActionContext) -> Result<bool> {
        Ok(true)
    }
}

/// Adds a member entry in phase None
///
/// The member ID is chosen by the builder so that a repeated start finds
/// the member it created before instead of adding a second one.
struct AddMember {
    entry: PlanAction,
    params: AddMemberParams,
    member_id: String,
}

#[async_trait]
impl Action for AddMember {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let group = entry_group(&self.entry)?;
        if self.member_id.is_empty() {
            return Err(Error::validation("AddMember needs a member ID"));
        }

        if let Some((existing, _)) = ctx.member(&self.member_id).await? {
            if existing != group {
                return Err(Error::action_failed(
                    "AddMember",
                    format!("member {} already exists in {existing}", self.member_id),
                ));
            }
            debug!(member_id = %self.member_id, "member already added");
            return Ok(true);
        }

        let id = self.member_id.clone();
        ctx.mutate_status(Box::new(move |s| {
            s.members.by_id(&id).is_none() && s.members.add(group, MemberStatus::new(id.clone())).is_ok()
        }))
        .await?;
        info!(member_id = %self.member_id, group = %group, "member added");
        Ok(true)
    }

    async fn post(&self, ctx: &dyn ActionContext) -> Result<()> {
        let group = entry_group(&self.entry)?;
        ctx.publish_event(
            EventType::Normal,
            reasons::MEMBER_ADDED,
            format!("Member {} added to {group}", self.member_id),
        )
        .await;
        Ok(())
    }

    fn member_id(&self) -> String {
        self.member_id.clone()
    }

    fn append_plan(&self) -> Vec<PlanAction> {
        let mut out = Vec::new();
        if self.params.wait_for_up {
            out.push(PlanAction::new(
                ActionType::WaitForMemberUp,
                self.entry.group,
                self.member_id.clone(),
                "Wait for new member to be up",
            ));
        }
        if self.params.wait_for_sync {
            out.push(PlanAction::new(
                ActionType::WaitForMemberInSync,
                self.entry.group,
                self.member_id.clone(),
                "Wait for new member to be in sync",
            ));
        }
        out
    }

    fn reload_cached_status(&self) -> bool {
        true
    }
}

/// Removes a member from the cluster, its objects and the status
struct RemoveMember {
    entry: PlanAction,
}

#[async_trait]
impl Action for RemoveMember {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some((group, member)) = ctx.member(&self.entry.member_id).await? else {
            debug!(member_id = %self.entry.member_id, "member already removed");
            return Ok(true);
        };

        if group == ServerGroup::DBServers {
            if let Some(agency) = ctx.agency() {
                if agency.is_dbserver_present(&member.id) {
                    return Err(Error::action_failed(
                        "RemoveMember",
                        format!("dbserver {} still holds shards", member.id),
                    ));
                }
            }
        }

        if ctx.mode() == DeploymentMode::Cluster
            && matches!(group, ServerGroup::DBServers | ServerGroup::Coordinators)
        {
            ctx.database()?.remove_server(&member.id).await?;
        }
        if !member.pod_name.is_empty() {
            ctx.delete_pod(&member.pod_name).await?;
        }
        if !member.persistent_volume_claim_name.is_empty() {
            ctx.delete_pvc(&member.persistent_volume_claim_name).await?;
        }

        let id = member.id.clone();
        ctx.mutate_status(Box::new(move |s| s.members.remove(group, &id)))
            .await?;
        info!(member_id = %member.id, group = %group, "member removed");
        Ok(true)
    }

    async fn post(&self, ctx: &dyn ActionContext) -> Result<()> {
        ctx.publish_event(
            EventType::Normal,
            reasons::MEMBER_REMOVED,
            format!("Member {} removed", self.entry.member_id),
        )
        .await;
        Ok(())
    }

    fn reload_cached_status(&self) -> bool {
        true
    }
}

/// Recreates a failed member in place, keeping its ID and volume
struct RecreateMember {
    entry: PlanAction,
}

#[async_trait]
impl Action for RecreateMember {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some((group, mut member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(true);
        };
        if member.phase != MemberPhase::Failed {
            debug!(member_id = %member.id, phase = %member.phase, "member no longer failed");
            return Ok(true);
        }

        if group == ServerGroup::DBServers
            && !member.persistent_volume_claim_name.is_empty()
            && ctx
                .inspector()
                .persistent_volume_claim(&member.persistent_volume_claim_name)
                .is_none()
        {
            return Err(Error::action_failed(
                "RecreateMember",
                format!("volume of dbserver {} is missing", member.id),
            ));
        }

        if !member.pod_name.is_empty() {
            ctx.delete_pod(&member.pod_name).await?;
        }
        member.phase = MemberPhase::None;
        for c in [
            ConditionType::Ready,
            ConditionType::Serving,
            ConditionType::Terminating,
            ConditionType::Terminated,
        ] {
            member.conditions.remove(&c);
        }
        ctx.update_member(group, member).await?;
        Ok(true)
    }
}

struct MarkToRemoveMember {
    entry: PlanAction,
}

#[async_trait]
impl Action for MarkToRemoveMember {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some((group, mut member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(true);
        };
        if member
            .conditions
            .update(ConditionType::MarkedToRemove, true, "Member marked to be removed", "", "")
        {
            ctx.update_member(group, member).await?;
        }
        Ok(true)
    }
}

/// Stops a member, gracefully when the server answers
struct ShutdownMember {
    entry: PlanAction,
}

#[async_trait]
impl Action for ShutdownMember {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some((group, member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(true);
        };
        if member.pod_name.is_empty() || ctx.inspector().pod(&member.pod_name).is_none() {
            debug!(member_id = %member.id, "pod already gone");
            return Ok(true);
        }

        stop_member(ctx, group, &member).await?;
        Ok(false)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let Some((_, member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(Progress::Ready);
        };
        match ctx.inspector().pod(&member.pod_name) {
            None => Ok(Progress::Ready),
            Some(pod) if is_pod_terminated(&pod) => {
                ctx.delete_pod(&member.pod_name).await?;
                Ok(Progress::Ready)
            }
            Some(_) => Ok(Progress::Wait),
        }
    }
}

/// Stop the member pod, asking the server to shut down first
pub(super) async fn stop_member(
    ctx: &dyn ActionContext,
    group: ServerGroup,
    member: &MemberStatus,
) -> Result<()> {
    let graceful = match ctx.server(group, &member.id) {
        Ok(server) if group.is_arangod() => server.shutdown(false).await,
        Ok(_) => Err(Error::internal("sync members have no shutdown endpoint")),
        Err(e) => Err(e),
    };
    if let Err(e) = graceful {
        warn!(member_id = %member.id, error = %e, "graceful shutdown failed, deleting pod");
        ctx.delete_pod(&member.pod_name).await?;
    }
    Ok(())
}

/// Returns true once every container of the pod has exited
pub(super) fn is_pod_terminated(pod: &k8s_openapi::api::core::v1::Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    matches!(phase, Some("Succeeded") | Some("Failed"))
}

struct KillMemberPod {
    entry: PlanAction,
}

#[async_trait]
impl Action for KillMemberPod {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        if let Some((_, member)) = ctx.member(&self.entry.member_id).await? {
            if !member.pod_name.is_empty() {
                ctx.delete_pod(&member.pod_name).await?;
            }
        }
        Ok(true)
    }

    fn reload_cached_status(&self) -> bool {
        true
    }
}

/// Waits until a member serves requests
struct WaitForMemberUp {
    entry: PlanAction,
}

#[async_trait]
impl Action for WaitForMemberUp {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        Ok(self.check_progress(ctx).await? == Progress::Ready)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let group = entry_group(&self.entry)?;
        let Some((_, member)) = ctx.member(&self.entry.member_id).await? else {
            if ctx.mode() == DeploymentMode::Cluster {
                warn!(member_id = %self.entry.member_id, "member vanished while waiting for it");
                return Ok(Progress::Abort);
            }
            return Ok(Progress::Ready);
        };
        if member.phase == MemberPhase::Failed {
            debug!(member_id = %member.id, "member failed, recovery takes over");
            return Ok(Progress::Ready);
        }

        let cluster_member = ctx.mode() == DeploymentMode::Cluster
            && matches!(group, ServerGroup::DBServers | ServerGroup::Coordinators);
        if cluster_member {
            let Some(health) = ctx.health() else {
                debug!("cluster health unavailable");
                return Ok(Progress::Wait);
            };
            if health.status(&member.id) != Some(ServerHealthStatus::Good) {
                debug!(member_id = %member.id, "member not yet good in cluster health");
                return Ok(Progress::Wait);
            }
            if !member.has_condition(&ConditionType::Ready) {
                debug!(member_id = %member.id, "member pod not yet ready");
                return Ok(Progress::Wait);
            }
            return Ok(Progress::Ready);
        }

        let up = match ctx.server(group, &member.id) {
            Ok(server) => server.is_up().await.unwrap_or_else(|e| {
                debug!(member_id = %member.id, error = %e, "member not answering");
                false
            }),
            Err(e) => {
                debug!(member_id = %member.id, error = %e, "no client for member");
                false
            }
        };
        Ok(if up { Progress::Ready } else { Progress::Wait })
    }
}

/// Waits until every shard on a DBServer is in sync
struct WaitForMemberInSync {
    entry: PlanAction,
}

#[async_trait]
impl Action for WaitForMemberInSync {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        Ok(self.check_progress(ctx).await? == Progress::Ready)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        if self.entry.group != Some(ServerGroup::DBServers) || ctx.mode() != DeploymentMode::Cluster
        {
            return Ok(Progress::Ready);
        }
        if ctx.member(&self.entry.member_id).await?.is_none() {
            return Ok(Progress::Ready);
        }
        match ctx.agency() {
            Some(agency) if agency.is_dbserver_in_sync(&self.entry.member_id) => {
                Ok(Progress::Ready)
            }
            Some(_) => Ok(Progress::Wait),
            None => {
                debug!("agency cache unavailable");
                Ok(Progress::Wait)
            }
        }
    }
}

/// Waits until the member pod reports ready
struct WaitForMemberReady {
    entry: PlanAction,
}

#[async_trait]
impl Action for WaitForMemberReady {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        Ok(self.check_progress(ctx).await? == Progress::Ready)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        match ctx.member(&self.entry.member_id).await? {
            Some((_, m)) if !m.has_condition(&ConditionType::Ready) => Ok(Progress::Wait),
            _ => Ok(Progress::Ready),
        }
    }
}

struct MemberPhaseUpdate {
    entry: PlanAction,
    params: PhaseParams,
}

#[async_trait]
impl Action for MemberPhaseUpdate {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some((group, mut member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(true);
        };
        if member.phase != self.params.phase {
            member.phase = self.params.phase.clone();
            ctx.update_member(group, member).await?;
        }
        Ok(true)
    }
}

struct SetMemberCondition {
    entry: PlanAction,
    params: ConditionParams,
}

#[async_trait]
impl Action for SetMemberCondition {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some((group, mut member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(true);
        };
        let mut changed = false;
        for (type_, change) in &self.params.changes {
            changed |= match change {
                Some(value) => {
                    member
                        .conditions
                        .update(type_.clone(), *value, self.entry.reason.as_str(), "", "")
                }
                None => member.conditions.remove(type_),
            };
        }
        if changed {
            ctx.update_member(group, member).await?;
        }
        Ok(true)
    }
}

struct SetCondition {
    entry: PlanAction,
    params: ConditionParams,
}

#[async_trait]
impl Action for SetCondition {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let changes = self.params.changes.clone();
        let reason = self.entry.reason.clone();
        ctx.mutate_status(Box::new(move |s| {
            let mut changed = false;
            for (type_, change) in &changes {
                changed |= match change {
                    Some(value) => s
                        .conditions
                        .update(type_.clone(), *value, reason.as_str(), "", ""),
                    None => s.conditions.remove(type_),
                };
            }
            changed
        }))
        .await?;
        Ok(true)
    }
}

struct ArangoMemberUpdatePodSpec {
    entry: PlanAction,
}

#[async_trait]
impl Action for ArangoMemberUpdatePodSpec {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        if let Some((group, member)) = ctx.member(&self.entry.member_id).await? {
            ctx.ensure_arango_member(group, &member).await?;
        }
        Ok(true)
    }
}

struct ArangoMemberUpdatePodStatus {
    entry: PlanAction,
}

#[async_trait]
impl Action for ArangoMemberUpdatePodStatus {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        if let Some((group, member)) = ctx.member(&self.entry.member_id).await? {
            ctx.mark_template_applied(group, &member).await?;
        }
        Ok(true)
    }
}
