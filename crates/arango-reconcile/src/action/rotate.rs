//! Restart, upgrade and image bookkeeping actions
//!
//! A restart is split in two halves: stopping the pod, and handing the
//! member back to the pod reconciler by resetting its phase to None. The
//! high priority chain then re-initialises the member like a new one.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info};

use arango_common::crd::{
    ActionType, ConditionType, MemberPhase, MemberStatus, PlanAction, ServerGroup,
};
use arango_common::{Error, Result};

use super::member::{is_pod_terminated, stop_member};
use super::{entry_accessor, Action, ActionRegistryBuilder, Progress};
use crate::context::ActionContext;

pub(super) fn register(builder: &mut ActionRegistryBuilder, grace: Duration) {
    builder
        .register_with_grace(ActionType::RotateMember, rotate_member, grace)
        .register_with_grace(ActionType::RotateStartMember, rotate_start_member, grace)
        .register(ActionType::RotateStopMember, rotate_stop_member)
        .register_with_grace(ActionType::UpgradeMember, upgrade_member, grace)
        .register(ActionType::SetCurrentImage, set_current_image)
        .register(ActionType::SetMemberCurrentImage, set_member_current_image)
        .register(
            ActionType::RuntimeContainerImageUpdate,
            runtime_container_image_update,
        );
}

fn rotate_member(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(RestartMember {
        entry,
        next_phase: MemberPhase::None,
    }))
}

fn upgrade_member(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(RestartMember {
        entry,
        next_phase: MemberPhase::Upgrading,
    }))
}

fn rotate_start_member(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(RotateStartMember { entry }))
}

fn rotate_stop_member(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(RotateStopMember { entry }))
}

fn set_current_image(entry: PlanAction) -> Result<Box<dyn Action>> {
    require_image(&entry)?;
    Ok(Box::new(SetCurrentImage { entry }))
}

fn set_member_current_image(entry: PlanAction) -> Result<Box<dyn Action>> {
    require_image(&entry)?;
    Ok(Box::new(SetMemberCurrentImage { entry }))
}

fn runtime_container_image_update(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(RuntimeContainerImageUpdate { entry }))
}

fn require_image(entry: &PlanAction) -> Result<()> {
    if entry.image.is_empty() {
        return Err(Error::validation(format!(
            "{} {} has no image",
            entry.type_, entry.id
        )));
    }
    Ok(())
}

/// Returns true if the pod with the member's name is gone or was created
/// after `since`, i.e. the pod the action stopped no longer exists
fn old_pod_gone(pod: Option<&Pod>, since: Option<chrono::DateTime<Utc>>) -> bool {
    let Some(pod) = pod else {
        return true;
    };
    match (pod.metadata.creation_timestamp.as_ref(), since) {
        (Some(created), Some(since)) => created.0 > since,
        _ => false,
    }
}

/// Clear restart markers and hand the member back to the pod reconciler
async fn finish_restart(
    ctx: &dyn ActionContext,
    group: ServerGroup,
    mut member: MemberStatus,
    phase: MemberPhase,
) -> Result<()> {
    member.phase = phase;
    for c in [
        ConditionType::Restart,
        ConditionType::PendingRestart,
        ConditionType::Ready,
        ConditionType::Serving,
    ] {
        member.conditions.remove(&c);
    }
    ctx.update_member(group, member).await?;
    Ok(())
}

/// RotateMember and UpgradeMember
///
/// Both stop the pod and wait for it to disappear. They differ in the phase
/// the member is left in: None for a plain restart, Upgrading for a restart
/// with auto-upgrade.
struct RestartMember {
    entry: PlanAction,
    next_phase: MemberPhase,
}

#[async_trait]
impl Action for RestartMember {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some((group, member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(true);
        };
        if member.phase != MemberPhase::Created {
            debug!(member_id = %member.id, phase = %member.phase, "member is not running, nothing to restart");
            return Ok(true);
        }
        if ctx.inspector().pod(&member.pod_name).is_none() {
            finish_restart(ctx, group, member, self.next_phase.clone()).await?;
            return Ok(true);
        }
        info!(member_id = %member.id, phase = %self.next_phase, "restarting member");
        stop_member(ctx, group, &member).await?;
        Ok(false)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let Some((group, member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(Progress::Ready);
        };
        let pod = ctx.inspector().pod(&member.pod_name);
        if let Some(pod) = pod.as_ref() {
            if is_pod_terminated(pod) {
                ctx.delete_pod(&member.pod_name).await?;
                return Ok(Progress::Wait);
            }
        }
        if !old_pod_gone(pod.as_ref(), self.entry.start_time) {
            return Ok(Progress::Wait);
        }
        finish_restart(ctx, group, member, self.next_phase.clone()).await?;
        Ok(Progress::Ready)
    }
}

/// First half of a restart around a volume change; the phase is untouched
struct RotateStartMember {
    entry: PlanAction,
}

#[async_trait]
impl Action for RotateStartMember {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some((group, member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(true);
        };
        if ctx.inspector().pod(&member.pod_name).is_none() {
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
                Ok(Progress::Wait)
            }
            Some(_) => Ok(Progress::Wait),
        }
    }
}

/// Second half of a split restart
struct RotateStopMember {
    entry: PlanAction,
}

#[async_trait]
impl Action for RotateStopMember {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        if let Some((group, member)) = ctx.member(&self.entry.member_id).await? {
            finish_restart(ctx, group, member, MemberPhase::None).await?;
        }
        Ok(true)
    }
}

/// Records the deployment image once its version is known
struct SetCurrentImage {
    entry: PlanAction,
}

#[async_trait]
impl Action for SetCurrentImage {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        Ok(self.check_progress(ctx).await? == Progress::Ready)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let image = self.entry.image.clone();
        let status = ctx.status().await?;
        if status.image_info(&image).is_none() {
            debug!(image = %image, "image version not yet discovered");
            return Ok(Progress::Wait);
        }
        ctx.mutate_status(Box::new(move |s| {
            let Some(info) = s.image_info(&image).cloned() else {
                return false;
            };
            if s.current_image.as_ref() == Some(&info) {
                return false;
            }
            s.current_image = Some(info);
            true
        }))
        .await?;
        Ok(Progress::Ready)
    }
}

/// Records the image a member is about to run
struct SetMemberCurrentImage {
    entry: PlanAction,
}

#[async_trait]
impl Action for SetMemberCurrentImage {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        Ok(self.check_progress(ctx).await? == Progress::Ready)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let status = ctx.status().await?;
        let Some(info) = status.image_info(&self.entry.image).cloned() else {
            debug!(image = %self.entry.image, "image version not yet discovered");
            return Ok(Progress::Wait);
        };
        let Some((group, mut member)) = status
            .members
            .by_id(&self.entry.member_id)
            .map(|(g, m)| (g, m.clone()))
        else {
            return Ok(Progress::Ready);
        };
        if member.image.as_ref() != Some(&info) {
            member.image = Some(info);
            ctx.update_member(group, member).await?;
        }
        Ok(Progress::Ready)
    }
}

/// Swaps the server container image of a running pod in place
struct RuntimeContainerImageUpdate {
    entry: PlanAction,
}

impl RuntimeContainerImageUpdate {
    fn target_image<'a>(&'a self, ctx: &'a dyn ActionContext) -> &'a str {
        if self.entry.image.is_empty() {
            &ctx.spec().image
        } else {
            &self.entry.image
        }
    }
}

#[async_trait]
impl Action for RuntimeContainerImageUpdate {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some((_, member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(true);
        };
        if member.phase != MemberPhase::Created {
            debug!(member_id = %member.id, "member is not running, skipping image update");
            return Ok(true);
        }
        let Some(pod) = ctx.inspector().pod(&member.pod_name) else {
            return Ok(true);
        };
        let image = self.target_image(ctx);
        let current = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.as_deref());
        if current == Some(image) {
            return Ok(true);
        }
        info!(member_id = %member.id, image = %image, "updating container image");
        ctx.update_container_image(&member.pod_name, image).await?;
        Ok(false)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let Some((_, member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(Progress::Ready);
        };
        let Some(pod) = ctx.inspector().pod(&member.pod_name) else {
            return Ok(Progress::Ready);
        };
        let container = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone())
            .unwrap_or_default();
        let ready = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|cs| cs.iter().find(|c| c.name == container))
            .map(|c| c.ready && c.image == self.target_image(ctx))
            .unwrap_or(false);
        Ok(if ready { Progress::Ready } else { Progress::Wait })
    }

    async fn post(&self, ctx: &dyn ActionContext) -> Result<()> {
        if let Some((group, member)) = ctx.member(&self.entry.member_id).await? {
            ctx.mark_template_applied(group, &member).await?;
        }
        Ok(())
    }
}
