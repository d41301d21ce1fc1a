//! Volume resize actions

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::{debug, info};

use arango_common::crd::{quantity_to_bytes, ActionType, PlanAction};
use arango_common::Result;

use super::{entry_accessor, entry_group, Action, ActionRegistryBuilder, Progress};
use crate::context::ActionContext;

const STORAGE: &str = "storage";

pub(super) fn register(builder: &mut ActionRegistryBuilder, _grace: Duration) {
    builder
        .register(ActionType::PVCResize, pvc_resize)
        .register(ActionType::PVCResized, pvc_resized);
}

fn pvc_resize(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(PvcResize { entry }))
}

fn pvc_resized(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(PvcResized { entry }))
}

/// Requested storage of a claim
pub(crate) fn requested_size(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get(STORAGE))
}

fn capacity(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get(STORAGE))
}

fn has_condition(pvc: &PersistentVolumeClaim, type_: &str) -> bool {
    pvc.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == type_ && c.status == "True"))
        .unwrap_or(false)
}

/// Returns true if `a` holds fewer bytes than `b`; unparsable sizes compare
/// as not smaller
pub(crate) fn is_smaller(a: &Quantity, b: &Quantity) -> bool {
    match (quantity_to_bytes(&a.0), quantity_to_bytes(&b.0)) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}

/// Raises the storage request of a member claim to the group volume size
struct PvcResize {
    entry: PlanAction,
}

impl PvcResize {
    async fn target(
        &self,
        ctx: &dyn ActionContext,
    ) -> Result<Option<(String, PersistentVolumeClaim, Quantity)>> {
        let group = entry_group(&self.entry)?;
        let Some(size) = ctx.spec().group(group).volume_size.clone() else {
            return Ok(None);
        };
        let Some((_, member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(None);
        };
        let name = member.persistent_volume_claim_name;
        Ok(ctx
            .inspector()
            .persistent_volume_claim(&name)
            .map(|pvc| (name, pvc, size)))
    }
}

#[async_trait]
impl Action for PvcResize {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some((name, pvc, size)) = self.target(ctx).await? else {
            debug!(member_id = %self.entry.member_id, "no claim to resize");
            return Ok(true);
        };
        match requested_size(&pvc) {
            Some(current) if !is_smaller(current, &size) => {}
            _ => {
                info!(pvc = %name, size = %size.0, "resizing volume");
                ctx.resize_pvc(&name, &size).await?;
            }
        }
        Ok(false)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let Some((_, pvc, size)) = self.target(ctx).await? else {
            return Ok(Progress::Ready);
        };
        // The filesystem part of the resize needs the volume to be mounted
        // again; PVCResized takes over from here.
        if has_condition(&pvc, "FileSystemResizePending") {
            return Ok(Progress::Ready);
        }
        match capacity(&pvc) {
            Some(cap) if !is_smaller(cap, &size) => Ok(Progress::Ready),
            _ => Ok(Progress::Wait),
        }
    }
}

/// Waits until the storage provider finished resizing a claim
struct PvcResized {
    entry: PlanAction,
}

#[async_trait]
impl Action for PvcResized {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        Ok(self.check_progress(ctx).await? == Progress::Ready)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let Some((_, member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(Progress::Ready);
        };
        match ctx
            .inspector()
            .persistent_volume_claim(&member.persistent_volume_claim_name)
        {
            Some(pvc) if has_condition(&pvc, "Resizing") => Ok(Progress::Wait),
            _ => Ok(Progress::Ready),
        }
    }
}
