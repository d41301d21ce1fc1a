//! DBServer drain actions backed by agency jobs

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use arango_common::crd::{
    ActionType, ConditionType, DeploymentMode, MemberPhase, PlanAction, ServerGroup,
};
use arango_common::Result;

use super::{entry_accessor, Action, ActionRegistryBuilder, Progress};
use crate::context::{ActionContext, JobStatus};

pub(super) fn register(builder: &mut ActionRegistryBuilder, grace: Duration) {
    builder
        .register_with_grace(ActionType::CleanOutMember, clean_out_member, grace)
        .register_with_grace(ActionType::ResignLeadership, resign_leadership, grace);
}

fn clean_out_member(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(CleanOutMember { entry }))
}

fn resign_leadership(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(ResignLeadership { entry }))
}

/// Moves every shard away from a DBServer
///
/// The agency job ID is kept on the member so that a restarted operator
/// polls the existing job instead of starting a second one.
struct CleanOutMember {
    entry: PlanAction,
}

#[async_trait]
impl Action for CleanOutMember {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some((group, mut member)) = ctx.member(&self.entry.member_id).await? else {
            debug!(member_id = %self.entry.member_id, "member gone, nothing to clean out");
            return Ok(true);
        };
        if member.has_condition(&ConditionType::CleanedOut) {
            return Ok(true);
        }
        if member.phase == MemberPhase::CleanOut && member.cleanout_job_id.is_some() {
            debug!(member_id = %member.id, "clean out already running");
            return Ok(false);
        }

        let job_id = ctx.database()?.clean_out_server(&member.id).await?;
        info!(member_id = %member.id, job_id = ?job_id, "clean out started");
        member.cleanout_job_id = job_id;
        member.phase = MemberPhase::CleanOut;
        ctx.update_member(group, member).await?;
        Ok(false)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let Some((group, mut member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(Progress::Ready);
        };
        let database = ctx.database()?;

        if database.is_cleaned_out(&member.id).await? {
            member.conditions.update(
                ConditionType::CleanedOut,
                true,
                "CleanedOut",
                "All shards moved away",
                "",
            );
            member.cleanout_job_id = None;
            ctx.update_member(group, member).await?;
            return Ok(Progress::Ready);
        }

        let Some(job_id) = member.cleanout_job_id.clone() else {
            warn!(member_id = %member.id, "clean out job ID lost");
            return self.revert(ctx, group, member).await;
        };
        match database.job_status(&job_id).await? {
            JobStatus::Pending | JobStatus::Running | JobStatus::Finished => Ok(Progress::Wait),
            JobStatus::Failed(reason) => {
                warn!(member_id = %member.id, job_id = %job_id, reason = %reason, "clean out job failed");
                self.revert(ctx, group, member).await
            }
            JobStatus::NotFound => {
                warn!(member_id = %member.id, job_id = %job_id, "clean out job vanished");
                self.revert(ctx, group, member).await
            }
        }
    }
}

impl CleanOutMember {
    async fn revert(
        &self,
        ctx: &dyn ActionContext,
        group: ServerGroup,
        mut member: arango_common::crd::MemberStatus,
    ) -> Result<Progress> {
        member.phase = MemberPhase::Created;
        member.cleanout_job_id = None;
        ctx.update_member(group, member).await?;
        Ok(Progress::Abort)
    }
}

/// Moves shard leadership away from a DBServer before it restarts
struct ResignLeadership {
    entry: PlanAction,
}

#[async_trait]
impl Action for ResignLeadership {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        if ctx.mode() != DeploymentMode::Cluster {
            return Ok(true);
        }
        let Some((group, mut member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(true);
        };
        if group != ServerGroup::DBServers {
            return Ok(true);
        }
        if let Some(agency) = ctx.agency() {
            if !agency.is_leader(&member.id) {
                debug!(member_id = %member.id, "member leads no shard");
                return Ok(true);
            }
        }
        if member.cleanout_job_id.is_some() {
            return Ok(false);
        }

        let job_id = ctx.database()?.resign_server(&member.id).await?;
        if job_id.is_none() {
            return Ok(true);
        }
        info!(member_id = %member.id, job_id = ?job_id, "resign leadership started");
        member.cleanout_job_id = job_id;
        ctx.update_member(group, member).await?;
        Ok(false)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let Some((group, mut member)) = ctx.member(&self.entry.member_id).await? else {
            return Ok(Progress::Ready);
        };
        let Some(job_id) = member.cleanout_job_id.clone() else {
            return Ok(Progress::Ready);
        };
        match ctx.database()?.job_status(&job_id).await? {
            JobStatus::Pending | JobStatus::Running => Ok(Progress::Wait),
            status => {
                if let JobStatus::Failed(reason) = &status {
                    // A restart without resigning first is still safe, only slower.
                    warn!(member_id = %member.id, reason = %reason, "resign leadership failed");
                }
                member.cleanout_job_id = None;
                ctx.update_member(group, member).await?;
                Ok(Progress::Ready)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agency::tests::agency_with_shards;
    use crate::context::MockDatabaseClient;
    use crate::testing::{created_member, FakeContext};
    use arango_common::crd::{DeploymentSpec, DeploymentStatus};

    fn ctx_with_dbserver(db: MockDatabaseClient) -> FakeContext {
        let mut status = DeploymentStatus::default();
        status
            .members
            .add(ServerGroup::DBServers, created_member("PRMR-1"))
            .expect("add");
        FakeContext::new()
            .with_spec(DeploymentSpec {
                mode: DeploymentMode::Cluster,
                image: "arangodb/enterprise:3.11.4".to_string(),
                ..Default::default()
            })
            .with_status(status)
            .with_database(db)
    }

    fn clean_out() -> Box<dyn Action> {
        clean_out_member(PlanAction::new(
            ActionType::CleanOutMember,
            Some(ServerGroup::DBServers),
            "PRMR-1",
            "scale down",
        ))
        .expect("build")
    }

    /// Story: a clean out is started, the operator restarts mid-job and the
    /// job later completes. The job must be started exactly once.
    #[tokio::test]
    async fn story_clean_out_survives_restart() {
        let mut db = MockDatabaseClient::new();
        db.expect_clean_out_server()
            .times(1)
            .returning(|_| Ok(Some("job-1".to_string())));
        let mut cleaned = vec![false, true].into_iter();
        db.expect_is_cleaned_out()
            .returning(move |_| Ok(cleaned.next().unwrap_or(true)));
        db.expect_job_status()
            .returning(|_| Ok(JobStatus::Running));
        let ctx = ctx_with_dbserver(db);

        assert!(!clean_out().start(&ctx).await.expect("start"));
        let member = ctx.current().members.dbservers[0].clone();
        assert_eq!(member.phase, MemberPhase::CleanOut);
        assert_eq!(member.cleanout_job_id.as_deref(), Some("job-1"));

        // Restarted operator rebuilds the action and starts it again.
        assert!(!clean_out().start(&ctx).await.expect("restart"));

        let action = clean_out();
        assert_eq!(
            action.check_progress(&ctx).await.expect("progress"),
            Progress::Wait
        );
        assert_eq!(
            action.check_progress(&ctx).await.expect("progress"),
            Progress::Ready
        );
        let member = ctx.current().members.dbservers[0].clone();
        assert!(member.has_condition(&ConditionType::CleanedOut));
        assert_eq!(member.cleanout_job_id, None);
    }

    #[tokio::test]
    async fn failed_clean_out_job_reverts_and_aborts() {
        let mut db = MockDatabaseClient::new();
        db.expect_clean_out_server()
            .returning(|_| Ok(Some("job-1".to_string())));
        db.expect_is_cleaned_out().returning(|_| Ok(false));
        db.expect_job_status()
            .returning(|_| Ok(JobStatus::Failed("no free server".to_string())));
        let ctx = ctx_with_dbserver(db);

        let action = clean_out();
        action.start(&ctx).await.expect("start");
        assert_eq!(
            action.check_progress(&ctx).await.expect("progress"),
            Progress::Abort
        );
        let member = ctx.current().members.dbservers[0].clone();
        assert_eq!(member.phase, MemberPhase::Created);
        assert_eq!(member.cleanout_job_id, None);
    }

    #[tokio::test]
    async fn resign_leadership_skips_followers() {
        let ctx = ctx_with_dbserver(MockDatabaseClient::new())
            .with_agency(agency_with_shards(&[("s1", &["PRMR-2", "PRMR-1"])]));
        let action = resign_leadership(PlanAction::new(
            ActionType::ResignLeadership,
            Some(ServerGroup::DBServers),
            "PRMR-1",
            "",
        ))
        .expect("build");
        assert!(action.start(&ctx).await.expect("start"));
    }

    #[tokio::test]
    async fn resign_leadership_tracks_job_until_done() {
        let mut db = MockDatabaseClient::new();
        db.expect_resign_server()
            .times(1)
            .returning(|_| Ok(Some("job-9".to_string())));
        let mut states = vec![JobStatus::Running, JobStatus::Finished].into_iter();
        db.expect_job_status()
            .returning(move |_| Ok(states.next().unwrap_or(JobStatus::NotFound)));
        let ctx = ctx_with_dbserver(db)
            .with_agency(agency_with_shards(&[("s1", &["PRMR-1", "PRMR-2"])]));

        let action = resign_leadership(PlanAction::new(
            ActionType::ResignLeadership,
            Some(ServerGroup::DBServers),
            "PRMR-1",
            "",
        ))
        .expect("build");
        assert!(!action.start(&ctx).await.expect("start"));
        assert_eq!(
            action.check_progress(&ctx).await.expect("progress"),
            Progress::Wait
        );
        assert_eq!(
            action.check_progress(&ctx).await.expect("progress"),
            Progress::Ready
        );
        assert_eq!(ctx.current().members.dbservers[0].cleanout_job_id, None);
    }
}
