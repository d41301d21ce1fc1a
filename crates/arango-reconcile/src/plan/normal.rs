//! Normal builder chain
//!
//! The order is the priority: a builder only runs when everything before it
//! found nothing to do, so at most one class of change is in flight.

use tracing::instrument;

use super::cluster::{self, REBALANCER_BACK_OFF};
use super::security::{
    ca_append, ca_clean, ca_renewal, encryption_key, encryption_key_clean,
    encryption_propagated_wrap, encryption_status_update, jwt_key_update, jwt_status_update,
    keyfile_renewal, sni, tls_propagated_wrap, tls_status_propagated, tls_status_update,
};
use super::{recovery, rotate, scale, storage};
use super::{BuiltPlan, PlanAppender, PlanContext};

/// Compute the normal queue
#[instrument(skip(ctx), fields(deployment = %ctx.deployment))]
pub fn build_normal_plan(ctx: &PlanContext<'_>) -> BuiltPlan {
    if !ctx.status.plan.is_empty() {
        return BuiltPlan::in_flight(&ctx.status.plan, &ctx.status.back_off);
    }

    let (plan, back_off) = PlanAppender::new(ctx)
        .apply_if_empty("FailedMemberRecovery", recovery::failed_member_recovery)
        .apply_if_empty("CleanedOutDBServers", recovery::cleaned_out_dbservers)
        .apply_sub_plan_if_empty(
            "EncryptionStatus",
            encryption_propagated_wrap,
            &[encryption_status_update],
        )
        .apply_sub_plan_if_empty("TLSStatus", tls_propagated_wrap, &[tls_status_update])
        .apply_if_empty("JWTStatus", jwt_status_update)
        .apply_if_empty("Maintenance", cluster::maintenance)
        .apply_if_empty("Scale", scale::scale)
        .apply_if_empty("ReplaceMember", scale::replace_member)
        .apply_if_empty("MarkToRemove", rotate::mark_to_remove)
        .apply_if_empty("RotateOrUpgrade", rotate::rotate_or_upgrade)
        .apply_sub_plan_if_empty("EncryptionKey", encryption_propagated_wrap, &[encryption_key])
        .apply_if_empty("JWTKey", jwt_key_update)
        .apply_sub_plan_if_empty("TLSCA", tls_propagated_wrap, &[ca_renewal, ca_append])
        .apply_if_empty("TLSKeyfile", keyfile_renewal)
        .apply_if_empty("Storage", storage::storage)
        .apply_sub_plan_if_empty("TLSSNI", tls_propagated_wrap, &[sni])
        .apply_if_empty("Restore", cluster::restore)
        .apply_sub_plan_if_empty(
            "EncryptionClean",
            encryption_propagated_wrap,
            &[encryption_key_clean],
        )
        .apply_sub_plan_if_empty("TLSCAClean", tls_propagated_wrap, &[ca_clean])
        .apply_if_empty("ClusterOperation", cluster::cluster_operation)
        .apply_if_empty_with_back_off("Rebalancer", REBALANCER_BACK_OFF, cluster::rebalancer_generate)
        .apply_if_empty("TLSPropagated", tls_status_propagated)
        .apply_if_empty("Bootstrap", cluster::bootstrap)
        .finish();

    let changed = !plan.is_empty() || back_off != ctx.status.back_off;
    BuiltPlan {
        plan,
        back_off,
        changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::params::{PlanActionParams, PropagatedParams};
    use crate::action::security::sha256_hex;
    use crate::context::Snapshot;
    use crate::plan::tests::{healthy_cluster, pods_for};
    use crate::testing::secret;
    use arango_common::crd::{
        ActionType, MemberPhase, Plan, PlanAction, RebalancerSpec, ServerGroup,
    };

    fn types(plan: &Plan) -> Vec<ActionType> {
        plan.iter().map(|a| a.type_.clone()).collect()
    }

    #[test]
    fn in_flight_plan_is_returned_unchanged() {
        let (spec, mut status) = healthy_cluster();
        status.members.remove(ServerGroup::DBServers, "PRMR-3");
        let pending = Plan::from(vec![
            PlanAction::for_cluster(ActionType::Idle, "one"),
            PlanAction::for_cluster(ActionType::Idle, "two"),
        ]);
        status.plan = pending.clone();
        let snapshot = Snapshot::default();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        let built = build_normal_plan(&ctx);
        assert_eq!(built.plan, pending);
        assert!(!built.changed);
    }

    #[test]
    fn converged_deployment_builds_nothing() {
        let (spec, status) = healthy_cluster();
        let snapshot = pods_for(&status, &spec.image);
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        let built = build_normal_plan(&ctx);
        assert!(built.plan.is_empty());
        assert!(!built.changed);
    }

    // =========================================================================
    // Priority
    // =========================================================================

    /// Story: an agent failed while a DBServer is also missing. Recovery of
    /// the agent comes first; the scale-up waits for the next plan.
    #[test]
    fn recovery_wins_over_scale() {
        let (spec, mut status) = healthy_cluster();
        status.members.group_mut(ServerGroup::Agents)[0].phase = MemberPhase::Failed;
        status.members.remove(ServerGroup::DBServers, "PRMR-3");
        let snapshot = pods_for(&status, &spec.image);
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        let built = build_normal_plan(&ctx);
        assert_eq!(types(&built.plan), vec![ActionType::RecreateMember]);
        assert_eq!(built.plan.0[0].member_id, "AGNT-1");
    }

    /// Story: a new JWT shows up while the cluster is short a DBServer. Key
    /// rotation never starts while a scale operation is pending; once the
    /// member exists the rotation goes out, lowering the propagated flag
    /// first.
    #[test]
    fn key_rotation_waits_behind_scale() {
        let (spec, mut status) = healthy_cluster();
        status.members.remove(ServerGroup::DBServers, "PRMR-3");
        let mut snapshot = pods_for(&status, &spec.image);
        snapshot.secrets.insert(
            "prod-jwt".to_string(),
            secret("prod-jwt", &[("token", b"t2")]),
        );
        let old = sha256_hex(b"t1");
        snapshot.secrets.insert(
            "prod-jwt-folder".to_string(),
            secret("prod-jwt-folder", &[("-", b"t1"), (old.as_str(), b"t1")]),
        );
        status.hashes.jwt.active = old.clone();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);

        assert_eq!(types(&build_normal_plan(&ctx).plan), vec![ActionType::AddMember]);

        let (_, full) = healthy_cluster();
        status.members = full.members;
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);
        let plan = build_normal_plan(&ctx).plan;
        assert_eq!(
            types(&plan),
            vec![ActionType::JWTPropagated, ActionType::JWTAdd, ActionType::JWTRefresh]
        );
        let flag: PropagatedParams = plan.0[0].params_as().expect("params");
        assert!(!flag.propagated);
    }

    fn ca_pem() -> String {
        use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2090, 1, 1);
        let key = KeyPair::generate().expect("key");
        params.self_signed(&key).expect("self-signed").pem()
    }

    /// Story: a new CA appears. The status hashes are recorded first, with
    /// the TLS flag lowered; the next plan appends the CA to the truststore.
    #[test]
    fn new_ca_is_recorded_then_appended() {
        let (spec, mut status) = healthy_cluster();
        let ca = ca_pem();
        let mut snapshot = pods_for(&status, &spec.image);
        snapshot.secrets.insert(
            "prod-ca".to_string(),
            secret("prod-ca", &[("ca.crt", ca.as_bytes())]),
        );
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);
        assert_eq!(
            types(&build_normal_plan(&ctx).plan),
            vec![ActionType::TLSPropagated, ActionType::TLSKeyStatusUpdate]
        );

        status.hashes.tls.active = sha256_hex(ca.as_bytes());
        status.hashes.tls.propagated = false;
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot);
        assert_eq!(
            types(&build_normal_plan(&ctx).plan),
            vec![ActionType::AppendTLSCACertificate]
        );
    }

    // =========================================================================
    // Back-off
    // =========================================================================

    #[test]
    fn rebalancer_arms_its_back_off() {
        let (mut spec, status) = healthy_cluster();
        spec.rebalancer = Some(RebalancerSpec {
            enabled: true,
            parallel_moves: Some(4),
        });
        let snapshot = pods_for(&status, &spec.image);
        let now = chrono::Utc::now();
        let ctx = PlanContext::new("prod", &spec, &status, &snapshot).at(now);

        let built = build_normal_plan(&ctx);
        assert_eq!(types(&built.plan), vec![ActionType::RebalancerGenerate]);
        assert!(built.changed);
        assert!(!built.back_off.is_due("Rebalancer", now));
    }
}
