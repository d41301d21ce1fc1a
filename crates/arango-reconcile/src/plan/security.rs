//! Rotation of encryption keys, JWTs and TLS material
//!
//! New material always travels the same way: added to its folder secret,
//! reloaded by the servers, activated, and only then are old entries
//! removed. The propagated flag of each subsystem is dropped while any of
//! that is going on and set again once the builders find nothing to do.

use tracing::{debug, warn};

use arango_common::crd::{ActionType, KeyHashes, MemberPhase, Plan, PlanAction, ServerGroup};
use arango_common::{
    ACTIVE_JWT_KEY, SECRET_KEY_CA_CERTIFICATE, SECRET_KEY_ENCRYPTION, SECRET_KEY_TOKEN,
};

use super::PlanContext;
use crate::action::params::{ChecksumParams, KeyParams, PlanActionParams, PropagatedParams};
use crate::action::security::{
    certificate_expires_within, encryption_folder_name, jwt_folder_name, keyfile_secret_name,
    secret_data, secret_value, sha256_hex, sni_fingerprint, truststore_name, KeyKind,
    CA_RENEWAL_WINDOW, SECRET_KEY_TLS_KEYFILE,
};

fn propagated(type_: ActionType, value: bool) -> PlanAction {
    let reason = if value {
        "Change propagated flag to true"
    } else {
        "Change propagated flag to false"
    };
    PlanAction::for_cluster(type_, reason).with_params(&PropagatedParams { propagated: value })
}

fn checksum(type_: ActionType, checksum: String, reason: &str) -> PlanAction {
    PlanAction::for_cluster(type_, reason).with_params(&ChecksumParams { checksum })
}

fn hashes_differ(live: &KeyHashes, recorded: &KeyHashes) -> bool {
    live.active != recorded.active || live.passive != recorded.passive
}

/// Prepend `flag(false)` to non-trivial work while the flag is set
fn propagated_wrap(enabled: bool, flag: ActionType, currently: bool, plan: Plan) -> Plan {
    if !enabled || plan.is_empty() {
        return Plan::new();
    }
    if plan.len() == 1 && plan.contains_type(&flag) {
        return plan;
    }
    if currently {
        return Plan::from(vec![propagated(flag, false)]).after(plan);
    }
    plan
}

/// Wrapper for the encryption builders
pub(super) fn encryption_propagated_wrap(ctx: &PlanContext<'_>, plan: Plan) -> Plan {
    propagated_wrap(
        ctx.preconditions.encryption,
        ActionType::EncryptionKeyPropagated,
        ctx.status.hashes.encryption.propagated,
        plan,
    )
}

/// Wrapper for the TLS builders
pub(super) fn tls_propagated_wrap(ctx: &PlanContext<'_>, plan: Plan) -> Plan {
    propagated_wrap(
        ctx.preconditions.tls,
        ActionType::TLSPropagated,
        ctx.status.hashes.tls.propagated,
        plan,
    )
}

// =============================================================================
// Status convergence
// =============================================================================

pub(super) fn encryption_status_update(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.encryption {
        return Plan::new();
    }
    match KeyKind::Encryption.live_hashes_from(ctx.deployment, ctx.spec, ctx.inspector) {
        Some(live) if hashes_differ(&live, &ctx.status.hashes.encryption) => Plan::from(vec![
            PlanAction::for_cluster(ActionType::EncryptionKeyStatusUpdate, "Update status"),
        ]),
        _ => Plan::new(),
    }
}

pub(super) fn tls_status_update(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.tls {
        return Plan::new();
    }
    match KeyKind::Tls.live_hashes_from(ctx.deployment, ctx.spec, ctx.inspector) {
        Some(live) if hashes_differ(&live, &ctx.status.hashes.tls) => Plan::from(vec![
            PlanAction::for_cluster(ActionType::TLSKeyStatusUpdate, "Update status"),
        ]),
        _ => Plan::new(),
    }
}

pub(super) fn jwt_status_update(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.jwt {
        return Plan::new();
    }
    match KeyKind::Jwt.live_hashes_from(ctx.deployment, ctx.spec, ctx.inspector) {
        Some(live) if hashes_differ(&live, &ctx.status.hashes.jwt) => jwt_propagated(
            ctx,
            Plan::from(vec![PlanAction::for_cluster(
                ActionType::JWTStatusUpdate,
                "Update status",
            )]),
        ),
        _ => Plan::new(),
    }
}

/// Keep the JWT propagated flag in line with pending work
///
/// Work drops the flag before it runs; no work raises it.
fn jwt_propagated(ctx: &PlanContext<'_>, work: Plan) -> Plan {
    let busy = !work.is_empty();
    if ctx.status.hashes.jwt.propagated == busy {
        return Plan::from(vec![propagated(ActionType::JWTPropagated, !busy)]).after(work);
    }
    work
}

// =============================================================================
// Encryption
// =============================================================================

pub(super) fn encryption_key(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.encryption {
        return Plan::new();
    }
    let Some(secret) = ctx.spec.encryption.key_secret_name.as_deref() else {
        return Plan::new();
    };
    let Some(key) = secret_value(ctx.inspector, secret, SECRET_KEY_ENCRYPTION) else {
        debug!(secret, "encryption key secret missing");
        return Plan::new();
    };
    let sha = sha256_hex(&key);
    let folder = encryption_folder_name(ctx.deployment);
    if secret_value(ctx.inspector, &folder, &sha).is_none() {
        return Plan::from(vec![PlanAction::for_cluster(
            ActionType::EncryptionKeyAdd,
            "Add encryption key to folder",
        )]);
    }
    if !ctx.status.hashes.encryption.propagated {
        return Plan::from(vec![
            PlanAction::for_cluster(ActionType::EncryptionKeyRefresh, "Reload encryption keys"),
            propagated(ActionType::EncryptionKeyPropagated, true),
        ]);
    }
    Plan::new()
}

pub(super) fn encryption_key_clean(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.encryption || !ctx.status.hashes.encryption.propagated {
        return Plan::new();
    }
    let Some(folder) = secret_data(ctx.inspector, &encryption_folder_name(ctx.deployment)) else {
        return Plan::new();
    };
    if folder.len() <= 1 {
        return Plan::new();
    }
    let active = ctx
        .spec
        .encryption
        .key_secret_name
        .as_deref()
        .and_then(|s| secret_value(ctx.inspector, s, SECRET_KEY_ENCRYPTION))
        .map(|k| sha256_hex(&k));
    let Some(active) = active else {
        return Plan::new();
    };
    if !folder.contains_key(&active) {
        warn!(key = %active, "active encryption key is not in the folder");
        return Plan::new();
    }
    folder
        .keys()
        .filter(|k| **k != active)
        .map(|k| {
            PlanAction::for_cluster(ActionType::EncryptionKeyRemove, "Remove old encryption key")
                .with_params(&KeyParams { key: k.clone() })
        })
        .collect()
}

// =============================================================================
// JWT
// =============================================================================

pub(super) fn jwt_key_update(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.jwt {
        return Plan::new();
    }
    let secret = ctx.spec.authentication.jwt_secret_name(ctx.deployment);
    let Some(token) = secret_value(ctx.inspector, &secret, SECRET_KEY_TOKEN) else {
        debug!(secret = %secret, "JWT secret missing, no rotation");
        return jwt_propagated(ctx, Plan::new());
    };
    let sha = sha256_hex(&token);
    let folder = secret_data(ctx.inspector, &jwt_folder_name(ctx.deployment)).unwrap_or_default();

    if !folder.contains_key(&sha) {
        return jwt_propagated(
            ctx,
            Plan::from(vec![
                checksum(ActionType::JWTAdd, sha, "Add JWT rotation key"),
                PlanAction::for_cluster(ActionType::JWTRefresh, "Reload JWTs"),
            ]),
        );
    }
    let active = folder.get(ACTIVE_JWT_KEY).map(|t| sha256_hex(t));
    if active.as_deref() != Some(sha.as_str()) {
        return jwt_propagated(
            ctx,
            Plan::from(vec![
                checksum(ActionType::JWTSetActive, sha, "Set active key"),
                PlanAction::for_cluster(ActionType::JWTRefresh, "Reload JWTs"),
            ]),
        );
    }
    let stale = folder
        .keys()
        .find(|k| k.as_str() != ACTIVE_JWT_KEY && k.as_str() != SECRET_KEY_TOKEN && **k != sha);
    if let Some(stale) = stale {
        return jwt_propagated(
            ctx,
            Plan::from(vec![
                checksum(ActionType::JWTClean, stale.clone(), "Remove old key"),
                PlanAction::for_cluster(ActionType::JWTRefresh, "Reload JWTs"),
            ]),
        );
    }
    jwt_propagated(ctx, Plan::new())
}

// =============================================================================
// TLS
// =============================================================================

fn ca_certificate(ctx: &PlanContext<'_>) -> Option<Vec<u8>> {
    secret_value(
        ctx.inspector,
        &ctx.spec.tls.ca_secret_name(ctx.deployment),
        SECRET_KEY_CA_CERTIFICATE,
    )
}

pub(super) fn ca_renewal(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.tls {
        return Plan::new();
    }
    let Some(ca) = ca_certificate(ctx) else {
        return Plan::new();
    };
    match certificate_expires_within(&ca, CA_RENEWAL_WINDOW, ctx.now) {
        Ok(true) => Plan::from(vec![PlanAction::for_cluster(
            ActionType::RenewTLSCACertificate,
            "Renew CA certificate",
        )]),
        Ok(false) => Plan::new(),
        Err(e) => {
            warn!(error = %e, "unable to read CA certificate");
            Plan::new()
        }
    }
}

pub(super) fn ca_append(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.tls {
        return Plan::new();
    }
    let Some(ca) = ca_certificate(ctx) else {
        return Plan::new();
    };
    let sha = sha256_hex(&ca);
    if secret_value(ctx.inspector, &truststore_name(ctx.deployment), &sha).is_some() {
        return Plan::new();
    }
    Plan::from(vec![checksum(
        ActionType::AppendTLSCACertificate,
        sha,
        "Append CA to truststore",
    )])
}

pub(super) fn ca_clean(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.tls || !ctx.status.hashes.tls.propagated {
        return Plan::new();
    }
    let Some(ca) = ca_certificate(ctx) else {
        return Plan::new();
    };
    let sha = sha256_hex(&ca);
    let truststore = secret_data(ctx.inspector, &truststore_name(ctx.deployment)).unwrap_or_default();
    match truststore.keys().find(|k| **k != sha) {
        Some(old) => Plan::from(vec![checksum(
            ActionType::CleanTLSCACertificate,
            old.clone(),
            "Clean CA from truststore",
        )]),
        None => Plan::new(),
    }
}

/// Server keyfiles close to expiry are dropped and reloaded, one member
/// at a time
pub(super) fn keyfile_renewal(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.tls {
        return Plan::new();
    }
    let expiring = ctx
        .status
        .members
        .iter()
        .filter(|(g, m)| g.is_arangod() && m.phase == MemberPhase::Created)
        .find(|(g, m)| {
            let name = keyfile_secret_name(ctx.deployment, *g, &m.id);
            let Some(keyfile) = secret_value(ctx.inspector, &name, SECRET_KEY_TLS_KEYFILE) else {
                return false;
            };
            certificate_expires_within(&keyfile, CA_RENEWAL_WINDOW, ctx.now).unwrap_or_else(|e| {
                warn!(secret = %name, error = %e, "unable to read keyfile certificate");
                false
            })
        });
    let Some((group, member)) = expiring else {
        return Plan::new();
    };
    debug!(group = %group, member_id = %member.id, "renewing server keyfile");
    Plan::from(vec![
        PlanAction::for_member(
            ActionType::CleanTLSKeyfileCertificate,
            group,
            member,
            "Remove server keyfile and enforce renewal",
        ),
        PlanAction::for_member(
            ActionType::RefreshTLSKeyfileCertificate,
            group,
            member,
            "Renew member keyfile",
        ),
    ])
}

/// SNI certificates changed since coordinators last loaded them
pub(super) fn sni(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.tls || ctx.spec.tls.sni.is_none() {
        return Plan::new();
    }
    let Some(fingerprint) = sni_fingerprint(ctx.spec, ctx.inspector) else {
        return Plan::new();
    };
    if ctx.status.hashes.sni == fingerprint {
        return Plan::new();
    }
    let groups = [ServerGroup::Coordinators, ServerGroup::Single];
    let refresh: Vec<PlanAction> = ctx
        .status
        .members
        .iter_groups(&groups)
        .filter(|(_, m)| m.phase == MemberPhase::Created)
        .map(|(g, m)| PlanAction::for_member(ActionType::UpdateTLSSNI, g, m, "SNI certificates changed"))
        .collect();
    Plan::from(refresh).after([checksum(
        ActionType::TLSKeyStatusUpdate,
        fingerprint,
        "Record SNI fingerprint",
    )])
}

/// Raise the TLS propagated flag once nothing else is pending
pub(super) fn tls_status_propagated(ctx: &PlanContext<'_>) -> Plan {
    if !ctx.preconditions.tls || ctx.status.hashes.tls.propagated {
        return Plan::new();
    }
    Plan::from(vec![propagated(ActionType::TLSPropagated, true)])
}
