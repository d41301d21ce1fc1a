//! Key material actions for encryption at rest, JWT and TLS
//!
//! Each subsystem keeps the material servers accept in a folder secret,
//! keyed by the SHA-256 of the material. New material is added to the
//! folder first, servers reload it, and only once every member accepted it
//! is the old material removed. The `*Propagated` flags in the status gate
//! that last step.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use arango_common::crd::{
    ActionType, DeploymentSpec, DeploymentStatus, KeyHashes, MemberPhase, PlanAction, ServerGroup,
};
use arango_common::{
    Error, Result, ACTIVE_JWT_KEY, SECRET_KEY_CA_CERTIFICATE, SECRET_KEY_ENCRYPTION,
    SECRET_KEY_TOKEN,
};

use super::params::{keys, ChecksumParams, KeyParams, PlanActionParams, PropagatedParams};
use super::{entry_accessor, entry_group, Action, ActionRegistryBuilder, Progress};
use crate::context::{ActionContext, Inspector, KeyState};

/// Data key holding the server certificate and key in keyfile secrets
pub const SECRET_KEY_TLS_KEYFILE: &str = "tls.keyfile";

/// CAs expiring within this window are renewed
pub const CA_RENEWAL_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Folder secret holding every accepted encryption key
pub fn encryption_folder_name(deployment: &str) -> String {
    format!("{deployment}-encryption-folder")
}

/// Folder secret holding every accepted JWT
pub fn jwt_folder_name(deployment: &str) -> String {
    format!("{deployment}-jwt-folder")
}

/// Secret holding every trusted CA certificate
pub fn truststore_name(deployment: &str) -> String {
    format!("{deployment}-truststore")
}

/// Server keyfile secret of a member
pub fn keyfile_secret_name(deployment: &str, group: ServerGroup, member_id: &str) -> String {
    format!(
        "{deployment}-{}-{}-tls",
        group.as_role(),
        member_id.to_lowercase()
    )
}

/// Data of a secret as raw bytes
pub fn secret_data(inspector: &dyn Inspector, name: &str) -> Option<BTreeMap<String, Vec<u8>>> {
    inspector.secret(name).map(|s| {
        s.data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect()
    })
}

/// One data value of a secret
pub fn secret_value(inspector: &dyn Inspector, name: &str, key: &str) -> Option<Vec<u8>> {
    secret_data(inspector, name).and_then(|mut d| d.remove(key))
}

/// Returns true if the PEM certificate expires within `window` of `now`
pub fn certificate_expires_within(
    pem_data: &[u8],
    window: Duration,
    now: DateTime<Utc>,
) -> Result<bool> {
    let pem_obj = ::pem::parse(pem_data).map_err(|e| {
        Error::serialization_for_kind("certificate", format!("failed to parse PEM: {e}"))
    })?;
    let (_, cert) = X509Certificate::from_der(pem_obj.contents()).map_err(|e| {
        Error::serialization_for_kind("certificate", format!("failed to parse certificate: {e}"))
    })?;
    let not_after = cert.validity().not_after.timestamp();
    Ok(not_after - now.timestamp() <= window.as_secs() as i64)
}

/// Which hash block of the status an action works on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    /// Encryption at rest
    Encryption,
    /// JWT
    Jwt,
    /// TLS CA
    Tls,
}

impl KeyKind {
    fn hashes_mut(self, status: &mut DeploymentStatus) -> &mut KeyHashes {
        match self {
            Self::Encryption => &mut status.hashes.encryption,
            Self::Jwt => &mut status.hashes.jwt,
            Self::Tls => &mut status.hashes.tls,
        }
    }

    /// Hashes of the live material: active plus the sorted passive rest
    pub fn live_hashes(self, deployment: &str, ctx: &dyn ActionContext) -> Option<KeyHashes> {
        self.live_hashes_from(deployment, ctx.spec(), ctx.inspector().as_ref())
    }

    /// Same as [`KeyKind::live_hashes`] without an action context
    pub fn live_hashes_from(
        self,
        deployment: &str,
        spec: &DeploymentSpec,
        inspector: &dyn Inspector,
    ) -> Option<KeyHashes> {
        let (active, folder) = match self {
            Self::Encryption => {
                let secret = spec.encryption.key_secret_name.as_deref()?;
                let key = secret_value(inspector, secret, SECRET_KEY_ENCRYPTION)?;
                let folder = secret_data(inspector, &encryption_folder_name(deployment))
                    .unwrap_or_default();
                (sha256_hex(&key), folder)
            }
            Self::Jwt => {
                let folder = secret_data(inspector, &jwt_folder_name(deployment))?;
                let active = folder.get(ACTIVE_JWT_KEY)?;
                (sha256_hex(active), folder)
            }
            Self::Tls => {
                let ca = secret_value(
                    inspector,
                    &spec.tls.ca_secret_name(deployment),
                    SECRET_KEY_CA_CERTIFICATE,
                )?;
                let folder =
                    secret_data(inspector, &truststore_name(deployment)).unwrap_or_default();
                (sha256_hex(&ca), folder)
            }
        };
        let passive = folder
            .keys()
            .filter(|k| k.as_str() != ACTIVE_JWT_KEY && **k != active)
            .cloned()
            .collect();
        Some(KeyHashes {
            active,
            passive,
            propagated: false,
        })
    }
}

/// Fingerprint over the keyfiles of every SNI secret, None without SNI
pub fn sni_fingerprint(spec: &DeploymentSpec, inspector: &dyn Inspector) -> Option<String> {
    let sni = spec.tls.sni.as_ref()?;
    let hashes: Vec<String> = sni
        .mapping
        .keys()
        .filter_map(|secret| secret_value(inspector, secret, SECRET_KEY_TLS_KEYFILE))
        .map(|k| sha256_hex(&k))
        .collect();
    if hashes.is_empty() {
        return None;
    }
    Some(sha256_hex(hashes.join(",").as_bytes()))
}

pub(super) fn register(builder: &mut ActionRegistryBuilder, grace: Duration) {
    builder
        .register(ActionType::EncryptionKeyAdd, encryption_key_add)
        .register(ActionType::EncryptionKeyRemove, encryption_key_remove)
        .register_with_grace(ActionType::EncryptionKeyRefresh, encryption_key_refresh, grace)
        .register(ActionType::EncryptionKeyStatusUpdate, encryption_status_update)
        .register(ActionType::EncryptionKeyPropagated, encryption_propagated)
        .register(ActionType::JWTStatusUpdate, jwt_status_update)
        .register(ActionType::JWTSetActive, jwt_set_active)
        .register(ActionType::JWTAdd, jwt_add)
        .register(ActionType::JWTClean, jwt_clean)
        .register_with_grace(ActionType::JWTRefresh, jwt_refresh, grace)
        .register(ActionType::JWTPropagated, jwt_propagated)
        .register(ActionType::TLSKeyStatusUpdate, tls_status_update)
        .register(ActionType::RenewTLSCACertificate, renew_tls_ca)
        .register(ActionType::AppendTLSCACertificate, append_tls_ca)
        .register(ActionType::CleanTLSCACertificate, clean_tls_ca)
        .register(ActionType::CleanTLSKeyfileCertificate, clean_tls_keyfile)
        .register_with_grace(
            ActionType::RefreshTLSKeyfileCertificate,
            refresh_tls_keyfile,
            grace,
        )
        .register_with_grace(ActionType::UpdateTLSSNI, update_tls_sni, grace)
        .register(ActionType::TLSPropagated, tls_propagated);
}

fn encryption_key_add(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(EncryptionKeyAdd { entry }))
}

fn encryption_key_remove(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(EncryptionKeyRemove { entry, params }))
}

fn encryption_key_refresh(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(KeyRefresh {
        entry,
        kind: KeyKind::Encryption,
    }))
}

fn jwt_refresh(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(KeyRefresh {
        entry,
        kind: KeyKind::Jwt,
    }))
}

fn encryption_status_update(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(StatusUpdate {
        entry,
        kind: KeyKind::Encryption,
        sni: None,
    }))
}

fn jwt_status_update(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(StatusUpdate {
        entry,
        kind: KeyKind::Jwt,
        sni: None,
    }))
}

fn tls_status_update(entry: PlanAction) -> Result<Box<dyn Action>> {
    // A checksum records the SNI fingerprint the coordinators just loaded.
    let sni = entry.param(keys::CHECKSUM).map(str::to_string);
    Ok(Box::new(StatusUpdate {
        entry,
        kind: KeyKind::Tls,
        sni,
    }))
}

fn encryption_propagated(entry: PlanAction) -> Result<Box<dyn Action>> {
    propagated(entry, KeyKind::Encryption)
}

fn jwt_propagated(entry: PlanAction) -> Result<Box<dyn Action>> {
    propagated(entry, KeyKind::Jwt)
}

fn tls_propagated(entry: PlanAction) -> Result<Box<dyn Action>> {
    propagated(entry, KeyKind::Tls)
}

fn propagated(entry: PlanAction, kind: KeyKind) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(Propagated {
        entry,
        params,
        kind,
    }))
}

fn jwt_set_active(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(JwtSetActive { entry, params }))
}

fn jwt_add(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(JwtAdd { entry, params }))
}

fn jwt_clean(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(JwtClean { entry, params }))
}

fn renew_tls_ca(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(RenewTlsCa { entry }))
}

fn append_tls_ca(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(AppendTlsCa { entry, params }))
}

fn clean_tls_ca(entry: PlanAction) -> Result<Box<dyn Action>> {
    let params = entry.params_as()?;
    Ok(Box::new(CleanTlsCa { entry, params }))
}

fn clean_tls_keyfile(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(CleanTlsKeyfile { entry }))
}

fn refresh_tls_keyfile(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(RefreshTlsKeyfile { entry }))
}

fn update_tls_sni(entry: PlanAction) -> Result<Box<dyn Action>> {
    Ok(Box::new(UpdateTlsSni { entry }))
}

// =============================================================================
// Encryption
// =============================================================================

struct EncryptionKeyAdd {
    entry: PlanAction,
}

#[async_trait]
impl Action for EncryptionKeyAdd {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let Some(secret) = ctx.spec().encryption.key_secret_name.clone() else {
            debug!("encryption disabled");
            return Ok(true);
        };
        let inspector = ctx.inspector();
        let key = secret_value(inspector.as_ref(), &secret, SECRET_KEY_ENCRYPTION).ok_or_else(
            || Error::action_failed("EncryptionKeyAdd", format!("secret {secret} has no key")),
        )?;
        let checksum = sha256_hex(&key);
        let folder = encryption_folder_name(ctx.deployment_name());
        if secret_value(inspector.as_ref(), &folder, &checksum).is_some() {
            return Ok(true);
        }
        info!(folder = %folder, checksum = %checksum, "adding encryption key");
        ctx.patch_secret(&folder, BTreeMap::from([(checksum, key)]), Vec::new())
            .await?;
        Ok(true)
    }

    fn reload_cached_status(&self) -> bool {
        true
    }
}

struct EncryptionKeyRemove {
    entry: PlanAction,
    params: KeyParams,
}

#[async_trait]
impl Action for EncryptionKeyRemove {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let folder = encryption_folder_name(ctx.deployment_name());
        if secret_value(ctx.inspector().as_ref(), &folder, &self.params.key).is_none() {
            return Ok(true);
        }
        info!(folder = %folder, key = %self.params.key, "removing encryption key");
        ctx.patch_secret(&folder, BTreeMap::new(), vec![self.params.key.clone()])
            .await?;
        Ok(true)
    }

    fn reload_cached_status(&self) -> bool {
        true
    }
}

// =============================================================================
// Shared
// =============================================================================

/// Makes every running server reload its keys and waits until all of them
/// report the folder content
struct KeyRefresh {
    entry: PlanAction,
    kind: KeyKind,
}

#[async_trait]
impl Action for KeyRefresh {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        Ok(self.check_progress(ctx).await? == Progress::Ready)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let Some(expected) = self.kind.live_hashes(ctx.deployment_name(), ctx) else {
            return Ok(Progress::Ready);
        };
        let status = ctx.status().await?;
        let mut all = true;
        for (group, member) in status.members.iter() {
            if !group.is_arangod() || member.phase != MemberPhase::Created {
                continue;
            }
            let state = match ctx.server(group, &member.id) {
                Ok(server) => match self.kind {
                    KeyKind::Jwt => server.reload_jwt().await,
                    _ => server.reload_encryption().await,
                },
                Err(e) => Err(e),
            };
            match state {
                Ok(state) if accepts(&state, &expected) => {}
                Ok(_) => {
                    debug!(member_id = %member.id, kind = ?self.kind, "member has not picked up keys");
                    all = false;
                }
                Err(e) => {
                    debug!(member_id = %member.id, error = %e, "key reload failed");
                    all = false;
                }
            }
        }
        Ok(if all { Progress::Ready } else { Progress::Wait })
    }
}

fn accepts(state: &KeyState, expected: &KeyHashes) -> bool {
    let accepted: BTreeSet<&str> = state.accepted.iter().map(String::as_str).collect();
    state.active == expected.active
        && expected
            .passive
            .iter()
            .all(|k| accepted.contains(k.as_str()))
}

/// Records the live key hashes in the status, keeping the propagated flag
struct StatusUpdate {
    entry: PlanAction,
    kind: KeyKind,
    sni: Option<String>,
}

#[async_trait]
impl Action for StatusUpdate {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let live = self
            .kind
            .live_hashes(ctx.deployment_name(), ctx)
            .unwrap_or_default();
        let kind = self.kind;
        let sni = self.sni.clone();
        ctx.mutate_status(Box::new(move |s| {
            let mut changed = false;
            if let Some(sni) = &sni {
                if s.hashes.sni != *sni {
                    s.hashes.sni = sni.clone();
                    changed = true;
                }
            }
            let hashes = kind.hashes_mut(s);
            if hashes.active == live.active && hashes.passive == live.passive {
                return changed;
            }
            hashes.active = live.active.clone();
            hashes.passive = live.passive.clone();
            true
        }))
        .await?;
        Ok(true)
    }
}

struct Propagated {
    entry: PlanAction,
    params: PropagatedParams,
    kind: KeyKind,
}

#[async_trait]
impl Action for Propagated {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let kind = self.kind;
        let value = self.params.propagated;
        ctx.mutate_status(Box::new(move |s| {
            let hashes = kind.hashes_mut(s);
            if hashes.propagated == value {
                return false;
            }
            hashes.propagated = value;
            true
        }))
        .await?;
        Ok(true)
    }
}

// =============================================================================
// JWT
// =============================================================================

/// Copies the spec token into the folder
struct JwtAdd {
    entry: PlanAction,
    params: ChecksumParams,
}

#[async_trait]
impl Action for JwtAdd {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let secret = ctx.spec().authentication.jwt_secret_name(ctx.deployment_name());
        let inspector = ctx.inspector();
        let Some(token) = secret_value(inspector.as_ref(), &secret, SECRET_KEY_TOKEN) else {
            return Err(Error::action_failed(
                "JWTAdd",
                format!("secret {secret} has no token"),
            ));
        };
        let checksum = sha256_hex(&token);
        if checksum != self.params.checksum {
            warn!(expected = %self.params.checksum, actual = %checksum, "JWT changed since planning");
            return Ok(true);
        }
        let folder = jwt_folder_name(ctx.deployment_name());
        let mut insert = BTreeMap::new();
        match secret_data(inspector.as_ref(), &folder) {
            Some(data) if data.contains_key(&checksum) => return Ok(true),
            // A fresh folder starts with the token active.
            None => {
                insert.insert(ACTIVE_JWT_KEY.to_string(), token.clone());
            }
            Some(_) => {}
        }
        insert.insert(checksum, token);
        ctx.patch_secret(&folder, insert, Vec::new()).await?;
        Ok(true)
    }

    fn reload_cached_status(&self) -> bool {
        true
    }
}

/// Makes a folder token the active one
struct JwtSetActive {
    entry: PlanAction,
    params: ChecksumParams,
}

#[async_trait]
impl Action for JwtSetActive {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let folder = jwt_folder_name(ctx.deployment_name());
        let data = secret_data(ctx.inspector().as_ref(), &folder).unwrap_or_default();
        let Some(token) = data.get(&self.params.checksum) else {
            warn!(checksum = %self.params.checksum, "token to activate is not in the folder");
            return Ok(true);
        };
        if data.get(ACTIVE_JWT_KEY) == Some(token) {
            return Ok(true);
        }
        info!(checksum = %self.params.checksum, "activating JWT");
        ctx.patch_secret(
            &folder,
            BTreeMap::from([(ACTIVE_JWT_KEY.to_string(), token.clone())]),
            Vec::new(),
        )
        .await?;
        Ok(true)
    }

    fn reload_cached_status(&self) -> bool {
        true
    }
}

/// Removes a passive token from the folder
struct JwtClean {
    entry: PlanAction,
    params: ChecksumParams,
}

#[async_trait]
impl Action for JwtClean {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let folder = jwt_folder_name(ctx.deployment_name());
        let data = secret_data(ctx.inspector().as_ref(), &folder).unwrap_or_default();
        let Some(token) = data.get(&self.params.checksum) else {
            return Ok(true);
        };
        if data.get(ACTIVE_JWT_KEY) == Some(token) {
            warn!(checksum = %self.params.checksum, "refusing to remove the active JWT");
            return Ok(true);
        }
        ctx.patch_secret(&folder, BTreeMap::new(), vec![self.params.checksum.clone()])
            .await?;
        Ok(true)
    }

    fn reload_cached_status(&self) -> bool {
        true
    }
}

// =============================================================================
// TLS
// =============================================================================

/// Deletes an expiring CA so that a new one gets generated
struct RenewTlsCa {
    entry: PlanAction,
}

#[async_trait]
impl Action for RenewTlsCa {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        if !ctx.spec().tls.is_secure() {
            return Ok(true);
        }
        let name = ctx.spec().tls.ca_secret_name(ctx.deployment_name());
        let Some(ca) = secret_value(ctx.inspector().as_ref(), &name, SECRET_KEY_CA_CERTIFICATE)
        else {
            return Ok(true);
        };
        // A CA created by a previous run of this action is fresh.
        if !certificate_expires_within(&ca, CA_RENEWAL_WINDOW, Utc::now())? {
            return Ok(true);
        }
        info!(secret = %name, "renewing expiring CA");
        ctx.delete_secret(&name).await?;
        Ok(true)
    }

    fn reload_cached_status(&self) -> bool {
        true
    }
}

/// Adds the current CA to the truststore
struct AppendTlsCa {
    entry: PlanAction,
    params: ChecksumParams,
}

#[async_trait]
impl Action for AppendTlsCa {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let name = ctx.spec().tls.ca_secret_name(ctx.deployment_name());
        let inspector = ctx.inspector();
        let Some(ca) = secret_value(inspector.as_ref(), &name, SECRET_KEY_CA_CERTIFICATE) else {
            return Ok(true);
        };
        let checksum = sha256_hex(&ca);
        if checksum != self.params.checksum {
            warn!(expected = %self.params.checksum, actual = %checksum, "CA changed since planning");
            return Ok(true);
        }
        let truststore = truststore_name(ctx.deployment_name());
        if secret_value(inspector.as_ref(), &truststore, &checksum).is_some() {
            return Ok(true);
        }
        ctx.patch_secret(&truststore, BTreeMap::from([(checksum, ca)]), Vec::new())
            .await?;
        Ok(true)
    }

    fn reload_cached_status(&self) -> bool {
        true
    }
}

/// Removes an old CA from the truststore
struct CleanTlsCa {
    entry: PlanAction,
    params: ChecksumParams,
}

#[async_trait]
impl Action for CleanTlsCa {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        let inspector = ctx.inspector();
        let ca = secret_value(
            inspector.as_ref(),
            &ctx.spec().tls.ca_secret_name(ctx.deployment_name()),
            SECRET_KEY_CA_CERTIFICATE,
        );
        if ca.map(|c| sha256_hex(&c)).as_deref() == Some(self.params.checksum.as_str()) {
            warn!(checksum = %self.params.checksum, "refusing to remove the active CA");
            return Ok(true);
        }
        let truststore = truststore_name(ctx.deployment_name());
        if secret_value(inspector.as_ref(), &truststore, &self.params.checksum).is_none() {
            return Ok(true);
        }
        ctx.patch_secret(&truststore, BTreeMap::new(), vec![self.params.checksum.clone()])
            .await?;
        Ok(true)
    }

    fn reload_cached_status(&self) -> bool {
        true
    }
}

/// Deletes a member keyfile so the next pod start issues a new one
struct CleanTlsKeyfile {
    entry: PlanAction,
}

#[async_trait]
impl Action for CleanTlsKeyfile {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        if !ctx.spec().tls.is_secure() {
            return Ok(true);
        }
        let group = entry_group(&self.entry)?;
        let name = keyfile_secret_name(ctx.deployment_name(), group, &self.entry.member_id);
        if ctx.inspector().secret(&name).is_some() {
            ctx.delete_secret(&name).await?;
        }
        Ok(true)
    }
}

/// Makes a member reload its keyfile and waits for the new one to be served
struct RefreshTlsKeyfile {
    entry: PlanAction,
}

#[async_trait]
impl Action for RefreshTlsKeyfile {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        Ok(self.check_progress(ctx).await? == Progress::Ready)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let group = entry_group(&self.entry)?;
        let name = keyfile_secret_name(ctx.deployment_name(), group, &self.entry.member_id);
        let Some(keyfile) = secret_value(ctx.inspector().as_ref(), &name, SECRET_KEY_TLS_KEYFILE)
        else {
            return Ok(Progress::Ready);
        };
        let expected = sha256_hex(&keyfile);
        let state = ctx
            .server(group, &self.entry.member_id)?
            .reload_tls()
            .await?;
        Ok(if state.active == expected {
            Progress::Ready
        } else {
            Progress::Wait
        })
    }
}

/// Makes a member reload its SNI certificates
struct UpdateTlsSni {
    entry: PlanAction,
}

#[async_trait]
impl Action for UpdateTlsSni {
    entry_accessor!();

    async fn start(&self, ctx: &dyn ActionContext) -> Result<bool> {
        Ok(self.check_progress(ctx).await? == Progress::Ready)
    }

    async fn check_progress(&self, ctx: &dyn ActionContext) -> Result<Progress> {
        let group = entry_group(&self.entry)?;
        let Some(sni) = ctx.spec().tls.sni.as_ref() else {
            return Ok(Progress::Ready);
        };
        let inspector = ctx.inspector();
        let expected: Vec<String> = sni
            .mapping
            .keys()
            .filter_map(|secret| secret_value(inspector.as_ref(), secret, SECRET_KEY_TLS_KEYFILE))
            .map(|k| sha256_hex(&k))
            .collect();
        if expected.is_empty() {
            return Ok(Progress::Ready);
        }
        let state = ctx
            .server(group, &self.entry.member_id)?
            .reload_tls()
            .await?;
        Ok(if expected.iter().all(|e| state.accepted.contains(e)) {
            Progress::Ready
        } else {
            Progress::Wait
        })
    }
}
