//! Typed action parameters
//!
//! Plans persist parameters as a flat string map so that entries survive
//! operator upgrades. Actions and builders never touch that map directly;
//! they go through the structs below, which own the key names.

use std::collections::BTreeMap;

use arango_common::crd::{ConditionType, MemberPhase, PlanAction};
use arango_common::{Error, Result};

/// Persisted parameter keys
pub mod keys {
    /// Checksum of key material or a template
    pub const CHECKSUM: &str = "checksum";
    /// Target value of a propagated flag
    pub const PROPAGATED: &str = "propagated";
    /// Key identifier inside a key folder
    pub const KEY: &str = "key";
    /// Target member phase
    pub const PHASE: &str = "phase";
    /// User name
    pub const USER: &str = "user";
    /// Backup ID
    pub const BACKUP: &str = "backup";
    /// AddMember follow-up: wait until the member is up
    pub const WAIT_FOR_MEMBER_UP: &str = "WaitForMemberUp";
    /// AddMember follow-up: wait until the member shards are in sync
    pub const WAIT_FOR_MEMBER_IN_SYNC: &str = "WaitForMemberInSync";
}

/// Conversion between a typed parameter struct and the persisted map
pub trait ActionParams: Sized {
    /// Parse from the persisted map
    fn read(params: &BTreeMap<String, String>) -> Result<Self>;

    /// Write into the persisted map
    fn write(&self, params: &mut BTreeMap<String, String>);
}

/// Typed parameter access on plan entries
pub trait PlanActionParams {
    /// Attach typed parameters
    fn with_params<P: ActionParams>(self, params: &P) -> Self;

    /// Parse typed parameters
    fn params_as<P: ActionParams>(&self) -> Result<P>;
}

impl PlanActionParams for PlanAction {
    fn with_params<P: ActionParams>(mut self, params: &P) -> Self {
        params.write(&mut self.params);
        self
    }

    fn params_as<P: ActionParams>(&self) -> Result<P> {
        P::read(&self.params).map_err(|e| match e {
            Error::Validation { message, .. } => Error::validation(format!(
                "{} {}: {}",
                self.type_, self.id, message
            )),
            other => other,
        })
    }
}

fn required<'a>(params: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::validation(format!("missing parameter {key}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::validation(format!(
            "parameter {key} must be true or false, got {other}"
        ))),
    }
}

/// Follow-up waits of AddMember; each key gates only its own wait
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddMemberParams {
    /// Append WaitForMemberUp
    pub wait_for_up: bool,
    /// Append WaitForMemberInSync
    pub wait_for_sync: bool,
}

impl ActionParams for AddMemberParams {
    fn read(params: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            wait_for_up: params.contains_key(keys::WAIT_FOR_MEMBER_UP),
            wait_for_sync: params.contains_key(keys::WAIT_FOR_MEMBER_IN_SYNC),
        })
    }

    fn write(&self, params: &mut BTreeMap<String, String>) {
        if self.wait_for_up {
            params.insert(keys::WAIT_FOR_MEMBER_UP.to_string(), String::new());
        }
        if self.wait_for_sync {
            params.insert(keys::WAIT_FOR_MEMBER_IN_SYNC.to_string(), String::new());
        }
    }
}

/// Target of a `*Propagated` action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropagatedParams {
    /// Flag value to store
    pub propagated: bool,
}

impl ActionParams for PropagatedParams {
    fn read(params: &BTreeMap<String, String>) -> Result<Self> {
        let value = required(params, keys::PROPAGATED)?;
        Ok(Self {
            propagated: parse_bool(keys::PROPAGATED, value)?,
        })
    }

    fn write(&self, params: &mut BTreeMap<String, String>) {
        params.insert(keys::PROPAGATED.to_string(), self.propagated.to_string());
    }
}

/// A checksum identifying key material
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumParams {
    /// Lowercase hex checksum
    pub checksum: String,
}

impl ActionParams for ChecksumParams {
    fn read(params: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            checksum: required(params, keys::CHECKSUM)?.to_string(),
        })
    }

    fn write(&self, params: &mut BTreeMap<String, String>) {
        params.insert(keys::CHECKSUM.to_string(), self.checksum.clone());
    }
}

/// A key inside a key folder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyParams {
    /// Key identifier
    pub key: String,
}

impl ActionParams for KeyParams {
    fn read(params: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            key: required(params, keys::KEY)?.to_string(),
        })
    }

    fn write(&self, params: &mut BTreeMap<String, String>) {
        params.insert(keys::KEY.to_string(), self.key.clone());
    }
}

/// Target phase of MemberPhaseUpdate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseParams {
    /// Phase to set
    pub phase: MemberPhase,
}

impl ActionParams for PhaseParams {
    fn read(params: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            phase: required(params, keys::PHASE)?.parse()?,
        })
    }

    fn write(&self, params: &mut BTreeMap<String, String>) {
        params.insert(keys::PHASE.to_string(), self.phase.to_string());
    }
}

/// Condition changes of SetCondition and SetMemberCondition
///
/// `Some(value)` sets the condition, `None` removes it. Persisted as the
/// condition name mapped to `true`, `false` or an empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConditionParams {
    /// Changes by condition type
    pub changes: BTreeMap<ConditionType, Option<bool>>,
}

impl ConditionParams {
    /// Set a condition
    pub fn set(mut self, type_: ConditionType, value: bool) -> Self {
        self.changes.insert(type_, Some(value));
        self
    }

    /// Remove a condition
    pub fn remove(mut self, type_: ConditionType) -> Self {
        self.changes.insert(type_, None);
        self
    }
}

impl ActionParams for ConditionParams {
    fn read(params: &BTreeMap<String, String>) -> Result<Self> {
        let mut changes = BTreeMap::new();
        for (key, value) in params {
            let type_: ConditionType = key.parse()?;
            let change = match value.as_str() {
                "" => None,
                other => Some(parse_bool(key, other)?),
            };
            changes.insert(type_, change);
        }
        Ok(Self { changes })
    }

    fn write(&self, params: &mut BTreeMap<String, String>) {
        for (type_, change) in &self.changes {
            let value = change.map(|v| v.to_string()).unwrap_or_default();
            params.insert(type_.as_str().to_string(), value);
        }
    }
}

/// User of BootstrapSetPassword
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserParams {
    /// User name
    pub user: String,
}

impl ActionParams for UserParams {
    fn read(params: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            user: required(params, keys::USER)?.to_string(),
        })
    }

    fn write(&self, params: &mut BTreeMap<String, String>) {
        params.insert(keys::USER.to_string(), self.user.clone());
    }
}

/// Backup of BackupRestore
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupParams {
    /// Backup ID
    pub backup: String,
}

impl ActionParams for BackupParams {
    fn read(params: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            backup: required(params, keys::BACKUP)?.to_string(),
        })
    }

    fn write(&self, params: &mut BTreeMap<String, String>) {
        params.insert(keys::BACKUP.to_string(), self.backup.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arango_common::crd::ActionType;

    #[test]
    fn add_member_waits_are_gated_independently() {
        let entry = PlanAction::for_cluster(ActionType::AddMember, "").with_params(
            &AddMemberParams {
                wait_for_up: false,
                wait_for_sync: true,
            },
        );
        assert!(!entry.params.contains_key(keys::WAIT_FOR_MEMBER_UP));
        let parsed: AddMemberParams = entry.params_as().expect("parse");
        assert!(!parsed.wait_for_up);
        assert!(parsed.wait_for_sync);
    }

    #[test]
    fn condition_params_use_condition_names() {
        let params = ConditionParams::default()
            .set(ConditionType::PendingRestart, true)
            .remove(ConditionType::PendingUpdate);
        let entry =
            PlanAction::for_cluster(ActionType::SetMemberCondition, "").with_params(&params);
        assert_eq!(entry.param("PendingRestart"), Some("true"));
        assert_eq!(entry.param("PendingUpdate"), Some(""));
        assert_eq!(entry.params_as::<ConditionParams>().ok(), Some(params));
    }

    #[test]
    fn malformed_params_are_validation_errors() {
        let entry = PlanAction::for_cluster(ActionType::JWTPropagated, "")
            .with_param(keys::PROPAGATED, "maybe");
        let err = entry
            .params_as::<PropagatedParams>()
            .expect_err("invalid bool");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("JWTPropagated"));

        let entry = PlanAction::for_cluster(ActionType::MemberPhaseUpdate, "");
        assert!(entry.params_as::<PhaseParams>().is_err());
    }

    #[test]
    fn phase_params_round_trip_names() {
        let entry = PlanAction::for_cluster(ActionType::MemberPhaseUpdate, "").with_params(
            &PhaseParams {
                phase: MemberPhase::Pending,
            },
        );
        assert_eq!(entry.param(keys::PHASE), Some("Pending"));
    }
}
