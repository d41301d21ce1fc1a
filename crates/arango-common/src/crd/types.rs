//! Supporting types shared by the deployment CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Well-known condition types on deployments and members
///
/// Conditions double as user-visible status and as internal convergence
/// markers read back by the plan builder.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionType {
    /// Member pod is ready
    Ready,
    /// Member became ready at least once
    Started,
    /// Member core containers are running
    Serving,
    /// Member pod got scheduled
    Scheduled,
    /// Member pod is terminating
    Terminating,
    /// Member pod terminated
    Terminated,
    /// Member was cleaned out (all shards moved away)
    CleanedOut,
    /// Member is going to be replaced
    MarkedToRemove,
    /// Member must be restarted now
    Restart,
    /// Member must be restarted once the group allows it
    PendingRestart,
    /// Member template changed and can be updated in place
    PendingUpdate,
    /// Member is being updated in place
    Updating,
    /// In-place update of the member failed
    UpdateFailed,
    /// Member TLS certificate must be rotated
    PendingTLSRotation,
    /// Member pod cannot be scheduled because of its volume
    MemberVolumeUnschedulable,
    /// Deployment bootstrap finished
    BootstrapCompleted,
    /// Agency maintenance mode is enabled
    MaintenanceMode,
    /// Deployment is upgrading
    UpgradeInProgress,
    /// Deployment is reconciled with the spec
    UpToDate,
}

impl ConditionType {
    /// Name used for the condition type in status and action params
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Started => "Started",
            Self::Serving => "Serving",
            Self::Scheduled => "Scheduled",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::CleanedOut => "CleanedOut",
            Self::MarkedToRemove => "MarkedToRemove",
            Self::Restart => "Restart",
            Self::PendingRestart => "PendingRestart",
            Self::PendingUpdate => "PendingUpdate",
            Self::Updating => "Updating",
            Self::UpdateFailed => "UpdateFailed",
            Self::PendingTLSRotation => "PendingTLSRotation",
            Self::MemberVolumeUnschedulable => "MemberVolumeUnschedulable",
            Self::BootstrapCompleted => "BootstrapCompleted",
            Self::MaintenanceMode => "MaintenanceMode",
            Self::UpgradeInProgress => "UpgradeInProgress",
            Self::UpToDate => "UpToDate",
        }
    }

    /// Every known condition type
    pub const ALL: &'static [ConditionType] = &[
        Self::Ready,
        Self::Started,
        Self::Serving,
        Self::Scheduled,
        Self::Terminating,
        Self::Terminated,
        Self::CleanedOut,
        Self::MarkedToRemove,
        Self::Restart,
        Self::PendingRestart,
        Self::PendingUpdate,
        Self::Updating,
        Self::UpdateFailed,
        Self::PendingTLSRotation,
        Self::MemberVolumeUnschedulable,
        Self::BootstrapCompleted,
        Self::MaintenanceMode,
        Self::UpgradeInProgress,
        Self::UpToDate,
    ];
}

impl std::str::FromStr for ConditionType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .cloned()
            .ok_or_else(|| crate::Error::validation(format!("invalid condition type: {s}")))
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// A single status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Checksum of the input this condition was computed from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,

    /// Last time the status flipped
    pub last_transition_time: DateTime<Utc>,

    /// Last time the condition was written
    pub last_update_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition stamped with the current time
    pub fn new(
        type_: ConditionType,
        status: impl Into<ConditionStatus>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            type_,
            status: status.into(),
            reason: reason.into(),
            message: message.into(),
            hash: String::new(),
            last_transition_time: now,
            last_update_time: now,
        }
    }

    /// Returns true if the condition status is True
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Ordered list of conditions, unique by type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct ConditionList(pub Vec<Condition>);

impl ConditionList {
    /// Returns true if the list holds no conditions
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up a condition by type
    pub fn get(&self, type_: &ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| &c.type_ == type_)
    }

    /// Returns true if the condition exists and is True
    pub fn is_true(&self, type_: &ConditionType) -> bool {
        self.get(type_).map(Condition::is_true).unwrap_or(false)
    }

    /// Insert or update a condition
    ///
    /// Returns true when anything observable changed. The transition time
    /// only moves when the status flips.
    pub fn update(
        &mut self,
        type_: ConditionType,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
        hash: impl Into<String>,
    ) -> bool {
        let reason = reason.into();
        let message = message.into();
        let hash = hash.into();
        let status = ConditionStatus::from(status);
        let now = Utc::now();

        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                    && existing.hash == hash
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
                existing.hash = hash;
                existing.last_update_time = now;
                true
            }
            None => {
                self.0.push(Condition {
                    type_,
                    status,
                    reason,
                    message,
                    hash,
                    last_transition_time: now,
                    last_update_time: now,
                });
                true
            }
        }
    }

    /// Remove a condition, returning true if it was present
    pub fn remove(&mut self, type_: &ConditionType) -> bool {
        let before = self.0.len();
        self.0.retain(|c| &c.type_ != type_);
        before != self.0.len()
    }

    /// Iterate over the conditions
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }
}

/// Parse a Kubernetes quantity into bytes
///
/// Supports the binary (`Ki`..`Ei`) and decimal (`k`..`E`) suffixes used
/// for volume sizes. Returns None for anything else.
pub fn quantity_to_bytes(q: &str) -> Option<i128> {
    let q = q.trim();
    let split = q
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(q.len());
    let (number, suffix) = q.split_at(split);
    let multiplier: i128 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => return None,
    };
    if let Ok(whole) = number.parse::<i128>() {
        return Some(whole * multiplier);
    }
    number
        .parse::<f64>()
        .ok()
        .map(|f| (f * multiplier as f64) as i128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn condition_update_reports_changes_only() {
        let mut list = ConditionList::default();
        assert!(list.update(ConditionType::CleanedOut, true, "CleanOut", "", ""));
        assert!(!list.update(ConditionType::CleanedOut, true, "CleanOut", "", ""));
        assert!(list.is_true(&ConditionType::CleanedOut));

        let first_transition = list
            .get(&ConditionType::CleanedOut)
            .map(|c| c.last_transition_time);
        assert!(list.update(ConditionType::CleanedOut, true, "CleanOut", "", "abc"));
        assert_eq!(
            list.get(&ConditionType::CleanedOut)
                .map(|c| c.last_transition_time),
            first_transition
        );

        assert!(list.update(ConditionType::CleanedOut, false, "Reverted", "", "abc"));
        assert!(!list.is_true(&ConditionType::CleanedOut));
    }

    #[test]
    fn condition_remove() {
        let mut list = ConditionList::default();
        list.update(ConditionType::Restart, true, "", "", "");
        assert!(list.remove(&ConditionType::Restart));
        assert!(!list.remove(&ConditionType::Restart));
        assert!(list.is_empty());
    }

    #[test]
    fn condition_type_round_trips_through_name() {
        for t in ConditionType::ALL {
            let parsed: ConditionType = t.as_str().parse().expect("known condition");
            assert_eq!(&parsed, t);
        }
        assert!("NotACondition".parse::<ConditionType>().is_err());
    }

    #[test]
    fn condition_serializes_type_field() {
        let c = Condition::new(ConditionType::Ready, true, "PodReady", "");
        let json = serde_json::to_value(&c).expect("serialize");
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert!(json.get("message").is_none());
    }

    #[rstest]
    #[case("10Gi", Some(10 * (1 << 30)))]
    #[case("512Mi", Some(512 * (1 << 20)))]
    #[case("1G", Some(1_000_000_000))]
    #[case("1.5Gi", Some(1_610_612_736))]
    #[case("100", Some(100))]
    #[case("10Qi", None)]
    fn quantities_parse(#[case] input: &str, #[case] expected: Option<i128>) {
        assert_eq!(quantity_to_bytes(input), expected);
    }
}
