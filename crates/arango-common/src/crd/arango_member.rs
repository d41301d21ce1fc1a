//! ArangoMember custom resource
//!
//! One ArangoMember exists per deployment member. Its spec carries the
//! checksum of the pod template the member should run; its status carries
//! the checksum of the template the running pod was created from. A
//! mismatch between the two is what drives rotation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::member::ServerGroup;

/// Desired state of one member
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "database.arangodb.com",
    version = "v1",
    kind = "ArangoMember",
    plural = "arangomembers",
    status = "ArangoMemberStatus",
    namespaced,
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deploymentName"}"#,
    printcolumn = r#"{"name":"Group","type":"string","jsonPath":".spec.group"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ArangoMemberSpec {
    /// Owning deployment
    pub deployment_name: String,

    /// Group of the member
    pub group: ServerGroup,

    /// Member ID
    pub id: String,

    /// Checksum of the desired pod template
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_checksum: String,

    /// Higher values are removed first when the group scales down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_priority: Option<i32>,
}

/// Observed state of one member
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArangoMemberStatus {
    /// Checksum of the template the running pod was created from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_checksum: String,
}

impl ArangoMember {
    /// Returns true if the running pod lags behind the desired template
    pub fn template_changed(&self) -> bool {
        let applied = self
            .status
            .as_ref()
            .map(|s| s.template_checksum.as_str())
            .unwrap_or_default();
        !self.spec.template_checksum.is_empty() && self.spec.template_checksum != applied
    }

    /// Deletion priority, zero when unset
    pub fn deletion_priority(&self) -> i32 {
        self.spec.deletion_priority.unwrap_or(0)
    }
}
