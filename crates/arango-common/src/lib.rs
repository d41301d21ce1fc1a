//! Common types for the ArangoDB operator: CRDs, errors, events and metrics

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for server-side apply and status writes
pub const FIELD_MANAGER: &str = "arango-deployment-operator";

/// Label key carrying the owning deployment name on member resources
pub const DEPLOYMENT_LABEL_KEY: &str = "arango_deployment";

/// Label key carrying the server group role on member resources
pub const ROLE_LABEL_KEY: &str = "role";

/// Pod annotation requesting that a member be replaced
pub const POD_REPLACE_ANNOTATION: &str = "deployment.arangodb.com/replace";

/// Secret data key holding a JWT token
pub const SECRET_KEY_TOKEN: &str = "token";

/// Secret data key holding an encryption key
pub const SECRET_KEY_ENCRYPTION: &str = "key";

/// Secret data key holding the active JWT in the JWT folder secret
pub const ACTIVE_JWT_KEY: &str = "-";

/// Secret data key holding a CA certificate
pub const SECRET_KEY_CA_CERTIFICATE: &str = "ca.crt";

/// Secret data key holding a license key
pub const SECRET_KEY_LICENSE: &str = "license";
