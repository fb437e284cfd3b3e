use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{defaults, Authentication, CreationPolicy, TlsConfig};

/// Short lived credentials leased from a platform dynamic secret
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "DynamicSecret",
    group = "secrets.infisical.com",
    version = "v1alpha1",
    derive = "Default",
    status = "DynamicSecretStatus",
    shortname = "dynsecret",
    namespaced,
    printcolumn = r#"{ "name": "template", "type": "string", "description": "dynamic secret name", "jsonPath": ".spec.dynamicSecret.secretName" }"#,
    printcolumn = r#"{ "name": "lease", "type": "string", "description": "active lease", "jsonPath": ".status.lease.id" }"#,
    printcolumn = r#"{ "name": "expires", "type": "date", "description": "lease expiry", "jsonPath": ".status.lease.expiresAt" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSecretSpec {
    /// Platform API URL, overriding the operator wide default
    #[serde(default, rename = "hostAPI")]
    pub host_api: Option<String>,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    pub dynamic_secret: DynamicSecretSource,

    /// Requested lease duration, e.g. `30m`. The template default applies when unset.
    #[serde(default, rename = "leaseTTL")]
    pub lease_ttl: Option<String>,

    #[serde(default)]
    pub lease_revocation_policy: RevocationPolicy,

    pub managed_secret_reference: DynamicManagedSecret,

    pub authentication: Authentication,
}

/// The dynamic secret template on the platform
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSecretSource {
    pub secret_name: String,
    pub project_id: String,
    pub environment_slug: String,

    #[serde(default = "defaults::secrets_path")]
    pub secrets_path: String,
}

/// Cluster secret receiving the lease credentials
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynamicManagedSecret {
    pub secret_name: String,
    pub secret_namespace: String,

    #[serde(default = "defaults::secret_type")]
    pub secret_type: String,

    #[serde(default)]
    pub creation_policy: CreationPolicy,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum RevocationPolicy {
    #[default]
    None,
    /// Revoke the active lease when this resource is deleted
    Revoke,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSecretStatus {
    #[serde(default)]
    pub lease: Option<LeaseStatus>,

    #[serde(default)]
    pub dynamic_secret_id: Option<String>,

    /// Maximum lifetime of any lease issued by the template
    #[serde(default, rename = "maxTTL")]
    pub max_ttl: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// The single active lease
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseStatus {
    pub id: String,
    pub version: i64,
    pub expires_at: DateTime<Utc>,
    pub creation_timestamp: DateTime<Utc>,
}

impl LeaseStatus {
    /// Value of the version annotation on the projected secret
    pub fn version_annotation(&self) -> String {
        format!("{}-{}", self.id, self.version)
    }
}
