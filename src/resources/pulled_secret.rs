use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{defaults, CreationPolicy, PullAuthentication, SecretTemplate, TlsConfig};
use crate::{Error, Result};

/// Secrets pulled from the platform into the cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "PulledSecret",
    group = "secrets.infisical.com",
    version = "v1alpha1",
    derive = "Default",
    status = "PulledSecretStatus",
    shortname = "pulled",
    namespaced,
    printcolumn = r#"{ "name": "interval", "type": "integer", "description": "resync interval in seconds", "jsonPath": ".spec.resyncInterval" }"#,
    printcolumn = r#"{ "name": "instant", "type": "boolean", "description": "instant updates enabled", "jsonPath": ".spec.instantUpdates" }"#,
    printcolumn = r#"{ "name": "ready", "type": "string", "description": "secrets synced", "jsonPath": ".status.conditions[?(@.type==\"secrets.infisical.com/ReadyToSyncSecrets\")].status" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct PulledSecretSpec {
    /// Platform API URL, overriding the operator wide default
    #[serde(default, rename = "hostAPI")]
    pub host_api: Option<String>,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Seconds between two synchronizations
    #[serde(default = "defaults::resync_interval")]
    pub resync_interval: u64,

    /// Subscribe to platform events and resync as soon as secrets change
    #[serde(default)]
    pub instant_updates: bool,

    pub authentication: PullAuthentication,

    /// Single destination, kept for older manifests
    #[serde(default)]
    pub managed_secret_reference: Option<ManagedReference>,

    /// Destinations written with the pulled secrets
    #[serde(default)]
    pub managed_references: Vec<ManagedReference>,
}

/// A cluster resource receiving pulled secrets
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedReference {
    /// Name of the managed Secret or ConfigMap
    pub name: String,

    /// Comma separated list of namespaces to write to
    pub namespaces: String,

    #[serde(default)]
    pub kind: ManagedKind,

    /// Secret type, ignored for config maps
    #[serde(default = "defaults::secret_type")]
    pub secret_type: String,

    #[serde(default)]
    pub creation_policy: CreationPolicy,

    #[serde(default)]
    pub template: Option<SecretTemplate>,
}

/// Kind of cluster resource written for a destination
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
pub enum ManagedKind {
    #[default]
    Secret,
    ConfigMap,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PulledSecretStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl PulledSecretSpec {
    /// All destinations, treating the single legacy destination as a list of one
    pub fn destinations(&self) -> Result<Vec<&ManagedReference>> {
        match (&self.managed_secret_reference, self.managed_references.as_slice()) {
            (Some(_), [_, ..]) => Err(Error::IllegalResource(
                "managedSecretReference".into(),
                "cannot be combined with managedReferences".into(),
            )),
            (Some(single), []) => Ok(vec![single]),
            (None, []) => Err(Error::IllegalResource(
                "managedReferences".into(),
                "at least one destination is required".into(),
            )),
            (None, many) => Ok(many.iter().collect()),
        }
    }
}

impl ManagedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedKind::Secret => "Secret",
            ManagedKind::ConfigMap => "ConfigMap",
        }
    }
}
