use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{defaults, Authentication, GeneratorKind, SecretTemplate, TlsConfig};

/// Cluster secrets and generated values pushed to the platform
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "PushedSecret",
    group = "secrets.infisical.com",
    version = "v1alpha1",
    derive = "Default",
    status = "PushedSecretStatus",
    shortname = "pushed",
    namespaced,
    printcolumn = r#"{ "name": "environment", "type": "string", "description": "destination environment", "jsonPath": ".spec.destination.environmentSlug" }"#,
    printcolumn = r#"{ "name": "path", "type": "string", "description": "destination folder", "jsonPath": ".spec.destination.secretsPath" }"#,
    printcolumn = r#"{ "name": "update", "type": "string", "description": "update policy", "jsonPath": ".spec.updatePolicy" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct PushedSecretSpec {
    /// Platform API URL, overriding the operator wide default
    #[serde(default, rename = "hostAPI")]
    pub host_api: Option<String>,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Seconds between two synchronizations
    #[serde(default = "defaults::resync_interval")]
    pub resync_interval: u64,

    /// What to do with platform secrets that already exist under a pushed key
    #[serde(default)]
    pub update_policy: UpdatePolicy,

    /// What to do with managed platform secrets once this resource is deleted
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,

    pub destination: PushDestination,

    pub push: PushSource,

    pub authentication: Authentication,
}

/// Project, environment and folder receiving the pushed secrets
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushDestination {
    #[serde(default)]
    pub project_id: Option<String>,

    /// Used to look up the project when no id is given
    #[serde(default)]
    pub project_slug: Option<String>,

    pub environment_slug: String,

    #[serde(default = "defaults::secrets_path")]
    pub secrets_path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushSource {
    /// Cluster secret whose keys are pushed
    #[serde(default)]
    pub secret: Option<PushSecretSource>,

    /// Values produced by cluster generators
    #[serde(default)]
    pub generators: Vec<GeneratorSource>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushSecretSource {
    pub secret_name: String,
    pub secret_namespace: String,

    #[serde(default)]
    pub template: Option<SecretTemplate>,
}

/// A generated value pushed under `destinationSecretName`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorSource {
    pub destination_secret_name: String,
    pub generator_ref: GeneratorRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorRef {
    pub kind: GeneratorKind,

    /// Name of the cluster scoped generator
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Never overwrite a platform secret this resource did not create
    #[default]
    None,
    /// Take over and overwrite existing platform secrets
    Replace,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum DeletionPolicy {
    #[default]
    None,
    /// Delete managed platform secrets when this resource is deleted
    Delete,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushedSecretStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Platform secret id to cluster key name, the record of which platform secrets are owned
    #[serde(default)]
    pub managed_secrets: BTreeMap<String, String>,
}

impl PushedSecretSpec {
    /// Whether this resource reads the given cluster secret
    pub fn references_secret(&self, namespace: &str, name: &str) -> bool {
        self.push
            .secret
            .as_ref()
            .is_some_and(|s| s.secret_namespace == namespace && s.secret_name == name)
    }

    /// Whether this resource uses the given cluster generator
    pub fn references_generator(&self, name: &str) -> bool {
        self.push
            .generators
            .iter()
            .any(|g| g.generator_ref.name == name)
    }
}
