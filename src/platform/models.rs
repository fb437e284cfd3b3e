use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A plaintext secret as returned by the raw secrets endpoints
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Secret {
    #[serde(alias = "_id")]
    pub id: String,

    #[serde(rename = "secretKey")]
    pub key: String,

    #[serde(rename = "secretValue", default)]
    pub value: String,

    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(rename = "secretPath", default)]
    pub path: Option<String>,

    /// Id of the project holding the secret
    #[serde(default)]
    pub workspace: String,
}

/// How a project is addressed when listing secrets
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProjectSelector {
    Id(String),
    Slug(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListSecretsRequest {
    pub project: ProjectSelector,
    pub environment: String,
    pub secret_path: String,
    pub recursive: bool,
    pub include_imports: bool,
    pub expand_references: bool,
}

/// Folder a secret is written to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretTarget {
    pub project_id: String,
    pub environment: String,
    pub secret_path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Project {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub slug: String,
}

/// Location of a dynamic secret template
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseScope {
    pub project_slug: String,
    pub environment_slug: String,
    pub path: String,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateLeaseRequest {
    pub dynamic_secret_name: String,
    #[serde(flatten)]
    pub scope: LeaseScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub id: String,
    #[serde(default)]
    pub version: i64,
    pub expire_at: DateTime<Utc>,
}

/// The dynamic secret template a lease was issued from
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSecretTemplate {
    pub id: String,
    #[serde(default, rename = "maxTTL")]
    pub max_ttl: Option<String>,
    #[serde(default, rename = "defaultTTL")]
    pub default_ttl: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatedLease {
    pub lease: Lease,
    pub dynamic_secret: DynamicSecretTemplate,
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl CreatedLease {
    /// Lease credentials as strings, non-string values are JSON encoded
    pub fn string_data(&self) -> BTreeMap<String, String> {
        self.data
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// Token issued by any machine identity login or renewal
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineIdentityToken {
    pub access_token: String,
    /// Seconds until expiry
    #[serde(default)]
    pub expires_in: u64,
    /// Seconds after issuance past which the token cannot be renewed
    #[serde(default, rename = "accessTokenMaxTTL")]
    pub access_token_max_ttl: u64,
}

/// A secret import as returned alongside listed secrets
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImportedSecrets {
    #[serde(default)]
    pub secrets: Vec<Secret>,
}

#[derive(Deserialize, Clone, Debug)]
pub(crate) struct ListSecretsResponse {
    #[serde(default)]
    pub secrets: Vec<Secret>,
    #[serde(default)]
    pub imports: Vec<ImportedSecrets>,
}

/// Details of a deprecated service token
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTokenDetails {
    /// Project the token grants access to
    pub workspace: String,

    /// Project key wrapped with the secret part of the token
    pub encrypted_key: String,
    pub iv: String,
    pub tag: String,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountKey {
    #[serde(alias = "_id")]
    pub id: String,
    pub encrypted_key: String,
    pub nonce: String,
    #[serde(default)]
    pub sender: String,
    pub workspace: String,
}

/// A secret encrypted with the project key, returned to deprecated credentials
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedSecret {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub secret_key_ciphertext: String,
    #[serde(rename = "secretKeyIV")]
    pub secret_key_iv: String,
    pub secret_key_tag: String,
    pub secret_value_ciphertext: String,
    #[serde(rename = "secretValueIV")]
    pub secret_value_iv: String,
    pub secret_value_tag: String,
}

/// Fold imported secrets into the listed ones.
///
/// Secrets defined directly win; among imports the last import wins.
pub(crate) fn merge_imports(mut secrets: Vec<Secret>, imports: Vec<ImportedSecrets>) -> Vec<Secret> {
    let mut seen: std::collections::HashSet<String> =
        secrets.iter().map(|s| s.key.clone()).collect();

    for import in imports.into_iter().rev() {
        for secret in import.secrets {
            if seen.insert(secret.key.clone()) {
                secrets.push(secret);
            }
        }
    }

    secrets
}
