use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{defaults, KubeSecretReference, NamespacedReference};

/// Where on the platform secrets are read from
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SecretsScope {
    /// Slug of the project holding the secrets
    #[serde(default)]
    pub project_slug: String,

    /// Slug of the environment, e.g. `dev`
    pub env_slug: String,

    /// Folder path within the environment
    #[serde(default = "defaults::secrets_path")]
    pub secrets_path: String,

    /// Include secrets of every sub folder
    #[serde(default)]
    pub recursive: bool,
}

/// Machine identity authentication methods.
///
/// The first method with credentials present wins, in declaration order.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Authentication {
    pub universal_auth: Option<UniversalAuth>,
    pub kubernetes_auth: Option<KubernetesAuth>,
    pub aws_iam_auth: Option<AwsIamAuth>,
    pub azure_auth: Option<AzureAuth>,
    pub gcp_id_token_auth: Option<GcpIdTokenAuth>,
    pub gcp_iam_auth: Option<GcpIamAuth>,
}

/// Authentication methods for pulled secrets, which may also use deprecated credentials
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PullAuthentication {
    #[serde(flatten)]
    pub identity: Authentication,

    /// Deprecated service token
    pub service_token: Option<ServiceTokenAuth>,

    /// Deprecated service account key pair
    pub service_account: Option<ServiceAccountAuth>,
}

/// Client id and secret stored in a cluster secret under `clientId` and `clientSecret`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UniversalAuth {
    pub credentials_ref: KubeSecretReference,
    #[serde(default)]
    pub secrets_scope: Option<SecretsScope>,
}

/// Login with a token issued for a service account of this cluster
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesAuth {
    pub identity_id: String,
    pub service_account_ref: NamespacedReference,
    #[serde(default)]
    pub secrets_scope: Option<SecretsScope>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsIamAuth {
    pub identity_id: String,
    #[serde(default)]
    pub secrets_scope: Option<SecretsScope>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureAuth {
    pub identity_id: String,

    /// Audience requested from the instance metadata service
    #[serde(default)]
    pub resource: Option<String>,

    #[serde(default)]
    pub secrets_scope: Option<SecretsScope>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcpIdTokenAuth {
    pub identity_id: String,
    #[serde(default)]
    pub secrets_scope: Option<SecretsScope>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcpIamAuth {
    pub identity_id: String,

    /// Path to a service account key file mounted into the operator
    pub service_account_key_file_path: String,

    #[serde(default)]
    pub secrets_scope: Option<SecretsScope>,
}

/// Secret holding a service token under the `infisicalToken` key
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTokenAuth {
    pub service_token_secret_reference: KubeSecretReference,
    pub secrets_scope: SecretsScope,
}

/// Secret holding the access key and key pair of a service account
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountAuth {
    pub service_account_secret_reference: KubeSecretReference,
    pub project_id: String,
    pub environment_name: String,
}

impl SecretsScope {
    /// The folder path, falling back to the root folder
    pub fn path(&self) -> &str {
        if self.secrets_path.is_empty() {
            "/"
        } else {
            &self.secrets_path
        }
    }
}
