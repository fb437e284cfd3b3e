use std::{collections::HashMap, fmt};

use tracing::{debug, warn};

use super::{AuthContext, AuthDetails, AuthError, AuthStrategy};
use crate::{
    platform::{
        self,
        legacy::{
            decrypt_project_key, decrypt_secrets, decrypt_service_token_key, expand_references,
            referenced_folders,
        },
        ImportedSecrets, PlatformClient, Secret,
    },
    resources::{read_secret, read_secret_key, ServiceAccountAuth, ServiceTokenAuth},
    Error, Result,
};

const SERVICE_TOKEN_KEY: &str = "infisicalToken";
const SERVICE_ACCOUNT_ACCESS_KEY: &str = "serviceAccountAccessKey";
const SERVICE_ACCOUNT_PUBLIC_KEY: &str = "serviceAccountPublicKey";
const SERVICE_ACCOUNT_PRIVATE_KEY: &str = "serviceAccountPrivateKey";

/// Decrypted project key and the folder deprecated credentials read from
#[derive(Clone)]
pub struct LegacyCredentials {
    pub project_id: String,
    project_key: Vec<u8>,
    pub environment: String,
    pub secret_path: String,
    pub recursive: bool,
}

impl fmt::Debug for LegacyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyCredentials")
            .field("project_id", &self.project_id)
            .field("environment", &self.environment)
            .field("secret_path", &self.secret_path)
            .field("recursive", &self.recursive)
            .finish_non_exhaustive()
    }
}

impl LegacyCredentials {
    async fn folder(
        &self,
        platform: &PlatformClient,
        environment: &str,
        secret_path: &str,
        recursive: bool,
    ) -> platform::Result<Vec<Secret>> {
        let (own, imports) = platform
            .list_encrypted_secrets(&self.project_id, environment, secret_path, recursive)
            .await?;

        let own = decrypt_secrets(&self.project_key, &own)?;
        let imports = imports
            .iter()
            .map(|secrets| {
                Ok(ImportedSecrets {
                    secrets: decrypt_secrets(&self.project_key, secrets)?,
                })
            })
            .collect::<platform::Result<Vec<_>>>()?;
        Ok(platform::merge_imports(own, imports))
    }

    /// Fetch, decrypt and expand the secrets of the configured folder
    pub async fn fetch_secrets(&self, platform: &PlatformClient) -> platform::Result<Vec<Secret>> {
        let secrets = self
            .folder(platform, &self.environment, &self.secret_path, self.recursive)
            .await?;

        let mut remote = HashMap::new();
        for folder in referenced_folders(&secrets) {
            match self
                .folder(platform, &folder.environment, &folder.secret_path, false)
                .await
            {
                Ok(found) => {
                    let values = found.into_iter().map(|s| (s.key, s.value)).collect();
                    remote.insert(folder, values);
                }
                // Unresolvable references expand to nothing
                Err(e) => warn!(
                    environment = %folder.environment,
                    path = %folder.secret_path,
                    "unable to fetch referenced folder: {e}"
                ),
            }
        }

        Ok(expand_references(secrets, &remote))
    }
}

/// Bearer part and decryption secret of a `st.<id>.<bearer>.<secret>` token
fn split_service_token(token: &str) -> Result<(String, &str)> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() < 4 {
        return Err(AuthError::InvalidServiceToken.into());
    }
    Ok((parts[..3].join("."), parts[3]))
}

pub(super) async fn service_token(
    ctx: &AuthContext<'_>,
    block: Option<&ServiceTokenAuth>,
) -> Result<AuthDetails> {
    let strategy = AuthStrategy::ServiceToken;
    let block = block
        .filter(|b| !b.service_token_secret_reference.secret_name.is_empty())
        .ok_or_else(|| AuthError::not_configured(strategy))?;

    let token = read_secret_key(
        ctx.client.clone(),
        ctx.namespace_scope,
        &block.service_token_secret_reference,
        SERVICE_TOKEN_KEY,
    )
    .await?;
    if token.is_empty() {
        return Err(AuthError::not_configured(strategy));
    }

    let (bearer, secret) = split_service_token(&token)?;
    ctx.platform.set_static_token(bearer);

    let details = ctx.platform.service_token_details().await?;
    let project_key =
        decrypt_service_token_key(secret, &details.encrypted_key, &details.iv, &details.tag)?;
    debug!(project = %details.workspace, "service token accepted");

    let scope = &block.secrets_scope;
    Ok(AuthDetails {
        strategy,
        scope: Some(scope.clone()),
        legacy: Some(LegacyCredentials {
            project_id: details.workspace,
            project_key,
            environment: scope.env_slug.clone(),
            secret_path: scope.path().to_string(),
            recursive: scope.recursive,
        }),
    })
}

pub(super) async fn service_account(
    ctx: &AuthContext<'_>,
    block: Option<&ServiceAccountAuth>,
) -> Result<AuthDetails> {
    let strategy = AuthStrategy::ServiceAccount;
    let block = block
        .filter(|b| !b.service_account_secret_reference.secret_name.is_empty())
        .ok_or_else(|| AuthError::not_configured(strategy))?;

    let reference = &block.service_account_secret_reference;
    let data = read_secret(ctx.client.clone(), ctx.namespace_scope, reference).await?;
    let field = |key: &str| {
        data.get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::MissingSecretKey(reference.secret_name.clone(), key.into()))
    };
    let access_key = field(SERVICE_ACCOUNT_ACCESS_KEY)?;
    let public_key = field(SERVICE_ACCOUNT_PUBLIC_KEY)?;
    let private_key = field(SERVICE_ACCOUNT_PRIVATE_KEY)?;

    ctx.platform.set_static_token(access_key);
    let account_id = ctx.platform.service_account_id().await?;
    let keys = ctx.platform.service_account_keys(&account_id).await?;
    let key = keys
        .iter()
        .find(|k| k.workspace == block.project_id)
        .ok_or_else(|| {
            AuthError::provider(
                strategy,
                format!("service account has no key for project `{}`", block.project_id),
            )
        })?;
    let project_key = decrypt_project_key(&key.encrypted_key, &key.nonce, &public_key, &private_key)?;

    Ok(AuthDetails {
        strategy,
        scope: None,
        legacy: Some(LegacyCredentials {
            project_id: block.project_id.clone(),
            project_key,
            environment: block.environment_name.clone(),
            secret_path: "/".into(),
            recursive: false,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_tokens_keep_the_secret_part_local() {
        let (bearer, secret) = split_service_token("st.abc.def.0123456789abcdef").unwrap();
        assert_eq!(bearer, "st.abc.def");
        assert_eq!(secret, "0123456789abcdef");
    }

    #[test]
    fn short_service_tokens_are_rejected() {
        let err = split_service_token("st.abc.def").unwrap_err();
        assert!(matches!(err, Error::AuthError(AuthError::InvalidServiceToken)));
    }

    #[test]
    fn debug_output_hides_the_project_key() {
        let credentials = LegacyCredentials {
            project_id: "p".into(),
            project_key: b"super secret key".to_vec(),
            environment: "dev".into(),
            secret_path: "/".into(),
            recursive: false,
        };
        let printed = format!("{credentials:?}");
        assert!(printed.contains("project_id"));
        assert!(!printed.contains("project_key"));
    }
}
