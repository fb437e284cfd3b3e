use serde::Deserialize;
use serde_json::json;

use super::{AuthContext, AuthDetails, AuthError, AuthStrategy};
use crate::{resources::AzureAuth, Result};

const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const DEFAULT_RESOURCE: &str = "https://management.azure.com/";

#[derive(Deserialize)]
struct ManagedIdentityToken {
    access_token: String,
}

fn resource(block: &AzureAuth) -> &str {
    block
        .resource
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_RESOURCE)
}

pub(super) async fn login(ctx: &AuthContext<'_>, block: Option<&AzureAuth>) -> Result<AuthDetails> {
    let strategy = AuthStrategy::Azure;
    let block = block
        .filter(|b| !b.identity_id.trim().is_empty())
        .ok_or_else(|| AuthError::not_configured(strategy))?;

    let token: ManagedIdentityToken = ctx
        .metadata_client()?
        .get(IMDS_TOKEN_URL)
        .header("Metadata", "true")
        .query(&[("api-version", IMDS_API_VERSION), ("resource", resource(block))])
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| AuthError::provider(strategy, format!("managed identity unavailable: {e}")))?
        .json()
        .await
        .map_err(|e| AuthError::provider(strategy, e))?;

    ctx.platform
        .login(
            "azure",
            &json!({ "identityId": block.identity_id.trim(), "jwt": token.access_token }),
        )
        .await?;

    Ok(AuthDetails::machine_identity(strategy, block.secrets_scope.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_defaults_to_management_api() {
        let mut block = AzureAuth {
            identity_id: "id".into(),
            ..Default::default()
        };
        assert_eq!(resource(&block), DEFAULT_RESOURCE);

        block.resource = Some(" ".into());
        assert_eq!(resource(&block), DEFAULT_RESOURCE);

        block.resource = Some("api://infisical".into());
        assert_eq!(resource(&block), "api://infisical");
    }
}
