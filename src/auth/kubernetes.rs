use k8s_openapi::api::{
    authentication::v1::{TokenRequest, TokenRequestSpec},
    core::v1::ServiceAccount,
};
use kube::api::{Api, PostParams};
use serde_json::json;
use tracing::debug;

use super::{AuthContext, AuthDetails, AuthError, AuthStrategy};
use crate::{
    resources::{guard_namespace, KubernetesAuth},
    Result,
};

/// Lifetime requested for service account tokens, only used once for login
const TOKEN_EXPIRATION_SECONDS: i64 = 600;

fn token_request() -> TokenRequest {
    TokenRequest {
        spec: TokenRequestSpec {
            audiences: vec![],
            expiration_seconds: Some(TOKEN_EXPIRATION_SECONDS),
            bound_object_ref: None,
        },
        ..Default::default()
    }
}

pub(super) async fn login(ctx: &AuthContext<'_>, block: Option<&KubernetesAuth>) -> Result<AuthDetails> {
    let strategy = AuthStrategy::Kubernetes;
    let block = block
        .filter(|b| !b.identity_id.trim().is_empty())
        .ok_or_else(|| AuthError::not_configured(strategy))?;

    let account = &block.service_account_ref;
    guard_namespace(
        ctx.namespace_scope,
        "service account",
        &account.name,
        &account.namespace,
    )?;

    let accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &account.namespace);
    let issued: TokenRequest = accounts
        .create_subresource(
            "token",
            &account.name,
            &PostParams::default(),
            serde_json::to_vec(&token_request())?,
        )
        .await?;
    let jwt = issued
        .status
        .map(|s| s.token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            AuthError::provider(
                strategy,
                format!(
                    "no token issued for service account {}/{}",
                    account.namespace, account.name
                ),
            )
        })?;
    debug!(account = %account.name, "issued service account token");

    ctx.platform
        .login(
            "kubernetes",
            &json!({ "identityId": block.identity_id.trim(), "jwt": jwt }),
        )
        .await?;

    Ok(AuthDetails::machine_identity(strategy, block.secrets_scope.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_requests_are_short_lived() {
        let body = serde_json::to_value(token_request()).unwrap();
        assert_eq!(body["spec"]["expirationSeconds"], 600);
        assert_eq!(body["kind"], "TokenRequest");
    }
}
