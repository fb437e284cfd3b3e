use std::{fmt, time::Duration};

use kube::Client;
use tracing::{debug, info};

use crate::{
    platform::{PlatformClient, USER_AGENT},
    resources::{Authentication, PullAuthentication, SecretsScope},
    Error, Result,
};

mod aws;
mod azure;
mod gcp;
mod kubernetes;
mod legacy;
mod universal;

pub use legacy::LegacyCredentials;

/// Cloud metadata services answer locally or not at all
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Tag of every supported way to obtain platform credentials
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthStrategy {
    Universal,
    Kubernetes,
    AwsIam,
    Azure,
    GcpIdToken,
    GcpIam,
    ServiceToken,
    ServiceAccount,
}

impl AuthStrategy {
    /// Attempt order for machine identities
    pub const MACHINE_IDENTITY: [AuthStrategy; 6] = [
        AuthStrategy::Universal,
        AuthStrategy::Kubernetes,
        AuthStrategy::AwsIam,
        AuthStrategy::Azure,
        AuthStrategy::GcpIdToken,
        AuthStrategy::GcpIam,
    ];

    /// Deprecated credentials, only accepted when pulling and tried first
    pub const LEGACY: [AuthStrategy; 2] = [AuthStrategy::ServiceToken, AuthStrategy::ServiceAccount];

    pub fn is_machine_identity(self) -> bool {
        !Self::LEGACY.contains(&self)
    }

    /// Name of the credential block in the resource
    pub fn field(self) -> &'static str {
        match self {
            AuthStrategy::Universal => "universalAuth",
            AuthStrategy::Kubernetes => "kubernetesAuth",
            AuthStrategy::AwsIam => "awsIamAuth",
            AuthStrategy::Azure => "azureAuth",
            AuthStrategy::GcpIdToken => "gcpIdTokenAuth",
            AuthStrategy::GcpIam => "gcpIamAuth",
            AuthStrategy::ServiceToken => "serviceToken",
            AuthStrategy::ServiceAccount => "serviceAccount",
        }
    }
}

impl fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    /// The strategy has no credentials configured, try the next one
    #[error("{0}")]
    NotApplicable(String),

    #[error("No authentication method provided: {0}")]
    NoStrategy(String),

    #[error("Invalid service token, expected at least four dot separated parts")]
    InvalidServiceToken,

    #[error("{strategy} failed: {message}")]
    Provider {
        strategy: AuthStrategy,
        message: String,
    },

    #[error("Unable to sign login request: {0}")]
    Signing(String),
}

impl AuthError {
    fn not_configured(strategy: AuthStrategy) -> Error {
        AuthError::NotApplicable(format!("{strategy} is not configured")).into()
    }

    fn provider(strategy: AuthStrategy, message: impl fmt::Display) -> Error {
        AuthError::Provider {
            strategy,
            message: message.to_string(),
        }
        .into()
    }
}

/// Credential blocks a resource offers
#[derive(Clone, Copy, Debug)]
pub enum Credentials<'a> {
    /// Pulled secrets also accept deprecated credentials
    Pull(&'a PullAuthentication),
    Identity(&'a Authentication),
}

impl<'a> Credentials<'a> {
    pub fn strategies(&self) -> Vec<AuthStrategy> {
        match self {
            Credentials::Pull(_) => AuthStrategy::LEGACY
                .into_iter()
                .chain(AuthStrategy::MACHINE_IDENTITY)
                .collect(),
            Credentials::Identity(_) => AuthStrategy::MACHINE_IDENTITY.to_vec(),
        }
    }

    fn identity(&self) -> &'a Authentication {
        match self {
            Credentials::Pull(pull) => &pull.identity,
            Credentials::Identity(identity) => identity,
        }
    }

    fn pull(&self) -> Option<&'a PullAuthentication> {
        match self {
            Credentials::Pull(pull) => Some(pull),
            Credentials::Identity(_) => None,
        }
    }
}

/// Outcome of a successful authentication, cached until the platform rejects it
#[derive(Clone, Debug)]
pub struct AuthDetails {
    pub strategy: AuthStrategy,
    /// Where to read secrets from, for strategies that carry a scope
    pub scope: Option<SecretsScope>,
    pub legacy: Option<LegacyCredentials>,
}

impl AuthDetails {
    fn machine_identity(strategy: AuthStrategy, scope: Option<&SecretsScope>) -> Self {
        Self {
            strategy,
            scope: scope.cloned(),
            legacy: None,
        }
    }
}

/// Everything a strategy handler may use
pub(crate) struct AuthContext<'a> {
    pub client: Client,
    pub platform: &'a PlatformClient,
    /// Namespace the operator is restricted to, if any
    pub namespace_scope: Option<&'a str>,
}

impl AuthContext<'_> {
    fn metadata_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|e| Error::PlatformError(e.into()))
    }
}

async fn attempt(
    strategy: AuthStrategy,
    ctx: &AuthContext<'_>,
    credentials: Credentials<'_>,
) -> Result<AuthDetails> {
    let identity = credentials.identity();
    match strategy {
        AuthStrategy::Universal => universal::login(ctx, identity.universal_auth.as_ref()).await,
        AuthStrategy::Kubernetes => {
            kubernetes::login(ctx, identity.kubernetes_auth.as_ref()).await
        }
        AuthStrategy::AwsIam => aws::login(ctx, identity.aws_iam_auth.as_ref()).await,
        AuthStrategy::Azure => azure::login(ctx, identity.azure_auth.as_ref()).await,
        AuthStrategy::GcpIdToken => {
            gcp::login_id_token(ctx, identity.gcp_id_token_auth.as_ref()).await
        }
        AuthStrategy::GcpIam => gcp::login_iam(ctx, identity.gcp_iam_auth.as_ref()).await,
        AuthStrategy::ServiceToken => {
            let block = credentials.pull().and_then(|p| p.service_token.as_ref());
            legacy::service_token(ctx, block).await
        }
        AuthStrategy::ServiceAccount => {
            let block = credentials.pull().and_then(|p| p.service_account.as_ref());
            legacy::service_account(ctx, block).await
        }
    }
}

/// Try every applicable strategy in order and install the resulting credential on `platform`.
///
/// A strategy without credentials passes to the next; any other failure stops the search.
pub async fn authenticate(
    client: Client,
    platform: &PlatformClient,
    namespace_scope: Option<&str>,
    credentials: Credentials<'_>,
) -> Result<AuthDetails> {
    let ctx = AuthContext {
        client,
        platform,
        namespace_scope,
    };

    let mut last_reason = String::from("no credentials configured");
    for strategy in credentials.strategies() {
        match attempt(strategy, &ctx, credentials).await {
            Ok(details) => {
                info!(%strategy, host = platform.host(), "authenticated");
                return Ok(details);
            }
            Err(Error::AuthError(AuthError::NotApplicable(reason))) => {
                debug!(%strategy, "skipping: {reason}");
                last_reason = reason;
            }
            Err(e) => return Err(e),
        }
    }

    Err(AuthError::NoStrategy(last_reason).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_tries_legacy_credentials_first() {
        let pull = PullAuthentication::default();
        let order = Credentials::Pull(&pull).strategies();
        assert_eq!(order[..2], AuthStrategy::LEGACY);
        assert_eq!(order[2..], AuthStrategy::MACHINE_IDENTITY);
    }

    #[test]
    fn push_and_dynamic_only_use_machine_identities() {
        let identity = Authentication::default();
        let order = Credentials::Identity(&identity).strategies();
        assert_eq!(order, AuthStrategy::MACHINE_IDENTITY.to_vec());
        assert!(order.iter().all(|s| s.is_machine_identity()));
        assert!(!AuthStrategy::ServiceToken.is_machine_identity());
    }

    #[test]
    fn strategies_are_named_after_their_block() {
        assert_eq!(AuthStrategy::GcpIdToken.to_string(), "gcpIdTokenAuth");
        assert_eq!(
            AuthError::not_configured(AuthStrategy::Azure).to_string(),
            "Authentication Error: azureAuth is not configured"
        );
    }
}
