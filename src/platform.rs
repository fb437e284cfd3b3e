use async_trait::async_trait;
use thiserror::Error;

mod client;
pub mod legacy;
mod models;

pub use client::*;
pub use models::*;

/// Sent with every platform request
pub const USER_AGENT: &str = "k8-operator";

/// Messages the platform uses when a lease can no longer be renewed
const INVALID_LEASE_MESSAGES: [&str; 2] = [
    "TTL cannot be larger than max ttl",
    "Dynamic secret lease with ID",
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(
        "Unsuccessful response [{method} {url}] [status-code={status}] [request-id={request_id}] [message={message}]"
    )]
    Api {
        method: String,
        url: String,
        status: u16,
        message: String,
        request_id: String,
    },

    /// The lease cannot be renewed and a new one has to be created
    #[error("Invalid lease: {0}")]
    InvalidLease(String),

    #[error("Access token expired and can no longer be renewed")]
    TokenExpired,

    #[error("No access token, authenticate first")]
    Unauthenticated,

    #[error("Invalid platform URL `{0}`")]
    InvalidUrl(String),

    #[error("Invalid CA certificate: {0}")]
    InvalidCertificate(String),

    #[error("Unable to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Decryption failed: {0}")]
    Decryption(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Lease renewal failures which mean the lease is gone for good
    pub(crate) fn into_lease_error(self) -> Self {
        match self {
            Error::Api { message, .. }
                if INVALID_LEASE_MESSAGES.iter().any(|m| message.contains(m)) =>
            {
                Error::InvalidLease(message)
            }
            other => other,
        }
    }
}

/// Platform operations used by the reconcilers.
///
/// Implemented by [`PlatformClient`]; the seam lets the push and lease
/// engines run against an in-memory platform in tests.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn list_secrets(&self, request: &ListSecretsRequest) -> Result<Vec<Secret>>;

    async fn create_secret(&self, target: &SecretTarget, key: &str, value: &str) -> Result<Secret>;

    async fn update_secret(&self, target: &SecretTarget, key: &str, value: &str) -> Result<Secret>;

    async fn delete_secret(&self, target: &SecretTarget, key: &str) -> Result<Secret>;

    async fn get_project_by_id(&self, id: &str) -> Result<Project>;

    async fn get_project_by_slug(&self, slug: &str) -> Result<Project>;

    async fn create_lease(&self, request: &CreateLeaseRequest) -> Result<CreatedLease>;

    /// Extend a lease; fails with [`Error::InvalidLease`] once it cannot be renewed
    async fn renew_lease(&self, id: &str, scope: &LeaseScope, ttl: Option<&str>) -> Result<Lease>;

    async fn delete_lease(&self, id: &str, scope: &LeaseScope) -> Result<Lease>;
}
