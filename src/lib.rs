use thiserror::Error;

/// Authentication multiplexer establishing platform credentials per resource
pub mod auth;

/// Status condition bookkeeping
pub mod conditions;

/// Process and per-resource configuration
pub mod config;

/// Value generators used by pushed secrets
pub mod generators;

/// Single active replica coordination
pub mod leader_election;

/// Expose all controller components used by main
pub mod operator;

/// HTTP client for the Infisical platform
pub mod platform;

/// Per-kind reconciliation logic
pub mod reconcilers;

/// Process-local state keyed by resource UID
pub mod registry;

/// Custom resource definitions and cluster helpers
pub mod resources;

/// Restart signalling for workloads consuming managed secrets
pub mod rollout;

/// Server-sent event subscriptions for instant updates
pub mod sse;

/// Log and trace integrations
pub mod telemetry;

/// Secret templating
pub mod template;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Field manager and event reporter name used for all writes
pub const OPERATOR_NAME: &str = "infisical-operator";

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Platform Error: {0}")]
    PlatformError(#[from] platform::Error),

    #[error("Authentication Error: {0}")]
    AuthError(#[from] auth::AuthError),

    #[error("Template Error: {0}")]
    TemplateError(#[from] template::Error),

    #[error("Generator Error: {0}")]
    GeneratorError(#[from] generators::Error),

    #[error("{}", resources::namespace_scoped_hint(.kind, .name, .namespace))]
    NamespaceScoped {
        kind: String,
        name: String,
        namespace: String,
    },

    #[error("Invalid resource `{0}`: {1}")]
    IllegalResource(String, String),

    #[error("Secret `{0}` is missing key `{1}`")]
    MissingSecretKey(String, String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The reconciler error behind a finalizer failure, or `self`
    pub fn inner(&self) -> &Error {
        use kube::runtime::finalizer::Error as Finalizer;
        match self {
            Error::FinalizerError(e) => match e.as_ref() {
                Finalizer::ApplyFailed(inner) | Finalizer::CleanupFailed(inner) => inner,
                _ => self,
            },
            _ => self,
        }
    }

    pub fn metric_label(&self) -> String {
        match self.inner() {
            Error::SerializationError(_) => "serialization",
            Error::KubeError(_) => "kube",
            Error::FinalizerError(_) => "finalizer",
            Error::PlatformError(platform::Error::InvalidLease(_)) => "invalid_lease",
            Error::PlatformError(_) => "platform",
            Error::AuthError(_) => "authentication",
            Error::TemplateError(_) => "template",
            Error::GeneratorError(_) => "generator",
            Error::NamespaceScoped { .. } => "namespace_scoped",
            Error::IllegalResource(..) => "illegal_resource",
            Error::MissingSecretKey(..) => "missing_secret_key",
        }
        .to_string()
    }

    /// Whether the platform rejected the bearer token and authentication must be redone
    pub fn requires_reauthentication(&self) -> bool {
        let error = self.inner();
        matches!(
            error,
            Error::PlatformError(platform::Error::TokenExpired)
                | Error::PlatformError(platform::Error::Unauthenticated)
        ) || matches!(error, Error::PlatformError(platform::Error::Api { status: 401, .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_labels_are_low_cardinality() {
        let a = Error::IllegalResource("a".into(), "first".into());
        let b = Error::IllegalResource("b".into(), "second".into());
        assert_eq!(a.metric_label(), b.metric_label());
        assert_eq!(a.metric_label(), "illegal_resource");
    }

    #[test]
    fn expired_tokens_require_reauthentication() {
        assert!(Error::PlatformError(platform::Error::TokenExpired).requires_reauthentication());
        assert!(!Error::MissingSecretKey("s".into(), "k".into()).requires_reauthentication());
    }

    #[test]
    fn finalizer_failures_expose_the_reconciler_error() {
        let wrapped = Error::FinalizerError(Box::new(kube::runtime::finalizer::Error::ApplyFailed(
            Error::PlatformError(platform::Error::TokenExpired),
        )));
        assert!(wrapped.requires_reauthentication());
        assert_eq!(wrapped.metric_label(), "platform");
    }
}
