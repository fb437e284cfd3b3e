use std::net::SocketAddr;

use clap::Parser;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use tracing::debug;

use crate::{
    resources::{read_secret_key, KubeSecretReference, TlsConfig},
    Result,
};

/// Platform used when neither the resource nor the operator config map name one
pub const DEFAULT_HOST_API: &str = "https://app.infisical.com/api";

/// Operator wide config map, read on every reconcile
pub const CONFIG_MAP_NAME: &str = "infisical-config";

pub const DEFAULT_CONFIG_NAMESPACE: &str = "infisical-operator-system";

const HOST_API_KEY: &str = "hostAPI";

/// Command line of the operator binary
#[derive(Parser, Debug, Clone)]
#[command(name = "operator", version, about = "Synchronizes Infisical secrets into Kubernetes")]
pub struct Args {
    /// Address serving prometheus metrics and diagnostics
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: SocketAddr,

    /// Address serving liveness and readiness probes
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: SocketAddr,

    /// Only reconcile while holding the leader lease
    #[arg(long, env = "LEADER_ELECT")]
    pub leader_elect: bool,

    /// Restrict the operator to a single namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Namespace holding the operator config map and the leader lease
    #[arg(long, env = "CONFIG_NAMESPACE", default_value = DEFAULT_CONFIG_NAMESPACE)]
    pub config_namespace: String,

    /// Identity used for the leader lease
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,
}

/// Process wide settings shared by every controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Set when the operator is namespace scoped
    pub namespace: Option<String>,
    pub config_namespace: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            config_namespace: DEFAULT_CONFIG_NAMESPACE.into(),
        }
    }
}

impl From<&Args> for OperatorConfig {
    fn from(args: &Args) -> Self {
        Self {
            namespace: args.namespace.clone().filter(|ns| !ns.is_empty()),
            config_namespace: args.config_namespace.clone(),
        }
    }
}

/// Where and how to reach the platform for a single reconcile
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlatformSettings {
    pub host_api: String,
    /// Extra PEM bundle trusted in addition to the system roots
    pub ca_certificate: Option<String>,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            host_api: DEFAULT_HOST_API.into(),
            ca_certificate: None,
        }
    }
}

/// Pick the platform URL: the resource wins over the config map, which wins over the default
pub fn select_host(resource: Option<&str>, config_map: Option<&str>) -> String {
    [resource, config_map]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|host| !host.is_empty())
        .unwrap_or(DEFAULT_HOST_API)
        .to_string()
}

/// Resolve the platform settings for one resource
pub async fn resolve_platform_settings(
    client: Client,
    config: &OperatorConfig,
    host_api: Option<&str>,
    tls: Option<&TlsConfig>,
) -> Result<PlatformSettings> {
    let config_host = if host_api.map_or(true, |h| h.trim().is_empty()) {
        let config_maps = Api::<ConfigMap>::namespaced(client.clone(), &config.config_namespace);
        let config_map = config_maps.get_opt(CONFIG_MAP_NAME).await?;
        if config_map.is_none() {
            debug!(namespace = %config.config_namespace, "no operator config map, using defaults");
        }
        config_map
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(HOST_API_KEY))
    } else {
        None
    };

    let ca_certificate = match tls {
        Some(tls) => {
            let reference = KubeSecretReference {
                secret_name: tls.ca_ref.secret_name.clone(),
                secret_namespace: tls.ca_ref.secret_namespace.clone(),
            };
            Some(
                read_secret_key(
                    client,
                    config.namespace.as_deref(),
                    &reference,
                    &tls.ca_ref.key,
                )
                .await?,
            )
        }
        None => None,
    };

    Ok(PlatformSettings {
        host_api: select_host(host_api, config_host.as_deref()),
        ca_certificate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_host_wins_over_config_map() {
        assert_eq!(
            select_host(Some("https://eu.infisical.com/api"), Some("https://cm/api")),
            "https://eu.infisical.com/api"
        );
        assert_eq!(select_host(Some("  "), Some("https://cm/api")), "https://cm/api");
        assert_eq!(select_host(None, None), DEFAULT_HOST_API);
    }

    #[test]
    fn flags_have_operator_defaults() {
        let args = Args::parse_from(["operator"]);
        assert_eq!(args.metrics_bind_address.port(), 8080);
        assert_eq!(args.health_probe_bind_address.port(), 8081);
        assert!(!args.leader_elect);

        let config = OperatorConfig::from(&args);
        assert_eq!(config.config_namespace, DEFAULT_CONFIG_NAMESPACE);
    }

    #[test]
    fn empty_namespace_means_cluster_scope() {
        let args = Args::parse_from(["operator", "--namespace", ""]);
        assert_eq!(OperatorConfig::from(&args).namespace, None);

        let args = Args::parse_from(["operator", "--namespace", "team-a", "--leader-elect"]);
        assert_eq!(OperatorConfig::from(&args).namespace.as_deref(), Some("team-a"));
        assert!(args.leader_elect);
    }
}
