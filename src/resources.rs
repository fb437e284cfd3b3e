use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod authentication;
mod dynamic_secret;
mod generator;
mod pulled_secret;
mod pushed_secret;

pub use authentication::*;
pub use dynamic_secret::*;
pub use generator::*;
pub use pulled_secret::*;
pub use pushed_secret::*;

use crate::{Error, Result};

/// API group shared by every resource managed by this operator
pub const GROUP: &str = "secrets.infisical.com";

/// Annotation carrying the version of the projected material on managed resources
pub const SECRET_VERSION_ANNOTATION: &str = "secrets.infisical.com/version";

/// Annotation prefixes owned by the cluster or tooling which are never copied onto managed resources
const SYSTEM_ANNOTATION_PREFIXES: [&str; 4] = [
    "kubectl.kubernetes.io/",
    "kubernetes.io/",
    "k8s.io/",
    "helm.sh/",
];

/// Reference to a secret that may live in another namespace
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct KubeSecretReference {
    /// The name of the secret
    pub secret_name: String,

    /// The containing namespace
    pub secret_namespace: String,
}

/// Reference to a namespaced object
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedReference {
    /// The name of the resource
    pub name: String,

    /// The containing namespace.
    pub namespace: String,
}

/// TLS settings used when talking to a self-hosted platform
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Secret holding a PEM bundle appended to the system roots
    pub ca_ref: CaReference,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct CaReference {
    pub secret_name: String,
    pub secret_namespace: String,

    /// Key within the secret holding the bundle
    #[serde(default = "defaults::ca_key")]
    pub key: String,
}

/// Whether a managed cluster resource is owned by the custom resource that produced it
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum CreationPolicy {
    /// Garbage-collect the managed resource along with its parent
    Owner,
    /// Leave the managed resource behind
    #[default]
    Orphan,
}

/// Template applied to secrets before they are written
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplate {
    /// Keep every source secret and let templated keys overlay them
    #[serde(default)]
    pub include_all_secrets: bool,

    /// Target key to template text
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

pub(crate) mod defaults {
    pub fn ca_key() -> String {
        "ca.crt".into()
    }

    pub fn secrets_path() -> String {
        "/".into()
    }

    pub fn resync_interval() -> u64 {
        60
    }

    pub fn secret_type() -> String {
        "Opaque".into()
    }
}

/// Human readable explanation for reads blocked by a namespace scoped installation
pub fn namespace_scoped_hint(kind: &str, name: &str, namespace: &str) -> String {
    format!(
        "Your Operator installation is namespace scoped, and cannot read {kind} `{name}` outside \
         of the namespace it is installed in. Please ensure the {kind} is in namespace \
         `{namespace}` or install the operator cluster-wide."
    )
}

/// Refuse reads outside the watched namespace when the operator is namespace scoped
pub fn guard_namespace(
    scope: Option<&str>,
    kind: &str,
    name: &str,
    namespace: &str,
) -> Result<()> {
    match scope {
        Some(allowed) if allowed != namespace => Err(Error::NamespaceScoped {
            kind: kind.into(),
            name: name.into(),
            namespace: allowed.into(),
        }),
        _ => Ok(()),
    }
}

/// Split a comma separated namespace list, dropping blanks
pub fn parse_namespaces(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(String::from)
        .collect()
}

/// Copy user annotations from a custom resource, skipping those owned by the cluster or tooling
pub fn inheritable_annotations<K: ResourceExt>(owner: &K) -> BTreeMap<String, String> {
    owner
        .annotations()
        .iter()
        .filter(|(k, _)| {
            !SYSTEM_ANNOTATION_PREFIXES
                .iter()
                .any(|prefix| k.starts_with(prefix))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Read a single key of a secret as a trimmed UTF-8 string
pub async fn read_secret_key(
    client: Client,
    scope: Option<&str>,
    reference: &KubeSecretReference,
    key: &str,
) -> Result<String> {
    let data = read_secret(client, scope, reference).await?;
    data.get(key)
        .map(|v| v.trim().to_string())
        .ok_or_else(|| Error::MissingSecretKey(reference.secret_name.clone(), key.into()))
}

/// Read all keys of a secret as UTF-8 strings
pub async fn read_secret(
    client: Client,
    scope: Option<&str>,
    reference: &KubeSecretReference,
) -> Result<BTreeMap<String, String>> {
    guard_namespace(
        scope,
        "secret",
        &reference.secret_name,
        &reference.secret_namespace,
    )?;

    let secrets = Api::<Secret>::namespaced(client, &reference.secret_namespace);
    let secret = secrets.get_opt(&reference.secret_name).await?.ok_or_else(|| {
        Error::IllegalResource(
            format!("{}/{}", reference.secret_namespace, reference.secret_name),
            "secret not found".into(),
        )
    })?;

    Ok(secret_strings(&secret))
}

/// Flatten both `data` and `stringData` of a secret into UTF-8 strings
pub fn secret_strings(secret: &Secret) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    if let Some(string_data) = &secret.string_data {
        out.extend(string_data.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    out
}

#[cfg(test)]
mod tests {
    use k8s_openapi::ByteString;
    use kube::core::ObjectMeta;

    use super::*;

    #[test]
    fn namespaces_are_split_and_trimmed() {
        assert_eq!(
            parse_namespaces(" default, staging ,,prod "),
            vec!["default", "staging", "prod"]
        );
        assert!(parse_namespaces(" , ").is_empty());
    }

    #[test]
    fn system_annotations_are_not_inherited() {
        let owner = Secret {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([
                    ("kubectl.kubernetes.io/last-applied-configuration".into(), "{}".into()),
                    ("helm.sh/chart".into(), "x".into()),
                    ("team".into(), "payments".into()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };

        let annotations = inheritable_annotations(&owner);
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations["team"], "payments");
    }

    #[test]
    fn namespace_guard_only_applies_when_scoped() {
        assert!(guard_namespace(None, "secret", "a", "other").is_ok());
        assert!(guard_namespace(Some("apps"), "secret", "a", "apps").is_ok());

        let err = guard_namespace(Some("apps"), "secret", "a", "other").unwrap_err();
        assert!(err.to_string().contains("namespace scoped"));
    }

    #[test]
    fn string_data_overrides_data() {
        let secret = Secret {
            data: Some(BTreeMap::from([
                ("a".into(), ByteString(b"1".to_vec())),
                ("b".into(), ByteString(b"2".to_vec())),
            ])),
            string_data: Some(BTreeMap::from([("b".into(), "3".into())])),
            ..Default::default()
        };

        let flat = secret_strings(&secret);
        assert_eq!(flat["a"], "1");
        assert_eq!(flat["b"], "3");
    }
}
