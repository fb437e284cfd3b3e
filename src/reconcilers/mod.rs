use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;
use k8s_openapi::{
    api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::Condition, ByteString,
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    core::ObjectMeta,
    runtime::{controller::Action, reflector::ObjectRef},
    Api, Client, CustomResourceExt, Resource, ResourceExt,
};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    auth::{self, AuthDetails, Credentials},
    conditions::{self, ConditionUpdate},
    config::{self, OperatorConfig},
    operator::Diagnostics,
    registry::{ResourceEntry, ResourceRegistry},
    resources::{inheritable_annotations, CreationPolicy, PulledSecret, TlsConfig, SECRET_VERSION_ANNOTATION},
    Error, Metrics, Result, OPERATOR_NAME,
};

pub mod dynamic;
pub mod pull;
pub mod push;

#[cfg(test)]
pub(crate) mod fake;

/// The context passed around
pub struct Context {
    /// Kubernetes client
    pub client: Client,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,

    pub config: OperatorConfig,

    /// Platform clients and cached authentication per resource
    pub registry: ResourceRegistry,

    /// Reconcile triggers for pulled secrets, fed by platform event streams
    pub pull_trigger: UnboundedSender<ObjectRef<PulledSecret>>,
}

/// A resource that can be reconciled by a controller
#[async_trait]
pub(crate) trait Reconcile
where
    Self: CustomResourceExt + Resource<DynamicType = ()> + ResourceExt,
{
    /// Finalizer guarding the cleanup path
    const FINALIZER: &'static str;

    /// Attempt to reconcile a resource
    async fn reconcile(&self, context: Arc<Context>) -> Result<Action, Error>;

    /// Release what this resource holds on the platform before it is removed
    async fn cleanup(&self, context: Arc<Context>) -> Result<Action, Error>;

    /// Delay before retrying a failed reconcile
    fn retry_interval(&self) -> Duration;
}

pub(crate) fn uid<K: ResourceExt>(resource: &K) -> Result<String> {
    resource
        .uid()
        .ok_or_else(|| Error::IllegalResource(resource.name_any(), "missing uid".into()))
}

pub(crate) fn namespace<K: ResourceExt>(resource: &K) -> Result<String> {
    resource
        .namespace()
        .ok_or_else(|| Error::IllegalResource(resource.name_any(), "missing namespace".into()))
}

/// Seconds to a requeue delay, never zero
pub(crate) fn interval(seconds: u64) -> Duration {
    Duration::from_secs(seconds.max(1))
}

/// Registry entry for `resource`, with the platform settings resolved for this tick
pub(crate) async fn platform_entry<K: ResourceExt>(
    ctx: &Context,
    resource: &K,
    host_api: Option<&str>,
    tls: Option<&TlsConfig>,
) -> Result<(String, ResourceEntry)> {
    let uid = uid(resource)?;
    let settings =
        config::resolve_platform_settings(ctx.client.clone(), &ctx.config, host_api, tls).await?;
    let entry = ctx
        .registry
        .entry(&uid, resource.meta().generation, &settings)?;
    Ok((uid, entry))
}

/// Reuse cached authentication or run the multiplexer, recording the outcome as a condition
pub(crate) async fn authenticate(
    ctx: &Context,
    uid: &str,
    entry: &ResourceEntry,
    credentials: Credentials<'_>,
    conditions: &mut Vec<Condition>,
    generation: Option<i64>,
) -> Result<AuthDetails> {
    if let Some(details) = &entry.auth {
        if entry.platform.is_authenticated() {
            return Ok(details.clone());
        }
    }

    let outcome = auth::authenticate(
        ctx.client.clone(),
        &entry.platform,
        ctx.config.namespace.as_deref(),
        credentials,
    )
    .await;

    let update = match &outcome {
        Ok(details) => ConditionUpdate::ok(
            conditions::AUTHENTICATED,
            "Authenticated",
            format!("Authenticated with {}", details.strategy),
        ),
        Err(e) => ConditionUpdate::failed(
            conditions::AUTHENTICATED,
            "AuthenticationFailed",
            format!("Failed to authenticate: {e}"),
        ),
    };
    conditions::set_condition(conditions, update, generation);

    let details = outcome?;
    ctx.registry.set_auth(uid, entry, details.clone());
    Ok(details)
}

/// Write the status subresource with server side apply
pub(crate) async fn patch_status<K>(ctx: &Context, resource: &K, status: serde_json::Value) -> Result<()>
where
    K: Resource<DynamicType = ()> + ResourceExt + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
{
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace(resource)?);
    let patch = Patch::Apply(json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "status": status,
    }));
    let params = PatchParams::apply(OPERATOR_NAME).force();
    api.patch_status(&resource.name_any(), &params, &patch)
        .await?;
    Ok(())
}

/// Controller owner reference, only within the owner's namespace
pub(crate) fn owner_reference<K>(
    owner: &K,
    policy: CreationPolicy,
    namespace: &str,
) -> Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>
where
    K: Resource<DynamicType = ()> + ResourceExt,
{
    if policy != CreationPolicy::Owner {
        return None;
    }
    if owner.namespace().as_deref() != Some(namespace) {
        info!(
            owner = %owner.name_any(),
            %namespace,
            "managed resource lives in another namespace, leaving it orphaned"
        );
        return None;
    }
    owner.controller_owner_ref(&())
}

/// Metadata of a managed resource: the owner's labels and user annotations plus the version
pub(crate) fn managed_metadata<K>(
    owner: &K,
    name: &str,
    namespace: &str,
    policy: CreationPolicy,
    version: &str,
) -> ObjectMeta
where
    K: Resource<DynamicType = ()> + ResourceExt,
{
    let mut annotations = inheritable_annotations(owner);
    annotations.insert(SECRET_VERSION_ANNOTATION.into(), version.into());

    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        labels: Some(owner.labels().clone()),
        annotations: Some(annotations),
        owner_references: owner_reference(owner, policy, namespace).map(|o| vec![o]),
        ..Default::default()
    }
}

/// Create or overwrite a managed secret; returns whether anything was written.
///
/// Existing secrets keep their labels and type, only data and the version annotation move.
pub(crate) async fn write_managed_secret<K>(
    client: Client,
    owner: &K,
    name: &str,
    namespace: &str,
    secret_type: &str,
    policy: CreationPolicy,
    data: std::collections::BTreeMap<String, Vec<u8>>,
    version: &str,
) -> Result<bool>
where
    K: Resource<DynamicType = ()> + ResourceExt,
{
    let api: Api<Secret> = Api::namespaced(client, namespace);
    let data: std::collections::BTreeMap<String, ByteString> =
        data.into_iter().map(|(k, v)| (k, ByteString(v))).collect();

    match api.get_opt(name).await? {
        None => {
            let secret = Secret {
                metadata: managed_metadata(owner, name, namespace, policy, version),
                type_: Some(secret_type.into()),
                data: Some(data),
                ..Default::default()
            };
            api.create(&PostParams::default(), &secret).await?;
            info!(%namespace, %name, "created managed secret");
            Ok(true)
        }
        Some(mut existing) => {
            let current_version = existing.annotations().get(SECRET_VERSION_ANNOTATION);
            let current_data = existing.data.clone().unwrap_or_default();
            if current_version.map(String::as_str) == Some(version) && current_data == data {
                return Ok(false);
            }

            existing
                .annotations_mut()
                .insert(SECRET_VERSION_ANNOTATION.into(), version.into());
            existing.data = Some(data);
            existing.string_data = None;
            api.replace(name, &PostParams::default(), &existing).await?;
            info!(%namespace, %name, "updated managed secret");
            Ok(true)
        }
    }
}

/// Log a failure on a path which must not block removal
pub(crate) fn log_cleanup_failure(what: &str, e: &Error) {
    warn!("{what} failed during cleanup, continuing: {e}");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn owner() -> PulledSecret {
        let mut owner = PulledSecret::default();
        owner.metadata = ObjectMeta {
            name: Some("app".into()),
            namespace: Some("apps".into()),
            uid: Some("uid-1".into()),
            labels: Some(BTreeMap::from([("team".into(), "payments".into())])),
            annotations: Some(BTreeMap::from([
                ("helm.sh/chart".into(), "x".into()),
                ("note".into(), "keep".into()),
            ])),
            ..Default::default()
        };
        owner
    }

    #[test]
    fn owner_references_never_cross_namespaces() {
        let owner = owner();
        assert!(owner_reference(&owner, CreationPolicy::Owner, "apps").is_some());
        assert!(owner_reference(&owner, CreationPolicy::Owner, "other").is_none());
        assert!(owner_reference(&owner, CreationPolicy::Orphan, "apps").is_none());
    }

    #[test]
    fn managed_metadata_copies_labels_and_user_annotations() {
        let meta = managed_metadata(&owner(), "db", "apps", CreationPolicy::Owner, "abc");
        let annotations = meta.annotations.unwrap();
        assert_eq!(annotations[SECRET_VERSION_ANNOTATION], "abc");
        assert_eq!(annotations["note"], "keep");
        assert!(!annotations.contains_key("helm.sh/chart"));
        assert_eq!(meta.labels.unwrap()["team"], "payments");

        let reference = &meta.owner_references.unwrap()[0];
        assert_eq!(reference.kind, "PulledSecret");
        assert_eq!(reference.controller, Some(true));
    }

    #[test]
    fn intervals_are_never_zero() {
        assert_eq!(interval(0), Duration::from_secs(1));
        assert_eq!(interval(60), Duration::from_secs(60));
    }

    mod cluster {
        use assert_json_diff::assert_json_include;
        use http::{Request, Response};
        use hyper::Body;
        use serde_json::Value;

        use super::*;

        type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

        const SECRET_PATH: &str = "/api/v1/namespaces/apps/secrets/db";

        fn mock_client() -> (Client, ApiServerHandle) {
            let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            (Client::new(service, "apps"), handle)
        }

        fn not_found() -> Value {
            json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "secrets \"db\" not found",
                "reason": "NotFound",
                "code": 404
            })
        }

        fn stored(version: &str, value: &str) -> Value {
            json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {
                    "name": "db",
                    "namespace": "apps",
                    "labels": { "owner": "someone-else" },
                    "annotations": { SECRET_VERSION_ANNOTATION: version }
                },
                "type": "kubernetes.io/basic-auth",
                "data": { "password": value }
            })
        }

        /// Answer the next request, echoing its body back when `reply` is `None`
        async fn serve(
            handle: &mut ApiServerHandle,
            method: &str,
            path: &str,
            status: u16,
            reply: Option<Value>,
        ) -> Value {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method().as_str(), method);
            assert_eq!(request.uri().path(), path);

            let body = hyper::body::to_bytes(request.into_body()).await.unwrap();
            let received: Value = if body.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&body).unwrap()
            };
            let reply = reply.unwrap_or_else(|| received.clone());
            send.send_response(
                Response::builder()
                    .status(status)
                    .body(Body::from(serde_json::to_vec(&reply).unwrap()))
                    .unwrap(),
            );
            received
        }

        fn data(value: &str) -> BTreeMap<String, Vec<u8>> {
            BTreeMap::from([("password".to_string(), value.as_bytes().to_vec())])
        }

        async fn write(client: Client, value: &str, version: &str) -> Result<bool> {
            let owner = owner();
            tokio::time::timeout(
                Duration::from_secs(5),
                write_managed_secret(
                    client,
                    &owner,
                    "db",
                    "apps",
                    "Opaque",
                    CreationPolicy::Owner,
                    data(value),
                    version,
                ),
            )
            .await
            .expect("unexpected request to the api server")
        }

        #[tokio::test]
        async fn missing_secrets_are_created_owned_and_versioned() {
            let (client, mut handle) = mock_client();
            let server = tokio::spawn(async move {
                serve(&mut handle, "GET", SECRET_PATH, 404, Some(not_found())).await;
                serve(&mut handle, "POST", "/api/v1/namespaces/apps/secrets", 201, None).await
            });

            assert!(write(client, "hunter2", "v1").await.unwrap());
            let created = server.await.unwrap();
            assert_json_include!(
                actual: created,
                expected: json!({
                    "metadata": {
                        "name": "db",
                        "labels": { "team": "payments" },
                        "annotations": { SECRET_VERSION_ANNOTATION: "v1", "note": "keep" },
                        "ownerReferences": [{ "kind": "PulledSecret", "name": "app", "controller": true }]
                    },
                    "type": "Opaque",
                    "data": { "password": "aHVudGVyMg==" }
                })
            );
        }

        #[tokio::test]
        async fn unchanged_secrets_are_not_written() {
            let (client, mut handle) = mock_client();
            let server = tokio::spawn(async move {
                serve(&mut handle, "GET", SECRET_PATH, 200, Some(stored("v1", "aHVudGVyMg=="))).await;
            });

            assert!(!write(client, "hunter2", "v1").await.unwrap());
            server.await.unwrap();
        }

        #[tokio::test]
        async fn changed_secrets_keep_labels_and_type() {
            let (client, mut handle) = mock_client();
            let server = tokio::spawn(async move {
                serve(&mut handle, "GET", SECRET_PATH, 200, Some(stored("v1", "aHVudGVyMg=="))).await;
                serve(&mut handle, "PUT", SECRET_PATH, 200, None).await
            });

            assert!(write(client, "hunter3", "v2").await.unwrap());
            let replaced = server.await.unwrap();
            assert_json_include!(
                actual: replaced,
                expected: json!({
                    "metadata": {
                        "labels": { "owner": "someone-else" },
                        "annotations": { SECRET_VERSION_ANNOTATION: "v2" }
                    },
                    "type": "kubernetes.io/basic-auth",
                    "data": { "password": "aHVudGVyMw==" }
                })
            );
            assert!(replaced["metadata"].get("ownerReferences").is_none());
        }
    }
}
