use std::{
    collections::hash_map::DefaultHasher,
    fmt::Debug,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use futures::{channel::mpsc, StreamExt};
use k8s_openapi::{api::core::v1::Secret, NamespaceResourceScope};
use kube::{
    api::ListParams,
    runtime::{
        controller::Action,
        events::{Recorder, Reporter},
        finalizer::{finalizer, Event as Finalizer},
        reflector::{self, ObjectRef},
        watcher::{self, Config},
        Controller, WatchStreamExt,
    },
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, instrument, warn, Span};

use crate::{
    config::OperatorConfig,
    reconcilers::{self, Context, Reconcile},
    registry::ResourceRegistry,
    resources::{ClusterGenerator, DynamicSecret, PulledSecret, PushedSecret},
    telemetry, Error, Metrics, Result, OPERATOR_NAME,
};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: OPERATOR_NAME.into(),
        }
    }
}
impl Diagnostics {
    pub fn recorder<K: Resource<DynamicType = ()>>(&self, client: Client, resource: &K) -> Recorder {
        Recorder::new(client, self.reporter.clone(), resource.object_ref(&()))
    }
}

/// State shared between the controllers and the web servers
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Set once the controllers are running
    ready: Arc<AtomicBool>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    // Create a Controller Context that can update State
    pub(crate) fn to_context(
        &self,
        client: Client,
        config: OperatorConfig,
        registry: ResourceRegistry,
        pull_trigger: mpsc::UnboundedSender<ObjectRef<PulledSecret>>,
    ) -> Result<Arc<Context>, prometheus::Error> {
        Ok(Arc::new(Context {
            client,
            metrics: Metrics::default().register(&self.registry)?,
            diagnostics: self.diagnostics.clone(),
            config,
            registry,
            pull_trigger,
        }))
    }
}

/// Scope controllers to the operator namespace when one is configured
fn scoped_api<K>(client: Client, config: &OperatorConfig) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    match &config.namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

/// Changes worth a reconcile: spec generation, finalizers and deletion.
///
/// Status writes of the reconcilers themselves never pass this filter.
fn reconcile_worthy<K: ResourceExt>(resource: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    resource.meta().generation.hash(&mut hasher);
    resource.finalizers().hash(&mut hasher);
    resource
        .meta()
        .deletion_timestamp
        .as_ref()
        .map(|t| t.0)
        .hash(&mut hasher);
    Some(hasher.finish())
}

/// A controller for `K` fed by a reflector that drops changes no reconcile cares about
fn controller<K>(api: Api<K>) -> Controller<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher::watcher(api, Config::default().any_semantic()))
        .default_backoff()
        .applied_objects()
        .predicate_filter(reconcile_worthy);
    Controller::for_stream(stream, reader).shutdown_on_signal()
}

/// Drive a controller to completion, logging each outcome
async fn drain<K, S, E>(stream: S)
where
    K: Resource,
    S: futures::Stream<Item = std::result::Result<(ObjectRef<K>, Action), E>>,
    E: std::fmt::Display,
{
    stream
        .for_each(|outcome| async move {
            match outcome {
                Ok((object, _)) => debug!(%object, "reconciled"),
                Err(e) => debug!("reconcile error: {e}"),
            }
        })
        .await
}

/// Fail early with an installation hint when a CRD is missing
async fn ensure_installed<K>(api: &Api<K>) -> anyhow::Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        anyhow::bail!("{} is not queryable: {e}. Is the CRD installed?", K::kind(&()));
    }
    Ok(())
}

pub struct SecretsController {
    state: State,
    config: OperatorConfig,
}

impl SecretsController {
    pub fn new(state: State, config: OperatorConfig) -> Self {
        Self { state, config }
    }

    /// Run the three controllers until shutdown (given the crds are installed)
    pub async fn run(self, client: Client, shutdown: CancellationToken) -> anyhow::Result<()> {
        let pulled: Api<PulledSecret> = scoped_api(client.clone(), &self.config);
        let pushed: Api<PushedSecret> = scoped_api(client.clone(), &self.config);
        let dynamic: Api<DynamicSecret> = scoped_api(client.clone(), &self.config);
        let secrets: Api<Secret> = scoped_api(client.clone(), &self.config);
        let generators: Api<ClusterGenerator> = Api::all(client.clone());

        ensure_installed(&pulled).await?;
        ensure_installed(&pushed).await?;
        ensure_installed(&dynamic).await?;
        ensure_installed(&generators).await?;

        let registry = ResourceRegistry::new(shutdown.clone());
        let (pull_trigger, pull_events) = mpsc::unbounded();
        let ctx = self
            .state
            .to_context(client, self.config.clone(), registry, pull_trigger)?;

        let pulls = controller(pulled)
            .reconcile_on(pull_events)
            .run(reconcile::<PulledSecret>, error_policy::<PulledSecret>, ctx.clone());

        let pushes = controller(pushed);
        let by_secret = pushes.store();
        let by_generator = pushes.store();
        let pushes = pushes
            .watches(secrets, Config::default().any_semantic(), move |secret: Secret| {
                let (namespace, name) = (secret.namespace().unwrap_or_default(), secret.name_any());
                by_secret
                    .state()
                    .into_iter()
                    .filter(|push| push.spec.references_secret(&namespace, &name))
                    .map(|push| ObjectRef::from_obj(&*push))
                    .collect::<Vec<_>>()
            })
            .watches(generators, Config::default(), move |generator: ClusterGenerator| {
                let name = generator.name_any();
                by_generator
                    .state()
                    .into_iter()
                    .filter(|push| push.spec.references_generator(&name))
                    .map(|push| ObjectRef::from_obj(&*push))
                    .collect::<Vec<_>>()
            })
            .run(reconcile::<PushedSecret>, error_policy::<PushedSecret>, ctx.clone());

        let dynamics = controller(dynamic).run(
            reconcile::<DynamicSecret>,
            error_policy::<DynamicSecret>,
            ctx.clone(),
        );

        info!(namespace = ?self.config.namespace, "starting controllers");
        self.state.ready.store(true, Ordering::SeqCst);
        tokio::join!(drain(pulls), drain(pushes), drain(dynamics));

        shutdown.cancel();
        self.state.ready.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Requeue after the resource's own interval, dropping cached authentication the platform rejected
fn error_policy<K>(resource: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Reconcile,
{
    warn!(name = %resource.name_any(), "reconcile failed: {error}");
    ctx.metrics.reconcile_failure(resource.as_ref(), error);
    if error.requires_reauthentication() {
        if let Some(uid) = resource.uid() {
            ctx.registry.clear_auth(&uid);
        }
    }
    Action::requeue(resource.retry_interval())
}

/// Shared entry point for every kind: tracing, metrics and the finalizer protocol
#[instrument(skip(ctx, resource), fields(trace_id, kind = %K::kind(&())))]
async fn reconcile<K>(resource: Arc<K>, ctx: Arc<Context>) -> Result<Action>
where
    K: Reconcile
        + Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(&K::kind(&()));
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = resource.name_any();
    let namespace = reconcilers::namespace(resource.as_ref())?;
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(r#"Starting {} reconciliation for "{namespace}/{name}""#, K::kind(&()));
    finalizer(&api, K::FINALIZER, resource, |event| async {
        match event {
            Finalizer::Apply(r) => r.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(r) => r.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    #[test]
    fn status_only_changes_are_filtered() {
        let mut pulled = PulledSecret::default();
        pulled.metadata.generation = Some(1);
        let before = reconcile_worthy(&pulled);

        pulled.status = Some(Default::default());
        pulled.metadata.resource_version = Some("2".into());
        assert_eq!(reconcile_worthy(&pulled), before);

        pulled.metadata.generation = Some(2);
        assert_ne!(reconcile_worthy(&pulled), before);
    }

    #[test]
    fn deletion_and_finalizers_pass_the_filter() {
        let mut pulled = PulledSecret::default();
        let initial = reconcile_worthy(&pulled);

        pulled.metadata.finalizers = Some(vec![PulledSecret::FINALIZER.into()]);
        let finalized = reconcile_worthy(&pulled);
        assert_ne!(finalized, initial);

        pulled.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert_ne!(reconcile_worthy(&pulled), finalized);
    }

    #[test]
    fn readiness_follows_the_controllers() {
        let state = State::default();
        assert!(!state.is_ready());
        state.ready.store(true, Ordering::SeqCst);
        assert!(state.clone().is_ready());
    }
}
