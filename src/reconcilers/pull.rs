use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::{
    api::PostParams,
    runtime::{
        controller::Action,
        events::{Event, EventType},
        reflector::ObjectRef,
    },
    Api, Client, ResourceExt,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::{
    authenticate, interval, managed_metadata, patch_status, platform_entry, uid, write_managed_secret,
    Context, Reconcile,
};
use crate::{
    auth::{AuthDetails, Credentials},
    conditions::{self, ConditionUpdate},
    platform::{self, ListSecretsRequest, PlatformApi, PlatformClient, ProjectSelector, Secret},
    registry::ResourceEntry,
    resources::{
        guard_namespace, parse_namespaces, ManagedKind, ManagedReference, PulledSecret, SecretsScope,
        SECRET_VERSION_ANNOTATION,
    },
    rollout, sse,
    template::{self, TemplateValue},
    Error, Result,
};

/// Stable digest of projected data, independent of insertion order
pub fn etag(data: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    hex::encode(hasher.finalize())
}

/// Template variables of fetched secrets, addressed by key
pub fn template_vars(secrets: &[Secret], default_path: &str) -> BTreeMap<String, TemplateValue> {
    secrets
        .iter()
        .map(|secret| {
            (
                secret.key.clone(),
                TemplateValue {
                    value: secret.value.clone(),
                    secret_path: secret.path.clone().unwrap_or_else(|| default_path.to_string()),
                },
            )
        })
        .collect()
}

fn scope_request(scope: &SecretsScope) -> ListSecretsRequest {
    ListSecretsRequest {
        project: ProjectSelector::Slug(scope.project_slug.clone()),
        environment: scope.env_slug.clone(),
        secret_path: scope.path().to_string(),
        recursive: scope.recursive,
        include_imports: true,
        expand_references: true,
    }
}

/// Secrets visible to the established credentials
async fn fetch(platform: &PlatformClient, details: &AuthDetails) -> Result<(Vec<Secret>, String)> {
    if let Some(legacy) = &details.legacy {
        let secrets = legacy.fetch_secrets(platform).await?;
        return Ok((secrets, legacy.secret_path.clone()));
    }

    let scope = details.scope.as_ref().ok_or_else(|| {
        Error::IllegalResource(
            "authentication".into(),
            format!("{} requires a secretsScope", details.strategy),
        )
    })?;
    let secrets = platform.list_secrets(&scope_request(scope)).await?;
    Ok((secrets, scope.path().to_string()))
}

async fn write_config_map(
    client: Client,
    owner: &PulledSecret,
    destination: &ManagedReference,
    namespace: &str,
    data: &BTreeMap<String, Vec<u8>>,
    version: &str,
) -> Result<bool> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let data: BTreeMap<String, String> = data
        .iter()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
        .collect();
    let name = &destination.name;

    match api.get_opt(name).await? {
        None => {
            let config_map = ConfigMap {
                metadata: managed_metadata(owner, name, namespace, destination.creation_policy, version),
                data: Some(data),
                ..Default::default()
            };
            api.create(&PostParams::default(), &config_map).await?;
            info!(%namespace, %name, "created managed config map");
            Ok(true)
        }
        Some(mut existing) => {
            let unchanged = existing.annotations().get(SECRET_VERSION_ANNOTATION).map(String::as_str)
                == Some(version)
                && existing.data.as_ref() == Some(&data);
            if unchanged {
                return Ok(false);
            }
            existing
                .annotations_mut()
                .insert(SECRET_VERSION_ANNOTATION.into(), version.into());
            existing.data = Some(data);
            api.replace(name, &PostParams::default(), &existing).await?;
            info!(%namespace, %name, "updated managed config map");
            Ok(true)
        }
    }
}

impl PulledSecret {
    /// Write one destination into each of its namespaces, returning the workloads restarted
    async fn write_destination(
        &self,
        ctx: &Context,
        destination: &ManagedReference,
        vars: &BTreeMap<String, TemplateValue>,
    ) -> Result<usize> {
        let data = template::project(destination.template.as_ref(), vars)?;
        let version = etag(&data);
        let namespaces = parse_namespaces(&destination.namespaces);
        if namespaces.is_empty() {
            return Err(Error::IllegalResource(
                destination.name.clone(),
                "no destination namespace given".into(),
            ));
        }

        let mut restarted = 0;
        for namespace in namespaces {
            guard_namespace(
                ctx.config.namespace.as_deref(),
                destination.kind.as_str(),
                &destination.name,
                &namespace,
            )?;

            let written = match destination.kind {
                ManagedKind::Secret => {
                    write_managed_secret(
                        ctx.client.clone(),
                        self,
                        &destination.name,
                        &namespace,
                        &destination.secret_type,
                        destination.creation_policy,
                        data.clone(),
                        &version,
                    )
                    .await?
                }
                ManagedKind::ConfigMap => {
                    write_config_map(ctx.client.clone(), self, destination, &namespace, &data, &version)
                        .await?
                }
            };
            if !written {
                debug!(%namespace, name = %destination.name, "destination up to date");
            }

            restarted += rollout::restart_workloads(
                ctx.client.clone(),
                &namespace,
                destination.kind,
                &destination.name,
                &version,
            )
            .await;
        }
        Ok(restarted)
    }

    /// Keep an event stream open while instant updates are wanted, close it otherwise
    async fn instant_updates(&self, ctx: &Context, entry: &ResourceEntry, details: &AuthDetails) {
        let scope = details
            .scope
            .clone()
            .filter(|_| self.spec.instant_updates && details.strategy.is_machine_identity());
        let Some(scope) = scope else {
            entry.events.close().await;
            return;
        };

        let platform = entry.platform.clone();
        let subscription = entry
            .events
            .subscribe(|| async move {
                let project = platform.get_project_by_slug(&scope.project_slug).await?;
                let response = platform
                    .subscribe_project_events(
                        &project.id,
                        &scope.env_slug,
                        &sse::subscription_path(scope.path(), scope.recursive),
                    )
                    .await?;
                Ok::<_, platform::Error>(response.bytes_stream())
            })
            .await;

        match subscription {
            Ok(Some(subscription)) => {
                info!("subscribed to platform events");
                sse::forward(subscription, ObjectRef::from_obj(self), ctx.pull_trigger.clone());
            }
            Ok(None) => {}
            Err(e) => warn!("unable to subscribe to platform events, relying on resync: {e}"),
        }
    }

    async fn pull(&self, ctx: &Context, conditions: &mut Vec<Condition>) -> Result<usize> {
        let destinations = self.spec.destinations()?;
        let (uid, entry) =
            platform_entry(ctx, self, self.spec.host_api.as_deref(), self.spec.tls.as_ref()).await?;
        let generation = self.metadata.generation;

        let details = authenticate(
            ctx,
            &uid,
            &entry,
            Credentials::Pull(&self.spec.authentication),
            conditions,
            generation,
        )
        .await?;

        let (secrets, path) = fetch(&entry.platform, &details).await?;
        let vars = template_vars(&secrets, &path);

        let mut restarted = 0;
        for destination in destinations {
            restarted += self.write_destination(ctx, destination, &vars).await?;
        }
        conditions::set_condition(
            conditions,
            ConditionUpdate::ok(
                conditions::AUTO_REDEPLOY_READY,
                "AutoRedeployReady",
                format!("Restarted {restarted} workloads for new secret versions"),
            ),
            generation,
        );

        self.instant_updates(ctx, &entry, &details).await;
        Ok(secrets.len())
    }
}

#[async_trait]
impl Reconcile for PulledSecret {
    const FINALIZER: &'static str = "secrets.finalizers.infisical.com";

    #[instrument(skip(self, ctx), fields(name = %self.name_any()))]
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let mut conditions = self.status.clone().unwrap_or_default().conditions;
        let generation = self.metadata.generation;

        let outcome = self.pull(&ctx, &mut conditions).await;
        let update = match &outcome {
            Ok(count) => ConditionUpdate::ok(
                conditions::READY_TO_SYNC,
                "OK",
                format!("Infisical controller has located the Infisical token in provided Kubernetes secret and has successfully synced {count} secrets"),
            ),
            Err(e) => ConditionUpdate::failed(
                conditions::READY_TO_SYNC,
                "Error",
                format!("Failed to update secret because: {e}"),
            ),
        };
        conditions::set_condition(&mut conditions, update, generation);

        patch_status(&ctx, self, json!({ "conditions": conditions })).await?;
        outcome?;

        Ok(Action::requeue(self.retry_interval()))
    }

    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        ctx.registry.remove(&uid(self)?);

        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("Delete `{}`", self.name_any())),
                action: "Deleting".into(),
                secondary: None,
            })
            .await?;

        Ok(Action::await_change())
    }

    fn retry_interval(&self) -> Duration {
        interval(self.spec.resync_interval)
    }
}
