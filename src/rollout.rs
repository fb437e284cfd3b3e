use std::fmt::Debug;

use futures::future::join_all;
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, StatefulSet},
        core::v1::{Container, PodSpec, PodTemplateSpec},
    },
    NamespaceResourceScope,
};
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Client, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{resources::ManagedKind, Result};

/// Workloads opt in to restarts with this annotation set to `"true"`
pub const AUTO_RELOAD_ANNOTATION: &str = "secrets.infisical.com/auto-reload";

const MANAGED_SECRET_ANNOTATION_PREFIX: &str = "secrets.infisical.com/managed-secret";

/// Annotation recording the version of a managed resource a workload last restarted for
pub fn managed_secret_annotation(name: &str) -> String {
    format!("{MANAGED_SECRET_ANNOTATION_PREFIX}.{name}")
}

/// Workload kinds whose pod template can be restarted by annotating it
pub trait Workload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
    fn template(&self) -> Option<&PodTemplateSpec>;
}

impl Workload for Deployment {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

impl Workload for DaemonSet {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

impl Workload for StatefulSet {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

fn container_references(container: &Container, kind: ManagedKind, name: &str) -> bool {
    let is = |candidate: Option<&String>| candidate.is_some_and(|c| c == name);

    let from_env_from = container.env_from.iter().flatten().any(|source| match kind {
        ManagedKind::Secret => is(source.secret_ref.as_ref().and_then(|r| r.name.as_ref())),
        ManagedKind::ConfigMap => is(source.config_map_ref.as_ref().and_then(|r| r.name.as_ref())),
    });

    let from_env = container
        .env
        .iter()
        .flatten()
        .filter_map(|var| var.value_from.as_ref())
        .any(|source| match kind {
            ManagedKind::Secret => is(source.secret_key_ref.as_ref().and_then(|r| r.name.as_ref())),
            ManagedKind::ConfigMap => {
                is(source.config_map_key_ref.as_ref().and_then(|r| r.name.as_ref()))
            }
        });

    from_env_from || from_env
}

/// Whether any container or volume of the pod consumes the named resource
pub fn pod_references(pod: &PodSpec, kind: ManagedKind, name: &str) -> bool {
    let is = |candidate: Option<&String>| candidate.is_some_and(|c| c == name);

    let containers = pod
        .containers
        .iter()
        .chain(pod.init_containers.iter().flatten())
        .any(|c| container_references(c, kind, name));

    let volumes = pod.volumes.iter().flatten().any(|volume| {
        let direct = match kind {
            ManagedKind::Secret => is(volume.secret.as_ref().and_then(|s| s.secret_name.as_ref())),
            ManagedKind::ConfigMap => is(volume.config_map.as_ref().and_then(|c| c.name.as_ref())),
        };
        let projected = volume
            .projected
            .as_ref()
            .and_then(|p| p.sources.as_ref())
            .into_iter()
            .flatten()
            .any(|source| match kind {
                ManagedKind::Secret => is(source.secret.as_ref().and_then(|s| s.name.as_ref())),
                ManagedKind::ConfigMap => {
                    is(source.config_map.as_ref().and_then(|c| c.name.as_ref()))
                }
            });
        direct || projected
    });

    containers || volumes
}

/// Whether `workload` opted in, consumes the resource and has not yet restarted for `etag`
pub fn needs_restart<W: Workload>(workload: &W, kind: ManagedKind, name: &str, etag: &str) -> bool {
    let opted_in = workload
        .annotations()
        .get(AUTO_RELOAD_ANNOTATION)
        .is_some_and(|v| v == "true");
    let Some(template) = workload.template() else {
        return false;
    };
    let Some(pod) = template.spec.as_ref() else {
        return false;
    };

    let current = template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(&managed_secret_annotation(name)));

    opted_in && current.map(String::as_str) != Some(etag) && pod_references(pod, kind, name)
}

/// Merge patch stamping the new version on the workload and its pod template
pub fn restart_patch(name: &str, etag: &str) -> serde_json::Value {
    let annotation = managed_secret_annotation(name);
    json!({
        "metadata": { "annotations": { &annotation: etag } },
        "spec": { "template": { "metadata": { "annotations": { &annotation: etag } } } },
    })
}

async fn restart_kind<W: Workload>(
    client: Client,
    namespace: &str,
    kind: ManagedKind,
    name: &str,
    etag: &str,
) -> Result<usize> {
    let api: Api<W> = Api::namespaced(client, namespace);
    let candidates: Vec<W> = api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|w| needs_restart(w, kind, name, etag))
        .collect();

    let patch = restart_patch(name, etag);
    let params = PatchParams::default();
    let results = join_all(candidates.iter().map(|workload| {
        let api = api.clone();
        let patch = &patch;
        let params = &params;
        async move {
            let workload_name = workload.name_any();
            let result = api
                .patch(&workload_name, params, &Patch::Merge(patch))
                .await;
            (workload_name, result)
        }
    }))
    .await;

    let mut restarted = 0;
    for (workload_name, result) in results {
        match result {
            Ok(_) => {
                info!(kind = W::kind(&()).as_ref(), %namespace, workload = %workload_name, "restarting for new secret version");
                restarted += 1;
            }
            Err(e) => warn!(kind = W::kind(&()).as_ref(), %namespace, workload = %workload_name, "unable to restart: {e}"),
        }
    }
    Ok(restarted)
}

/// Restart every opted in workload of `namespace` consuming the managed resource.
///
/// Failures are logged and never fail the caller. Returns the number of workloads restarted.
pub async fn restart_workloads(
    client: Client,
    namespace: &str,
    kind: ManagedKind,
    name: &str,
    etag: &str,
) -> usize {
    let (deployments, daemon_sets, stateful_sets) = tokio::join!(
        restart_kind::<Deployment>(client.clone(), namespace, kind, name, etag),
        restart_kind::<DaemonSet>(client.clone(), namespace, kind, name, etag),
        restart_kind::<StatefulSet>(client, namespace, kind, name, etag),
    );

    let restarted: usize = [deployments, daemon_sets, stateful_sets]
        .into_iter()
        .map(|result| {
            result.unwrap_or_else(|e| {
                warn!(%namespace, "unable to list workloads: {e}");
                0
            })
        })
        .sum();
    debug!(%namespace, managed = name, restarted, "rollout scan finished");
    restarted
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_json_diff::assert_json_eq;
    use k8s_openapi::{
        api::{
            apps::v1::DeploymentSpec,
            core::v1::{
                ConfigMapProjection, EnvFromSource, EnvVar, EnvVarSource, ProjectedVolumeSource,
                SecretEnvSource, SecretKeySelector, SecretVolumeSource, Volume, VolumeProjection,
            },
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    use super::*;

    fn deployment(opted_in: bool, pod: PodSpec, stamped: Option<&str>) -> Deployment {
        let mut annotations = BTreeMap::new();
        if opted_in {
            annotations.insert(AUTO_RELOAD_ANNOTATION.to_string(), "true".to_string());
        }
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".into()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        annotations: stamped.map(|etag| {
                            BTreeMap::from([(managed_secret_annotation("db-creds"), etag.to_string())])
                        }),
                        ..Default::default()
                    }),
                    spec: Some(pod),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn env_from_secret(name: &str) -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "app".into(),
                env_from: Some(vec![EnvFromSource {
                    secret_ref: Some(SecretEnvSource {
                        name: Some(name.into()),
                        optional: None,
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn every_reference_form_is_detected() {
        assert!(pod_references(&env_from_secret("db-creds"), ManagedKind::Secret, "db-creds"));
        assert!(!pod_references(&env_from_secret("db-creds"), ManagedKind::ConfigMap, "db-creds"));

        let env = PodSpec {
            init_containers: Some(vec![Container {
                name: "migrate".into(),
                env: Some(vec![EnvVar {
                    name: "PASSWORD".into(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: Some("db-creds".into()),
                            key: "password".into(),
                            optional: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(pod_references(&env, ManagedKind::Secret, "db-creds"));

        let volume = PodSpec {
            volumes: Some(vec![Volume {
                name: "creds".into(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some("db-creds".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(pod_references(&volume, ManagedKind::Secret, "db-creds"));

        let projected = PodSpec {
            volumes: Some(vec![Volume {
                name: "settings".into(),
                projected: Some(ProjectedVolumeSource {
                    sources: Some(vec![VolumeProjection {
                        config_map: Some(ConfigMapProjection {
                            name: Some("settings".into()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(pod_references(&projected, ManagedKind::ConfigMap, "settings"));
        assert!(!pod_references(&projected, ManagedKind::Secret, "settings"));
    }

    #[test]
    fn only_opted_in_stale_consumers_restart() {
        let pod = env_from_secret("db-creds");
        assert!(needs_restart(&deployment(true, pod.clone(), None), ManagedKind::Secret, "db-creds", "v2"));
        assert!(needs_restart(&deployment(true, pod.clone(), Some("v1")), ManagedKind::Secret, "db-creds", "v2"));
        assert!(!needs_restart(&deployment(true, pod.clone(), Some("v2")), ManagedKind::Secret, "db-creds", "v2"));
        assert!(!needs_restart(&deployment(false, pod.clone(), None), ManagedKind::Secret, "db-creds", "v2"));
        assert!(!needs_restart(&deployment(true, pod, None), ManagedKind::Secret, "other", "v2"));
    }

    #[test]
    fn patches_stamp_workload_and_template() {
        assert_json_eq!(
            restart_patch("db-creds", "abc"),
            json!({
                "metadata": { "annotations": { "secrets.infisical.com/managed-secret.db-creds": "abc" } },
                "spec": { "template": { "metadata": { "annotations": {
                    "secrets.infisical.com/managed-secret.db-creds": "abc"
                } } } }
            })
        );
    }
}
