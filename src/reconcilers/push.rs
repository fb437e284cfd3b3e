use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use kube::{
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::{authenticate, interval, log_cleanup_failure, patch_status, platform_entry, uid, Context, Reconcile};
use crate::{
    auth::Credentials,
    conditions::{self, ConditionUpdate},
    generators,
    platform::{ListSecretsRequest, PlatformApi, ProjectSelector, Secret, SecretTarget},
    resources::{
        read_secret, ClusterGenerator, DeletionPolicy, GeneratorSource, KubeSecretReference,
        PushDestination, PushedSecret, UpdatePolicy,
    },
    template::{self, TemplateValue},
    Error, Result,
};

/// Outcome of one push pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Platform secret id to key, after the pass
    pub managed: BTreeMap<String, String>,
    pub failed_to_create: Vec<String>,
    pub failed_to_update: Vec<String>,
    pub failed_to_delete: Vec<String>,
    pub failed_to_replace: Vec<String>,
}

impl SyncReport {
    pub fn conditions(&self) -> Vec<ConditionUpdate> {
        vec![
            conditions::failed_keys(conditions::FAILED_TO_CREATE, "create", &self.failed_to_create),
            conditions::failed_keys(conditions::FAILED_TO_UPDATE, "update", &self.failed_to_update),
            conditions::failed_keys(conditions::FAILED_TO_DELETE, "delete", &self.failed_to_delete),
            conditions::failed_keys(conditions::FAILED_TO_REPLACE, "replace", &self.failed_to_replace),
        ]
    }
}

/// Writes against one platform folder, tracking what the folder looks like after each of them
struct Pass<'a> {
    platform: &'a dyn PlatformApi,
    target: &'a SecretTarget,
    policy: UpdatePolicy,
    /// Remote secrets by key
    remote: BTreeMap<String, Secret>,
    report: SyncReport,
}

impl Pass<'_> {
    fn remote_by_id(&self, id: &str) -> Option<&Secret> {
        self.remote.values().find(|s| s.id == id)
    }

    async fn create(&mut self, key: &str, value: &str) -> bool {
        match self.platform.create_secret(self.target, key, value).await {
            Ok(created) => {
                self.report.managed.insert(created.id.clone(), key.to_string());
                self.remote.insert(key.to_string(), created);
                true
            }
            Err(e) => {
                warn!(%key, "unable to create secret: {e}");
                false
            }
        }
    }

    /// Overwrite a remote value and take ownership of the secret
    async fn update(&mut self, key: &str, value: &str) -> bool {
        match self.platform.update_secret(self.target, key, value).await {
            Ok(updated) => {
                let id = match self.remote.get_mut(key) {
                    Some(existing) => {
                        existing.value = value.to_string();
                        if updated.id.is_empty() {
                            existing.id.clone()
                        } else {
                            updated.id
                        }
                    }
                    None => updated.id,
                };
                self.report.managed.insert(id, key.to_string());
                true
            }
            Err(e) => {
                warn!(%key, "unable to update secret: {e}");
                false
            }
        }
    }

    async fn first_sync(&mut self, desired: &BTreeMap<String, String>) {
        for (key, value) in desired {
            match self.remote.get(key).map(|s| s.value.clone()) {
                Some(current) => {
                    if self.policy != UpdatePolicy::Replace {
                        debug!(%key, "secret exists and is not replaced");
                        continue;
                    }
                    if current == *value {
                        if let Some(existing) = self.remote.get(key) {
                            self.report.managed.insert(existing.id.clone(), key.clone());
                        }
                    } else if !self.update(key, value).await {
                        self.report.failed_to_update.push(key.clone());
                    }
                }
                None => {
                    if !self.create(key, value).await {
                        self.report.failed_to_create.push(key.clone());
                    }
                }
            }
        }
    }

    /// Managed secrets renamed on the platform are recreated under their managed key
    async fn rekey(&mut self, managed: &BTreeMap<String, String>) {
        for (id, managed_key) in managed {
            let Some(current) = self.remote_by_id(id).cloned() else {
                continue;
            };
            if current.key == *managed_key {
                continue;
            }

            info!(%id, from = %current.key, to = %managed_key, "managed secret was renamed, recreating it");
            if let Err(e) = self.platform.delete_secret(self.target, &current.key).await {
                warn!(key = %current.key, "unable to delete renamed secret: {e}");
                self.report.failed_to_replace.push(managed_key.clone());
                continue;
            }
            self.remote.remove(&current.key);
            self.report.managed.remove(id);

            if !self.create(managed_key, &current.value).await {
                self.report.failed_to_replace.push(managed_key.clone());
            }
        }
    }

    /// Managed keys no longer desired are deleted, unless the remote key now belongs to another secret
    async fn prune(&mut self, desired: &BTreeMap<String, String>) {
        let stale: Vec<(String, String)> = self
            .report
            .managed
            .iter()
            .filter(|(_, key)| !desired.contains_key(*key))
            .map(|(id, key)| (id.clone(), key.clone()))
            .collect();

        for (id, key) in stale {
            let owned = self.remote.get(&key).is_some_and(|s| s.id == id);
            if !owned {
                self.report.managed.remove(&id);
                continue;
            }

            info!(%key, "secret removed from source, deleting it");
            match self.platform.delete_secret(self.target, &key).await {
                Ok(_) => {
                    self.remote.remove(&key);
                    self.report.managed.remove(&id);
                }
                Err(e) => {
                    warn!(%key, "unable to delete secret: {e}");
                    self.report.failed_to_delete.push(key);
                }
            }
        }
    }

    async fn add(&mut self, desired: &BTreeMap<String, String>) {
        for (key, value) in desired {
            let current = self.remote.get(key).map(|s| s.value != *value);
            match current {
                None => {
                    info!(%key, "secret added to source, creating it");
                    if !self.create(key, value).await {
                        self.report.failed_to_create.push(key.clone());
                    }
                }
                Some(true) if self.policy == UpdatePolicy::Replace => {
                    info!(%key, "replacing existing secret");
                    if !self.update(key, value).await {
                        self.report.failed_to_update.push(key.clone());
                    }
                }
                Some(_) => {}
            }
        }
    }

    async fn update_values(&mut self, desired: &BTreeMap<String, String>) {
        for (key, value) in desired {
            let Some((id, current)) = self.remote.get(key).map(|s| (s.id.clone(), s.value.clone())) else {
                continue;
            };
            if current == *value {
                continue;
            }
            let is_managed = self.report.managed.contains_key(&id);
            if !is_managed && self.policy != UpdatePolicy::Replace {
                continue;
            }

            info!(%key, "secret value changed, updating it");
            if !self.update(key, value).await && !self.report.failed_to_update.contains(key) {
                self.report.failed_to_update.push(key.clone());
            }
        }
    }
}

/// Bring one platform folder in line with `desired`.
///
/// `managed` is the id to key record from the previous pass; an empty record is treated as
/// the first pass. Individual write failures are reported, never returned.
pub async fn sync(
    platform: &dyn PlatformApi,
    target: &SecretTarget,
    desired: &BTreeMap<String, String>,
    existing: Vec<Secret>,
    managed: &BTreeMap<String, String>,
    policy: UpdatePolicy,
) -> SyncReport {
    let mut pass = Pass {
        platform,
        target,
        policy,
        remote: existing.into_iter().map(|s| (s.key.clone(), s)).collect(),
        report: SyncReport {
            managed: managed.clone(),
            ..Default::default()
        },
    };

    if managed.is_empty() {
        pass.first_sync(desired).await;
    } else {
        pass.rekey(managed).await;
        pass.prune(desired).await;
        pass.add(desired).await;
        pass.update_values(desired).await;
    }

    let present: BTreeSet<&str> = pass.remote.values().map(|s| s.id.as_str()).collect();
    pass.report.managed.retain(|id, _| present.contains(id.as_str()));
    pass.report
}

/// Delete every managed secret still present on the platform, returning the keys that failed
pub async fn delete_managed(
    platform: &dyn PlatformApi,
    target: &SecretTarget,
    existing: &[Secret],
    managed: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut failed = vec![];
    for secret in existing.iter().filter(|s| managed.contains_key(&s.id)) {
        match platform.delete_secret(target, &secret.key).await {
            Ok(_) => info!(key = %secret.key, "deleted managed secret"),
            Err(e) => {
                warn!(key = %secret.key, "unable to delete managed secret: {e}");
                failed.push(secret.key.clone());
            }
        }
    }
    failed
}

fn folder_request(project: ProjectSelector, destination: &PushDestination) -> ListSecretsRequest {
    ListSecretsRequest {
        project,
        environment: destination.environment_slug.clone(),
        secret_path: destination.secrets_path.clone(),
        recursive: false,
        include_imports: false,
        expand_references: false,
    }
}

/// Project id of the destination, looking it up by slug when no id is given
pub async fn resolve_project(platform: &dyn PlatformApi, destination: &PushDestination) -> Result<String> {
    if let Some(id) = destination.project_id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }
    let slug = destination
        .project_slug
        .as_deref()
        .filter(|slug| !slug.is_empty())
        .ok_or_else(|| {
            Error::IllegalResource(
                "destination".into(),
                "one of projectId or projectSlug is required".into(),
            )
        })?;

    let probe = platform
        .list_secrets(&folder_request(ProjectSelector::Slug(slug.into()), destination))
        .await?;
    if let Some(workspace) = probe.first().map(|s| &s.workspace).filter(|w| !w.is_empty()) {
        return Ok(workspace.clone());
    }
    Ok(platform.get_project_by_slug(slug).await?.id)
}

/// Template variables of a cluster secret, every value addressed at the destination folder
fn template_vars(data: BTreeMap<String, String>, secret_path: &str) -> BTreeMap<String, TemplateValue> {
    data.into_iter()
        .map(|(key, value)| {
            (
                key,
                TemplateValue {
                    value,
                    secret_path: secret_path.to_string(),
                },
            )
        })
        .collect()
}

/// A managed generated value keeps its platform value instead of being regenerated
fn stable_value(
    key: &str,
    managed: &BTreeMap<String, String>,
    remote: &BTreeMap<&str, &Secret>,
) -> Option<String> {
    remote
        .get(key)
        .filter(|s| managed.get(&s.id).is_some_and(|k| k == key))
        .map(|s| s.value.clone())
}

async fn generated_values(
    client: Client,
    sources: &[GeneratorSource],
    managed: &BTreeMap<String, String>,
    existing: &[Secret],
) -> Result<BTreeMap<String, String>> {
    let remote: BTreeMap<&str, &Secret> = existing.iter().map(|s| (s.key.as_str(), s)).collect();
    let generators: Api<ClusterGenerator> = Api::all(client);

    let mut values = BTreeMap::new();
    for source in sources {
        let key = &source.destination_secret_name;
        if let Some(value) = stable_value(key, managed, &remote) {
            values.insert(key.clone(), value);
            continue;
        }

        let name = &source.generator_ref.name;
        let generator = generators.get_opt(name).await?.ok_or_else(|| {
            Error::IllegalResource(format!("ClusterGenerator/{name}"), "not found".into())
        })?;
        let definition = &generator.spec.generator;
        if definition.kind != source.generator_ref.kind {
            return Err(Error::IllegalResource(
                format!("ClusterGenerator/{name}"),
                format!("is a {:?} generator, not {:?}", definition.kind, source.generator_ref.kind),
            ));
        }
        values.insert(key.clone(), generators::generate(definition)?);
    }
    Ok(values)
}

impl PushedSecret {
    /// The source secret after templating, merged with generated values
    async fn desired(
        &self,
        ctx: &Context,
        managed: &BTreeMap<String, String>,
        existing: &[Secret],
    ) -> Result<BTreeMap<String, String>> {
        let mut desired = BTreeMap::new();

        if let Some(source) = &self.spec.push.secret {
            let reference = KubeSecretReference {
                secret_name: source.secret_name.clone(),
                secret_namespace: source.secret_namespace.clone(),
            };
            let data = read_secret(ctx.client.clone(), ctx.config.namespace.as_deref(), &reference).await?;
            let vars = template_vars(data, &self.spec.destination.secrets_path);
            desired.extend(
                template::project(source.template.as_ref(), &vars)?
                    .into_iter()
                    .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned())),
            );
        }

        desired.extend(
            generated_values(ctx.client.clone(), &self.spec.push.generators, managed, existing).await?,
        );
        Ok(desired)
    }

    fn target(&self, project_id: String) -> SecretTarget {
        SecretTarget {
            project_id,
            environment: self.spec.destination.environment_slug.clone(),
            secret_path: self.spec.destination.secrets_path.clone(),
        }
    }

    async fn push(
        &self,
        ctx: &Context,
        conditions: &mut Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
        managed: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let (uid, entry) =
            platform_entry(ctx, self, self.spec.host_api.as_deref(), self.spec.tls.as_ref()).await?;
        let generation = self.metadata.generation;
        authenticate(
            ctx,
            &uid,
            &entry,
            Credentials::Identity(&self.spec.authentication),
            conditions,
            generation,
        )
        .await?;

        let platform = entry.platform.as_ref();
        let project_id = resolve_project(platform, &self.spec.destination).await?;
        let existing = platform
            .list_secrets(&folder_request(
                ProjectSelector::Id(project_id.clone()),
                &self.spec.destination,
            ))
            .await?;

        let desired = self.desired(ctx, managed, &existing).await?;
        let report = sync(
            platform,
            &self.target(project_id),
            &desired,
            existing,
            managed,
            self.spec.update_policy,
        )
        .await;

        conditions::set_conditions(conditions, report.conditions(), generation);
        *managed = report.managed;
        Ok(())
    }
}

#[async_trait]
impl Reconcile for PushedSecret {
    const FINALIZER: &'static str = "pushsecret.secrets.infisical.com/finalizer";

    #[instrument(skip(self, ctx), fields(name = %self.name_any()))]
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let status = self.status.clone().unwrap_or_default();
        let mut conditions = status.conditions;
        let mut managed = status.managed_secrets;

        let outcome = self.push(&ctx, &mut conditions, &mut managed).await;
        if let Err(e) = &outcome {
            warn!("push failed: {e}");
        }

        patch_status(
            &ctx,
            self,
            json!({ "conditions": conditions, "managedSecrets": managed }),
        )
        .await?;
        outcome?;

        Ok(Action::requeue(self.retry_interval()))
    }

    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let uid = uid(self)?;
        let managed = self
            .status
            .as_ref()
            .map(|s| s.managed_secrets.clone())
            .unwrap_or_default();

        if self.spec.deletion_policy == DeletionPolicy::Delete && !managed.is_empty() {
            if let Err(e) = self.delete_from_platform(&ctx, &uid, &managed).await {
                log_cleanup_failure("deleting managed secrets", &e);
            }
        }
        ctx.registry.remove(&uid);

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

impl PushedSecret {
    async fn delete_from_platform(
        &self,
        ctx: &Context,
        uid: &str,
        managed: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (_, entry) =
            platform_entry(ctx, self, self.spec.host_api.as_deref(), self.spec.tls.as_ref()).await?;
        let mut conditions = vec![];
        authenticate(
            ctx,
            uid,
            &entry,
            Credentials::Identity(&self.spec.authentication),
            &mut conditions,
            None,
        )
        .await?;

        let platform = entry.platform.as_ref();
        let project_id = resolve_project(platform, &self.spec.destination).await?;
        let existing = platform
            .list_secrets(&folder_request(
                ProjectSelector::Id(project_id.clone()),
                &self.spec.destination,
            ))
            .await?;

        let failed = delete_managed(platform, &self.target(project_id), &existing, managed).await;
        if !failed.is_empty() {
            warn!(keys = ?failed, "some managed secrets were left on the platform");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcilers::fake::{FakePlatform, PROJECT_ID, PROJECT_SLUG};

    fn target() -> SecretTarget {
        SecretTarget {
            project_id: PROJECT_ID.into(),
            environment: "dev".into(),
            secret_path: "/".into(),
        }
    }

    fn desired(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    async fn run(
        platform: &FakePlatform,
        wanted: &BTreeMap<String, String>,
        managed: &BTreeMap<String, String>,
        policy: UpdatePolicy,
    ) -> SyncReport {
        let existing = platform
            .list_secrets(&folder_request(
                ProjectSelector::Id(PROJECT_ID.into()),
                &PushDestination::default(),
            ))
            .await
            .unwrap();
        sync(platform, &target(), wanted, existing, managed, policy).await
    }

    fn assert_managed_invariant(platform: &FakePlatform, report: &SyncReport, wanted: &BTreeMap<String, String>) {
        for (id, key) in &report.managed {
            assert_eq!(platform.id(key).as_deref(), Some(id.as_str()));
            assert!(wanted.contains_key(key));
        }
    }

    #[tokio::test]
    async fn first_pass_creates_and_leaves_foreign_secrets_alone() {
        let platform = FakePlatform::with_secrets(&[("SHARED", "theirs")]);
        let wanted = desired(&[("SHARED", "ours"), ("API_KEY", "k1")]);

        let report = run(&platform, &wanted, &BTreeMap::new(), UpdatePolicy::None).await;

        assert_eq!(platform.value("SHARED").as_deref(), Some("theirs"));
        assert_eq!(platform.value("API_KEY").as_deref(), Some("k1"));
        assert_eq!(report.managed.len(), 1);
        assert_eq!(report.managed.values().next().map(String::as_str), Some("API_KEY"));
        assert_managed_invariant(&platform, &report, &wanted);
    }

    #[tokio::test]
    async fn replace_adopts_existing_secrets() {
        let platform = FakePlatform::with_secrets(&[("SHARED", "theirs")]);
        let foreign_id = platform.id("SHARED").unwrap();
        let wanted = desired(&[("SHARED", "ours")]);

        let report = run(&platform, &wanted, &BTreeMap::new(), UpdatePolicy::Replace).await;

        assert_eq!(platform.value("SHARED").as_deref(), Some("ours"));
        assert_eq!(report.managed.get(&foreign_id).map(String::as_str), Some("SHARED"));
    }

    #[tokio::test]
    async fn unchanged_sources_write_nothing() {
        let platform = FakePlatform::default();
        let wanted = desired(&[("A", "1"), ("B", "2")]);
        let first = run(&platform, &wanted, &BTreeMap::new(), UpdatePolicy::None).await;
        platform.clear_calls();

        let second = run(&platform, &wanted, &first.managed, UpdatePolicy::None).await;

        assert!(platform.calls().is_empty());
        assert_eq!(first.managed, second.managed);
    }

    #[tokio::test]
    async fn renamed_secrets_are_recreated_under_the_managed_key() {
        let platform = FakePlatform::default();
        let wanted = desired(&[("DB_URL", "postgres://db")]);
        let first = run(&platform, &wanted, &BTreeMap::new(), UpdatePolicy::None).await;

        platform.rename("DB_URL", "DATABASE_URL");
        platform.clear_calls();
        let report = run(&platform, &wanted, &first.managed, UpdatePolicy::None).await;

        assert_eq!(platform.calls(), vec!["delete:DATABASE_URL", "create:DB_URL"]);
        assert_eq!(platform.keys(), vec!["DB_URL"]);
        assert_eq!(report.managed.values().collect::<Vec<_>>(), vec!["DB_URL"]);
        assert_managed_invariant(&platform, &report, &wanted);
    }

    #[tokio::test]
    async fn renamed_source_keys_move_the_remote_secret() {
        let platform = FakePlatform::default();
        let first = run(&platform, &desired(&[("FOO", "1")]), &BTreeMap::new(), UpdatePolicy::Replace).await;
        let old_id = platform.id("FOO").unwrap();

        let wanted = desired(&[("FOOZ", "1")]);
        let report = run(&platform, &wanted, &first.managed, UpdatePolicy::Replace).await;

        assert_eq!(platform.keys(), vec!["FOOZ"]);
        assert_eq!(platform.value("FOOZ").as_deref(), Some("1"));
        assert_eq!(report.managed.values().collect::<Vec<_>>(), vec!["FOOZ"]);
        assert_ne!(platform.id("FOOZ"), Some(old_id));
        assert_managed_invariant(&platform, &report, &wanted);
    }

    #[tokio::test]
    async fn removed_keys_are_pruned_only_when_owned() {
        let platform = FakePlatform::default();
        let first = run(
            &platform,
            &desired(&[("A", "1"), ("B", "2")]),
            &BTreeMap::new(),
            UpdatePolicy::None,
        )
        .await;

        // B was replaced out of band by a secret this resource does not own
        platform.remove("B");
        platform.insert("B", "foreign");

        let wanted = desired(&[]);
        let report = run(&platform, &wanted, &first.managed, UpdatePolicy::None).await;

        assert_eq!(platform.keys(), vec!["B"]);
        assert_eq!(platform.value("B").as_deref(), Some("foreign"));
        assert!(report.managed.is_empty());
    }

    #[tokio::test]
    async fn values_follow_the_source_for_managed_secrets_only() {
        let platform = FakePlatform::with_secrets(&[("FOREIGN", "x")]);
        let first = run(&platform, &desired(&[("MINE", "1")]), &BTreeMap::new(), UpdatePolicy::None).await;

        let wanted = desired(&[("MINE", "2"), ("FOREIGN", "y")]);
        let report = run(&platform, &wanted, &first.managed, UpdatePolicy::None).await;

        assert_eq!(platform.value("MINE").as_deref(), Some("2"));
        assert_eq!(platform.value("FOREIGN").as_deref(), Some("x"));
        assert!(report.failed_to_update.is_empty());
    }

    #[tokio::test]
    async fn write_failures_become_conditions() {
        let platform = FakePlatform::default();
        platform.fail("BROKEN");
        let wanted = desired(&[("BROKEN", "1"), ("OK", "2")]);

        let report = run(&platform, &wanted, &BTreeMap::new(), UpdatePolicy::None).await;

        assert_eq!(report.failed_to_create, vec!["BROKEN"]);
        let updates = report.conditions();
        let create = updates
            .iter()
            .find(|u| u.type_ == conditions::FAILED_TO_CREATE)
            .unwrap();
        assert!(create.status);
        assert_eq!(create.message, "Failed to create secrets: [BROKEN]");
        assert!(updates
            .iter()
            .filter(|u| u.type_ != conditions::FAILED_TO_CREATE)
            .all(|u| !u.status));
    }

    #[tokio::test]
    async fn finalization_deletes_only_managed_secrets() {
        let platform = FakePlatform::with_secrets(&[("FOREIGN", "x")]);
        let report = run(&platform, &desired(&[("MINE", "1")]), &BTreeMap::new(), UpdatePolicy::None).await;
        let existing = run_list(&platform).await;

        let failed = delete_managed(&platform, &target(), &existing, &report.managed).await;

        assert!(failed.is_empty());
        assert_eq!(platform.keys(), vec!["FOREIGN"]);
    }

    async fn run_list(platform: &FakePlatform) -> Vec<Secret> {
        platform
            .list_secrets(&folder_request(
                ProjectSelector::Id(PROJECT_ID.into()),
                &PushDestination::default(),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn projects_resolve_by_id_then_slug() {
        let platform = FakePlatform::default();
        let by_id = PushDestination {
            project_id: Some("explicit".into()),
            ..Default::default()
        };
        assert_eq!(resolve_project(&platform, &by_id).await.unwrap(), "explicit");

        // empty folder: falls back to the slug lookup
        let by_slug = PushDestination {
            project_slug: Some(PROJECT_SLUG.into()),
            ..Default::default()
        };
        assert_eq!(resolve_project(&platform, &by_slug).await.unwrap(), PROJECT_ID);

        platform.insert("ANY", "1");
        assert_eq!(resolve_project(&platform, &by_slug).await.unwrap(), PROJECT_ID);

        assert!(resolve_project(&platform, &PushDestination::default()).await.is_err());
    }

    #[test]
    fn generated_values_are_stable_once_managed() {
        let secret = Secret {
            id: "s1".into(),
            key: "DB_PASSWORD".into(),
            value: "generated-before".into(),
            kind: "shared".into(),
            path: None,
            workspace: PROJECT_ID.into(),
        };
        let remote = BTreeMap::from([("DB_PASSWORD", &secret)]);

        let managed = BTreeMap::from([("s1".to_string(), "DB_PASSWORD".to_string())]);
        assert_eq!(
            stable_value("DB_PASSWORD", &managed, &remote).as_deref(),
            Some("generated-before")
        );
        assert_eq!(stable_value("DB_PASSWORD", &BTreeMap::new(), &remote), None);
        assert_eq!(stable_value("OTHER", &managed, &remote), None);
    }

    #[test]
    fn template_vars_point_at_the_destination_folder() {
        let vars = template_vars(BTreeMap::from([("A".into(), "1".into())]), "/app");
        assert_eq!(
            vars["A"],
            TemplateValue {
                value: "1".into(),
                secret_path: "/app".into(),
            }
        );
    }
}
