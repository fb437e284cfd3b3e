use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::PostParams,
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
    Api, ResourceExt,
};
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::{
    authenticate, log_cleanup_failure, patch_status, platform_entry, uid, write_managed_secret, Context,
    Reconcile,
};
use crate::{
    auth::Credentials,
    conditions::{self, ConditionUpdate},
    platform::{self, CreateLeaseRequest, CreatedLease, Lease, LeaseScope, PlatformApi},
    resources::{
        guard_namespace, DynamicSecret, DynamicSecretSource, DynamicSecretStatus, LeaseStatus,
        ManagedKind, RevocationPolicy,
    },
    rollout, Error, Result,
};

/// Requeue after a lease was created or renewed
pub const SHORT_REQUEUE: Duration = Duration::from_secs(5);
const MAX_REQUEUE: Duration = Duration::from_secs(5 * 60);

/// Leases this close to expiry are always renewed
const RENEWAL_FLOOR: Duration = Duration::from_secs(30);

/// A new lease is created once less than this share of the max TTL is left
const MAX_TTL_REMAINING_RATIO: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAction {
    Create,
    Renew,
    Keep,
}

/// Share of the original lease duration below which a lease is renewed
pub fn renewal_jitter() -> f64 {
    rand::thread_rng().gen_range(0.20..0.30)
}

/// Lease durations as reported by the platform: humantime (`24h`) or plain seconds
pub fn parse_ttl(field: &str, raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    humantime::parse_duration(raw)
        .or_else(|_| raw.parse::<u64>().map(Duration::from_secs))
        .map_err(|_| Error::IllegalResource(field.into(), format!("`{raw}` is not a duration")))
}

fn scaled(duration: chrono::Duration, factor: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((duration.num_milliseconds() as f64 * factor) as i64)
}

fn signed(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}

/// What to do with the current lease at `now`
pub fn decide(
    lease: Option<&LeaseStatus>,
    max_ttl: Option<Duration>,
    now: DateTime<Utc>,
    jitter: f64,
) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };

    // a max TTL reaching past the calendar is no ceiling at all
    let ceiling = max_ttl
        .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .and_then(|ttl| Some((lease.creation_timestamp.checked_add_signed(ttl)?, ttl)));
    if let Some((ceiling, max_ttl)) = ceiling {
        if ceiling - now <= scaled(max_ttl, MAX_TTL_REMAINING_RATIO) {
            return LeaseAction::Create;
        }
    }

    let until_expiry = lease.expires_at - now;
    if until_expiry < chrono::Duration::zero() {
        return LeaseAction::Create;
    }

    let original = lease.expires_at - lease.creation_timestamp;
    if until_expiry < scaled(original, jitter) || until_expiry < signed(RENEWAL_FLOOR) {
        return LeaseAction::Renew;
    }
    LeaseAction::Keep
}

/// Delay before looking at a lease again which needs nothing yet
pub fn next_requeue(lease: &LeaseStatus, now: DateTime<Utc>) -> Duration {
    let until_expiry = (lease.expires_at - now).to_std().unwrap_or_default();
    (until_expiry / 2 * 4 / 5).clamp(SHORT_REQUEUE, MAX_REQUEUE)
}

/// Platform side effect of a lease action
#[derive(Debug)]
pub enum LeaseChange {
    Created(CreatedLease),
    Renewed(Lease),
    Unchanged,
}

fn lease_scope(source: &DynamicSecretSource, project_slug: String) -> LeaseScope {
    LeaseScope {
        project_slug,
        environment_slug: source.environment_slug.clone(),
        path: source.secrets_path.clone(),
    }
}

async fn create_lease(
    platform: &dyn PlatformApi,
    source: &DynamicSecretSource,
    scope: LeaseScope,
    ttl: Option<&str>,
) -> platform::Result<CreatedLease> {
    platform
        .create_lease(&CreateLeaseRequest {
            dynamic_secret_name: source.secret_name.clone(),
            scope,
            ttl: ttl.map(String::from),
        })
        .await
}

/// Carry out `action`; a renewal the platform refuses for good creates a new lease instead
pub async fn apply(
    platform: &dyn PlatformApi,
    source: &DynamicSecretSource,
    ttl: Option<&str>,
    lease: Option<&LeaseStatus>,
    action: LeaseAction,
) -> platform::Result<LeaseChange> {
    if action == LeaseAction::Keep {
        return Ok(LeaseChange::Unchanged);
    }

    let project = platform.get_project_by_id(&source.project_id).await?;
    let scope = lease_scope(source, project.slug);

    if let (LeaseAction::Renew, Some(lease)) = (action, lease) {
        match platform.renew_lease(&lease.id, &scope, ttl).await {
            Ok(renewed) => return Ok(LeaseChange::Renewed(renewed)),
            Err(platform::Error::InvalidLease(reason)) => {
                info!(lease = %lease.id, %reason, "lease can no longer be renewed, creating a new one");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(LeaseChange::Created(create_lease(platform, source, scope, ttl).await?))
}

impl DynamicSecretStatus {
    /// Record a lease change observed at `now`
    pub fn record(&mut self, change: &LeaseChange, now: DateTime<Utc>) {
        match change {
            LeaseChange::Created(created) => {
                self.lease = Some(LeaseStatus {
                    id: created.lease.id.clone(),
                    version: created.lease.version,
                    expires_at: created.lease.expire_at,
                    creation_timestamp: now,
                });
                self.dynamic_secret_id = Some(created.dynamic_secret.id.clone());
                self.max_ttl = created.dynamic_secret.max_ttl.clone();
            }
            LeaseChange::Renewed(renewed) => {
                if let Some(lease) = self.lease.as_mut().filter(|l| l.id == renewed.id) {
                    lease.expires_at = renewed.expire_at;
                    lease.version = lease.version.max(renewed.version);
                }
            }
            LeaseChange::Unchanged => {}
        }
    }
}

/// Record `change`, committing a new lease only once `project` wrote its credentials
///
/// `project` receives the version annotation of the new lease. Renewals and
/// unchanged leases are recorded without projecting anything.
pub async fn commit<F, Fut>(
    status: &mut DynamicSecretStatus,
    change: &LeaseChange,
    now: DateTime<Utc>,
    project: F,
) -> Result<()>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut next = status.clone();
    next.record(change, now);
    if let (LeaseChange::Created(_), Some(lease)) = (change, &next.lease) {
        project(lease.version_annotation()).await?;
    }
    *status = next;
    Ok(())
}

fn lease_data(created: &CreatedLease) -> BTreeMap<String, Vec<u8>> {
    created
        .string_data()
        .into_iter()
        .map(|(k, v)| (k, v.into_bytes()))
        .collect()
}

impl DynamicSecret {
    fn max_ttl(&self, status: &DynamicSecretStatus) -> Result<Option<Duration>> {
        status
            .max_ttl
            .as_deref()
            .filter(|ttl| !ttl.trim().is_empty())
            .map(|ttl| parse_ttl("maxTTL", ttl))
            .transpose()
    }

    fn lease_ttl(&self) -> Option<&str> {
        self.spec.lease_ttl.as_deref().filter(|ttl| !ttl.trim().is_empty())
    }

    async fn managed_secret_exists(&self, ctx: &Context) -> Result<bool> {
        let reference = &self.spec.managed_secret_reference;
        guard_namespace(
            ctx.config.namespace.as_deref(),
            "secret",
            &reference.secret_name,
            &reference.secret_namespace,
        )?;
        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &reference.secret_namespace);
        Ok(secrets.get_opt(&reference.secret_name).await?.is_some())
    }

    async fn lease(&self, ctx: &Context, status: &mut DynamicSecretStatus) -> Result<Duration> {
        let (uid, entry) =
            platform_entry(ctx, self, self.spec.host_api.as_deref(), self.spec.tls.as_ref()).await?;
        let generation = self.metadata.generation;
        authenticate(
            ctx,
            &uid,
            &entry,
            Credentials::Identity(&self.spec.authentication),
            &mut status.conditions,
            generation,
        )
        .await?;

        if let Some(ttl) = self.lease_ttl() {
            parse_ttl("leaseTTL", ttl)?;
        }

        let now = Utc::now();
        let mut action = decide(status.lease.as_ref(), self.max_ttl(status)?, now, renewal_jitter());
        if action != LeaseAction::Create && !self.managed_secret_exists(ctx).await? {
            info!("managed secret is gone, creating a new lease");
            action = LeaseAction::Create;
        }
        debug!(?action, "lease decision");

        let previous = status.lease.as_ref().map(|l| l.id.clone());
        let change = apply(
            entry.platform.as_ref(),
            &self.spec.dynamic_secret,
            self.lease_ttl(),
            status.lease.as_ref(),
            action,
        )
        .await?;

        match &change {
            LeaseChange::Created(created) => {
                let projected =
                    commit(status, &change, now, |version| self.project(ctx, created, version)).await;
                if let Err(e) = projected {
                    warn!(lease = %created.lease.id, "unable to write lease credentials: {e}");
                    conditions::set_condition(
                        &mut status.conditions,
                        ConditionUpdate::failed(
                            conditions::LEASE_CREATED,
                            "ProjectionFailed",
                            format!("Lease {} created but not written: {e}", created.lease.id),
                        ),
                        generation,
                    );
                    return Err(e);
                }
                conditions::set_condition(
                    &mut status.conditions,
                    ConditionUpdate::ok(
                        conditions::LEASE_CREATED,
                        "LeaseCreated",
                        format!("Lease {} created", created.lease.id),
                    ),
                    generation,
                );
                if let Some(previous) = previous {
                    self.publish_replacement(ctx, &previous, &created.lease.id).await;
                }
                Ok(SHORT_REQUEUE)
            }
            LeaseChange::Renewed(renewed) => {
                status.record(&change, now);
                info!(lease = %renewed.id, expires_at = %renewed.expire_at, "lease renewed");
                conditions::set_condition(
                    &mut status.conditions,
                    ConditionUpdate::ok(
                        conditions::LEASE_RENEWED,
                        "LeaseRenewed",
                        format!("Lease {} renewed until {}", renewed.id, renewed.expire_at),
                    ),
                    generation,
                );
                Ok(SHORT_REQUEUE)
            }
            LeaseChange::Unchanged => Ok(status
                .lease
                .as_ref()
                .map_or(SHORT_REQUEUE, |lease| next_requeue(lease, now))),
        }
    }

    /// Write the credentials of a new lease and restart the workloads consuming them
    async fn project(&self, ctx: &Context, created: &CreatedLease, version: String) -> Result<()> {
        let reference = &self.spec.managed_secret_reference;
        write_managed_secret(
            ctx.client.clone(),
            self,
            &reference.secret_name,
            &reference.secret_namespace,
            &reference.secret_type,
            reference.creation_policy,
            lease_data(created),
            &version,
        )
        .await?;
        info!(lease = %created.lease.id, "lease created");

        rollout::restart_workloads(
            ctx.client.clone(),
            &reference.secret_namespace,
            ManagedKind::Secret,
            &reference.secret_name,
            &version,
        )
        .await;
        Ok(())
    }

    async fn publish_replacement(&self, ctx: &Context, previous: &str, current: &str) {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        let published = recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "LeaseReplaced".into(),
                note: Some(format!("Lease `{previous}` replaced by `{current}`")),
                action: "Leasing".into(),
                secondary: None,
            })
            .await;
        if let Err(e) = published {
            warn!("unable to publish lease event: {e}");
        }
    }

    async fn revoke(&self, ctx: &Context, uid: &str, lease: &LeaseStatus) -> Result<()> {
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

        let source = &self.spec.dynamic_secret;
        let project = entry.platform.get_project_by_id(&source.project_id).await?;
        match entry
            .platform
            .delete_lease(&lease.id, &lease_scope(source, project.slug))
            .await
        {
            Ok(_) => info!(lease = %lease.id, "lease revoked"),
            Err(e) => warn!(lease = %lease.id, "unable to revoke lease: {e}"),
        }

        let reference = &self.spec.managed_secret_reference;
        guard_namespace(
            ctx.config.namespace.as_deref(),
            "secret",
            &reference.secret_name,
            &reference.secret_namespace,
        )?;
        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &reference.secret_namespace);
        if let Some(mut secret) = secrets.get_opt(&reference.secret_name).await? {
            secret.data = Some(BTreeMap::new());
            secret.string_data = None;
            secrets
                .replace(&reference.secret_name, &PostParams::default(), &secret)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reconcile for DynamicSecret {
    const FINALIZER: &'static str = "dynamicsecret.secrets.infisical.com/finalizer";

    #[instrument(skip(self, ctx), fields(name = %self.name_any()))]
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let mut status = self.status.clone().unwrap_or_default();
        let outcome = self.lease(&ctx, &mut status).await;

        patch_status(
            &ctx,
            self,
            json!({
                "lease": status.lease,
                "dynamicSecretId": status.dynamic_secret_id,
                "maxTTL": status.max_ttl,
                "conditions": status.conditions,
            }),
        )
        .await?;

        Ok(Action::requeue(outcome?))
    }

    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let uid = uid(self)?;
        let lease = self.status.as_ref().and_then(|s| s.lease.clone());

        if let (RevocationPolicy::Revoke, Some(lease)) = (self.spec.lease_revocation_policy, lease) {
            if let Err(e) = self.revoke(&ctx, &uid, &lease).await {
                log_cleanup_failure("revoking the lease", &e);
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
        SHORT_REQUEUE
    }
}
