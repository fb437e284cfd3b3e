//! Leader election over a `coordination.k8s.io/v1` Lease.
//!
//! Writes carry the resourceVersion read just before, so two replicas racing for an
//! expired lease cannot both win: the loser gets a conflict and keeps waiting.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
};
use kube::{api::PostParams, Api, Client};
use tracing::{debug, info, warn};

use crate::Result;

pub const LEASE_NAME: &str = "infisical-operator-leader";

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one acquisition attempt
#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    Held,
    Taken,
}

pub struct LeaderElector {
    client: Client,
    namespace: String,
    identity: String,
}

/// Whether a lease last renewed at `renewed` for `duration_secs` has lapsed at `now`
fn expired(renewed: Option<DateTime<Utc>>, duration_secs: Option<i32>, now: DateTime<Utc>) -> bool {
    match (renewed, duration_secs) {
        (Some(renewed), Some(secs)) => now > renewed + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    }
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            identity: identity.into(),
        }
    }

    fn spec(&self, now: DateTime<Utc>, acquired: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time: Some(MicroTime(acquired)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<Attempt> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let Some(mut lease) = api.get_opt(LEASE_NAME).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.into()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(self.spec(now, now, 0)),
            };
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(Attempt::Held),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(Attempt::Taken),
                Err(e) => Err(e.into()),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let ours = spec.holder_identity.as_deref() == Some(self.identity.as_str());
        let transitions = spec.lease_transitions.unwrap_or(0);

        let next = if ours {
            let acquired = spec.acquire_time.map_or(now, |t| t.0);
            self.spec(now, acquired, transitions)
        } else if expired(spec.renew_time.map(|t| t.0), spec.lease_duration_seconds, now) {
            self.spec(now, now, transitions + 1)
        } else {
            return Ok(Attempt::Taken);
        };

        lease.spec = Some(next);
        match api.replace(LEASE_NAME, &PostParams::default(), &lease).await {
            Ok(_) => Ok(Attempt::Held),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(Attempt::Taken),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until this replica holds the lease
    pub async fn acquire(&self) {
        info!(identity = %self.identity, lease = LEASE_NAME, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(Attempt::Held) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return;
                }
                Ok(Attempt::Taken) => debug!("lease held by another replica"),
                Err(e) => warn!("unable to acquire lease, retrying: {e}"),
            }
            tokio::time::sleep(RENEW_INTERVAL).await;
        }
    }

    /// Keep renewing; returns once the lease could not be renewed within its duration
    pub async fn hold(&self) {
        let mut last_renewal = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire_or_renew().await {
                Ok(Attempt::Held) => last_renewal = tokio::time::Instant::now(),
                Ok(Attempt::Taken) => {
                    warn!(identity = %self.identity, "lease taken over by another replica");
                    return;
                }
                Err(e) => {
                    warn!("unable to renew lease: {e}");
                    if last_renewal.elapsed() >= LEASE_DURATION {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_expire_after_their_duration() {
        let renewed = Utc::now();
        let soon = renewed + chrono::Duration::seconds(10);
        let later = renewed + chrono::Duration::seconds(16);

        assert!(!expired(Some(renewed), Some(15), soon));
        assert!(expired(Some(renewed), Some(15), later));
    }

    #[test]
    fn leases_without_timing_are_free() {
        assert!(expired(None, Some(15), Utc::now()));
        assert!(expired(Some(Utc::now()), None, Utc::now()));
    }
}
