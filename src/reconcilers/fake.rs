//! In-memory platform for exercising the sync engines

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use crate::platform::{
    CreateLeaseRequest, CreatedLease, DynamicSecretTemplate, Error, Lease, LeaseScope,
    ListSecretsRequest, PlatformApi, Project, Result, Secret, SecretTarget,
};

#[derive(Default)]
struct State {
    next_id: u64,
    /// Secrets of the single folder, by key
    secrets: BTreeMap<String, Secret>,
    leases: BTreeMap<String, Lease>,
    calls: Vec<String>,
    failing: BTreeSet<String>,
    invalid_leases: bool,
}

/// A platform holding one project with one folder
#[derive(Default)]
pub(crate) struct FakePlatform {
    state: Mutex<State>,
}

pub(crate) const PROJECT_ID: &str = "project-1";
pub(crate) const PROJECT_SLUG: &str = "payments";

fn api_error(message: &str) -> Error {
    Error::Api {
        method: "POST".into(),
        url: "https://platform.test/api".into(),
        status: 400,
        message: message.into(),
        request_id: "test".into(),
    }
}

impl FakePlatform {
    pub fn with_secrets(secrets: &[(&str, &str)]) -> Self {
        let platform = Self::default();
        for (key, value) in secrets {
            platform.insert(key, value);
        }
        platform
    }

    /// Add a secret out of band, returning its id
    pub fn insert(&self, key: &str, value: &str) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("s{}", state.next_id);
        state.secrets.insert(
            key.into(),
            Secret {
                id: id.clone(),
                key: key.into(),
                value: value.into(),
                kind: "shared".into(),
                path: Some("/".into()),
                workspace: PROJECT_ID.into(),
            },
        );
        id
    }

    pub fn remove(&self, key: &str) {
        self.state.lock().secrets.remove(key);
    }

    /// Rename a secret in place, keeping its id
    pub fn rename(&self, from: &str, to: &str) {
        let mut state = self.state.lock();
        if let Some(mut secret) = state.secrets.remove(from) {
            secret.key = to.into();
            state.secrets.insert(to.into(), secret);
        }
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.state.lock().secrets.get(key).map(|s| s.value.clone())
    }

    pub fn id(&self, key: &str) -> Option<String> {
        self.state.lock().secrets.get(key).map(|s| s.id.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().secrets.keys().cloned().collect()
    }

    /// Make every write of `key` fail
    pub fn fail(&self, key: &str) {
        self.state.lock().failing.insert(key.into());
    }

    /// Reject every renewal from now on
    pub fn invalidate_leases(&self) {
        self.state.lock().invalid_leases = true;
    }

    pub fn lease_ids(&self) -> Vec<String> {
        self.state.lock().leases.keys().cloned().collect()
    }

    /// Write operations in call order, e.g. `create:KEY`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: String, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.failing.contains(key) {
            return Err(api_error("write rejected"));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn list_secrets(&self, _request: &ListSecretsRequest) -> Result<Vec<Secret>> {
        Ok(self.state.lock().secrets.values().cloned().collect())
    }

    async fn create_secret(&self, _target: &SecretTarget, key: &str, value: &str) -> Result<Secret> {
        self.record(format!("create:{key}"), key)?;
        if self.state.lock().secrets.contains_key(key) {
            return Err(api_error("Secret already exist"));
        }
        let id = self.insert(key, value);
        Ok(Secret {
            id,
            key: key.into(),
            value: value.into(),
            kind: "shared".into(),
            path: Some("/".into()),
            workspace: PROJECT_ID.into(),
        })
    }

    async fn update_secret(&self, _target: &SecretTarget, key: &str, value: &str) -> Result<Secret> {
        self.record(format!("update:{key}"), key)?;
        let mut state = self.state.lock();
        let secret = state
            .secrets
            .get_mut(key)
            .ok_or_else(|| api_error("Secret not found"))?;
        secret.value = value.into();
        Ok(secret.clone())
    }

    async fn delete_secret(&self, _target: &SecretTarget, key: &str) -> Result<Secret> {
        self.record(format!("delete:{key}"), key)?;
        self.state
            .lock()
            .secrets
            .remove(key)
            .ok_or_else(|| api_error("Secret not found"))
    }

    async fn get_project_by_id(&self, id: &str) -> Result<Project> {
        Ok(Project {
            id: id.into(),
            slug: PROJECT_SLUG.into(),
        })
    }

    async fn get_project_by_slug(&self, slug: &str) -> Result<Project> {
        Ok(Project {
            id: PROJECT_ID.into(),
            slug: slug.into(),
        })
    }

    async fn create_lease(&self, request: &CreateLeaseRequest) -> Result<CreatedLease> {
        let mut state = self.state.lock();
        state.calls.push(format!("create_lease:{}", request.dynamic_secret_name));
        state.next_id += 1;
        let lease = Lease {
            id: format!("l{}", state.next_id),
            version: 1,
            expire_at: Utc::now() + ChronoDuration::hours(1),
        };
        state.leases.insert(lease.id.clone(), lease.clone());
        Ok(CreatedLease {
            lease,
            dynamic_secret: DynamicSecretTemplate {
                id: "dyn-1".into(),
                max_ttl: Some("24h".into()),
                default_ttl: Some("1h".into()),
            },
            data: BTreeMap::from([
                ("DB_USERNAME".into(), serde_json::json!("user-1")),
                ("DB_PASSWORD".into(), serde_json::json!("hunter2")),
            ]),
        })
    }

    async fn renew_lease(&self, id: &str, _scope: &LeaseScope, _ttl: Option<&str>) -> Result<Lease> {
        let mut state = self.state.lock();
        state.calls.push(format!("renew_lease:{id}"));
        if state.invalid_leases {
            return Err(Error::InvalidLease("TTL cannot be larger than max ttl".into()));
        }
        let lease = state
            .leases
            .get_mut(id)
            .ok_or_else(|| Error::InvalidLease(format!("Dynamic secret lease with ID {id} not found")))?;
        lease.version += 1;
        lease.expire_at = Utc::now() + ChronoDuration::hours(1);
        Ok(lease.clone())
    }

    async fn delete_lease(&self, id: &str, _scope: &LeaseScope) -> Result<Lease> {
        let mut state = self.state.lock();
        state.calls.push(format!("delete_lease:{id}"));
        state
            .leases
            .remove(id)
            .ok_or_else(|| api_error("lease not found"))
    }
}
