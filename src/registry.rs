use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{auth::AuthDetails, config::PlatformSettings, platform::PlatformClient, sse::ConnectionRegistry, Result};

/// Process state kept for one custom resource between reconciles
#[derive(Clone, Debug)]
pub struct ResourceEntry {
    pub platform: Arc<PlatformClient>,
    /// Cancelled when the resource is deleted or its entry replaced
    pub cancel: CancellationToken,
    /// Cached outcome of authentication, cleared when the platform rejects it
    pub auth: Option<AuthDetails>,
    pub settings: PlatformSettings,
    pub generation: Option<i64>,
    pub events: Arc<ConnectionRegistry>,
}

impl ResourceEntry {
    fn new(settings: &PlatformSettings, generation: Option<i64>, parent: &CancellationToken) -> Result<Self> {
        let cancel = parent.child_token();
        Ok(Self {
            platform: Arc::new(PlatformClient::new(settings)?),
            events: Arc::new(ConnectionRegistry::new(&cancel)),
            cancel,
            auth: None,
            settings: settings.clone(),
            generation,
        })
    }
}

/// Entries keyed by resource UID, shared between reconciles of every controller
#[derive(Clone, Debug, Default)]
pub struct ResourceRegistry {
    entries: Arc<Mutex<HashMap<String, ResourceEntry>>>,
    /// Cancelled on shutdown, closing every event stream
    root: CancellationToken,
}

impl ResourceRegistry {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            entries: Default::default(),
            root,
        }
    }

    /// The entry for `uid`, replaced when the spec generation or platform settings moved on.
    ///
    /// A replaced entry is cancelled, which also closes its event stream.
    pub fn entry(
        &self,
        uid: &str,
        generation: Option<i64>,
        settings: &PlatformSettings,
    ) -> Result<ResourceEntry> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(uid) {
            if existing.generation == generation && &existing.settings == settings {
                return Ok(existing.clone());
            }
            debug!(uid, "resource changed, resetting platform state");
            existing.cancel.cancel();
        }

        let entry = ResourceEntry::new(settings, generation, &self.root)?;
        entries.insert(uid.to_string(), entry.clone());
        Ok(entry)
    }

    /// Remember the authentication established with `entry`'s client
    pub fn set_auth(&self, uid: &str, entry: &ResourceEntry, auth: AuthDetails) {
        let mut entries = self.entries.lock();
        if let Some(current) = entries.get_mut(uid) {
            if Arc::ptr_eq(&current.platform, &entry.platform) {
                current.auth = Some(auth);
            }
        }
    }

    /// Forget cached authentication so the next reconcile logs in again
    pub fn clear_auth(&self, uid: &str) {
        if let Some(entry) = self.entries.lock().get_mut(uid) {
            entry.auth = None;
        }
    }

    /// Drop all state of a deleted resource
    pub fn remove(&self, uid: &str) {
        if let Some(entry) = self.entries.lock().remove(uid) {
            entry.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
