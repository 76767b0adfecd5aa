//! User directory collaborator and the per-session profile cache.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use folio_core::MentionCandidate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl From<&UserProfile> for MentionCandidate {
    fn from(profile: &UserProfile) -> Self {
        MentionCandidate {
            user_id: profile.user_id,
            display_name: profile.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Tenant/user directory: id to display name and avatar.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Profiles for `ids`. Unknown ids are simply absent from the result.
    async fn lookup(&self, ids: &[Uuid]) -> Result<Vec<UserProfile>, DirectoryError>;

    /// Everyone addressable within a tenant.
    async fn tenant_members(&self, tenant_id: Uuid) -> Result<Vec<UserProfile>, DirectoryError>;
}

/// Directory held in memory.
#[derive(Default)]
pub struct MemoryDirectory {
    tenants: RwLock<HashMap<Uuid, Vec<UserProfile>>>,
    lookups: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, tenant_id: Uuid, profile: UserProfile) {
        self.tenants
            .write()
            .await
            .entry(tenant_id)
            .or_default()
            .push(profile);
    }

    /// How many `lookup` calls were served.
    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn lookup(&self, ids: &[Uuid]) -> Result<Vec<UserProfile>, DirectoryError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let tenants = self.tenants.read().await;
        let found = tenants
            .values()
            .flatten()
            .filter(|p| ids.contains(&p.user_id))
            .cloned()
            .collect();
        Ok(found)
    }

    async fn tenant_members(&self, tenant_id: Uuid) -> Result<Vec<UserProfile>, DirectoryError> {
        Ok(self
            .tenants
            .read()
            .await
            .get(&tenant_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Session-scoped cache in front of a [`UserDirectory`].
///
/// Unknown ids are queued with [`request`](Self::request) and resolved together
/// by [`flush`](Self::flush), at most `batch_size` ids per directory call.
pub struct ProfileCache {
    directory: Arc<dyn UserDirectory>,
    cache: HashMap<Uuid, UserProfile>,
    pending: BTreeSet<Uuid>,
    batch_size: usize,
}

impl ProfileCache {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self::with_batch_size(directory, 50)
    }

    pub fn with_batch_size(directory: Arc<dyn UserDirectory>, batch_size: usize) -> Self {
        Self {
            directory,
            cache: HashMap::new(),
            pending: BTreeSet::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn get(&self, user_id: Uuid) -> Option<&UserProfile> {
        self.cache.get(&user_id)
    }

    pub fn insert(&mut self, profile: UserProfile) {
        self.pending.remove(&profile.user_id);
        self.cache.insert(profile.user_id, profile);
    }

    /// Queues ids that are neither cached nor already queued. Returns how many were new.
    pub fn request(&mut self, ids: impl IntoIterator<Item = Uuid>) -> usize {
        let mut queued = 0;
        for id in ids {
            if !self.cache.contains_key(&id) && self.pending.insert(id) {
                queued += 1;
            }
        }
        queued
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Resolves every queued id. Returns the profiles that were fetched.
    ///
    /// Ids the directory does not know are dropped from the queue. On error
    /// the unresolved ids stay queued for the next flush.
    pub async fn flush(&mut self) -> Result<Vec<UserProfile>, DirectoryError> {
        let queued: Vec<Uuid> = self.pending.iter().copied().collect();
        let mut fetched = Vec::new();
        for batch in queued.chunks(self.batch_size) {
            let profiles = match self.directory.lookup(batch).await {
                Ok(profiles) => profiles,
                Err(e) => {
                    warn!("profile lookup for {} ids failed: {e}", batch.len());
                    return Err(e);
                }
            };
            debug!("resolved {}/{} profiles", profiles.len(), batch.len());
            for id in batch {
                self.pending.remove(id);
            }
            for profile in profiles {
                self.cache.insert(profile.user_id, profile.clone());
                fetched.push(profile);
            }
        }
        Ok(fetched)
    }

    /// Tenant members as mention candidates, caching their profiles on the way.
    pub async fn tenant_candidates(
        &mut self,
        tenant_id: Uuid,
    ) -> Result<Vec<MentionCandidate>, DirectoryError> {
        let members = self.directory.tenant_members(tenant_id).await?;
        let candidates = members.iter().map(MentionCandidate::from).collect();
        for profile in members {
            self.insert(profile);
        }
        Ok(candidates)
    }
}
