//! Per-class persistence behind one capability trait.
//!
//! [`ResourceStore`] hides where a class lives (domain metadata or sidecar
//! files). [`Collection`] adds the generic operations on top: locking,
//! index maintenance, hydration and filtering.

pub mod facade;
pub mod image;
pub mod instance;
pub mod keypair;
pub mod snapshot;
pub mod volume;

pub use facade::MetadataStore;
pub use image::ImageStore;
pub use instance::InstanceStore;
pub use keypair::KeyPairStore;
pub use snapshot::SnapshotStore;
pub use volume::VolumeStore;

use crate::core::{FilterRequest, ResourceClass, Result, StoreError, validate_resource_id};
use crate::index::{ClassIndex, IndexEntry, ResourceIndex};
use crate::lock::{LockManager, LockTarget};
use crate::query::{FilterPlan, Filterable, matches_all};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[async_trait]
pub trait ResourceStore: Send + Sync {
    type Resource: Filterable + Clone + Send + Sync + 'static;

    fn class(&self) -> ResourceClass;

    /// Every record in the backing store. Unreadable records are skipped.
    async fn enumerate(&self) -> Result<Vec<Self::Resource>>;

    /// Loads one record. `locator` is the indexed location when known.
    async fn fetch(&self, id: &str, locator: Option<&str>) -> Result<Option<Self::Resource>>;

    /// Durably writes `resource`, filling in derived fields.
    async fn persist(&self, resource: &mut Self::Resource, locator: Option<&str>) -> Result<()>;

    /// Removes the record. Returns the entry that should take its place in
    /// the index, if the backing object outlives its metadata.
    async fn erase(&self, id: &str, locator: Option<&str>) -> Result<Option<IndexEntry>>;

    fn summary(&self, resource: &Self::Resource) -> IndexEntry;

    /// Id of an index entry that `resource` replaces, when saving it changes
    /// the identity of an existing backing object.
    fn supersedes(&self, _resource: &Self::Resource) -> Option<String> {
        None
    }

    /// Rejects ids this class cannot store. Sidecar ids become file names.
    fn validate_id(&self, id: &str) -> Result<()> {
        validate_resource_id(id)
    }

    fn lock_target(&self, id: &str) -> LockTarget {
        LockTarget::new(self.class(), id)
    }
}

/// Generic operations for one resource class.
pub struct Collection<S: ResourceStore> {
    store: S,
    index: Arc<ResourceIndex>,
    locks: Arc<LockManager>,
    cancel: CancellationToken,
}

impl<S: ResourceStore> Collection<S> {
    pub fn new(
        store: S,
        index: Arc<ResourceIndex>,
        locks: Arc<LockManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            index,
            locks,
            cancel,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn class(&self) -> ResourceClass {
        self.store.class()
    }

    fn locator(&self, id: &str) -> Result<Option<String>> {
        Ok(self.index.get(self.class(), id)?.map(|e| e.locator))
    }

    pub async fn save(&self, resource: S::Resource) -> Result<S::Resource> {
        let id = resource.id().to_string();
        self.store.validate_id(&id)?;
        let locator = self.locator(&id)?;
        let target = self.store.lock_target(&id);

        let saved = self
            .locks
            .with_lock_retry(&target, &self.cancel, || async {
                let mut resource = resource;
                self.store.persist(&mut resource, locator.as_deref()).await?;
                Ok(resource)
            })
            .await?;

        let summary = self.store.summary(&saved);
        if let Some(old) = self.store.supersedes(&saved)
            && old != summary.id
            && self
                .index
                .get(self.class(), &old)?
                .is_some_and(|e| e.locator == summary.locator)
        {
            self.index.remove(self.class(), &old)?;
        }
        self.index.insert(summary)?;
        debug!(class = %self.class(), id = %id, "saved");
        Ok(saved)
    }

    pub async fn get(&self, id: &str) -> Result<S::Resource> {
        self.store.validate_id(id)?;
        let locator = self.locator(id)?;
        match self.store.fetch(id, locator.as_deref()).await? {
            Some(resource) => Ok(resource),
            None => {
                if locator.is_some() {
                    // Backing record vanished out of band.
                    self.index.remove(self.class(), id)?;
                }
                Err(StoreError::not_found(self.class(), id))
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<S::Resource>> {
        self.describe(&FilterRequest::default()).await
    }

    pub async fn describe(&self, request: &FilterRequest) -> Result<Vec<S::Resource>> {
        let plan = FilterPlan::build(self.class(), &request.filters)?;

        let mut found = Vec::new();
        if !request.ids.is_empty() {
            let ids: BTreeSet<&str> = request.ids.iter().map(String::as_str).collect();
            for id in ids {
                let resource = self.get(id).await?;
                if matches_all(&resource, &request.filters) {
                    found.push(resource);
                }
            }
            return Ok(found);
        }

        for entry in self.index.candidates(self.class(), &plan.indexed)? {
            match self.store.fetch(&entry.id, Some(&entry.locator)).await {
                Ok(Some(resource)) => found.push(resource),
                Ok(None) => {
                    debug!(class = %self.class(), id = %entry.id, "indexed resource no longer exists");
                }
                Err(err) => {
                    warn!(class = %self.class(), id = %entry.id, error = %err, "skipping unreadable resource");
                }
            }
        }
        // Indexed filters are re-checked too; the index may trail the store.
        found.retain(|r| matches_all(r, &request.filters));
        found.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(found)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.store.validate_id(id)?;
        let locator = self.locator(id)?;
        let target = self.store.lock_target(id);

        let replacement = self
            .locks
            .with_lock_retry(&target, &self.cancel, || {
                self.store.erase(id, locator.as_deref())
            })
            .await?;

        self.index.remove(self.class(), id)?;
        if let Some(entry) = replacement {
            self.index.insert(entry)?;
        }
        debug!(class = %self.class(), id = %id, "deleted");
        Ok(())
    }

    /// Read-modify-write of one record under its lock.
    pub async fn update<F>(&self, id: &str, apply: F) -> Result<S::Resource>
    where
        F: FnOnce(&mut S::Resource) -> Result<()> + Send,
    {
        self.store.validate_id(id)?;
        let locator = self.locator(id)?;
        let target = self.store.lock_target(id);

        let updated = self
            .locks
            .with_lock_retry(&target, &self.cancel, || async {
                let mut resource = self
                    .store
                    .fetch(id, locator.as_deref())
                    .await?
                    .ok_or_else(|| StoreError::not_found(self.class(), id))?;
                apply(&mut resource)?;
                self.store.persist(&mut resource, locator.as_deref()).await?;
                Ok(resource)
            })
            .await?;

        self.index.insert(self.store.summary(&updated))?;
        Ok(updated)
    }

    /// Fresh index for this class from a full enumeration.
    pub async fn build_index(&self) -> Result<ClassIndex> {
        let mut index = ClassIndex::new();
        for resource in self.store.enumerate().await? {
            index.insert(self.store.summary(&resource));
        }
        Ok(index)
    }
}

/// Object-safe view used to rebuild every class uniformly.
#[async_trait]
pub trait IndexSource: Send + Sync {
    fn class(&self) -> ResourceClass;
    async fn build_index(&self) -> Result<ClassIndex>;
}

#[async_trait]
impl<S: ResourceStore> IndexSource for Collection<S> {
    fn class(&self) -> ResourceClass {
        Collection::class(self)
    }

    async fn build_index(&self) -> Result<ClassIndex> {
        Collection::build_index(self).await
    }
}
