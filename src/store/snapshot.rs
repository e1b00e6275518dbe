use super::ResourceStore;
use crate::core::{DiskFormat, ResourceClass, Result, Snapshot, StoreError};
use crate::index::IndexEntry;
use crate::lock::{LockManager, LockTarget};
use crate::storage::disk_image::virtual_size;
use crate::storage::layout::list_files;
use crate::storage::{StoreLayout, sidecar};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const SNAPSHOT_INDEX_RESOURCE_TYPE: &str = "snapshot-index";
const SCHEMA_VERSION: u32 = 1;

/// Contents of `volumes/.snapshots/<volume-id>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotIndexFile {
    pub volume_id: String,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
}

/// Snapshots, nested in one index file per owning volume. Every change to a
/// file is a read-modify-write under the file's own lock.
pub struct SnapshotStore {
    layout: StoreLayout,
    locks: Arc<LockManager>,
    cancel: CancellationToken,
    keep_backup: bool,
}

impl SnapshotStore {
    pub fn new(
        layout: StoreLayout,
        locks: Arc<LockManager>,
        cancel: CancellationToken,
        keep_backup: bool,
    ) -> Self {
        Self {
            layout,
            locks,
            cancel,
            keep_backup,
        }
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<Snapshot>> {
        Ok(
            sidecar::load::<SnapshotIndexFile>(path, SNAPSHOT_INDEX_RESOURCE_TYPE)
                .await?
                .map(|file| file.snapshots)
                .unwrap_or_default(),
        )
    }

    pub async fn list_for_volume(&self, volume_id: &str) -> Result<Vec<Snapshot>> {
        let path = self.layout.snapshot_index(volume_id)?;
        self.read_file(&path).await
    }

    async fn modify<T, F>(&self, volume_id: &str, apply: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Snapshot>) -> Result<T> + Send,
        T: Send,
    {
        let path = self.layout.snapshot_index(volume_id)?;
        let target = LockTarget::snapshot_index(volume_id);
        self.locks
            .with_lock(&target, &self.cancel, || async {
                let mut snapshots = self.read_file(&path).await?;
                let out = apply(&mut snapshots)?;
                if snapshots.is_empty() {
                    sidecar::delete(&path).await?;
                } else {
                    snapshots.sort_by(|a, b| a.id.cmp(&b.id));
                    let file = SnapshotIndexFile {
                        volume_id: volume_id.to_string(),
                        snapshots,
                    };
                    sidecar::save(
                        &path,
                        SNAPSHOT_INDEX_RESOURCE_TYPE,
                        SCHEMA_VERSION,
                        &file,
                        self.keep_backup,
                    )
                    .await?;
                }
                Ok(out)
            })
            .await
    }

    async fn index_files(&self) -> Result<Vec<PathBuf>> {
        Ok(list_files(&self.layout.snapshots_dir())
            .await?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".json") && !n.starts_with('.'))
            })
            .collect())
    }

    async fn volume_artifact(&self, volume_id: &str) -> Result<Option<PathBuf>> {
        for format in [DiskFormat::Qcow2, DiskFormat::Raw] {
            let path = self.layout.volume_artifact(volume_id, format)?;
            if sidecar::exists(&path).await {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    async fn find_volume_of(&self, id: &str) -> Result<Option<String>> {
        for snapshot in self.enumerate().await? {
            if snapshot.id == id {
                return Ok(Some(snapshot.volume_id));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ResourceStore for SnapshotStore {
    type Resource = Snapshot;

    fn class(&self) -> ResourceClass {
        ResourceClass::Snapshot
    }

    async fn enumerate(&self) -> Result<Vec<Snapshot>> {
        let mut all = Vec::new();
        for path in self.index_files().await? {
            match self.read_file(&path).await {
                Ok(mut snapshots) => all.append(&mut snapshots),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping snapshot index"),
            }
        }
        Ok(all)
    }

    async fn fetch(&self, id: &str, locator: Option<&str>) -> Result<Option<Snapshot>> {
        if let Some(volume_id) = locator
            && let Some(found) = self
                .list_for_volume(volume_id)
                .await?
                .into_iter()
                .find(|s| s.id == id)
        {
            return Ok(Some(found));
        }
        Ok(self.enumerate().await?.into_iter().find(|s| s.id == id))
    }

    async fn persist(&self, snapshot: &mut Snapshot, locator: Option<&str>) -> Result<()> {
        let Some(artifact) = self.volume_artifact(&snapshot.volume_id).await? else {
            return Err(StoreError::InvalidArgument(format!(
                "snapshot '{}' refers to missing volume '{}'",
                snapshot.id, snapshot.volume_id
            )));
        };
        if snapshot.volume_size_bytes == 0 {
            snapshot.volume_size_bytes = virtual_size(&artifact).await?;
        }
        snapshot.progress = snapshot.progress.min(100);

        if let Some(previous) = locator
            && previous != snapshot.volume_id
        {
            let id = snapshot.id.clone();
            self.modify(previous, move |snapshots| {
                snapshots.retain(|s| s.id != id);
                Ok(())
            })
            .await?;
        }

        let record = snapshot.clone();
        self.modify(&snapshot.volume_id, move |snapshots| {
            match snapshots.iter_mut().find(|s| s.id == record.id) {
                Some(existing) => *existing = record,
                None => snapshots.push(record),
            }
            Ok(())
        })
        .await
    }

    async fn erase(&self, id: &str, locator: Option<&str>) -> Result<Option<IndexEntry>> {
        let volume_id = match locator {
            Some(volume_id) => volume_id.to_string(),
            None => self
                .find_volume_of(id)
                .await?
                .ok_or_else(|| StoreError::not_found(ResourceClass::Snapshot, id))?,
        };
        let removed = self
            .modify(&volume_id, |snapshots| {
                let before = snapshots.len();
                snapshots.retain(|s| s.id != id);
                Ok(snapshots.len() != before)
            })
            .await?;
        if !removed {
            return Err(StoreError::not_found(ResourceClass::Snapshot, id));
        }
        Ok(None)
    }

    fn summary(&self, snapshot: &Snapshot) -> IndexEntry {
        IndexEntry::new(
            ResourceClass::Snapshot,
            &snapshot.id,
            &snapshot.volume_id,
            snapshot.status.as_str(),
        )
        .volume(Some(&snapshot.volume_id))
        .tags(&snapshot.tags)
    }
}
