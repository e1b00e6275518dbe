use super::ResourceStore;
use crate::core::{DiskFormat, ResourceClass, Result, StoreError, Volume};
use crate::hypervisor::HypervisorClient;
use crate::index::IndexEntry;
use crate::lock::{LockManager, LockTarget};
use crate::storage::disk_image::virtual_size;
use crate::storage::layout::{list_files, parse_artifact_name};
use crate::storage::{StoreLayout, sidecar, sidecar_path};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const VOLUME_RESOURCE_TYPE: &str = "volume";
const SCHEMA_VERSION: u32 = 1;

/// Volumes: a block-image artifact plus its sidecar.
pub struct VolumeStore {
    layout: StoreLayout,
    hypervisor: Arc<dyn HypervisorClient>,
    locks: Arc<LockManager>,
    cancel: CancellationToken,
    keep_backup: bool,
}

impl VolumeStore {
    pub fn new(
        layout: StoreLayout,
        hypervisor: Arc<dyn HypervisorClient>,
        locks: Arc<LockManager>,
        cancel: CancellationToken,
        keep_backup: bool,
    ) -> Self {
        Self {
            layout,
            hypervisor,
            locks,
            cancel,
            keep_backup,
        }
    }

    /// Loads the sidecar next to `artifact`. `capacity` skips the size probe
    /// when the daemon already reported it.
    async fn load_at(&self, artifact: &Path, capacity: Option<u64>) -> Result<Option<Volume>> {
        let Some(mut volume) =
            sidecar::load::<Volume>(&sidecar_path(artifact), VOLUME_RESOURCE_TYPE).await?
        else {
            return Ok(None);
        };
        if !sidecar::exists(artifact).await {
            return Ok(None);
        }
        if let Some((id, _)) = parse_artifact_name(artifact)
            && id != volume.id
        {
            return Err(StoreError::Corrupted {
                path: sidecar_path(artifact),
                reason: format!("sidecar names volume '{}' but belongs to '{}'", volume.id, id),
            });
        }
        volume.size_bytes = match capacity {
            Some(capacity) => capacity,
            None => virtual_size(artifact).await?,
        };
        volume.path = artifact.to_path_buf();
        Ok(Some(volume))
    }

    /// Artifact paths a volume id may have, indexed location first.
    fn candidates(&self, id: &str, locator: Option<&str>) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(3);
        if let Some(locator) = locator {
            paths.push(PathBuf::from(locator));
        }
        for format in [DiskFormat::Qcow2, DiskFormat::Raw] {
            let path = self.layout.volume_artifact(id, format)?;
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Capacities the daemon reports for artifacts in the volumes directory.
    async fn daemon_capacities(&self) -> Result<HashMap<PathBuf, u64>> {
        let dir = self.layout.volumes_dir();
        Ok(self
            .hypervisor
            .list_storage_volumes()
            .await?
            .into_iter()
            .filter(|v| v.path.parent() == Some(dir.as_path()))
            .map(|v| (v.path, v.capacity))
            .collect())
    }

    async fn scanned_artifacts(&self) -> Result<Vec<PathBuf>> {
        Ok(list_files(&self.layout.volumes_dir())
            .await?
            .into_iter()
            .filter(|p| parse_artifact_name(p).is_some())
            .collect())
    }

    /// Removes the per-volume snapshot index under its own lock.
    async fn remove_snapshot_index(&self, volume_id: &str) -> Result<()> {
        let path = self.layout.snapshot_index(volume_id)?;
        self.locks
            .with_lock(&LockTarget::snapshot_index(volume_id), &self.cancel, || {
                sidecar::delete(&path)
            })
            .await
    }
}

#[async_trait]
impl ResourceStore for VolumeStore {
    type Resource = Volume;

    fn class(&self) -> ResourceClass {
        ResourceClass::Volume
    }

    async fn enumerate(&self) -> Result<Vec<Volume>> {
        // The directory decides which volumes exist. A pool that is missing,
        // empty or lagging only costs size probes.
        let mut capacities = match self.daemon_capacities().await {
            Ok(capacities) => capacities,
            Err(err) => {
                warn!(error = %err, "storage volume listing failed, probing artifact sizes");
                HashMap::new()
            }
        };
        let artifacts = self.scanned_artifacts().await?;
        debug!(
            artifacts = artifacts.len(),
            reported = capacities.len(),
            "enumerating volumes"
        );

        let mut volumes = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let capacity = capacities.remove(&artifact);
            match self.load_at(&artifact, capacity).await {
                Ok(Some(volume)) => volumes.push(volume),
                Ok(None) => debug!(path = %artifact.display(), "volume artifact without metadata"),
                Err(err) => {
                    warn!(path = %artifact.display(), error = %err, "skipping volume");
                }
            }
        }
        Ok(volumes)
    }

    async fn fetch(&self, id: &str, locator: Option<&str>) -> Result<Option<Volume>> {
        for artifact in self.candidates(id, locator)? {
            if let Some(volume) = self.load_at(&artifact, None).await? {
                return Ok(Some(volume));
            }
        }
        Ok(None)
    }

    async fn persist(&self, volume: &mut Volume, _locator: Option<&str>) -> Result<()> {
        let artifact = self.layout.volume_artifact(&volume.id, volume.format)?;
        if !sidecar::exists(&artifact).await {
            return Err(StoreError::InvalidArgument(format!(
                "volume '{}' has no artifact at '{}'",
                volume.id,
                artifact.display()
            )));
        }
        volume.updated_at = Utc::now();
        sidecar::save(
            &sidecar_path(&artifact),
            VOLUME_RESOURCE_TYPE,
            SCHEMA_VERSION,
            volume,
            self.keep_backup,
        )
        .await?;
        volume.size_bytes = virtual_size(&artifact).await?;
        volume.path = artifact;
        Ok(())
    }

    async fn erase(&self, id: &str, locator: Option<&str>) -> Result<Option<IndexEntry>> {
        let mut found = false;
        for artifact in self.candidates(id, locator)? {
            let sidecar = sidecar_path(&artifact);
            if sidecar::exists(&sidecar).await || sidecar::exists(&artifact).await {
                found = true;
                // Artifact first: a leftover sidecar is an orphan repair removes.
                sidecar::remove_if_exists(&artifact).await?;
                sidecar::delete(&sidecar).await?;
            }
        }
        if !found {
            return Err(StoreError::not_found(ResourceClass::Volume, id));
        }
        self.remove_snapshot_index(id).await?;
        Ok(None)
    }

    fn summary(&self, volume: &Volume) -> IndexEntry {
        IndexEntry::new(
            ResourceClass::Volume,
            &volume.id,
            volume.path.display().to_string(),
            volume.status.as_str(),
        )
        .kind(&volume.volume_type)
        .tags(&volume.tags)
        .image(volume.source_image_id.as_deref())
        .instance(volume.attachment.as_ref().map(|a| a.instance_id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockPolicy;
    use crate::hypervisor::InMemoryHypervisor;
    use crate::storage::disk_image::qcow2_header;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, InMemoryHypervisor, VolumeStore) {
        let temp_dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(temp_dir.path());
        layout.bootstrap().await.unwrap();
        let hv = InMemoryHypervisor::new();
        let locks = Arc::new(LockManager::new(layout.clone(), LockPolicy::default()));
        let store = VolumeStore::new(
            layout,
            Arc::new(hv.clone()),
            locks,
            CancellationToken::new(),
            true,
        );
        (temp_dir, hv, store)
    }

    async fn write_artifact(store: &VolumeStore, id: &str, size: u64) -> PathBuf {
        let path = store.layout.volume_artifact(id, DiskFormat::Qcow2).unwrap();
        tokio::fs::write(&path, qcow2_header(size)).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_persist_probes_virtual_size() {
        let (_dir, _hv, store) = setup().await;
        write_artifact(&store, "vol-1", 5 << 30).await;

        let mut volume = Volume::new("vol-1", DiskFormat::Qcow2);
        store.persist(&mut volume, None).await.unwrap();
        assert_eq!(volume.size_bytes, 5 << 30);

        let loaded = store.fetch("vol-1", None).await.unwrap().unwrap();
        assert_eq!(loaded.size_bytes, 5 << 30);
        assert_eq!(loaded.status, volume.status);
    }

    #[tokio::test]
    async fn test_persist_requires_artifact() {
        let (_dir, _hv, store) = setup().await;
        let mut volume = Volume::new("vol-x", DiskFormat::Qcow2);
        assert!(matches!(
            store.persist(&mut volume, None).await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_enumerate_scans_directory_and_uses_reported_capacity() {
        let (_dir, hv, store) = setup().await;
        let path = write_artifact(&store, "vol-1", 1 << 20).await;
        store
            .persist(&mut Volume::new("vol-1", DiskFormat::Qcow2), None)
            .await
            .unwrap();
        write_artifact(&store, "vol-2", 1 << 20).await;
        store
            .persist(&mut Volume::new("vol-2", DiskFormat::Qcow2), None)
            .await
            .unwrap();
        write_artifact(&store, "vol-bare", 1 << 20).await;

        // Empty pool: the scan alone finds both registered volumes.
        let scanned = store.enumerate().await.unwrap();
        assert_eq!(scanned.len(), 2);

        // The pool reports only vol-1; vol-2 is still enumerated.
        hv.add_volume_at("default", &path, 7 << 20).await;
        let mut listed = store.enumerate().await.unwrap();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].size_bytes, 7 << 20);
        assert_eq!(listed[1].size_bytes, 1 << 20);

        hv.fail_volume_listing(true).await;
        let probed = store.enumerate().await.unwrap();
        assert_eq!(probed.len(), 2);
        assert!(probed.iter().all(|v| v.size_bytes == 1 << 20));
    }

    #[tokio::test]
    async fn test_erase_removes_everything() {
        let (_dir, _hv, store) = setup().await;
        let path = write_artifact(&store, "vol-1", 1 << 20).await;
        store
            .persist(&mut Volume::new("vol-1", DiskFormat::Qcow2), None)
            .await
            .unwrap();
        let index = store.layout.snapshot_index("vol-1").unwrap();
        tokio::fs::write(&index, b"{}").await.unwrap();

        store.erase("vol-1", None).await.unwrap();
        assert!(!path.exists());
        assert!(!sidecar_path(&path).exists());
        assert!(!index.exists());
        assert!(store.erase("vol-1", None).await.unwrap_err().is_not_found());
    }
}
