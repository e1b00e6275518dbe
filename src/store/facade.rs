use super::{
    Collection, ImageStore, IndexSource, InstanceStore, KeyPairStore, SnapshotStore, VolumeStore,
};
use crate::bridge::DomainMetadataBridge;
use crate::config::StoreConfig;
use crate::core::{
    FilterRequest, Image, ImageState, Instance, KeyPair, ResourceClass, Result, Snapshot,
    SnapshotStatus, StoreError, Volume, VolumeAttachment, VolumeStatus,
};
use crate::hypervisor::{HypervisorClient, RemoteHypervisor};
use crate::index::{IndexField, IndexSnapshot, IndexStats, ResourceIndex};
use crate::lock::LockManager;
use crate::refresh::{Refresh, RefreshWorker, spawn_refresh_worker};
use crate::repair::{RepairReport, Repairer};
use crate::storage::StoreLayout;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

struct StoreInner {
    layout: StoreLayout,
    locks: Arc<LockManager>,
    index: Arc<ResourceIndex>,
    cancel: CancellationToken,
    /// One rebuild at a time; the journal belongs to it.
    rebuild_gate: Mutex<()>,
    instances: Collection<InstanceStore>,
    volumes: Collection<VolumeStore>,
    images: Collection<ImageStore>,
    snapshots: Collection<SnapshotStore>,
    keypairs: Collection<KeyPairStore>,
}

impl StoreInner {
    fn sources(&self) -> [&dyn IndexSource; 5] {
        [
            &self.instances,
            &self.volumes,
            &self.images,
            &self.snapshots,
            &self.keypairs,
        ]
    }

    async fn rebuild(&self) -> Result<IndexStats> {
        let _gate = self.rebuild_gate.lock().await;
        let span = info_span!("rebuild");
        async {
            self.index.begin_rebuild()?;
            let results = join_all(
                self.sources()
                    .into_iter()
                    .map(|source| async move { (source.class(), source.build_index().await) }),
            )
            .await;

            let mut built = HashMap::new();
            for (class, result) in results {
                match result {
                    Ok(index) => {
                        built.insert(class, index);
                    }
                    // The class keeps its live maps.
                    Err(err) => warn!(class = %class, error = %err, "enumeration failed, keeping previous index"),
                }
            }
            let generation = match self.index.commit_rebuild(built) {
                Ok(generation) => generation,
                Err(err) => {
                    self.index.abort_rebuild()?;
                    return Err(err);
                }
            };
            let stats = self.index.stats()?;
            info!(generation, counts = ?stats.counts, "index rebuilt");
            Ok(stats)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl Refresh for StoreInner {
    async fn refresh(&self) -> Result<IndexStats> {
        self.rebuild().await
    }
}

/// The hybrid metadata store: instances in domain metadata, everything else
/// in sidecar files, one index over both.
pub struct MetadataStore {
    config: StoreConfig,
    inner: Arc<StoreInner>,
    worker: Mutex<Option<RefreshWorker>>,
}

impl MetadataStore {
    pub fn new(config: StoreConfig, hypervisor: Arc<dyn HypervisorClient>) -> Result<Self> {
        config.validate()?;
        let layout = StoreLayout::new(&config.base_path);
        let locks = Arc::new(LockManager::new(layout.clone(), config.lock.clone()));
        let index = Arc::new(ResourceIndex::new());
        let cancel = CancellationToken::new();
        let backup = config.backup_on_write;

        let bridge = DomainMetadataBridge::new(
            hypervisor.clone(),
            &config.hypervisor.metadata_uri,
            &config.hypervisor.metadata_key,
        );
        let inner = StoreInner {
            instances: Collection::new(
                InstanceStore::new(bridge),
                index.clone(),
                locks.clone(),
                cancel.clone(),
            ),
            volumes: Collection::new(
                VolumeStore::new(
                    layout.clone(),
                    hypervisor,
                    locks.clone(),
                    cancel.clone(),
                    backup,
                ),
                index.clone(),
                locks.clone(),
                cancel.clone(),
            ),
            images: Collection::new(
                ImageStore::new(layout.clone(), backup),
                index.clone(),
                locks.clone(),
                cancel.clone(),
            ),
            snapshots: Collection::new(
                SnapshotStore::new(layout.clone(), locks.clone(), cancel.clone(), backup),
                index.clone(),
                locks.clone(),
                cancel.clone(),
            ),
            keypairs: Collection::new(
                KeyPairStore::new(layout.clone(), backup),
                index.clone(),
                locks.clone(),
                cancel.clone(),
            ),
            layout,
            locks,
            index,
            cancel,
            rebuild_gate: Mutex::new(()),
        };

        Ok(Self {
            config,
            inner: Arc::new(inner),
            worker: Mutex::new(None),
        })
    }

    /// Store backed by the hypervisor daemon at the configured socket.
    pub fn connect(config: StoreConfig) -> Result<Self> {
        let hypervisor = Arc::new(RemoteHypervisor::new(&config.hypervisor));
        Self::new(config, hypervisor)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Directory bootstrap, stale-lock sweep and repair, first index build,
    /// then the background refresh when enabled.
    pub async fn initialize(&self) -> Result<RepairReport> {
        self.inner.layout.bootstrap().await?;
        let report = self.repair().await;
        self.rebuild().await?;

        if self.config.refresh.enabled {
            let mut worker = self.worker.lock().await;
            if worker.is_none() {
                *worker = Some(spawn_refresh_worker(
                    self.inner.clone(),
                    self.config.refresh_interval(),
                ));
                info!(interval_ms = self.config.refresh.interval_ms, "background refresh started");
            }
        }
        Ok(report)
    }

    /// Stops the refresh worker and aborts pending lock waits.
    pub async fn close(&self) -> Result<()> {
        self.inner.cancel.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            worker.stop().await?;
        }
        Ok(())
    }

    pub async fn repair(&self) -> RepairReport {
        Repairer::new(self.inner.layout.clone(), self.inner.locks.clone())
            .run()
            .await
    }

    pub async fn rebuild(&self) -> Result<IndexStats> {
        self.inner.rebuild().await
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.inner.index.stats()
    }

    pub fn index_snapshot(&self) -> Result<IndexSnapshot> {
        self.inner.index.snapshot()
    }

    pub fn sweep_locks(&self) -> Result<usize> {
        self.inner.locks.sweep_stale()
    }

    // ========================================================================
    // Instances
    // ========================================================================

    pub async fn save_instance(&self, instance: Instance) -> Result<Instance> {
        self.inner.instances.save(instance).await
    }

    pub async fn get_instance(&self, id: &str) -> Result<Instance> {
        self.inner.instances.get(id).await
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.inner.instances.list().await
    }

    pub async fn describe_instances(&self, request: &FilterRequest) -> Result<Vec<Instance>> {
        self.inner.instances.describe(request).await
    }

    /// Clears the instance's metadata; the domain itself is left alone.
    pub async fn delete_instance(&self, id: &str) -> Result<()> {
        self.inner.instances.delete(id).await
    }

    // ========================================================================
    // Volumes
    // ========================================================================

    pub async fn save_volume(&self, volume: Volume) -> Result<Volume> {
        self.inner.volumes.save(volume).await
    }

    pub async fn get_volume(&self, id: &str) -> Result<Volume> {
        self.inner.volumes.get(id).await
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.inner.volumes.list().await
    }

    pub async fn describe_volumes(&self, request: &FilterRequest) -> Result<Vec<Volume>> {
        self.inner.volumes.describe(request).await
    }

    /// Removes the volume's artifact, metadata and snapshot index.
    pub async fn delete_volume(&self, id: &str) -> Result<()> {
        self.inner.volumes.delete(id).await?;
        let orphaned = self.inner.index.candidates(
            ResourceClass::Snapshot,
            &[(IndexField::Volume, vec![id.to_string()])],
        )?;
        for snapshot in orphaned {
            self.inner.index.remove(ResourceClass::Snapshot, &snapshot.id)?;
        }
        Ok(())
    }

    pub async fn update_volume_status(&self, id: &str, status: VolumeStatus) -> Result<Volume> {
        self.inner
            .volumes
            .update(id, |volume| {
                volume.status = status;
                Ok(())
            })
            .await
    }

    pub async fn attach_volume(&self, id: &str, instance_id: &str, device: &str) -> Result<Volume> {
        let attachment = VolumeAttachment {
            instance_id: instance_id.to_string(),
            device: device.to_string(),
            attached_at: Utc::now(),
        };
        self.inner
            .volumes
            .update(id, move |volume| {
                if let Some(current) = &volume.attachment
                    && current.instance_id != attachment.instance_id
                {
                    return Err(StoreError::InvalidArgument(format!(
                        "volume '{}' is attached to '{}'",
                        volume.id, current.instance_id
                    )));
                }
                volume.attachment = Some(attachment);
                volume.status = VolumeStatus::InUse;
                Ok(())
            })
            .await
    }

    pub async fn detach_volume(&self, id: &str) -> Result<Volume> {
        self.inner
            .volumes
            .update(id, |volume| {
                if volume.attachment.take().is_some() {
                    volume.status = VolumeStatus::Available;
                }
                Ok(())
            })
            .await
    }

    /// Volumes attached to `instance_id`.
    pub async fn list_attachments(&self, instance_id: &str) -> Result<Vec<Volume>> {
        let request = FilterRequest::new().filter("attachment.instance-id", [instance_id]);
        self.inner.volumes.describe(&request).await
    }

    // ========================================================================
    // Images
    // ========================================================================

    pub async fn save_image(&self, image: Image) -> Result<Image> {
        self.inner.images.save(image).await
    }

    pub async fn get_image(&self, id: &str) -> Result<Image> {
        self.inner.images.get(id).await
    }

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        self.inner.images.list().await
    }

    pub async fn describe_images(&self, request: &FilterRequest) -> Result<Vec<Image>> {
        self.inner.images.describe(request).await
    }

    pub async fn delete_image(&self, id: &str) -> Result<()> {
        self.inner.images.delete(id).await
    }

    pub async fn update_image_state(&self, id: &str, state: ImageState) -> Result<Image> {
        self.inner
            .images
            .update(id, |image| {
                image.state = state;
                Ok(())
            })
            .await
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub async fn save_snapshot(&self, snapshot: Snapshot) -> Result<Snapshot> {
        self.inner.snapshots.save(snapshot).await
    }

    pub async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        self.inner.snapshots.get(id).await
    }

    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.inner.snapshots.list().await
    }

    pub async fn describe_snapshots(&self, request: &FilterRequest) -> Result<Vec<Snapshot>> {
        self.inner.snapshots.describe(request).await
    }

    pub async fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.inner.snapshots.delete(id).await
    }

    pub async fn update_snapshot_status(
        &self,
        id: &str,
        status: SnapshotStatus,
        progress: u8,
    ) -> Result<Snapshot> {
        self.inner
            .snapshots
            .update(id, |snapshot| {
                snapshot.status = status;
                snapshot.progress = progress.min(100);
                Ok(())
            })
            .await
    }

    /// Read straight from the volume's snapshot index file.
    pub async fn list_snapshots_for_volume(&self, volume_id: &str) -> Result<Vec<Snapshot>> {
        self.inner.snapshots.store().list_for_volume(volume_id).await
    }

    // ========================================================================
    // Key pairs
    // ========================================================================

    pub async fn save_key_pair(&self, keypair: KeyPair) -> Result<KeyPair> {
        self.inner.keypairs.save(keypair).await
    }

    pub async fn get_key_pair(&self, id: &str) -> Result<KeyPair> {
        self.inner.keypairs.get(id).await
    }

    pub async fn list_key_pairs(&self) -> Result<Vec<KeyPair>> {
        self.inner.keypairs.list().await
    }

    pub async fn describe_key_pairs(&self, request: &FilterRequest) -> Result<Vec<KeyPair>> {
        self.inner.keypairs.describe(request).await
    }

    pub async fn delete_key_pair(&self, id: &str) -> Result<()> {
        self.inner.keypairs.delete(id).await
    }

    pub async fn get_public_key(&self, id: &str) -> Result<String> {
        self.inner
            .keypairs
            .store()
            .public_key(id)
            .await?
            .ok_or_else(|| StoreError::not_found(ResourceClass::KeyPair, id))
    }
}
