//! Startup detection and correction of damaged or orphaned metadata.
//!
//! Repair never fails startup: every problem is logged and counted in the
//! [`RepairReport`], and whatever validates is indexed afterwards.

use crate::core::{DiskFormat, Result};
use crate::lock::LockManager;
use crate::storage::layout::{
    BACKUP_SUFFIX, DEREGISTERED_SUFFIX, SIDECAR_SUFFIX, is_temp_file, list_files,
    parse_artifact_name,
};
use crate::storage::{StoreLayout, Validation, artifact_for_sidecar, sidecar, sidecar_path};
use crate::store::image::IMAGE_RESOURCE_TYPE;
use crate::store::keypair::KEYPAIR_RESOURCE_TYPE;
use crate::store::snapshot::SNAPSHOT_INDEX_RESOURCE_TYPE;
use crate::store::volume::VOLUME_RESOURCE_TYPE;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    pub stale_locks_removed: usize,
    pub temp_files_removed: Vec<PathBuf>,
    pub restored: Vec<PathBuf>,
    pub unrecoverable: Vec<PathBuf>,
    pub unsupported: Vec<PathBuf>,
    pub orphans_removed: Vec<PathBuf>,
    pub errors: Vec<String>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.restored.is_empty()
            && self.unrecoverable.is_empty()
            && self.unsupported.is_empty()
            && self.orphans_removed.is_empty()
            && self.temp_files_removed.is_empty()
            && self.errors.is_empty()
    }

    fn record_error(&mut self, context: &str, err: impl std::fmt::Display) {
        error!(context, error = %err, "repair step failed");
        self.errors.push(format!("{}: {}", context, err));
    }
}

pub struct Repairer {
    layout: StoreLayout,
    locks: Arc<LockManager>,
    /// Temp files younger than this may belong to a live writer.
    temp_grace: Duration,
}

impl Repairer {
    pub fn new(layout: StoreLayout, locks: Arc<LockManager>) -> Self {
        let temp_grace = locks.policy().stale_after();
        Self {
            layout,
            locks,
            temp_grace,
        }
    }

    pub async fn run(&self) -> RepairReport {
        let span = info_span!("repair", base = %self.layout.base().display());
        async {
            let mut report = RepairReport::default();

            match self.locks.sweep_stale() {
                Ok(removed) => report.stale_locks_removed = removed,
                Err(err) => report.record_error("stale lock sweep", err),
            }
            for dir in [
                self.layout.volumes_dir(),
                self.layout.images_dir(),
                self.layout.snapshots_dir(),
                self.layout.keypairs_dir(),
            ] {
                if let Err(err) = self.remove_temp_files(&dir, &mut report).await {
                    report.record_error("temp file cleanup", err);
                }
            }

            let artifact_dirs = [
                (self.layout.volumes_dir(), VOLUME_RESOURCE_TYPE),
                (self.layout.images_dir(), IMAGE_RESOURCE_TYPE),
            ];
            for (dir, resource_type) in artifact_dirs {
                if let Err(err) = self.repair_artifact_dir(&dir, resource_type, &mut report).await {
                    report.record_error(resource_type, err);
                }
            }
            if let Err(err) = self.repair_snapshot_indexes(&mut report).await {
                report.record_error(SNAPSHOT_INDEX_RESOURCE_TYPE, err);
            }
            if let Err(err) = self.repair_keypairs(&mut report).await {
                report.record_error(KEYPAIR_RESOURCE_TYPE, err);
            }

            info!(
                stale_locks = report.stale_locks_removed,
                temp_files = report.temp_files_removed.len(),
                restored = report.restored.len(),
                unrecoverable = report.unrecoverable.len(),
                orphans = report.orphans_removed.len(),
                "repair finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn remove_temp_files(&self, dir: &Path, report: &mut RepairReport) -> Result<()> {
        for path in list_files(dir).await? {
            if !is_temp_file(&path) {
                continue;
            }
            let age = tokio::fs::metadata(&path)
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.elapsed().ok())
                .unwrap_or(Duration::ZERO);
            if age < self.temp_grace {
                continue;
            }
            sidecar::remove_if_exists(&path).await?;
            info!(path = %path.display(), "removed interrupted write");
            report.temp_files_removed.push(path);
        }
        Ok(())
    }

    /// Checks one sidecar, restoring it from its backup when it is missing
    /// or unparsable.
    async fn check(&self, path: &Path, resource_type: &str, report: &mut RepairReport) {
        let problem = match sidecar::validate(path, resource_type).await {
            Validation::Valid => return,
            Validation::Unsupported(version) => {
                warn!(path = %path.display(), version, "leaving sidecar with newer format untouched");
                report.unsupported.push(path.to_path_buf());
                return;
            }
            Validation::Missing => "missing".to_string(),
            Validation::Corrupted(reason) => reason,
        };

        match sidecar::restore_backup(path, resource_type).await {
            Ok(true) => {
                warn!(path = %path.display(), problem = %problem, "restored metadata from backup");
                report.restored.push(path.to_path_buf());
            }
            Ok(false) => {
                error!(
                    path = %path.display(),
                    problem = %problem,
                    "metadata is unrecoverable, resource stays unindexed"
                );
                report.unrecoverable.push(path.to_path_buf());
            }
            Err(err) => report.record_error(&format!("restore '{}'", path.display()), err),
        }
    }

    async fn repair_artifact_dir(
        &self,
        dir: &Path,
        resource_type: &str,
        report: &mut RepairReport,
    ) -> Result<()> {
        let files = list_files(dir).await?;
        for path in &files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if parse_artifact_name(path).is_some() {
                let sidecar = sidecar_path(path);
                if !sidecar::exists(&sidecar).await && sidecar::is_deregistered(path).await {
                    debug!(path = %path.display(), "artifact was deregistered");
                    continue;
                }
                self.check(&sidecar, resource_type, report).await;
            } else if let Some(artifact) = name
                .strip_suffix(DEREGISTERED_SUFFIX)
                .map(|n| path.with_file_name(n))
            {
                if !sidecar::exists(&artifact).await {
                    sidecar::remove_if_exists(path).await?;
                    report.orphans_removed.push(path.clone());
                }
            } else if name.ends_with(SIDECAR_SUFFIX) && !name.starts_with('.') {
                let Some(artifact) = artifact_for_sidecar(path) else {
                    continue;
                };
                if !sidecar::exists(&artifact).await {
                    sidecar::delete(path).await?;
                    warn!(path = %path.display(), "removed sidecar of missing artifact");
                    report.orphans_removed.push(path.clone());
                }
            } else if let Some(current) = name
                .strip_suffix(BACKUP_SUFFIX)
                .filter(|n| n.ends_with(SIDECAR_SUFFIX))
                .map(|n| path.with_file_name(n))
            {
                // A backup whose sidecar and artifact are both gone.
                let artifact_gone = match artifact_for_sidecar(&current) {
                    Some(artifact) => !sidecar::exists(&artifact).await,
                    None => true,
                };
                if artifact_gone && !sidecar::exists(&current).await {
                    sidecar::remove_if_exists(path).await?;
                    report.orphans_removed.push(path.clone());
                }
            }
        }
        Ok(())
    }

    async fn repair_snapshot_indexes(&self, report: &mut RepairReport) -> Result<()> {
        for path in list_files(&self.layout.snapshots_dir()).await? {
            let Some(volume_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .filter(|n| !n.starts_with('.'))
                .and_then(|n| n.strip_suffix(".json"))
                .map(str::to_string)
            else {
                continue;
            };

            if !self.volume_exists(&volume_id).await? {
                sidecar::delete(&path).await?;
                warn!(path = %path.display(), volume = %volume_id, "removed snapshot index of missing volume");
                report.orphans_removed.push(path);
                continue;
            }
            self.check(&path, SNAPSHOT_INDEX_RESOURCE_TYPE, report).await;
        }
        Ok(())
    }

    async fn volume_exists(&self, volume_id: &str) -> Result<bool> {
        for format in [DiskFormat::Qcow2, DiskFormat::Raw] {
            match self.layout.volume_artifact(volume_id, format) {
                Ok(path) if sidecar::exists(&path).await => return Ok(true),
                Ok(_) => {}
                // Not a valid id, so it cannot name a volume.
                Err(_) => return Ok(false),
            }
        }
        Ok(false)
    }

    async fn repair_keypairs(&self, report: &mut RepairReport) -> Result<()> {
        for path in list_files(&self.layout.keypairs_dir()).await? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if name.ends_with(".json") {
                self.check(&path, KEYPAIR_RESOURCE_TYPE, report).await;
                let key = path.with_extension("pub");
                if !sidecar::exists(&key).await {
                    error!(path = %path.display(), "key pair has no public key file");
                    report.unrecoverable.push(key);
                }
            } else if let Some(id) = name.strip_suffix(".pub") {
                let metadata = path.with_file_name(format!("{}.json", id));
                if !sidecar::exists(&metadata).await {
                    self.check(&metadata, KEYPAIR_RESOURCE_TYPE, report).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockPolicy;
    use crate::core::{Volume, VolumeStatus};
    use crate::storage::backup_path;
    use crate::storage::disk_image::qcow2_header;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, StoreLayout, Repairer) {
        let temp_dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(temp_dir.path());
        layout.bootstrap().await.unwrap();
        let policy = LockPolicy {
            stale_after_ms: 0,
            ..LockPolicy::default()
        };
        let locks = Arc::new(LockManager::new(layout.clone(), policy));
        let repairer = Repairer::new(layout.clone(), locks);
        (temp_dir, layout, repairer)
    }

    async fn volume_with_sidecar(layout: &StoreLayout, id: &str) -> PathBuf {
        let artifact = layout.volume_artifact(id, DiskFormat::Qcow2).unwrap();
        tokio::fs::write(&artifact, qcow2_header(1 << 30)).await.unwrap();
        let volume = Volume::new(id, DiskFormat::Qcow2);
        sidecar::save(&sidecar_path(&artifact), VOLUME_RESOURCE_TYPE, 1, &volume, true)
            .await
            .unwrap();
        artifact
    }

    #[tokio::test]
    async fn test_clean_tree_reports_nothing() {
        let (_dir, layout, repairer) = setup().await;
        volume_with_sidecar(&layout, "vol-1").await;
        assert!(repairer.run().await.is_clean());
    }

    #[tokio::test]
    async fn test_corrupt_sidecar_restored_from_backup() {
        let (_dir, layout, repairer) = setup().await;
        let artifact = volume_with_sidecar(&layout, "vol-1").await;
        let path = sidecar_path(&artifact);
        let mut updated = Volume::new("vol-1", DiskFormat::Qcow2);
        updated.status = VolumeStatus::InUse;
        sidecar::save(&path, VOLUME_RESOURCE_TYPE, 1, &updated, true)
            .await
            .unwrap();
        tokio::fs::write(&path, b"{\"version\":1,\"resour").await.unwrap();

        let report = repairer.run().await;
        assert_eq!(report.restored, vec![path.clone()]);
        let restored: Volume = sidecar::load(&path, VOLUME_RESOURCE_TYPE).await.unwrap().unwrap();
        assert_eq!(restored.status, VolumeStatus::Available);
    }

    #[tokio::test]
    async fn test_missing_sidecar_without_backup_is_unrecoverable() {
        let (_dir, layout, repairer) = setup().await;
        let artifact = layout.volume_artifact("vol-bare", DiskFormat::Qcow2).unwrap();
        tokio::fs::write(&artifact, qcow2_header(1)).await.unwrap();

        let report = repairer.run().await;
        assert_eq!(report.unrecoverable, vec![sidecar_path(&artifact)]);
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn test_deregistered_artifact_is_not_reported() {
        let (_dir, layout, repairer) = setup().await;
        let artifact = layout.image_artifact("img-1", DiskFormat::Raw).unwrap();
        tokio::fs::write(&artifact, vec![0u8; 512]).await.unwrap();
        sidecar::mark_deregistered(&artifact).await.unwrap();
        assert!(repairer.run().await.is_clean());

        // Once the artifact is gone the marker is an orphan.
        tokio::fs::remove_file(&artifact).await.unwrap();
        let report = repairer.run().await;
        assert_eq!(
            report.orphans_removed,
            vec![layout.images_dir().join("img-1.raw.jvp.deregistered")]
        );
        assert!(repairer.run().await.is_clean());
    }

    #[tokio::test]
    async fn test_interrupted_delete_does_not_resurrect() {
        let (_dir, layout, repairer) = setup().await;
        let artifact = volume_with_sidecar(&layout, "vol-1").await;
        let path = sidecar_path(&artifact);
        sidecar::save(&path, VOLUME_RESOURCE_TYPE, 1, &Volume::new("vol-1", DiskFormat::Qcow2), true)
            .await
            .unwrap();
        assert!(backup_path(&path).exists());

        // A delete stopped after its first step leaves the sidecar without a backup.
        sidecar::remove_if_exists(&backup_path(&path)).await.unwrap();
        let report = repairer.run().await;
        assert!(report.is_clean());
        assert!(sidecar::load::<Volume>(&path, VOLUME_RESOURCE_TYPE).await.unwrap().is_some());

        // Volume delete removes the artifact before the sidecar; stopping in
        // between leaves an orphan sidecar, never a backup to restore.
        tokio::fs::remove_file(&artifact).await.unwrap();
        let report = repairer.run().await;
        assert_eq!(report.orphans_removed, vec![path.clone()]);
        assert!(report.restored.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_orphans_and_temp_files_removed() {
        let (_dir, layout, repairer) = setup().await;
        let artifact = volume_with_sidecar(&layout, "vol-gone").await;
        tokio::fs::remove_file(&artifact).await.unwrap();
        let snapshots = layout.snapshot_index("vol-gone").unwrap();
        tokio::fs::write(&snapshots, b"{}").await.unwrap();
        let temp = layout.volumes_dir().join(".vol-1.qcow2.jvp.json.abc.tmp");
        tokio::fs::write(&temp, b"{\"partial").await.unwrap();

        let report = repairer.run().await;
        assert!(report.orphans_removed.contains(&sidecar_path(&artifact)));
        assert!(report.orphans_removed.contains(&snapshots));
        assert_eq!(report.temp_files_removed, vec![temp.clone()]);
        assert!(!sidecar_path(&artifact).exists());
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_newer_format_left_untouched() {
        let (_dir, layout, repairer) = setup().await;
        let artifact = layout.volume_artifact("vol-new", DiskFormat::Qcow2).unwrap();
        tokio::fs::write(&artifact, qcow2_header(1)).await.unwrap();
        let body = r#"{"version":99,"resource_type":"volume","data":{}}"#;
        tokio::fs::write(sidecar_path(&artifact), body).await.unwrap();

        let report = repairer.run().await;
        assert_eq!(report.unsupported, vec![sidecar_path(&artifact)]);
        let on_disk = tokio::fs::read_to_string(sidecar_path(&artifact)).await.unwrap();
        assert_eq!(on_disk, body);
    }
}
