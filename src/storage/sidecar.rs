//! Atomic JSON sidecar files.
//!
//! A write goes to a uniquely named temp file in the target's directory, is
//! fsynced, then renamed over the target. Readers see either the previous
//! complete file or the new one.

use super::layout::{TEMP_SUFFIX, backup_path, deregistered_marker};
use crate::core::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Highest envelope version this build understands.
pub const SIDECAR_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarEnvelope<T> {
    pub version: u32,
    #[serde(default)]
    pub schema_version: u32,
    pub resource_type: String,
    #[serde(default = "Utc::now")]
    pub written_at: DateTime<Utc>,
    pub data: T,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    version: u32,
    resource_type: String,
}

/// Outcome of inspecting a sidecar without using its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Missing,
    Valid,
    Corrupted(String),
    Unsupported(u32),
}

pub async fn save<T: Serialize>(
    path: &Path,
    resource_type: &str,
    schema_version: u32,
    value: &T,
    keep_backup: bool,
) -> Result<()> {
    let envelope = SidecarEnvelope {
        version: SIDECAR_FORMAT_VERSION,
        schema_version,
        resource_type: resource_type.to_string(),
        written_at: Utc::now(),
        data: value,
    };
    let bytes = serde_json::to_vec_pretty(&envelope).map_err(|e| {
        StoreError::Serialization(format!("encode sidecar '{}': {}", path.display(), e))
    })?;

    if keep_backup {
        backup_current(path).await?;
    }
    atomic_write(path, &bytes).await
}

pub async fn load<T: DeserializeOwned>(path: &Path, resource_type: &str) -> Result<Option<T>> {
    Ok(load_envelope(path, resource_type)
        .await?
        .map(|envelope| envelope.data))
}

pub async fn load_envelope<T: DeserializeOwned>(
    path: &Path,
    resource_type: &str,
) -> Result<Option<SidecarEnvelope<T>>> {
    let Some(bytes) = read_optional(path).await? else {
        return Ok(None);
    };
    decode(path, &bytes, resource_type).map(Some)
}

pub fn decode<T: DeserializeOwned>(
    path: &Path,
    bytes: &[u8],
    resource_type: &str,
) -> Result<SidecarEnvelope<T>> {
    let header: EnvelopeHeader = serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupted {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if header.version > SIDECAR_FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: header.version,
            supported: SIDECAR_FORMAT_VERSION,
        });
    }
    if header.resource_type != resource_type {
        return Err(StoreError::Corrupted {
            path: path.to_path_buf(),
            reason: format!(
                "resource_type '{}' where '{}' was expected",
                header.resource_type, resource_type
            ),
        });
    }
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupted {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

pub async fn validate(path: &Path, resource_type: &str) -> Validation {
    match load_envelope::<serde_json::Value>(path, resource_type).await {
        Ok(None) => Validation::Missing,
        Ok(Some(_)) => Validation::Valid,
        Err(StoreError::UnsupportedVersion { found, .. }) => Validation::Unsupported(found),
        Err(err) => Validation::Corrupted(err.to_string()),
    }
}

/// Removes the sidecar and its backup. Absent files are not an error.
///
/// The backup goes first: a sidecar without a backup is still a live record,
/// while a backup without its sidecar would be restored by repair.
pub async fn delete(path: &Path) -> Result<()> {
    remove_if_exists(&backup_path(path)).await?;
    remove_if_exists(path).await
}

/// Records that `artifact` was deregistered on purpose, so a missing sidecar
/// is expected rather than lost.
pub async fn mark_deregistered(artifact: &Path) -> Result<()> {
    atomic_write(&deregistered_marker(artifact), Utc::now().to_rfc3339().as_bytes()).await
}

pub async fn is_deregistered(artifact: &Path) -> bool {
    exists(&deregistered_marker(artifact)).await
}

pub async fn clear_deregistered(artifact: &Path) -> Result<()> {
    remove_if_exists(&deregistered_marker(artifact)).await
}

pub async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Replaces `path` with its `.backup` sibling if that backup validates.
pub async fn restore_backup(path: &Path, resource_type: &str) -> Result<bool> {
    let backup = backup_path(path);
    if validate(&backup, resource_type).await != Validation::Valid {
        return Ok(false);
    }
    let bytes = fs::read(&backup)
        .await
        .map_err(|e| StoreError::io(format!("read backup '{}'", backup.display()), e))?;
    atomic_write(path, &bytes).await?;
    Ok(true)
}

/// Copies the current file to its backup slot, skipping unparsable content so a
/// good backup is never replaced by a corrupt one.
async fn backup_current(path: &Path) -> Result<()> {
    let Some(bytes) = read_optional(path).await? else {
        return Ok(());
    };
    if serde_json::from_slice::<serde_json::Value>(&bytes).is_err() {
        warn!(path = %path.display(), "current sidecar is unparsable, keeping previous backup");
        return Ok(());
    }
    atomic_write(&backup_path(path), &bytes).await
}

pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(format!("read '{}'", path.display()), e)),
    }
}

pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(format!("remove '{}'", path.display()), e)),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.{}{}",
        name,
        uuid::Uuid::new_v4().simple(),
        TEMP_SUFFIX
    ))
}

pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            StoreError::io(
                format!("create parent directory '{}'", parent.display()),
                e,
            )
        })?;
    }

    let tmp = temp_path_for(path);
    if let Err(err) = write_synced(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err);
    }

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::io(
            format!("rename '{}' -> '{}'", tmp.display(), path.display()),
            e,
        ));
    }

    if let Some(parent) = path.parent() {
        sync_dir(parent).await;
    }
    Ok(())
}

async fn write_synced(tmp: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(tmp)
        .await
        .map_err(|e| StoreError::io(format!("create temp file '{}'", tmp.display()), e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(format!("write temp file '{}'", tmp.display()), e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io(format!("sync temp file '{}'", tmp.display()), e))?;
    Ok(())
}

// Persists the rename itself. Not every platform can open a directory for sync.
async fn sync_dir(dir: &Path) {
    match fs::File::open(dir).await {
        Ok(handle) => {
            if let Err(e) = handle.sync_all().await {
                tracing::debug!(dir = %dir.display(), error = %e, "directory sync failed");
            }
        }
        Err(e) => tracing::debug!(dir = %dir.display(), error = %e, "directory open for sync failed"),
    }
}
