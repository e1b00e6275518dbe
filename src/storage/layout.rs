//! On-disk layout under the configured base path.
//!
//! ```text
//! volumes/<volume-id>.qcow2
//! volumes/<volume-id>.qcow2.jvp.json
//! volumes/.snapshots/<volume-id>.json
//! images/<image-id>.qcow2[.jvp.json]
//! keypairs/<keypair-id>.json
//! keypairs/<keypair-id>.pub
//! locks/<resource-class>/<resource-id>.lock
//! ```

use crate::core::{DiskFormat, Result, StoreError, validate_resource_id};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

pub const SIDECAR_SUFFIX: &str = ".jvp.json";
pub const BACKUP_SUFFIX: &str = ".backup";
pub const TEMP_SUFFIX: &str = ".tmp";
pub const LOCK_SUFFIX: &str = ".lock";
pub const DEREGISTERED_SUFFIX: &str = ".jvp.deregistered";

const VOLUMES_DIR: &str = "volumes";
const IMAGES_DIR: &str = "images";
const SNAPSHOTS_DIR: &str = ".snapshots";
const KEYPAIRS_DIR: &str = "keypairs";
const LOCKS_DIR: &str = "locks";

#[derive(Debug, Clone)]
pub struct StoreLayout {
    base: PathBuf,
}

impl StoreLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.base.join(VOLUMES_DIR)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.base.join(IMAGES_DIR)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.volumes_dir().join(SNAPSHOTS_DIR)
    }

    pub fn keypairs_dir(&self) -> PathBuf {
        self.base.join(KEYPAIRS_DIR)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.base.join(LOCKS_DIR)
    }

    /// Create every directory the store writes into.
    pub async fn bootstrap(&self) -> Result<()> {
        for dir in [
            self.volumes_dir(),
            self.images_dir(),
            self.snapshots_dir(),
            self.keypairs_dir(),
            self.locks_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                StoreError::io(format!("create directory '{}'", dir.display()), e)
            })?;
        }
        Ok(())
    }

    pub fn volume_artifact(&self, id: &str, format: DiskFormat) -> Result<PathBuf> {
        validate_resource_id(id)?;
        Ok(self
            .volumes_dir()
            .join(format!("{}.{}", id, format.extension())))
    }

    pub fn image_artifact(&self, id: &str, format: DiskFormat) -> Result<PathBuf> {
        validate_resource_id(id)?;
        Ok(self
            .images_dir()
            .join(format!("{}.{}", id, format.extension())))
    }

    pub fn snapshot_index(&self, volume_id: &str) -> Result<PathBuf> {
        validate_resource_id(volume_id)?;
        Ok(self.snapshots_dir().join(format!("{}.json", volume_id)))
    }

    pub fn keypair_metadata(&self, id: &str) -> Result<PathBuf> {
        validate_resource_id(id)?;
        Ok(self.keypairs_dir().join(format!("{}.json", id)))
    }

    pub fn keypair_public_key(&self, id: &str) -> Result<PathBuf> {
        validate_resource_id(id)?;
        Ok(self.keypairs_dir().join(format!("{}.pub", id)))
    }

    pub fn lock_file(&self, scope: &str, id: &str) -> Result<PathBuf> {
        validate_resource_id(scope)?;
        if id.is_empty() {
            return Err(StoreError::InvalidArgument(
                "lock target has an empty id".to_string(),
            ));
        }
        Ok(self
            .locks_dir()
            .join(scope)
            .join(format!("{}{}", lock_stem(id), LOCK_SUFFIX)))
    }
}

/// Path-safe ids are used as they are. Anything else is hex-encoded behind a
/// `_`, which no path-safe id starts with.
fn lock_stem(id: &str) -> String {
    if validate_resource_id(id).is_ok() {
        return id.to_string();
    }
    let mut stem = String::with_capacity(1 + id.len() * 2);
    stem.push('_');
    for byte in id.bytes() {
        stem.push_str(&format!("{:02x}", byte));
    }
    stem
}

/// `<artifact>.jvp.json`
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    append_suffix(artifact, SIDECAR_SUFFIX)
}

/// Inverse of [`sidecar_path`].
pub fn artifact_for_sidecar(sidecar: &Path) -> Option<PathBuf> {
    let name = sidecar.file_name()?.to_str()?;
    let artifact = name.strip_suffix(SIDECAR_SUFFIX)?;
    if artifact.is_empty() {
        return None;
    }
    Some(sidecar.with_file_name(artifact))
}

/// `<artifact>.jvp.deregistered`
pub fn deregistered_marker(artifact: &Path) -> PathBuf {
    append_suffix(artifact, DEREGISTERED_SUFFIX)
}

pub fn backup_path(path: &Path) -> PathBuf {
    append_suffix(path, BACKUP_SUFFIX)
}

pub fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsStr::to_os_string).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Splits `vol-1.qcow2` into (`vol-1`, qcow2) for recognised disk artifacts.
pub fn parse_artifact_name(path: &Path) -> Option<(String, DiskFormat)> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    let (id, ext) = name.rsplit_once('.')?;
    let format = DiskFormat::from_extension(ext)?;
    if validate_resource_id(id).is_err() {
        return None;
    }
    Some((id.to_string(), format))
}

/// Temp files left behind by an interrupted atomic write.
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| name.starts_with('.') && name.ends_with(TEMP_SUFFIX))
}

/// Regular files directly under `dir`, sorted. A missing directory is empty.
pub async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StoreError::io(
                format!("read directory '{}'", dir.display()),
                e,
            ));
        }
    };

    let mut files = Vec::new();
    loop {
        let entry = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(format!("read directory '{}'", dir.display()), e))?;
        let Some(entry) = entry else { break };
        match entry.file_type().await {
            Ok(kind) if kind.is_file() => files.push(entry.path()),
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}
