use super::ResourceStore;
use crate::core::{KeyPair, ResourceClass, Result, StoreError};
use crate::index::IndexEntry;
use crate::storage::layout::list_files;
use crate::storage::{StoreLayout, sidecar};
use async_trait::async_trait;
use std::path::Path;
use tracing::warn;

pub const KEYPAIR_RESOURCE_TYPE: &str = "keypair";
const SCHEMA_VERSION: u32 = 1;

/// Key pairs: `<id>.json` metadata plus `<id>.pub` key material.
pub struct KeyPairStore {
    layout: StoreLayout,
    keep_backup: bool,
}

impl KeyPairStore {
    pub fn new(layout: StoreLayout, keep_backup: bool) -> Self {
        Self {
            layout,
            keep_backup,
        }
    }

    pub async fn public_key(&self, id: &str) -> Result<Option<String>> {
        let path = self.layout.keypair_public_key(id)?;
        Ok(sidecar::read_optional(&path)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim_end().to_string()))
    }

    async fn load_at(&self, metadata: &Path) -> Result<Option<KeyPair>> {
        let Some(mut keypair) = sidecar::load::<KeyPair>(metadata, KEYPAIR_RESOURCE_TYPE).await?
        else {
            return Ok(None);
        };
        match self.public_key(&keypair.id).await? {
            Some(key) => keypair.public_key = key,
            None => warn!(id = %keypair.id, "key pair has no public key file"),
        }
        Ok(Some(keypair))
    }
}

#[async_trait]
impl ResourceStore for KeyPairStore {
    type Resource = KeyPair;

    fn class(&self) -> ResourceClass {
        ResourceClass::KeyPair
    }

    async fn enumerate(&self) -> Result<Vec<KeyPair>> {
        let mut keypairs = Vec::new();
        for path in list_files(&self.layout.keypairs_dir()).await? {
            let is_metadata = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".json") && !n.starts_with('.'));
            if !is_metadata {
                continue;
            }
            match self.load_at(&path).await {
                Ok(Some(keypair)) => keypairs.push(keypair),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "skipping key pair"),
            }
        }
        Ok(keypairs)
    }

    async fn fetch(&self, id: &str, _locator: Option<&str>) -> Result<Option<KeyPair>> {
        let path = self.layout.keypair_metadata(id)?;
        match self.load_at(&path).await? {
            Some(keypair) if keypair.id == id => Ok(Some(keypair)),
            Some(keypair) => Err(StoreError::Corrupted {
                path,
                reason: format!("metadata names key pair '{}'", keypair.id),
            }),
            None => Ok(None),
        }
    }

    async fn persist(&self, keypair: &mut KeyPair, _locator: Option<&str>) -> Result<()> {
        let key_path = self.layout.keypair_public_key(&keypair.id)?;
        if keypair.public_key.trim().is_empty() {
            // Metadata-only update keeps the stored key.
            keypair.public_key = self.public_key(&keypair.id).await?.ok_or_else(|| {
                StoreError::InvalidArgument(format!("key pair '{}' has no public key", keypair.id))
            })?;
        } else {
            let mut material = keypair.public_key.trim_end().to_string();
            material.push('\n');
            sidecar::atomic_write(&key_path, material.as_bytes()).await?;
        }

        let metadata = self.layout.keypair_metadata(&keypair.id)?;
        sidecar::save(
            &metadata,
            KEYPAIR_RESOURCE_TYPE,
            SCHEMA_VERSION,
            keypair,
            self.keep_backup,
        )
        .await
    }

    async fn erase(&self, id: &str, _locator: Option<&str>) -> Result<Option<IndexEntry>> {
        let metadata = self.layout.keypair_metadata(id)?;
        let key_path = self.layout.keypair_public_key(id)?;
        if !sidecar::exists(&metadata).await && !sidecar::exists(&key_path).await {
            return Err(StoreError::not_found(ResourceClass::KeyPair, id));
        }
        sidecar::delete(&metadata).await?;
        sidecar::remove_if_exists(&key_path).await?;
        Ok(None)
    }

    fn summary(&self, keypair: &KeyPair) -> IndexEntry {
        let locator = self
            .layout
            .keypair_metadata(&keypair.id)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        IndexEntry::new(ResourceClass::KeyPair, &keypair.id, locator, "available")
            .kind(&keypair.key_type)
            .tags(&keypair.tags)
    }
}
