use super::ResourceStore;
use crate::core::{DiskFormat, Image, ResourceClass, Result, StoreError};
use crate::index::IndexEntry;
use crate::storage::disk_image::virtual_size;
use crate::storage::layout::{SIDECAR_SUFFIX, list_files};
use crate::storage::{StoreLayout, artifact_for_sidecar, sidecar, sidecar_path};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const IMAGE_RESOURCE_TYPE: &str = "image";
const SCHEMA_VERSION: u32 = 1;

/// Images: a disk artifact under `images/` plus its sidecar.
pub struct ImageStore {
    layout: StoreLayout,
    keep_backup: bool,
}

impl ImageStore {
    pub fn new(layout: StoreLayout, keep_backup: bool) -> Self {
        Self {
            layout,
            keep_backup,
        }
    }

    async fn load_at(&self, artifact: &Path) -> Result<Option<Image>> {
        let Some(mut image) =
            sidecar::load::<Image>(&sidecar_path(artifact), IMAGE_RESOURCE_TYPE).await?
        else {
            return Ok(None);
        };
        if !sidecar::exists(artifact).await {
            return Ok(None);
        }
        image.size_bytes = virtual_size(artifact).await?;
        image.path = artifact.to_path_buf();
        Ok(Some(image))
    }

    fn candidates(&self, id: &str, locator: Option<&str>) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(3);
        if let Some(locator) = locator {
            paths.push(PathBuf::from(locator));
        }
        for format in [DiskFormat::Qcow2, DiskFormat::Raw] {
            let path = self.layout.image_artifact(id, format)?;
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

#[async_trait]
impl ResourceStore for ImageStore {
    type Resource = Image;

    fn class(&self) -> ResourceClass {
        ResourceClass::Image
    }

    async fn enumerate(&self) -> Result<Vec<Image>> {
        let mut images = Vec::new();
        for sidecar in list_files(&self.layout.images_dir()).await? {
            let is_sidecar = sidecar
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(SIDECAR_SUFFIX) && !n.starts_with('.'));
            let Some(artifact) = artifact_for_sidecar(&sidecar).filter(|_| is_sidecar) else {
                continue;
            };
            match self.load_at(&artifact).await {
                Ok(Some(image)) => images.push(image),
                Ok(None) => {}
                Err(err) => warn!(path = %sidecar.display(), error = %err, "skipping image"),
            }
        }
        Ok(images)
    }

    async fn fetch(&self, id: &str, locator: Option<&str>) -> Result<Option<Image>> {
        for artifact in self.candidates(id, locator)? {
            if let Some(image) = self.load_at(&artifact).await?
                && image.id == id
            {
                return Ok(Some(image));
            }
        }
        Ok(None)
    }

    async fn persist(&self, image: &mut Image, _locator: Option<&str>) -> Result<()> {
        let artifact = self.layout.image_artifact(&image.id, image.format)?;
        if !sidecar::exists(&artifact).await {
            return Err(StoreError::InvalidArgument(format!(
                "image '{}' has no artifact at '{}'",
                image.id,
                artifact.display()
            )));
        }
        sidecar::save(
            &sidecar_path(&artifact),
            IMAGE_RESOURCE_TYPE,
            SCHEMA_VERSION,
            image,
            self.keep_backup,
        )
        .await?;
        sidecar::clear_deregistered(&artifact).await?;
        image.size_bytes = virtual_size(&artifact).await?;
        image.path = artifact;
        Ok(())
    }

    /// Deregistration drops the metadata; the artifact may back other volumes.
    /// A marker next to it tells repair the missing sidecar is intended.
    async fn erase(&self, id: &str, locator: Option<&str>) -> Result<Option<IndexEntry>> {
        let mut found = false;
        for artifact in self.candidates(id, locator)? {
            let sidecar = sidecar_path(&artifact);
            if sidecar::exists(&sidecar).await {
                found = true;
                sidecar::mark_deregistered(&artifact).await?;
                sidecar::delete(&sidecar).await?;
            }
        }
        if !found {
            return Err(StoreError::not_found(ResourceClass::Image, id));
        }
        Ok(None)
    }

    fn summary(&self, image: &Image) -> IndexEntry {
        IndexEntry::new(
            ResourceClass::Image,
            &image.id,
            image.path.display().to_string(),
            image.state.as_str(),
        )
        .kind(image.format.as_str())
        .tags(&image.tags)
    }
}
