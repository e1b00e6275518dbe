use super::ResourceStore;
use crate::bridge::{DomainMetadataBridge, instance_from};
use crate::core::{Instance, ResourceClass, Result, StoreError};
use crate::index::IndexEntry;
use async_trait::async_trait;
use chrono::Utc;

/// Instances live in the hypervisor's domain records.
pub struct InstanceStore {
    bridge: DomainMetadataBridge,
}

impl InstanceStore {
    pub fn new(bridge: DomainMetadataBridge) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &DomainMetadataBridge {
        &self.bridge
    }
}

#[async_trait]
impl ResourceStore for InstanceStore {
    type Resource = Instance;

    fn class(&self) -> ResourceClass {
        ResourceClass::Instance
    }

    async fn enumerate(&self) -> Result<Vec<Instance>> {
        self.bridge.list_instances().await
    }

    async fn fetch(&self, id: &str, locator: Option<&str>) -> Result<Option<Instance>> {
        if let Some(domain) = locator
            && let Some(instance) = self.bridge.load(domain).await?
            && instance.id == id
        {
            return Ok(Some(instance));
        }
        // Not indexed, or the index is stale: an adopted instance is found
        // by its domain name, anything else needs a scan.
        if let Some(instance) = self.bridge.load(id).await?
            && instance.id == id
        {
            return Ok(Some(instance));
        }
        Ok(self
            .bridge
            .list_instances()
            .await?
            .into_iter()
            .find(|instance| instance.id == id))
    }

    async fn persist(&self, instance: &mut Instance, locator: Option<&str>) -> Result<()> {
        let domain_name = match locator {
            Some(domain) => domain.to_string(),
            None if !instance.domain_name.is_empty() => instance.domain_name.clone(),
            None => return Err(StoreError::not_found(ResourceClass::Instance, &instance.id)),
        };

        let now = Utc::now();
        instance.created_at.get_or_insert(now);
        instance.updated_at = Some(now);
        instance.domain_name = domain_name.clone();

        let record = self.bridge.write_fragment(&domain_name, instance).await?;
        // Runtime fields are the daemon's, never the caller's.
        let live = instance_from(&record, None);
        instance.state = live.state;
        instance.memory_mib = live.memory_mib;
        instance.vcpus = live.vcpus;
        Ok(())
    }

    async fn erase(&self, id: &str, locator: Option<&str>) -> Result<Option<IndexEntry>> {
        let domain_name = match locator {
            Some(domain) => domain.to_string(),
            None => match self.fetch(id, None).await? {
                Some(instance) => instance.domain_name,
                None => return Err(StoreError::not_found(ResourceClass::Instance, id)),
            },
        };
        let record = self.bridge.clear_fragment(&domain_name, id).await?;
        // The domain itself stays; it is listed again as adopted.
        Ok(Some(self.summary(&instance_from(&record, None))))
    }

    // Adopted ids are native domain names and never become paths.
    fn validate_id(&self, id: &str) -> Result<()> {
        if id.is_empty() || id.chars().any(char::is_control) {
            return Err(StoreError::InvalidArgument(format!(
                "invalid instance id '{}'",
                id.escape_debug()
            )));
        }
        Ok(())
    }

    fn summary(&self, instance: &Instance) -> IndexEntry {
        IndexEntry::new(
            ResourceClass::Instance,
            &instance.id,
            &instance.domain_name,
            instance.state.as_str(),
        )
        .image(instance.image_id.as_deref())
        .volume(instance.volume_id.as_deref())
    }

    fn supersedes(&self, instance: &Instance) -> Option<String> {
        Some(instance.domain_name.clone())
    }
}
