use super::{
    DomainInfo, DomainRecord, DomainRef, DomainStateCode, HypervisorClient, MetadataFlags,
    StorageVolumeRecord,
};
use crate::core::{Result, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct FakeDomain {
    domain: DomainRef,
    info: DomainInfo,
    /// Metadata elements keyed by namespace uri.
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct FakeState {
    domains: BTreeMap<String, FakeDomain>,
    volumes: Vec<StorageVolumeRecord>,
    next_id: i32,
    fail_volume_listing: bool,
    unavailable: bool,
    last_flags: Option<MetadataFlags>,
}

/// Hypervisor double holding domains and volumes in memory.
///
/// Clones share state, so a test can keep a handle and mutate the domain set
/// under a running store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHypervisor {
    state: Arc<Mutex<FakeState>>,
}

impl InMemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_domain(
        &self,
        name: &str,
        state: DomainStateCode,
        memory_kib: u64,
        vcpus: u16,
    ) -> DomainRef {
        let mut s = self.state.lock().await;
        s.next_id += 1;
        let id = if state.is_active() { s.next_id } else { -1 };
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        let domain = DomainRef {
            name: name.to_string(),
            uuid,
            id,
        };
        s.domains.insert(
            name.to_string(),
            FakeDomain {
                domain: domain.clone(),
                info: DomainInfo {
                    state,
                    max_memory_kib: memory_kib,
                    memory_kib,
                    vcpus,
                    cpu_time_ns: 0,
                },
                metadata: HashMap::new(),
            },
        );
        domain
    }

    pub async fn set_state(&self, name: &str, state: DomainStateCode) {
        if let Some(d) = self.state.lock().await.domains.get_mut(name) {
            d.info.state = state;
        }
    }

    pub async fn remove_domain(&self, name: &str) {
        self.state.lock().await.domains.remove(name);
    }

    pub async fn add_storage_volume(&self, record: StorageVolumeRecord) {
        self.state.lock().await.volumes.push(record);
    }

    /// Convenience for a volume whose key and path are the artifact path.
    pub async fn add_volume_at(&self, pool: &str, path: impl Into<PathBuf>, capacity: u64) {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.add_storage_volume(StorageVolumeRecord {
            pool: pool.to_string(),
            name,
            key: path.display().to_string(),
            path,
            capacity,
            allocation: capacity,
        })
        .await;
    }

    pub async fn fail_volume_listing(&self, fail: bool) {
        self.state.lock().await.fail_volume_listing = fail;
    }

    /// Makes every call fail as if the daemon socket were gone.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn raw_metadata(&self, name: &str, uri: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .domains
            .get(name)
            .and_then(|d| d.metadata.get(uri).cloned())
    }

    /// Stores a metadata element verbatim, bypassing any validation.
    pub async fn set_raw_metadata(&self, name: &str, uri: &str, xml: &str) {
        if let Some(d) = self.state.lock().await.domains.get_mut(name) {
            d.metadata.insert(uri.to_string(), xml.to_string());
        }
    }

    pub async fn last_metadata_flags(&self) -> Option<MetadataFlags> {
        self.state.lock().await.last_flags
    }

    fn check_available(state: &FakeState) -> Result<()> {
        if state.unavailable {
            return Err(StoreError::Unavailable(
                "in-memory hypervisor marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn no_domain(name: &str) -> StoreError {
    StoreError::Hypervisor {
        code: super::remote::ERR_NO_DOMAIN,
        message: format!("Domain not found: no domain with matching name '{}'", name),
    }
}

#[async_trait]
impl HypervisorClient for InMemoryHypervisor {
    async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        let s = self.state.lock().await;
        Self::check_available(&s)?;
        Ok(s.domains
            .values()
            .map(|d| DomainRecord {
                domain: d.domain.clone(),
                info: d.info.clone(),
            })
            .collect())
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainRecord>> {
        let s = self.state.lock().await;
        Self::check_available(&s)?;
        Ok(s.domains.get(name).map(|d| DomainRecord {
            domain: d.domain.clone(),
            info: d.info.clone(),
        }))
    }

    async fn domain_metadata(&self, domain: &DomainRef, uri: &str) -> Result<Option<String>> {
        let s = self.state.lock().await;
        Self::check_available(&s)?;
        let d = s.domains.get(&domain.name).ok_or_else(|| no_domain(&domain.name))?;
        Ok(d.metadata.get(uri).cloned())
    }

    async fn set_domain_metadata(
        &self,
        domain: &DomainRef,
        metadata: Option<&str>,
        _key: &str,
        uri: &str,
        flags: MetadataFlags,
    ) -> Result<()> {
        let mut s = self.state.lock().await;
        Self::check_available(&s)?;
        let d = s
            .domains
            .get_mut(&domain.name)
            .ok_or_else(|| no_domain(&domain.name))?;
        match metadata {
            Some(xml) => {
                d.metadata.insert(uri.to_string(), xml.to_string());
            }
            None => {
                d.metadata.remove(uri);
            }
        }
        s.last_flags = Some(flags);
        Ok(())
    }

    async fn list_storage_volumes(&self) -> Result<Vec<StorageVolumeRecord>> {
        let s = self.state.lock().await;
        Self::check_available(&s)?;
        if s.fail_volume_listing {
            return Err(StoreError::Hypervisor {
                code: 1,
                message: "storage pool listing refused".to_string(),
            });
        }
        Ok(s.volumes.clone())
    }
}
