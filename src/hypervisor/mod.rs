//! Access to the hypervisor control daemon.
//!
//! The store only needs a handful of daemon calls: enumerate domains, read
//! and write a domain's namespaced metadata element, and enumerate storage
//! volumes. [`HypervisorClient`] is that seam; [`RemoteHypervisor`] speaks the
//! daemon's RPC protocol and [`InMemoryHypervisor`] stands in for it in tests.

pub mod memory;
pub mod remote;
pub mod xdr;

pub use memory::InMemoryHypervisor;
pub use remote::RemoteHypervisor;

use crate::core::Result;
use async_trait::async_trait;
use std::path::PathBuf;

/// Identity of a domain as the daemon reports it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainRef {
    pub name: String,
    pub uuid: [u8; 16],
    /// Runtime id, -1 when the domain is not running.
    pub id: i32,
}

/// Raw runtime state code of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainStateCode(pub u8);

impl DomainStateCode {
    pub const NO_STATE: Self = Self(0);
    pub const RUNNING: Self = Self(1);
    pub const BLOCKED: Self = Self(2);
    pub const PAUSED: Self = Self(3);
    pub const SHUTDOWN: Self = Self(4);
    pub const SHUTOFF: Self = Self(5);
    pub const CRASHED: Self = Self(6);
    pub const PM_SUSPENDED: Self = Self(7);

    /// Whether the domain has a live configuration that metadata writes can target.
    pub fn is_active(&self) -> bool {
        matches!(
            *self,
            Self::RUNNING | Self::BLOCKED | Self::PAUSED | Self::SHUTDOWN | Self::PM_SUSPENDED
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub state: DomainStateCode,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u16,
    pub cpu_time_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub domain: DomainRef,
    pub info: DomainInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageVolumeRecord {
    pub pool: String,
    pub name: String,
    pub key: String,
    pub path: PathBuf,
    pub capacity: u64,
    pub allocation: u64,
}

/// Which domain configuration a metadata write affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetadataFlags {
    pub live: bool,
    pub config: bool,
}

impl MetadataFlags {
    const AFFECT_LIVE: u32 = 1;
    const AFFECT_CONFIG: u32 = 2;

    /// Persisted config always; live config too when the domain is running.
    pub fn for_state(state: DomainStateCode) -> Self {
        Self {
            live: state.is_active(),
            config: true,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.live {
            bits |= Self::AFFECT_LIVE;
        }
        if self.config {
            bits |= Self::AFFECT_CONFIG;
        }
        bits
    }
}

#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Every defined domain, active or not, with its runtime info.
    async fn list_domains(&self) -> Result<Vec<DomainRecord>>;

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainRecord>>;

    /// The metadata element stored under `uri`, or `None` when absent.
    async fn domain_metadata(&self, domain: &DomainRef, uri: &str) -> Result<Option<String>>;

    /// Replaces (or with `None`, removes) the metadata element under `uri`.
    async fn set_domain_metadata(
        &self,
        domain: &DomainRef,
        metadata: Option<&str>,
        key: &str,
        uri: &str,
        flags: MetadataFlags,
    ) -> Result<()>;

    async fn list_storage_volumes(&self) -> Result<Vec<StorageVolumeRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_flags_follow_state() {
        assert_eq!(MetadataFlags::for_state(DomainStateCode::RUNNING).bits(), 3);
        assert_eq!(MetadataFlags::for_state(DomainStateCode::SHUTOFF).bits(), 2);
        assert_eq!(MetadataFlags::for_state(DomainStateCode::CRASHED).bits(), 2);
    }
}
