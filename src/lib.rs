// ============================================================================
// JVP Metadata Store Library
// ============================================================================

//! Hybrid metadata store for an EC2-style virtualization control plane.
//!
//! Instance metadata lives inside each hypervisor domain as a namespaced XML
//! element. Volumes, images, snapshots and key pairs live in JSON sidecar
//! files next to their artifacts. [`MetadataStore`] fronts both behind one
//! in-memory index with EC2-style filtering, per-resource file locks and a
//! startup repair pass.
//!
//! ```no_run
//! use jvpstore::{FilterRequest, MetadataStore, StoreConfig};
//!
//! # async fn run() -> jvpstore::Result<()> {
//! let store = MetadataStore::connect(StoreConfig::new("/var/lib/jvp"))?;
//! store.initialize().await?;
//!
//! let available = store
//!     .describe_volumes(&FilterRequest::new().filter("status", ["available"]))
//!     .await?;
//! println!("{} volumes available", available.len());
//! store.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod core;
pub mod hypervisor;
pub mod index;
pub mod lock;
pub mod query;
pub mod refresh;
pub mod repair;
pub mod storage;
pub mod store;

// Re-export main types for convenience
pub use config::{HypervisorConfig, LockPolicy, RefreshPolicy, StoreConfig};
pub use core::{
    DiskFormat, Filter, FilterRequest, Image, ImageState, Instance, InstanceState, KeyPair,
    ResourceClass, Result, Snapshot, SnapshotStatus, StoreError, Tags, Volume, VolumeAttachment,
    VolumeStatus,
};
pub use hypervisor::{HypervisorClient, InMemoryHypervisor, RemoteHypervisor};
pub use index::{IndexSnapshot, IndexStats};
pub use repair::RepairReport;
pub use store::MetadataStore;
