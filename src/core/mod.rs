pub mod error;
pub mod filter;
pub mod types;

pub use error::{Result, StoreError};
pub use filter::{Filter, FilterRequest};
pub use types::{
    DiskFormat, Image, ImageState, Instance, InstanceState, KeyPair, ResourceClass, Snapshot,
    SnapshotStatus, Tags, Volume, VolumeAttachment, VolumeStatus, tag_term, validate_resource_id,
};
