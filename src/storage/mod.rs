pub mod disk_image;
pub mod layout;
pub mod sidecar;

pub use layout::{StoreLayout, artifact_for_sidecar, backup_path, sidecar_path};
pub use sidecar::{SIDECAR_FORMAT_VERSION, SidecarEnvelope, Validation};
