use super::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

lazy_static! {
    static ref RESOURCE_ID: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{0,127}$").unwrap();
}

/// Rejects identifiers that could escape their directory once joined into a path.
pub fn validate_resource_id(id: &str) -> Result<()> {
    if !RESOURCE_ID.is_match(id) || id.contains("..") {
        return Err(StoreError::InvalidArgument(format!(
            "invalid resource id '{}'",
            id
        )));
    }
    Ok(())
}

pub type Tags = BTreeMap<String, String>;

/// Index key form of a tag: `key=value`.
pub fn tag_term(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}

// ============================================================================
// Resource classes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Instance,
    Volume,
    Image,
    Snapshot,
    KeyPair,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 5] = [
        ResourceClass::Instance,
        ResourceClass::Volume,
        ResourceClass::Image,
        ResourceClass::Snapshot,
        ResourceClass::KeyPair,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Volume => "volume",
            Self::Image => "image",
            Self::Snapshot => "snapshot",
            Self::KeyPair => "keypair",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "instance" | "instances" => Ok(Self::Instance),
            "volume" | "volumes" => Ok(Self::Volume),
            "image" | "images" => Ok(Self::Image),
            "snapshot" | "snapshots" => Ok(Self::Snapshot),
            "keypair" | "keypairs" | "key-pair" | "key-pairs" => Ok(Self::KeyPair),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown resource class '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Qcow2,
    Raw,
}

impl DiskFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Qcow2 => "qcow2",
            Self::Raw => "raw",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "qcow2" => Some(Self::Qcow2),
            "raw" | "img" => Some(Self::Raw),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.extension()
    }
}

// ============================================================================
// Instances
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminated,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A virtual machine as exposed to callers.
///
/// Identity and linkage come from the domain-metadata fragment; `state`,
/// `memory_mib` and `vcpus` always reflect the live domain record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    /// Native name of the backing domain.
    pub domain_name: String,
    pub image_id: Option<String>,
    pub volume_id: Option<String>,
    pub state: InstanceState,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(id: impl Into<String>, domain_name: impl Into<String>) -> Self {
        let now = Utc::now();
        let domain_name = domain_name.into();
        Self {
            id: id.into(),
            name: domain_name.clone(),
            domain_name,
            image_id: None,
            volume_id: None,
            state: InstanceState::Pending,
            memory_mib: 0,
            vcpus: 0,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    /// Adopted instances have no metadata fragment on their domain.
    pub fn is_adopted(&self) -> bool {
        self.created_at.is_none() && self.id == self.domain_name
    }
}

// ============================================================================
// Volumes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeStatus {
    Creating,
    Available,
    InUse,
    Deleting,
    Error,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::InUse => "in-use",
            Self::Deleting => "deleting",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub instance_id: String,
    pub device: String,
    pub attached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: VolumeStatus,
    #[serde(default = "default_volume_type")]
    pub volume_type: String,
    #[serde(default)]
    pub format: DiskFormat,
    #[serde(default)]
    pub source_image_id: Option<String>,
    #[serde(default)]
    pub source_snapshot_id: Option<String>,
    #[serde(default)]
    pub attachment: Option<VolumeAttachment>,
    #[serde(default)]
    pub tags: Tags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Virtual size of the artifact; probed on load, never persisted.
    #[serde(skip)]
    pub size_bytes: u64,
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_volume_type() -> String {
    "standard".to_string()
}

impl Volume {
    pub fn new(id: impl Into<String>, format: DiskFormat) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: String::new(),
            status: VolumeStatus::Available,
            volume_type: default_volume_type(),
            format,
            source_image_id: None,
            source_snapshot_id: None,
            attachment: None,
            tags: Tags::new(),
            created_at: now,
            updated_at: now,
            size_bytes: 0,
            path: PathBuf::new(),
        }
    }
}

// ============================================================================
// Images
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Pending,
    Available,
    Failed,
    Deregistered,
}

impl ImageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Available => "available",
            Self::Failed => "failed",
            Self::Deregistered => "deregistered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub state: ImageState,
    #[serde(default)]
    pub format: DiskFormat,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default)]
    pub tags: Tags,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub size_bytes: u64,
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_architecture() -> String {
    "x86_64".to_string()
}

impl Image {
    pub fn new(id: impl Into<String>, name: impl Into<String>, format: DiskFormat) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            state: ImageState::Available,
            format,
            architecture: default_architecture(),
            tags: Tags::new(),
            created_at: Utc::now(),
            size_bytes: 0,
            path: PathBuf::new(),
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Pending,
    Completed,
    Error,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// One record inside a volume's snapshot index file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    #[serde(default)]
    pub description: String,
    pub status: SnapshotStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub volume_size_bytes: u64,
    #[serde(default)]
    pub tags: Tags,
    pub started_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, volume_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            volume_id: volume_id.into(),
            description: String::new(),
            status: SnapshotStatus::Pending,
            progress: 0,
            volume_size_bytes: 0,
            tags: Tags::new(),
            started_at: Utc::now(),
        }
    }
}

// ============================================================================
// Key pairs
// ============================================================================

/// Key pair metadata. The public key lives in its own `.pub` file and the
/// private key is never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPair {
    pub id: String,
    pub name: String,
    #[serde(default = "default_key_type")]
    pub key_type: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub tags: Tags,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub public_key: String,
}

fn default_key_type() -> String {
    "ed25519".to_string()
}

impl KeyPair {
    pub fn new(id: impl Into<String>, name: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            key_type: default_key_type(),
            fingerprint: String::new(),
            tags: Tags::new(),
            created_at: Utc::now(),
            public_key: public_key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_validation() {
        assert!(validate_resource_id("vol-1").is_ok());
        assert!(validate_resource_id("i-0a1b.c_d:e").is_ok());
        assert!(validate_resource_id("").is_err());
        assert!(validate_resource_id("../etc").is_err());
        assert!(validate_resource_id("a/b").is_err());
        assert!(validate_resource_id("a..b").is_err());
        assert!(validate_resource_id(".hidden").is_err());
    }

    #[test]
    fn test_volume_sidecar_skips_derived_fields() {
        let mut volume = Volume::new("vol-1", DiskFormat::Qcow2);
        volume.size_bytes = 42;
        volume.path = PathBuf::from("/tmp/vol-1.qcow2");
        let json = serde_json::to_value(&volume).unwrap();
        assert!(json.get("size_bytes").is_none());
        assert!(json.get("path").is_none());
        assert_eq!(json["status"], "available");
    }

    #[test]
    fn test_volume_status_wire_names() {
        let json = serde_json::to_string(&VolumeStatus::InUse).unwrap();
        assert_eq!(json, "\"in-use\"");
        assert_eq!(VolumeStatus::InUse.as_str(), "in-use");
    }

    #[test]
    fn test_resource_class_parse() {
        assert_eq!(ResourceClass::parse("Volumes").unwrap(), ResourceClass::Volume);
        assert_eq!(ResourceClass::parse("key-pair").unwrap(), ResourceClass::KeyPair);
        assert!(ResourceClass::parse("network").is_err());
    }
}
