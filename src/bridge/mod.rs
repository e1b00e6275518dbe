//! Instance persistence through the hypervisor's own domain records.
//!
//! The daemon has no notion of instance ids or image/volume linkage, so those
//! travel in a small XML element stored under a private namespace on the
//! domain. Runtime fields always come from the live record.

use crate::core::{Instance, InstanceState, Result, StoreError};
use crate::hypervisor::{DomainRecord, DomainRef, DomainStateCode, HypervisorClient, MetadataFlags};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

const ROOT: &str = "instance";

/// Fixed mapping from daemon runtime codes to exposed instance states.
pub fn map_state(code: DomainStateCode) -> InstanceState {
    match code {
        DomainStateCode::NO_STATE => InstanceState::Pending,
        DomainStateCode::RUNNING | DomainStateCode::BLOCKED => InstanceState::Running,
        DomainStateCode::PAUSED => InstanceState::Stopped,
        DomainStateCode::SHUTDOWN => InstanceState::Stopping,
        DomainStateCode::SHUTOFF => InstanceState::Stopped,
        DomainStateCode::CRASHED => InstanceState::Terminated,
        DomainStateCode::PM_SUSPENDED => InstanceState::Stopped,
        _ => InstanceState::Pending,
    }
}

// ============================================================================
// Fragment
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceFragment {
    pub id: String,
    pub name: String,
    pub image_id: Option<String>,
    pub volume_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl InstanceFragment {
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            id: instance.id.clone(),
            name: instance.name.clone(),
            image_id: instance.image_id.clone(),
            volume_id: instance.volume_id.clone(),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::with_capacity(256);
        xml.push('<');
        xml.push_str(ROOT);
        xml.push('>');
        push_element(&mut xml, "id", Some(&self.id));
        push_element(&mut xml, "name", Some(&self.name));
        push_element(&mut xml, "image-id", self.image_id.as_deref());
        push_element(&mut xml, "volume-id", self.volume_id.as_deref());
        let created = self.created_at.map(|t| t.to_rfc3339());
        let updated = self.updated_at.map(|t| t.to_rfc3339());
        push_element(&mut xml, "created-at", created.as_deref());
        push_element(&mut xml, "updated-at", updated.as_deref());
        xml.push_str("</");
        xml.push_str(ROOT);
        xml.push('>');
        xml
    }

    /// Parses a fragment, matching elements by local name so the namespace
    /// prefix the daemon adds on read-back does not matter.
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| StoreError::Protocol(format!("instance fragment: {}", e)))?;
        let root = doc.root_element();
        if root.tag_name().name() != ROOT {
            return Err(StoreError::Protocol(format!(
                "instance fragment has root <{}>",
                root.tag_name().name()
            )));
        }

        let id = child_text(&root, "id")
            .ok_or_else(|| StoreError::Protocol("instance fragment without <id>".to_string()))?;
        Ok(Self {
            name: child_text(&root, "name").unwrap_or_else(|| id.clone()),
            id,
            image_id: child_text(&root, "image-id"),
            volume_id: child_text(&root, "volume-id"),
            created_at: child_time(&root, "created-at")?,
            updated_at: child_time(&root, "updated-at")?,
        })
    }
}

fn push_element(xml: &mut String, name: &str, value: Option<&str>) {
    let Some(value) = value else { return };
    xml.push('<');
    xml.push_str(name);
    xml.push('>');
    for ch in value.chars() {
        match ch {
            '&' => xml.push_str("&amp;"),
            '<' => xml.push_str("&lt;"),
            '>' => xml.push_str("&gt;"),
            '"' => xml.push_str("&quot;"),
            '\'' => xml.push_str("&apos;"),
            c => xml.push(c),
        }
    }
    xml.push_str("</");
    xml.push_str(name);
    xml.push('>');
}

fn child_text(node: &roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn child_time(node: &roxmltree::Node<'_, '_>, name: &str) -> Result<Option<DateTime<Utc>>> {
    child_text(node, name)
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| StoreError::Protocol(format!("<{}> is not a timestamp: {}", name, e)))
        })
        .transpose()
}

// ============================================================================
// Bridge
// ============================================================================

#[derive(Clone)]
pub struct DomainMetadataBridge {
    client: Arc<dyn HypervisorClient>,
    uri: String,
    key: String,
}

impl DomainMetadataBridge {
    pub fn new(client: Arc<dyn HypervisorClient>, uri: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            client,
            uri: uri.into(),
            key: key.into(),
        }
    }

    /// The fragment on `domain`, or `None` when absent or unparsable.
    pub async fn read_fragment(&self, domain: &DomainRef) -> Result<Option<InstanceFragment>> {
        let Some(xml) = self.client.domain_metadata(domain, &self.uri).await? else {
            return Ok(None);
        };
        match InstanceFragment::parse(&xml) {
            Ok(fragment) => Ok(Some(fragment)),
            Err(err) => {
                warn!(domain = %domain.name, error = %err, "ignoring corrupt instance fragment");
                Ok(None)
            }
        }
    }

    pub async fn hydrate(&self, record: &DomainRecord) -> Result<Instance> {
        let fragment = self.read_fragment(&record.domain).await?;
        if fragment.is_none() {
            debug!(domain = %record.domain.name, "adopting domain without instance fragment");
        }
        Ok(instance_from(record, fragment))
    }

    /// Every domain as an instance. Domains whose metadata cannot be read
    /// are skipped.
    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        let records = self.client.list_domains().await?;
        let mut instances = Vec::with_capacity(records.len());
        for record in &records {
            match self.hydrate(record).await {
                Ok(instance) => instances.push(instance),
                Err(err) => {
                    warn!(domain = %record.domain.name, error = %err, "skipping domain");
                }
            }
        }
        Ok(instances)
    }

    pub async fn load(&self, domain_name: &str) -> Result<Option<Instance>> {
        match self.client.lookup_domain(domain_name).await? {
            Some(record) => self.hydrate(&record).await.map(Some),
            None => Ok(None),
        }
    }

    /// Attaches the instance's fragment to its domain.
    pub async fn write_fragment(&self, domain_name: &str, instance: &Instance) -> Result<DomainRecord> {
        let record = self.require(domain_name, &instance.id).await?;
        let xml = InstanceFragment::from_instance(instance).to_xml();
        self.client
            .set_domain_metadata(
                &record.domain,
                Some(&xml),
                &self.key,
                &self.uri,
                MetadataFlags::for_state(record.info.state),
            )
            .await?;
        debug!(id = %instance.id, domain = %domain_name, "instance fragment written");
        Ok(record)
    }

    /// Removes the fragment without touching the domain itself.
    pub async fn clear_fragment(&self, domain_name: &str, id: &str) -> Result<DomainRecord> {
        let record = self.require(domain_name, id).await?;
        self.client
            .set_domain_metadata(
                &record.domain,
                None,
                &self.key,
                &self.uri,
                MetadataFlags::for_state(record.info.state),
            )
            .await?;
        Ok(record)
    }

    async fn require(&self, domain_name: &str, id: &str) -> Result<DomainRecord> {
        self.client
            .lookup_domain(domain_name)
            .await?
            .ok_or_else(|| StoreError::not_found("instance", id))
    }
}

/// Merges a live record with its fragment. Without a fragment the domain is
/// adopted: its native name becomes the id and linkage is unknown.
pub fn instance_from(record: &DomainRecord, fragment: Option<InstanceFragment>) -> Instance {
    let domain_name = record.domain.name.clone();
    let (id, name, image_id, volume_id, created_at, updated_at) = match fragment {
        Some(f) => (f.id, f.name, f.image_id, f.volume_id, f.created_at, f.updated_at),
        None => (domain_name.clone(), domain_name.clone(), None, None, None, None),
    };
    Instance {
        id,
        name,
        domain_name,
        image_id,
        volume_id,
        state: map_state(record.info.state),
        memory_mib: record.info.memory_kib / 1024,
        vcpus: u32::from(record.info.vcpus),
        created_at,
        updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::InMemoryHypervisor;

    const URI: &str = "http://jvp.local/xmlns/instance/1.0";

    fn bridge(hv: &InMemoryHypervisor) -> DomainMetadataBridge {
        DomainMetadataBridge::new(Arc::new(hv.clone()), URI, "jvp")
    }

    #[test]
    fn test_state_table() {
        let expected = [
            (0, InstanceState::Pending),
            (1, InstanceState::Running),
            (2, InstanceState::Running),
            (3, InstanceState::Stopped),
            (4, InstanceState::Stopping),
            (5, InstanceState::Stopped),
            (6, InstanceState::Terminated),
            (7, InstanceState::Stopped),
            (42, InstanceState::Pending),
        ];
        for (code, state) in expected {
            assert_eq!(map_state(DomainStateCode(code)), state, "code {code}");
        }
    }

    #[test]
    fn test_fragment_escapes_and_parses_with_prefix() {
        let fragment = InstanceFragment {
            id: "i-1".to_string(),
            name: "web <prod> & co".to_string(),
            image_id: Some("img-1".to_string()),
            volume_id: None,
            created_at: Some(Utc::now()),
            updated_at: None,
        };
        let xml = fragment.to_xml();
        assert!(xml.contains("&lt;prod&gt; &amp; co"));
        assert_eq!(InstanceFragment::parse(&xml).unwrap(), fragment);

        // Read-back from the daemon carries the namespace prefix.
        let prefixed = format!(
            "<jvp:instance xmlns:jvp=\"{URI}\"><jvp:id>i-2</jvp:id><jvp:volume-id>vol-9</jvp:volume-id></jvp:instance>"
        );
        let parsed = InstanceFragment::parse(&prefixed).unwrap();
        assert_eq!(parsed.id, "i-2");
        assert_eq!(parsed.name, "i-2");
        assert_eq!(parsed.volume_id.as_deref(), Some("vol-9"));
    }

    #[test]
    fn test_fragment_rejects_garbage() {
        assert!(InstanceFragment::parse("<instance><id>").is_err());
        assert!(InstanceFragment::parse("<other><id>x</id></other>").is_err());
        assert!(InstanceFragment::parse("<instance><name>x</name></instance>").is_err());
    }

    #[tokio::test]
    async fn test_adoption_and_runtime_fields() {
        let hv = InMemoryHypervisor::new();
        hv.add_domain("legacy-vm", DomainStateCode::SHUTOFF, 4096 * 1024, 4).await;

        let instances = bridge(&hv).list_instances().await.unwrap();
        assert_eq!(instances.len(), 1);
        let vm = &instances[0];
        assert_eq!(vm.id, "legacy-vm");
        assert!(vm.is_adopted());
        assert_eq!(vm.image_id, None);
        assert_eq!(vm.state, InstanceState::Stopped);
        assert_eq!(vm.memory_mib, 4096);
        assert_eq!(vm.vcpus, 4);
    }

    #[tokio::test]
    async fn test_write_then_load_merges_live_state() {
        let hv = InMemoryHypervisor::new();
        hv.add_domain("dom-a", DomainStateCode::RUNNING, 1024 * 1024, 1).await;
        let b = bridge(&hv);

        let mut instance = Instance::new("i-abc", "dom-a");
        instance.image_id = Some("img-1".to_string());
        instance.state = InstanceState::Terminated;
        b.write_fragment("dom-a", &instance).await.unwrap();
        assert_eq!(hv.last_metadata_flags().await.map(|f| f.bits()), Some(3));

        hv.set_state("dom-a", DomainStateCode::PAUSED).await;
        let loaded = b.load("dom-a").await.unwrap().unwrap();
        assert_eq!(loaded.id, "i-abc");
        assert_eq!(loaded.image_id.as_deref(), Some("img-1"));
        assert_eq!(loaded.state, InstanceState::Stopped);

        b.clear_fragment("dom-a", "i-abc").await.unwrap();
        assert!(b.load("dom-a").await.unwrap().unwrap().is_adopted());
    }

    #[tokio::test]
    async fn test_corrupt_fragment_falls_back_to_adoption() {
        let hv = InMemoryHypervisor::new();
        hv.add_domain("dom-b", DomainStateCode::RUNNING, 1024, 1).await;
        hv.set_raw_metadata("dom-b", URI, "<instance><id>").await;

        let loaded = bridge(&hv).load("dom-b").await.unwrap().unwrap();
        assert_eq!(loaded.id, "dom-b");
        assert!(loaded.is_adopted());
    }

    #[tokio::test]
    async fn test_write_to_missing_domain_is_not_found() {
        let hv = InMemoryHypervisor::new();
        let err = bridge(&hv)
            .write_fragment("ghost", &Instance::new("i-1", "ghost"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
