use crate::core::{Filter, Image, Instance, KeyPair, Snapshot, Tags, Volume};

/// Evaluates one filter against a hydrated object. Names the class does not
/// know never match; plans reject them before evaluation.
pub trait Filterable {
    fn id(&self) -> &str;
    fn matches(&self, filter: &Filter) -> bool;
}

fn tag_matches(tags: &Tags, filter: &Filter) -> Option<bool> {
    if filter.name == "tag-key" {
        return Some(tags.keys().any(|k| filter.accepts(k)));
    }
    let key = filter.tag_key()?;
    Some(tags.get(key).is_some_and(|v| filter.accepts(v)))
}

impl Filterable for Instance {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, f: &Filter) -> bool {
        match f.name.as_str() {
            "instance-id" => f.accepts(&self.id),
            "name" => f.accepts(&self.name),
            "domain-name" => f.accepts(&self.domain_name),
            "instance-state-name" => f.accepts(self.state.as_str()),
            "image-id" => f.accepts_opt(self.image_id.as_deref()),
            "volume-id" => f.accepts_opt(self.volume_id.as_deref()),
            _ => false,
        }
    }
}

impl Filterable for Volume {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, f: &Filter) -> bool {
        if let Some(found) = tag_matches(&self.tags, f) {
            return found;
        }
        match f.name.as_str() {
            "volume-id" => f.accepts(&self.id),
            "name" => f.accepts(&self.name),
            "status" => f.accepts(self.status.as_str()),
            "volume-type" => f.accepts(&self.volume_type),
            "source-image-id" => f.accepts_opt(self.source_image_id.as_deref()),
            "snapshot-id" => f.accepts_opt(self.source_snapshot_id.as_deref()),
            "attachment.instance-id" => {
                f.accepts_opt(self.attachment.as_ref().map(|a| a.instance_id.as_str()))
            }
            _ => false,
        }
    }
}

impl Filterable for Image {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, f: &Filter) -> bool {
        if let Some(found) = tag_matches(&self.tags, f) {
            return found;
        }
        match f.name.as_str() {
            "image-id" => f.accepts(&self.id),
            "name" => f.accepts(&self.name),
            "state" => f.accepts(self.state.as_str()),
            "format" => f.accepts(self.format.as_str()),
            "architecture" => f.accepts(&self.architecture),
            "description" => f.accepts(&self.description),
            _ => false,
        }
    }
}

impl Filterable for Snapshot {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, f: &Filter) -> bool {
        if let Some(found) = tag_matches(&self.tags, f) {
            return found;
        }
        match f.name.as_str() {
            "snapshot-id" => f.accepts(&self.id),
            "volume-id" => f.accepts(&self.volume_id),
            "status" => f.accepts(self.status.as_str()),
            "description" => f.accepts(&self.description),
            _ => false,
        }
    }
}

impl Filterable for KeyPair {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, f: &Filter) -> bool {
        if let Some(found) = tag_matches(&self.tags, f) {
            return found;
        }
        match f.name.as_str() {
            "key-pair-id" => f.accepts(&self.id),
            "key-name" => f.accepts(&self.name),
            "key-type" => f.accepts(&self.key_type),
            "fingerprint" => f.accepts(&self.fingerprint),
            _ => false,
        }
    }
}
