use crate::core::{ResourceClass, Tags, tag_term};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Discriminators with a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexField {
    State,
    Type,
    Tag,
    Image,
    Volume,
    Instance,
}

/// Lightweight summary of one resource, enough to answer indexed filters
/// and to find the backing record again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub id: String,
    pub class: ResourceClass,
    /// Domain name for instances, artifact or index file path otherwise.
    pub locator: String,
    pub state: String,
    pub kind: Option<String>,
    /// Tags as `key=value` terms.
    pub tags: Vec<String>,
    pub image_id: Option<String>,
    pub volume_id: Option<String>,
    pub instance_id: Option<String>,
}

impl IndexEntry {
    pub fn new(
        class: ResourceClass,
        id: impl Into<String>,
        locator: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            class,
            locator: locator.into(),
            state: state.into(),
            kind: None,
            tags: Vec::new(),
            image_id: None,
            volume_id: None,
            instance_id: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn tags(mut self, tags: &Tags) -> Self {
        self.tags = tags.iter().map(|(k, v)| tag_term(k, v)).collect();
        self
    }

    pub fn image(mut self, image_id: Option<&str>) -> Self {
        self.image_id = image_id.map(str::to_string);
        self
    }

    pub fn volume(mut self, volume_id: Option<&str>) -> Self {
        self.volume_id = volume_id.map(str::to_string);
        self
    }

    pub fn instance(mut self, instance_id: Option<&str>) -> Self {
        self.instance_id = instance_id.map(str::to_string);
        self
    }

    /// Every `(field, key)` pair this entry appears under.
    pub fn terms(&self) -> Vec<(IndexField, &str)> {
        let mut terms = vec![(IndexField::State, self.state.as_str())];
        if let Some(kind) = &self.kind {
            terms.push((IndexField::Type, kind));
        }
        for tag in &self.tags {
            terms.push((IndexField::Tag, tag));
        }
        if let Some(image) = &self.image_id {
            terms.push((IndexField::Image, image));
        }
        if let Some(volume) = &self.volume_id {
            terms.push((IndexField::Volume, volume));
        }
        if let Some(instance) = &self.instance_id {
            terms.push((IndexField::Instance, instance));
        }
        terms
    }
}

/// Primary map plus secondary multimaps for one resource class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassIndex {
    primary: HashMap<String, IndexEntry>,
    secondary: HashMap<IndexField, HashMap<String, HashSet<String>>>,
}

impl ClassIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces; a replaced entry is first detached from every
    /// secondary map it was in.
    pub fn insert(&mut self, entry: IndexEntry) {
        self.remove(&entry.id);
        for (field, key) in entry.terms() {
            self.secondary
                .entry(field)
                .or_default()
                .entry(key.to_string())
                .or_default()
                .insert(entry.id.clone());
        }
        self.primary.insert(entry.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<IndexEntry> {
        let old = self.primary.remove(id)?;
        for (field, key) in old.terms() {
            let Some(keys) = self.secondary.get_mut(&field) else {
                continue;
            };
            if let Some(ids) = keys.get_mut(key) {
                ids.remove(id);
                if ids.is_empty() {
                    keys.remove(key);
                }
            }
            if keys.is_empty() {
                self.secondary.remove(&field);
            }
        }
        Some(old)
    }

    pub fn get(&self, id: &str) -> Option<&IndexEntry> {
        self.primary.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.primary.contains_key(id)
    }

    pub fn ids(&self) -> HashSet<String> {
        self.primary.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.primary.values()
    }

    /// Union of the id sets under each key.
    pub fn lookup(&self, field: IndexField, keys: &[String]) -> HashSet<String> {
        let Some(map) = self.secondary.get(&field) else {
            return HashSet::new();
        };
        keys.iter()
            .filter_map(|k| map.get(k))
            .flat_map(|ids| ids.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(id: &str, status: &str, tags: &[(&str, &str)]) -> IndexEntry {
        let tags: Tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IndexEntry::new(ResourceClass::Volume, id, format!("/v/{id}.qcow2"), status)
            .kind("standard")
            .tags(&tags)
    }

    #[test]
    fn test_replace_detaches_old_terms() {
        let mut index = ClassIndex::new();
        index.insert(volume("vol-1", "available", &[("env", "prod")]));
        index.insert(volume("vol-1", "in-use", &[]));

        assert!(index.lookup(IndexField::State, &["available".to_string()]).is_empty());
        assert!(index.lookup(IndexField::Tag, &["env=prod".to_string()]).is_empty());
        assert_eq!(
            index.lookup(IndexField::State, &["in-use".to_string()]),
            HashSet::from(["vol-1".to_string()])
        );
    }

    #[test]
    fn test_remove_leaves_no_empty_sets() {
        let mut index = ClassIndex::new();
        index.insert(volume("vol-1", "available", &[("env", "prod")]));
        assert!(index.remove("vol-1").is_some());
        assert!(index.remove("vol-1").is_none());
        assert_eq!(index, ClassIndex::new());
    }

    #[test]
    fn test_lookup_unions_values() {
        let mut index = ClassIndex::new();
        index.insert(volume("vol-1", "available", &[]));
        index.insert(volume("vol-2", "in-use", &[]));
        index.insert(volume("vol-3", "error", &[]));
        let found = index.lookup(
            IndexField::State,
            &["available".to_string(), "in-use".to_string()],
        );
        assert_eq!(found.len(), 2);
        assert!(!found.contains("vol-3"));
    }

    #[test]
    fn test_equality_ignores_insertion_order() {
        let mut a = ClassIndex::new();
        let mut b = ClassIndex::new();
        a.insert(volume("vol-1", "available", &[("a", "1")]));
        a.insert(volume("vol-2", "available", &[("a", "1")]));
        b.insert(volume("vol-2", "available", &[("a", "1")]));
        b.insert(volume("vol-1", "available", &[("a", "1")]));
        assert_eq!(a, b);
    }
}
