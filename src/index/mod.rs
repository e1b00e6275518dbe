//! In-memory multi-index over every resource class.
//!
//! The index is a cache: mutating paths update it only after their durable
//! write, and a rebuild can always reconstruct it from the backing stores.
//! A rebuild builds fresh [`ClassIndex`]es off-lock and swaps them in under
//! one write lock; incremental changes made meanwhile are journaled and
//! replayed onto the new maps before the swap.

pub mod entry;

pub use entry::{ClassIndex, IndexEntry, IndexField};

use crate::core::{ResourceClass, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

#[derive(Debug, Clone)]
enum JournalOp {
    Insert(IndexEntry),
    Remove(ResourceClass, String),
}

#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub generation: u64,
    pub built_at: Option<DateTime<Utc>>,
    pub classes: HashMap<ResourceClass, ClassIndex>,
}

impl IndexSnapshot {
    fn empty() -> Self {
        Self {
            generation: 0,
            built_at: None,
            classes: ResourceClass::ALL
                .iter()
                .map(|c| (*c, ClassIndex::new()))
                .collect(),
        }
    }

    /// Equal key and set membership in every class, ignoring generation.
    pub fn same_contents(&self, other: &IndexSnapshot) -> bool {
        self.classes == other.classes
    }

    fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::Insert(entry) => {
                self.classes.entry(entry.class).or_default().insert(entry);
            }
            JournalOp::Remove(class, id) => {
                if let Some(index) = self.classes.get_mut(&class) {
                    index.remove(&id);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub generation: u64,
    pub built_at: Option<DateTime<Utc>>,
    pub counts: BTreeMap<ResourceClass, usize>,
}

struct IndexState {
    snapshot: IndexSnapshot,
    journal: Option<Vec<JournalOp>>,
}

pub struct ResourceIndex {
    state: RwLock<IndexState>,
}

impl Default for ResourceIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState {
                snapshot: IndexSnapshot::empty(),
                journal: None,
            }),
        }
    }

    pub fn insert(&self, entry: IndexEntry) -> Result<()> {
        let mut state = self.state.write()?;
        if let Some(journal) = state.journal.as_mut() {
            journal.push(JournalOp::Insert(entry.clone()));
        }
        state.snapshot.apply(JournalOp::Insert(entry));
        Ok(())
    }

    pub fn remove(&self, class: ResourceClass, id: &str) -> Result<()> {
        let mut state = self.state.write()?;
        if let Some(journal) = state.journal.as_mut() {
            journal.push(JournalOp::Remove(class, id.to_string()));
        }
        state.snapshot.apply(JournalOp::Remove(class, id.to_string()));
        Ok(())
    }

    pub fn get(&self, class: ResourceClass, id: &str) -> Result<Option<IndexEntry>> {
        let state = self.state.read()?;
        Ok(state
            .snapshot
            .classes
            .get(&class)
            .and_then(|index| index.get(id))
            .cloned())
    }

    /// Entries of `class`, sorted by id.
    pub fn entries(&self, class: ResourceClass) -> Result<Vec<IndexEntry>> {
        let state = self.state.read()?;
        let mut entries: Vec<IndexEntry> = state
            .snapshot
            .classes
            .get(&class)
            .map(|index| index.entries().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    /// Candidate entries for indexed filters: union within one filter's
    /// keys, intersection across filters in order. No filters selects every
    /// entry of the class.
    pub fn candidates(
        &self,
        class: ResourceClass,
        filters: &[(IndexField, Vec<String>)],
    ) -> Result<Vec<IndexEntry>> {
        let state = self.state.read()?;
        let Some(index) = state.snapshot.classes.get(&class) else {
            return Ok(Vec::new());
        };

        let mut selected: Option<HashSet<String>> = None;
        for (field, keys) in filters {
            let found = index.lookup(*field, keys);
            selected = Some(match selected {
                None => found,
                Some(current) => current.intersection(&found).cloned().collect(),
            });
            if selected.as_ref().is_some_and(HashSet::is_empty) {
                break;
            }
        }
        let ids = selected.unwrap_or_else(|| index.ids());

        let mut entries: Vec<IndexEntry> = ids
            .iter()
            .filter_map(|id| index.get(id).cloned())
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    /// Starts journaling incremental changes for the rebuild about to run.
    pub fn begin_rebuild(&self) -> Result<()> {
        self.state.write()?.journal = Some(Vec::new());
        Ok(())
    }

    pub fn abort_rebuild(&self) -> Result<()> {
        self.state.write()?.journal = None;
        Ok(())
    }

    /// Swaps in freshly built classes. Classes missing from `built` keep
    /// their live maps. Journaled changes are replayed on top before the
    /// swap. Returns the new generation.
    pub fn commit_rebuild(&self, mut built: HashMap<ResourceClass, ClassIndex>) -> Result<u64> {
        let mut state = self.state.write()?;
        let journal = state.journal.take().unwrap_or_default();

        for class in ResourceClass::ALL {
            if !built.contains_key(&class) {
                let live = state.snapshot.classes.remove(&class).unwrap_or_default();
                built.insert(class, live);
            }
        }
        let mut next = IndexSnapshot {
            generation: state.snapshot.generation + 1,
            built_at: Some(Utc::now()),
            classes: built,
        };
        for op in journal {
            next.apply(op);
        }
        let generation = next.generation;
        state.snapshot = next;
        Ok(generation)
    }

    pub fn snapshot(&self) -> Result<IndexSnapshot> {
        Ok(self.state.read()?.snapshot.clone())
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let state = self.state.read()?;
        Ok(IndexStats {
            generation: state.snapshot.generation,
            built_at: state.snapshot.built_at,
            counts: state
                .snapshot
                .classes
                .iter()
                .map(|(class, index)| (*class, index.len()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(id: &str, status: &str, kind: &str) -> IndexEntry {
        IndexEntry::new(ResourceClass::Volume, id, id, status).kind(kind)
    }

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn ids(entries: Vec<IndexEntry>) -> Vec<String> {
        entries.into_iter().map(|e| e.id).collect()
    }

    #[test]
    fn test_candidates_intersect_across_filters() {
        let index = ResourceIndex::new();
        index.insert(volume("vol-1", "available", "standard")).unwrap();
        index.insert(volume("vol-2", "in-use", "standard")).unwrap();
        index.insert(volume("vol-3", "available", "ssd")).unwrap();
        index.insert(volume("vol-4", "error", "ssd")).unwrap();

        let status = (IndexField::State, keys(&["available", "in-use"]));
        let all = index.candidates(ResourceClass::Volume, &[status.clone()]).unwrap();
        assert_eq!(ids(all), vec!["vol-1", "vol-2", "vol-3"]);

        let both = index
            .candidates(
                ResourceClass::Volume,
                &[status, (IndexField::Type, keys(&["ssd"]))],
            )
            .unwrap();
        assert_eq!(ids(both), vec!["vol-3"]);

        let none = index.candidates(ResourceClass::Volume, &[]).unwrap();
        assert_eq!(none.len(), 4);
        assert!(index.candidates(ResourceClass::Image, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_commit_replays_journal() {
        let index = ResourceIndex::new();
        index.insert(volume("vol-old", "available", "standard")).unwrap();

        index.begin_rebuild().unwrap();
        // Built from a scan that started before these two mutations.
        let mut built = ClassIndex::new();
        built.insert(volume("vol-old", "available", "standard"));
        index.insert(volume("vol-new", "creating", "standard")).unwrap();
        index.remove(ResourceClass::Volume, "vol-old").unwrap();

        let generation = index
            .commit_rebuild(HashMap::from([(ResourceClass::Volume, built)]))
            .unwrap();
        assert_eq!(generation, 1);
        assert!(index.get(ResourceClass::Volume, "vol-old").unwrap().is_none());
        assert!(index.get(ResourceClass::Volume, "vol-new").unwrap().is_some());
    }

    #[test]
    fn test_commit_keeps_classes_not_rebuilt() {
        let index = ResourceIndex::new();
        index
            .insert(IndexEntry::new(ResourceClass::Instance, "i-1", "dom", "running"))
            .unwrap();
        index.begin_rebuild().unwrap();
        index.commit_rebuild(HashMap::new()).unwrap();
        assert!(index.get(ResourceClass::Instance, "i-1").unwrap().is_some());

        let stats = index.stats().unwrap();
        assert_eq!(stats.generation, 1);
        assert_eq!(stats.counts[&ResourceClass::Instance], 1);
        assert!(stats.built_at.is_some());
    }
}
