//! Two-tier filter evaluation.
//!
//! Filters on indexed discriminators narrow the candidate set through the
//! secondary maps; everything else is a predicate over hydrated objects.

pub mod predicates;

pub use predicates::Filterable;

use crate::core::{Filter, ResourceClass, Result, StoreError, tag_term};
use crate::index::IndexField;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTarget {
    Indexed(IndexField),
    Residual,
}

/// Where a filter name is evaluated for `class`, or `None` if the class has
/// no such filter.
pub fn target_for(class: ResourceClass, name: &str) -> Option<FilterTarget> {
    use FilterTarget::{Indexed, Residual};
    use IndexField::*;

    if name.starts_with("tag:") && name.len() > 4 && class != ResourceClass::Instance {
        return Some(Indexed(Tag));
    }
    let target = match (class, name) {
        (ResourceClass::Instance, "instance-state-name") => Indexed(State),
        (ResourceClass::Instance, "image-id") => Indexed(Image),
        (ResourceClass::Instance, "volume-id") => Indexed(Volume),
        (ResourceClass::Instance, "instance-id" | "name" | "domain-name") => Residual,

        (ResourceClass::Volume, "status") => Indexed(State),
        (ResourceClass::Volume, "volume-type") => Indexed(Type),
        (ResourceClass::Volume, "attachment.instance-id") => Indexed(Instance),
        (ResourceClass::Volume, "source-image-id") => Indexed(Image),
        (ResourceClass::Volume, "volume-id" | "name" | "snapshot-id" | "tag-key") => Residual,

        (ResourceClass::Image, "state") => Indexed(State),
        (ResourceClass::Image, "format") => Indexed(Type),
        (
            ResourceClass::Image,
            "image-id" | "name" | "architecture" | "description" | "tag-key",
        ) => Residual,

        (ResourceClass::Snapshot, "status") => Indexed(State),
        (ResourceClass::Snapshot, "volume-id") => Indexed(Volume),
        (ResourceClass::Snapshot, "snapshot-id" | "description" | "tag-key") => Residual,

        (ResourceClass::KeyPair, "key-type") => Indexed(Type),
        (
            ResourceClass::KeyPair,
            "key-pair-id" | "key-name" | "fingerprint" | "tag-key",
        ) => Residual,

        _ => return None,
    };
    Some(target)
}

/// Index lookups for a request. Residual filters need no plan: every filter,
/// indexed or not, is checked again on the hydrated objects.
#[derive(Debug, Clone, Default)]
pub struct FilterPlan {
    /// Secondary-map lookups, in request order.
    pub indexed: Vec<(IndexField, Vec<String>)>,
}

impl FilterPlan {
    /// Collects the index lookups in `filters` and rejects unknown names.
    pub fn build(class: ResourceClass, filters: &[Filter]) -> Result<Self> {
        let mut plan = Self::default();
        for filter in filters {
            match target_for(class, &filter.name) {
                Some(FilterTarget::Indexed(IndexField::Tag)) => {
                    let key = filter.tag_key().unwrap_or_default();
                    let terms = filter.values.iter().map(|v| tag_term(key, v)).collect();
                    plan.indexed.push((IndexField::Tag, terms));
                }
                Some(FilterTarget::Indexed(field)) => {
                    plan.indexed.push((field, filter.values.clone()));
                }
                Some(FilterTarget::Residual) => {}
                None => {
                    return Err(StoreError::InvalidFilter(format!(
                        "'{}' is not a {} filter",
                        filter.name, class
                    )));
                }
            }
        }
        Ok(plan)
    }
}

/// True when `item` satisfies every filter.
pub fn matches_all<T: Filterable>(item: &T, filters: &[Filter]) -> bool {
    filters.iter().all(|f| item.matches(f))
}
