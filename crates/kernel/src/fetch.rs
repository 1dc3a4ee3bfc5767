//! Fetch configuration
//!
//! Decides which fields a load or a fetch-groups detach must bring in.

use crate::config::DEFAULT_FETCH_GROUP;
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;
use stead_core::{ClassMetaData, FieldMetaData, FieldSet};

/// Group name that selects every field
pub const ALL_FETCH_GROUP: &str = "all";

/// Active fetch groups plus explicitly requested fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfiguration {
    groups: BTreeSet<String>,
    fields: FxHashSet<(String, String)>,
}

impl Default for FetchConfiguration {
    fn default() -> Self {
        FetchConfiguration::with_groups([DEFAULT_FETCH_GROUP])
    }
}

impl FetchConfiguration {
    /// Configuration with exactly the given groups active
    pub fn with_groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FetchConfiguration {
            groups: groups.into_iter().map(Into::into).collect(),
            fields: FxHashSet::default(),
        }
    }

    /// Activate `group`
    pub fn add_group(&mut self, group: impl Into<String>) -> &mut Self {
        self.groups.insert(group.into());
        self
    }

    /// Deactivate `group`
    pub fn remove_group(&mut self, group: &str) -> &mut Self {
        self.groups.remove(group);
        self
    }

    /// Deactivate every group
    pub fn clear_groups(&mut self) -> &mut Self {
        self.groups.clear();
        self
    }

    /// Request `class.field` explicitly
    pub fn add_field(&mut self, class: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.fields.insert((class.into(), field.into()));
        self
    }

    /// Active groups in name order
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }

    /// Whether `group` is active
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Whether field `fmd` of `class` must be fetched. Primary keys always
    /// are; LRS fields only when requested explicitly.
    pub fn requires_fetch(&self, class: &str, fmd: &FieldMetaData) -> bool {
        if fmd.primary_key {
            return true;
        }
        if self.fields.contains(&(class.to_string(), fmd.name.clone())) {
            return true;
        }
        if fmd.lrs {
            return false;
        }
        if self.has_group(ALL_FETCH_GROUP) {
            return true;
        }
        if fmd.default_fetch_group && self.has_group(DEFAULT_FETCH_GROUP) {
            return true;
        }
        fmd.fetch_groups.iter().any(|g| self.groups.contains(g))
    }

    /// Fields of `meta` this configuration fetches
    pub fn fields_for(&self, meta: &ClassMetaData) -> FieldSet {
        FieldSet::from_indices(
            meta.field_count(),
            meta.fields()
                .iter()
                .filter(|f| self.requires_fetch(meta.name(), f))
                .map(|f| f.index),
        )
    }
}
