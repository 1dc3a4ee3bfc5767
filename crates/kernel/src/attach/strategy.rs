//! Attach strategies
//!
//! A strategy reads what a detached instance knows about itself (identity,
//! version, which fields it carries and which were changed) and turns it
//! into a copy plan for the attach manager. Two flavors exist:
//!
//! - [`DetachedStateAttachStrategy`] for copies that kept a detached state
//!   manager: changed fields are written through, loaded-but-unchanged fields
//!   only fill gaps in the managed instance.
//! - [`VersionAttachStrategy`] for everything else: copies carrying a token,
//!   and plain instances whose identity and version come from their own key
//!   and version fields.

use crate::broker::Broker;
use crate::heap::Instance;
use stead_core::{
    ClassMetaData, FieldSet, ObjectId, Oref, PersistenceCapable, SteadResult, Version,
};
use stead_lifecycle::OpenStateManager;

/// How one field of a detached instance is merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Write through the normal setter path, dirtying the managed field if
    /// the value differs
    Set,
    /// Store silently, and only when the managed instance has not loaded the
    /// field
    StoreIfUnloaded,
}

/// What the attach manager needs to know about a detached instance
pub trait AttachStrategy {
    /// Name for diagnostics
    fn name(&self) -> &'static str;

    /// Persistent identity recorded at detach time
    fn object_id(&self) -> Option<&ObjectId>;

    /// Version recorded at detach time; `None` when absent
    fn version(&self) -> Option<&Version>;

    /// Fields changed since detach
    fn dirty(&self) -> &FieldSet;

    /// Whether the identity was derived from the instance's key fields
    /// rather than recorded at detach; such instances are new unless the
    /// identity is already known
    fn identity_inferred(&self) -> bool {
        false
    }

    /// Fields to merge, in declaration order
    fn copy_plan(&self, meta: &ClassMetaData) -> Vec<(usize, CopyMode)>;
}

// =============================================================================
// DetachedStateAttachStrategy
// =============================================================================

/// Strategy for copies that carry a detached state manager
#[derive(Debug, Clone)]
pub struct DetachedStateAttachStrategy {
    oid: Option<ObjectId>,
    version: Option<Version>,
    loaded: FieldSet,
    dirty: FieldSet,
}

impl DetachedStateAttachStrategy {
    /// Capture the bookkeeping of a detached state manager
    pub fn new(sm: &dyn OpenStateManager) -> Self {
        DetachedStateAttachStrategy {
            oid: sm.object_id().cloned(),
            version: sm.version().cloned(),
            loaded: sm.loaded().clone(),
            dirty: sm.dirty().clone(),
        }
    }
}

impl AttachStrategy for DetachedStateAttachStrategy {
    fn name(&self) -> &'static str {
        "detached-state-manager"
    }

    fn object_id(&self) -> Option<&ObjectId> {
        self.oid.as_ref()
    }

    fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    fn dirty(&self) -> &FieldSet {
        &self.dirty
    }

    fn copy_plan(&self, meta: &ClassMetaData) -> Vec<(usize, CopyMode)> {
        (0..meta.field_count())
            .filter_map(|i| {
                if self.dirty.contains(i) {
                    Some((i, CopyMode::Set))
                } else if self.loaded.contains(i) {
                    Some((i, CopyMode::StoreIfUnloaded))
                } else {
                    None
                }
            })
            .collect()
    }
}

// =============================================================================
// VersionAttachStrategy
// =============================================================================

/// Strategy driven by identity and version alone.
///
/// Every carried field is written through the setter path, so unchanged
/// values leave the managed instance clean.
#[derive(Debug, Clone)]
pub struct VersionAttachStrategy {
    oid: Option<ObjectId>,
    version: Option<Version>,
    loaded: FieldSet,
    dirty: FieldSet,
    inferred: bool,
}

impl VersionAttachStrategy {
    /// Strategy for an unmanaged instance: its detached-state token when it
    /// carries one, otherwise its key and version fields
    pub fn for_instance(broker: &Broker, pc: &dyn PersistenceCapable) -> SteadResult<Self> {
        let meta = pc.meta();
        let n = meta.field_count();
        if let Some(token) = pc.detached_state() {
            return Ok(VersionAttachStrategy {
                oid: token.oid.clone(),
                version: token.version.clone(),
                loaded: token.loaded.clone(),
                dirty: token.dirty.clone(),
                inferred: false,
            });
        }
        let version = meta.version_field().and_then(|vf| {
            let value = pc.provide_field(vf.index);
            if value.is_null() || value == vf.default_value() {
                None
            } else {
                Version::from_field_value(&value)
            }
        });
        Ok(VersionAttachStrategy {
            oid: broker.oid_from_key(pc)?,
            version,
            loaded: meta.field_set(),
            dirty: FieldSet::new(n),
            inferred: true,
        })
    }
}

impl AttachStrategy for VersionAttachStrategy {
    fn name(&self) -> &'static str {
        "version"
    }

    fn object_id(&self) -> Option<&ObjectId> {
        self.oid.as_ref()
    }

    fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    fn dirty(&self) -> &FieldSet {
        &self.dirty
    }

    fn identity_inferred(&self) -> bool {
        self.inferred
    }

    fn copy_plan(&self, meta: &ClassMetaData) -> Vec<(usize, CopyMode)> {
        (0..meta.field_count())
            .filter(|&i| self.loaded.contains(i))
            .map(|i| (i, CopyMode::Set))
            .collect()
    }
}

/// Strategy matching how `oref` was detached
pub(crate) fn strategy_for(broker: &Broker, oref: Oref) -> SteadResult<Box<dyn AttachStrategy>> {
    Ok(match broker.heap.get(oref)? {
        Instance::Detached(dsm) => Box::new(DetachedStateAttachStrategy::new(dsm.as_ref())),
        Instance::Managed(sm) => Box::new(DetachedStateAttachStrategy::new(sm.as_ref())),
        Instance::Unmanaged(pc) => Box::new(VersionAttachStrategy::for_instance(broker, pc.as_ref())?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::{broker, committed_person, person};
    use stead_core::Version;

    #[test]
    fn test_detached_state_plan_separates_dirty_from_loaded() {
        let mut b = broker();
        let p = committed_person(&mut b, 1, "Ann", 30);
        let copy = b.detach(p, None).unwrap();
        b.set(copy, "age", 31).unwrap();
        let strategy = strategy_for(&b, copy).unwrap();
        assert_eq!(strategy.name(), "detached-state-manager");
        let meta = b.meta_of(copy).unwrap();
        let age = meta.index_of("age").unwrap();
        let name = meta.index_of("name").unwrap();
        let plan = strategy.copy_plan(&meta);
        assert!(plan.contains(&(age, CopyMode::Set)));
        assert!(plan.contains(&(name, CopyMode::StoreIfUnloaded)));
        assert_eq!(strategy.dirty().iter().collect::<Vec<_>>(), vec![age]);
    }

    #[test]
    fn test_plain_instance_takes_identity_from_key() {
        let mut b = broker();
        let p = b.insert(person(7, "Bo", 40));
        let strategy = strategy_for(&b, p).unwrap();
        assert_eq!(strategy.name(), "version");
        assert!(strategy.identity_inferred());
        assert!(strategy.object_id().is_some());
        assert_eq!(strategy.version(), None);
    }

    #[test]
    fn test_version_field_supplies_version() {
        let mut b = broker();
        let p = b.insert(person(7, "Bo", 40));
        b.set(p, "version", 3i64).unwrap();
        let strategy = strategy_for(&b, p).unwrap();
        assert_eq!(strategy.version(), Some(&Version::Counter(3)));
    }
}
