//! Factory registry
//!
//! An owned map from a caller-chosen key to an open [`BrokerFactory`].
//! Factories leave the registry when they close, so a key only ever
//! resolves to a usable factory. Registries are independent values; tests
//! and embedders can keep as many as they like.

use crate::factory::BrokerFactory;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use stead_core::{SteadError, SteadResult};
use tracing::info;

pub(crate) struct RegistryInner {
    factories: Mutex<FxHashMap<String, BrokerFactory>>,
}

impl RegistryInner {
    /// Drop `key` if it still maps to `factory`
    pub(crate) fn remove_if(&self, key: &str, factory: &BrokerFactory) {
        let mut factories = self.factories.lock();
        if factories.get(key).is_some_and(|f| f.same_as(factory)) {
            factories.remove(key);
            info!(target: "stead::registry", key, "Factory deregistered on close");
        }
    }
}

/// Keyed collection of open broker factories.
///
/// Cloning is cheap; clones share the same map.
#[derive(Clone)]
pub struct FactoryRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl FactoryRegistry {
    /// Empty registry
    pub fn new() -> Self {
        FactoryRegistry {
            inner: Arc::new(RegistryInner {
                factories: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Register `factory` under `key`.
    ///
    /// # Errors
    ///
    /// Fails when the key is taken, the factory belongs to a registry
    /// already, or the factory is closed.
    pub fn register(&self, key: impl Into<String>, factory: BrokerFactory) -> SteadResult<()> {
        let key = key.into();
        let mut factories = self.inner.factories.lock();
        if factories.contains_key(&key) {
            return Err(SteadError::user(format!(
                "a factory is already registered under '{}'",
                key
            )));
        }
        factory.set_registration(Arc::downgrade(&self.inner), key.clone())?;
        info!(target: "stead::registry", key = %key, factory = %factory.id(), "Factory registered");
        factories.insert(key, factory);
        Ok(())
    }

    /// Factory registered under `key`
    pub fn get(&self, key: &str) -> Option<BrokerFactory> {
        self.inner.factories.lock().get(key).cloned()
    }

    /// Factory under `key`, registering the result of `create` if absent.
    /// The lock is held while `create` runs, so two callers never both create.
    pub fn get_or_create(
        &self,
        key: &str,
        create: impl FnOnce() -> SteadResult<BrokerFactory>,
    ) -> SteadResult<BrokerFactory> {
        let mut factories = self.inner.factories.lock();
        if let Some(existing) = factories.get(key) {
            return Ok(existing.clone());
        }
        let factory = create()?;
        factory.set_registration(Arc::downgrade(&self.inner), key.to_string())?;
        info!(target: "stead::registry", key, factory = %factory.id(), "Factory registered");
        factories.insert(key.to_string(), factory.clone());
        Ok(factory)
    }

    /// Remove `key`; the factory stays open
    pub fn deregister(&self, key: &str) -> Option<BrokerFactory> {
        let removed = self.inner.factories.lock().remove(key);
        if let Some(factory) = &removed {
            factory.clear_registration();
        }
        removed
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.factories.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of registered factories
    pub fn len(&self) -> usize {
        self.inner.factories.lock().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.inner.factories.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::repository;
    use crate::config::KernelConfig;
    use crate::store::InMemoryStore;

    fn factory() -> BrokerFactory {
        BrokerFactory::new(
            repository(),
            Arc::new(InMemoryStore::new()),
            KernelConfig::default(),
        )
    }

    #[test]
    fn test_register_and_get() {
        let registry = FactoryRegistry::new();
        let f = factory();
        registry.register("main", f.clone()).unwrap();
        assert!(registry.get("main").unwrap().same_as(&f));
        assert!(registry.get("other").is_none());
        assert_eq!(registry.keys(), vec!["main".to_string()]);
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let registry = FactoryRegistry::new();
        registry.register("main", factory()).unwrap();
        let err = registry.register("main", factory()).unwrap_err();
        assert!(matches!(err, SteadError::User { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_or_create_creates_once() {
        let registry = FactoryRegistry::new();
        let mut calls = 0;
        let a = registry
            .get_or_create("main", || {
                calls += 1;
                Ok(factory())
            })
            .unwrap();
        let b = registry
            .get_or_create("main", || {
                calls += 1;
                Ok(factory())
            })
            .unwrap();
        assert!(a.same_as(&b));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_close_deregisters() {
        let registry = FactoryRegistry::new();
        let f = factory();
        registry.register("main", f.clone()).unwrap();
        f.close().unwrap();
        assert!(registry.get("main").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deregister_leaves_factory_open() {
        let registry = FactoryRegistry::new();
        let f = factory();
        registry.register("main", f.clone()).unwrap();
        let removed = registry.deregister("main").unwrap();
        assert!(removed.same_as(&f));
        assert!(!f.is_closed());
        // free to join another registry now
        FactoryRegistry::new().register("other", f).unwrap();
    }

    #[test]
    fn test_closed_factory_cannot_register() {
        let registry = FactoryRegistry::new();
        let f = factory();
        f.close().unwrap();
        assert!(matches!(
            registry.register("main", f),
            Err(SteadError::InvalidState { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = FactoryRegistry::new();
        let b = FactoryRegistry::new();
        a.register("main", factory()).unwrap();
        assert!(b.get("main").is_none());
    }
}
