//! Broker factory
//!
//! A [`BrokerFactory`] hands out [`Broker`]s that share one metadata
//! repository, store, optional data cache and configuration. The shared
//! pieces live behind a single lock. Configuration freezes when the first
//! broker is created; after [`BrokerFactory::close`] every further call
//! fails with an invalid-state error.
//!
//! A factory registered in a [`FactoryRegistry`](crate::FactoryRegistry)
//! removes itself from that registry when it closes.

use crate::broker::Broker;
use crate::cache::DataCacheManager;
use crate::config::KernelConfig;
use crate::events::{EventKind, LifecycleListeners, ListenerFn};
use crate::registry::RegistryInner;
use crate::store::StoreManager;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use stead_core::{MetaDataRepository, SteadError, SteadResult};
use tracing::{debug, info};
use uuid::Uuid;

/// Shared state guarded by the factory lock
struct FactoryState {
    metadata: Arc<MetaDataRepository>,
    store: Arc<dyn StoreManager>,
    cache: Option<DataCacheManager>,
    config: KernelConfig,
    listeners: LifecycleListeners,
    frozen: bool,
    closed: bool,
    brokers_created: u64,
    registration: Option<(Weak<RegistryInner>, String)>,
}

struct FactoryInner {
    id: Uuid,
    state: Mutex<FactoryState>,
}

/// Source of brokers over one store.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct BrokerFactory {
    inner: Arc<FactoryInner>,
}

impl fmt::Debug for BrokerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BrokerFactory")
            .field("id", &self.inner.id)
            .field("frozen", &state.frozen)
            .field("closed", &state.closed)
            .field("brokers_created", &state.brokers_created)
            .finish_non_exhaustive()
    }
}

impl BrokerFactory {
    /// Factory over `store` for the classes in `metadata`
    pub fn new(
        metadata: Arc<MetaDataRepository>,
        store: Arc<dyn StoreManager>,
        config: KernelConfig,
    ) -> Self {
        let id = Uuid::new_v4();
        info!(target: "stead::factory", %id, "Broker factory created");
        BrokerFactory {
            inner: Arc::new(FactoryInner {
                id,
                state: Mutex::new(FactoryState {
                    metadata,
                    store,
                    cache: None,
                    config,
                    listeners: LifecycleListeners::new(),
                    frozen: false,
                    closed: false,
                    brokers_created: 0,
                    registration: None,
                }),
            }),
        }
    }

    /// Unique id of this factory
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Whether `other` is a handle to the same factory
    pub fn same_as(&self, other: &BrokerFactory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copy of the configuration
    pub fn config(&self) -> KernelConfig {
        self.inner.state.lock().config.clone()
    }

    /// Change the configuration.
    ///
    /// # Errors
    ///
    /// Fails once a broker has been created or the factory is closed.
    pub fn configure(&self, f: impl FnOnce(&mut KernelConfig)) -> SteadResult<()> {
        let mut state = self.inner.state.lock();
        Self::check_mutable(&state)?;
        f(&mut state.config);
        Ok(())
    }

    /// Use `cache` for every broker created from now on.
    ///
    /// # Errors
    ///
    /// Fails once a broker has been created or the factory is closed.
    pub fn set_data_cache(&self, cache: DataCacheManager) -> SteadResult<()> {
        let mut state = self.inner.state.lock();
        Self::check_mutable(&state)?;
        state.cache = Some(cache);
        Ok(())
    }

    /// Register a listener on every broker created from now on
    pub fn add_listener(&self, listener: Arc<ListenerFn>) -> SteadResult<()> {
        let mut state = self.inner.state.lock();
        Self::check_open(&state)?;
        state.listeners.add(listener);
        Ok(())
    }

    /// Register a listener for some events on every broker created from now on
    pub fn add_listener_for(&self, kinds: &[EventKind], listener: Arc<ListenerFn>) -> SteadResult<()> {
        let mut state = self.inner.state.lock();
        Self::check_open(&state)?;
        state.listeners.add_for(kinds, listener);
        Ok(())
    }

    /// Create a broker. The first call freezes the configuration.
    pub fn new_broker(&self) -> SteadResult<Broker> {
        let (metadata, store, cache, config, listeners, count) = {
            let mut state = self.inner.state.lock();
            Self::check_open(&state)?;
            state.frozen = true;
            state.brokers_created += 1;
            (
                Arc::clone(&state.metadata),
                Arc::clone(&state.store),
                state.cache.clone(),
                state.config.clone(),
                state.listeners.clone(),
                state.brokers_created,
            )
        };
        let mut broker = Broker::new(metadata, store, config).with_listeners(listeners);
        if let Some(cache) = cache {
            broker = broker.with_data_cache(cache);
        }
        debug!(factory = %self.inner.id, broker = %broker.id(), count, "broker created");
        Ok(broker)
    }

    /// Whether the configuration can still change
    pub fn is_frozen(&self) -> bool {
        self.inner.state.lock().frozen
    }

    /// Whether [`BrokerFactory::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of brokers handed out
    pub fn brokers_created(&self) -> u64 {
        self.inner.state.lock().brokers_created
    }

    /// Close the factory and leave any registry it belongs to.
    ///
    /// # Errors
    ///
    /// Closing twice is an invalid-state error.
    pub fn close(&self) -> SteadResult<()> {
        let registration = {
            let mut state = self.inner.state.lock();
            Self::check_open(&state)?;
            state.closed = true;
            state.registration.take()
        };
        // outside the factory lock: the registry locks itself
        if let Some((registry, key)) = registration {
            if let Some(registry) = registry.upgrade() {
                registry.remove_if(&key, self);
            }
        }
        info!(target: "stead::factory", id = %self.inner.id, "Broker factory closed");
        Ok(())
    }

    pub(crate) fn set_registration(&self, registry: Weak<RegistryInner>, key: String) -> SteadResult<()> {
        let mut state = self.inner.state.lock();
        Self::check_open(&state)?;
        if state.registration.is_some() {
            return Err(SteadError::user("factory is already registered"));
        }
        state.registration = Some((registry, key));
        Ok(())
    }

    pub(crate) fn clear_registration(&self) {
        self.inner.state.lock().registration = None;
    }

    fn check_open(state: &FactoryState) -> SteadResult<()> {
        if state.closed {
            return Err(SteadError::invalid_state("broker factory is closed", None));
        }
        Ok(())
    }

    fn check_mutable(state: &FactoryState) -> SteadResult<()> {
        Self::check_open(state)?;
        if state.frozen {
            return Err(SteadError::invalid_state(
                "configuration is frozen once a broker has been created",
                None,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::{person, repository};
    use crate::cache::InMemoryDataCache;
    use crate::store::InMemoryStore;
    use parking_lot::Mutex;

    fn factory() -> BrokerFactory {
        BrokerFactory::new(
            repository(),
            Arc::new(InMemoryStore::new()),
            KernelConfig::default(),
        )
    }

    #[test]
    fn test_brokers_share_the_store() {
        let f = factory();
        let mut a = f.new_broker().unwrap();
        let mut b = f.new_broker().unwrap();
        assert_ne!(a.id(), b.id());
        let p = a
            .transaction(|a| {
                let p = a.insert(person(1, "Ann", 30));
                a.persist(p)?;
                Ok(p)
            })
            .unwrap();
        let oid = a.object_id(p).unwrap().unwrap();
        let q = b.find(&oid).unwrap().unwrap();
        assert_eq!(b.get(q, "name").unwrap(), "Ann".into());
        assert_eq!(f.brokers_created(), 2);
    }

    #[test]
    fn test_configuration_freezes_on_first_broker() {
        let f = factory();
        f.configure(|c| c.retain_state = false).unwrap();
        assert!(!f.is_frozen());
        let broker = f.new_broker().unwrap();
        assert!(!broker.config().retain_state);
        assert!(f.is_frozen());

        let err = f.configure(|c| c.optimistic = false).unwrap_err();
        assert!(matches!(err, SteadError::InvalidState { .. }));
        assert!(f
            .set_data_cache(DataCacheManager::new())
            .is_err());
        assert!(f.config().optimistic);
    }

    #[test]
    fn test_factory_listeners_reach_new_brokers() {
        let f = factory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        f.add_listener_for(
            &[EventKind::AfterPersist],
            Arc::new(move |e: &crate::events::LifecycleEvent| {
                sink.lock().push(e.kind);
                Ok(())
            }),
        )
        .unwrap();
        let mut b = f.new_broker().unwrap();
        b.transaction(|b| {
            let p = b.insert(person(1, "Ann", 30));
            b.persist(p)
        })
        .unwrap();
        assert_eq!(*seen.lock(), vec![EventKind::AfterPersist]);
    }

    #[test]
    fn test_data_cache_is_handed_to_brokers() {
        let f = factory();
        let cache = DataCacheManager::new();
        cache.register(Arc::new(InMemoryDataCache::new("default")));
        f.set_data_cache(cache).unwrap();
        let b = f.new_broker().unwrap();
        assert!(b.cache.is_some());
    }

    #[test]
    fn test_closed_factory_refuses_work() {
        let f = factory();
        f.close().unwrap();
        assert!(f.is_closed());
        assert!(matches!(
            f.new_broker(),
            Err(SteadError::InvalidState { .. })
        ));
        assert!(f.close().is_err());
        assert!(f.add_listener(Arc::new(|_: &crate::events::LifecycleEvent| Ok(()))).is_err());
    }
}
