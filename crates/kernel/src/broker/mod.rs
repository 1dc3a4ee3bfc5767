//! Broker: the persistence context
//!
//! A [`Broker`] owns a [`Heap`] of instances and mediates every lifecycle
//! operation on them:
//! - Transactions: `begin`, `flush`, `commit`, `rollback` and the closure API
//!   [`Broker::transaction`]
//! - Lifecycle: `persist`, `delete`, `find`, `refresh`, `evict`, `release`,
//!   `transactional`, `nontransactional`, `embed`
//! - Field access: `get`/`set`, loading lazily and tracking dirtiness
//! - Detachment: `detach`, `detach_all`, `attach`, `attach_all` and the
//!   serialized form of detached instances
//!
//! Brokers are single-threaded; share work between threads by giving each
//! its own broker from the same [`BrokerFactory`](crate::BrokerFactory).

mod access;
mod persist;
mod transaction;

use crate::attach::AttachManager;
use crate::cache::DataCacheManager;
use crate::config::KernelConfig;
use crate::detach::DetachManager;
use crate::events::{EventKind, LifecycleEvent, LifecycleListeners, ListenerFn, OpCallbacks};
use crate::fetch::FetchConfiguration;
use crate::heap::{Heap, Instance};
use crate::inverse::InverseManager;
use crate::proxy::{DefaultProxyManager, ProxyManager};
use crate::store::{StoreManager, StoreTxId};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use stead_core::{
    ClassMetaData, FailedObject, FieldSet, MetaDataRepository, ObjectId, Oref,
    PersistenceCapable, Record, SteadError, SteadResult, Version,
};
use stead_lifecycle::{ContextFlags, OpenStateManager, PCState, StateManagerImpl};
use tracing::debug;
use uuid::Uuid;

/// Persistence context over one store
pub struct Broker {
    pub(crate) id: Uuid,
    pub(crate) metadata: Arc<MetaDataRepository>,
    pub(crate) store: Arc<dyn StoreManager>,
    pub(crate) cache: Option<DataCacheManager>,
    pub(crate) proxy: Arc<dyn ProxyManager>,
    pub(crate) config: Arc<KernelConfig>,
    pub(crate) flags: Arc<ContextFlags>,
    pub(crate) listeners: LifecycleListeners,
    pub(crate) fetch: FetchConfiguration,
    pub(crate) inverse: Option<InverseManager>,
    pub(crate) heap: Heap,
    pub(crate) by_oid: FxHashMap<ObjectId, Oref>,
    pub(crate) tx: Option<StoreTxId>,
    pub(crate) temp_seq: u64,
    pub(crate) closed: bool,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id)
            .field("instances", &self.heap.len())
            .field("active", &self.tx.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Broker {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Broker over `store` for the classes in `metadata`
    pub fn new(
        metadata: Arc<MetaDataRepository>,
        store: Arc<dyn StoreManager>,
        config: KernelConfig,
    ) -> Self {
        let flags = config.context_flags();
        let fetch = FetchConfiguration::with_groups(config.fetch_groups.iter().cloned());
        let inverse = config
            .inverse
            .enabled
            .then(|| InverseManager::new(config.inverse.action, config.inverse.manage_lrs));
        Broker {
            id: Uuid::new_v4(),
            metadata,
            store,
            cache: None,
            proxy: Arc::new(DefaultProxyManager),
            config: Arc::new(config),
            flags,
            listeners: LifecycleListeners::new(),
            fetch,
            inverse,
            heap: Heap::new(),
            by_oid: FxHashMap::default(),
            tx: None,
            temp_seq: 0,
            closed: false,
        }
    }

    /// Use `cache` for finds and evict committed changes from it
    pub fn with_data_cache(mut self, cache: DataCacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the proxy manager used to copy second-class values
    pub fn with_proxy_manager(mut self, proxy: Arc<dyn ProxyManager>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Start with `listeners` registered
    pub fn with_listeners(mut self, listeners: LifecycleListeners) -> Self {
        self.listeners.extend(&listeners);
        self
    }

    /// Register a listener for every lifecycle event
    pub fn add_listener(&mut self, listener: Arc<ListenerFn>) {
        self.listeners.add(listener);
    }

    /// Register a listener for some lifecycle events
    pub fn add_listener_for(&mut self, kinds: &[EventKind], listener: Arc<ListenerFn>) {
        self.listeners.add_for(kinds, listener);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Unique id of this broker
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration in effect
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Class metadata known to this broker
    pub fn metadata(&self) -> &Arc<MetaDataRepository> {
        &self.metadata
    }

    /// Active fetch configuration
    pub fn fetch_configuration(&self) -> &FetchConfiguration {
        &self.fetch
    }

    /// Mutable fetch configuration
    pub fn fetch_configuration_mut(&mut self) -> &mut FetchConfiguration {
        &mut self.fetch
    }

    /// Whether a transaction is active
    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Whether [`Broker::close`] was called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of instances in the heap, managed or not
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Handles of every managed instance
    pub fn managed_objects(&self) -> Vec<Oref> {
        self.heap.managed_orefs()
    }

    /// Raw view of an instance, bypassing field mediation
    pub fn instance(&self, oref: Oref) -> SteadResult<&dyn PersistenceCapable> {
        Ok(self.heap.get(oref)?.pc())
    }

    /// Lifecycle phase; `None` for unmanaged and detached instances
    pub fn state(&self, oref: Oref) -> SteadResult<Option<PCState>> {
        Ok(self.heap.get(oref)?.managed().map(StateManagerImpl::state))
    }

    /// Whether the instance is managed by this broker
    pub fn is_managed(&self, oref: Oref) -> bool {
        matches!(self.heap.get(oref), Ok(Instance::Managed(_)))
    }

    /// Persistent identity, from the state manager or the detached token
    pub fn object_id(&self, oref: Oref) -> SteadResult<Option<ObjectId>> {
        let inst = self.heap.get(oref)?;
        Ok(match inst.state_manager() {
            Some(sm) => sm.object_id().cloned(),
            None => inst.token().and_then(|t| t.oid.clone()),
        })
    }

    /// Version token, from the state manager or the detached token
    pub fn version(&self, oref: Oref) -> SteadResult<Option<Version>> {
        let inst = self.heap.get(oref)?;
        Ok(match inst.state_manager() {
            Some(sm) => sm.version().cloned(),
            None => inst.token().and_then(|t| t.version.clone()),
        })
    }

    /// Loaded fields; every field for plain unmanaged instances
    pub fn loaded(&self, oref: Oref) -> SteadResult<FieldSet> {
        let inst = self.heap.get(oref)?;
        Ok(match inst.state_manager() {
            Some(sm) => sm.loaded().clone(),
            None => match inst.token() {
                Some(t) => t.loaded.clone(),
                None => inst.meta().field_set(),
            },
        })
    }

    /// Dirty fields; empty for plain unmanaged instances
    pub fn dirty(&self, oref: Oref) -> SteadResult<FieldSet> {
        let inst = self.heap.get(oref)?;
        Ok(match inst.state_manager() {
            Some(sm) => sm.dirty().clone(),
            None => match inst.token() {
                Some(t) => t.dirty.clone(),
                None => FieldSet::new(inst.meta().field_count()),
            },
        })
    }

    /// Whether the instance is a detached copy.
    ///
    /// Instances of classes without detached bookkeeping count as detached
    /// when their primary key names a stored row.
    pub fn is_detached(&self, oref: Oref) -> SteadResult<bool> {
        let inst = self.heap.get(oref)?;
        if inst.is_detached() {
            return Ok(true);
        }
        match inst {
            Instance::Unmanaged(pc) => match self.oid_from_key(pc.as_ref())? {
                Some(oid) => self.store.exists(self.tx, &oid),
                None => Ok(false),
            },
            _ => Ok(false),
        }
    }

    /// Identity derived from primary-key fields, for application identity
    /// classes whose key is set
    pub(crate) fn oid_from_key(&self, pc: &dyn PersistenceCapable) -> SteadResult<Option<ObjectId>> {
        let meta = pc.meta();
        if meta.identity() != stead_core::IdentityType::Application {
            return Ok(None);
        }
        let mut key = Vec::new();
        for index in meta.pk_fields() {
            let value = pc.provide_field(index);
            let default = meta.require_field(index)?.default_value();
            if meta.generated_pk() && value == default {
                return Ok(None);
            }
            match value.to_id_value() {
                Some(v) => key.push(v),
                None => return Ok(None),
            }
        }
        Ok(Some(ObjectId::application(meta.name(), key)))
    }

    // =========================================================================
    // Heap
    // =========================================================================

    /// Add an unmanaged instance
    pub fn insert<P: PersistenceCapable + 'static>(&mut self, pc: P) -> Oref {
        self.heap.insert(Instance::Unmanaged(Box::new(pc)))
    }

    /// Add an unmanaged boxed instance
    pub fn insert_boxed(&mut self, pc: Box<dyn PersistenceCapable>) -> Oref {
        self.heap.insert(Instance::Unmanaged(pc))
    }

    /// Add a blank unmanaged instance of `class`
    pub fn new_instance(&mut self, class: &str) -> SteadResult<Oref> {
        self.check_open()?;
        let meta = Arc::clone(self.metadata.require(class)?);
        Ok(self.insert(Record::new(meta)))
    }

    /// Remove an unmanaged or detached instance from the heap and hand it
    /// back. Managed instances must be released first.
    pub fn take(&mut self, oref: Oref) -> SteadResult<Box<dyn PersistenceCapable>> {
        match self.heap.get(oref)? {
            Instance::Managed(_) => Err(SteadError::user(format!(
                "instance {} is managed; release it before taking it",
                oref
            ))),
            _ => match self.heap.remove(oref)? {
                Instance::Unmanaged(pc) => Ok(pc),
                Instance::Detached(dsm) => {
                    let token = dsm.to_token();
                    let (mut pc, _) = dsm.into_parts();
                    pc.set_detached_state(Some(token));
                    Ok(pc)
                }
                Instance::Managed(_) => Err(SteadError::internal("managed instance taken")),
            },
        }
    }

    // =========================================================================
    // Detach and attach
    // =========================================================================

    /// Detach one instance and whatever its detach cascades reach. Returns
    /// the detached copy, or the instance itself when detaching in place.
    pub fn detach(&mut self, oref: Oref, callbacks: Option<&dyn OpCallbacks>) -> SteadResult<Oref> {
        self.check_open()?;
        DetachManager::new(self, callbacks).detach(oref)
    }

    /// Detach several instances in one operation. Returns the copies in
    /// argument order, or `None` when detaching in place.
    pub fn detach_all(
        &mut self,
        orefs: &[Oref],
        callbacks: Option<&dyn OpCallbacks>,
    ) -> SteadResult<Option<Vec<Oref>>> {
        self.check_open()?;
        DetachManager::new(self, callbacks).detach_all(orefs)
    }

    /// Detach every managed instance in place
    pub fn detach_everything(&mut self) -> SteadResult<()> {
        self.check_open()?;
        let orefs: Vec<Oref> = self
            .heap
            .iter()
            .filter_map(|(oref, inst)| match inst {
                Instance::Managed(sm) if !sm.state().is_deleted() && sm.owner().is_none() => {
                    Some(oref)
                }
                _ => None,
            })
            .collect();
        DetachManager::new(self, None).detach_in_place(&orefs)
    }

    /// Merge a detached or new instance into this context. Returns the
    /// managed instance.
    pub fn attach(&mut self, oref: Oref, callbacks: Option<&dyn OpCallbacks>) -> SteadResult<Oref> {
        self.check_open()?;
        AttachManager::new(self, callbacks).attach(oref)
    }

    /// Merge several instances in one operation
    pub fn attach_all(
        &mut self,
        orefs: &[Oref],
        callbacks: Option<&dyn OpCallbacks>,
    ) -> SteadResult<Vec<Oref>> {
        self.check_open()?;
        AttachManager::new(self, callbacks).attach_all(orefs)
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Roll back any active transaction and refuse further work
    pub fn close(&mut self) -> SteadResult<()> {
        if self.closed {
            return Ok(());
        }
        let rollback = if self.tx.is_some() { self.rollback() } else { Ok(()) };
        self.closed = true;
        debug!(broker = %self.id, instances = self.heap.len(), "broker closed");
        rollback
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    pub(crate) fn check_open(&self) -> SteadResult<()> {
        if self.closed {
            return Err(SteadError::invalid_state("broker is closed", None));
        }
        Ok(())
    }

    pub(crate) fn meta_of(&self, oref: Oref) -> SteadResult<Arc<ClassMetaData>> {
        Ok(Arc::clone(self.heap.get(oref)?.meta()))
    }

    pub(crate) fn sm(&self, oref: Oref) -> SteadResult<&StateManagerImpl> {
        self.heap
            .get(oref)?
            .managed()
            .ok_or_else(|| not_managed(oref))
    }

    pub(crate) fn sm_mut(&mut self, oref: Oref) -> SteadResult<&mut StateManagerImpl> {
        self.heap
            .get_mut(oref)?
            .managed_mut()
            .ok_or_else(|| not_managed(oref))
    }

    pub(crate) fn failed(&self, oref: Oref) -> FailedObject {
        match self.heap.get(oref) {
            Ok(inst) => match inst.state_manager() {
                Some(sm) => sm.failed_object(Some(oref)),
                None => FailedObject::new(
                    inst.meta().name(),
                    Some(oref),
                    inst.token().and_then(|t| t.oid.clone()),
                ),
            },
            Err(_) => FailedObject::new("?", Some(oref), None),
        }
    }

    pub(crate) fn next_temporary_id(&mut self, class: &str) -> ObjectId {
        self.temp_seq += 1;
        ObjectId::temporary(class, self.temp_seq)
    }

    /// Managed instance → unmanaged, dropping it from the identity map
    pub(crate) fn unmanage(&mut self, oref: Oref) -> SteadResult<()> {
        let sm = match self.heap.take(oref)? {
            Instance::Managed(sm) => sm,
            other => return self.heap.put(oref, other),
        };
        if let Some(oid) = sm.object_id() {
            if self.by_oid.get(oid) == Some(&oref) {
                self.by_oid.remove(oid);
            }
        }
        self.heap.put(oref, Instance::Unmanaged(sm.into_pc()))
    }

    pub(crate) fn fire(&self, kind: EventKind, oref: Oref) -> SteadResult<()> {
        self.fire_event(kind, oref, None)
    }

    pub(crate) fn fire_event(
        &self,
        kind: EventKind,
        oref: Oref,
        related: Option<Oref>,
    ) -> SteadResult<()> {
        if !self.listeners.has_listeners(kind) {
            return Ok(());
        }
        let inst = self.heap.get(oref)?;
        let oid = match inst.state_manager() {
            Some(sm) => sm.object_id().cloned(),
            None => inst.token().and_then(|t| t.oid.clone()),
        };
        let mut event = LifecycleEvent::instance(kind, oref, inst.meta().name(), oid);
        if let Some(related) = related {
            event = event.with_related(related);
        }
        self.listeners.fire(&event)
    }

    pub(crate) fn fire_transaction(&self, kind: EventKind) -> SteadResult<()> {
        if !self.listeners.has_listeners(kind) {
            return Ok(());
        }
        self.listeners.fire(&LifecycleEvent::transaction(kind))
    }
}

fn not_managed(oref: Oref) -> SteadError {
    SteadError::user(format!("instance {} is not managed by this context", oref))
}
