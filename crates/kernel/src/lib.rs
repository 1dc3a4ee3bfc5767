//! Persistence kernel for the stead runtime
//!
//! The kernel owns instances and walks object graphs:
//! - [`Broker`]: the persistence context, its heap and transactions
//! - Detachment: [`Broker::detach`] and friends, [`DetachedGraph`] wire form
//! - Attachment: [`AttachStrategy`] implementations merging copies back
//! - [`InverseManager`]: bidirectional relation consistency
//! - Collaborators: [`StoreManager`], [`DataCache`], [`ProxyManager`] with
//!   in-memory implementations
//! - [`BrokerFactory`] / [`FactoryRegistry`]: shared configuration and stores
//!
//! Configuration comes from [`KernelConfig`], usually loaded from TOML.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attach;
pub mod broker;
pub mod cache;
pub mod config;
mod detach;
pub mod events;
pub mod factory;
pub mod fetch;
pub mod heap;
pub mod inverse;
pub mod proxy;
pub mod registry;
pub mod store;
pub mod wire;

pub use attach::{AttachStrategy, CopyMode, DetachedStateAttachStrategy, VersionAttachStrategy};
pub use broker::Broker;
pub use cache::{CacheStats, DataCache, DataCacheManager, InMemoryDataCache};
pub use config::{
    AttachConfig, CallbackConfig, CompatibilityConfig, DetachConfig, DetachMode, InverseAction,
    InverseConfig, KernelConfig, CONFIG_FILE_NAME,
};
pub use events::{
    EventKind, LifecycleEvent, LifecycleListeners, ListenerFn, OpActions, OpCallbacks,
};
pub use factory::BrokerFactory;
pub use fetch::FetchConfiguration;
pub use heap::{Heap, Instance};
pub use inverse::InverseManager;
pub use proxy::{DefaultProxyManager, ProxyManager};
pub use registry::FactoryRegistry;
pub use store::{FlushOp, InMemoryStore, StoreManager, StoreTxId, StoredRow};
pub use wire::{DetachedGraph, DetachedRecord};
