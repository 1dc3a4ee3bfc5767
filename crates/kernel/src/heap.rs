//! Heap of instances owned by a broker
//!
//! Instances are addressed by generational [`Oref`] handles. A slot holds an
//! unmanaged instance, a managed one (with its [`StateManagerImpl`]) or a
//! detached copy with its [`DetachedStateManager`]. Removing an instance
//! bumps the slot generation so stale handles are rejected.

use std::sync::Arc;
use stead_core::{ClassMetaData, DetachedState, Oref, PersistenceCapable, SteadError, SteadResult};
use stead_lifecycle::{DetachedStateManager, OpenStateManager, StateManagerImpl};

/// What a heap slot holds
#[derive(Debug)]
pub enum Instance {
    /// Not managed by any context; may carry a detached-state token
    Unmanaged(Box<dyn PersistenceCapable>),
    /// Managed by the owning broker
    Managed(Box<StateManagerImpl>),
    /// Detached copy tracking its own changes
    Detached(Box<DetachedStateManager>),
}

impl Instance {
    /// The instance
    pub fn pc(&self) -> &dyn PersistenceCapable {
        match self {
            Instance::Unmanaged(pc) => pc.as_ref(),
            Instance::Managed(sm) => sm.pc(),
            Instance::Detached(dsm) => dsm.pc(),
        }
    }

    /// Mutable instance access, bypassing any state manager
    pub fn pc_mut(&mut self) -> &mut dyn PersistenceCapable {
        match self {
            Instance::Unmanaged(pc) => pc.as_mut(),
            Instance::Managed(sm) => sm.pc_mut(),
            Instance::Detached(dsm) => dsm.pc_mut(),
        }
    }

    /// Class metadata
    pub fn meta(&self) -> &Arc<ClassMetaData> {
        self.pc().meta()
    }

    /// State manager, for managed and detached instances
    pub fn state_manager(&self) -> Option<&dyn OpenStateManager> {
        match self {
            Instance::Unmanaged(_) => None,
            Instance::Managed(sm) => Some(sm.as_ref()),
            Instance::Detached(dsm) => Some(dsm.as_ref()),
        }
    }

    /// Managed state manager
    pub fn managed(&self) -> Option<&StateManagerImpl> {
        match self {
            Instance::Managed(sm) => Some(sm),
            _ => None,
        }
    }

    /// Mutable managed state manager
    pub fn managed_mut(&mut self) -> Option<&mut StateManagerImpl> {
        match self {
            Instance::Managed(sm) => Some(sm),
            _ => None,
        }
    }

    /// Detached-state token carried by the instance itself
    pub fn token(&self) -> Option<&DetachedState> {
        self.pc().detached_state()
    }

    /// Whether this is a detached copy, with or without a state manager
    pub fn is_detached(&self) -> bool {
        match self {
            Instance::Detached(_) => true,
            Instance::Unmanaged(pc) => pc.detached_state().is_some(),
            Instance::Managed(_) => false,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    instance: Option<Instance>,
    live: bool,
}

/// Generational arena of instances
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl Heap {
    /// Empty heap
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the heap is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add an instance and return its handle
    pub fn insert(&mut self, instance: Instance) -> Oref {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.instance = Some(instance);
            slot.live = true;
            return Oref::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            instance: Some(instance),
            live: true,
        });
        Oref::new(index, 0)
    }

    fn slot(&self, oref: Oref) -> SteadResult<&Slot> {
        self.slots
            .get(oref.index() as usize)
            .filter(|s| s.live && s.generation == oref.generation())
            .ok_or_else(|| stale(oref))
    }

    fn slot_mut(&mut self, oref: Oref) -> SteadResult<&mut Slot> {
        self.slots
            .get_mut(oref.index() as usize)
            .filter(|s| s.live && s.generation == oref.generation())
            .ok_or_else(|| stale(oref))
    }

    /// Whether `oref` names a live instance
    pub fn contains(&self, oref: Oref) -> bool {
        self.slot(oref).is_ok()
    }

    /// Instance behind `oref`
    pub fn get(&self, oref: Oref) -> SteadResult<&Instance> {
        self.slot(oref)?
            .instance
            .as_ref()
            .ok_or_else(|| busy(oref))
    }

    /// Mutable instance behind `oref`
    pub fn get_mut(&mut self, oref: Oref) -> SteadResult<&mut Instance> {
        self.slot_mut(oref)?
            .instance
            .as_mut()
            .ok_or_else(|| busy(oref))
    }

    /// Take the instance out, keeping the slot reserved until [`Heap::put`]
    pub fn take(&mut self, oref: Oref) -> SteadResult<Instance> {
        self.slot_mut(oref)?.instance.take().ok_or_else(|| busy(oref))
    }

    /// Put an instance back into a reserved slot
    pub fn put(&mut self, oref: Oref, instance: Instance) -> SteadResult<()> {
        let slot = self.slot_mut(oref)?;
        if slot.instance.is_some() {
            return Err(SteadError::internal(format!("slot {} is occupied", oref)));
        }
        slot.instance = Some(instance);
        Ok(())
    }

    /// Swap the instance behind `oref`, returning the old one
    pub fn replace(&mut self, oref: Oref, instance: Instance) -> SteadResult<Instance> {
        let slot = self.slot_mut(oref)?;
        slot.instance.replace(instance).ok_or_else(|| busy(oref))
    }

    /// Remove the instance; the handle becomes stale
    pub fn remove(&mut self, oref: Oref) -> SteadResult<Instance> {
        let slot = self.slot_mut(oref)?;
        let instance = slot.instance.take().ok_or_else(|| busy(oref))?;
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(oref.index());
        self.len -= 1;
        Ok(instance)
    }

    /// Handles of every live instance, in slot order
    pub fn orefs(&self) -> Vec<Oref> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.live)
            .map(|(i, s)| Oref::new(i as u32, s.generation))
            .collect()
    }

    /// Handles of every managed instance, in slot order
    pub fn managed_orefs(&self) -> Vec<Oref> {
        self.iter()
            .filter(|(_, inst)| matches!(inst, Instance::Managed(_)))
            .map(|(oref, _)| oref)
            .collect()
    }

    /// Live instances with their handles
    pub fn iter(&self) -> impl Iterator<Item = (Oref, &Instance)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            match (s.live, s.instance.as_ref()) {
                (true, Some(inst)) => Some((Oref::new(i as u32, s.generation), inst)),
                _ => None,
            }
        })
    }
}

fn stale(oref: Oref) -> SteadError {
    SteadError::user(format!("instance {} is not known to this context", oref))
}

fn busy(oref: Oref) -> SteadError {
    SteadError::internal(format!("instance {} is checked out", oref))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stead_core::{FieldMetaData, Record, TypeCode};

    fn record() -> Instance {
        let meta = ClassMetaData::builder("Person")
            .field(FieldMetaData::new("name", TypeCode::String))
            .build()
            .unwrap();
        Instance::Unmanaged(Box::new(Record::new(meta)))
    }

    #[test]
    fn test_stale_handle_rejected_after_remove() {
        let mut heap = Heap::new();
        let a = heap.insert(record());
        heap.remove(a).unwrap();
        assert!(heap.get(a).is_err());
        let b = heap.insert(record());
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert!(heap.get(b).is_ok());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_take_and_put() {
        let mut heap = Heap::new();
        let a = heap.insert(record());
        let inst = heap.take(a).unwrap();
        assert!(matches!(heap.get(a), Err(SteadError::Internal(_))));
        assert_eq!(heap.iter().count(), 0);
        heap.put(a, inst).unwrap();
        assert_eq!(heap.iter().count(), 1);
        assert!(heap.put(a, record()).is_err());
    }

    #[test]
    fn test_token_marks_detached() {
        let mut heap = Heap::new();
        let a = heap.insert(record());
        assert!(!heap.get(a).unwrap().is_detached());
        heap.get_mut(a).unwrap().pc_mut().set_detached_state(Some(DetachedState {
            oid: None,
            version: None,
            loaded: stead_core::FieldSet::new(1),
            dirty: stead_core::FieldSet::new(1),
            embedded: false,
        }));
        assert!(heap.get(a).unwrap().is_detached());
        assert_eq!(heap.managed_orefs(), vec![]);
    }
}
