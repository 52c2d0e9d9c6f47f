//! Uses: the binding of a handle to an (in, out) flow pair and a permission
//! pair for one scope.
use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::flow::FlowId;
use crate::handle::VarId;
use crate::key::Key;
use crate::mapping::MappingRef;
use crate::permissions::PermissionPair;
use crate::task::TaskId;

/// A type-erased, thread-safe value.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Generational index of a use record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UseId {
    index: u32,
    generation: u32,
}

impl fmt::Display for UseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone)]
pub struct CollectionUse {
    pub len: usize,
    pub mapping: MappingRef,
}

#[derive(Debug, Clone, Copy)]
pub struct LocalUse {
    pub collection: VarId,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct PublicationUse {
    pub version: Key,
    pub readers: usize,
}

/// The closed set of things a use can stand for.
#[derive(Debug, Clone)]
pub enum UseKind {
    Handle,
    Collection(CollectionUse),
    /// One element of a collection, seen by one task of a concurrent group.
    Local(LocalUse),
    Publication(PublicationUse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UseState {
    Registered,
    Dependency(TaskId),
    Published,
}

/// The data a use points at while its task runs.
pub enum Data {
    Shared(Dynamic),
    Owned(Box<dyn Any + Send + Sync>),
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::Shared(_) => f.write_str("Shared(..)"),
            Data::Owned(_) => f.write_str("Owned(..)"),
        }
    }
}

#[derive(Debug)]
pub struct UseRecord {
    pub key: Key,
    pub var: VarId,
    pub in_flow: FlowId,
    pub out_flow: FlowId,
    pub permissions: PermissionPair,
    pub kind: UseKind,
    pub state: UseState,
    /// Set when a continuation took over this use's output flow.
    pub superseded: bool,
    pub(crate) type_name: &'static str,
    pub(crate) data: Option<Data>,
}

impl UseRecord {
    pub(crate) fn new(
        key: Key,
        var: VarId,
        (in_flow, out_flow): (FlowId, FlowId),
        permissions: PermissionPair,
        kind: UseKind,
        type_name: &'static str,
    ) -> Self {
        Self {
            key,
            var,
            in_flow,
            out_flow,
            permissions,
            kind,
            state: UseState::Registered,
            superseded: false,
            type_name,
            data: None,
        }
    }

    /// Releasing this use makes its output flow equivalent to its input flow.
    ///
    /// This holds exactly when the use was never superseded, cannot write
    /// its data and has distinct flows: nothing else will ever produce the
    /// output, so it carries the input state forward.
    pub fn establishes_alias(&self) -> bool {
        !self.superseded && !self.permissions.immediate.writes() && self.in_flow != self.out_flow
    }

    /// Releasing this use produces its output flow from its data.
    pub fn produces_output(&self) -> bool {
        !self.superseded && self.permissions.immediate.writes()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub(crate) fn fill(&mut self, data: Option<Dynamic>) {
        self.data = data.map(Data::Shared);
    }

    /// A shared snapshot of the current data.
    pub fn shared(&mut self) -> Option<Dynamic> {
        let shared: Dynamic = match self.data.take()? {
            Data::Shared(arc) => arc,
            Data::Owned(boxed) => Arc::from(boxed),
        };
        self.data = Some(Data::Shared(shared.clone()));
        Some(shared)
    }

    fn mismatch<T>(&self) -> FlowError {
        FlowError::TypeMismatch {
            key: self.key.clone(),
            expected: type_name::<T>(),
            found: self.type_name,
        }
    }

    pub fn get<T: 'static>(&self) -> Result<&T> {
        let value: &(dyn Any + Send + Sync) = match &self.data {
            Some(Data::Shared(arc)) => arc.as_ref(),
            Some(Data::Owned(boxed)) => boxed.as_ref(),
            None => {
                return Err(FlowError::Uninitialized {
                    key: self.key.clone(),
                });
            }
        };
        value.downcast_ref::<T>().ok_or_else(|| self.mismatch::<T>())
    }

    pub fn get_mut<T: Clone + Send + Sync + 'static>(&mut self) -> Result<&mut T> {
        let Some(data) = self.data.take() else {
            return Err(FlowError::Uninitialized {
                key: self.key.clone(),
            });
        };

        let owned: Box<dyn Any + Send + Sync> = match data {
            Data::Owned(boxed) if boxed.is::<T>() => boxed,
            Data::Owned(boxed) => {
                self.data = Some(Data::Owned(boxed));
                return Err(self.mismatch::<T>());
            }
            Data::Shared(arc) => match arc.downcast::<T>() {
                Ok(typed) => Box::new(Arc::unwrap_or_clone(typed)),
                Err(arc) => {
                    self.data = Some(Data::Shared(arc));
                    return Err(self.mismatch::<T>());
                }
            },
        };

        let err = self.mismatch::<T>();
        match self.data.insert(Data::Owned(owned)) {
            Data::Owned(boxed) => boxed.downcast_mut::<T>().ok_or(err),
            Data::Shared(_) => Err(err),
        }
    }

    pub fn set<T: Send + Sync + 'static>(&mut self, value: T) {
        self.data = Some(Data::Owned(Box::new(value)));
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<UseRecord>,
}

/// Arena of live uses. A released use leaves a tombstone whose generation
/// no longer matches any outstanding [`UseId`].
#[derive(Debug, Default)]
pub struct UseArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl UseArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: UseRecord) -> UseId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return UseId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        UseId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: UseId) -> Result<&UseRecord> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
            .ok_or(FlowError::UseAfterRelease(id))
    }

    pub fn get_mut(&mut self, id: UseId) -> Result<&mut UseRecord> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
            .ok_or(FlowError::UseAfterRelease(id))
    }

    pub fn remove(&mut self, id: UseId) -> Result<UseRecord> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.record.is_some())
            .ok_or(FlowError::UseAfterRelease(id))?;

        let record = slot.record.take().ok_or(FlowError::UseAfterRelease(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(record)
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.record.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key;
    use crate::mapping::Identity;
    use crate::permissions::Permissions;

    fn record(immediate: Permissions) -> UseRecord {
        UseRecord::new(
            key!("h"),
            VarId(0),
            (FlowId(0), FlowId(1)),
            PermissionPair::new(Permissions::Modify, immediate),
            UseKind::Handle,
            type_name::<i32>(),
        )
    }

    #[test]
    fn test_stale_ids_are_rejected() {
        let mut arena = UseArena::new();
        let a = arena.insert(record(Permissions::None));
        arena.remove(a).unwrap();

        let b = arena.insert(record(Permissions::None));
        assert_ne!(a, b);
        assert!(matches!(arena.get(a), Err(FlowError::UseAfterRelease(_))));
        assert!(matches!(arena.remove(a), Err(FlowError::UseAfterRelease(_))));
        assert!(arena.get(b).is_ok());
        assert_eq!(arena.live(), 1);
    }

    #[test]
    fn test_alias_rule() {
        let mut continuation = record(Permissions::None);
        assert!(continuation.establishes_alias());
        assert!(!continuation.produces_output());

        continuation.superseded = true;
        assert!(!continuation.establishes_alias());

        let writer = record(Permissions::Write);
        assert!(!writer.establishes_alias());
        assert!(writer.produces_output());

        let mut reader = record(Permissions::Read);
        reader.out_flow = reader.in_flow;
        assert!(!reader.establishes_alias());
    }

    #[test]
    fn test_data_slot() {
        let mut use_ = record(Permissions::Modify);
        assert!(matches!(
            use_.get::<i32>(),
            Err(FlowError::Uninitialized { .. })
        ));

        use_.fill(Some(Arc::new(5_i32)));
        assert_eq!(*use_.get::<i32>().unwrap(), 5);
        assert!(matches!(
            use_.get::<String>(),
            Err(FlowError::TypeMismatch { .. })
        ));

        let snapshot = use_.shared().unwrap();
        *use_.get_mut::<i32>().unwrap() += 1;
        assert_eq!(*use_.get::<i32>().unwrap(), 6);
        // the snapshot taken earlier is untouched
        assert_eq!(snapshot.downcast_ref::<i32>(), Some(&5));
    }

    #[test]
    fn test_collection_kind_keeps_mapping() {
        let kind = UseKind::Collection(CollectionUse {
            len: 4,
            mapping: Arc::new(Identity),
        });
        let UseKind::Collection(collection) = kind else {
            panic!("expected a collection use");
        };
        assert_eq!(collection.mapping.map_forward(2), Some(2));
    }
}
