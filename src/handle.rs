use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::flow::Shape;
use crate::key::Key;
use crate::mapping::{IndexMapping, MappingRef, compose};

/// Identity of one logical variable within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub(crate) u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct VarRecord {
    pub key: Key,
    pub shape: Shape,
    pub type_name: &'static str,
}

/// A typed token referring to a named, versioned value.
///
/// Handles are plain copyable tokens. Which version a handle sees and what a
/// task may do with it is decided by the scope it is used in, see
/// [`Context`](crate::Context).
pub struct AccessHandle<T> {
    pub(crate) var: VarId,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> AccessHandle<T> {
    pub(crate) fn new(var: VarId) -> Self {
        Self {
            var,
            _phantom: PhantomData,
        }
    }

    pub fn var(&self) -> VarId {
        self.var
    }
}

impl<T> Clone for AccessHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AccessHandle<T> {}

impl<T> fmt::Debug for AccessHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessHandle({})", self.var)
    }
}

/// A typed token referring to a collection of values over an index range.
///
/// A collection optionally carries a mapping, applied when a concurrent group
/// captures it: task `i` of the group touches element `mapping(i)`.
pub struct AccessHandleCollection<T> {
    pub(crate) var: VarId,
    pub(crate) len: usize,
    pub(crate) mapping: Option<MappingRef>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> AccessHandleCollection<T> {
    pub(crate) fn new(var: VarId, len: usize) -> Self {
        Self {
            var,
            len,
            mapping: None,
            _phantom: PhantomData,
        }
    }

    pub fn var(&self) -> VarId {
        self.var
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The same collection seen through `mapping`, applied after any mapping
    /// this view already has. No storage is duplicated.
    pub fn mapped<M: IndexMapping + 'static>(&self, mapping: M) -> Self {
        Self {
            var: self.var,
            len: self.len,
            mapping: Some(compose(self.mapping.as_ref(), Arc::new(mapping))),
            _phantom: PhantomData,
        }
    }
}

impl<T> Clone for AccessHandleCollection<T> {
    fn clone(&self) -> Self {
        Self {
            var: self.var,
            len: self.len,
            mapping: self.mapping.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AccessHandleCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessHandleCollection")
            .field("var", &self.var)
            .field("len", &self.len)
            .field("mapping", &self.mapping)
            .finish()
    }
}

/// What a capture refers to.
#[derive(Debug, Clone)]
pub enum CaptureTarget {
    Handle(VarId),
    Collection {
        var: VarId,
        mapping: Option<MappingRef>,
    },
}

impl CaptureTarget {
    pub fn var(&self) -> VarId {
        match self {
            CaptureTarget::Handle(var) | CaptureTarget::Collection { var, .. } => *var,
        }
    }
}

/// Anything a task can capture.
pub trait Capturable {
    fn target(&self) -> CaptureTarget;
}

impl<T> Capturable for AccessHandle<T> {
    fn target(&self) -> CaptureTarget {
        CaptureTarget::Handle(self.var)
    }
}

impl<T> Capturable for AccessHandleCollection<T> {
    fn target(&self) -> CaptureTarget {
        CaptureTarget::Collection {
            var: self.var,
            mapping: self.mapping.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Block, Reverse};

    #[test]
    fn test_handles_are_copy() {
        let a: AccessHandle<String> = AccessHandle::new(VarId(3));
        let b = a;
        assert_eq!(a.var(), b.var());
        assert!(matches!(a.target(), CaptureTarget::Handle(VarId(3))));
    }

    #[test]
    fn test_mapped_views_compose() {
        let c: AccessHandleCollection<i32> = AccessHandleCollection::new(VarId(1), 4);
        let view = c.mapped(Reverse::new(4)).mapped(Block::new(2));

        assert_eq!(view.var(), c.var());
        let CaptureTarget::Collection { mapping, .. } = view.target() else {
            panic!("expected a collection target");
        };
        let mapping = mapping.unwrap();
        assert_eq!(mapping.map_forward(0), Some(1));
        assert!(c.mapping.is_none());
    }
}
