//! Versioned flow tokens and their life-cycle.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::key::Key;

/// Opaque identity of one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowId(pub(crate) u32);

impl FlowId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Whether a flow versions one value or a whole collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    Single,
    Collection(usize),
}

/// How a flow was derived. Equivalence between flows only ever comes from
/// an explicit `Same` link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowRelation {
    /// The state of freshly created data.
    Initial,
    /// The end of a lineage nobody will consume.
    Null,
    Same(FlowId),
    Next(FlowId),
    /// The state of `parent` after the modifications its owner made so far.
    Forwarding(FlowId),
    Fetching { version: Key },
    /// One element of a collection flow.
    Indexed { parent: FlowId, index: usize },
}

impl FlowRelation {
    pub fn parent(&self) -> Option<FlowId> {
        match self {
            FlowRelation::Same(p)
            | FlowRelation::Next(p)
            | FlowRelation::Forwarding(p)
            | FlowRelation::Indexed { parent: p, .. } => Some(*p),
            FlowRelation::Initial | FlowRelation::Null | FlowRelation::Fetching { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowState {
    Created,
    Registered,
    InUse,
    Published,
    Released,
}

/// What the backend learns about a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub key: Key,
    pub relation: FlowRelation,
    pub shape: Shape,
}

#[derive(Debug)]
struct FlowEntry {
    flow: Flow,
    state: FlowState,
    /// Number of live uses this flow is bound into.
    bindings: u32,
    advanced: bool,
}

/// Arena of every flow derived during a run.
#[derive(Debug, Default)]
pub struct FlowTable {
    entries: Vec<FlowEntry>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, id: FlowId) -> &FlowEntry {
        &self.entries[id.index()]
    }

    fn entry_mut(&mut self, id: FlowId) -> &mut FlowEntry {
        &mut self.entries[id.index()]
    }

    pub fn get(&self, id: FlowId) -> &Flow {
        &self.entry(id).flow
    }

    pub fn state(&self, id: FlowId) -> FlowState {
        self.entry(id).state
    }

    fn push(&mut self, key: Key, relation: FlowRelation, shape: Shape) -> FlowId {
        let id = FlowId(self.entries.len() as u32);
        tracing::trace!("derived flow {} for {} as {:?}", id, key, relation);
        self.entries.push(FlowEntry {
            flow: Flow {
                id,
                key,
                relation,
                shape,
            },
            state: FlowState::Created,
            bindings: 0,
            advanced: false,
        });
        id
    }

    fn live_parent(&self, parent: FlowId) -> Result<&Flow> {
        let entry = self.entry(parent);
        if entry.state == FlowState::Released {
            return Err(FlowError::FlowReleased {
                key: entry.flow.key.clone(),
                flow: parent,
            });
        }
        Ok(&entry.flow)
    }

    pub fn initial(&mut self, key: Key, shape: Shape) -> FlowId {
        self.push(key, FlowRelation::Initial, shape)
    }

    pub fn null(&mut self, key: Key, shape: Shape) -> FlowId {
        self.push(key, FlowRelation::Null, shape)
    }

    pub fn fetching(&mut self, key: Key, version: Key) -> FlowId {
        self.push(key, FlowRelation::Fetching { version }, Shape::Single)
    }

    pub fn same(&mut self, parent: FlowId) -> Result<FlowId> {
        let flow = self.live_parent(parent)?;
        let (key, shape) = (flow.key.clone(), flow.shape);
        Ok(self.push(key, FlowRelation::Same(parent), shape))
    }

    pub fn forwarding(&mut self, parent: FlowId) -> Result<FlowId> {
        let flow = self.live_parent(parent)?;
        let (key, shape) = (flow.key.clone(), flow.shape);
        Ok(self.push(key, FlowRelation::Forwarding(parent), shape))
    }

    /// Derives the next version of `parent`. A flow advances at most once.
    pub fn next(&mut self, parent: FlowId) -> Result<FlowId> {
        let flow = self.live_parent(parent)?;
        let (key, shape) = (flow.key.clone(), flow.shape);
        if self.entry(parent).advanced {
            return Err(FlowError::DoubleAdvance { key, flow: parent });
        }
        self.entry_mut(parent).advanced = true;
        Ok(self.push(key, FlowRelation::Next(parent), shape))
    }

    pub fn indexed(&mut self, parent: FlowId, index: usize) -> Result<FlowId> {
        let flow = self.live_parent(parent)?;
        let key = flow.key.clone();
        if let Shape::Collection(len) = flow.shape
            && index >= len
        {
            return Err(FlowError::IndexOutOfRange { key, index, len });
        }
        Ok(self.push(key, FlowRelation::Indexed { parent, index }, Shape::Single))
    }

    /// Binds the flow into a use.
    pub fn bind(&mut self, id: FlowId) -> Result<()> {
        let entry = self.entry_mut(id);
        if entry.state == FlowState::Released {
            return Err(FlowError::FlowReleased {
                key: entry.flow.key.clone(),
                flow: id,
            });
        }
        if entry.state == FlowState::Created {
            entry.state = FlowState::Registered;
        }
        entry.bindings += 1;
        Ok(())
    }

    pub fn mark(&mut self, id: FlowId, state: FlowState) {
        let entry = self.entry_mut(id);
        if entry.state != FlowState::Released {
            entry.state = state;
        }
    }

    /// Drops one binding, releasing the flow with the last one.
    pub fn unbind(&mut self, id: FlowId) {
        let entry = self.entry_mut(id);
        entry.bindings = entry.bindings.saturating_sub(1);
        if entry.bindings == 0 {
            entry.state = FlowState::Released;
        }
    }

    fn canonical(&self, mut id: FlowId) -> FlowId {
        while let FlowRelation::Same(parent) = self.entry(id).flow.relation {
            id = parent;
        }
        id
    }

    /// Whether `a` and `b` were built as equivalent through `Same` links.
    pub fn is_same(&self, a: FlowId, b: FlowId) -> bool {
        self.canonical(a) == self.canonical(b)
    }

    /// Whether `flow` was derived from `ancestor` through `Same`, `Next` or
    /// `Forwarding` links. Elements of a collection start a lineage of their
    /// own.
    pub fn descends(&self, ancestor: FlowId, flow: FlowId) -> bool {
        let mut id = flow;
        loop {
            if self.is_same(ancestor, id) {
                return true;
            }
            id = match self.entry(id).flow.relation {
                FlowRelation::Same(p) | FlowRelation::Next(p) | FlowRelation::Forwarding(p) => p,
                _ => return false,
            };
        }
    }

    /// Fails with [`FlowError::LineageBroken`] unless `next` descends from
    /// `previous`.
    pub fn check_lineage(&self, previous: FlowId, next: FlowId) -> Result<()> {
        if self.descends(previous, next) {
            Ok(())
        } else {
            Err(FlowError::LineageBroken {
                key: self.get(next).key.clone(),
                expected: previous,
                found: next,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key;

    fn table_with_initial() -> (FlowTable, FlowId) {
        let mut table = FlowTable::new();
        let initial = table.initial(key!("h"), Shape::Single);
        table.bind(initial).unwrap();
        (table, initial)
    }

    #[test]
    fn test_same_is_structural() {
        let (mut table, initial) = table_with_initial();
        let a = table.same(initial).unwrap();
        let b = table.same(a).unwrap();
        let other = table.initial(key!("h"), Shape::Single);

        assert!(table.is_same(initial, b));
        assert!(!table.is_same(initial, other));
    }

    #[test]
    fn test_next_only_once() {
        let (mut table, initial) = table_with_initial();
        let next = table.next(initial).unwrap();
        assert!(!table.is_same(initial, next));
        assert!(matches!(
            table.next(initial),
            Err(FlowError::DoubleAdvance { .. })
        ));
        // same derivations remain allowed
        assert!(table.same(initial).is_ok());
    }

    #[test]
    fn test_released_flow_cannot_derive() {
        let (mut table, initial) = table_with_initial();
        table.unbind(initial);
        assert_eq!(table.state(initial), FlowState::Released);
        assert!(matches!(
            table.same(initial),
            Err(FlowError::FlowReleased { .. })
        ));
        assert!(table.bind(initial).is_err());
    }

    #[test]
    fn test_lifecycle_states() {
        let mut table = FlowTable::new();
        let f = table.initial(key!("h"), Shape::Single);
        assert_eq!(table.state(f), FlowState::Created);
        table.bind(f).unwrap();
        table.bind(f).unwrap();
        assert_eq!(table.state(f), FlowState::Registered);
        table.mark(f, FlowState::InUse);
        table.unbind(f);
        assert_eq!(table.state(f), FlowState::InUse);
        table.unbind(f);
        assert_eq!(table.state(f), FlowState::Released);
    }

    #[test]
    fn test_lineage_check() {
        let (mut table, initial) = table_with_initial();
        let same = table.same(initial).unwrap();
        let forwarded = table.forwarding(initial).unwrap();
        let next = table.next(forwarded).unwrap();
        let other = table.initial(key!("h"), Shape::Single);

        assert!(table.check_lineage(initial, same).is_ok());
        assert!(table.check_lineage(initial, forwarded).is_ok());
        assert!(table.check_lineage(initial, next).is_ok());
        assert!(table.check_lineage(same, next).is_ok());
        assert!(matches!(
            table.check_lineage(next, initial),
            Err(FlowError::LineageBroken { .. })
        ));
        assert!(matches!(
            table.check_lineage(initial, other),
            Err(FlowError::LineageBroken { .. })
        ));
    }

    #[test]
    fn test_indexed_bounds() {
        let mut table = FlowTable::new();
        let c = table.initial(key!("c"), Shape::Collection(4));
        table.bind(c).unwrap();
        assert!(table.indexed(c, 3).is_ok());
        assert!(matches!(
            table.indexed(c, 4),
            Err(FlowError::IndexOutOfRange { index: 4, len: 4, .. })
        ));
    }
}
