//! Index ranges and the mappings that translate between an outer index space
//! (the tasks of a concurrent group) and the index space of a collection.
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A pure translation between index spaces.
///
/// `map_forward` picks the inner element an outer index touches, or `None`
/// when the outer index falls outside the mapping. `map_backward` lists every outer index that lands on an inner element, and
/// must contain `i` for every `i` mapped forward onto it.
pub trait IndexMapping: Debug + Send + Sync {
    fn map_forward(&self, outer: usize) -> Option<usize>;

    fn map_backward(&self, inner: usize) -> Vec<usize>;

    /// Whether a mapping can be inverted to a single index on every element.
    fn is_injective(&self) -> bool {
        false
    }
}

/// Shared handle to a mapping stored on a collection.
pub type MappingRef = Arc<dyn IndexMapping>;

/// Extension methods for composing mappings.
pub trait MappingExt: IndexMapping + Sized + 'static {
    /// Applies `self` first, then `next`.
    fn then<M: IndexMapping + 'static>(self, next: M) -> Composite {
        Composite::new(Arc::new(self), Arc::new(next))
    }
}

impl<M: IndexMapping + 'static> MappingExt for M {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity;

impl IndexMapping for Identity {
    fn map_forward(&self, outer: usize) -> Option<usize> {
        Some(outer)
    }

    fn map_backward(&self, inner: usize) -> Vec<usize> {
        vec![inner]
    }

    fn is_injective(&self) -> bool {
        true
    }
}

/// `i ↦ len - 1 - i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reverse {
    pub len: usize,
}

impl Reverse {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl IndexMapping for Reverse {
    fn map_forward(&self, outer: usize) -> Option<usize> {
        self.len.checked_sub(outer.checked_add(1)?)
    }

    fn map_backward(&self, inner: usize) -> Vec<usize> {
        self.map_forward(inner).into_iter().collect()
    }

    fn is_injective(&self) -> bool {
        true
    }
}

/// Groups `factor` consecutive outer indices onto one inner element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub factor: usize,
}

impl Block {
    pub fn new(factor: usize) -> Self {
        Self {
            factor: factor.max(1),
        }
    }
}

impl IndexMapping for Block {
    fn map_forward(&self, outer: usize) -> Option<usize> {
        Some(outer / self.factor)
    }

    fn map_backward(&self, inner: usize) -> Vec<usize> {
        (inner * self.factor..(inner + 1) * self.factor).collect()
    }

    fn is_injective(&self) -> bool {
        self.factor == 1
    }
}

/// `second(first(i))`.
#[derive(Debug, Clone)]
pub struct Composite {
    first: MappingRef,
    second: MappingRef,
}

impl Composite {
    pub fn new(first: MappingRef, second: MappingRef) -> Self {
        Self { first, second }
    }
}

impl IndexMapping for Composite {
    fn map_forward(&self, outer: usize) -> Option<usize> {
        self.second.map_forward(self.first.map_forward(outer)?)
    }

    fn map_backward(&self, inner: usize) -> Vec<usize> {
        let mut outer: Vec<usize> = self
            .second
            .map_backward(inner)
            .into_iter()
            .flat_map(|middle| self.first.map_backward(middle))
            .collect();
        outer.sort_unstable();
        outer.dedup();
        outer
    }

    fn is_injective(&self) -> bool {
        self.first.is_injective() && self.second.is_injective()
    }
}

/// Composes an optional existing mapping with a new one.
pub(crate) fn compose(existing: Option<&MappingRef>, next: MappingRef) -> MappingRef {
    match existing {
        Some(first) => Arc::new(Composite::new(first.clone(), next)),
        None => next,
    }
}

/// An index space with a linear numbering of its points.
pub trait IndexRange: Debug + Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IndexRange for usize {
    fn len(&self) -> usize {
        *self
    }
}

/// Indices `begin..end`, numbered from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range1d {
    pub begin: usize,
    pub end: usize,
}

impl Range1d {
    pub fn new(begin: usize, end: usize) -> Self {
        Self {
            begin,
            end: end.max(begin),
        }
    }

    pub fn upto(end: usize) -> Self {
        Self::new(0, end)
    }

    /// The absolute index of the `offset`-th point.
    pub fn at(&self, offset: usize) -> usize {
        self.begin + offset
    }

    pub fn offset_of(&self, index: usize) -> Option<usize> {
        (self.begin..self.end).contains(&index).then(|| index - self.begin)
    }
}

impl IndexRange for Range1d {
    fn len(&self) -> usize {
        self.end - self.begin
    }
}

/// A rectangle of `rows × cols` points numbered in row-major order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range2d {
    pub rows: Range1d,
    pub cols: Range1d,
}

impl Range2d {
    pub fn new(rows: Range1d, cols: Range1d) -> Self {
        Self { rows, cols }
    }

    pub fn linearize(&self, row: usize, col: usize) -> Option<usize> {
        let r = self.rows.offset_of(row)?;
        let c = self.cols.offset_of(col)?;
        Some(r * self.cols.len() + c)
    }

    pub fn delinearize(&self, offset: usize) -> Option<(usize, usize)> {
        let width = self.cols.len();
        if width == 0 || offset >= self.len() {
            return None;
        }
        Some((self.rows.at(offset / width), self.cols.at(offset % width)))
    }
}

impl IndexRange for Range2d {
    fn len(&self) -> usize {
        self.rows.len() * self.cols.len()
    }
}

/// Maps a 2d range onto its transpose, so a task at `(r, c)` touches the
/// element at `(c, r)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transpose {
    pub outer: Range2d,
}

impl Transpose {
    fn inner(&self) -> Range2d {
        Range2d::new(self.outer.cols, self.outer.rows)
    }
}

impl IndexMapping for Transpose {
    fn map_forward(&self, outer: usize) -> Option<usize> {
        let (row, col) = self.outer.delinearize(outer)?;
        self.inner().linearize(col, row)
    }

    fn map_backward(&self, inner: usize) -> Vec<usize> {
        self.inner()
            .delinearize(inner)
            .and_then(|(row, col)| self.outer.linearize(col, row))
            .into_iter()
            .collect()
    }

    fn is_injective(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trips(mapping: &dyn IndexMapping, domain: usize) {
        for i in 0..domain {
            let inner = mapping.map_forward(i).unwrap();
            let back = mapping.map_backward(inner);
            assert!(back.contains(&i), "{mapping:?}: {i} -> {back:?}");
        }
    }

    #[test]
    fn test_round_trip_identity() {
        round_trips(&Identity, 16);
    }

    #[test]
    fn test_round_trip_reverse() {
        let reverse = Reverse::new(8);
        round_trips(&reverse, 8);
        assert_eq!(reverse.map_forward(0), Some(7));
    }

    #[test]
    fn test_reverse_outside_its_length() {
        let reverse = Reverse::new(4);
        assert_eq!(reverse.map_forward(3), Some(0));
        assert_eq!(reverse.map_forward(4), None);
        assert_eq!(reverse.map_forward(usize::MAX), None);
        assert!(reverse.map_backward(4).is_empty());
        assert_eq!(Reverse::new(0).map_forward(0), None);
        assert_eq!(Reverse::new(4).then(Identity).map_forward(9), None);
    }

    #[test]
    fn test_round_trip_block() {
        let block = Block::new(3);
        round_trips(&block, 12);
        assert_eq!(block.map_forward(5), Some(1));
        assert_eq!(block.map_backward(1), vec![3, 4, 5]);
        assert!(!block.is_injective());
    }

    #[test]
    fn test_composite() {
        let composed = Reverse::new(4).then(Block::new(2));
        // 0 -> 3 -> 1
        assert_eq!(composed.map_forward(0), Some(1));
        assert_eq!(composed.map_backward(1), vec![0, 1]);
        round_trips(&composed, 4);
        assert!(!composed.is_injective());
        assert!(Identity.then(Reverse::new(4)).is_injective());
    }

    #[test]
    fn test_ranges() {
        let range = Range1d::new(2, 6);
        assert_eq!(range.len(), 4);
        assert_eq!(range.at(1), 3);
        assert_eq!(range.offset_of(6), None);

        let grid = Range2d::new(Range1d::upto(2), Range1d::upto(3));
        assert_eq!(grid.len(), 6);
        assert_eq!(grid.linearize(1, 2), Some(5));
        assert_eq!(grid.delinearize(4), Some((1, 1)));
        assert_eq!(grid.delinearize(6), None);
    }

    #[test]
    fn test_transpose() {
        let grid = Range2d::new(Range1d::upto(2), Range1d::upto(3));
        let transpose = Transpose { outer: grid };
        // (0, 1) -> (1, 0) in a 3x2 grid
        assert_eq!(transpose.map_forward(1), Some(2));
        assert_eq!(transpose.map_forward(6), None);
        round_trips(&transpose, grid.len());
    }
}
