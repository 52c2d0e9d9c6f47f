//! Collective reductions over a collection.
use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::Key;
use crate::usage::Dynamic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Product,
    Min,
    Max,
}

/// A value that can be combined by every [`ReduceOp`].
pub trait Reducible: Clone + Send + Sync + 'static {
    fn identity(op: ReduceOp) -> Self;

    /// `None` when the result does not fit in `Self`.
    fn combine(op: ReduceOp, a: Self, b: Self) -> Option<Self>;
}

macro_rules! impl_reducible_int {
    ($($t:ty),+) => {
        $(
            impl Reducible for $t {
                fn identity(op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => 0,
                        ReduceOp::Product => 1,
                        ReduceOp::Min => <$t>::MAX,
                        ReduceOp::Max => <$t>::MIN,
                    }
                }

                fn combine(op: ReduceOp, a: Self, b: Self) -> Option<Self> {
                    match op {
                        ReduceOp::Sum => a.checked_add(b),
                        ReduceOp::Product => a.checked_mul(b),
                        ReduceOp::Min => Some(a.min(b)),
                        ReduceOp::Max => Some(a.max(b)),
                    }
                }
            }
        )+
    };
}

macro_rules! impl_reducible_float {
    ($($t:ty),+) => {
        $(
            impl Reducible for $t {
                fn identity(op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => 0.0,
                        ReduceOp::Product => 1.0,
                        ReduceOp::Min => <$t>::MAX,
                        ReduceOp::Max => <$t>::MIN,
                    }
                }

                fn combine(op: ReduceOp, a: Self, b: Self) -> Option<Self> {
                    Some(match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Product => a * b,
                        ReduceOp::Min => if b < a { b } else { a },
                        ReduceOp::Max => if b > a { b } else { a },
                    })
                }
            }
        )+
    };
}

impl_reducible_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);
impl_reducible_float!(f32, f64);

/// Options for [`Context::reduce`](crate::Context::reduce).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceOptions {
    pub op: ReduceOp,
    /// Tells apart several reductions into the same key.
    pub tag: Key,
    /// Carried to the backend, not interpreted.
    pub piece: usize,
    /// Carried to the backend, not interpreted.
    pub n_pieces: usize,
}

impl Default for ReduceOptions {
    fn default() -> Self {
        Self {
            op: ReduceOp::Sum,
            tag: Key::empty(),
            piece: 0,
            n_pieces: 1,
        }
    }
}

impl ReduceOptions {
    pub fn op(op: ReduceOp) -> Self {
        Self {
            op,
            ..Default::default()
        }
    }

    pub fn tag(mut self, tag: impl Into<Key>) -> Self {
        self.tag = tag.into();
        self
    }
}

/// Why combining the pieces of a reduction failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CombineError {
    #[error("element {0} was never written")]
    Missing(usize),

    #[error("element {index} is not a {expected}")]
    WrongType { index: usize, expected: &'static str },

    #[error("{op:?} of the elements overflows {ty}")]
    Overflow { op: ReduceOp, ty: &'static str },
}

pub type Combiner = Arc<dyn Fn(&[Option<Dynamic>]) -> Result<Dynamic, CombineError> + Send + Sync>;

/// What the backend learns about a reduction.
#[derive(Clone)]
pub struct ReduceDetails {
    pub op: ReduceOp,
    pub tag: Key,
    pub piece: usize,
    pub n_pieces: usize,
    pub combine: Combiner,
}

impl fmt::Debug for ReduceDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReduceDetails")
            .field("op", &self.op)
            .field("tag", &self.tag)
            .field("piece", &self.piece)
            .field("n_pieces", &self.n_pieces)
            .finish_non_exhaustive()
    }
}

impl ReduceDetails {
    pub(crate) fn new<T: Reducible>(options: ReduceOptions) -> Self {
        let op = options.op;
        Self {
            op,
            tag: options.tag,
            piece: options.piece,
            n_pieces: options.n_pieces,
            combine: Arc::new(move |pieces: &[Option<Dynamic>]| combine::<T>(op, pieces)),
        }
    }
}

fn combine<T: Reducible>(op: ReduceOp, pieces: &[Option<Dynamic>]) -> Result<Dynamic, CombineError> {
    let values = pieces
        .par_iter()
        .enumerate()
        .map(|(index, piece)| {
            let piece = piece.as_ref().ok_or(CombineError::Missing(index))?;
            piece
                .downcast_ref::<T>()
                .cloned()
                .ok_or(CombineError::WrongType {
                    index,
                    expected: type_name::<T>(),
                })
        })
        .collect::<Result<Vec<T>, _>>()?;

    let total = values.into_par_iter().map(Ok).try_reduce(
        || T::identity(op),
        |a, b| {
            T::combine(op, a, b).ok_or(CombineError::Overflow {
                op,
                ty: type_name::<T>(),
            })
        },
    )?;

    Ok(Arc::new(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pieces<T: Send + Sync + 'static>(values: Vec<T>) -> Vec<Option<Dynamic>> {
        values
            .into_iter()
            .map(|v| Some(Arc::new(v) as Dynamic))
            .collect()
    }

    #[test]
    fn test_operators() {
        let input = pieces(vec![3_i64, 1, 4, 1, 5]);
        let run = |op| {
            let details = ReduceDetails::new::<i64>(ReduceOptions::op(op));
            let out = (details.combine)(&input).unwrap();
            *out.downcast_ref::<i64>().unwrap()
        };

        assert_eq!(run(ReduceOp::Sum), 14);
        assert_eq!(run(ReduceOp::Product), 60);
        assert_eq!(run(ReduceOp::Min), 1);
        assert_eq!(run(ReduceOp::Max), 5);
    }

    #[test]
    fn test_floats() {
        let details = ReduceDetails::new::<f64>(ReduceOptions::op(ReduceOp::Max));
        let out = (details.combine)(&pieces(vec![0.5_f64, -2.0, 1.5])).unwrap();
        assert_eq!(*out.downcast_ref::<f64>().unwrap(), 1.5);
    }

    #[test]
    fn test_missing_and_mistyped_pieces() {
        let details = ReduceDetails::new::<i32>(ReduceOptions::default());

        let mut input = pieces(vec![1_i32, 2]);
        input.push(None);
        assert_eq!(
            (details.combine)(&input).unwrap_err(),
            CombineError::Missing(2)
        );

        let input = pieces(vec![1_u8]);
        assert!(matches!(
            (details.combine)(&input).unwrap_err(),
            CombineError::WrongType { index: 0, .. }
        ));
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        let details = ReduceDetails::new::<u8>(ReduceOptions::op(ReduceOp::Sum));
        assert!(matches!(
            (details.combine)(&pieces(vec![200_u8, 200])).unwrap_err(),
            CombineError::Overflow { op: ReduceOp::Sum, .. }
        ));

        let details = ReduceDetails::new::<i32>(ReduceOptions::op(ReduceOp::Product));
        let err = (details.combine)(&pieces(vec![i32::MAX, 2])).unwrap_err();
        assert_eq!(err.to_string(), "Product of the elements overflows i32");

        let details = ReduceDetails::new::<u8>(ReduceOptions::op(ReduceOp::Max));
        let out = (details.combine)(&pieces(vec![200_u8, 255])).unwrap();
        assert_eq!(*out.downcast_ref::<u8>().unwrap(), 255);
    }

    #[test]
    fn test_empty_is_identity() {
        let details = ReduceDetails::new::<u32>(ReduceOptions::op(ReduceOp::Product));
        let out = (details.combine)(&[]).unwrap();
        assert_eq!(*out.downcast_ref::<u32>().unwrap(), 1);
    }
}
