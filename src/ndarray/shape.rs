//! Shape arithmetic: element counts, row-major strides and the
//! shape-compatibility rules shared by every backend.

use crate::error::{Error, Result};

/// Total number of elements described by `shape`.
#[must_use]
pub fn size_of(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides for `shape`.
#[must_use]
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Flat row-major offset of a multi-index.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if the index rank differs from the shape rank,
/// [`Error::IndexOutOfRange`] if any coordinate is past its axis.
pub fn flat_index(shape: &[usize], index: &[usize]) -> Result<usize> {
    if shape.len() != index.len() {
        return Err(Error::shape("index", shape, index));
    }
    let mut offset = 0;
    for ((&dim, &i), stride) in shape.iter().zip(index).zip(strides(shape)) {
        if i >= dim {
            return Err(Error::IndexOutOfRange {
                index: i as i64,
                bound: dim,
            });
        }
        offset += i * stride;
    }
    Ok(offset)
}

/// How two operands of an elementwise op line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broadcast {
    /// Identical shapes.
    Same,
    /// Left operand holds a single element.
    ScalarLhs,
    /// Right operand holds a single element.
    ScalarRhs,
    /// Left is `[m, cols]`, right is a `[cols]` row repeated over `m` rows.
    RowRhs {
        /// Row length.
        cols: usize,
    },
    /// Left is a `[cols]` row, right is `[m, cols]`.
    RowLhs {
        /// Row length.
        cols: usize,
    },
}

impl Broadcast {
    /// Resolves the rule for `a ⊕ b` and the output shape.
    ///
    /// Supported pairs: identical shapes, a single-element operand, and a
    /// `[m, n]` matrix with a `[n]` vector. Everything else is rejected.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] for any other pair.
    pub fn resolve(op: &'static str, a: &[usize], b: &[usize]) -> Result<(Self, Vec<usize>)> {
        if a == b {
            return Ok((Self::Same, a.to_vec()));
        }
        // two single-element operands take the higher-rank shape
        if size_of(b) == 1 && (size_of(a) != 1 || a.len() >= b.len()) {
            return Ok((Self::ScalarRhs, a.to_vec()));
        }
        if size_of(a) == 1 {
            return Ok((Self::ScalarLhs, b.to_vec()));
        }
        match (a, b) {
            ([_, n], [cols]) if n == cols => Ok((Self::RowRhs { cols: *cols }, a.to_vec())),
            ([cols], [_, n]) if n == cols => Ok((Self::RowLhs { cols: *cols }, b.to_vec())),
            _ => Err(Error::shape(op, a, b)),
        }
    }

    /// Source offsets into `(a, b)` for output element `i`.
    #[must_use]
    pub const fn offsets(self, i: usize) -> (usize, usize) {
        match self {
            Self::Same => (i, i),
            Self::ScalarLhs => (0, i),
            Self::ScalarRhs => (i, 0),
            Self::RowRhs { cols } => (i, i % cols),
            Self::RowLhs { cols } => (i % cols, i),
        }
    }
}

/// Output shape of `concat(a, b, axis)`.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] when ranks differ, `axis` is past the rank, or
/// any other axis disagrees.
pub fn concat_shape(a: &[usize], b: &[usize], axis: usize) -> Result<Vec<usize>> {
    if a.len() != b.len() || axis >= a.len() {
        return Err(Error::shape("concat", a, b));
    }
    for (i, (&x, &y)) in a.iter().zip(b).enumerate() {
        if i != axis && x != y {
            return Err(Error::shape("concat", a, b));
        }
    }
    let mut out = a.to_vec();
    out[axis] += b[axis];
    Ok(out)
}

/// Validates a `slice(begin, size)` window against `shape`.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] on rank disagreement or a window running past
/// the end of an axis.
pub fn check_slice(shape: &[usize], begin: &[usize], size: &[usize]) -> Result<()> {
    if begin.len() != shape.len() || size.len() != shape.len() {
        return Err(Error::shape("slice", shape, size));
    }
    for ((&dim, &b), &s) in shape.iter().zip(begin).zip(size) {
        if b + s > dim {
            return Err(Error::shape("slice", shape, size));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_row_major() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn flat_index_checks_bounds() {
        assert_eq!(flat_index(&[2, 3], &[1, 2]).unwrap(), 5);
        assert!(matches!(
            flat_index(&[2, 3], &[2, 0]),
            Err(Error::IndexOutOfRange { index: 2, bound: 2 })
        ));
    }

    #[test]
    fn broadcast_rules() {
        assert_eq!(
            Broadcast::resolve("add", &[1, 4], &[4]).unwrap(),
            (Broadcast::RowRhs { cols: 4 }, vec![1, 4])
        );
        assert_eq!(
            Broadcast::resolve("add", &[], &[3]).unwrap(),
            (Broadcast::ScalarLhs, vec![3])
        );
        assert!(Broadcast::resolve("add", &[2, 3], &[3, 2]).is_err());
        assert_eq!(Broadcast::resolve("add", &[1], &[1, 1]).unwrap().1, vec![1, 1]);
        assert_eq!(Broadcast::resolve("add", &[1, 1], &[1]).unwrap().1, vec![1, 1]);
    }
}
