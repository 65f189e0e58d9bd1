//! Reductions over all elements or a single axis.

use crate::backend::ReduceOp;
use rayon::prelude::*;

fn fold(op: ReduceOp, values: impl Iterator<Item = f32>) -> f32 {
    match op {
        ReduceOp::Sum => values.sum(),
        ReduceOp::Max => values.fold(f32::NEG_INFINITY, f32::max),
    }
}

/// Splits `shape` around `axis` into `(outer, axis_len, inner)`.
#[must_use]
pub fn split_axis(shape: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    (outer, shape[axis], inner)
}

/// Reduces every element to one value.
#[must_use]
pub fn reduce_all(op: ReduceOp, x: &[f32]) -> f32 {
    match op {
        ReduceOp::Sum => x.par_iter().sum(),
        ReduceOp::Max => x.par_iter().copied().reduce(|| f32::NEG_INFINITY, f32::max),
    }
}

/// Reduces the middle axis of an `(outer, len, inner)` view.
#[must_use]
pub fn reduce_axis(op: ReduceOp, x: &[f32], (outer, len, inner): (usize, usize, usize)) -> Vec<f32> {
    (0..outer * inner)
        .into_par_iter()
        .map(|o| {
            let (i, j) = (o / inner, o % inner);
            fold(op, (0..len).map(|a| x[(i * len + a) * inner + j]))
        })
        .collect()
}

/// Repeats each reduced value back along the removed axis; the adjoint of
/// a sum over that axis.
#[must_use]
pub fn broadcast_axis(reduced: &[f32], (outer, len, inner): (usize, usize, usize)) -> Vec<f32> {
    let mut out = Vec::with_capacity(outer * len * inner);
    for o in 0..outer {
        let row = &reduced[o * inner..(o + 1) * inner];
        for _ in 0..len {
            out.extend_from_slice(row);
        }
    }
    out
}

/// Position of the first maximum in each row of `cols` elements.
#[must_use]
pub fn arg_max_rows(x: &[f32], cols: usize) -> Vec<f32> {
    x.par_chunks(cols)
        .map(|row| {
            let mut best = 0;
            for (i, &v) in row.iter().enumerate() {
                if v > row[best] {
                    best = i;
                }
            }
            best as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_reduction_on_matrix() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(reduce_axis(ReduceOp::Sum, &x, split_axis(&[2, 3], 0)), vec![5.0, 7.0, 9.0]);
        assert_eq!(reduce_axis(ReduceOp::Max, &x, split_axis(&[2, 3], 1)), vec![3.0, 6.0]);
        assert_eq!(reduce_all(ReduceOp::Sum, &x), 21.0);
        assert_eq!(broadcast_axis(&[1.0, 2.0], split_axis(&[2, 3], 1)), vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn arg_max_takes_first_tie() {
        assert_eq!(arg_max_rows(&[1.0, 3.0, 3.0, 0.0, -1.0, -2.0], 3), vec![1.0, 0.0]);
    }
}
