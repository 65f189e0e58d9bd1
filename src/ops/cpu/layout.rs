//! Data-movement kernels: concatenation, slicing and one-hot encoding.

use crate::error::{Error, Result};
use crate::ndarray::shape::strides;

/// Joins `a` and `b` along `axis`; both shapes were already validated.
#[must_use]
pub fn concat(a: &[f32], a_shape: &[usize], b: &[f32], b_shape: &[usize], axis: usize) -> Vec<f32> {
    let outer: usize = a_shape[..axis].iter().product();
    let a_block: usize = a_shape[axis..].iter().product();
    let b_block: usize = b_shape[axis..].iter().product();
    let mut out = Vec::with_capacity(a.len() + b.len());
    for o in 0..outer {
        out.extend_from_slice(&a[o * a_block..(o + 1) * a_block]);
        out.extend_from_slice(&b[o * b_block..(o + 1) * b_block]);
    }
    out
}

/// Copies the window `[begin, begin + size)` out of `x`.
#[must_use]
pub fn slice(x: &[f32], shape: &[usize], begin: &[usize], size: &[usize]) -> Vec<f32> {
    let total: usize = size.iter().product();
    let src_strides = strides(shape);
    let dst_strides = strides(size);
    let mut out = Vec::with_capacity(total);
    for flat in 0..total {
        let mut offset = 0;
        let mut rem = flat;
        for ((&ds, &ss), &b) in dst_strides.iter().zip(&src_strides).zip(begin) {
            offset += (rem / ds + b) * ss;
            rem %= ds;
        }
        out.push(x[offset]);
    }
    out
}

/// Writes `window` (shaped `size`) into a zero buffer shaped `shape` at
/// `begin`. The inverse placement of [`slice`].
#[must_use]
pub fn scatter(window: &[f32], size: &[usize], shape: &[usize], begin: &[usize]) -> Vec<f32> {
    let dst_strides = strides(shape);
    let src_strides = strides(size);
    let mut out = vec![0.0; shape.iter().product()];
    for (flat, &v) in window.iter().enumerate() {
        let mut offset = 0;
        let mut rem = flat;
        for ((&ss, &ds), &b) in src_strides.iter().zip(&dst_strides).zip(begin) {
            offset += (rem / ss + b) * ds;
            rem %= ss;
        }
        out[offset] = v;
    }
    out
}

/// Encodes each index as a row of `depth` values.
///
/// # Errors
///
/// [`Error::IndexOutOfRange`] if an index is not an integer in `[0, depth)`.
pub fn one_hot(indices: &[f32], depth: usize, on: f32, off: f32) -> Result<Vec<f32>> {
    let mut out = vec![off; indices.len() * depth];
    for (row, &v) in indices.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let index = v.floor() as i64;
        if !v.is_finite() || index < 0 || index as usize >= depth {
            return Err(Error::IndexOutOfRange { index, bound: depth });
        }
        out[row * depth + index as usize] = on;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_rows_and_columns() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0];
        assert_eq!(concat(&a, &[2, 2], &b, &[2, 1], 1), vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
        assert_eq!(concat(&a, &[2, 2], &b, &[1, 2], 0), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn slice_window() {
        let x: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let window = slice(&x, &[3, 4], &[1, 1], &[2, 2]);
        assert_eq!(window, vec![5.0, 6.0, 9.0, 10.0]);
        let placed = scatter(&window, &[2, 2], &[3, 4], &[1, 1]);
        assert_eq!(placed.iter().sum::<f32>(), 30.0);
        assert_eq!(placed[5], 5.0);
        assert_eq!(placed[0], 0.0);
    }

    #[test]
    fn one_hot_rejects_out_of_range() {
        assert_eq!(one_hot(&[2.0, 0.0], 3, 1.0, 0.0).unwrap(), vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        assert!(matches!(
            one_hot(&[3.0], 3, 1.0, 0.0),
            Err(Error::IndexOutOfRange { index: 3, bound: 3 })
        ));
        assert!(one_hot(&[-1.0], 3, 1.0, 0.0).is_err());
    }
}
