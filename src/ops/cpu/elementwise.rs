//! Elementwise kernels: unary maps, broadcast binary ops and clipping.

use crate::backend::{BinaryOp, UnaryOp};
use crate::ndarray::shape::Broadcast;
use rayon::prelude::*;

/// Below this many elements the kernels stay on the calling thread.
const PARALLEL_THRESHOLD: usize = 1 << 12;

/// Applies `op` to every element.
#[must_use]
pub fn unary(op: UnaryOp, x: &[f32]) -> Vec<f32> {
    if x.len() < PARALLEL_THRESHOLD {
        x.iter().map(|&v| op.apply(v)).collect()
    } else {
        x.par_iter().map(|&v| op.apply(v)).collect()
    }
}

/// Computes `a ⊕ b` into a fresh buffer of `len` elements.
#[must_use]
pub fn binary(op: BinaryOp, rule: Broadcast, a: &[f32], b: &[f32], len: usize) -> Vec<f32> {
    let kernel = |i: usize| {
        let (ia, ib) = rule.offsets(i);
        op.apply(a[ia], b[ib])
    };
    if len < PARALLEL_THRESHOLD {
        (0..len).map(kernel).collect()
    } else {
        (0..len).into_par_iter().map(kernel).collect()
    }
}

/// Clamps every element into `[min, max]`.
#[must_use]
pub fn clip(x: &[f32], min: f32, max: f32) -> Vec<f32> {
    if x.len() < PARALLEL_THRESHOLD {
        x.iter().map(|&v| v.clamp(min, max)).collect()
    } else {
        x.par_iter().map(|&v| v.clamp(min, max)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_broadcast_repeats_rhs() {
        let out = binary(BinaryOp::Add, Broadcast::RowRhs { cols: 2 }, &[1.0, 2.0, 3.0, 4.0], &[10.0, 20.0], 4);
        assert_eq!(out, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn step_is_strict() {
        assert_eq!(unary(UnaryOp::Step, &[-1.0, 0.0, 0.5]), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn large_inputs_match_sequential() {
        let x: Vec<f32> = (0..10_000).map(|i| i as f32 * 0.001 - 5.0).collect();
        let par = unary(UnaryOp::Tanh, &x);
        assert!(par.iter().zip(&x).all(|(p, v)| (p - v.tanh()).abs() < 1e-6));
    }
}
