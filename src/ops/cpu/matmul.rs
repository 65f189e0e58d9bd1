//! Matrix multiplication `C = op(A) × op(B)`.

use crate::backend::MatrixOrientation;
use rayon::prelude::*;

/// Multiplies a logical `m×k` matrix by a logical `k×n` matrix.
///
/// `a` and `b` are stored row-major; a transposed orientation reads the
/// stored matrix column-wise instead of copying it. Output rows are computed
/// in parallel.
#[must_use]
pub fn matmul(
    a: &[f32],
    b: &[f32],
    (m, k, n): (usize, usize, usize),
    a_orientation: MatrixOrientation,
    b_orientation: MatrixOrientation,
) -> Vec<f32> {
    let a_at = |i: usize, l: usize| match a_orientation {
        MatrixOrientation::Regular => a[i * k + l],
        MatrixOrientation::Transposed => a[l * m + i],
    };
    let b_at = |l: usize, j: usize| match b_orientation {
        MatrixOrientation::Regular => b[l * n + j],
        MatrixOrientation::Transposed => b[j * k + l],
    };

    let mut out = vec![0.0; m * n];
    if n == 0 {
        return out;
    }
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for (j, cell) in row.iter_mut().enumerate() {
            let mut sum = 0.0;
            for l in 0..k {
                sum += a_at(i, l) * b_at(l, j);
            }
            *cell = sum;
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use MatrixOrientation::{Regular, Transposed};

    #[test]
    fn orientations_agree() {
        // A = [[1, 2, 3], [4, 5, 6]], B = Aᵀ
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let aat = matmul(&a, &a, (2, 3, 2), Regular, Transposed);
        assert_eq!(aat, vec![14.0, 32.0, 32.0, 77.0]);
        let ata = matmul(&a, &a, (3, 2, 3), Transposed, Regular);
        assert_eq!(ata, vec![17.0, 22.0, 27.0, 22.0, 29.0, 36.0, 27.0, 36.0, 45.0]);
    }
}
