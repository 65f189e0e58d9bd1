//! Categorical sampling.

use crate::error::{Error, Result};
use rand::{Rng, RngCore};

/// Validates one row of weights and returns its total.
fn row_total(row: &[f32]) -> Result<f32> {
    if let Some(bad) = row.iter().find(|v| !v.is_finite() || **v < 0.0) {
        return Err(Error::InvalidDistribution(format!("weight {bad} is negative or not finite")));
    }
    let total: f32 = row.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return Err(Error::InvalidDistribution(format!("weights sum to {total}")));
    }
    Ok(total)
}

/// Draws `num_samples` indices from each row of `cols` weights.
///
/// Rows are renormalised, so weights only need to be proportional to the
/// desired probabilities.
///
/// # Errors
///
/// [`Error::InvalidDistribution`] for negative or non-finite weights, or a
/// row summing to zero.
pub fn multinomial(probs: &[f32], cols: usize, num_samples: usize, rng: &mut dyn RngCore) -> Result<Vec<f32>> {
    let mut out = Vec::with_capacity(probs.len() / cols.max(1) * num_samples);
    for row in probs.chunks(cols) {
        let total = row_total(row)?;
        for _ in 0..num_samples {
            let target = rng.random::<f32>() * total;
            let mut acc = 0.0;
            // Falls through to the last non-zero weight on rounding.
            let mut pick = row.iter().rposition(|&p| p > 0.0).unwrap_or(0);
            for (i, &p) in row.iter().enumerate() {
                acc += p;
                if target < acc {
                    pick = i;
                    break;
                }
            }
            out.push(pick as f32);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn never_picks_zero_weight() {
        let mut rng = StdRng::seed_from_u64(7);
        let draws = multinomial(&[0.0, 2.0, 0.0, 2.0], 4, 200, &mut rng).unwrap();
        assert!(draws.iter().all(|&d| d == 1.0 || d == 3.0));
    }

    #[test]
    fn rejects_bad_rows() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(multinomial(&[0.0, 0.0], 2, 1, &mut rng).is_err());
        assert!(multinomial(&[-0.1, 1.1], 2, 1, &mut rng).is_err());
        assert!(multinomial(&[f32::NAN, 1.0], 2, 1, &mut rng).is_err());
    }
}
