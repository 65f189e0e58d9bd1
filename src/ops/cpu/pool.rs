//! Max and average pooling over NHWC buffers, with their gradients.

use crate::backend::PoolKind;
use crate::conv_util::Conv2DInfo;
use rayon::prelude::*;

/// Input offset of the first maximum in one window, if the window is non-empty.
fn argmax_in_window(x: &[f32], info: &Conv2DInfo, b: usize, yr: usize, yc: usize, d: usize) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for r in info.rows(yr) {
        for c in info.cols(yc) {
            let at = info.in_offset(b, r, c, d);
            if best.is_none_or(|(_, v)| x[at] > v) {
                best = Some((at, x[at]));
            }
        }
    }
    best.map(|(at, _)| at)
}

fn window_len(info: &Conv2DInfo, yr: usize, yc: usize) -> usize {
    info.rows(yr).len() * info.cols(yc).len()
}

/// Decomposes a flat output offset into `(b, yr, yc, d)`.
fn out_coords(info: &Conv2DInfo, flat: usize) -> (usize, usize, usize, usize) {
    let d = flat % info.out_channels;
    let rest = flat / info.out_channels;
    let yc = rest % info.out_width;
    let rest = rest / info.out_width;
    (rest / info.out_height, rest % info.out_height, yc, d)
}

fn out_len(info: &Conv2DInfo) -> usize {
    info.out_shape().iter().product()
}

/// Forward pooling.
#[must_use]
pub fn pool(kind: PoolKind, x: &[f32], info: &Conv2DInfo) -> Vec<f32> {
    (0..out_len(info))
        .into_par_iter()
        .map(|flat| {
            let (b, yr, yc, d) = out_coords(info, flat);
            match kind {
                PoolKind::Max => argmax_in_window(x, info, b, yr, yc, d).map_or(0.0, |at| x[at]),
                PoolKind::Avg => {
                    let count = window_len(info, yr, yc);
                    if count == 0 {
                        return 0.0;
                    }
                    let mut sum = 0.0;
                    for r in info.rows(yr) {
                        for c in info.cols(yc) {
                            sum += x[info.in_offset(b, r, c, d)];
                        }
                    }
                    sum / count as f32
                }
            }
        })
        .collect()
}

/// Routes `dy` back onto the input positions each window read from.
///
/// Max pooling sends each window's gradient to its first maximum; average
/// pooling spreads it evenly over the window's valid positions. `x` is only
/// read for max pooling.
#[must_use]
pub fn pool_backprop(kind: PoolKind, dy: &[f32], x: &[f32], info: &Conv2DInfo) -> Vec<f32> {
    let mut dx = vec![0.0; info.in_shape().iter().product()];
    for (flat, &g) in dy.iter().enumerate() {
        let (b, yr, yc, d) = out_coords(info, flat);
        match kind {
            PoolKind::Max => {
                if let Some(at) = argmax_in_window(x, info, b, yr, yc, d) {
                    dx[at] += g;
                }
            }
            PoolKind::Avg => {
                let count = window_len(info, yr, yc);
                if count == 0 {
                    continue;
                }
                let share = g / count as f32;
                for r in info.rows(yr) {
                    for c in info.cols(yc) {
                        dx[info.in_offset(b, r, c, d)] += share;
                    }
                }
            }
        }
    }
    dx
}

/// Reads `values` at each max-pooling window's argmax in `x`.
///
/// This is the adjoint of max-pool backprop with respect to `dy`.
#[must_use]
pub fn max_pool_positions(values: &[f32], x: &[f32], info: &Conv2DInfo) -> Vec<f32> {
    (0..out_len(info))
        .into_par_iter()
        .map(|flat| {
            let (b, yr, yc, d) = out_coords(info, flat);
            argmax_in_window(x, info, b, yr, yc, d).map_or(0.0, |at| values[at])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv_util::{Padding, compute_pool2d_info};

    fn info_2x2() -> Conv2DInfo {
        compute_pool2d_info(&[1, 4, 4, 1], [2, 2], [2, 2], Padding::Valid).unwrap()
    }

    #[test]
    fn max_and_avg_forward() {
        let x: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let info = info_2x2();
        assert_eq!(pool(PoolKind::Max, &x, &info), vec![5.0, 7.0, 13.0, 15.0]);
        assert_eq!(pool(PoolKind::Avg, &x, &info), vec![2.5, 4.5, 10.5, 12.5]);
    }

    #[test]
    fn max_backprop_hits_argmax_only() {
        let x: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let info = info_2x2();
        let dx = pool_backprop(PoolKind::Max, &[1.0, 2.0, 3.0, 4.0], &x, &info);
        assert_eq!(dx[5], 1.0);
        assert_eq!(dx[15], 4.0);
        assert_eq!(dx.iter().sum::<f32>(), 10.0);
        assert_eq!(max_pool_positions(&dx, &x, &info), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn out_coords_inverts_out_offset() {
        let info = compute_pool2d_info(&[2, 5, 4, 3], [2, 2], [2, 1], Padding::Same).unwrap();
        for flat in 0..out_len(&info) {
            let (b, yr, yc, d) = out_coords(&info, flat);
            assert_eq!(info.out_offset(b, yr, yc, d), flat);
        }
    }
}
