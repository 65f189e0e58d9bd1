//! Pooling ops and their gradients.
//!
//! Both the forward passes and the backprop passes are recorded, so second
//! order gradients flow: the gradient of max-pool backprop with respect to
//! `dy` reads the incoming gradient at each window's argmax, and the one of
//! average-pool backprop is average pooling of the incoming gradient.

use super::Math;
use crate::backend::PoolKind;
use crate::conv_util::{Conv2DInfo, Padding, compute_pool2d_info};
use crate::error::Result;
use crate::ndarray::NDArray;
use crate::tape::{InputGradients, KernelArgs, KernelNode};

impl Math {
    fn pool_op(&self, kind: PoolKind, x: &NDArray, info: Conv2DInfo) -> Result<NDArray> {
        let y = self.adopt(self.backend.pool(kind, x, &info)?);
        self.record(|| {
            let x = x.clone();
            let name = match kind {
                PoolKind::Max => "max_pool",
                PoolKind::Avg => "avg_pool",
            };
            let args = KernelArgs::Pool {
                kind,
                info: info.clone(),
            };
            KernelNode::new(name, vec![("x", x.clone())], args, y.clone(), move |dy, _| {
                let (dy, x, info) = (dy.clone(), x.clone(), info.clone());
                InputGradients::new().with("x", move |m| m.pool_backprop(kind, &dy, &x, &info))
            })
        })?;
        Ok(y)
    }

    /// Max pooling over an NHWC array.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`](crate::error::Error::ShapeMismatch) unless `x`
    /// is rank 4 and the window fits.
    pub fn max_pool(&self, x: &NDArray, filter: [usize; 2], strides: [usize; 2], padding: Padding) -> Result<NDArray> {
        let info = compute_pool2d_info(x.shape(), filter, strides, padding)?;
        self.pool_op(PoolKind::Max, x, info)
    }

    /// Average pooling over an NHWC array. Padded positions are excluded
    /// from each window's mean.
    ///
    /// # Errors
    ///
    /// Same as [`max_pool`](Self::max_pool).
    pub fn avg_pool(&self, x: &NDArray, filter: [usize; 2], strides: [usize; 2], padding: Padding) -> Result<NDArray> {
        let info = compute_pool2d_info(x.shape(), filter, strides, padding)?;
        self.pool_op(PoolKind::Avg, x, info)
    }

    /// Gradient of a pooling pass with respect to its input `x`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`](crate::error::Error::ShapeMismatch) if `dy`
    /// or `x` do not match `info`.
    pub fn pool_backprop(&self, kind: PoolKind, dy: &NDArray, x: &NDArray, info: &Conv2DInfo) -> Result<NDArray> {
        let dx = self.adopt(self.backend.pool_backprop(kind, dy, x, info)?);
        self.record(|| {
            let (x, info) = (x.clone(), info.clone());
            let name = match kind {
                PoolKind::Max => "max_pool_backprop",
                PoolKind::Avg => "avg_pool_backprop",
            };
            let args = KernelArgs::Pool {
                kind,
                info: info.clone(),
            };
            KernelNode::new(name, vec![("dy", dy.clone()), ("x", x.clone())], args, dx.clone(), move |ddx, _| {
                let (ddx, x, info) = (ddx.clone(), x.clone(), info.clone());
                let x_shape = x.shape().to_vec();
                InputGradients::new()
                    .with("dy", move |m| match kind {
                        PoolKind::Max => Ok(m.adopt(m.backend.max_pool_positions(&ddx, &x, &info)?)),
                        PoolKind::Avg => Ok(m.adopt(m.backend.pool(PoolKind::Avg, &ddx, &info)?)),
                    })
                    .with("x", move |m| Ok(m.zeros(x_shape)))
            })
        })?;
        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_pool_gradient_routes_to_argmax() {
        let math = Math::cpu();
        let x = NDArray::new([1, 2, 2, 1], vec![1.0, 4.0, 2.0, 3.0]).unwrap();
        let grads = math
            .gradients(
                |m| {
                    let y = m.max_pool(&x, [2, 2], [2, 2], Padding::Valid)?;
                    m.sum(&y, None)
                },
                &[&x],
            )
            .unwrap();
        assert_eq!(grads[0].data_sync().unwrap(), vec![0.0, 1.0, 0.0, 0.0]);
    }
}
