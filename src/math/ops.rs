//! Differentiable primitives.
//!
//! Each op runs one backend kernel and, while a tape is recording, records
//! a node whose gradient closure captures the operands it needs.

use super::Math;
use crate::backend::{BinaryOp, MatrixOrientation, ReduceOp, UnaryOp};
use crate::error::{Error, Result};
use crate::ndarray::{NDArray, shape};
use crate::ops::cpu::{layout, reduce};
use crate::tape::{InputGradients, KernelArgs, KernelNode};

/// `(math, dy, x, y) -> dx` for an elementwise unary op.
type UnaryGrad = fn(&Math, &NDArray, &NDArray, &NDArray) -> Result<NDArray>;

impl Math {
    fn unary_op(&self, op: UnaryOp, x: &NDArray, grad: UnaryGrad) -> Result<NDArray> {
        let y = self.adopt(self.backend.unary(op, x)?);
        self.record(|| {
            let x = x.clone();
            KernelNode::new(op.name(), vec![("x", x.clone())], KernelArgs::Unary(op), y.clone(), move |dy, y| {
                let (dy, x, y) = (dy.clone(), x.clone(), y.clone());
                InputGradients::new().with("x", move |m| grad(m, &dy, &x, &y))
            })
        })?;
        Ok(y)
    }

    /// `-x`
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn neg(&self, x: &NDArray) -> Result<NDArray> {
        self.unary_op(UnaryOp::Neg, x, |m, dy, _, _| m.neg(dy))
    }

    /// `e^x`
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn exp(&self, x: &NDArray) -> Result<NDArray> {
        self.unary_op(UnaryOp::Exp, x, |m, dy, _, y| m.multiply(dy, y))
    }

    /// Natural logarithm.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn log(&self, x: &NDArray) -> Result<NDArray> {
        self.unary_op(UnaryOp::Log, x, |m, dy, x, _| m.divide(dy, x))
    }

    /// Square root.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn sqrt(&self, x: &NDArray) -> Result<NDArray> {
        self.unary_op(UnaryOp::Sqrt, x, |m, dy, _, y| {
            let two_y = m.scale(y, 2.0)?;
            m.divide(dy, &two_y)
        })
    }

    /// `x²`
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn square(&self, x: &NDArray) -> Result<NDArray> {
        self.unary_op(UnaryOp::Square, x, |m, dy, x, _| {
            let two_x = m.scale(x, 2.0)?;
            m.multiply(dy, &two_x)
        })
    }

    /// Logistic sigmoid.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn sigmoid(&self, x: &NDArray) -> Result<NDArray> {
        self.unary_op(UnaryOp::Sigmoid, x, |m, dy, _, y| {
            let one_minus = m.subtract(&m.scalar(1.0), y)?;
            let local = m.multiply(y, &one_minus)?;
            m.multiply(dy, &local)
        })
    }

    /// Hyperbolic tangent.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn tanh(&self, x: &NDArray) -> Result<NDArray> {
        self.unary_op(UnaryOp::Tanh, x, |m, dy, _, y| {
            let y2 = m.square(y)?;
            let local = m.subtract(&m.scalar(1.0), &y2)?;
            m.multiply(dy, &local)
        })
    }

    /// `max(x, 0)`
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn relu(&self, x: &NDArray) -> Result<NDArray> {
        self.unary_op(UnaryOp::Relu, x, |m, dy, x, _| {
            let mask = m.step(x)?;
            m.multiply(dy, &mask)
        })
    }

    /// `⌊x⌋`. Its gradient is zero.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn floor(&self, x: &NDArray) -> Result<NDArray> {
        self.unary_op(UnaryOp::Floor, x, |m, _, x, _| Ok(m.zeros(x.shape().to_vec())))
    }

    /// `1` where `x > 0`, else `0`. Its gradient is zero.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn step(&self, x: &NDArray) -> Result<NDArray> {
        self.unary_op(UnaryOp::Step, x, |m, _, x, _| Ok(m.zeros(x.shape().to_vec())))
    }

    /// `|x|`. The gradient at zero is zero.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn abs(&self, x: &NDArray) -> Result<NDArray> {
        self.unary_op(UnaryOp::Abs, x, |m, dy, x, _| {
            let sign = m.subtract(&m.step(x)?, &m.step(&m.neg(x)?)?)?;
            m.multiply(dy, &sign)
        })
    }

    /// Sums `dy` down to `shape`, undoing a broadcast.
    fn unbroadcast(&self, dy: &NDArray, target: &[usize]) -> Result<NDArray> {
        if dy.shape() == target {
            return Ok(dy.clone());
        }
        if shape::size_of(target) == 1 {
            return self.sum(dy, None)?.reshape(target.to_vec());
        }
        match (dy.shape(), target) {
            ([_, n], [cols]) if n == cols => self.sum(dy, Some(0)),
            _ => Err(Error::shape("unbroadcast", dy.shape(), target)),
        }
    }

    fn binary_op(&self, op: BinaryOp, a: &NDArray, b: &NDArray) -> Result<NDArray> {
        let y = self.adopt(self.backend.binary(op, a, b)?);
        self.record(|| {
            let (a, b) = (a.clone(), b.clone());
            KernelNode::new(
                op.name(),
                vec![("a", a.clone()), ("b", b.clone())],
                KernelArgs::Binary(op),
                y.clone(),
                move |dy, _| {
                    let (dy_a, a_a, b_a) = (dy.clone(), a.clone(), b.clone());
                    let (dy_b, a_b, b_b) = (dy.clone(), a.clone(), b.clone());
                    InputGradients::new()
                        .with("a", move |m| {
                            let g = match op {
                                BinaryOp::Add | BinaryOp::Sub => dy_a.clone(),
                                BinaryOp::Mul => m.multiply(&dy_a, &b_a)?,
                                BinaryOp::Div => m.divide(&dy_a, &b_a)?,
                                BinaryOp::Maximum => m.multiply(&dy_a, &m.step(&m.subtract(&a_a, &b_a)?)?)?,
                                BinaryOp::Minimum => m.multiply(&dy_a, &m.step(&m.subtract(&b_a, &a_a)?)?)?,
                            };
                            m.unbroadcast(&g, a_a.shape())
                        })
                        .with("b", move |m| {
                            let g = match op {
                                BinaryOp::Add => dy_b.clone(),
                                BinaryOp::Sub => m.neg(&dy_b)?,
                                BinaryOp::Mul => m.multiply(&dy_b, &a_b)?,
                                BinaryOp::Div => {
                                    let b2 = m.square(&b_b)?;
                                    let ratio = m.divide(&a_b, &b2)?;
                                    m.neg(&m.multiply(&dy_b, &ratio)?)?
                                }
                                // ties go to `b`, so the two masks sum to one
                                BinaryOp::Maximum | BinaryOp::Minimum => {
                                    let (hi, lo) = if op == BinaryOp::Maximum { (&a_b, &b_b) } else { (&b_b, &a_b) };
                                    let to_a = m.step(&m.subtract(hi, lo)?)?;
                                    let to_b = m.subtract(&m.scalar(1.0), &to_a)?;
                                    m.multiply(&dy_b, &to_b)?
                                }
                            };
                            m.unbroadcast(&g, b_b.shape())
                        })
                },
            )
        })?;
        Ok(y)
    }

    /// `a + b` with scalar and row broadcasting.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] for incompatible shapes,
    /// [`Error::UnsupportedType`] for boolean operands.
    pub fn add(&self, a: &NDArray, b: &NDArray) -> Result<NDArray> {
        self.binary_op(BinaryOp::Add, a, b)
    }

    /// `a - b`
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add).
    pub fn subtract(&self, a: &NDArray, b: &NDArray) -> Result<NDArray> {
        self.binary_op(BinaryOp::Sub, a, b)
    }

    /// `a * b`, elementwise.
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add).
    pub fn multiply(&self, a: &NDArray, b: &NDArray) -> Result<NDArray> {
        self.binary_op(BinaryOp::Mul, a, b)
    }

    /// `a / b`, elementwise. Always produces floats.
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add).
    pub fn divide(&self, a: &NDArray, b: &NDArray) -> Result<NDArray> {
        self.binary_op(BinaryOp::Div, a, b)
    }

    /// Elementwise larger of `a` and `b`.
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add).
    pub fn maximum(&self, a: &NDArray, b: &NDArray) -> Result<NDArray> {
        self.binary_op(BinaryOp::Maximum, a, b)
    }

    /// Elementwise smaller of `a` and `b`.
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add).
    pub fn minimum(&self, a: &NDArray, b: &NDArray) -> Result<NDArray> {
        self.binary_op(BinaryOp::Minimum, a, b)
    }

    /// `x * c` for a constant `c`.
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add).
    pub fn scale(&self, x: &NDArray, c: f32) -> Result<NDArray> {
        let c = self.scalar(c);
        self.multiply(x, &c)
    }

    /// Clamps every element into `[min, max]`. The gradient passes through
    /// strictly inside the bounds.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if `min > max`, [`Error::UnsupportedType`]
    /// for boolean input.
    pub fn clip(&self, x: &NDArray, min: f32, max: f32) -> Result<NDArray> {
        let y = self.adopt(self.backend.clip(x, min, max)?);
        self.record(|| {
            let x = x.clone();
            KernelNode::new("clip", vec![("x", x.clone())], KernelArgs::Clip { min, max }, y.clone(), move |dy, _| {
                let (dy, x) = (dy.clone(), x.clone());
                InputGradients::new().with("x", move |m| {
                    let above = m.step(&m.subtract(&x, &m.scalar(min))?)?;
                    let below = m.step(&m.subtract(&m.scalar(max), &x)?)?;
                    let mask = m.multiply(&above, &below)?;
                    m.multiply(&dy, &mask)
                })
            })
        })?;
        Ok(y)
    }

    /// Matrix product `a · b`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] unless `a` is `m×k` and `b` is `k×n`,
    /// [`Error::UnsupportedType`] for non-float operands.
    pub fn matmul(&self, a: &NDArray, b: &NDArray) -> Result<NDArray> {
        self.matmul_oriented(a, b, MatrixOrientation::Regular, MatrixOrientation::Regular)
    }

    /// Matrix product with either operand optionally read transposed.
    ///
    /// # Errors
    ///
    /// Same as [`matmul`](Self::matmul), against the oriented shapes.
    pub fn matmul_oriented(
        &self,
        a: &NDArray,
        b: &NDArray,
        a_orientation: MatrixOrientation,
        b_orientation: MatrixOrientation,
    ) -> Result<NDArray> {
        let y = self.adopt(self.backend.matmul(a, b, a_orientation, b_orientation)?);
        self.record(|| {
            let (a, b) = (a.clone(), b.clone());
            KernelNode::new(
                "matmul",
                vec![("a", a.clone()), ("b", b.clone())],
                KernelArgs::MatMul {
                    a: a_orientation,
                    b: b_orientation,
                },
                y.clone(),
                move |dy, _| {
                    let (dy_a, b_a) = (dy.clone(), b.clone());
                    let (dy_b, a_b) = (dy.clone(), a.clone());
                    InputGradients::new()
                        .with("a", move |m| match a_orientation {
                            // dA = dy · op(B)ᵀ
                            MatrixOrientation::Regular => {
                                m.matmul_oriented(&dy_a, &b_a, MatrixOrientation::Regular, b_orientation.flip())
                            }
                            // dA = op(B) · dyᵀ
                            MatrixOrientation::Transposed => {
                                m.matmul_oriented(&b_a, &dy_a, b_orientation, MatrixOrientation::Transposed)
                            }
                        })
                        .with("b", move |m| match b_orientation {
                            // dB = op(A)ᵀ · dy
                            MatrixOrientation::Regular => {
                                m.matmul_oriented(&a_b, &dy_b, a_orientation.flip(), MatrixOrientation::Regular)
                            }
                            // dB = dyᵀ · op(A)
                            MatrixOrientation::Transposed => {
                                m.matmul_oriented(&dy_b, &a_b, MatrixOrientation::Transposed, a_orientation)
                            }
                        })
                },
            )
        })?;
        Ok(y)
    }

    /// Sum of all elements (`axis = None`, rank-0 result) or along one axis.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] for an axis past the rank.
    pub fn sum(&self, x: &NDArray, axis: Option<usize>) -> Result<NDArray> {
        let y = self.adopt(self.backend.reduce(ReduceOp::Sum, x, axis)?);
        self.record(|| {
            let x = x.clone();
            KernelNode::new("sum", vec![("x", x.clone())], KernelArgs::Sum { axis }, y.clone(), move |dy, _| {
                let (dy, x) = (dy.clone(), x.clone());
                InputGradients::new().with("x", move |m| match axis {
                    None => m.multiply(&m.fill(x.shape().to_vec(), 1.0), &dy),
                    Some(axis) => {
                        let split = reduce::split_axis(x.shape(), axis);
                        let data = dy.handle().with_host(|d| reduce::broadcast_axis(d, split))?;
                        m.array(x.shape().to_vec(), data)
                    }
                })
            })
        })?;
        Ok(y)
    }

    /// Largest element overall or along one axis. Not differentiable.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] for an axis past the rank, an empty input or
    /// an empty reduced axis.
    pub fn max(&self, x: &NDArray, axis: Option<usize>) -> Result<NDArray> {
        Ok(self.adopt(self.backend.reduce(ReduceOp::Max, x, axis)?))
    }

    /// Index of the largest element along the last axis, as `I32`.
    /// Not differentiable.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] for a scalar or an empty last axis.
    pub fn arg_max(&self, x: &NDArray) -> Result<NDArray> {
        Ok(self.adopt(self.backend.arg_max(x)?))
    }

    /// Joins `a` and `b` along `axis`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the other axes disagree.
    pub fn concat(&self, a: &NDArray, b: &NDArray, axis: usize) -> Result<NDArray> {
        let y = self.adopt(self.backend.concat(a, b, axis)?);
        self.record(|| {
            let (a_shape, b_shape) = (a.shape().to_vec(), b.shape().to_vec());
            KernelNode::new(
                "concat",
                vec![("a", a.clone()), ("b", b.clone())],
                KernelArgs::Concat { axis },
                y.clone(),
                move |dy, _| {
                    let (dy_a, dy_b) = (dy.clone(), dy.clone());
                    let a_size = a_shape.clone();
                    let b_size = b_shape.clone();
                    let mut b_begin = vec![0; b_size.len()];
                    b_begin[axis] = a_shape[axis];
                    InputGradients::new()
                        .with("a", move |m| m.slice(&dy_a, &vec![0; a_size.len()], &a_size))
                        .with("b", move |m| m.slice(&dy_b, &b_begin, &b_size))
                },
            )
        })?;
        Ok(y)
    }

    /// Copies the window `[begin, begin + size)`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the window leaves the array.
    pub fn slice(&self, x: &NDArray, begin: &[usize], size: &[usize]) -> Result<NDArray> {
        let y = self.adopt(self.backend.slice(x, begin, size)?);
        self.record(|| {
            let (x_shape, begin, size) = (x.shape().to_vec(), begin.to_vec(), size.to_vec());
            let args = KernelArgs::Slice {
                begin: begin.clone(),
                size: size.clone(),
            };
            KernelNode::new("slice", vec![("x", x.clone())], args, y.clone(), move |dy, _| {
                let (dy, x_shape, begin, size) = (dy.clone(), x_shape.clone(), begin.clone(), size.clone());
                InputGradients::new().with("x", move |m| {
                    let data = dy
                        .handle()
                        .with_host(|d| layout::scatter(d, &size, &x_shape, &begin))?;
                    m.array(x_shape, data)
                })
            })
        })?;
        Ok(y)
    }

    /// Reshapes `x` without copying. The result shares data with `x`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the element counts differ.
    pub fn reshape(&self, x: &NDArray, shape: impl Into<Vec<usize>>) -> Result<NDArray> {
        let y = x.reshape(shape)?;
        self.record(|| {
            let from = x.shape().to_vec();
            KernelNode::new(
                "reshape",
                vec![("x", x.clone())],
                KernelArgs::Reshape { from: from.clone() },
                y.clone(),
                move |dy, _| {
                    let (dy, from) = (dy.clone(), from.clone());
                    InputGradients::new().with("x", move |_| dy.reshape(from))
                },
            )
        })?;
        Ok(y)
    }
}
