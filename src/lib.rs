//! # `ndtape`
//!
//! Tensor math with reverse-mode automatic differentiation, running on a
//! multi-threaded CPU backend or on the GPU through `wgpu` compute shaders,
//! plus a real-time Performance-RNN generator built on top of it.
//!
//! ## Features
//!
//! - **Arrays**: typed N-dimensional handles with zero-copy reshapes and
//!   lazy host/device residency
//! - **Backends**: a pluggable [`Backend`](backend::Backend) trait with a
//!   `rayon` CPU reference and an optional `wgpu` implementation
//! - **Tape**: recorded kernel nodes with lazily computed gradients,
//!   replayed in strict reverse order
//! - **Scopes**: deterministic disposal of intermediate arrays
//! - **Composite ops**: softmax, one-hot, multinomial sampling, LSTM cells
//! - **Performance-RNN**: chord-conditioned event generation with
//!   cancellation tokens and a playback sink
//!
//! ## Example
//!
//! ```rust
//! use ndtape::{array, Math};
//!
//! let math = Math::cpu();
//! let w = array!([[0.5], [-1.0]]);
//! let x = array!([[1.0, 2.0]]);
//! let grads = math
//!     .gradients(|m| m.sum(&m.matmul(&x, &w)?, None), &[&w])
//!     .unwrap();
//! assert_eq!(grads[0].data_sync().unwrap(), vec![1.0, 2.0]);
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::type_complexity,
    clippy::many_single_char_names,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::unused_async,
    clippy::module_name_repetitions
)]
#![deny(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

pub mod backend;
pub mod conv_util;
pub mod error;
pub mod math;
pub mod ndarray;
pub mod ops;
pub mod performance;
pub mod tape;

pub use error::{Error, Result};
pub use math::Math;
pub use ndarray::{DType, NDArray};
