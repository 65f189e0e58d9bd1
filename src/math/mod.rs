//! The math context: the entry point for every array operation.
//!
//! A [`Math`] owns one [`Backend`], a stack of memory scopes, an optional
//! recording tape and a seedable random generator. Every op validates its
//! operands, runs the backend kernel, registers the result with the
//! innermost scope and, while a tape is recording, appends a gradient node.
//!
//! A context is single-threaded; create one per thread.
//!
//! # Example
//!
//! ```rust
//! use ndtape::{array, Math};
//!
//! let math = Math::cpu();
//! let sum = math
//!     .scope(|_| {
//!         let a = array!([1.0, 2.0, 3.0]);
//!         let doubled = math.scale(&a, 2.0)?;
//!         math.sum(&doubled, None)
//!     })
//!     .unwrap();
//! assert_eq!(sum.get_scalar().unwrap(), 12.0);
//! ```

mod composite;
mod ops;
mod pool;
mod scope;

pub use composite::{LstmCell, LstmState};
pub use scope::{Keep, ScopeGuard};

use crate::backend::{Backend, BackendKind, Buffer, KernelOutput, get_backend};
use crate::error::{Error, Result};
use crate::ndarray::{DType, DataHandle, LiveCounter, NDArray, shape};
use crate::ops::dispatch::{create_backend, try_create_backend};
use crate::tape::{KernelNode, Tape};
use core::cell::RefCell;
use rand::SeedableRng;
use rand::rngs::StdRng;
use scope::ScopeStack;

/// Array operations with scoped memory and optional gradient recording.
pub struct Math {
    backend: Box<dyn Backend>,
    scopes: RefCell<ScopeStack>,
    tape: RefCell<Option<Tape>>,
    live: LiveCounter,
    rng: RefCell<StdRng>,
}

impl Default for Math {
    fn default() -> Self {
        Self::new()
    }
}

impl Math {
    /// A context on the process-wide default backend, falling back to the
    /// CPU if it is unavailable.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(create_backend(get_backend()))
    }

    /// A context on the CPU backend.
    #[must_use]
    pub fn cpu() -> Self {
        Self::with_backend(create_backend(BackendKind::Cpu))
    }

    /// A context on exactly the requested backend.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceUnavailable`] if that backend cannot run here.
    pub fn try_with_kind(kind: BackendKind) -> Result<Self> {
        Ok(Self::with_backend(try_create_backend(kind)?))
    }

    /// A context on a caller-provided backend.
    #[must_use]
    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        log::debug!("math context on {:?} backend", backend.kind());
        Self {
            backend,
            scopes: RefCell::new(ScopeStack::default()),
            tape: RefCell::new(None),
            live: LiveCounter::default(),
            rng: RefCell::new(StdRng::from_os_rng()),
        }
    }

    /// Reseeds the random generator used by sampling ops.
    #[must_use]
    pub fn seeded(self, seed: u64) -> Self {
        *self.rng.borrow_mut() = StdRng::seed_from_u64(seed);
        self
    }

    /// The backend executing kernels.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Arrays allocated through this context that are not yet disposed.
    #[must_use]
    pub fn live_arrays(&self) -> usize {
        self.live.get()
    }

    /// Number of open scopes.
    #[must_use]
    pub fn scope_depth(&self) -> usize {
        self.scopes.borrow().depth()
    }

    /// Wraps a kernel result and registers it with the innermost scope.
    fn adopt(&self, out: KernelOutput) -> NDArray {
        let handle = match out.buffer {
            Buffer::Host(data) => DataHandle::host(data, Some(self.live.clone())),
            Buffer::Device(resource) => DataHandle::device(resource, Some(self.live.clone())),
        };
        self.scopes.borrow_mut().track_new(&handle);
        NDArray::from_handle(out.shape, out.dtype, handle)
    }

    /// A tracked host array of the given dtype.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if `data` does not fill `shape`.
    pub fn array_of(&self, shape: impl Into<Vec<usize>>, dtype: DType, data: Vec<f32>) -> Result<NDArray> {
        let shape = shape.into();
        if shape::size_of(&shape) != data.len() {
            return Err(Error::shape("array", &shape, &[data.len()]));
        }
        Ok(self.adopt(KernelOutput::host(shape, dtype, data)))
    }

    /// A tracked float array.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if `data` does not fill `shape`.
    pub fn array(&self, shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<NDArray> {
        self.array_of(shape, DType::F32, data)
    }

    /// A tracked array filled with `value`.
    #[must_use]
    pub fn fill(&self, shape: impl Into<Vec<usize>>, value: f32) -> NDArray {
        let shape = shape.into();
        let len = shape::size_of(&shape);
        self.adopt(KernelOutput::host(shape, DType::F32, vec![value; len]))
    }

    /// A tracked zero-filled array.
    #[must_use]
    pub fn zeros(&self, shape: impl Into<Vec<usize>>) -> NDArray {
        self.fill(shape, 0.0)
    }

    /// A tracked scalar.
    #[must_use]
    pub fn scalar(&self, value: f32) -> NDArray {
        self.fill(Vec::new(), value)
    }

    /// Makes `x` resident on the backend's device.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterDispose`] or a transfer failure.
    pub fn upload(&self, x: &NDArray) -> Result<()> {
        self.backend.upload(x)
    }

    /// Removes `x` from scope tracking and releases its data.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterDispose`] if it was already disposed.
    pub fn dispose(&self, x: &NDArray) -> Result<()> {
        self.scopes.borrow_mut().untrack(x.data_id());
        x.dispose()
    }

    /// Whether a tape is recording.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.tape.borrow().is_some()
    }

    /// Starts recording differentiable ops.
    ///
    /// # Errors
    ///
    /// [`Error::TapeState`] if a tape is already recording.
    pub fn start_tape(&self) -> Result<()> {
        let mut tape = self.tape.borrow_mut();
        if tape.is_some() {
            return Err(Error::TapeState("a tape is already recording"));
        }
        *tape = Some(Tape::new());
        Ok(())
    }

    /// Stops recording and returns the closed tape.
    ///
    /// # Errors
    ///
    /// [`Error::TapeState`] if no tape is recording.
    pub fn finish_tape(&self) -> Result<Tape> {
        let mut tape = self
            .tape
            .borrow_mut()
            .take()
            .ok_or(Error::TapeState("no tape is recording"))?;
        tape.close();
        Ok(tape)
    }

    /// Appends the node built by `build` if a tape is recording.
    fn record(&self, build: impl FnOnce() -> KernelNode) -> Result<()> {
        if !self.is_recording() {
            return Ok(());
        }
        let node = build();
        match self.tape.borrow_mut().as_mut() {
            Some(tape) => tape.record(node).map(drop),
            None => Ok(()),
        }
    }

    /// Runs `f` with recording suspended, so a composite op can record
    /// itself as a single node.
    fn paused<R>(&self, f: impl FnOnce() -> R) -> R {
        let suspended = self.tape.borrow_mut().take();
        let out = f();
        if let Some(tape) = suspended {
            *self.tape.borrow_mut() = Some(tape);
        }
        out
    }

    /// Gradients of the scalar returned by `f` with respect to `xs`.
    ///
    /// # Errors
    ///
    /// Any error of `f`, [`Error::ShapeMismatch`] if `f` returns more than
    /// one element, or [`Error::TapeState`] if a tape is already recording.
    pub fn gradients<F>(&self, f: F, xs: &[&NDArray]) -> Result<Vec<NDArray>>
    where
        F: FnOnce(&Self) -> Result<NDArray>,
    {
        self.value_and_gradients(f, xs).map(|(_, grads)| grads)
    }

    /// Like [`gradients`](Self::gradients), also returning the value.
    ///
    /// Intermediates are released when this returns; the value and the
    /// gradients survive into the caller's scope.
    ///
    /// # Errors
    ///
    /// Same as [`gradients`](Self::gradients).
    pub fn value_and_gradients<F>(&self, f: F, xs: &[&NDArray]) -> Result<(NDArray, Vec<NDArray>)>
    where
        F: FnOnce(&Self) -> Result<NDArray>,
    {
        self.scope(|_| {
            self.start_tape()?;
            let value = f(self);
            let mut tape = self.finish_tape()?;
            let result = value.and_then(|y| {
                let grads = tape.backward(self, &y, xs)?;
                Ok((y, grads))
            });
            tape.discard();
            result
        })
    }

    fn rng(&self) -> core::cell::RefMut<'_, StdRng> {
        self.rng.borrow_mut()
    }
}

impl core::fmt::Debug for Math {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Math")
            .field("backend", &self.backend.kind())
            .field("scopes", &self.scope_depth())
            .field("recording", &self.is_recording())
            .field("live_arrays", &self.live_arrays())
            .finish()
    }
}
