//! Data handles shared by arrays and their reshaped views.
//!
//! A handle owns an optional host buffer and an optional device resource.
//! At least one of the two is present while the handle is live. Reading
//! from a device-only handle downloads and caches a host copy; writing the
//! host copy drops the device copy, which is re-uploaded lazily by the next
//! device kernel that needs it.

use crate::error::{Error, Result};
use core::any::Any;
use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::rc::Rc;

static DATA_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn next_data_id() -> usize {
    DATA_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A buffer living in device memory.
///
/// Implemented by each accelerated backend; the array layer only needs to
/// know its length and how to bring it back to the host.
pub trait DeviceResource: Any {
    /// Number of `f32` elements held by the resource.
    fn len(&self) -> usize;

    /// Whether the resource holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the resource back to host memory. This is a transfer point
    /// and blocks until the device has finished writing the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Gpu`] when the readback fails.
    fn read(&self) -> Result<Vec<f32>>;

    /// Upcast used by backends to recover their concrete buffer type.
    fn as_any(&self) -> &dyn Any;
}

/// Counter of live handles allocated through one math context.
#[derive(Debug, Clone, Default)]
pub struct LiveCounter(Rc<Cell<usize>>);

impl LiveCounter {
    /// Number of handles currently alive.
    #[must_use]
    pub fn get(&self) -> usize {
        self.0.get()
    }

    fn inc(&self) {
        self.0.set(self.0.get() + 1);
    }

    fn dec(&self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

struct Buffers {
    host: Option<Vec<f32>>,
    device: Option<Box<dyn DeviceResource>>,
}

/// Shared, disposable storage behind one or more [`NDArray`](super::NDArray)s.
pub struct DataHandle {
    id: usize,
    len: usize,
    state: RefCell<Option<Buffers>>,
    live: Option<LiveCounter>,
}

impl DataHandle {
    fn with_buffers(len: usize, buffers: Buffers, live: Option<LiveCounter>) -> Rc<Self> {
        if let Some(counter) = &live {
            counter.inc();
        }
        Rc::new(Self {
            id: next_data_id(),
            len,
            state: RefCell::new(Some(buffers)),
            live,
        })
    }

    /// Wraps a host buffer.
    pub(crate) fn host(data: Vec<f32>, live: Option<LiveCounter>) -> Rc<Self> {
        let len = data.len();
        Self::with_buffers(
            len,
            Buffers {
                host: Some(data),
                device: None,
            },
            live,
        )
    }

    /// Wraps a device-resident buffer.
    pub(crate) fn device(resource: Box<dyn DeviceResource>, live: Option<LiveCounter>) -> Rc<Self> {
        let len = resource.len();
        Self::with_buffers(
            len,
            Buffers {
                host: None,
                device: Some(resource),
            },
            live,
        )
    }

    /// Unique identifier of this handle.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Number of elements stored.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the handle stores no elements.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether [`dispose`](Self::dispose) has already run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.borrow().is_none()
    }

    /// Whether a host copy is currently cached.
    #[must_use]
    pub fn is_on_host(&self) -> bool {
        self.state
            .borrow()
            .as_ref()
            .is_some_and(|b| b.host.is_some())
    }

    /// Whether a device copy is currently resident.
    #[must_use]
    pub fn is_on_device(&self) -> bool {
        self.state
            .borrow()
            .as_ref()
            .is_some_and(|b| b.device.is_some())
    }

    fn ensure_host(&self) -> Result<()> {
        if self
            .state
            .borrow()
            .as_ref()
            .is_some_and(|b| b.host.is_some())
        {
            return Ok(());
        }
        let mut state = self.state.borrow_mut();
        let buffers = state.as_mut().ok_or(Error::UseAfterDispose { id: self.id })?;
        if buffers.host.is_none() {
            let device = buffers
                .device
                .as_ref()
                .ok_or(Error::UseAfterDispose { id: self.id })?;
            log::trace!("downloading data #{} ({} elements)", self.id, self.len);
            buffers.host = Some(device.read()?);
        }
        Ok(())
    }

    /// Runs `f` over the host copy, downloading it first if needed.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterDispose`] if the handle was disposed, or the
    /// backend's readback error.
    pub fn with_host<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        self.ensure_host()?;
        let state = self.state.borrow();
        let host = state
            .as_ref()
            .and_then(|b| b.host.as_deref())
            .ok_or(Error::UseAfterDispose { id: self.id })?;
        Ok(f(host))
    }

    /// Mutates the host copy in place and invalidates the device copy.
    ///
    /// # Errors
    ///
    /// Same as [`with_host`](Self::with_host).
    pub fn write_host<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> Result<R> {
        self.ensure_host()?;
        let mut state = self.state.borrow_mut();
        let buffers = state.as_mut().ok_or(Error::UseAfterDispose { id: self.id })?;
        buffers.device = None;
        let host = buffers
            .host
            .as_deref_mut()
            .ok_or(Error::UseAfterDispose { id: self.id })?;
        Ok(f(host))
    }

    /// Copies the host data out.
    ///
    /// # Errors
    ///
    /// Same as [`with_host`](Self::with_host).
    pub fn read_host(&self) -> Result<Vec<f32>> {
        self.with_host(<[f32]>::to_vec)
    }

    /// Runs `f` with the device copy, if one is resident.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterDispose`] if the handle was disposed.
    pub fn with_device<R>(&self, f: impl FnOnce(Option<&dyn DeviceResource>) -> R) -> Result<R> {
        let state = self.state.borrow();
        let buffers = state.as_ref().ok_or(Error::UseAfterDispose { id: self.id })?;
        Ok(f(buffers.device.as_deref()))
    }

    /// Installs a device copy next to the host data.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterDispose`] if the handle was disposed.
    pub fn attach_device(&self, resource: Box<dyn DeviceResource>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let buffers = state.as_mut().ok_or(Error::UseAfterDispose { id: self.id })?;
        buffers.device = Some(resource);
        Ok(())
    }

    /// Releases both copies. Disposal happens exactly once.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterDispose`] on a second call.
    pub fn dispose(&self) -> Result<()> {
        let released = self.state.borrow_mut().take();
        if released.is_none() {
            return Err(Error::UseAfterDispose { id: self.id });
        }
        if let Some(counter) = &self.live {
            counter.dec();
        }
        Ok(())
    }
}

impl Drop for DataHandle {
    fn drop(&mut self) {
        if self.state.get_mut().is_some() {
            if let Some(counter) = &self.live {
                counter.dec();
            }
        }
    }
}

impl core::fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataHandle")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("disposed", &self.is_disposed())
            .field("on_device", &self.is_on_device())
            .finish()
    }
}
