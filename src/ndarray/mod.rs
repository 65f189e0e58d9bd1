//! Typed, shaped array handles.
//!
//! An [`NDArray`] is a cheap handle: a shape, a dtype tag and a shared
//! [`DataHandle`]. Reshaping or reinterpreting the rank (`as_1d`, `as_2d`, ...)
//! produces a new handle over the same data without copying. Arrays are
//! immutable by convention; [`NDArray::set`] exists for small host-side
//! tables such as a chord progression.
//!
//! Data lives on the host, on a device, or both. Reading it back with
//! [`NDArray::data`] is a transfer point and therefore `async`.
//!
//! # Example
//!
//! ```rust
//! use ndtape::array;
//!
//! let a = array!([[1.0, 2.0], [3.0, 4.0]]);
//! assert_eq!(a.shape(), &[2, 2]);
//! let v = a.as_1d().unwrap();
//! assert_eq!(v.get(&[3]).unwrap(), 4.0);
//! ```

pub mod shape;
mod storage;

pub use storage::{DataHandle, DeviceResource, LiveCounter};

use crate::error::{Error, Result};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::rc::Rc;

static ARRAY_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn next_array_id() -> usize {
    ARRAY_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Logical element type. Storage is always `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    /// 32-bit float.
    #[default]
    F32,
    /// 32-bit integer values held exactly in `f32`.
    I32,
    /// `0.0` / `1.0` flags.
    Bool,
}

impl DType {
    /// Result type of arithmetic between `self` and `other`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] if either side is [`DType::Bool`].
    pub fn upcast(self, other: Self, op: &'static str) -> Result<Self> {
        match (self, other) {
            (Self::Bool, _) | (_, Self::Bool) => Err(Error::UnsupportedType {
                op,
                dtype: Self::Bool,
            }),
            (Self::I32, Self::I32) => Ok(Self::I32),
            _ => Ok(Self::F32),
        }
    }
}

/// A typed, shaped handle over shared data.
#[derive(Clone)]
pub struct NDArray {
    id: usize,
    shape: Vec<usize>,
    dtype: DType,
    data: Rc<DataHandle>,
}

impl NDArray {
    pub(crate) fn from_handle(shape: Vec<usize>, dtype: DType, data: Rc<DataHandle>) -> Self {
        debug_assert_eq!(shape::size_of(&shape), data.len());
        Self {
            id: next_array_id(),
            shape,
            dtype,
            data,
        }
    }

    pub(crate) fn host_tracked(
        shape: Vec<usize>,
        dtype: DType,
        data: Vec<f32>,
        live: Option<LiveCounter>,
    ) -> Self {
        Self::from_handle(shape, dtype, DataHandle::host(data, live))
    }

    /// Creates a float array from a shape and row-major data.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if `data.len()` differs from the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self> {
        Self::with_dtype_data(shape, DType::F32, data)
    }

    /// Creates an array of the given dtype.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if `data.len()` differs from the shape product.
    pub fn with_dtype_data(shape: impl Into<Vec<usize>>, dtype: DType, data: Vec<f32>) -> Result<Self> {
        let shape = shape.into();
        if shape::size_of(&shape) != data.len() {
            return Err(Error::shape("new", &shape, &[data.len()]));
        }
        Ok(Self::host_tracked(shape, dtype, data, None))
    }

    /// Creates an array from a literal, panicking on a size mismatch.
    ///
    /// Used by the [`array!`](crate::array) macro.
    ///
    /// # Panics
    ///
    /// Panics if the number of elements in `data` does not match the shape product.
    #[must_use]
    pub fn literal(shape: Vec<usize>, data: Vec<f32>) -> Self {
        assert_eq!(
            shape::size_of(&shape),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self::host_tracked(shape, DType::F32, data, None)
    }

    /// A rank-0 float array.
    #[must_use]
    pub fn scalar(value: f32) -> Self {
        Self::host_tracked(Vec::new(), DType::F32, vec![value], None)
    }

    /// A 1-D float array.
    #[must_use]
    pub fn new_1d(data: Vec<f32>) -> Self {
        Self::host_tracked(vec![data.len()], DType::F32, data, None)
    }

    /// A 2-D float array.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the data does not fill `shape`.
    pub fn new_2d(shape: [usize; 2], data: Vec<f32>) -> Result<Self> {
        Self::new(shape, data)
    }

    /// A 3-D float array.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the data does not fill `shape`.
    pub fn new_3d(shape: [usize; 3], data: Vec<f32>) -> Result<Self> {
        Self::new(shape, data)
    }

    /// A 4-D float array.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the data does not fill `shape`.
    pub fn new_4d(shape: [usize; 4], data: Vec<f32>) -> Result<Self> {
        Self::new(shape, data)
    }

    /// A zero-filled float array.
    #[must_use]
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        Self::fill(shape, 0.0)
    }

    /// A float array filled with `value`.
    #[must_use]
    pub fn fill(shape: impl Into<Vec<usize>>, value: f32) -> Self {
        let shape = shape.into();
        let len = shape::size_of(&shape);
        Self::host_tracked(shape, DType::F32, vec![value; len], None)
    }

    /// Identifier of this handle (views get their own id).
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Identifier of the underlying data, shared by views.
    #[must_use]
    pub fn data_id(&self) -> usize {
        self.data.id()
    }

    /// Dimensions.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Logical element type.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Shared data handle.
    #[must_use]
    pub const fn handle(&self) -> &Rc<DataHandle> {
        &self.data
    }

    /// Whether the data has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.data.is_disposed()
    }

    /// Whether a device copy is resident.
    #[must_use]
    pub fn is_on_device(&self) -> bool {
        self.data.is_on_device()
    }

    /// Whether a host copy is cached.
    #[must_use]
    pub fn is_on_host(&self) -> bool {
        self.data.is_on_host()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::UseAfterDispose { id: self.data_id() })
        } else {
            Ok(())
        }
    }

    /// Reinterprets the data under a new shape without copying.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the element counts differ,
    /// [`Error::UseAfterDispose`] if the data is gone.
    pub fn reshape(&self, new_shape: impl Into<Vec<usize>>) -> Result<Self> {
        let new_shape = new_shape.into();
        self.ensure_live()?;
        if shape::size_of(&new_shape) != self.size() {
            return Err(Error::shape("reshape", &self.shape, &new_shape));
        }
        Ok(Self::from_handle(new_shape, self.dtype, Rc::clone(&self.data)))
    }

    /// Same data under another dtype tag.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterDispose`] if the data is gone.
    pub fn as_type(&self, dtype: DType) -> Result<Self> {
        self.ensure_live()?;
        Ok(Self::from_handle(self.shape.clone(), dtype, Rc::clone(&self.data)))
    }

    /// Views a single-element array as a scalar.
    ///
    /// # Errors
    ///
    /// See [`reshape`](Self::reshape).
    pub fn as_scalar(&self) -> Result<Self> {
        self.reshape(Vec::new())
    }

    /// Flattens to one dimension.
    ///
    /// # Errors
    ///
    /// See [`reshape`](Self::reshape).
    pub fn as_1d(&self) -> Result<Self> {
        self.reshape(vec![self.size()])
    }

    /// Views as a `rows × cols` matrix.
    ///
    /// # Errors
    ///
    /// See [`reshape`](Self::reshape).
    pub fn as_2d(&self, rows: usize, cols: usize) -> Result<Self> {
        self.reshape(vec![rows, cols])
    }

    /// Views as a rank-3 array.
    ///
    /// # Errors
    ///
    /// See [`reshape`](Self::reshape).
    pub fn as_3d(&self, shape: [usize; 3]) -> Result<Self> {
        self.reshape(shape.to_vec())
    }

    /// Views as a rank-4 array.
    ///
    /// # Errors
    ///
    /// See [`reshape`](Self::reshape).
    pub fn as_4d(&self, shape: [usize; 4]) -> Result<Self> {
        self.reshape(shape.to_vec())
    }

    /// Reads one element, downloading the data if it is device-only.
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfRange`], [`Error::ShapeMismatch`] for a bad index,
    /// [`Error::UseAfterDispose`] if the data is gone.
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        let offset = shape::flat_index(&self.shape, index)?;
        self.data.with_host(|d| d[offset])
    }

    /// Writes one element on the host copy.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn set(&self, index: &[usize], value: f32) -> Result<()> {
        let offset = shape::flat_index(&self.shape, index)?;
        self.data.write_host(|d| d[offset] = value)
    }

    /// Value of a single-element array.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] unless the array has exactly one element.
    pub fn get_scalar(&self) -> Result<f32> {
        if self.size() != 1 {
            return Err(Error::shape("get_scalar", &self.shape, &[]));
        }
        self.data.with_host(|d| d[0])
    }

    /// Copies the data to the host. Suspends while a device buffer is read back.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterDispose`] or a transfer failure.
    pub async fn data(&self) -> Result<Vec<f32>> {
        self.data.read_host()
    }

    /// Blocking form of [`data`](Self::data).
    ///
    /// # Errors
    ///
    /// Same as [`data`](Self::data).
    pub fn data_sync(&self) -> Result<Vec<f32>> {
        pollster::block_on(self.data())
    }

    /// Releases the data. Every view of the same data becomes unusable.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterDispose`] if it was already disposed.
    pub fn dispose(&self) -> Result<()> {
        self.data.dispose()
    }
}

impl core::fmt::Debug for NDArray {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NDArray")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("data", &self.data)
            .finish()
    }
}

/// Defines a float array from nested literal arrays.
///
/// Supports any rank as long as sibling rows have uniform shapes.
///
/// # Example
/// ```
/// use ndtape::array;
/// let t = array!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape(), &[2, 2]);
/// ```
#[macro_export]
macro_rules! array {
    ($lit:literal) => {
        $crate::ndarray::NDArray::literal(::std::vec::Vec::new(), ::std::vec![$lit as f32])
    };

    ([ $( $lit:literal ),+ $(,)? ]) => {{
        let data = ::std::vec![ $( $lit as f32 ),+ ];
        $crate::ndarray::NDArray::literal(::std::vec![data.len()], data)
    }};

    ([ $( [ $( $inner:tt )* ] ),+ $(,)? ]) => {{
        let children = ::std::vec![ $( $crate::array!([ $( $inner )* ]) ),+ ];
        let first_shape = children[0].shape().to_vec();
        assert!(children.iter().all(|c| c.shape() == first_shape.as_slice()),
            "ragged array literal (rows have mismatched shapes)");
        let mut shape = ::std::vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = ::std::vec::Vec::with_capacity(children.len() * children[0].size());
        for c in &children {
            if let ::std::result::Result::Ok(values) = c.data_sync() {
                data.extend(values);
            }
        }
        $crate::ndarray::NDArray::literal(shape, data)
    }};
}
