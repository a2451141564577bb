use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use vole_core::manager;
use vole_core::{Disposable, Error, ResourceId, Result, Scoped, TrackedRef};

use crate::library::{NativeHandle, NativeLib};

// Tensor — Managed wrapper around one native buffer
//
// Every constructor and every operation that produces a tensor allocates a
// native buffer and registers the new wrapper with the calling thread's
// innermost dispose scope. The wrapper is an `Rc`, so cloning a Tensor is
// cheap and shares the same native buffer; the scope holds one more clone
// and therefore keeps the buffer alive until the scope closes, even if every
// user handle is gone.
//
// A tensor is usable until it is disposed. After that every operation fails
// with `Error::Disposed` instead of touching the freed handle.
//
// A tensor that is not owned by any scope (created with no scope open, or
// detached) is released when its last handle is dropped.

pub(crate) struct TensorInner {
    id: ResourceId,
    handle: NativeHandle,
    dims: Vec<usize>,
    lib: NativeLib,
    disposed: Cell<bool>,
}

impl Disposable for TensorInner {
    fn resource_id(&self) -> ResourceId {
        self.id
    }

    fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    fn release(&self) -> bool {
        if self.disposed.replace(true) {
            return false;
        }
        if let Err(e) = self.lib.release(self.handle) {
            // The native side no longer agrees with the tracker about who owns
            // this handle. Continuing would risk a double free.
            panic!("failed to release native tensor {}: {}", self.id, e);
        }
        true
    }

    fn kind(&self) -> &'static str {
        "tensor"
    }
}

impl Drop for TensorInner {
    fn drop(&mut self) {
        if self.release() {
            manager::notify_dropped(self.id);
        }
    }
}

/// A tensor backed by a native buffer, tracked by the dispose-scope system.
///
/// Tensors are tied to the thread that created them.
#[derive(Clone)]
pub struct Tensor {
    inner: Rc<TensorInner>,
}

impl Tensor {
    // Construction

    /// Wrap a freshly allocated native buffer and register it with the
    /// current scope. On registration failure the buffer is released again.
    pub(crate) fn from_native(lib: &NativeLib, handle: NativeHandle, dims: Vec<usize>) -> Result<Self> {
        let inner = Rc::new(TensorInner {
            id: ResourceId::next(),
            handle,
            dims,
            lib: lib.clone(),
            disposed: Cell::new(false),
        });
        let tracked: TrackedRef = inner.clone();
        if let Err(e) = manager::register_on_current(tracked) {
            inner.release();
            return Err(e);
        }
        Ok(Tensor { inner })
    }

    fn from_vec(data: Vec<f32>, dims: &[usize], lib: &NativeLib) -> Result<Self> {
        let handle = lib.alloc_buffer(dims.to_vec(), data);
        Self::from_native(lib, handle, dims.to_vec())
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(dims: &[usize], lib: &NativeLib) -> Result<Self> {
        Self::full(dims, 0.0, lib)
    }

    /// Create a tensor filled with ones.
    pub fn ones(dims: &[usize], lib: &NativeLib) -> Result<Self> {
        Self::full(dims, 1.0, lib)
    }

    /// Create a tensor filled with a constant value.
    pub fn full(dims: &[usize], value: f32, lib: &NativeLib) -> Result<Self> {
        Self::from_vec(vec![value; elem_count(dims)], dims, lib)
    }

    /// Create a zero-dimensional tensor holding one value.
    pub fn scalar(value: f32, lib: &NativeLib) -> Result<Self> {
        Self::from_vec(vec![value], &[], lib)
    }

    /// Create a tensor from a flat slice, row-major.
    pub fn from_slice(data: &[f32], dims: &[usize], lib: &NativeLib) -> Result<Self> {
        let expected = elem_count(dims);
        if data.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape: dims.to_vec(),
                expected,
                got: data.len(),
            });
        }
        Self::from_vec(data.to_vec(), dims, lib)
    }

    /// Create a tensor with random uniform values in [0, 1).
    pub fn rand(dims: &[usize], lib: &NativeLib) -> Result<Self> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let data = (0..elem_count(dims)).map(|_| rng.gen::<f32>()).collect();
        Self::from_vec(data, dims, lib)
    }

    /// Create a tensor with random normal values (mean=0, std=1).
    pub fn randn(dims: &[usize], lib: &NativeLib) -> Result<Self> {
        use rand::Rng;
        use rand_distr::StandardNormal;
        let mut rng = rand::thread_rng();
        let data = (0..elem_count(dims))
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        Self::from_vec(data, dims, lib)
    }

    // Accessors

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    /// The native handle. Fails once the tensor is disposed.
    pub fn handle(&self) -> Result<NativeHandle> {
        self.ensure_live()?;
        Ok(self.inner.handle)
    }

    pub fn dims(&self) -> &[usize] {
        &self.inner.dims
    }

    pub fn rank(&self) -> usize {
        self.inner.dims.len()
    }

    pub fn elem_count(&self) -> usize {
        elem_count(&self.inner.dims)
    }

    pub fn lib(&self) -> &NativeLib {
        &self.inner.lib
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// True if both handles share the same native buffer.
    pub fn same_tensor(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn tracked_ref(&self) -> TrackedRef {
        self.inner.clone()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed {
                resource: self.inner.id,
            });
        }
        Ok(())
    }

    fn ensure_same_dims(&self, rhs: &Tensor) -> Result<()> {
        if self.dims() != rhs.dims() {
            return Err(Error::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: rhs.dims().to_vec(),
            });
        }
        Ok(())
    }

    // Reading

    /// Copy the contents out, row-major.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        self.ensure_live()?;
        self.inner
            .lib
            .with_buffer(self.inner.handle, |_, data| data.to_vec())
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar(&self) -> Result<f32> {
        self.ensure_live()?;
        if self.elem_count() != 1 {
            return Err(Error::ShapeMismatch {
                expected: vec![],
                got: self.dims().to_vec(),
            });
        }
        self.inner.lib.with_buffer(self.inner.handle, |_, data| data[0])
    }

    // Element-wise operations

    fn binary_map(&self, rhs: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        self.ensure_live()?;
        rhs.ensure_live()?;
        self.ensure_same_dims(rhs)?;
        let lhs = self.to_vec()?;
        let rhs = rhs.to_vec()?;
        let data = lhs.iter().zip(&rhs).map(|(&a, &b)| f(a, b)).collect();
        Self::from_vec(data, self.dims(), self.lib())
    }

    fn unary_map(&self, f: impl Fn(f32) -> f32) -> Result<Tensor> {
        let data = self.to_vec()?.into_iter().map(f).collect();
        Self::from_vec(data, self.dims(), self.lib())
    }

    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary_map(rhs, |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary_map(rhs, |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary_map(rhs, |a, b| a * b)
    }

    pub fn mul_scalar(&self, value: f32) -> Result<Tensor> {
        self.unary_map(|a| a * value)
    }

    /// Affine transform: `self * mul + add`.
    pub fn affine(&self, mul: f32, add: f32) -> Result<Tensor> {
        self.unary_map(|a| a * mul + add)
    }

    pub fn relu(&self) -> Result<Tensor> {
        self.unary_map(|a| a.max(0.0))
    }

    /// A new tensor with its own buffer and the same contents.
    pub fn deep_copy(&self) -> Result<Tensor> {
        self.unary_map(|a| a)
    }

    /// Add `rhs` into this tensor's buffer. No new tensor is created.
    pub fn add_(&self, rhs: &Tensor) -> Result<()> {
        self.ensure_live()?;
        rhs.ensure_live()?;
        self.ensure_same_dims(rhs)?;
        let rhs = rhs.to_vec()?;
        self.inner
            .lib
            .with_buffer_mut(self.inner.handle, |_, data| {
                data.iter_mut().zip(&rhs).for_each(|(a, b)| *a += b)
            })
    }

    // Reductions

    /// Sum of all elements, as a zero-dimensional tensor.
    pub fn sum_all(&self) -> Result<Tensor> {
        let total: f32 = self.to_vec()?.iter().sum();
        Self::scalar(total, self.lib())
    }

    // Matrix multiplication

    /// Matrix multiplication: [m, k] @ [k, n] → [m, n].
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.ensure_live()?;
        rhs.ensure_live()?;
        let (m, k1) = match self.dims() {
            &[m, k] => (m, k),
            other => return Err(Error::msg(format!("matmul: lhs must be 2-D, got {other:?}"))),
        };
        let (k2, n) = match rhs.dims() {
            &[k, n] => (k, n),
            other => return Err(Error::msg(format!("matmul: rhs must be 2-D, got {other:?}"))),
        };
        if k1 != k2 {
            return Err(Error::ShapeMismatch {
                expected: vec![k1, n],
                got: rhs.dims().to_vec(),
            });
        }
        let lhs = self.to_vec()?;
        let rhs = rhs.to_vec()?;
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for p in 0..k1 {
                let a = lhs[i * k1 + p];
                for j in 0..n {
                    out[i * n + j] += a * rhs[p * n + j];
                }
            }
        }
        Self::from_vec(out, &[m, n], self.lib())
    }
}

impl Scoped for Tensor {
    fn tracked(&self) -> Vec<TrackedRef> {
        vec![self.tracked_ref()]
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor({}, handle={:#x}, dims={:?}{})",
            self.inner.id,
            self.inner.handle,
            self.inner.dims,
            if self.is_disposed() { ", disposed" } else { "" }
        )
    }
}

pub(crate) fn elem_count(dims: &[usize]) -> usize {
    dims.iter().product()
}
