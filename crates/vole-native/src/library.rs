// Native library — Handle table standing in for the native tensor runtime
//
// The real system talks to a C tensor library through opaque handles: every
// tensor-producing call returns a fresh handle, and every handle must be
// handed back to the library exactly once. NativeLib reproduces that
// contract in-process so the tracker can be exercised end to end:
//
//   let lib = NativeLib::new();
//   let h = lib.alloc_buffer(vec![2, 2], vec![0.0; 4]);   // native allocation
//   lib.release(h)?;                                         // native free
//   lib.release(h)?;                                         // Err(InvalidHandle)
//   let stats = lib.stats();                                 // query
//
// Handles are never reused. Releasing an unknown (or already released)
// handle is counted in `invalid_releases`; a tracker that works never makes
// that counter move.
//
// NativeLib is a cheap-to-clone handle to shared state, like a device.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vole_core::{Error, Result};

/// Opaque identifier of a native allocation.
pub type NativeHandle = u64;

// Library statistics

/// Snapshot of the library's allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LibStats {
    /// Cumulative native allocations.
    pub allocations: u64,
    /// Cumulative successful releases.
    pub releases: u64,
    /// Releases of handles the library did not know (double frees).
    pub invalid_releases: u64,
    /// Handles currently allocated.
    pub live_handles: usize,
    /// Bytes held by currently allocated buffers.
    pub live_bytes: usize,
}

impl fmt::Display for LibStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allocations={} releases={} invalid_releases={} live_handles={} live_bytes={}",
            self.allocations,
            self.releases,
            self.invalid_releases,
            self.live_handles,
            self.live_bytes
        )
    }
}

// Native objects

/// What a handle points at.
enum NativeObject {
    /// A dense f32 buffer with its dimensions.
    Buffer { dims: Vec<usize>, data: Vec<f32> },
    /// A packed-sequence record referencing its four member buffers.
    Packed { members: [NativeHandle; 4] },
}

impl NativeObject {
    fn nbytes(&self) -> usize {
        match self {
            NativeObject::Buffer { data, .. } => data.len() * std::mem::size_of::<f32>(),
            NativeObject::Packed { members } => std::mem::size_of_val(members),
        }
    }
}

struct LibInner {
    objects: Mutex<HashMap<NativeHandle, NativeObject>>,
    next_handle: AtomicU64,

    // Atomic counters — readable without taking the table lock
    allocations: AtomicU64,
    releases: AtomicU64,
    invalid_releases: AtomicU64,
}

/// Handle to a native tensor library instance.
#[derive(Clone)]
pub struct NativeLib {
    inner: Arc<LibInner>,
}

impl NativeLib {
    /// Create an empty library instance.
    pub fn new() -> Self {
        NativeLib {
            inner: Arc::new(LibInner {
                objects: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(0x1000),
                allocations: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                invalid_releases: AtomicU64::new(0),
            }),
        }
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<NativeHandle, NativeObject>> {
        // A poisoned table only means another thread panicked mid-operation;
        // the map itself is still structurally valid.
        self.inner
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, object: NativeObject) -> NativeHandle {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        self.objects().insert(handle, object);
        self.inner.allocations.fetch_add(1, Ordering::Relaxed);
        handle
    }

    // Allocation

    /// Allocate a buffer holding `data` with shape `dims`.
    pub fn alloc_buffer(&self, dims: Vec<usize>, data: Vec<f32>) -> NativeHandle {
        self.insert(NativeObject::Buffer { dims, data })
    }

    /// Allocate a packed-sequence record over four existing buffers.
    pub fn alloc_packed(&self, members: [NativeHandle; 4]) -> Result<NativeHandle> {
        {
            let objects = self.objects();
            if let Some(missing) = members.iter().find(|&h| !objects.contains_key(h)) {
                return Err(Error::InvalidHandle(*missing));
            }
        }
        Ok(self.insert(NativeObject::Packed { members }))
    }

    // Access

    /// Run `f` over a buffer's dimensions and data.
    pub fn with_buffer<R>(
        &self,
        handle: NativeHandle,
        f: impl FnOnce(&[usize], &[f32]) -> R,
    ) -> Result<R> {
        match self.objects().get(&handle) {
            Some(NativeObject::Buffer { dims, data }) => Ok(f(dims, data)),
            Some(NativeObject::Packed { .. }) => Err(Error::msg(format!(
                "native handle {handle:#x} is a packed sequence, not a buffer"
            ))),
            None => Err(Error::InvalidHandle(handle)),
        }
    }

    /// Run `f` over a buffer's data, mutably.
    pub fn with_buffer_mut<R>(
        &self,
        handle: NativeHandle,
        f: impl FnOnce(&[usize], &mut [f32]) -> R,
    ) -> Result<R> {
        match self.objects().get_mut(&handle) {
            Some(NativeObject::Buffer { dims, data }) => Ok(f(dims, data)),
            Some(NativeObject::Packed { .. }) => Err(Error::msg(format!(
                "native handle {handle:#x} is a packed sequence, not a buffer"
            ))),
            None => Err(Error::InvalidHandle(handle)),
        }
    }

    /// Copy a buffer out of the library.
    pub fn read_buffer(&self, handle: NativeHandle) -> Result<(Vec<usize>, Vec<f32>)> {
        self.with_buffer(handle, |dims, data| (dims.to_vec(), data.to_vec()))
    }

    /// Member buffers of a packed-sequence record.
    pub fn packed_members(&self, handle: NativeHandle) -> Result<[NativeHandle; 4]> {
        match self.objects().get(&handle) {
            Some(NativeObject::Packed { members }) => Ok(*members),
            Some(NativeObject::Buffer { .. }) => Err(Error::msg(format!(
                "native handle {handle:#x} is a buffer, not a packed sequence"
            ))),
            None => Err(Error::InvalidHandle(handle)),
        }
    }

    // Release

    /// Free a handle. Fails with `InvalidHandle` if it is unknown or was
    /// already released.
    pub fn release(&self, handle: NativeHandle) -> Result<()> {
        let removed = self.objects().remove(&handle);
        match removed {
            Some(_) => {
                self.inner.releases.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => {
                self.inner.invalid_releases.fetch_add(1, Ordering::Relaxed);
                log::error!("release of unknown native handle {:#x}", handle);
                Err(Error::InvalidHandle(handle))
            }
        }
    }

    /// True while `handle` is allocated.
    pub fn is_live(&self, handle: NativeHandle) -> bool {
        self.objects().contains_key(&handle)
    }

    // Statistics

    /// Return a snapshot of the library counters.
    pub fn stats(&self) -> LibStats {
        let (live_handles, live_bytes) = {
            let objects = self.objects();
            (objects.len(), objects.values().map(NativeObject::nbytes).sum())
        };
        LibStats {
            allocations: self.inner.allocations.load(Ordering::Relaxed),
            releases: self.inner.releases.load(Ordering::Relaxed),
            invalid_releases: self.inner.invalid_releases.load(Ordering::Relaxed),
            live_handles,
            live_bytes,
        }
    }

    /// Reset the cumulative counters. Live handles are unaffected.
    pub fn reset_stats(&self) {
        self.inner.allocations.store(0, Ordering::Relaxed);
        self.inner.releases.store(0, Ordering::Relaxed);
        self.inner.invalid_releases.store(0, Ordering::Relaxed);
    }

    /// True if both values refer to the same library instance.
    pub fn same_lib(&self, other: &NativeLib) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for NativeLib {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NativeLib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLib")
            .field("stats", &self.stats())
            .finish()
    }
}
