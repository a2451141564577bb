use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use vole_core::manager;
use vole_core::{bail, Disposable, Error, ResourceId, Result, Scoped, TrackedRef};

use crate::library::{NativeHandle, NativeLib};
use crate::tensor::Tensor;

// PackedSequence — A composite resource
//
// Packing a batch of variable-length sequences yields one native record plus
// four tensors that live and die with it:
//
//   data             — every sequence's elements, interleaved time step by time step
//   batch_sizes      — how many sequences are still running at each time step
//   sorted_indices   — batch order, longest sequence first
//   unsorted_indices — inverse permutation of sorted_indices
//
// All five allocations are registered on the current scope, the four tensors
// first and the record last, and every scope operation on the PackedSequence
// cascades over all of them in that order.
//
// Index tensors hold their integers as f32, the only element type the native
// library stores.

struct PackedRecord {
    id: ResourceId,
    handle: NativeHandle,
    lib: NativeLib,
    disposed: Cell<bool>,
}

impl Disposable for PackedRecord {
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
            panic!("failed to release packed sequence {}: {}", self.id, e);
        }
        true
    }

    fn kind(&self) -> &'static str {
        "packed_sequence"
    }
}

impl Drop for PackedRecord {
    fn drop(&mut self) {
        if self.release() {
            manager::notify_dropped(self.id);
        }
    }
}

/// A batch of variable-length sequences in packed layout.
#[derive(Clone)]
pub struct PackedSequence {
    data: Tensor,
    batch_sizes: Tensor,
    sorted_indices: Tensor,
    unsorted_indices: Tensor,
    record: Rc<PackedRecord>,
}

impl PackedSequence {
    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn batch_sizes(&self) -> &Tensor {
        &self.batch_sizes
    }

    pub fn sorted_indices(&self) -> &Tensor {
        &self.sorted_indices
    }

    pub fn unsorted_indices(&self) -> &Tensor {
        &self.unsorted_indices
    }

    pub fn id(&self) -> ResourceId {
        self.record.id
    }

    /// Native handle of the packed record itself. Fails once disposed.
    pub fn handle(&self) -> Result<NativeHandle> {
        self.ensure_live()?;
        Ok(self.record.handle)
    }

    /// Number of sequences in the batch.
    pub fn batch_len(&self) -> usize {
        self.sorted_indices.elem_count()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.record.disposed.get() {
            return Err(Error::Disposed {
                resource: self.record.id,
            });
        }
        Ok(())
    }

    fn indices(tensor: &Tensor) -> Result<Vec<usize>> {
        Ok(tensor.to_vec()?.into_iter().map(|v| v as usize).collect())
    }

    /// Length of each sequence, in the caller's original order.
    pub fn lengths(&self) -> Result<Vec<usize>> {
        self.ensure_live()?;
        let batch_sizes = Self::indices(&self.batch_sizes)?;
        let unsorted = Self::indices(&self.unsorted_indices)?;
        // The sequence at sorted position k runs for as many steps as have
        // a batch size greater than k.
        Ok(unsorted
            .iter()
            .map(|&k| batch_sizes.iter().filter(|&&b| b > k).count())
            .collect())
    }

    /// Unpack into a `[batch, max_len]` tensor in the original order, with
    /// positions past each sequence's end set to `padding_value`.
    pub fn to_padded(&self, padding_value: f32) -> Result<Tensor> {
        self.ensure_live()?;
        let data = self.data.to_vec()?;
        let batch_sizes = Self::indices(&self.batch_sizes)?;
        let unsorted = Self::indices(&self.unsorted_indices)?;
        let batch = unsorted.len();
        let max_len = batch_sizes.len();

        let mut out = vec![padding_value; batch * max_len];
        let mut offset = 0;
        for (t, &running) in batch_sizes.iter().enumerate() {
            for (row, &k) in unsorted.iter().enumerate() {
                if k < running {
                    out[row * max_len + t] = data[offset + k];
                }
            }
            offset += running;
        }
        Tensor::from_slice(&out, &[batch, max_len], self.data.lib())
    }
}

impl Scoped for PackedSequence {
    fn tracked(&self) -> Vec<TrackedRef> {
        let record: TrackedRef = self.record.clone();
        vec![
            self.data.tracked_ref(),
            self.batch_sizes.tracked_ref(),
            self.sorted_indices.tracked_ref(),
            self.unsorted_indices.tracked_ref(),
            record,
        ]
    }
}

impl fmt::Debug for PackedSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedSequence")
            .field("id", &self.record.id)
            .field("handle", &format_args!("{:#x}", self.record.handle))
            .field("data", &self.data)
            .field("batch_sizes", &self.batch_sizes)
            .field("disposed", &self.record.disposed.get())
            .finish()
    }
}

/// Pack a batch of 1-D sequences.
///
/// With `enforce_sorted`, the sequences must already be ordered by length,
/// longest first; otherwise they are sorted (stably) and the permutation is
/// recorded in `sorted_indices` / `unsorted_indices`.
pub fn pack_sequence(sequences: &[Tensor], enforce_sorted: bool) -> Result<PackedSequence> {
    let Some(first) = sequences.first() else {
        bail!("pack_sequence: cannot pack an empty batch");
    };
    let lib = first.lib().clone();

    let mut contents = Vec::with_capacity(sequences.len());
    for (i, seq) in sequences.iter().enumerate() {
        if seq.rank() != 1 {
            bail!("pack_sequence: sequence {i} must be 1-D, got dims {:?}", seq.dims());
        }
        if seq.elem_count() == 0 {
            bail!("pack_sequence: sequence {i} is empty");
        }
        if !seq.lib().same_lib(&lib) {
            bail!("pack_sequence: sequence {i} belongs to a different native library");
        }
        contents.push(seq.to_vec()?);
    }
    let lengths: Vec<usize> = contents.iter().map(Vec::len).collect();

    if enforce_sorted && lengths.windows(2).any(|w| w[0] < w[1]) {
        bail!("pack_sequence: sequences must be sorted by length in decreasing order, got {lengths:?}");
    }

    let mut sorted: Vec<usize> = (0..lengths.len()).collect();
    sorted.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
    let mut unsorted = vec![0usize; sorted.len()];
    for (k, &i) in sorted.iter().enumerate() {
        unsorted[i] = k;
    }

    let max_len = lengths[sorted[0]];
    let mut data = Vec::with_capacity(lengths.iter().sum());
    let mut batch_sizes = Vec::with_capacity(max_len);
    for t in 0..max_len {
        let mut running = 0usize;
        for &i in &sorted {
            if lengths[i] > t {
                data.push(contents[i][t]);
                running += 1;
            }
        }
        batch_sizes.push(running as f32);
    }

    let as_f32 = |v: &[usize]| v.iter().map(|&x| x as f32).collect::<Vec<f32>>();
    let data = Tensor::from_slice(&data, &[data.len()], &lib)?;
    let batch_sizes = Tensor::from_slice(&batch_sizes, &[max_len], &lib)?;
    let sorted_indices = Tensor::from_slice(&as_f32(&sorted), &[sorted.len()], &lib)?;
    let unsorted_indices = Tensor::from_slice(&as_f32(&unsorted), &[unsorted.len()], &lib)?;

    let handle = lib.alloc_packed([
        data.handle()?,
        batch_sizes.handle()?,
        sorted_indices.handle()?,
        unsorted_indices.handle()?,
    ])?;
    let record = Rc::new(PackedRecord {
        id: ResourceId::next(),
        handle,
        lib,
        disposed: Cell::new(false),
    });
    let tracked: TrackedRef = record.clone();
    if let Err(e) = manager::register_on_current(tracked) {
        record.release();
        return Err(e);
    }

    log::debug!(
        "packed {} sequences ({} elements, max length {}) into {}",
        sequences.len(),
        data.elem_count(),
        max_len,
        record.id
    );
    Ok(PackedSequence {
        data,
        batch_sizes,
        sorted_indices,
        unsorted_indices,
        record,
    })
}
