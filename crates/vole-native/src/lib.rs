// Native tensors — Scope-tracked wrappers over a handle-based tensor library
//
// This crate provides the trackable resources the scope system exists for.
// Everything that touches native memory goes through `NativeLib`, which hands
// out opaque handles and must get each one back exactly once.
//
// ARCHITECTURE:
// - NativeLib is the handle table (allocate, read, write, release, stats)
// - Tensor wraps one buffer handle; every constructor and operation
//   registers its result with the calling thread's innermost scope
// - PackedSequence wraps a native record plus four tensors and cascades
//   every scope operation over all five
//
// USAGE:
//   let lib = NativeLib::new();
//   let y = with_scope(|_| {
//       let x = Tensor::randn(&[4, 4], &lib)?;
//       let y = x.matmul(&x)?.relu()?;
//       y.move_to_outer()?;
//       Ok::<_, Error>(y)
//   })?;

pub mod library;
pub mod packed;
pub mod tensor;

pub use library::{LibStats, NativeHandle, NativeLib};
pub use packed::{pack_sequence, PackedSequence};
pub use tensor::Tensor;
