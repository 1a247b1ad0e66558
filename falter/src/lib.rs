//! Persistence and relocation core of the falter VM.
//!
//! A [`Program`] owns a space of heap objects (classes, functions,
//! constants). This crate can fold it into a compact tables-based form and
//! back ([`folder`]), emit a position-independent image of the whole heap
//! at an arbitrary base address ([`relocate`]), and persist/restore such
//! images ([`image`]). Intrinsic references are resolved through an
//! immutable [`IntrinsicsTable`].
//!
//! Execution, compilation and garbage collection live elsewhere; the one
//! precondition this crate leans on is that no process runs against a
//! program while it is being folded, unfolded or relocated.

pub mod alloc;
pub mod folder;
pub mod image;
pub mod intrinsics;
pub mod program;
pub mod refcount;
pub mod relocate;
pub mod rewriter;
mod trace;

#[cfg(test)]
pub(crate) mod testutil;

pub use folder::{FoldOptions, ProgramFolder, UnfoldError};
pub use intrinsics::{Intrinsic, IntrinsicFn, IntrinsicsTable};
pub use program::{Program, ProgramMode};
pub use refcount::Refcounted;
pub use relocate::{
    ImageHeader, ProgramHeapRelocator, RelocateError, relocated_size,
};
pub use rewriter::{ProgramTableRewriter, TableKind};
pub use trace::{OBJECT_SIZE_FN, object_size, trace_object};
