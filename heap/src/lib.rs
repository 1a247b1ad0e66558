//! Minimal heap allocator surface for the persistence pipeline.
//!
//! This crate is decoupled from any specific VM: it hands out raw
//! allocations, answers address containment queries, and walks the
//! allocated region linearly given a consumer-supplied [`SizeFn`].

mod space;

pub use space::{OBJECT_ALIGNMENT, SizeFn, Space, align_object_size};
