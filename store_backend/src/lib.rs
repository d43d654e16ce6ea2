//! The back-end adapter contract of the storage layer.
//!
//! Every storage driver, including the write-back cache that wraps one, exposes
//! the same surface: four asynchronous submit operations, a pair of
//! publish-subscribe completion channels, and a handful of synchronous
//! lifecycle hooks. See [`StoreBackend`].
//!
//! Two drivers live here: [`mem::MemBackend`] keeps records in memory only,
//! [`file::DebugFileBackend`] adds JSON-lines persistence for debugging.
//! [`test_util`] provides a scriptable mock for exercising the layers above.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod core;
pub mod file;
pub mod mem;
mod ops;
pub mod test_util;

pub use crate::core::*;
