//! This crate pins the tracing ecosystem for every workspace member so that
//! log levels and subscriber wiring stay consistent across the storage layer.
//!
//! Import the facade through this crate rather than depending on `tracing`
//! directly:
//!
//! ```
//! use observability_deps::tracing::debug;
//!
//! debug!("something happened");
//! ```
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
