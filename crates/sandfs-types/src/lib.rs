//! Pure data types for sandfs: paths, policies, events, errors.
//!
//! This crate is a leaf dependency with no async runtime and no I/O.
//! It exists so that consumers (shells, embedders, snapshot tooling) can work
//! with sandbox paths, policies and errors without pulling in the kernel.

pub mod entry;
pub mod error;
pub mod event;
pub mod path;
pub mod policy;
pub mod snapshot;

// Flat re-exports for convenience
pub use entry::*;
pub use error::*;
pub use event::*;
pub use path::*;
pub use policy::*;
pub use snapshot::*;
