//! sandfs kernel: the in-memory sandbox tree and everything that acts on it.
//!
//! The kernel owns:
//! - **vfs**: the node tree, providers and hydration, versioned writes
//! - **policy**: per-path policies and visibility filtering
//! - **hooks**: write and path hooks, dispatched after each commit
//! - **bridge**: materialize a subtree on the host, run a command, import changes
//! - **snapshot**: serialize and restore the concrete tree
//!
//! Everything an agent touches goes through a [`VirtualFileSystem`] and an
//! [`AccessContext`] that carries the caller's visibility view.

pub mod bridge;
pub mod config;
pub mod hooks;
pub mod policy;
pub mod provider;
pub mod snapshot;
pub mod vfs;

pub use bridge::{BridgePhase, CommandResult, HostCommand, ImportOutcome, ImportStatus};
pub use config::SandboxConfig;
pub use hooks::{PathHook, WriteHook};
pub use provider::{
    ContentProvider, DirectoryProvider, Listing, NodeContext, ProvidedContent, ProvidedNode,
    RefreshPolicy, content_fn, provider_fn,
};
pub use snapshot::Snapshot;
pub use vfs::{AccessContext, VirtualFileSystem};

// Re-export the data types so embedders need a single dependency.
pub use sandfs_types::*;
