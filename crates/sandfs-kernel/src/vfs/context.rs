//! Access contexts.
//!
//! An [`AccessContext`] is what a caller holds while it works with the
//! sandbox: its visibility view, the listings its per-context mounts
//! returned, and the dynamic file content it has resolved. Nothing another
//! context does replaces either table, so repeated lookups within one
//! context stay consistent while two agents sharing a sandbox can see
//! different listings.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sandfs_types::{VfsPath, VisibilityView};

use super::view::Layer;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A caller's view of the sandbox.
pub struct AccessContext {
    id: u64,
    view: VisibilityView,
    /// Listings from per-context mounts, by mount path.
    layers: Mutex<HashMap<VfsPath, Layer>>,
    /// Resolved dynamic content with the content epoch it was resolved at.
    resolved: Mutex<HashMap<VfsPath, (u64, Vec<u8>)>>,
}

impl fmt::Debug for AccessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessContext")
            .field("id", &self.id)
            .field("view", &self.view)
            .finish_non_exhaustive()
    }
}

fn lock<T>(table: &Mutex<T>) -> MutexGuard<'_, T> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AccessContext {
    pub fn new(view: VisibilityView) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            view,
            layers: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn unrestricted() -> Self {
        Self::new(VisibilityView::unrestricted())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn view(&self) -> &VisibilityView {
        &self.view
    }

    pub(crate) fn layer(&self, mount: &VfsPath) -> Option<Layer> {
        lock(&self.layers).get(mount).cloned()
    }

    pub(crate) fn layer_generation(&self, mount: &VfsPath) -> Option<u64> {
        lock(&self.layers).get(mount).map(|layer| layer.generation)
    }

    /// Keep `layer` unless this context already holds a listing of the same
    /// generation.
    pub(crate) fn store_layer(&self, layer: Layer) {
        let mut layers = lock(&self.layers);
        match layers.get(&layer.root) {
            Some(held) if held.generation == layer.generation => {}
            _ => {
                layers.insert(layer.root.clone(), layer);
            }
        }
    }

    /// Drop the node at `path` from every listing that holds it.
    pub(crate) fn prune_layers(&self, path: &VfsPath) {
        for layer in lock(&self.layers).values_mut() {
            if let Some(pruned) = layer.without(path) {
                *layer = pruned;
            }
        }
    }

    pub(crate) fn resolved(&self, file: &VfsPath, epoch: u64) -> Option<Vec<u8>> {
        match lock(&self.resolved).get(file) {
            Some((at, bytes)) if *at == epoch => Some(bytes.clone()),
            _ => None,
        }
    }

    pub(crate) fn resolved_len(&self, file: &VfsPath, epoch: u64) -> Option<u64> {
        match lock(&self.resolved).get(file) {
            Some((at, bytes)) if *at == epoch => Some(bytes.len() as u64),
            _ => None,
        }
    }

    pub(crate) fn store_resolved(&self, file: &VfsPath, epoch: u64, bytes: Vec<u8>) {
        lock(&self.resolved).insert(file.clone(), (epoch, bytes));
    }
}

impl Default for AccessContext {
    fn default() -> Self {
        Self::unrestricted()
    }
}
