//! A Grove owns many heterogeneous Trees, keyed by payload type, and offers
//! bulk operations over their Tangles. Pure composition: every invariant is
//! enforced by the Trees and Tangles themselves.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use acorn_core::{AcornError, AcornResult, Payload, Tree, TreeStats};
use parking_lot::{Mutex, RwLock};

use crate::error::SyncResult;
use crate::sink::TangleSink;
use crate::tangle::{Tangle, TangleStats};

#[derive(Default)]
pub struct Grove {
    entries: RwLock<HashMap<TypeId, GroveEntry>>,
}

struct GroveEntry {
    type_name: &'static str,
    tree: Box<dyn Any + Send + Sync>,
    handle: Box<dyn GroveHandle>,
}

/// Type-erased view over one planted Tree for the bulk operations.
trait GroveHandle: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn stats(&self) -> TreeStats;
    #[cfg(feature = "http-client")]
    fn entangle_remote(&self, url: &str) -> SyncResult<()>;
    fn tangle_stats(&self) -> Vec<TangleStats>;
    fn shake_all(&self) -> SyncResult<()>;
}

struct TypedHandle<T: Payload> {
    tree: Tree<T>,
    tangles: Mutex<Vec<Tangle<T>>>,
}

impl<T: Payload> GroveHandle for TypedHandle<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn stats(&self) -> TreeStats {
        self.tree.stats()
    }

    #[cfg(feature = "http-client")]
    fn entangle_remote(&self, url: &str) -> SyncResult<()> {
        let sink = crate::sink::HttpSink::new(url)?;
        self.tangles.lock().push(Tangle::new(&self.tree, sink));
        Ok(())
    }

    fn tangle_stats(&self) -> Vec<TangleStats> {
        self.tangles.lock().iter().map(Tangle::stats).collect()
    }

    fn shake_all(&self) -> SyncResult<()> {
        for tangle in self.tangles.lock().iter() {
            tangle.shake()?;
        }
        Ok(())
    }
}

impl Grove {
    pub fn new() -> Self {
        Grove::default()
    }

    /// Register a Tree. One Tree per element type.
    pub fn plant<T: Payload>(&self, tree: Tree<T>) -> AcornResult<()> {
        let mut entries = self.entries.write();
        let type_id = TypeId::of::<T>();
        if entries.contains_key(&type_id) {
            return Err(AcornError::InvalidInput(format!(
                "a tree for {} is already planted",
                std::any::type_name::<T>()
            )));
        }
        entries.insert(
            type_id,
            GroveEntry {
                type_name: std::any::type_name::<T>(),
                tree: Box::new(tree.clone()),
                handle: Box::new(TypedHandle {
                    tree,
                    tangles: Mutex::new(Vec::new()),
                }),
            },
        );
        Ok(())
    }

    pub fn get<T: Payload>(&self) -> Option<Tree<T>> {
        self.entries
            .read()
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.tree.downcast_ref::<Tree<T>>())
            .cloned()
    }

    pub fn tree_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Attach a Tangle to an already-planted Tree.
    pub fn entangle<T: Payload>(&self, sink: impl TangleSink<T>) -> AcornResult<()> {
        let entries = self.entries.read();
        let entry = entries.get(&TypeId::of::<T>()).ok_or_else(|| {
            AcornError::InvalidInput(format!(
                "no tree planted for {}",
                std::any::type_name::<T>()
            ))
        })?;
        let handle = entry
            .handle
            .as_any()
            .downcast_ref::<TypedHandle<T>>()
            .expect("handle type matches entry type");
        handle.tangles.lock().push(Tangle::new(&handle.tree, sink));
        Ok(())
    }

    /// Create an HTTP Tangle for every planted Tree against the same remote,
    /// routed by element type name (`<base>/<type>`).
    #[cfg(feature = "http-client")]
    pub fn entangle_all(&self, base_url: &str) -> SyncResult<()> {
        let base = base_url.trim_end_matches('/');
        for entry in self.entries.read().values() {
            let route = format!("{base}/{}", short_type_name(entry.type_name));
            entry.handle.entangle_remote(&route)?;
        }
        Ok(())
    }

    /// Aggregated counters over every Tangle in the Grove.
    pub fn tangle_stats(&self) -> Vec<TangleStats> {
        self.entries
            .read()
            .values()
            .flat_map(|entry| entry.handle.tangle_stats())
            .collect()
    }

    pub fn tree_stats(&self) -> Vec<(&'static str, TreeStats)> {
        self.entries
            .read()
            .values()
            .map(|entry| (entry.type_name, entry.handle.stats()))
            .collect()
    }

    /// Shake every Tangle once; stops at the first failure.
    pub fn shake_all(&self) -> SyncResult<()> {
        for entry in self.entries.read().values() {
            entry.handle.shake_all()?;
        }
        Ok(())
    }
}

/// Last path segment of a full type name, lowercased for URL routing.
#[cfg(feature = "http-client")]
fn short_type_name(full: &str) -> String {
    full.rsplit("::").next().unwrap_or(full).to_ascii_lowercase()
}
