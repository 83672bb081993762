//! Backend resource handles.
//!
//! A backend hands out [`ResourceId`]s instead of pointers. Each id carries a
//! reference count kept in a [`ResourceTable`]; the [`Resource`] guard
//! releases its reference exactly once, on drop.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lxkit_common::error::{LxkitError, Result};

use crate::backend::IsolationBackend;

/// Opaque token naming one backend resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

#[derive(Debug)]
struct Slot<T> {
    value: T,
    refs: usize,
}

/// Reference-counted table of backend resources.
#[derive(Debug)]
pub struct ResourceTable<T> {
    next: AtomicU64,
    slots: Mutex<HashMap<ResourceId, Slot<T>>>,
}

impl<T: Clone> ResourceTable<T> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Stores `value` with a reference count of one.
    pub fn insert(&self, value: T) -> ResourceId {
        let id = ResourceId(self.next.fetch_add(1, Ordering::Relaxed));
        let _ = self.lock().insert(id, Slot { value, refs: 1 });
        id
    }

    /// Adds a reference and returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`LxkitError::NotFound`] if the id was already fully released.
    pub fn acquire(&self, id: ResourceId) -> Result<usize> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&id).ok_or_else(|| not_found(id))?;
        slot.refs += 1;
        Ok(slot.refs)
    }

    /// Drops a reference and returns the remaining count. The entry is
    /// removed when the count reaches zero.
    ///
    /// # Errors
    ///
    /// Returns [`LxkitError::NotFound`] if the id was already fully released,
    /// so a double release never goes unnoticed.
    pub fn release(&self, id: ResourceId) -> Result<usize> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&id).ok_or_else(|| not_found(id))?;
        slot.refs -= 1;
        let remaining = slot.refs;
        if remaining == 0 {
            let _ = slots.remove(&id);
        }
        Ok(remaining)
    }

    /// Returns a copy of the value behind `id`.
    ///
    /// # Errors
    ///
    /// Returns [`LxkitError::NotFound`] if the id is not live.
    pub fn get(&self, id: ResourceId) -> Result<T> {
        self.lock()
            .get(&id)
            .map(|slot| slot.value.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Returns the number of live resources.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns whether no resource is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceId, Slot<T>>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T: Clone> Default for ResourceTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(id: ResourceId) -> LxkitError {
    LxkitError::NotFound {
        kind: "backend resource",
        id: id.to_string(),
    }
}

/// Scoped reference to a backend resource, released on drop.
pub struct Resource {
    id: ResourceId,
    backend: Arc<dyn IsolationBackend>,
}

impl Resource {
    /// Opens a new backend resource for the container `name` defined in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot allocate the resource.
    pub fn open(
        backend: Arc<dyn IsolationBackend>,
        name: &str,
        dir: &std::path::Path,
    ) -> Result<Self> {
        let id = backend.open(name, dir)?;
        tracing::debug!(name, resource = %id, "backend resource opened");
        Ok(Self { id, backend })
    }

    /// Takes another reference to the same backend resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend no longer knows the resource.
    pub fn share(&self) -> Result<Self> {
        let refs = self.backend.acquire(self.id)?;
        tracing::debug!(resource = %self.id, refs, "backend resource shared");
        Ok(Self {
            id: self.id,
            backend: Arc::clone(&self.backend),
        })
    }

    /// Returns the backend-side id.
    #[must_use]
    pub const fn id(&self) -> ResourceId {
        self.id
    }

    /// Returns the backend owning the resource.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        match self.backend.release(self.id) {
            Ok(refs) => tracing::debug!(resource = %self.id, refs, "backend resource released"),
            Err(e) => tracing::warn!(resource = %self.id, error = %e, "backend resource release failed"),
        }
    }
}
