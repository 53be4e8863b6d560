//! Pool of reusable transfer handles.
//!
//! Constructing a libcurl easy handle is not free, so finished handles are
//! parked here and reset before the next request takes them. The pool never
//! caps its size: when concurrency rises above the previous peak a new handle
//! is built instead of making the request wait.

use curl::easy::Easy2;
use tracing::trace;

use super::collector::Collector;

/// A resource the pool can build from scratch and return to default state.
pub(crate) trait Reusable {
    /// Builds a fresh resource.
    fn create() -> Self;

    /// Returns the resource to its default state before reuse.
    fn reset(&mut self);
}

impl Reusable for Easy2<Collector> {
    fn create() -> Self {
        Easy2::new(Collector::default())
    }

    fn reset(&mut self) {
        Easy2::reset(self);
        self.get_mut().clear();
    }
}

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles constructed over the pool's lifetime.
    pub created: usize,
    /// Handles currently parked in the pool.
    pub idle: usize,
}

/// Unbounded, lazily grown set of idle handles.
#[derive(Debug)]
pub(crate) struct HandlePool<T> {
    idle: Vec<T>,
    created: usize,
}

impl<T> Default for HandlePool<T> {
    fn default() -> Self {
        Self {
            idle: Vec::new(),
            created: 0,
        }
    }
}

impl<T: Reusable> HandlePool<T> {
    /// Takes an idle handle, resetting it, or builds a new one.
    pub(crate) fn acquire(&mut self) -> T {
        if let Some(mut handle) = self.idle.pop() {
            handle.reset();
            trace!(idle = self.idle.len(), "reusing pooled handle");
            return handle;
        }
        self.created += 1;
        trace!(created = self.created, "constructing new handle");
        T::create()
    }

    /// Parks a handle for reuse.
    ///
    /// Callers must have detached the handle from the multi handle first.
    pub(crate) fn release(&mut self, handle: T) {
        self.idle.push(handle);
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created,
            idle: self.idle.len(),
        }
    }
}
