//! Rent/return pool for reusable objects
//!
//! Command buffers, meshes and material property blocks are rented for the
//! lifetime of a renderer or source and returned on disable, so enabling and
//! disabling does not churn allocations.

use std::fmt;

/// Generic object pool
pub struct ResourcePool<T> {
    name: &'static str,
    free: Vec<T>,
    create: fn() -> T,
    reset: fn(&mut T),
    max_retained: usize,
    created: usize,
    rented: usize,
}

impl<T> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("free", &self.free.len())
            .field("created", &self.created)
            .field("rented", &self.rented)
            .finish()
    }
}

impl<T> ResourcePool<T> {
    pub const DEFAULT_MAX_RETAINED: usize = 64;

    pub fn new(name: &'static str, create: fn() -> T, reset: fn(&mut T)) -> Self {
        Self {
            name,
            free: Vec::new(),
            create,
            reset,
            max_retained: Self::DEFAULT_MAX_RETAINED,
            created: 0,
            rented: 0,
        }
    }

    /// Upper bound on idle objects kept for reuse
    pub fn with_max_retained(mut self, max: usize) -> Self {
        self.max_retained = max;
        self
    }

    pub fn rent(&mut self) -> T {
        self.rented += 1;
        match self.free.pop() {
            Some(item) => item,
            None => {
                self.created += 1;
                tracing::trace!(pool = self.name, created = self.created, "pool allocated new object");
                (self.create)()
            }
        }
    }

    /// Give an object back. It is reset before being stored.
    pub fn give_back(&mut self, mut item: T) {
        self.rented = self.rented.saturating_sub(1);
        if self.free.len() >= self.max_retained {
            return;
        }
        (self.reset)(&mut item);
        self.free.push(item);
    }

    /// Objects currently rented out
    pub fn rented(&self) -> usize {
        self.rented
    }

    /// Idle objects ready for reuse
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Total objects ever constructed by this pool
    pub fn created(&self) -> usize {
        self.created
    }
}
