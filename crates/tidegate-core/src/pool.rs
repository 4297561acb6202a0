//! Rent/return object pool.
//!
//! The dispatch hot path must not allocate beyond the pooled context, so
//! dispatch contexts, TX assembly buffers, and hub snapshot arrays are
//! rented from these pools and returned on every exit path. The pool is
//! deliberately small and lock-based: rentals are short and the contention
//! window is a few instructions.

use std::sync::{Mutex, PoisonError};

/// A bounded stack of reusable objects.
///
/// `rent_or` pops an object or builds a fresh one; `give` returns it unless
/// the pool is already full, in which case the object is simply dropped.
/// Nothing tracks outstanding rentals - an object that never comes back is
/// just an allocation, not a leak of pool capacity.
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    max_pooled: usize,
}

impl<T> Pool<T> {
    /// Create a pool retaining at most `max_pooled` idle objects.
    #[must_use]
    pub fn new(max_pooled: usize) -> Self {
        Self { items: Mutex::new(Vec::new()), max_pooled }
    }

    /// Rent an object, building one with `make` if the pool is empty.
    pub fn rent_or(&self, make: impl FnOnce() -> T) -> T {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(make)
    }

    /// Return an object to the pool.
    pub fn give(&self, item: T) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.len() < self.max_pooled {
            items.push(item);
        }
    }

    /// Number of idle objects currently pooled.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Pool of reusable byte buffers for TX frame assembly.
pub type BufferPool = Pool<Vec<u8>>;

impl BufferPool {
    /// Rent a cleared buffer.
    pub fn rent_buffer(&self) -> Vec<u8> {
        let mut buf = self.rent_or(Vec::new);
        buf.clear();
        buf
    }
}
