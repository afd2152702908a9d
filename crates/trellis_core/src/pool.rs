//! Object pool for structured component data
//!
//! Multi-property components rebuild their data map on every change and hand
//! the previous map to `update`. Pooling those maps means the steady state of
//! a scene with thousands of per-frame position/rotation writes allocates
//! nothing: a recycled map keeps its key set and its heap buffers, only the
//! values are reset.
//!
//! # Example
//!
//! ```rust
//! use trellis_core::pool::ObjectPool;
//! use trellis_core::PropMap;
//!
//! let mut pool: ObjectPool<PropMap> = ObjectPool::new();
//! let map = pool.use_object();
//! let addr = &*map as *const PropMap;
//! pool.recycle(map);
//! assert_eq!(&*pool.use_object() as *const PropMap, addr);
//! ```

use crate::value::{PropMap, PropValue};

/// Number of objects allocated the first time an empty pool is used
const SEED_SIZE: usize = 10;

/// Types that can be reset for reuse without changing their shape
pub trait Poolable {
    /// Reset contents while keeping structure (and allocations) intact
    fn clear_object(&mut self);
}

impl Poolable for PropMap {
    fn clear_object(&mut self) {
        for value in self.values_mut() {
            *value = PropValue::Null;
        }
    }
}

/// A stack-like pool of boxed objects
///
/// The most recently recycled object is the next one handed out.
pub struct ObjectPool<T: Poolable> {
    free: Vec<Box<T>>,
    factory: fn() -> T,
    allocated: usize,
}

impl<T: Poolable + Default> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Poolable + Default> ObjectPool<T> {
    /// Create an empty pool using `T::default` as the factory
    pub fn new() -> Self {
        Self::with_factory(T::default)
    }
}

impl<T: Poolable> ObjectPool<T> {
    /// Create an empty pool with a custom factory
    pub fn with_factory(factory: fn() -> T) -> Self {
        Self {
            free: Vec::new(),
            factory,
            allocated: 0,
        }
    }

    /// Take a cleared object, growing the pool if exhausted
    pub fn use_object(&mut self) -> Box<T> {
        if self.free.is_empty() {
            let grow_by = if self.allocated == 0 {
                SEED_SIZE
            } else {
                self.allocated
            };
            self.grow(grow_by);
        }
        match self.free.pop() {
            Some(mut obj) => {
                obj.clear_object();
                obj
            }
            // grow() always pushes at least one object
            None => Box::new((self.factory)()),
        }
    }

    /// Return an object to the pool
    pub fn recycle(&mut self, obj: Box<T>) {
        self.free.push(obj);
    }

    /// Pre-allocate `count` more objects
    pub fn grow(&mut self, count: usize) {
        let count = count.max(1);
        self.free.reserve(count);
        // New objects go underneath the free stack so recycled ones stay on top
        let fresh: Vec<Box<T>> = (0..count).map(|_| Box::new((self.factory)())).collect();
        self.free.splice(0..0, fresh);
        self.allocated += count;
    }

    /// Total objects ever allocated by this pool
    pub fn size(&self) -> usize {
        self.allocated
    }

    /// Objects currently available for reuse
    pub fn available(&self) -> usize {
        self.free.len()
    }
}
