// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Free list of decoded values for typed handlers.
//!
//! Without a reset callback every `get` allocates a fresh value. With one, a
//! value returns to the list when its `Pooled` guard drops, after the reset
//! ran, so no two handler invocations ever share a live value.

use parking_lot::Mutex;
use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

type Reset<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

/// Cheap to clone, clones share the same free list.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T> {
    free: Mutex<Vec<Box<T>>>,
    reset: Option<Reset<T>>,
}

impl<T: Default> Pool<T> {
    pub fn new() -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(vec![]),
                reset: None,
            }),
        }
    }

    /// Enables reuse, `reset` clears a value before it goes back to the list.
    pub fn with_reset<F>(reset: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        Pool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(vec![]),
                reset: Some(Arc::new(reset)),
            }),
        }
    }

    /// A free value when reuse is enabled, a new default one otherwise.
    pub fn get(&self) -> Pooled<T> {
        let value = match self.inner.reset {
            Some(_) => self.inner.free.lock().pop(),
            None => None,
        };

        Pooled {
            value: Some(value.unwrap_or_default()),
            pool: self.inner.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl<T> PoolInner<T> {
    fn put(&self, mut value: Box<T>) {
        if let Some(reset) = &self.reset {
            reset(&mut value);
            self.free.lock().push(value);
        }
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Default> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A value borrowed from a `Pool`, given back on drop.
pub struct Pooled<T: Default> {
    value: Option<Box<T>>,
    pool: Arc<PoolInner<T>>,
}

impl<T: Default> Pooled<T> {
    /// Takes the value out, it will not return to the pool.
    pub fn into_inner(mut self) -> T {
        self.value.take().map(|v| *v).unwrap_or_default()
    }
}

impl<T: Default> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `into_inner` and `drop` take the value.
        self.value.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Default> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Default> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.put(value);
        }
    }
}

impl<T: Default + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}
