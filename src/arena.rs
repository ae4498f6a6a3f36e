use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::tensor::{DType, Tensor};

/// Process-wide reusable tensor arena. KV caches and transfer scratch buffers
/// are leased from here for the lifetime of one call and returned afterwards;
/// a lease with the same name and layout reuses the previous storage.
#[derive(Debug, Default)]
pub struct MemoryArena {
    inner: Mutex<ArenaInner>,
}

#[derive(Debug, Default)]
struct ArenaInner {
    free: HashMap<String, Tensor>,
    leased: BTreeSet<String>,
}

impl MemoryArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease a named buffer of the given layout. Recycles the stored tensor
    /// when the layout matches, zeroing it if `force_zero` is set.
    pub fn acquire(
        &self,
        name: &str,
        shape: Vec<usize>,
        dtype: DType,
        force_zero: bool,
    ) -> Tensor {
        let mut inner = self.inner.lock().expect("arena poisoned");
        inner.leased.insert(name.to_string());
        if let Some(t) = inner.free.remove(name) {
            if t.shape() == shape.as_slice() && t.dtype() == dtype {
                return if force_zero {
                    Tensor::zeros(shape, dtype)
                } else {
                    t
                };
            }
        }
        Tensor::zeros(shape, dtype)
    }

    /// Return a leased buffer so later calls can reuse its storage.
    pub fn release(&self, name: &str, tensor: Tensor) {
        let mut inner = self.inner.lock().expect("arena poisoned");
        inner.leased.remove(name);
        inner.free.insert(name.to_string(), tensor);
    }

    /// Drop the lease without returning storage (buffer was consumed).
    pub fn forget(&self, name: &str) {
        let mut inner = self.inner.lock().expect("arena poisoned");
        inner.leased.remove(name);
    }

    /// Number of currently leased buffers.
    pub fn leased_count(&self) -> usize {
        self.inner.lock().expect("arena poisoned").leased.len()
    }
}
