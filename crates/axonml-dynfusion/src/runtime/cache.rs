//! Kernel Cache
//!
//! Caches compiled kernels for reuse across composite operators.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};

use crate::blueprint::ClKernelCode;

/// Cache for compiled kernels.
pub struct KernelCache {
    cache: RwLock<FxHashMap<u64, Arc<ClKernelCode>>>,
    max_size: usize,
}

impl KernelCache {
    /// Creates a new kernel cache.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: RwLock::new(FxHashMap::default()),
            max_size,
        }
    }

    /// Creates a cache with default size (256).
    pub fn default_size() -> Self {
        Self::new(256)
    }

    /// Computes the key of a kernel: its config id, build options, source
    /// and component program, including every operand shape.
    pub fn key(code: &ClKernelCode) -> u64 {
        let mut hasher = FxHasher::default();
        code.config_id.hash(&mut hasher);
        code.name.hash(&mut hasher);
        code.build_options.hash(&mut hasher);
        code.code.hash(&mut hasher);
        code.program.hash(&mut hasher);
        hasher.finish()
    }

    /// Gets a cached kernel.
    pub fn get(&self, key: u64) -> Option<Arc<ClKernelCode>> {
        self.cache.read().get(&key).cloned()
    }

    /// Inserts a kernel, evicting an arbitrary entry when full.
    pub fn insert(&self, key: u64, code: Arc<ClKernelCode>) {
        let mut cache = self.cache.write();
        if cache.len() >= self.max_size && !cache.contains_key(&key) {
            if let Some(&first_key) = cache.keys().next() {
                cache.remove(&first_key);
            }
        }
        cache.insert(key, code);
    }

    /// Returns the cached copy of `code`, inserting it first if needed.
    pub fn get_or_insert(&self, code: &ClKernelCode) -> Arc<ClKernelCode> {
        let key = Self::key(code);
        if let Some(cached) = self.get(key) {
            return cached;
        }
        let code = Arc::new(code.clone());
        self.insert(key, Arc::clone(&code));
        code
    }

    /// Returns the number of cached kernels.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Returns whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    /// Clears the cache.
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            max_size: self.max_size,
        }
    }
}

impl Default for KernelCache {
    fn default() -> Self {
        Self::default_size()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    /// Number of cached entries.
    pub entries: usize,
    /// Maximum cache size.
    pub max_size: usize,
}

impl CacheStats {
    /// Returns the utilization as a percentage.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.entries as f64 / self.max_size as f64) * 100.0
        }
    }
}
