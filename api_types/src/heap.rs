use crate::usage::{CacheMode, StorageMode};

/// A single backing allocation that sub-allocates buffers and textures.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct HeapDescriptor {
    pub size: u64,
    pub storage_mode: StorageMode,
    pub cache_mode: CacheMode,
}

impl HeapDescriptor {
    pub fn new(size: u64, storage_mode: StorageMode) -> Self {
        HeapDescriptor {
            size,
            storage_mode,
            cache_mode: CacheMode::DefaultCache,
        }
    }
}
