use crate::usage::{CacheMode, ResourceUsageFlags, StorageMode};

/// Immutable description of a buffer. Created once, compared verbatim when
/// a backing is replaced.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct BufferDescriptor {
    pub length: u64,
    pub storage_mode: StorageMode,
    pub cache_mode: CacheMode,
    pub usage: ResourceUsageFlags,
}

impl BufferDescriptor {
    pub fn new(length: u64, storage_mode: StorageMode, usage: ResourceUsageFlags) -> Self {
        BufferDescriptor {
            length,
            storage_mode,
            cache_mode: CacheMode::DefaultCache,
            usage,
        }
    }
}
