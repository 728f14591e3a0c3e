use api_types::handle::ResourceHandle;
use api_types::usage::{ResourceAccess, StageMask, SubresourceMask};

/// One pass's accumulated access to one resource. Repeated bindings and
/// `use_resource` calls against the same resource collapse into a single
/// record; `consistent_usage` stays set only while access and stages never
/// change across the pass, which lets the compactor hoist the residency
/// declaration to encoder start.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ResourceUsage {
    pub resource: ResourceHandle,
    pub subresource_mask: SubresourceMask,
    pub access: ResourceAccess,
    pub stages: StageMask,
    pub first_command_index: u32,
    pub last_command_index: u32,
    pub consistent_usage: bool,
    pub allow_reordering: bool,
}

/// Residency declaration for a whole heap.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct HeapUse {
    pub heap: ResourceHandle,
    pub stages: StageMask,
    pub command_index: u32,
}

/// Identity of a binding point, used to collapse redundant re-binds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BindingPath {
    Buffer(u32),
    Texture(u32),
    Sampler(u32),
    ArgumentBuffer(u32),
}
