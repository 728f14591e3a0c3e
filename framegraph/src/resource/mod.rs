pub mod heap_allocator;
pub mod persistent_registry;
pub mod transient_registry;

use api_types::buffer::BufferDescriptor;
use api_types::heap::HeapDescriptor;
use api_types::image::TextureDescriptor;
use api_types::sampler::SamplerDescriptor;

/// Descriptor for any persistent-registry resource. Argument buffers and
/// acceleration structures are buffer-shaped at the allocation level; the
/// handle's kind tag tells them apart.
#[derive(Clone, PartialEq, Debug)]
pub enum ResourceDescriptor {
    Buffer(BufferDescriptor),
    Texture(TextureDescriptor),
    Heap(HeapDescriptor),
    Sampler(SamplerDescriptor),
}
