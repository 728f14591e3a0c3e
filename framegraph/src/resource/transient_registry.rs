use std::sync::Arc;
use std::time::{Duration, Instant};

use api_types::buffer::BufferDescriptor;
use api_types::command::BackingId;
use api_types::device::DeviceInterface;
use api_types::handle::{RegistryClass, ResourceHandle, ResourceKind};
use api_types::heap::HeapDescriptor;
use api_types::image::TextureDescriptor;
use api_types::queue::QueueId;
use api_types::usage::StorageMode;

use crate::error::FrameGraphError;

/// A frame-local resource request, reserved by the frame before recording
/// and materialized lazily once its first use (and encoder lifetime) is
/// known.
#[derive(Clone, PartialEq, Debug)]
pub enum TransientDescriptor {
    Buffer(BufferDescriptor),
    Texture(TextureDescriptor),
}

#[derive(Clone, Debug)]
pub struct TransientRequest {
    pub name: String,
    pub descriptor: TransientDescriptor,
}

/// Placement decision for one materialized transient resource.
#[derive(Clone, Copy, Debug)]
pub struct TransientPlacement {
    pub queue: QueueId,
    pub offset: u64,
    pub size: u64,
    pub backing: BackingId,
}

/// Lifetime hint from the dependency builder: the inclusive encoder range
/// over which a transient resource is live, and the queue it lives on.
#[derive(Clone, Copy, Debug)]
pub struct TransientAssignment {
    pub index: u32,
    pub queue: QueueId,
    pub first_encoder: u32,
    pub last_encoder: u32,
}

struct Entry {
    name: String,
    descriptor: TransientDescriptor,
    placement: Option<TransientPlacement>,
}

/// One reserved range of an arena, with the encoder intervals of everything
/// that has been placed there this frame. Two resources may share the range
/// only if their intervals are disjoint; a shared endpoint is a live frame
/// and does not alias.
struct Block {
    offset: u64,
    size: u64,
    occupied: Vec<(u32, u32)>,
}

fn intervals_intersect(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

struct QueueArena {
    queue: QueueId,
    heap_backing: Option<BackingId>,
    heap_size: u64,
    watermark: u64,
    blocks: Vec<Block>,
}

/// Per-in-flight-slot registry of frame-lifetime resources, backed by one
/// linear arena per queue. The arena's heap persists across frames and is
/// returned to the OS only after a quiescence delay.
pub struct TransientRegistry {
    slot: u8,
    generation: u16,
    device: Arc<dyn DeviceInterface>,
    entries: Vec<Entry>,
    arenas: Vec<QueueArena>,
    retired_at: Option<Instant>,
}

impl TransientRegistry {
    pub fn new(slot: u8, device: Arc<dyn DeviceInterface>) -> Self {
        TransientRegistry {
            slot,
            generation: 0,
            device,
            entries: Vec::new(),
            arenas: Vec::new(),
            retired_at: None,
        }
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    pub fn handle_for(&self, request: &TransientRequest, index: u32) -> ResourceHandle {
        let kind = match request.descriptor {
            TransientDescriptor::Buffer(_) => ResourceKind::Buffer,
            TransientDescriptor::Texture(_) => ResourceKind::Texture,
        };
        ResourceHandle::new(kind, RegistryClass::Transient(self.slot), self.generation, index)
    }

    /// Place and materialize every transient that was actually used this
    /// frame. `assignments` comes from the dependency builder; requests with
    /// no assignment were never used and stay unmaterialized.
    ///
    /// In aliased mode a resource reuses an existing block whenever the
    /// block is large enough and every interval already occupying it is
    /// disjoint from the new one.
    pub fn materialize(
        &mut self,
        requests: &[TransientRequest],
        assignments: &[TransientAssignment],
        aliasing_enabled: bool,
    ) -> Result<(), FrameGraphError> {
        self.entries = requests.iter()
            .map(|request| Entry {
                name: request.name.clone(),
                descriptor: request.descriptor.clone(),
                placement: None,
            })
            .collect();
        // a retry after OOM restarts placement from a clean arena
        for arena in &mut self.arenas {
            arena.blocks.clear();
            arena.watermark = 0;
        }

        let mut ordered: Vec<&TransientAssignment> = assignments.iter().collect();
        ordered.sort_by_key(|a| (a.first_encoder, a.index));

        struct Pending {
            entry: u32,
            queue: QueueId,
            offset: u64,
            size: u64,
        }
        let mut pending: Vec<Pending> = Vec::new();

        for assignment in ordered {
            let entry = &self.entries[assignment.index as usize];
            let (size, align) = match &entry.descriptor {
                TransientDescriptor::Buffer(desc) => {
                    self.device.size_and_alignment_for_buffer(desc)
                }
                TransientDescriptor::Texture(desc) => {
                    self.device.size_and_alignment_for_texture(desc)
                }
            };
            let interval = (assignment.first_encoder, assignment.last_encoder);

            let arena_index = match self.arenas.iter().position(|a| a.queue == assignment.queue) {
                Some(index) => index,
                None => {
                    self.arenas.push(QueueArena {
                        queue: assignment.queue,
                        heap_backing: None,
                        heap_size: 0,
                        watermark: 0,
                        blocks: Vec::new(),
                    });
                    self.arenas.len() - 1
                }
            };
            let arena = &mut self.arenas[arena_index];

            let reusable = if aliasing_enabled {
                arena.blocks.iter().position(|block| {
                    block.size >= size
                        && block.offset % align == 0
                        && block.occupied.iter().all(|o| !intervals_intersect(*o, interval))
                })
            } else {
                None
            };
            let offset = match reusable {
                Some(position) => {
                    let block = &mut arena.blocks[position];
                    log::trace!(target: "resource",
                        "Aliasing transient '{}' into block at offset {}",
                        entry.name, block.offset);
                    block.occupied.push(interval);
                    block.offset
                }
                None => {
                    let offset = align_up(arena.watermark, align);
                    arena.watermark = offset + size;
                    arena.blocks.push(Block {
                        offset,
                        size,
                        occupied: vec![interval],
                    });
                    offset
                }
            };

            pending.push(Pending {
                entry: assignment.index,
                queue: assignment.queue,
                offset,
                size,
            });
        }

        // Grow each arena heap to cover this frame's watermark, then create
        // the placed resources.
        for arena in &mut self.arenas {
            if arena.watermark > arena.heap_size {
                if let Some(old) = arena.heap_backing.take() {
                    self.device.release_backing(old);
                }
                let descriptor = HeapDescriptor::new(arena.watermark, StorageMode::Private);
                let name = format!("transient-arena-q{}-s{}", arena.queue.0, self.slot);
                arena.heap_backing = Some(
                    self.device.materialize_heap(&name, &descriptor)
                        .ok_or(FrameGraphError::OutOfMemory { name })?);
                arena.heap_size = arena.watermark;
            }
        }

        for place in pending {
            let entry = &mut self.entries[place.entry as usize];
            let arena = self.arenas.iter().find(|a| a.queue == place.queue).unwrap();
            let heap = arena.heap_backing.expect("Arena heap must exist after growth");
            let backing = match &entry.descriptor {
                TransientDescriptor::Buffer(desc) => {
                    self.device.materialize_placed_buffer(&entry.name, heap, place.offset, desc)
                }
                TransientDescriptor::Texture(desc) => {
                    self.device.materialize_placed_texture(&entry.name, heap, place.offset, desc)
                }
            };
            entry.placement = Some(TransientPlacement {
                queue: place.queue,
                offset: place.offset,
                size: place.size,
                backing: backing.ok_or_else(|| FrameGraphError::OutOfMemory {
                    name: entry.name.clone(),
                })?,
            });
        }

        Ok(())
    }

    fn entry(&self, handle: ResourceHandle) -> Result<&Entry, FrameGraphError> {
        match handle.registry() {
            RegistryClass::Transient(slot) if slot == self.slot => {}
            _ => return Err(FrameGraphError::InvalidHandle(handle)),
        }
        if handle.generation() != self.generation {
            debug_assert!(false, "Transient handle {:?} outlived its frame", handle);
            log::error!(target: "resource", "Transient handle {:?} outlived its frame", handle);
            return Err(FrameGraphError::InvalidHandle(handle));
        }
        self.entries.get(handle.index() as usize)
            .ok_or(FrameGraphError::InvalidHandle(handle))
    }

    pub fn resolve(&self, handle: ResourceHandle) -> Result<BackingId, FrameGraphError> {
        let entry = self.entry(handle)?;
        entry.placement.as_ref()
            .map(|p| p.backing)
            .ok_or(FrameGraphError::InvalidHandle(handle))
    }

    pub fn placement(&self, handle: ResourceHandle) -> Option<TransientPlacement> {
        self.entry(handle).ok().and_then(|e| e.placement)
    }

    pub fn descriptor(&self, handle: ResourceHandle) -> Result<TransientDescriptor, FrameGraphError> {
        self.entry(handle).map(|e| e.descriptor.clone())
    }

    /// Reset for a new frame in this slot. Placements and blocks drop; the
    /// arena heaps are kept for reuse. Stale handles die with the
    /// generation bump.
    pub fn cycle(&mut self) {
        self.entries.clear();
        for arena in &mut self.arenas {
            arena.blocks.clear();
            arena.watermark = 0;
        }
        self.generation = self.generation.wrapping_add(1);
        self.retired_at = None;
    }

    pub fn mark_retired(&mut self, now: Instant) {
        if self.retired_at.is_none() {
            self.retired_at = Some(now);
        }
    }

    /// Return arena memory to the OS once the slot's frame has retired and
    /// the arena has sat idle for the grace period.
    pub fn maybe_purge(&mut self, now: Instant, delay: Duration) {
        let Some(retired_at) = self.retired_at else { return };
        if now.duration_since(retired_at) < delay {
            return;
        }
        for arena in &mut self.arenas {
            if let Some(backing) = arena.heap_backing.take() {
                log::trace!(target: "resource",
                    "Purging idle transient arena for queue {} (slot {})",
                    arena.queue.0, self.slot);
                self.device.release_backing(backing);
                arena.heap_size = 0;
            }
        }
        self.retired_at = None;
    }
}

impl std::fmt::Debug for TransientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientRegistry")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_types::usage::ResourceUsageFlags;
    use crate::testing::NullDevice;

    #[test]
    fn disjoint_intervals_do_not_intersect() {
        assert!(!intervals_intersect((0, 2), (3, 5)));
        assert!(intervals_intersect((0, 3), (3, 5)));
        assert!(intervals_intersect((1, 4), (2, 2)));
    }

    fn request(name: &str, length: u64) -> TransientRequest {
        TransientRequest {
            name: name.to_string(),
            descriptor: TransientDescriptor::Buffer(BufferDescriptor::new(
                length,
                StorageMode::Private,
                ResourceUsageFlags::SHADER_READ | ResourceUsageFlags::SHADER_WRITE)),
        }
    }

    fn assignment(index: u32, first: u32, last: u32) -> TransientAssignment {
        TransientAssignment {
            index,
            queue: QueueId(0),
            first_encoder: first,
            last_encoder: last,
        }
    }

    fn offsets(registry: &TransientRegistry, requests: &[TransientRequest]) -> Vec<u64> {
        requests.iter().enumerate()
            .map(|(index, request)| {
                let handle = registry.handle_for(request, index as u32);
                registry.placement(handle).unwrap().offset
            })
            .collect()
    }

    #[test]
    fn disjoint_lifetimes_alias_to_one_allocation() {
        let device = Arc::new(NullDevice::new());
        let mut registry = TransientRegistry::new(0, device);
        let requests = vec![request("t1", 4 << 20), request("t2", 4 << 20)];
        registry.materialize(
            &requests,
            &[assignment(0, 0, 2), assignment(1, 3, 5)],
            true).unwrap();
        let offsets = offsets(&registry, &requests);
        assert_eq!(offsets[0], offsets[1]);
    }

    #[test]
    fn adjacent_lifetimes_do_not_alias() {
        let device = Arc::new(NullDevice::new());
        let mut registry = TransientRegistry::new(0, device);
        let requests = vec![request("t1", 4 << 20), request("t2", 4 << 20)];
        // shared endpoint: encoder 3 has both live
        registry.materialize(
            &requests,
            &[assignment(0, 0, 3), assignment(1, 3, 5)],
            true).unwrap();
        let offsets = offsets(&registry, &requests);
        assert_ne!(offsets[0], offsets[1]);
    }

    #[test]
    fn non_aliased_mode_never_shares() {
        let device = Arc::new(NullDevice::new());
        let mut registry = TransientRegistry::new(0, device);
        let requests = vec![request("t1", 1 << 10), request("t2", 1 << 10)];
        registry.materialize(
            &requests,
            &[assignment(0, 0, 0), assignment(1, 2, 2)],
            false).unwrap();
        let offsets = offsets(&registry, &requests);
        assert_ne!(offsets[0], offsets[1]);
    }

    #[test]
    fn unused_requests_stay_unmaterialized() {
        let device = Arc::new(NullDevice::new());
        let mut registry = TransientRegistry::new(0, device);
        let requests = vec![request("used", 1 << 10), request("unused", 1 << 10)];
        registry.materialize(&requests, &[assignment(0, 0, 0)], true).unwrap();
        let used = registry.handle_for(&requests[0], 0);
        let unused = registry.handle_for(&requests[1], 1);
        assert!(registry.resolve(used).is_ok());
        assert!(registry.resolve(unused).is_err());
    }

    #[test]
    fn cycle_invalidates_handles_and_purge_releases_memory() {
        let device = Arc::new(NullDevice::new());
        let mut registry = TransientRegistry::new(0, device.clone());
        let requests = vec![request("t1", 1 << 10)];
        registry.materialize(&requests, &[assignment(0, 0, 0)], true).unwrap();
        let handle = registry.handle_for(&requests[0], 0);
        let resolved = registry.resolve(handle);
        assert!(resolved.is_ok());

        registry.cycle();
        let now = Instant::now();
        registry.mark_retired(now);
        registry.maybe_purge(now + Duration::from_secs(6), Duration::from_secs(5));
        assert!(!device.released.lock().unwrap().is_empty());
    }
}
