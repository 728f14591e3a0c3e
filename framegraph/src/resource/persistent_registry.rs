use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use api_types::buffer::BufferDescriptor;
use api_types::command::BackingId;
use api_types::device::DeviceInterface;
use api_types::handle::{RegistryClass, ResourceHandle, ResourceKind};
use api_types::heap::HeapDescriptor;
use api_types::image::{ImageLayout, TextureDescriptor};
use api_types::sampler::SamplerDescriptor;
use api_types::usage::{PurgeableState, StorageMode};

use crate::error::FrameGraphError;
use crate::resource::heap_allocator::HeapAllocator;
use crate::resource::ResourceDescriptor;

struct PersistentEntry {
    name: String,
    descriptor: ResourceDescriptor,
    backing: Option<BackingId>,
    /// Externally-owned objects are resolvable but never released by us.
    imported: bool,
    /// Present for resources sub-allocated from a heap; the backing borrows
    /// the heap's lifetime.
    placed_in: Option<(ResourceHandle, u64)>,
    /// Sub-allocator for Heap entries.
    heap_allocator: Option<HeapAllocator>,
    purgeable: PurgeableState,
    current_layout: ImageLayout,
}

struct Slot {
    generation: u16,
    entry: Option<PersistentEntry>,
}

struct PendingRelease {
    backing: BackingId,
    after_serial: u64,
}

/// The table of caller-managed resources. Reads take a shared lock and are
/// free; all mutation serializes on the write lock. Disposal is deferred
/// until the last command buffer that could reference the slot completes.
pub struct PersistentRegistry {
    device: Arc<dyn DeviceInterface>,
    slots: RwLock<Vec<Slot>>,
    free_slots: Mutex<Vec<u32>>,
    pending_releases: Mutex<Vec<PendingRelease>>,
    pending_purgeable: Mutex<Vec<(BackingId, PurgeableState)>>,
    submitted_serial: AtomicU64,
}

impl PersistentRegistry {
    pub fn new(device: Arc<dyn DeviceInterface>) -> Self {
        PersistentRegistry {
            device,
            slots: RwLock::new(Vec::new()),
            free_slots: Mutex::new(Vec::new()),
            pending_releases: Mutex::new(Vec::new()),
            pending_purgeable: Mutex::new(Vec::new()),
            submitted_serial: AtomicU64::new(0),
        }
    }

    fn insert(&self, kind: ResourceKind, entry: PersistentEntry) -> ResourceHandle {
        let mut slots = self.slots.write().unwrap();
        let index = match self.free_slots.lock().unwrap().pop() {
            Some(index) => index,
            None => {
                slots.push(Slot { generation: 0, entry: None });
                (slots.len() - 1) as u32
            }
        };
        let slot = &mut slots[index as usize];
        debug_assert!(slot.entry.is_none(), "Allocating into an occupied slot");
        let generation = slot.generation;
        slot.entry = Some(entry);
        ResourceHandle::new(kind, RegistryClass::Persistent, generation, index)
    }

    fn materialize(
        &self,
        name: &str,
        descriptor: &ResourceDescriptor,
    ) -> Result<BackingId, FrameGraphError> {
        log::trace!(target: "resource", "Materializing persistent resource '{}'", name);
        let backing = match descriptor {
            ResourceDescriptor::Buffer(desc) => self.device.materialize_buffer(name, desc),
            ResourceDescriptor::Texture(desc) => self.device.materialize_texture(name, desc),
            ResourceDescriptor::Heap(desc) => self.device.materialize_heap(name, desc),
            ResourceDescriptor::Sampler(desc) => self.device.materialize_sampler(name, desc),
        };
        backing.ok_or_else(|| FrameGraphError::OutOfMemory { name: name.to_string() })
    }

    fn allocate(
        &self,
        kind: ResourceKind,
        name: &str,
        descriptor: ResourceDescriptor,
    ) -> Result<ResourceHandle, FrameGraphError> {
        let backing = self.materialize(name, &descriptor)?;
        let heap_allocator = match &descriptor {
            ResourceDescriptor::Heap(desc) => Some(HeapAllocator::new(desc.size)),
            _ => None,
        };
        Ok(self.insert(kind, PersistentEntry {
            name: name.to_string(),
            descriptor,
            backing: Some(backing),
            imported: false,
            placed_in: None,
            heap_allocator,
            purgeable: PurgeableState::NonVolatile,
            current_layout: ImageLayout::Undefined,
        }))
    }

    pub fn allocate_buffer(
        &self,
        name: &str,
        descriptor: BufferDescriptor,
    ) -> Result<ResourceHandle, FrameGraphError> {
        self.allocate(ResourceKind::Buffer, name, ResourceDescriptor::Buffer(descriptor))
    }

    pub fn allocate_texture(
        &self,
        name: &str,
        descriptor: TextureDescriptor,
    ) -> Result<ResourceHandle, FrameGraphError> {
        if !self.device.supports_pixel_format(descriptor.pixel_format, descriptor.usage) {
            return Err(FrameGraphError::ValidationFailure(format!(
                "Pixel format {:?} does not support usage {:?}",
                descriptor.pixel_format, descriptor.usage)));
        }
        self.allocate(ResourceKind::Texture, name, ResourceDescriptor::Texture(descriptor))
    }

    pub fn allocate_heap(
        &self,
        name: &str,
        descriptor: HeapDescriptor,
    ) -> Result<ResourceHandle, FrameGraphError> {
        self.allocate(ResourceKind::Heap, name, ResourceDescriptor::Heap(descriptor))
    }

    pub fn allocate_sampler(
        &self,
        name: &str,
        descriptor: SamplerDescriptor,
    ) -> Result<ResourceHandle, FrameGraphError> {
        self.allocate(ResourceKind::Sampler, name, ResourceDescriptor::Sampler(descriptor))
    }

    pub fn allocate_argument_buffer(
        &self,
        name: &str,
        descriptor: BufferDescriptor,
    ) -> Result<ResourceHandle, FrameGraphError> {
        self.allocate(ResourceKind::ArgumentBuffer, name, ResourceDescriptor::Buffer(descriptor))
    }

    pub fn allocate_acceleration_structure(
        &self,
        name: &str,
        descriptor: BufferDescriptor,
    ) -> Result<ResourceHandle, FrameGraphError> {
        self.allocate(
            ResourceKind::AccelerationStructure,
            name,
            ResourceDescriptor::Buffer(descriptor))
    }

    /// Wrap an externally-owned GPU object (a swapchain image, typically)
    /// without taking ownership of its backing.
    pub fn import_external(
        &self,
        name: &str,
        kind: ResourceKind,
        descriptor: ResourceDescriptor,
        backing: BackingId,
    ) -> ResourceHandle {
        log::trace!(target: "resource", "Importing external resource '{}'", name);
        self.insert(kind, PersistentEntry {
            name: name.to_string(),
            descriptor,
            backing: Some(backing),
            imported: true,
            placed_in: None,
            heap_allocator: None,
            purgeable: PurgeableState::NonVolatile,
            current_layout: ImageLayout::Undefined,
        })
    }

    /// Sub-allocate a buffer from a heap. The result borrows the heap's
    /// lifetime: disposing it never releases backing memory.
    pub fn place_buffer(
        &self,
        heap: ResourceHandle,
        name: &str,
        descriptor: BufferDescriptor,
    ) -> Result<ResourceHandle, FrameGraphError> {
        let (size, alignment) = self.device.size_and_alignment_for_buffer(&descriptor);
        let (heap_backing, offset) = self.suballocate(heap, size, alignment)?;
        let backing = self.device
            .materialize_placed_buffer(name, heap_backing, offset, &descriptor)
            .ok_or_else(|| FrameGraphError::OutOfMemory { name: name.to_string() })?;
        Ok(self.insert(ResourceKind::Buffer, PersistentEntry {
            name: name.to_string(),
            descriptor: ResourceDescriptor::Buffer(descriptor),
            backing: Some(backing),
            imported: false,
            placed_in: Some((heap, offset)),
            heap_allocator: None,
            purgeable: PurgeableState::NonVolatile,
            current_layout: ImageLayout::Undefined,
        }))
    }

    pub fn place_texture(
        &self,
        heap: ResourceHandle,
        name: &str,
        descriptor: TextureDescriptor,
    ) -> Result<ResourceHandle, FrameGraphError> {
        let (size, alignment) = self.device.size_and_alignment_for_texture(&descriptor);
        let (heap_backing, offset) = self.suballocate(heap, size, alignment)?;
        let backing = self.device
            .materialize_placed_texture(name, heap_backing, offset, &descriptor)
            .ok_or_else(|| FrameGraphError::OutOfMemory { name: name.to_string() })?;
        Ok(self.insert(ResourceKind::Texture, PersistentEntry {
            name: name.to_string(),
            descriptor: ResourceDescriptor::Texture(descriptor),
            backing: Some(backing),
            imported: false,
            placed_in: Some((heap, offset)),
            heap_allocator: None,
            purgeable: PurgeableState::NonVolatile,
            current_layout: ImageLayout::Undefined,
        }))
    }

    fn suballocate(
        &self,
        heap: ResourceHandle,
        size: u64,
        alignment: u64,
    ) -> Result<(BackingId, u64), FrameGraphError> {
        let mut slots = self.slots.write().unwrap();
        let entry = Self::entry_mut(&mut slots, heap)?;
        let name = entry.name.clone();
        let backing = entry.backing
            .ok_or(FrameGraphError::InvalidHandle(heap))?;
        let allocator = entry.heap_allocator.as_mut()
            .ok_or(FrameGraphError::InvalidHandle(heap))?;
        let offset = allocator.place(size, alignment)
            .ok_or(FrameGraphError::OutOfMemory { name })?;
        Ok((backing, offset))
    }

    pub fn heap_used_size(&self, heap: ResourceHandle) -> Result<u64, FrameGraphError> {
        let slots = self.slots.read().unwrap();
        let entry = Self::entry_ref(&slots, heap)?;
        entry.heap_allocator.as_ref()
            .map(|a| a.used_size())
            .ok_or(FrameGraphError::InvalidHandle(heap))
    }

    pub fn heap_current_allocated_size(&self, heap: ResourceHandle) -> Result<u64, FrameGraphError> {
        let slots = self.slots.read().unwrap();
        let entry = Self::entry_ref(&slots, heap)?;
        entry.heap_allocator.as_ref()
            .map(|a| a.total_size())
            .ok_or(FrameGraphError::InvalidHandle(heap))
    }

    pub fn heap_max_available_size(
        &self,
        heap: ResourceHandle,
        alignment: u64,
    ) -> Result<u64, FrameGraphError> {
        let slots = self.slots.read().unwrap();
        let entry = Self::entry_ref(&slots, heap)?;
        entry.heap_allocator.as_ref()
            .map(|a| a.max_available_size(alignment))
            .ok_or(FrameGraphError::InvalidHandle(heap))
    }

    fn entry_ref<'s>(
        slots: &'s [Slot],
        handle: ResourceHandle,
    ) -> Result<&'s PersistentEntry, FrameGraphError> {
        let slot = slots.get(handle.index() as usize)
            .ok_or(FrameGraphError::InvalidHandle(handle))?;
        if slot.generation != handle.generation() {
            debug_assert!(false, "Stale handle {:?} (slot at generation {})",
                handle, slot.generation);
            log::error!(target: "resource", "Stale handle {:?}", handle);
            return Err(FrameGraphError::InvalidHandle(handle));
        }
        slot.entry.as_ref().ok_or(FrameGraphError::InvalidHandle(handle))
    }

    fn entry_mut<'s>(
        slots: &'s mut [Slot],
        handle: ResourceHandle,
    ) -> Result<&'s mut PersistentEntry, FrameGraphError> {
        let slot = slots.get_mut(handle.index() as usize)
            .ok_or(FrameGraphError::InvalidHandle(handle))?;
        if slot.generation != handle.generation() {
            debug_assert!(false, "Stale handle {:?} (slot at generation {})",
                handle, slot.generation);
            log::error!(target: "resource", "Stale handle {:?}", handle);
            return Err(FrameGraphError::InvalidHandle(handle));
        }
        slot.entry.as_mut().ok_or(FrameGraphError::InvalidHandle(handle))
    }

    pub fn resolve(&self, handle: ResourceHandle) -> Result<BackingId, FrameGraphError> {
        let slots = self.slots.read().unwrap();
        let entry = Self::entry_ref(&slots, handle)?;
        entry.backing.ok_or(FrameGraphError::InvalidHandle(handle))
    }

    pub fn descriptor(&self, handle: ResourceHandle) -> Result<ResourceDescriptor, FrameGraphError> {
        let slots = self.slots.read().unwrap();
        Self::entry_ref(&slots, handle).map(|e| e.descriptor.clone())
    }

    pub fn is_imported(&self, handle: ResourceHandle) -> bool {
        let slots = self.slots.read().unwrap();
        Self::entry_ref(&slots, handle).map(|e| e.imported).unwrap_or(false)
    }

    pub fn storage_mode(&self, handle: ResourceHandle) -> Result<StorageMode, FrameGraphError> {
        self.descriptor(handle).map(|d| match d {
            ResourceDescriptor::Buffer(b) => b.storage_mode,
            ResourceDescriptor::Texture(t) => t.storage_mode,
            ResourceDescriptor::Heap(h) => h.storage_mode,
            ResourceDescriptor::Sampler(_) => StorageMode::Private,
        })
    }

    /// Swap the backing object atomically, returning the old one. The new
    /// backing must have been created against an identical descriptor.
    pub fn replace_backing(
        &self,
        handle: ResourceHandle,
        new_backing: BackingId,
        descriptor: &ResourceDescriptor,
    ) -> Result<BackingId, FrameGraphError> {
        let mut slots = self.slots.write().unwrap();
        let entry = Self::entry_mut(&mut slots, handle)?;
        if entry.descriptor != *descriptor {
            return Err(FrameGraphError::DescriptorMismatch(handle));
        }
        let old = entry.backing.replace(new_backing)
            .ok_or(FrameGraphError::InvalidHandle(handle))?;
        Ok(old)
    }

    /// Mark a slot for deferred release. The generation bumps immediately,
    /// so any handle still naming this slot is stale from here on; the
    /// backing is released only once the last submitted frame at dispose
    /// time has completed.
    pub fn dispose(&self, handle: ResourceHandle) -> Result<(), FrameGraphError> {
        let mut slots = self.slots.write().unwrap();
        let slot = slots.get_mut(handle.index() as usize)
            .ok_or(FrameGraphError::InvalidHandle(handle))?;
        if slot.generation != handle.generation() || slot.entry.is_none() {
            debug_assert!(false, "Disposing stale handle {:?}", handle);
            log::error!(target: "resource", "Disposing stale handle {:?}", handle);
            return Err(FrameGraphError::InvalidHandle(handle));
        }
        let entry = slot.entry.take().unwrap();
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.lock().unwrap().push(handle.index());

        log::trace!(target: "resource", "Disposing '{}' ({:?})", entry.name, handle);
        if let (Some(backing), false, None) = (entry.backing, entry.imported, entry.placed_in) {
            self.pending_releases.lock().unwrap().push(PendingRelease {
                backing,
                after_serial: self.submitted_serial.load(Ordering::Acquire),
            });
        }
        Ok(())
    }

    /// Queue a purgeability change, flushed at frame retire. The one
    /// transition that needs an immediate answer is `-> NonVolatile`, which
    /// reports whether the contents had already been emptied.
    pub fn set_purgeable(
        &self,
        handle: ResourceHandle,
        state: PurgeableState,
    ) -> Result<bool, FrameGraphError> {
        if state == PurgeableState::KeepCurrent {
            return Ok(false);
        }
        let mut slots = self.slots.write().unwrap();
        let entry = Self::entry_mut(&mut slots, handle)?;
        let backing = entry.backing.ok_or(FrameGraphError::InvalidHandle(handle))?;
        let previous = entry.purgeable;
        entry.purgeable = state;
        if state == PurgeableState::NonVolatile {
            let old = self.device.set_purgeable_state(backing, state);
            return Ok(old == PurgeableState::Empty || previous == PurgeableState::Empty);
        }
        self.pending_purgeable.lock().unwrap().push((backing, state));
        Ok(false)
    }

    pub fn texture_layout(&self, handle: ResourceHandle) -> ImageLayout {
        let slots = self.slots.read().unwrap();
        Self::entry_ref(&slots, handle)
            .map(|e| e.current_layout)
            .unwrap_or(ImageLayout::Undefined)
    }

    pub fn set_texture_layout(&self, handle: ResourceHandle, layout: ImageLayout) {
        let mut slots = self.slots.write().unwrap();
        if let Ok(entry) = Self::entry_mut(&mut slots, handle) {
            entry.current_layout = layout;
        }
    }

    pub fn record_submitted_serial(&self, serial: u64) {
        self.submitted_serial.fetch_max(serial, Ordering::AcqRel);
    }

    /// Release disposed backings whose last possible referencing frame has
    /// completed.
    pub fn process_disposals(&self, completed_serial: u64) {
        let mut pending = self.pending_releases.lock().unwrap();
        let mut index = 0;
        while index < pending.len() {
            if pending[index].after_serial <= completed_serial {
                let release = pending.swap_remove(index);
                log::trace!(target: "resource", "Releasing backing {:?}", release.backing);
                self.device.release_backing(release.backing);
            } else {
                index += 1;
            }
        }
    }

    pub fn flush_purgeable_updates(&self) {
        let updates: Vec<_> = self.pending_purgeable.lock().unwrap().drain(..).collect();
        for (backing, state) in updates {
            self.device.set_purgeable_state(backing, state);
        }
    }

    /// Device-loss recovery: drop every owned backing and materialize fresh
    /// ones from the stored descriptors. Imported entries lose their backing
    /// and must be re-imported by the caller.
    pub fn rematerialize_all(&self) -> Result<(), FrameGraphError> {
        let mut slots = self.slots.write().unwrap();

        // Heaps first so placed resources have somewhere to land.
        for pass in 0..2 {
            for slot in slots.iter_mut() {
                let Some(entry) = slot.entry.as_mut() else { continue };
                let is_heap = matches!(entry.descriptor, ResourceDescriptor::Heap(_));
                if (pass == 0) != is_heap {
                    continue;
                }
                if entry.imported {
                    entry.backing = None;
                    log::warn!(target: "resource",
                        "Imported resource '{}' dropped on device loss; re-import required",
                        entry.name);
                    continue;
                }
                entry.backing = None;
                entry.current_layout = ImageLayout::Undefined;
                if entry.placed_in.is_some() {
                    // Placed resources are re-created by the caller against
                    // the rebuilt heap; their old offsets are meaningless
                    // once the heap allocator restarts.
                    continue;
                }
                let backing = match &entry.descriptor {
                    ResourceDescriptor::Buffer(d) => self.device.materialize_buffer(&entry.name, d),
                    ResourceDescriptor::Texture(d) => self.device.materialize_texture(&entry.name, d),
                    ResourceDescriptor::Heap(d) => {
                        entry.heap_allocator = Some(HeapAllocator::new(d.size));
                        self.device.materialize_heap(&entry.name, d)
                    }
                    ResourceDescriptor::Sampler(d) => self.device.materialize_sampler(&entry.name, d),
                };
                entry.backing = Some(backing.ok_or_else(|| FrameGraphError::OutOfMemory {
                    name: entry.name.clone(),
                })?);
            }
        }
        Ok(())
    }

    /// CPU-side write into a Managed or Shared buffer.
    pub fn write_buffer(
        &self,
        handle: ResourceHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), FrameGraphError> {
        let (backing, storage) = {
            let slots = self.slots.read().unwrap();
            let entry = Self::entry_ref(&slots, handle)?;
            let storage = match &entry.descriptor {
                ResourceDescriptor::Buffer(b) => b.storage_mode,
                _ => return Err(FrameGraphError::InvalidHandle(handle)),
            };
            (entry.backing.ok_or(FrameGraphError::InvalidHandle(handle))?, storage)
        };
        if storage == StorageMode::Private || storage == StorageMode::Memoryless {
            return Err(FrameGraphError::ValidationFailure(format!(
                "Buffer {:?} is not CPU-visible", handle)));
        }
        self.device.write_buffer(backing, offset, data);
        Ok(())
    }
}
