//! A headless backend. Materialization hands out sequential ids, command
//! streams are captured verbatim, and submissions complete immediately.
//! Used by the crate's own tests and useful for driving the runtime in CI
//! without a GPU.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use api_types::buffer::BufferDescriptor;
use api_types::command::{
    BackingId, CommandBufferId, EncodedCommand, EncoderSubmitInfo, FenceId, FenceSignal,
    FenceWait, SubmissionId,
};
use api_types::device::DeviceInterface;
use api_types::heap::HeapDescriptor;
use api_types::image::{PixelFormat, TextureDescriptor};
use api_types::queue::{QueueId, QueueKind, QueueSpec};
use api_types::sampler::SamplerDescriptor;
use api_types::usage::{PurgeableState, ResourceUsageFlags};

#[derive(Clone, Debug)]
pub struct SubmitRecord {
    pub command_buffer: CommandBufferId,
    pub queue: QueueId,
    pub waits: Vec<FenceWait>,
    pub signals: Vec<FenceSignal>,
}

#[derive(Clone, Debug)]
pub struct EncodeRecord {
    pub info: EncoderSubmitInfo,
    pub commands: Vec<EncodedCommand>,
}

pub struct NullDevice {
    next_backing: AtomicU64,
    next_fence: AtomicU64,
    next_command_buffer: AtomicU64,
    next_submission: AtomicU64,
    last_command_buffer: Mutex<Option<(u32, CommandBufferId)>>,
    pub encodes: Mutex<Vec<EncodeRecord>>,
    pub submits: Mutex<Vec<SubmitRecord>>,
    pub released: Mutex<Vec<BackingId>>,
    pub tile_based: AtomicBool,
    /// When false, materialize_* returns None to simulate OOM.
    pub allow_materialization: AtomicBool,
}

impl NullDevice {
    pub fn new() -> Self {
        NullDevice {
            next_backing: AtomicU64::new(1),
            next_fence: AtomicU64::new(1),
            next_command_buffer: AtomicU64::new(1),
            next_submission: AtomicU64::new(1),
            last_command_buffer: Mutex::new(None),
            encodes: Mutex::new(Vec::new()),
            submits: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            tile_based: AtomicBool::new(false),
            allow_materialization: AtomicBool::new(true),
        }
    }

    fn next_backing(&self) -> Option<BackingId> {
        if !self.allow_materialization.load(Ordering::Relaxed) {
            return None;
        }
        Some(BackingId(self.next_backing.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        NullDevice::new()
    }
}

impl DeviceInterface for NullDevice {
    fn materialize_buffer(&self, _name: &str, _desc: &BufferDescriptor) -> Option<BackingId> {
        self.next_backing()
    }

    fn materialize_texture(&self, _name: &str, _desc: &TextureDescriptor) -> Option<BackingId> {
        self.next_backing()
    }

    fn materialize_heap(&self, _name: &str, _desc: &HeapDescriptor) -> Option<BackingId> {
        self.next_backing()
    }

    fn materialize_sampler(&self, _name: &str, _desc: &SamplerDescriptor) -> Option<BackingId> {
        self.next_backing()
    }

    fn materialize_placed_buffer(
        &self,
        _name: &str,
        _heap: BackingId,
        _offset: u64,
        _desc: &BufferDescriptor,
    ) -> Option<BackingId> {
        self.next_backing()
    }

    fn materialize_placed_texture(
        &self,
        _name: &str,
        _heap: BackingId,
        _offset: u64,
        _desc: &TextureDescriptor,
    ) -> Option<BackingId> {
        self.next_backing()
    }

    fn size_and_alignment_for_buffer(&self, desc: &BufferDescriptor) -> (u64, u64) {
        (desc.length, 256)
    }

    fn size_and_alignment_for_texture(&self, desc: &TextureDescriptor) -> (u64, u64) {
        let texels = desc.width as u64 * desc.height as u64 * desc.depth as u64;
        (texels * 4 * desc.array_length as u64, 4096)
    }

    fn supports_pixel_format(&self, _format: PixelFormat, _usage: ResourceUsageFlags) -> bool {
        true
    }

    fn has_unified_memory(&self) -> bool {
        false
    }

    fn supports_memoryless_attachments(&self) -> bool {
        self.tile_based.load(Ordering::Relaxed)
    }

    fn is_tile_based(&self) -> bool {
        self.tile_based.load(Ordering::Relaxed)
    }

    fn encoder_command_soft_cap(&self) -> u32 {
        1 << 16
    }

    fn make_queue(&self, spec: &QueueSpec) -> QueueId {
        match spec.kind {
            QueueKind::Graphics => QueueId(0),
            QueueKind::Compute => QueueId(1),
            QueueKind::Transfer => QueueId(2),
        }
    }

    fn make_sync_event(&self, _queue: QueueId) -> FenceId {
        FenceId(self.next_fence.fetch_add(1, Ordering::Relaxed) as u32)
    }

    fn encode_pass(
        &self,
        info: &EncoderSubmitInfo,
        commands: &[EncodedCommand],
    ) -> CommandBufferId {
        let mut last = self.last_command_buffer.lock().unwrap();
        let id = match *last {
            Some((index, id)) if index == info.command_buffer_index => id,
            _ => CommandBufferId(self.next_command_buffer.fetch_add(1, Ordering::Relaxed)),
        };
        *last = Some((info.command_buffer_index, id));
        self.encodes.lock().unwrap().push(EncodeRecord {
            info: info.clone(),
            commands: commands.to_vec(),
        });
        id
    }

    fn submit(
        &self,
        command_buffer: CommandBufferId,
        queue: QueueId,
        waits: &[FenceWait],
        signals: &[FenceSignal],
    ) -> SubmissionId {
        self.submits.lock().unwrap().push(SubmitRecord {
            command_buffer,
            queue,
            waits: waits.to_vec(),
            signals: signals.to_vec(),
        });
        SubmissionId(self.next_submission.fetch_add(1, Ordering::Relaxed))
    }

    fn completion_callback(&self, _submission: SubmissionId, callback: Box<dyn FnOnce() + Send>) {
        // headless submissions complete immediately
        callback();
    }

    fn wait_for_submission(&self, _submission: SubmissionId, _timeout: Duration) -> bool {
        true
    }

    fn write_buffer(&self, _backing: BackingId, _offset: u64, _data: &[u8]) {}

    fn set_purgeable_state(&self, _backing: BackingId, _state: PurgeableState) -> PurgeableState {
        PurgeableState::NonVolatile
    }

    fn release_backing(&self, backing: BackingId) {
        self.released.lock().unwrap().push(backing);
    }
}
