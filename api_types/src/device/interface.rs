use std::time::Duration;

use crate::buffer::BufferDescriptor;
use crate::command::{
    BackingId, CommandBufferId, EncodedCommand, EncoderSubmitInfo, FenceId, FenceSignal,
    FenceWait, SubmissionId,
};
use crate::heap::HeapDescriptor;
use crate::image::{PixelFormat, TextureDescriptor};
use crate::queue::{QueueId, QueueSpec};
use crate::sampler::SamplerDescriptor;
use crate::usage::{PurgeableState, ResourceUsageFlags};

/// The capability surface the runtime consumes from a graphics-API backend.
///
/// Every object the backend creates is referred to by an opaque id; the
/// runtime never holds API objects directly. Materialization returns `None`
/// on out-of-memory so the caller can retry after a frame retires.
///
/// Implementations must be safe to call from the submission thread while
/// pass executors record on worker threads.
pub trait DeviceInterface: Send + Sync {
    fn materialize_buffer(&self, name: &str, desc: &BufferDescriptor) -> Option<BackingId>;

    fn materialize_texture(&self, name: &str, desc: &TextureDescriptor) -> Option<BackingId>;

    fn materialize_heap(&self, name: &str, desc: &HeapDescriptor) -> Option<BackingId>;

    fn materialize_sampler(&self, name: &str, desc: &SamplerDescriptor) -> Option<BackingId>;

    /// Create a buffer placed at a fixed offset inside an existing heap.
    fn materialize_placed_buffer(
        &self,
        name: &str,
        heap: BackingId,
        offset: u64,
        desc: &BufferDescriptor,
    ) -> Option<BackingId>;

    /// Create a texture placed at a fixed offset inside an existing heap.
    fn materialize_placed_texture(
        &self,
        name: &str,
        heap: BackingId,
        offset: u64,
        desc: &TextureDescriptor,
    ) -> Option<BackingId>;

    fn size_and_alignment_for_buffer(&self, desc: &BufferDescriptor) -> (u64, u64);

    fn size_and_alignment_for_texture(&self, desc: &TextureDescriptor) -> (u64, u64);

    fn supports_pixel_format(&self, format: PixelFormat, usage: ResourceUsageFlags) -> bool;

    fn has_unified_memory(&self) -> bool;

    fn supports_memoryless_attachments(&self) -> bool;

    /// Tile-based GPUs fold the render-target barrier scope into the
    /// texture scope; the compactor branches on this.
    fn is_tile_based(&self) -> bool;

    /// Soft cap on commands per command buffer before the scheduler closes
    /// the current encoder run.
    fn encoder_command_soft_cap(&self) -> u32;

    fn make_queue(&self, spec: &QueueSpec) -> QueueId;

    fn make_sync_event(&self, queue: QueueId) -> FenceId;

    /// Replay one encoder's merged command stream into a command buffer.
    /// Consecutive encoders sharing a `command_buffer_index` must return
    /// the same id.
    fn encode_pass(&self, info: &EncoderSubmitInfo, commands: &[EncodedCommand])
        -> CommandBufferId;

    fn submit(
        &self,
        command_buffer: CommandBufferId,
        queue: QueueId,
        waits: &[FenceWait],
        signals: &[FenceSignal],
    ) -> SubmissionId;

    fn completion_callback(&self, submission: SubmissionId, callback: Box<dyn FnOnce() + Send>);

    /// Block until the submission completes. Returns false on timeout, which
    /// the caller escalates to device loss.
    fn wait_for_submission(&self, submission: SubmissionId, timeout: Duration) -> bool;

    /// CPU-side write into a host-visible buffer backing.
    fn write_buffer(&self, backing: BackingId, offset: u64, data: &[u8]);

    /// Returns the previous state.
    fn set_purgeable_state(&self, backing: BackingId, state: PurgeableState) -> PurgeableState;

    fn release_backing(&self, backing: BackingId);
}
