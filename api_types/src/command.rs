use crate::handle::ResourceHandle;
use crate::image::ImageLayout;
use crate::queue::QueueId;
use crate::usage::{BarrierScope, ResourceAccess, StageMask};

/// The kind of work a pass (and the encoder it lands in) performs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PassKind {
    Graphics,
    Compute,
    Blit,
    External,
    AccelerationStructure,
}

/// A GPU command captured by a pass executor. Commands are replayed into a
/// backend command buffer at submission, interleaved with resource commands.
#[derive(Clone, PartialEq, Debug)]
pub enum RecordedCommand {
    BindBuffer { slot: u32, resource: ResourceHandle, offset: u64 },
    BindTexture { slot: u32, resource: ResourceHandle },
    BindSampler { slot: u32, resource: ResourceHandle },
    BindArgumentBuffer { slot: u32, resource: ResourceHandle, offset: u64 },
    SetBytes { slot: u32, data: Vec<u8> },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch { groups: [u32; 3] },
    CopyBuffer {
        src: ResourceHandle,
        src_offset: u64,
        dst: ResourceHandle,
        dst_offset: u64,
        size: u64,
    },
    CopyTexture { src: ResourceHandle, dst: ResourceHandle },
    BuildAccelerationStructure { dst: ResourceHandle },
}

/// Where a resource command sits relative to the pass command sharing its
/// index. The final stream is stably sorted with `Before < Pass < After`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum CommandOrder {
    Before,
    After,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LayoutTransition {
    pub resource: ResourceHandle,
    pub from: ImageLayout,
    pub to: ImageLayout,
}

/// A synchronization or residency command produced by the compactor.
#[derive(Clone, PartialEq, Debug)]
pub enum ResourceCommandKind {
    /// Declare a batch of resources resident for the encoder.
    UseResources {
        resources: Vec<ResourceHandle>,
        stages: StageMask,
        access: ResourceAccess,
    },
    /// Declare everything placed in a heap resident.
    UseHeap { heap: ResourceHandle, stages: StageMask },
    /// A barrier naming the exact resources it covers.
    ResourceBarrier {
        resources: Vec<ResourceHandle>,
        after_stages: StageMask,
        before_stages: StageMask,
        transitions: Vec<LayoutTransition>,
    },
    /// A barrier covering whole cache scopes.
    ScopedBarrier {
        scope: BarrierScope,
        after_stages: StageMask,
        before_stages: StageMask,
        transitions: Vec<LayoutTransition>,
    },
    WaitFence { fence: FenceId, before_stages: StageMask },
    UpdateFence { fence: FenceId, after_stages: StageMask },
}

#[derive(Clone, PartialEq, Debug)]
pub struct ResourceCommand {
    pub kind: ResourceCommandKind,
    pub index: u32,
    pub order: CommandOrder,
}

/// One entry of the fully merged, sorted stream handed to the backend.
#[derive(Clone, PartialEq, Debug)]
pub enum EncodedCommand {
    Resource(ResourceCommand),
    Pass(RecordedCommand),
}

/// Per-encoder metadata handed to the backend alongside the command stream.
#[derive(Clone, Debug)]
pub struct EncoderSubmitInfo {
    pub kind: PassKind,
    pub name: String,
    pub queue: QueueId,
    pub command_buffer_index: u32,
}

/// Opaque backend ids. The runtime only ever stores and compares these.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BackingId(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FenceId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CommandBufferId(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SubmissionId(pub u64);

/// Fence edges attached to a queue submission.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FenceWait {
    pub fence: FenceId,
    pub before_stages: StageMask,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FenceSignal {
    pub fence: FenceId,
    pub after_stages: StageMask,
}
