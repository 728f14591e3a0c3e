use std::fmt::{Debug, Formatter};
use std::ops::Range;

use api_types::command::{PassKind, RecordedCommand};
use api_types::handle::ResourceHandle;
use api_types::queue::QueueKind;
use api_types::usage::{BarrierScope, StageMask};

use crate::binding::{HeapUse, ResourceUsage};
use crate::recorder::PassRecorder;

pub type PassExecutor = Box<dyn FnOnce(&mut PassRecorder) + Send>;

/// A render-target attachment of a graphics pass. Draw passes whose
/// attachment lists are identical may share an encoder.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AttachmentReference {
    pub resource: ResourceHandle,
}

/// An explicit barrier requested by a pass executor, either scoped or
/// naming specific resources.
#[derive(Clone, PartialEq, Debug)]
pub struct PassBarrier {
    pub scope: Option<BarrierScope>,
    pub resources: Vec<ResourceHandle>,
    pub after_stages: StageMask,
    pub before_stages: StageMask,
    pub command_index: u32,
}

/// One user-declared unit of GPU work. Executors record into the node at
/// commit; everything else is immutable once recording finishes.
pub struct PassNode {
    pub id: u32,
    pub kind: PassKind,
    pub queue_affinity: QueueKind,
    pub name: String,
    pub usages: Vec<ResourceUsage>,
    pub heap_uses: Vec<HeapUse>,
    pub barriers: Vec<PassBarrier>,
    pub commands: Vec<RecordedCommand>,
    pub attachments: Vec<AttachmentReference>,
    /// Global command index range within the frame, assigned by the
    /// scheduler after culling.
    pub command_range: Range<u32>,
    pub(crate) executor: Option<PassExecutor>,
}

impl PassNode {
    pub fn builder(name: impl Into<String>, kind: PassKind) -> PassNodeBuilder {
        PassNodeBuilder {
            name: name.into(),
            kind: Some(kind),
            queue_affinity: None,
            attachments: Vec::new(),
            executor: None,
        }
    }

    pub fn default_queue(kind: PassKind) -> QueueKind {
        match kind {
            PassKind::Graphics | PassKind::External => QueueKind::Graphics,
            PassKind::Compute | PassKind::AccelerationStructure => QueueKind::Compute,
            PassKind::Blit => QueueKind::Transfer,
        }
    }
}

impl Debug for PassNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassNode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

pub struct PassNodeBuilder {
    name: String,
    kind: Option<PassKind>,
    queue_affinity: Option<QueueKind>,
    attachments: Vec<AttachmentReference>,
    executor: Option<PassExecutor>,
}

impl PassNodeBuilder {
    pub fn queue(mut self, queue: QueueKind) -> Self {
        self.queue_affinity = Some(queue);
        self
    }

    pub fn attachment(mut self, resource: ResourceHandle) -> Self {
        self.attachments.push(AttachmentReference { resource });
        self
    }

    pub fn executor(mut self, executor: PassExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self, id: u32) -> Result<PassNode, &'static str> {
        let kind = self.kind.ok_or("PassNodeBuilder was given no pass kind")?;
        if self.executor.is_none() && kind != PassKind::External {
            return Err("Pass has no executor");
        }
        Ok(PassNode {
            id,
            kind,
            queue_affinity: self.queue_affinity.unwrap_or_else(|| PassNode::default_queue(kind)),
            name: self.name,
            usages: Vec::new(),
            heap_uses: Vec::new(),
            barriers: Vec::new(),
            commands: Vec::new(),
            attachments: self.attachments,
            command_range: 0..0,
            executor: self.executor,
        })
    }
}
