use api_types::buffer::BufferDescriptor;
use api_types::command::PassKind;
use api_types::handle::{RegistryClass, ResourceHandle, ResourceKind};
use api_types::image::TextureDescriptor;

use crate::pass_node::{PassExecutor, PassNode, PassNodeBuilder};
use crate::resource::transient_registry::{TransientDescriptor, TransientRequest};

#[derive(PartialEq, Debug)]
enum FrameState {
    Recording,
    Ended,
}

/// One frame's worth of declared work: passes in registration order plus
/// the transient resources they will touch. Executors run (in parallel) at
/// commit, not at declaration.
pub struct Frame {
    pub(crate) slot: u8,
    pub(crate) serial: u64,
    transient_generation: u16,
    pub(crate) passes: Vec<PassNode>,
    pub(crate) transients: Vec<TransientRequest>,
    state: FrameState,
}

impl Frame {
    pub(crate) fn new(slot: u8, serial: u64, transient_generation: u16) -> Self {
        Frame {
            slot,
            serial,
            transient_generation,
            passes: Vec::new(),
            transients: Vec::new(),
            state: FrameState::Recording,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Declare a pass. Registration order is the topological order the
    /// frame executes in.
    pub fn add_pass(
        &mut self,
        kind: PassKind,
        name: impl Into<String>,
        executor: PassExecutor,
    ) -> u32 {
        self.add_pass_node(PassNode::builder(name, kind).executor(executor))
    }

    /// Declare a pass from a configured builder (queue override,
    /// render-target attachments).
    pub fn add_pass_node(&mut self, builder: PassNodeBuilder) -> u32 {
        assert!(self.state == FrameState::Recording,
            "Can't add passes after the frame has ended");
        let id = self.passes.len() as u32;
        let node = builder.build(id).expect("Incomplete pass node");
        log::trace!(target: "framegraph", "Registered pass {} '{}'", id, node.name);
        self.passes.push(node);
        id
    }

    /// Reserve a frame-lifetime buffer. Backing memory is allocated lazily
    /// at commit, only if some retained pass uses the handle.
    pub fn create_buffer(
        &mut self,
        name: impl Into<String>,
        descriptor: BufferDescriptor,
    ) -> ResourceHandle {
        self.create_transient(name.into(), TransientDescriptor::Buffer(descriptor))
    }

    pub fn create_texture(
        &mut self,
        name: impl Into<String>,
        descriptor: TextureDescriptor,
    ) -> ResourceHandle {
        self.create_transient(name.into(), TransientDescriptor::Texture(descriptor))
    }

    fn create_transient(&mut self, name: String, descriptor: TransientDescriptor) -> ResourceHandle {
        assert!(self.state == FrameState::Recording,
            "Can't reserve transient resources after the frame has ended");
        let kind = match descriptor {
            TransientDescriptor::Buffer(_) => ResourceKind::Buffer,
            TransientDescriptor::Texture(_) => ResourceKind::Texture,
        };
        let index = self.transients.len() as u32;
        self.transients.push(TransientRequest { name, descriptor });
        ResourceHandle::new(
            kind,
            RegistryClass::Transient(self.slot),
            self.transient_generation,
            index)
    }

    pub(crate) fn end(&mut self) {
        assert!(self.state == FrameState::Recording, "Frame has already ended");
        self.state = FrameState::Ended;
    }
}
