use std::collections::HashMap;

use api_types::command::{PassKind, RecordedCommand};
use api_types::handle::ResourceHandle;
use api_types::usage::{BarrierScope, ResourceAccess, StageMask, SubresourceMask};

use crate::binding::{BindingPath, HeapUse, ResourceUsage};
use crate::pass_node::{PassBarrier, PassNode};

fn default_stage_mask(kind: PassKind) -> StageMask {
    match kind {
        PassKind::Graphics | PassKind::External => StageMask::VERTEX | StageMask::FRAGMENT,
        PassKind::Compute | PassKind::AccelerationStructure => StageMask::COMPUTE,
        PassKind::Blit => StageMask::BLIT,
    }
}

/// The surface a pass executor records through. Binding calls track the
/// active binding per path so that re-binding the same resource at the same
/// offset is a no-op; every touched resource accumulates into the pass's
/// usage list for dependency analysis and residency batching.
pub struct PassRecorder<'p> {
    pass: &'p mut PassNode,
    usage_lookup: HashMap<ResourceHandle, usize>,
    active_bindings: HashMap<BindingPath, (ResourceHandle, u64)>,
}

impl<'p> PassRecorder<'p> {
    pub(crate) fn new(pass: &'p mut PassNode) -> Self {
        PassRecorder {
            pass,
            usage_lookup: HashMap::new(),
            active_bindings: HashMap::new(),
        }
    }

    fn next_index(&self) -> u32 {
        self.pass.commands.len() as u32
    }

    fn touch(
        &mut self,
        resource: ResourceHandle,
        access: ResourceAccess,
        stages: StageMask,
        mask: SubresourceMask,
        allow_reordering: bool,
    ) {
        let index = self.next_index();
        match self.usage_lookup.get(&resource) {
            Some(&slot) => {
                let usage = &mut self.pass.usages[slot];
                if usage.access != access || usage.stages != stages {
                    usage.consistent_usage = false;
                }
                usage.access |= access;
                usage.stages |= stages;
                usage.subresource_mask = usage.subresource_mask.union(mask);
                usage.last_command_index = index;
                usage.allow_reordering &= allow_reordering;
            }
            None => {
                self.pass.usages.push(ResourceUsage {
                    resource,
                    subresource_mask: mask,
                    access,
                    stages,
                    first_command_index: index,
                    last_command_index: index,
                    consistent_usage: true,
                    allow_reordering,
                });
                self.usage_lookup.insert(resource, self.pass.usages.len() - 1);
            }
        }
    }

    /// Extend the usages of everything currently bound up to a consuming
    /// command (a draw or dispatch).
    fn consume_bindings(&mut self, index: u32) {
        for (resource, _) in self.active_bindings.values() {
            if let Some(&slot) = self.usage_lookup.get(resource) {
                self.pass.usages[slot].last_command_index = index;
            }
        }
    }

    fn bind(
        &mut self,
        path: BindingPath,
        resource: ResourceHandle,
        offset: u64,
        command: RecordedCommand,
        access: ResourceAccess,
    ) {
        if self.active_bindings.get(&path) == Some(&(resource, offset)) {
            // identical re-bind collapses
            return;
        }
        let stages = default_stage_mask(self.pass.kind);
        self.touch(resource, access, stages, SubresourceMask::ALL, true);
        self.pass.commands.push(command);
        self.active_bindings.insert(path, (resource, offset));
    }

    pub fn set_buffer(&mut self, slot: u32, resource: ResourceHandle, offset: u64) {
        self.bind(
            BindingPath::Buffer(slot),
            resource,
            offset,
            RecordedCommand::BindBuffer { slot, resource, offset },
            ResourceAccess::READ);
    }

    pub fn set_texture(&mut self, slot: u32, resource: ResourceHandle) {
        self.bind(
            BindingPath::Texture(slot),
            resource,
            0,
            RecordedCommand::BindTexture { slot, resource },
            ResourceAccess::READ);
    }

    pub fn set_sampler(&mut self, slot: u32, resource: ResourceHandle) {
        self.bind(
            BindingPath::Sampler(slot),
            resource,
            0,
            RecordedCommand::BindSampler { slot, resource },
            ResourceAccess::READ);
    }

    pub fn set_argument_buffer(&mut self, slot: u32, resource: ResourceHandle, offset: u64) {
        self.bind(
            BindingPath::ArgumentBuffer(slot),
            resource,
            offset,
            RecordedCommand::BindArgumentBuffer { slot, resource, offset },
            ResourceAccess::READ);
    }

    /// Inline constants; no resource is involved.
    pub fn set_bytes(&mut self, slot: u32, data: &[u8]) {
        self.pass.commands.push(RecordedCommand::SetBytes {
            slot,
            data: data.to_vec(),
        });
    }

    /// Declare an access the binding calls cannot express (storage writes,
    /// finer stages, subresource ranges). With `allow_reordering` the
    /// residency declaration joins the encoder-wide batched set; without it,
    /// the declaration is pinned at exactly this command position.
    pub fn use_resource(
        &mut self,
        resource: ResourceHandle,
        access: ResourceAccess,
        stages: StageMask,
        allow_reordering: bool,
    ) {
        self.touch(resource, access, stages, SubresourceMask::ALL, allow_reordering);
    }

    pub fn use_resource_subrange(
        &mut self,
        resource: ResourceHandle,
        access: ResourceAccess,
        stages: StageMask,
        mask: SubresourceMask,
    ) {
        self.touch(resource, access, stages, mask, true);
    }

    pub fn use_heap(&mut self, heap: ResourceHandle, stages: StageMask) {
        let command_index = self.next_index();
        self.pass.heap_uses.push(HeapUse { heap, stages, command_index });
    }

    /// Explicit barrier over whole cache scopes.
    pub fn memory_barrier_scope(
        &mut self,
        scope: BarrierScope,
        after_stages: StageMask,
        before_stages: StageMask,
    ) {
        let command_index = self.next_index();
        self.pass.barriers.push(PassBarrier {
            scope: Some(scope),
            resources: Vec::new(),
            after_stages,
            before_stages,
            command_index,
        });
    }

    /// Explicit barrier naming the exact resources it protects.
    pub fn memory_barrier_resources(
        &mut self,
        resources: &[ResourceHandle],
        after_stages: StageMask,
        before_stages: StageMask,
    ) {
        let command_index = self.next_index();
        self.pass.barriers.push(PassBarrier {
            scope: None,
            resources: resources.to_vec(),
            after_stages,
            before_stages,
            command_index,
        });
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        let index = self.next_index();
        self.consume_bindings(index);
        self.pass.commands.push(RecordedCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        let index = self.next_index();
        self.consume_bindings(index);
        self.pass.commands.push(RecordedCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    pub fn dispatch(&mut self, groups: [u32; 3]) {
        let index = self.next_index();
        self.consume_bindings(index);
        self.pass.commands.push(RecordedCommand::Dispatch { groups });
    }

    pub fn copy_buffer(
        &mut self,
        src: ResourceHandle,
        src_offset: u64,
        dst: ResourceHandle,
        dst_offset: u64,
        size: u64,
    ) {
        self.touch(src, ResourceAccess::BLIT_SRC, StageMask::BLIT, SubresourceMask::ALL, true);
        self.touch(dst, ResourceAccess::BLIT_DST, StageMask::BLIT, SubresourceMask::ALL, true);
        self.pass.commands.push(RecordedCommand::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    pub fn copy_texture(&mut self, src: ResourceHandle, dst: ResourceHandle) {
        self.touch(src, ResourceAccess::BLIT_SRC, StageMask::BLIT, SubresourceMask::ALL, true);
        self.touch(dst, ResourceAccess::BLIT_DST, StageMask::BLIT, SubresourceMask::ALL, true);
        self.pass.commands.push(RecordedCommand::CopyTexture { src, dst });
    }

    pub fn build_acceleration_structure(&mut self, dst: ResourceHandle) {
        self.touch(
            dst,
            ResourceAccess::WRITE,
            StageMask::COMPUTE,
            SubresourceMask::ALL,
            true);
        self.pass.commands.push(RecordedCommand::BuildAccelerationStructure { dst });
    }
}
