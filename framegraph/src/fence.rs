use std::sync::Arc;

use crossbeam_queue::SegQueue;

use api_types::command::FenceId;
use api_types::device::DeviceInterface;
use api_types::queue::QueueId;
use api_types::usage::StageMask;

use crate::compiler::CommandEncoder;
use crate::dependency::{Dep, DependencyTable};

/// Lock-free freelist of backend sync events, one list per queue. A fence
/// is owned by the queue that signals it; it returns to the pool once the
/// command buffer it retires with has completed.
pub struct FencePool {
    device: Arc<dyn DeviceInterface>,
    free: Vec<(QueueId, SegQueue<FenceId>)>,
}

impl FencePool {
    pub fn new(device: Arc<dyn DeviceInterface>, queues: &[QueueId]) -> Self {
        FencePool {
            device,
            free: queues.iter().map(|&queue| (queue, SegQueue::new())).collect(),
        }
    }

    fn freelist(&self, queue: QueueId) -> &SegQueue<FenceId> {
        &self.free.iter()
            .find(|(q, _)| *q == queue)
            .expect("Fence requested for an unknown queue")
            .1
    }

    pub fn acquire(&self, queue: QueueId) -> FenceId {
        match self.freelist(queue).pop() {
            Some(fence) => fence,
            None => self.device.make_sync_event(queue),
        }
    }

    pub fn recycle(&self, queue: QueueId, fence: FenceId) {
        self.freelist(queue).push(fence);
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct PlannedWait {
    pub wait_encoder: u32,
    pub wait_stages: StageMask,
    pub wait_index: u32,
}

/// One fence signal with its cross-queue consumers. The fence retires no
/// earlier than the latest dependent command buffer.
#[derive(Clone, PartialEq, Debug)]
pub struct PlannedFence {
    pub fence: FenceId,
    pub queue: QueueId,
    pub signal_encoder: u32,
    pub signal_stages: StageMask,
    pub signal_index: u32,
    pub command_buffer_index: u32,
    pub waits: Vec<PlannedWait>,
}

/// Surviving edges split by mechanism: same-queue edges become barriers in
/// the compacted stream, cross-queue edges become fences.
#[derive(Debug, Default)]
pub struct FencePlan {
    pub fences: Vec<PlannedFence>,
    pub same_queue_edges: Vec<(u32, u32, Dep)>,
}

/// Assign sync mechanisms to every surviving edge of the reduced matrix.
/// One fence serves all of a source encoder's outgoing cross-queue edges
/// that share identical signal stages; distinct stage sets get distinct
/// fences.
#[tracing::instrument(skip_all)]
pub fn plan(
    table: &DependencyTable,
    encoders: &[CommandEncoder],
    pool: &FencePool,
) -> FencePlan {
    let mut plan = FencePlan::default();

    for dst in 0..table.count() as u32 {
        for (src, dep) in table.incoming(dst) {
            let src_encoder = &encoders[src as usize];
            let dst_encoder = &encoders[dst as usize];

            if src_encoder.queue == dst_encoder.queue {
                plan.same_queue_edges.push((src, dst, dep));
                continue;
            }

            let position = plan.fences.iter().position(|fence| {
                fence.signal_encoder == src && fence.signal_stages == dep.signal.stages
            });
            let fence = match position {
                Some(position) => &mut plan.fences[position],
                None => {
                    let fence = pool.acquire(src_encoder.queue);
                    plan.fences.push(PlannedFence {
                        fence,
                        queue: src_encoder.queue,
                        signal_encoder: src,
                        signal_stages: dep.signal.stages,
                        signal_index: dep.signal.index,
                        command_buffer_index: src_encoder.command_buffer_index,
                        waits: Vec::new(),
                    });
                    plan.fences.last_mut().unwrap()
                }
            };
            fence.signal_index = fence.signal_index.max(dep.signal.index);
            fence.command_buffer_index = fence.command_buffer_index
                .max(src_encoder.command_buffer_index)
                .max(dst_encoder.command_buffer_index);
            fence.waits.push(PlannedWait {
                wait_encoder: dst,
                wait_stages: dep.wait.stages,
                wait_index: dep.wait.index,
            });
        }
    }

    log::trace!(target: "framegraph",
        "Planned {} fences and {} same-queue barriers",
        plan.fences.len(), plan.same_queue_edges.len());
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Range;
    use api_types::command::PassKind;
    use crate::dependency::SyncPoint;
    use crate::testing::NullDevice;

    fn encoder(index: u32, queue: QueueId, range: Range<u32>) -> CommandEncoder {
        CommandEncoder {
            index,
            kind: PassKind::Compute,
            queue,
            command_buffer_index: index,
            pass_range: 0..0,
            command_range: range,
        }
    }

    fn dep(signal: StageMask, wait: StageMask) -> Dep {
        Dep {
            signal: SyncPoint { index: 0, stages: signal },
            wait: SyncPoint { index: 1, stages: wait },
        }
    }

    #[test]
    fn same_queue_edges_become_barriers() {
        let device: Arc<dyn DeviceInterface> = Arc::new(NullDevice::new());
        let pool = FencePool::new(device, &[QueueId(0)]);
        let encoders = vec![
            encoder(0, QueueId(0), 0..4),
            encoder(1, QueueId(0), 4..8),
        ];
        let mut table = DependencyTable::new(2);
        table.merge(1, 0, dep(StageMask::COMPUTE, StageMask::COMPUTE));
        let plan = plan(&table, &encoders, &pool);
        assert!(plan.fences.is_empty());
        assert_eq!(plan.same_queue_edges.len(), 1);
    }

    #[test]
    fn cross_queue_edges_allocate_fences() {
        let device: Arc<dyn DeviceInterface> = Arc::new(NullDevice::new());
        let pool = FencePool::new(device, &[QueueId(0), QueueId(1)]);
        let encoders = vec![
            encoder(0, QueueId(0), 0..4),
            encoder(1, QueueId(1), 4..8),
        ];
        let mut table = DependencyTable::new(2);
        table.merge(1, 0, dep(StageMask::COMPUTE, StageMask::VERTEX));
        let plan = plan(&table, &encoders, &pool);
        assert_eq!(plan.fences.len(), 1);
        let fence = &plan.fences[0];
        assert_eq!(fence.signal_encoder, 0);
        assert_eq!(fence.waits.len(), 1);
        assert_eq!(fence.waits[0].wait_stages, StageMask::VERTEX);
        // retired no earlier than the latest dependent command buffer
        assert_eq!(fence.command_buffer_index, 1);
    }

    #[test]
    fn shared_signal_stages_share_one_fence() {
        let device: Arc<dyn DeviceInterface> = Arc::new(NullDevice::new());
        let pool = FencePool::new(device, &[QueueId(0), QueueId(1)]);
        let encoders = vec![
            encoder(0, QueueId(0), 0..4),
            encoder(1, QueueId(1), 4..8),
            encoder(2, QueueId(1), 8..12),
        ];
        let mut table = DependencyTable::new(3);
        table.merge(1, 0, dep(StageMask::COMPUTE, StageMask::VERTEX));
        table.merge(2, 0, dep(StageMask::COMPUTE, StageMask::FRAGMENT));
        let plan = plan(&table, &encoders, &pool);
        assert_eq!(plan.fences.len(), 1);
        assert_eq!(plan.fences[0].waits.len(), 2);
    }

    #[test]
    fn distinct_signal_stages_split_fences() {
        let device: Arc<dyn DeviceInterface> = Arc::new(NullDevice::new());
        let pool = FencePool::new(device, &[QueueId(0), QueueId(1)]);
        let encoders = vec![
            encoder(0, QueueId(0), 0..4),
            encoder(1, QueueId(1), 4..8),
            encoder(2, QueueId(1), 8..12),
        ];
        let mut table = DependencyTable::new(3);
        table.merge(1, 0, dep(StageMask::COMPUTE, StageMask::VERTEX));
        table.merge(2, 0, dep(StageMask::BLIT, StageMask::FRAGMENT));
        let plan = plan(&table, &encoders, &pool);
        assert_eq!(plan.fences.len(), 2);
    }

    #[test]
    fn pool_recycles_fences() {
        let device: Arc<dyn DeviceInterface> = Arc::new(NullDevice::new());
        let pool = FencePool::new(device, &[QueueId(0)]);
        let first = pool.acquire(QueueId(0));
        pool.recycle(QueueId(0), first);
        let second = pool.acquire(QueueId(0));
        assert_eq!(first, second);
    }
}
