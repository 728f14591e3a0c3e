use std::collections::HashMap;

use api_types::handle::{ResourceHandle, ResourceKind};
use api_types::image::{layout_for_access, ImageLayout, PixelFormat};
use api_types::queue::QueueId;
use api_types::usage::{ResourceAccess, StageMask};

use crate::compiler::Schedule;
use crate::pass_node::PassNode;
use crate::resource::transient_registry::TransientAssignment;
use profiling::enter_span;

/// One side of a dependency: a command index and the pipeline stages
/// participating there.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct SyncPoint {
    pub index: u32,
    pub stages: StageMask,
}

/// An encoder-pair dependency. `signal` names the last hazard-producing
/// command in the source encoder, `wait` the first consuming command in the
/// destination.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Dep {
    pub signal: SyncPoint,
    pub wait: SyncPoint,
}

/// Dense encoder-pair matrix of merged dependencies. Registration order is
/// topological by construction, so only cells with `src < dst` are ever
/// occupied.
#[derive(Clone, Debug)]
pub struct DependencyTable {
    count: usize,
    cells: Vec<Option<Dep>>,
}

impl DependencyTable {
    pub fn new(count: usize) -> Self {
        DependencyTable {
            count,
            cells: vec![None; count * count],
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn get(&self, dst: u32, src: u32) -> Option<Dep> {
        self.cells[dst as usize * self.count + src as usize]
    }

    /// Merge a new hazard into the cell: latest signal, earliest wait,
    /// stages unioned.
    pub fn merge(&mut self, dst: u32, src: u32, dep: Dep) {
        debug_assert!(src < dst, "Dependency matrix must stay lower-triangular");
        let cell = &mut self.cells[dst as usize * self.count + src as usize];
        *cell = Some(match *cell {
            None => dep,
            Some(existing) => Dep {
                signal: SyncPoint {
                    index: existing.signal.index.max(dep.signal.index),
                    stages: existing.signal.stages | dep.signal.stages,
                },
                wait: SyncPoint {
                    index: existing.wait.index.min(dep.wait.index),
                    stages: existing.wait.stages | dep.wait.stages,
                },
            },
        });
    }

    pub fn clear(&mut self, dst: u32, src: u32) {
        self.cells[dst as usize * self.count + src as usize] = None;
    }

    pub fn incoming(&self, dst: u32) -> impl Iterator<Item = (u32, Dep)> + '_ {
        let base = dst as usize * self.count;
        (0..self.count as u32).filter_map(move |src| {
            self.cells[base + src as usize].map(|dep| (src, dep))
        })
    }

    pub fn edge_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// Reachability closure as per-encoder ancestor bitsets.
    pub fn ancestors(&self) -> Vec<fixedbitset::FixedBitSet> {
        let mut sets: Vec<fixedbitset::FixedBitSet> = Vec::with_capacity(self.count);
        for dst in 0..self.count as u32 {
            let mut set = fixedbitset::FixedBitSet::with_capacity(self.count);
            for (src, _) in self.incoming(dst) {
                set.insert(src as usize);
                let src_set = sets[src as usize].clone();
                set.union_with(&src_set);
            }
            sets.push(set);
        }
        sets
    }
}

/// A single resource hazard, kept alongside the merged matrix so the
/// compactor knows which resources and layout transitions each surviving
/// edge carries. `src_encoder == dst_encoder` marks an intra-encoder (or
/// intra-pass) hazard that never enters the matrix.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct HazardRecord {
    pub resource: ResourceHandle,
    pub src_encoder: u32,
    pub dst_encoder: u32,
    pub signal: SyncPoint,
    pub wait: SyncPoint,
    pub cross_queue: bool,
    pub render_target: bool,
    pub transition: Option<(ImageLayout, ImageLayout)>,
}

#[derive(Debug)]
pub struct DependencyAnalysis {
    pub table: DependencyTable,
    pub hazards: Vec<HazardRecord>,
    /// Encoder lifetime of every transient resource used this frame; the
    /// transient allocator aliases resources whose intervals are disjoint.
    pub lifetimes: Vec<TransientAssignment>,
    /// The layout every persistent texture is left in at frame end.
    pub final_layouts: Vec<(ResourceHandle, ImageLayout)>,
}

#[derive(Clone, Copy, Debug)]
struct Event {
    encoder: u32,
    queue: QueueId,
    first: u32,
    last: u32,
    stages: StageMask,
    access: ResourceAccess,
}

/// Scan every resource's per-frame event log (ordered by encoder, then
/// first command index) for RAW, WAR, WAW, and layout hazards, merging them
/// into the encoder-pair matrix.
#[tracing::instrument(skip_all)]
pub fn build(
    passes: &[PassNode],
    schedule: &Schedule,
    format_of: &dyn Fn(ResourceHandle) -> Option<PixelFormat>,
    initial_layout_of: &dyn Fn(ResourceHandle) -> ImageLayout,
) -> DependencyAnalysis {
    enter_span!(tracing::Level::TRACE, "Build dependencies");

    let mut table = DependencyTable::new(schedule.encoders.len());
    let mut hazards: Vec<HazardRecord> = Vec::new();

    // Event logs in first-touch order so downstream output is
    // deterministic for identical frames.
    let mut event_order: Vec<ResourceHandle> = Vec::new();
    let mut event_logs: HashMap<ResourceHandle, Vec<Event>> = HashMap::new();

    for (retained_index, &pass_index) in schedule.retained.iter().enumerate() {
        let pass = &passes[pass_index];
        let encoder = schedule.encoder_of(retained_index);
        for usage in &pass.usages {
            let event = Event {
                encoder: encoder.index,
                queue: encoder.queue,
                first: pass.command_range.start + usage.first_command_index,
                last: pass.command_range.start + usage.last_command_index,
                stages: usage.stages,
                access: usage.access,
            };
            if usage.resource.kind() == ResourceKind::Heap
                || usage.resource.kind() == ResourceKind::Sampler
            {
                continue;
            }
            event_logs.entry(usage.resource)
                .or_insert_with(|| {
                    event_order.push(usage.resource);
                    Vec::new()
                })
                .push(event);
        }
    }

    let mut lifetimes: Vec<TransientAssignment> = Vec::new();
    let mut final_layouts: Vec<(ResourceHandle, ImageLayout)> = Vec::new();

    for resource in event_order {
        let events = &event_logs[&resource];
        let format = (resource.kind() == ResourceKind::Texture)
            .then(|| format_of(resource))
            .flatten();
        let mut current_layout = format.map(|_| initial_layout_of(resource))
            .unwrap_or(ImageLayout::Undefined);

        let mut last_write: Option<Event> = None;
        let mut prev_event: Option<Event> = None;
        let mut reads_since_write: Vec<Event> = Vec::new();

        for event in events {
            let required_layout = format.map(|f| layout_for_access(event.access, f));
            let mut transition = required_layout
                .filter(|&new| new != current_layout)
                .map(|new| (current_layout, new));

            // a pass that reads and then writes the same resource needs an
            // intra-pass barrier between the two ends of its usage range
            if event.access.is_read() && event.access.is_write() && event.first != event.last {
                hazards.push(HazardRecord {
                    resource,
                    src_encoder: event.encoder,
                    dst_encoder: event.encoder,
                    signal: SyncPoint { index: event.first, stages: event.stages },
                    wait: SyncPoint { index: event.last, stages: event.stages },
                    cross_queue: false,
                    render_target: event.access.contains(ResourceAccess::RENDER_TARGET),
                    transition: None,
                });
            }

            if event.access.is_write() {
                if reads_since_write.is_empty() {
                    if let Some(writer) = last_write {
                        emit(&mut table, &mut hazards, resource, &writer, event,
                            transition.take());
                    } else if transition.is_some() {
                        entry_transition(&mut hazards, resource, event, transition.take());
                    }
                } else {
                    for reader in reads_since_write.drain(..) {
                        emit(&mut table, &mut hazards, resource, &reader, event,
                            transition.take());
                    }
                }
                last_write = Some(*event);
            } else {
                if let Some(writer) = last_write {
                    emit(&mut table, &mut hazards, resource, &writer, event,
                        transition.take());
                } else if transition.is_some() {
                    // layout change with no producing write this frame:
                    // either an entry transition or a read-to-read change
                    match prev_event {
                        Some(prev) => emit(&mut table, &mut hazards, resource, &prev, event,
                            transition.take()),
                        None => entry_transition(&mut hazards, resource, event,
                            transition.take()),
                    }
                }
                reads_since_write.push(*event);
            }

            if let Some(new) = required_layout {
                current_layout = new;
            }
            prev_event = Some(*event);
        }

        if resource.is_transient() {
            let first = events.iter().map(|e| e.encoder).min().unwrap();
            let last = events.iter().map(|e| e.encoder).max().unwrap();
            lifetimes.push(TransientAssignment {
                index: resource.index(),
                queue: events[0].queue,
                first_encoder: first,
                last_encoder: last,
            });
        } else if format.is_some() {
            final_layouts.push((resource, current_layout));
        }
    }

    DependencyAnalysis {
        table,
        hazards,
        lifetimes,
        final_layouts,
    }
}

fn emit(
    table: &mut DependencyTable,
    hazards: &mut Vec<HazardRecord>,
    resource: ResourceHandle,
    producer: &Event,
    consumer: &Event,
    transition: Option<(ImageLayout, ImageLayout)>,
) {
    let signal = SyncPoint { index: producer.last, stages: producer.stages };
    let wait = SyncPoint { index: consumer.first, stages: consumer.stages };
    hazards.push(HazardRecord {
        resource,
        src_encoder: producer.encoder,
        dst_encoder: consumer.encoder,
        signal,
        wait,
        cross_queue: producer.queue != consumer.queue,
        render_target: (producer.access | consumer.access)
            .contains(ResourceAccess::RENDER_TARGET),
        transition,
    });
    if producer.encoder != consumer.encoder {
        table.merge(consumer.encoder, producer.encoder, Dep { signal, wait });
    }
}

/// First touch of a texture requires a layout transition but has no
/// producer this frame; the compactor places a transition-only barrier
/// ahead of the consuming command.
fn entry_transition(
    hazards: &mut Vec<HazardRecord>,
    resource: ResourceHandle,
    consumer: &Event,
    transition: Option<(ImageLayout, ImageLayout)>,
) {
    hazards.push(HazardRecord {
        resource,
        src_encoder: consumer.encoder,
        dst_encoder: consumer.encoder,
        signal: SyncPoint { index: consumer.first, stages: StageMask::empty() },
        wait: SyncPoint { index: consumer.first, stages: consumer.stages },
        cross_queue: false,
        render_target: consumer.access.contains(ResourceAccess::RENDER_TARGET),
        transition,
    });
}
