use std::collections::HashSet;
use std::ops::Range;

use log::trace as log_trace;
use multimap::MultiMap;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{Dfs, Reversed};

use api_types::command::PassKind;
use api_types::queue::QueueId;

use crate::pass_node::PassNode;
use profiling::enter_span;

/// A maximal run of consecutive passes sharing a kind and queue, submitted
/// as one region of a command buffer. Encoders are the unit of dependency
/// tracking and fencing.
#[derive(Clone, PartialEq, Debug)]
pub struct CommandEncoder {
    pub index: u32,
    pub kind: PassKind,
    pub queue: QueueId,
    pub command_buffer_index: u32,
    /// Range into the retained-pass list.
    pub pass_range: Range<u32>,
    /// Range in the frame's global command index space.
    pub command_range: Range<u32>,
}

/// Output of culling + encoder assignment.
#[derive(Debug)]
pub struct Schedule {
    pub encoders: Vec<CommandEncoder>,
    /// Indices into the original pass list, in registration order.
    pub retained: Vec<usize>,
    /// Encoder index per retained pass, parallel to `retained`.
    pub pass_encoder: Vec<u32>,
}

impl Schedule {
    pub fn encoder_of(&self, retained_index: usize) -> &CommandEncoder {
        &self.encoders[self.pass_encoder[retained_index] as usize]
    }
}

/// Cull passes whose writes never reach an externally-observable resource.
///
/// Persistent-registry writes are the sinks: a persistent resource outlives
/// the frame (swapchain images are imported into the persistent registry,
/// and persistent buffers may be read next frame). Reverse reachability
/// from those writers retains everything they transitively consume.
#[tracing::instrument(skip(passes))]
pub fn cull_passes(passes: &[PassNode]) -> Vec<bool> {
    enter_span!(tracing::Level::TRACE, "Cull passes");

    let mut graph: StableDiGraph<usize, u32> = StableDiGraph::new();
    let nodes: Vec<NodeIndex> = (0..passes.len()).map(|i| graph.add_node(i)).collect();

    // producer map: resource -> passes that write it
    let mut writer_map = MultiMap::new();
    for (pass_index, pass) in passes.iter().enumerate() {
        for usage in &pass.usages {
            if usage.access.is_write() {
                writer_map.insert(usage.resource, pass_index);
            }
        }
    }

    // a read of a resource depends on every earlier writer of it
    for (pass_index, pass) in passes.iter().enumerate() {
        for usage in &pass.usages {
            if !usage.access.is_read() {
                continue;
            }
            if let Some(writers) = writer_map.get_vec(&usage.resource) {
                for &writer in writers {
                    if writer < pass_index {
                        graph.update_edge(nodes[writer], nodes[pass_index], 0);
                    }
                }
            }
        }
    }

    let mut retained = vec![false; passes.len()];
    let reversed = Reversed(&graph);
    let mut dfs = Dfs::empty(reversed);
    for (pass_index, pass) in passes.iter().enumerate() {
        let writes_external = pass.usages.iter()
            .any(|usage| usage.access.is_write() && !usage.resource.is_transient());
        if !writes_external {
            continue;
        }
        dfs.move_to(nodes[pass_index]);
        while let Some(node) = dfs.next(reversed) {
            retained[graph[node]] = true;
        }
    }

    for (pass_index, keep) in retained.iter().enumerate() {
        if !keep {
            log_trace!(target: "framegraph", "Culling unused pass: {:?}", passes[pass_index].name);
        }
    }

    retained
}

/// Walk retained passes in registration order, opening a new encoder when
/// the kind or queue changes, when the command-buffer soft cap would be
/// exceeded, when a graphics pass's attachments differ from the current
/// run's, or when appending would demote a barrier to a pass boundary
/// (a graphics pass reading what the current run wrote). External passes
/// always stand alone.
///
/// Also assigns every retained pass its global command range.
#[tracing::instrument(skip(passes, retained, queue_of))]
pub fn assign_encoders(
    passes: &mut [PassNode],
    retained: &[bool],
    queue_of: &dyn Fn(&PassNode) -> QueueId,
    soft_cap: u32,
) -> Schedule {
    enter_span!(tracing::Level::TRACE, "Assign encoders");

    let mut encoders: Vec<CommandEncoder> = Vec::new();
    let mut retained_indices: Vec<usize> = Vec::new();
    let mut pass_encoder: Vec<u32> = Vec::new();

    let mut command_cursor: u32 = 0;
    let mut written_in_run: HashSet<api_types::handle::ResourceHandle> = HashSet::new();

    for pass_index in 0..passes.len() {
        if !retained[pass_index] {
            continue;
        }
        let queue = queue_of(&passes[pass_index]);
        let kind = passes[pass_index].kind;
        let command_count = passes[pass_index].commands.len() as u32;

        let reads_current_writes = passes[pass_index].usages.iter()
            .any(|usage| usage.access.is_read() && written_in_run.contains(&usage.resource));

        let open_new = match encoders.last() {
            None => true,
            Some(current) => {
                let over_cap = current.command_range.end - current.command_range.start
                    + command_count > soft_cap;
                let attachments_differ = kind == PassKind::Graphics && {
                    let first_pass = retained_indices[current.pass_range.start as usize];
                    passes[first_pass].attachments != passes[pass_index].attachments
                };
                current.kind != kind
                    || current.queue != queue
                    || kind == PassKind::External
                    || over_cap
                    || attachments_differ
                    || (kind == PassKind::Graphics && reads_current_writes)
            }
        };

        let retained_pos = retained_indices.len() as u32;
        if open_new {
            let command_buffer_index = match encoders.last() {
                None => 0,
                Some(prev) if prev.queue == queue && prev.kind != PassKind::External
                    && kind != PassKind::External => prev.command_buffer_index,
                Some(prev) => prev.command_buffer_index + 1,
            };
            encoders.push(CommandEncoder {
                index: encoders.len() as u32,
                kind,
                queue,
                command_buffer_index,
                pass_range: retained_pos..retained_pos,
                command_range: command_cursor..command_cursor,
            });
            written_in_run.clear();
        }

        let encoder = encoders.last_mut().unwrap();
        passes[pass_index].command_range = command_cursor..command_cursor + command_count;
        command_cursor += command_count;
        encoder.pass_range.end = retained_pos + 1;
        encoder.command_range.end = command_cursor;

        for usage in &passes[pass_index].usages {
            if usage.access.is_write() {
                written_in_run.insert(usage.resource);
            }
        }

        pass_encoder.push(encoder.index);
        retained_indices.push(pass_index);
    }

    log_trace!(target: "framegraph",
        "Assigned {} retained passes to {} encoders",
        retained_indices.len(), encoders.len());

    Schedule {
        encoders,
        retained: retained_indices,
        pass_encoder,
    }
}
