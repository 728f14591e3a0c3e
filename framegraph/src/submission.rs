use std::sync::Arc;

use api_types::command::{
    CommandBufferId, EncodedCommand, EncoderSubmitInfo, FenceSignal, FenceWait, ResourceCommand,
    SubmissionId,
};
use api_types::device::DeviceInterface;
use api_types::queue::QueueId;

use crate::compiler::Schedule;
use crate::fence::FencePlan;
use crate::pass_node::PassNode;
use profiling::enter_span;

/// Merge one encoder's pass commands with its compacted resource commands
/// into a single stream ordered by `(index, Before < Pass < After)`.
fn merge_streams(
    passes: &mut [PassNode],
    schedule: &Schedule,
    encoder_index: u32,
    resource_commands: &[ResourceCommand],
) -> Vec<EncodedCommand> {
    // rank encodes the Before < Pass < After ordering at equal indices
    let mut entries: Vec<(u32, u8, usize, EncodedCommand)> = Vec::new();

    for (position, command) in resource_commands.iter().enumerate() {
        let rank = match command.order {
            api_types::command::CommandOrder::Before => 0u8,
            api_types::command::CommandOrder::After => 2u8,
        };
        entries.push((command.index, rank, position, EncodedCommand::Resource(command.clone())));
    }

    let encoder = &schedule.encoders[encoder_index as usize];
    for retained_index in encoder.pass_range.clone() {
        let pass = &mut passes[schedule.retained[retained_index as usize]];
        let base = pass.command_range.start;
        for (offset, command) in pass.commands.drain(..).enumerate() {
            entries.push((
                base + offset as u32,
                1u8,
                offset,
                EncodedCommand::Pass(command),
            ));
        }
    }

    entries.sort_by_key(|(index, rank, position, _)| (*index, *rank, *position));
    entries.into_iter().map(|(_, _, _, command)| command).collect()
}

/// Walk the encoders in order, replaying each merged stream into a backend
/// command buffer; a command buffer is submitted once the next encoder
/// no longer shares it. Fence waits and signals attach to the submission
/// whose command buffer contains the corresponding encoder.
#[tracing::instrument(skip_all)]
pub fn submit_frame(
    device: &Arc<dyn DeviceInterface>,
    passes: &mut [PassNode],
    schedule: &Schedule,
    compacted: &[Vec<ResourceCommand>],
    plan: &FencePlan,
) -> Vec<SubmissionId> {
    enter_span!(tracing::Level::TRACE, "Submit frame");

    struct OpenBuffer {
        id: CommandBufferId,
        queue: QueueId,
        command_buffer_index: u32,
        waits: Vec<FenceWait>,
        signals: Vec<FenceSignal>,
    }

    let mut submissions: Vec<SubmissionId> = Vec::new();
    let mut open: Option<OpenBuffer> = None;

    for encoder in &schedule.encoders {
        let stream = merge_streams(passes, schedule, encoder.index, &compacted[encoder.index as usize]);
        let first_pass = schedule.retained[encoder.pass_range.start as usize];
        let info = EncoderSubmitInfo {
            kind: encoder.kind,
            name: passes[first_pass].name.clone(),
            queue: encoder.queue,
            command_buffer_index: encoder.command_buffer_index,
        };
        let id = device.encode_pass(&info, &stream);

        let reuse = matches!(&open,
            Some(buffer) if buffer.command_buffer_index == encoder.command_buffer_index);
        if !reuse {
            if let Some(finished) = open.take() {
                submissions.push(device.submit(
                    finished.id,
                    finished.queue,
                    &finished.waits,
                    &finished.signals));
            }
            open = Some(OpenBuffer {
                id,
                queue: encoder.queue,
                command_buffer_index: encoder.command_buffer_index,
                waits: Vec::new(),
                signals: Vec::new(),
            });
        }
        let buffer = open.as_mut().unwrap();

        for fence in &plan.fences {
            if fence.signal_encoder == encoder.index {
                buffer.signals.push(FenceSignal {
                    fence: fence.fence,
                    after_stages: fence.signal_stages,
                });
            }
            for wait in &fence.waits {
                if wait.wait_encoder == encoder.index {
                    buffer.waits.push(FenceWait {
                        fence: fence.fence,
                        before_stages: wait.wait_stages,
                    });
                }
            }
        }
    }

    if let Some(finished) = open.take() {
        submissions.push(device.submit(
            finished.id,
            finished.queue,
            &finished.waits,
            &finished.signals));
    }

    log::trace!(target: "framegraph", "Submitted {} command buffers", submissions.len());
    submissions
}
