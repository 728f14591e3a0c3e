use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use api_types::command::{FenceId, ResourceCommand, SubmissionId};
use api_types::device::DeviceInterface;
use api_types::handle::{RegistryClass, ResourceHandle};
use api_types::image::{ImageLayout, PixelFormat};
use api_types::queue::{QueueId, QueueKind, QueueSpec};

use crate::compaction::{self, CompactionInput};
use crate::compiler;
use crate::dependency;
use crate::error::FrameGraphError;
use crate::fence::{self, FencePool};
use crate::frame::Frame;
use crate::pass_node::PassNode;
use crate::recorder::PassRecorder;
use crate::reduction;
use crate::resource::persistent_registry::PersistentRegistry;
use crate::resource::transient_registry::{TransientDescriptor, TransientRegistry};
use crate::resource::ResourceDescriptor;
use crate::submission;
use profiling::enter_span;

#[derive(Clone, Debug)]
pub struct FrameGraphConfig {
    /// How many frames may be in flight before `start_frame` blocks.
    pub in_flight_frames: usize,
    /// Idle grace period before a retired slot's arena memory is returned
    /// to the OS.
    pub transient_purge_delay: Duration,
    /// Overrides the backend's soft cap on commands per command buffer.
    pub encoder_command_soft_cap: Option<u32>,
    /// Allow transient resources with disjoint encoder lifetimes to share
    /// memory.
    pub aliasing_enabled: bool,
    /// How long to wait on an in-flight frame before declaring the device
    /// lost.
    pub fence_wait_timeout: Duration,
}

impl Default for FrameGraphConfig {
    fn default() -> Self {
        FrameGraphConfig {
            in_flight_frames: 2,
            transient_purge_delay: Duration::from_secs(5),
            encoder_command_soft_cap: None,
            aliasing_enabled: true,
            fence_wait_timeout: Duration::from_secs(2),
        }
    }
}

/// What a committed frame turned into, mostly for diagnostics and tests.
#[derive(Debug, Default)]
pub struct FrameReport {
    pub submissions: Vec<SubmissionId>,
    pub encoder_count: usize,
    pub fence_count: usize,
    pub culled_passes: Vec<String>,
    pub compacted: Vec<Vec<ResourceCommand>>,
    pub transient_placements: Vec<(ResourceHandle, u64)>,
}

struct QueueTable {
    graphics: QueueId,
    compute: QueueId,
    transfer: QueueId,
}

impl QueueTable {
    fn for_kind(&self, kind: QueueKind) -> QueueId {
        match kind {
            QueueKind::Graphics => self.graphics,
            QueueKind::Compute => self.compute,
            QueueKind::Transfer => self.transfer,
        }
    }

    fn all(&self) -> [QueueId; 3] {
        [self.graphics, self.compute, self.transfer]
    }
}

struct InFlightFrame {
    serial: u64,
    slot: u8,
    submission: SubmissionId,
    fences: Vec<(QueueId, FenceId)>,
}

/// The per-context runtime: owns the registries, the fence pool, and the
/// in-flight frame window, and turns committed frames into ordered,
/// synchronized backend submissions.
pub struct FrameGraph {
    device: Arc<dyn DeviceInterface>,
    config: FrameGraphConfig,
    persistent: PersistentRegistry,
    transients: Vec<TransientRegistry>,
    fence_pool: FencePool,
    queues: QueueTable,
    next_serial: u64,
    in_flight: VecDeque<InFlightFrame>,
    completed_serial: Arc<AtomicU64>,
    frame_active: bool,
}

impl FrameGraph {
    pub fn new(device: Arc<dyn DeviceInterface>, config: FrameGraphConfig) -> Self {
        let queues = QueueTable {
            graphics: device.make_queue(&QueueSpec::new(QueueKind::Graphics)),
            compute: device.make_queue(&QueueSpec::new(QueueKind::Compute)),
            transfer: device.make_queue(&QueueSpec::new(QueueKind::Transfer)),
        };
        let transients = (0..config.in_flight_frames)
            .map(|slot| TransientRegistry::new(slot as u8, device.clone()))
            .collect();
        FrameGraph {
            persistent: PersistentRegistry::new(device.clone()),
            fence_pool: FencePool::new(device.clone(), &queues.all()),
            transients,
            queues,
            config,
            device,
            next_serial: 0,
            in_flight: VecDeque::new(),
            completed_serial: Arc::new(AtomicU64::new(0)),
            frame_active: false,
        }
    }

    pub fn device(&self) -> &Arc<dyn DeviceInterface> {
        &self.device
    }

    pub fn persistent(&self) -> &PersistentRegistry {
        &self.persistent
    }

    /// Begin declaring a frame. Blocks while the in-flight window is full;
    /// a fence-wait timeout there escalates to device loss and internal
    /// recovery.
    pub fn start_frame(&mut self) -> Frame {
        assert!(!self.frame_active, "Can't start a frame that's already been started");

        while self.in_flight.len() >= self.config.in_flight_frames {
            let oldest = self.in_flight.front().unwrap();
            if self.device.wait_for_submission(oldest.submission, self.config.fence_wait_timeout) {
                self.completed_serial.fetch_max(oldest.serial, Ordering::AcqRel);
                self.process_retirements();
            } else {
                self.handle_device_lost();
            }
        }
        self.process_retirements();

        self.next_serial += 1;
        let serial = self.next_serial;
        let slot = ((serial - 1) as usize % self.config.in_flight_frames) as u8;
        self.transients[slot as usize].cycle();
        self.frame_active = true;
        log::trace!(target: "framegraph", "Starting frame {} (slot {})", serial, slot);
        Frame::new(slot, serial, self.transients[slot as usize].generation())
    }

    /// Run the whole per-frame pipeline: record, cull, assign encoders,
    /// build and reduce the dependency matrix, plan fences, compact
    /// resource commands, submit, and register retirement.
    pub fn commit_frame(&mut self, mut frame: Frame) -> Result<FrameReport, FrameGraphError> {
        assert!(self.frame_active, "No frame to commit");
        self.frame_active = false;
        frame.end();
        enter_span!(tracing::Level::DEBUG, "commit_frame", serial = frame.serial);

        let slot = frame.slot as usize;
        let mut passes = std::mem::take(&mut frame.passes);
        let transient_requests = std::mem::take(&mut frame.transients);

        // record executors on the worker pool; each pass records
        // independently into its own node
        passes.par_iter_mut().for_each(|pass| {
            if let Some(executor) = pass.executor.take() {
                let mut recorder = PassRecorder::new(pass);
                executor(&mut recorder);
            }
        });

        #[cfg(debug_assertions)]
        self.validate_memoryless(&passes, &transient_requests)?;

        let retained = compiler::cull_passes(&passes);
        let culled_passes: Vec<String> = passes.iter()
            .zip(&retained)
            .filter(|(_, keep)| !**keep)
            .map(|(pass, _)| pass.name.clone())
            .collect();

        if retained.iter().all(|keep| !keep) {
            log::trace!(target: "framegraph", "Frame {} has no live passes", frame.serial);
            return Ok(FrameReport { culled_passes, ..Default::default() });
        }

        let soft_cap = self.config.encoder_command_soft_cap
            .unwrap_or_else(|| self.device.encoder_command_soft_cap());
        let queues = &self.queues;
        let schedule = compiler::assign_encoders(
            &mut passes,
            &retained,
            &|pass: &PassNode| queues.for_kind(pass.queue_affinity),
            soft_cap);

        let analysis = {
            let persistent = &self.persistent;
            let requests = &transient_requests;
            let format_of = move |handle: ResourceHandle| -> Option<PixelFormat> {
                match handle.registry() {
                    RegistryClass::Persistent => match persistent.descriptor(handle) {
                        Ok(ResourceDescriptor::Texture(desc)) => Some(desc.pixel_format),
                        _ => None,
                    },
                    RegistryClass::Transient(_) => {
                        requests.get(handle.index() as usize).and_then(|r| match &r.descriptor {
                            TransientDescriptor::Texture(desc) => Some(desc.pixel_format),
                            TransientDescriptor::Buffer(_) => None,
                        })
                    }
                }
            };
            let initial_layout_of = move |handle: ResourceHandle| -> ImageLayout {
                match handle.registry() {
                    RegistryClass::Persistent => persistent.texture_layout(handle),
                    RegistryClass::Transient(_) => ImageLayout::Undefined,
                }
            };
            dependency::build(&passes, &schedule, &format_of, &initial_layout_of)
        };

        // lazy transient materialization, honoring the aliasing intervals;
        // on OOM, drain the in-flight window once and retry
        if let Err(first_error) = self.transients[slot].materialize(
            &transient_requests,
            &analysis.lifetimes,
            self.config.aliasing_enabled)
        {
            log::warn!(target: "framegraph",
                "Transient materialization failed ({}); retrying after retire", first_error);
            self.drain_in_flight()?;
            self.transients[slot].materialize(
                &transient_requests,
                &analysis.lifetimes,
                self.config.aliasing_enabled)?;
        }

        let mut table = analysis.table.clone();
        reduction::reduce(&mut table);

        let plan = fence::plan(&table, &schedule.encoders, &self.fence_pool);

        let compacted = compaction::compact(&CompactionInput {
            encoders: &schedule.encoders,
            passes: &passes,
            schedule: &schedule,
            hazards: &analysis.hazards,
            plan: &plan,
            is_tile_based: self.device.is_tile_based(),
        });

        let submissions = submission::submit_frame(
            &self.device,
            &mut passes,
            &schedule,
            &compacted,
            &plan);

        for (handle, layout) in &analysis.final_layouts {
            self.persistent.set_texture_layout(*handle, *layout);
        }
        self.persistent.record_submitted_serial(frame.serial);

        if let Some(&last) = submissions.last() {
            let completed = self.completed_serial.clone();
            let serial = frame.serial;
            self.device.completion_callback(last, Box::new(move || {
                completed.fetch_max(serial, Ordering::AcqRel);
            }));
            self.in_flight.push_back(InFlightFrame {
                serial: frame.serial,
                slot: frame.slot,
                submission: last,
                fences: plan.fences.iter().map(|f| (f.queue, f.fence)).collect(),
            });
        }

        let transient_placements = analysis.lifetimes.iter()
            .filter_map(|lifetime| {
                let request = &transient_requests[lifetime.index as usize];
                let handle = self.transients[slot].handle_for(request, lifetime.index);
                self.transients[slot].placement(handle)
                    .map(|placement| (handle, placement.offset))
            })
            .collect();

        Ok(FrameReport {
            submissions,
            encoder_count: schedule.encoders.len(),
            fence_count: plan.fences.len(),
            culled_passes,
            compacted,
            transient_placements,
        })
    }

    /// Retire every frame whose completion callback has fired: recycle its
    /// fences, release deferred disposals, flush purgeability updates, and
    /// start the idle clock on its transient arena.
    pub fn process_retirements(&mut self) {
        let completed = self.completed_serial.load(Ordering::Acquire);
        let now = Instant::now();
        while let Some(front) = self.in_flight.front() {
            if front.serial > completed {
                break;
            }
            let retired = self.in_flight.pop_front().unwrap();
            log::trace!(target: "framegraph", "Retiring frame {}", retired.serial);
            for (queue, fence) in retired.fences {
                self.fence_pool.recycle(queue, fence);
            }
            self.transients[retired.slot as usize].mark_retired(now);
        }
        self.persistent.process_disposals(completed);
        self.persistent.flush_purgeable_updates();
        for transient in &mut self.transients {
            transient.maybe_purge(now, self.config.transient_purge_delay);
        }
    }

    fn drain_in_flight(&mut self) -> Result<(), FrameGraphError> {
        while let Some(front) = self.in_flight.front() {
            if self.device.wait_for_submission(front.submission, self.config.fence_wait_timeout) {
                self.completed_serial.fetch_max(front.serial, Ordering::AcqRel);
                self.process_retirements();
            } else {
                self.handle_device_lost();
                return Err(FrameGraphError::DeviceLost(
                    "fence wait timed out while draining in-flight frames".to_string()));
            }
        }
        self.process_retirements();
        Ok(())
    }

    /// Fence timeout recovery: forget all in-flight state and materialize
    /// persistent resources from scratch. The next frame re-submits as if
    /// the context were new.
    fn handle_device_lost(&mut self) {
        log::error!(target: "framegraph", "Device lost; flushing state and re-materializing");
        self.in_flight.clear();
        self.completed_serial.store(self.next_serial, Ordering::Release);
        for transient in &mut self.transients {
            transient.cycle();
        }
        if let Err(error) = self.persistent.rematerialize_all() {
            log::error!(target: "framegraph",
                "Re-materialization after device loss failed: {}", error);
        }
    }

    #[cfg(debug_assertions)]
    fn validate_memoryless(
        &self,
        passes: &[PassNode],
        transient_requests: &[crate::resource::transient_registry::TransientRequest],
    ) -> Result<(), FrameGraphError> {
        use std::collections::HashMap;
        use api_types::usage::StorageMode;

        let storage_of = |handle: ResourceHandle| -> Option<StorageMode> {
            match handle.registry() {
                RegistryClass::Persistent => self.persistent.storage_mode(handle).ok(),
                RegistryClass::Transient(_) => transient_requests
                    .get(handle.index() as usize)
                    .map(|request| match &request.descriptor {
                        TransientDescriptor::Buffer(desc) => desc.storage_mode,
                        TransientDescriptor::Texture(desc) => desc.storage_mode,
                    }),
            }
        };

        let mut memoryless_passes: HashMap<ResourceHandle, Vec<u32>> = HashMap::new();
        for pass in passes {
            for usage in &pass.usages {
                if storage_of(usage.resource) == Some(StorageMode::Memoryless) {
                    memoryless_passes.entry(usage.resource).or_default().push(pass.id);
                }
            }
        }
        for (resource, pass_ids) in memoryless_passes {
            if !self.device.supports_memoryless_attachments() {
                return Err(FrameGraphError::ValidationFailure(format!(
                    "{:?} is memoryless but the backend has no tile memory", resource)));
            }
            if pass_ids.len() > 1 {
                return Err(FrameGraphError::ValidationFailure(format!(
                    "Memoryless {:?} is used by {} passes; its contents cannot survive \
                     beyond a single render pass",
                    resource, pass_ids.len())));
            }
        }
        Ok(())
    }
}
