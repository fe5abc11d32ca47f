//! CPU implementation of the HAL
//!
//! Command buffers record [`RecordedCommand`]s; the queue replays them on
//! submission (or later, in [`QueueMode::Deferred`]) and then signals the
//! fence. Compute dispatches run a registered [`SoftwareKernel`] looked up by
//! the label of the bound compute shader.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use prism_core::{logging::LogCategory, prism_debug, prism_error, prism_trace};
use tracing::instrument;
use wgpu::ShaderStages;

use crate::buffer::{Buffer, BufferCreationParams, DeviceMemory, MappedMemoryRange};
use crate::command::{
    check_bind_descriptor_sets, check_push_constants, check_recording, check_update_buffer,
    BufferMemoryBarrier, CommandBuffer, CommandBufferResetFlags, CommandBufferState,
    CommandBufferUsage, PipelineBindPoint, PipelineStageFlags,
};
use crate::descriptor::{DescriptorInfo, DescriptorSet, WriteDescriptorSet};
use crate::device::LogicalDevice;
use crate::limits::DeviceLimits;
use crate::pipeline::{Pipeline, PipelineLayout};
use crate::property_pool::{
    TransferDescriptor, TransferFlags, INVALID_INDEX_OFFSET, PROPERTY_POOL_COPY_SHADER,
    TRANSFER_DESCRIPTOR_SIZE,
};
use crate::queue::{Queue, SubmitInfo};
use crate::sync::Fence;

/// A command captured by [`SoftwareCommandBuffer`]
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    UpdateBuffer {
        buffer: Arc<Buffer>,
        offset: u64,
        data: Vec<u8>,
    },
    PipelineBarrier {
        src_stages: PipelineStageFlags,
        dst_stages: PipelineStageFlags,
        buffer_barriers: Vec<BufferMemoryBarrier>,
    },
    BindComputePipeline(Arc<Pipeline>),
    BindDescriptorSets {
        bind_point: PipelineBindPoint,
        layout: Arc<PipelineLayout>,
        first_set: u32,
        sets: Vec<Arc<DescriptorSet>>,
    },
    PushConstants {
        stages: ShaderStages,
        offset: u32,
        data: Vec<u8>,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

/// Everything a kernel sees for one dispatch
pub struct DispatchContext<'a> {
    pub sets: &'a [Option<Arc<DescriptorSet>>],
    pub push_constants: &'a [u8],
    pub group_count: [u32; 3],
}

impl DispatchContext<'_> {
    pub fn set(&self, index: u32) -> Result<&Arc<DescriptorSet>> {
        self.sets
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("descriptor set {} is not bound", index))
    }

    pub fn push_constant_u32(&self, index: usize) -> Result<u32> {
        let start = index * 4;
        let bytes = self
            .push_constants
            .get(start..start + 4)
            .ok_or_else(|| anyhow!("push constant dword {} was never pushed", index))?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
}

/// CPU stand-in for a compute shader
pub type SoftwareKernel = Arc<dyn Fn(&DispatchContext<'_>) -> Result<()> + Send + Sync>;

type KernelRegistry = Arc<RwLock<HashMap<String, SoftwareKernel>>>;

fn read_dwords(info: &DescriptorInfo) -> Result<Vec<u32>> {
    let bytes = info.buffer.read(info.offset, info.resolved_size())?;
    Ok(bytes
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<u32>)
        .collect())
}

/// CPU version of `property_pool_copy.wgsl`
pub fn property_pool_copy_kernel(ctx: &DispatchContext<'_>) -> Result<()> {
    let set = ctx.set(0)?;
    let base = u64::from(ctx.push_constant_u32(0)?);
    let end = u64::from(ctx.push_constant_u32(1)?);

    let table_info = set.descriptor(0, 0).context("transfer table is not bound")?;
    let table = table_info
        .buffer
        .read(table_info.offset, table_info.resolved_size())?;
    let indices = match set.descriptor(1, 0) {
        Some(info) => read_dwords(&info)?,
        None => Vec::new(),
    };
    let lookup = |offset: u32, element: u64| -> Result<u64> {
        let at = u64::from(offset) + element;
        indices
            .get(at as usize)
            .map(|&ix| u64::from(ix))
            .ok_or_else(|| anyhow!("index {} is outside the index table", at))
    };

    for property in 0..ctx.group_count[1] {
        let start = (u64::from(property) * TRANSFER_DESCRIPTOR_SIZE) as usize;
        let entry = table
            .get(start..start + TRANSFER_DESCRIPTOR_SIZE as usize)
            .ok_or_else(|| anyhow!("transfer table has no entry {}", property))?;
        let transfer: TransferDescriptor = bytemuck::pod_read_unaligned(entry);

        let element_dwords = u64::from(transfer.element_dwords());
        let last = transfer.total_dwords().min(end);
        if element_dwords == 0 || last <= base {
            continue;
        }
        let flags = transfer.flags();

        let src_info = set
            .descriptor(2, property)
            .with_context(|| format!("source {} is not bound", property))?;
        let dst_info = set
            .descriptor(3, property)
            .with_context(|| format!("destination {} is not bound", property))?;
        let src = read_dwords(&src_info)?;
        let mut dst = read_dwords(&dst_info)?;

        for d in base..last {
            let element = d / element_dwords;
            let component = d % element_dwords;

            let src_element = if flags.contains(TransferFlags::FILL) {
                0
            } else if transfer.src_index_offset != INVALID_INDEX_OFFSET {
                lookup(transfer.src_index_offset, element)?
            } else {
                element
            };
            let dst_element = if transfer.dst_index_offset != INVALID_INDEX_OFFSET {
                lookup(transfer.dst_index_offset, element)?
            } else {
                element
            };
            let src_dword = if flags.contains(TransferFlags::STAGED_SOURCE) {
                d - base
            } else {
                src_element * element_dwords + component
            };
            let dst_dword = dst_element * element_dwords + component;

            let value = *src.get(src_dword as usize).ok_or_else(|| {
                anyhow!("property {} reads dword {} past its source", property, src_dword)
            })?;
            let slot = dst.get_mut(dst_dword as usize).ok_or_else(|| {
                anyhow!("property {} writes dword {} past its destination", property, dst_dword)
            })?;
            *slot = value;
        }

        dst_info
            .buffer
            .write(dst_info.offset, bytemuck::cast_slice(&dst))?;
    }
    Ok(())
}

/// Counters exposed for inspection
#[derive(Debug, Default)]
pub struct DeviceStats {
    descriptor_updates: AtomicU64,
    flushed_ranges: AtomicU64,
    flushed_bytes: AtomicU64,
}

impl DeviceStats {
    pub fn descriptor_updates(&self) -> u64 {
        self.descriptor_updates.load(Ordering::Relaxed)
    }

    pub fn flushed_ranges(&self) -> u64 {
        self.flushed_ranges.load(Ordering::Relaxed)
    }

    pub fn flushed_bytes(&self) -> u64 {
        self.flushed_bytes.load(Ordering::Relaxed)
    }
}

pub struct SoftwareDevice {
    limits: DeviceLimits,
    kernels: KernelRegistry,
    stats: DeviceStats,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        let device = Self {
            limits,
            kernels: Arc::new(RwLock::new(HashMap::new())),
            stats: DeviceStats::default(),
        };
        device.register_kernel(PROPERTY_POOL_COPY_SHADER, Arc::new(property_pool_copy_kernel));
        device
    }

    /// Run `kernel` for dispatches of compute shaders labelled `label`
    pub fn register_kernel(&self, label: impl Into<String>, kernel: SoftwareKernel) {
        self.kernels.write().insert(label.into(), kernel);
    }

    pub fn queue(&self, family_index: u32, mode: QueueMode) -> SoftwareQueue {
        SoftwareQueue {
            family_index,
            mode,
            kernels: Arc::clone(&self.kernels),
            pending: Mutex::new(VecDeque::new()),
            submissions: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalDevice for SoftwareDevice {
    type CommandBuffer = SoftwareCommandBuffer;
    type Queue = SoftwareQueue;

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_buffer(&self, params: BufferCreationParams) -> Result<Arc<Buffer>> {
        let memory = Arc::new(DeviceMemory::new(params.size, params.memory)?);
        let buffer = Buffer::new(params, memory, 0)?;
        prism_trace!(
            LogCategory::Backend,
            "created buffer {} ({} bytes)",
            buffer.id(),
            buffer.size()
        );
        Ok(Arc::new(buffer))
    }

    fn create_command_buffer(&self, queue_family_index: u32) -> Result<SoftwareCommandBuffer> {
        Ok(SoftwareCommandBuffer::new(queue_family_index))
    }

    fn update_descriptor_sets_impl(&self, _writes: &[WriteDescriptorSet<'_>]) -> Result<()> {
        self.stats.descriptor_updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush_mapped_memory_ranges(&self, ranges: &[MappedMemoryRange]) -> Result<()> {
        for range in ranges {
            if !range.memory.is_host_visible() {
                bail!("memory {} is not host visible", range.memory.id());
            }
            if range
                .offset
                .checked_add(range.size)
                .map_or(true, |end| end > range.memory.size())
            {
                bail!(
                    "flush range {}+{} exceeds memory {}",
                    range.offset,
                    range.size,
                    range.memory.id()
                );
            }
            self.stats.flushed_ranges.fetch_add(1, Ordering::Relaxed);
            self.stats
                .flushed_bytes
                .fetch_add(range.size, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SoftwareCommandBuffer {
    queue_family_index: u32,
    usage: CommandBufferUsage,
    state: Arc<Mutex<CommandBufferState>>,
    commands: Vec<RecordedCommand>,
}

impl SoftwareCommandBuffer {
    pub fn new(queue_family_index: u32) -> Self {
        Self {
            queue_family_index,
            usage: CommandBufferUsage::empty(),
            state: Arc::new(Mutex::new(CommandBufferState::Initial)),
            commands: Vec::new(),
        }
    }

    /// Commands recorded since the last `begin` or `reset`
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    fn record(&mut self, name: &str, command: RecordedCommand) -> Result<()> {
        check_recording(self.state(), name)?;
        self.commands.push(command);
        Ok(())
    }
}

impl CommandBuffer for SoftwareCommandBuffer {
    fn state(&self) -> CommandBufferState {
        *self.state.lock()
    }

    fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    fn begin(&mut self, usage: CommandBufferUsage) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(
            *state,
            CommandBufferState::Recording | CommandBufferState::Pending
        ) {
            bail!("begin called on a command buffer that is {:?}", *state);
        }
        *state = CommandBufferState::Recording;
        drop(state);
        self.usage = usage;
        self.commands.clear();
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        check_recording(*state, "end")?;
        *state = CommandBufferState::Executable;
        Ok(())
    }

    fn reset(&mut self, _flags: CommandBufferResetFlags) -> Result<()> {
        let mut state = self.state.lock();
        if *state == CommandBufferState::Pending {
            bail!("cannot reset a pending command buffer");
        }
        *state = CommandBufferState::Initial;
        drop(state);
        self.commands.clear();
        Ok(())
    }

    fn mark_pending(&mut self) {
        *self.state.lock() = CommandBufferState::Pending;
    }

    fn update_buffer(&mut self, buffer: &Arc<Buffer>, offset: u64, data: &[u8]) -> Result<()> {
        check_update_buffer(buffer, offset, data)?;
        self.record(
            "update_buffer",
            RecordedCommand::UpdateBuffer {
                buffer: Arc::clone(buffer),
                offset,
                data: data.to_vec(),
            },
        )
    }

    fn pipeline_barrier(
        &mut self,
        src_stages: PipelineStageFlags,
        dst_stages: PipelineStageFlags,
        buffer_barriers: &[BufferMemoryBarrier],
    ) -> Result<()> {
        self.record(
            "pipeline_barrier",
            RecordedCommand::PipelineBarrier {
                src_stages,
                dst_stages,
                buffer_barriers: buffer_barriers.to_vec(),
            },
        )
    }

    fn bind_compute_pipeline(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        if pipeline.as_compute().is_none() {
            bail!("pipeline {} is not a compute pipeline", pipeline.id());
        }
        self.record(
            "bind_compute_pipeline",
            RecordedCommand::BindComputePipeline(Arc::clone(pipeline)),
        )
    }

    fn bind_descriptor_sets(
        &mut self,
        bind_point: PipelineBindPoint,
        layout: &Arc<PipelineLayout>,
        first_set: u32,
        sets: &[Arc<DescriptorSet>],
    ) -> Result<()> {
        check_bind_descriptor_sets(layout, first_set, sets)?;
        self.record(
            "bind_descriptor_sets",
            RecordedCommand::BindDescriptorSets {
                bind_point,
                layout: Arc::clone(layout),
                first_set,
                sets: sets.to_vec(),
            },
        )
    }

    fn push_constants(
        &mut self,
        layout: &Arc<PipelineLayout>,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        check_push_constants(layout, stages, offset, data)?;
        self.record(
            "push_constants",
            RecordedCommand::PushConstants {
                stages,
                offset,
                data: data.to_vec(),
            },
        )
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        if x == 0 || y == 0 || z == 0 {
            bail!("dispatch of {}x{}x{} workgroups is empty", x, y, z);
        }
        self.record("dispatch", RecordedCommand::Dispatch { x, y, z })
    }
}

/// When a [`SoftwareQueue`] executes submitted work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Inside `submit`
    Immediate,
    /// On `complete_pending`, so callers can observe in-flight state
    Deferred,
}

struct Submission {
    commands: Vec<RecordedCommand>,
    completions: Vec<(Arc<Mutex<CommandBufferState>>, bool)>,
    fence: Option<Arc<Fence>>,
}

pub struct SoftwareQueue {
    family_index: u32,
    mode: QueueMode,
    kernels: KernelRegistry,
    pending: Mutex<VecDeque<Submission>>,
    submissions: AtomicU64,
    dispatches: AtomicU64,
}

impl SoftwareQueue {
    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Submissions accepted so far
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Dispatches executed so far
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    /// Execute every deferred submission in order
    pub fn complete_pending(&self) -> Result<usize> {
        let drained: Vec<Submission> = self.pending.lock().drain(..).collect();
        let count = drained.len();
        let mut first_error = None;
        for submission in drained {
            if let Err(err) = self.execute(submission) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    /// Replay a submission, then retire it even if a command failed
    fn execute(&self, submission: Submission) -> Result<()> {
        let result = self.replay(&submission.commands);
        let failed = result.is_err();

        for (state, one_time) in &submission.completions {
            *state.lock() = if failed || *one_time {
                CommandBufferState::Invalid
            } else {
                CommandBufferState::Executable
            };
        }
        if let Some(fence) = &submission.fence {
            fence.signal();
        }
        if let Err(err) = &result {
            prism_error!(LogCategory::Backend, "software submission failed: {}", err);
        }
        result
    }

    #[instrument(skip_all, fields(commands = commands.len()))]
    fn replay(&self, commands: &[RecordedCommand]) -> Result<()> {
        let mut pipeline: Option<Arc<Pipeline>> = None;
        let mut sets: Vec<Option<Arc<DescriptorSet>>> = Vec::new();
        let mut push_constants: Vec<u8> = Vec::new();

        for command in commands {
            match command {
                RecordedCommand::UpdateBuffer {
                    buffer,
                    offset,
                    data,
                } => buffer.write(*offset, data)?,
                RecordedCommand::PipelineBarrier { .. } => {}
                RecordedCommand::BindComputePipeline(bound) => pipeline = Some(Arc::clone(bound)),
                RecordedCommand::BindDescriptorSets {
                    first_set,
                    sets: bound,
                    ..
                } => {
                    let needed = *first_set as usize + bound.len();
                    if sets.len() < needed {
                        sets.resize(needed, None);
                    }
                    for (i, set) in bound.iter().enumerate() {
                        sets[*first_set as usize + i] = Some(Arc::clone(set));
                    }
                }
                RecordedCommand::PushConstants { offset, data, .. } => {
                    let start = *offset as usize;
                    if push_constants.len() < start + data.len() {
                        push_constants.resize(start + data.len(), 0);
                    }
                    push_constants[start..start + data.len()].copy_from_slice(data);
                }
                RecordedCommand::Dispatch { x, y, z } => {
                    let compute = pipeline
                        .as_deref()
                        .and_then(Pipeline::as_compute)
                        .context("dispatch without a bound compute pipeline")?;
                    let kernel = self
                        .kernels
                        .read()
                        .get(&compute.shader.label)
                        .cloned()
                        .with_context(|| {
                            format!("no software kernel registered for {}", compute.shader.label)
                        })?;
                    kernel(&DispatchContext {
                        sets: &sets,
                        push_constants: &push_constants,
                        group_count: [*x, *y, *z],
                    })?;
                    self.dispatches.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

impl Queue for SoftwareQueue {
    type CommandBuffer = SoftwareCommandBuffer;

    fn family_index(&self) -> u32 {
        self.family_index
    }

    fn submit_impl(
        &self,
        submits: &mut [SubmitInfo<'_, SoftwareCommandBuffer>],
        fence: Option<&Arc<Fence>>,
    ) -> Result<()> {
        let mut submission = Submission {
            commands: Vec::new(),
            completions: Vec::new(),
            fence: fence.cloned(),
        };
        for submit in submits.iter() {
            if !submit.wait_semaphores.is_empty() || !submit.signal_semaphores.is_empty() {
                prism_trace!(
                    LogCategory::Backend,
                    "software queue orders submissions, {} wait and {} signal semaphores \
                     are implicit",
                    submit.wait_semaphores.len(),
                    submit.signal_semaphores.len()
                );
            }
            for cb in &submit.command_buffers {
                submission.commands.extend(cb.commands.iter().cloned());
                submission.completions.push((
                    Arc::clone(&cb.state),
                    cb.usage.contains(CommandBufferUsage::ONE_TIME_SUBMIT),
                ));
            }
        }
        self.submissions.fetch_add(1, Ordering::Relaxed);

        match self.mode {
            QueueMode::Immediate => self.execute(submission),
            QueueMode::Deferred => {
                prism_debug!(
                    LogCategory::Backend,
                    "deferring submission of {} commands",
                    submission.commands.len()
                );
                self.pending.lock().push_back(submission);
                Ok(())
            }
        }
    }
}
