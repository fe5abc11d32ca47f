//! Command buffer recording interface

use std::sync::Arc;

use anyhow::{bail, Result};
use bitflags::bitflags;
use wgpu::ShaderStages;

use crate::buffer::Buffer;
use crate::descriptor::DescriptorSet;
use crate::pipeline::{Pipeline, PipelineLayout};

/// Largest inline payload `update_buffer` accepts
pub const MAX_UPDATE_BUFFER_SIZE: usize = 65536;

/// Queue family sentinel for barriers that do not transfer ownership
pub const QUEUE_FAMILY_IGNORED: u32 = u32::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const SHADER_READ = 1 << 0;
        const SHADER_WRITE = 1 << 1;
        const TRANSFER_READ = 1 << 2;
        const TRANSFER_WRITE = 1 << 3;
        const HOST_READ = 1 << 4;
        const HOST_WRITE = 1 << 5;
        const UNIFORM_READ = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStageFlags: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const VERTEX_SHADER = 1 << 1;
        const FRAGMENT_SHADER = 1 << 2;
        const COMPUTE_SHADER = 1 << 3;
        const TRANSFER = 1 << 4;
        const HOST = 1 << 5;
        const BOTTOM_OF_PIPE = 1 << 6;
        const ALL_COMMANDS = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandBufferUsage: u32 {
        const ONE_TIME_SUBMIT = 1 << 0;
        const SIMULTANEOUS_USE = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandBufferResetFlags: u32 {
        const RELEASE_RESOURCES = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

#[derive(Debug, Clone)]
pub struct BufferMemoryBarrier {
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub buffer: Arc<Buffer>,
    pub offset: u64,
    pub size: u64,
}

impl BufferMemoryBarrier {
    /// A same-queue barrier over `[offset, offset+size)`
    pub fn new(
        buffer: Arc<Buffer>,
        offset: u64,
        size: u64,
        src_access: AccessFlags,
        dst_access: AccessFlags,
    ) -> Self {
        Self {
            src_access,
            dst_access,
            src_queue_family_index: QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: QUEUE_FAMILY_IGNORED,
            buffer,
            offset,
            size,
        }
    }
}

/// A recorder of GPU commands
///
/// Recording methods are only valid in the `Recording` state. Backends share
/// the argument checks below so every implementation rejects the same misuse.
pub trait CommandBuffer: Send {
    fn state(&self) -> CommandBufferState;

    fn queue_family_index(&self) -> u32;

    fn begin(&mut self, usage: CommandBufferUsage) -> Result<()>;

    fn end(&mut self) -> Result<()>;

    fn reset(&mut self, flags: CommandBufferResetFlags) -> Result<()>;

    /// Transition to `Pending`; called by `Queue::submit`
    fn mark_pending(&mut self);

    fn update_buffer(&mut self, buffer: &Arc<Buffer>, offset: u64, data: &[u8]) -> Result<()>;

    fn pipeline_barrier(
        &mut self,
        src_stages: PipelineStageFlags,
        dst_stages: PipelineStageFlags,
        buffer_barriers: &[BufferMemoryBarrier],
    ) -> Result<()>;

    fn bind_compute_pipeline(&mut self, pipeline: &Arc<Pipeline>) -> Result<()>;

    fn bind_descriptor_sets(
        &mut self,
        bind_point: PipelineBindPoint,
        layout: &Arc<PipelineLayout>,
        first_set: u32,
        sets: &[Arc<DescriptorSet>],
    ) -> Result<()>;

    fn push_constants(
        &mut self,
        layout: &Arc<PipelineLayout>,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) -> Result<()>;

    fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32)
        -> Result<()>;

    fn is_recording(&self) -> bool {
        self.state() == CommandBufferState::Recording
    }
}

pub fn check_recording(state: CommandBufferState, command: &str) -> Result<()> {
    if state != CommandBufferState::Recording {
        bail!("{} recorded while command buffer is {:?}", command, state);
    }
    Ok(())
}

pub fn check_update_buffer(buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
    if !buffer.can_update_sub_range() {
        bail!("buffer {} was not created for sub-range updates", buffer.id());
    }
    if data.is_empty() || data.len() > MAX_UPDATE_BUFFER_SIZE {
        bail!(
            "update_buffer payload of {} bytes must be within 1..={}",
            data.len(),
            MAX_UPDATE_BUFFER_SIZE
        );
    }
    if offset % 4 != 0 || data.len() % 4 != 0 {
        bail!("update_buffer offset and size must be multiples of 4");
    }
    if offset
        .checked_add(data.len() as u64)
        .map_or(true, |end| end > buffer.size())
    {
        bail!(
            "update_buffer range {}+{} exceeds buffer of {} bytes",
            offset,
            data.len(),
            buffer.size()
        );
    }
    Ok(())
}

pub fn check_push_constants(
    layout: &PipelineLayout,
    stages: ShaderStages,
    offset: u32,
    data: &[u8],
) -> Result<()> {
    let Ok(size) = u32::try_from(data.len()) else {
        bail!("push constant payload too large");
    };
    if offset % 4 != 0 || size % 4 != 0 {
        bail!("push constant offset and size must be multiples of 4");
    }
    if !layout.covers_push_constants(stages, offset, size) {
        bail!(
            "push constants {}+{} for {:?} are outside the layout's ranges",
            offset,
            size,
            stages
        );
    }
    Ok(())
}

pub fn check_bind_descriptor_sets(
    layout: &PipelineLayout,
    first_set: u32,
    sets: &[Arc<DescriptorSet>],
) -> Result<()> {
    for (i, set) in sets.iter().enumerate() {
        let index = first_set + i as u32;
        match layout.set_layout(index) {
            Some(expected) if Arc::ptr_eq(expected, set.layout()) => {}
            Some(_) => bail!("descriptor set {} does not match layout slot {}", set.id(), index),
            None => bail!("pipeline layout has no descriptor set {}", index),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferCreationParams, DeviceMemory};
    use crate::pipeline::PushConstantRange;

    fn buffer(params: BufferCreationParams) -> Buffer {
        let memory = Arc::new(DeviceMemory::new(params.size, params.memory).unwrap());
        Buffer::new(params, memory, 0).unwrap()
    }

    #[test]
    fn test_update_buffer_checks() {
        let updatable = buffer(BufferCreationParams::device_local(128));
        assert!(check_update_buffer(&updatable, 0, &[0; 16]).is_ok());
        assert!(check_update_buffer(&updatable, 2, &[0; 16]).is_err());
        assert!(check_update_buffer(&updatable, 0, &[0; 6]).is_err());
        assert!(check_update_buffer(&updatable, 120, &[0; 16]).is_err());
        assert!(check_update_buffer(&updatable, 0, &[]).is_err());

        let fixed = buffer(BufferCreationParams::device_local(128).with_sub_range_updates(false));
        assert!(check_update_buffer(&fixed, 0, &[0; 16]).is_err());
    }

    #[test]
    fn test_push_constant_checks() {
        let layout = PipelineLayout::new(
            &[PushConstantRange {
                stages: ShaderStages::COMPUTE,
                offset: 0,
                size: 8,
            }],
            vec![],
        )
        .unwrap();

        assert!(check_push_constants(&layout, ShaderStages::COMPUTE, 0, &[0; 8]).is_ok());
        assert!(check_push_constants(&layout, ShaderStages::COMPUTE, 0, &[0; 12]).is_err());
        assert!(check_push_constants(&layout, ShaderStages::COMPUTE, 0, &[0; 3]).is_err());
    }

    #[test]
    fn test_recording_state_check() {
        assert!(check_recording(CommandBufferState::Recording, "dispatch").is_ok());
        assert!(check_recording(CommandBufferState::Executable, "dispatch").is_err());
    }
}
