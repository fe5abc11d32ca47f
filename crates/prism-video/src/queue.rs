//! Queue submission

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::command::{CommandBuffer, CommandBufferState, PipelineStageFlags};
use crate::sync::{Fence, Semaphore};

/// A semaphore to wait on before the submission starts, with the stages that wait
#[derive(Debug, Clone)]
pub struct WaitSemaphore {
    pub semaphore: Arc<Semaphore>,
    pub stages: PipelineStageFlags,
}

/// The wait list a caller hands to a submitting utility
pub type WaitSemaphores = Vec<WaitSemaphore>;

/// One batch of command buffers executed in order
pub struct SubmitInfo<'a, C: CommandBuffer> {
    pub wait_semaphores: &'a [WaitSemaphore],
    pub command_buffers: Vec<&'a mut C>,
    pub signal_semaphores: &'a [Arc<Semaphore>],
}

impl<'a, C: CommandBuffer> SubmitInfo<'a, C> {
    pub fn new(command_buffers: Vec<&'a mut C>) -> Self {
        Self {
            wait_semaphores: &[],
            command_buffers,
            signal_semaphores: &[],
        }
    }

    /// Every wait carries a stage mask and every command buffer is executable
    pub fn is_valid(&self) -> bool {
        self.wait_semaphores.iter().all(|w| !w.stages.is_empty())
            && self
                .command_buffers
                .iter()
                .all(|cb| cb.state() == CommandBufferState::Executable)
    }
}

pub trait Queue: Send + Sync {
    type CommandBuffer: CommandBuffer;

    fn family_index(&self) -> u32;

    fn priority(&self) -> f32 {
        1.0
    }

    /// Validate, mark command buffers pending and hand off to the backend
    fn submit(
        &self,
        submits: &mut [SubmitInfo<'_, Self::CommandBuffer>],
        fence: Option<&Arc<Fence>>,
    ) -> Result<()> {
        for (i, submit) in submits.iter().enumerate() {
            if !submit.is_valid() {
                bail!("submit {} is invalid: command buffers must be executable", i);
            }
            if let Some(cb) = submit
                .command_buffers
                .iter()
                .find(|cb| cb.queue_family_index() != self.family_index())
            {
                bail!(
                    "command buffer of family {} submitted to queue family {}",
                    cb.queue_family_index(),
                    self.family_index()
                );
            }
        }
        if let Some(fence) = fence {
            if fence.is_signaled() {
                bail!("fence {} must be unsignaled at submission", fence.id());
            }
        }

        for submit in submits.iter_mut() {
            for cb in submit.command_buffers.iter_mut() {
                cb.mark_pending();
            }
        }

        self.submit_impl(submits, fence)
    }

    fn submit_impl(
        &self,
        submits: &mut [SubmitInfo<'_, Self::CommandBuffer>],
        fence: Option<&Arc<Fence>>,
    ) -> Result<()>;
}
