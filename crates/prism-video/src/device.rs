//! Logical device interface
//!
//! Object creation that needs no backend state is provided here on top of the
//! concrete HAL objects, including the validation every backend must apply.
//! Backends supply memory, command buffers and the hooks that touch hardware.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use prism_core::{logging::LogCategory, prism_debug};
use tracing::instrument;

use crate::buffer::{Buffer, BufferCreationParams, MappedMemoryRange};
use crate::command::CommandBuffer;
use crate::descriptor::{
    DescriptorPool, DescriptorPoolCreateFlags, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBinding, DescriptorType, WriteDescriptorSet,
};
use crate::limits::DeviceLimits;
use crate::pipeline::{
    ComputePipelineCreationParams, GraphicsPipelineCreationParams, Pipeline, PipelineLayout,
    PushConstantRange,
};
use crate::queue::Queue;
use crate::sync::{Fence, FenceStatus, Semaphore};

pub trait LogicalDevice: Send + Sync + 'static {
    type CommandBuffer: CommandBuffer;
    type Queue: Queue<CommandBuffer = Self::CommandBuffer>;

    fn limits(&self) -> &DeviceLimits;

    fn create_buffer(&self, params: BufferCreationParams) -> Result<Arc<Buffer>>;

    fn create_command_buffer(&self, queue_family_index: u32) -> Result<Self::CommandBuffer>;

    /// Backend hook run after every write of an update passed validation
    fn update_descriptor_sets_impl(&self, writes: &[WriteDescriptorSet<'_>]) -> Result<()>;

    fn flush_mapped_memory_ranges(&self, ranges: &[MappedMemoryRange]) -> Result<()>;

    fn create_fence(&self, signaled: bool) -> Arc<Fence> {
        Arc::new(Fence::new(signaled))
    }

    fn create_semaphore(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<Arc<DescriptorSetLayout>> {
        let limits = self.limits();
        let mut dynamic_storage = 0u32;
        let mut dynamic_uniform = 0u32;
        for binding in bindings {
            match binding.ty {
                DescriptorType::StorageBufferDynamic => dynamic_storage += binding.count,
                DescriptorType::UniformBufferDynamic => dynamic_uniform += binding.count,
                _ => {}
            }
        }
        if dynamic_storage > limits.max_dynamic_storage_buffers {
            bail!(
                "layout uses {} dynamic storage buffers, device allows {}",
                dynamic_storage,
                limits.max_dynamic_storage_buffers
            );
        }
        if dynamic_uniform > limits.max_dynamic_uniform_buffers {
            bail!(
                "layout uses {} dynamic uniform buffers, device allows {}",
                dynamic_uniform,
                limits.max_dynamic_uniform_buffers
            );
        }
        Ok(Arc::new(DescriptorSetLayout::new(bindings)?))
    }

    fn create_descriptor_pool(
        &self,
        flags: DescriptorPoolCreateFlags,
        max_sets: u32,
    ) -> Arc<DescriptorPool> {
        Arc::new(DescriptorPool::new(flags, max_sets))
    }

    fn create_descriptor_sets(
        &self,
        pool: &Arc<DescriptorPool>,
        layout: &Arc<DescriptorSetLayout>,
        count: u32,
    ) -> Result<Vec<Arc<DescriptorSet>>> {
        if !pool.try_reserve(count) {
            bail!(
                "descriptor pool {} cannot hold {} more sets ({} of {} in use)",
                pool.id(),
                count,
                pool.allocated_sets(),
                pool.max_sets()
            );
        }
        Ok((0..count)
            .map(|_| Arc::new(DescriptorSet::new(Arc::clone(layout), Arc::clone(pool))))
            .collect())
    }

    /// Validate every write, apply them, then notify the backend
    #[instrument(skip_all, fields(writes = writes.len()))]
    fn update_descriptor_sets(&self, writes: &[WriteDescriptorSet<'_>]) -> Result<()> {
        for write in writes {
            write.dst_set.validate_write(write)?;
        }
        for write in writes {
            write.dst_set.process_write(write)?;
        }
        self.update_descriptor_sets_impl(writes)
    }

    fn free_descriptor_sets(
        &self,
        pool: &Arc<DescriptorPool>,
        sets: Vec<Arc<DescriptorSet>>,
    ) -> Result<()> {
        if !pool.allows_freeing_descriptor_sets() {
            bail!(
                "descriptor pool {} was not created with FREE_DESCRIPTOR_SET",
                pool.id()
            );
        }
        if let Some(foreign) = sets.iter().find(|s| !Arc::ptr_eq(s.pool(), pool)) {
            bail!(
                "descriptor set {} was not allocated from pool {}",
                foreign.id(),
                pool.id()
            );
        }
        pool.release(sets.len() as u32);
        Ok(())
    }

    fn create_pipeline_layout(
        &self,
        push_constant_ranges: &[PushConstantRange],
        set_layouts: Vec<Option<Arc<DescriptorSetLayout>>>,
    ) -> Result<Arc<PipelineLayout>> {
        let max = self.limits().max_push_constant_size;
        if let Some(range) = push_constant_ranges
            .iter()
            .find(|r| u64::from(r.offset) + u64::from(r.size) > u64::from(max))
        {
            bail!(
                "push constant range {}+{} exceeds device limit of {} bytes",
                range.offset,
                range.size,
                max
            );
        }
        Ok(Arc::new(PipelineLayout::new(push_constant_ranges, set_layouts)?))
    }

    fn create_compute_pipeline(
        &self,
        params: ComputePipelineCreationParams,
    ) -> Result<Arc<Pipeline>> {
        Ok(Arc::new(Pipeline::compute(params)?))
    }

    fn create_graphics_pipeline(
        &self,
        params: GraphicsPipelineCreationParams,
    ) -> Result<Arc<Pipeline>> {
        Ok(Arc::new(Pipeline::graphics(params)?))
    }

    /// Wait until every fence signals or `timeout` elapses
    fn block_for_fences(&self, fences: &[Arc<Fence>], timeout: Duration) -> FenceStatus {
        let deadline = Instant::now().checked_add(timeout);
        for fence in fences {
            let status = match deadline {
                Some(deadline) => fence.wait_until(deadline),
                None => fence.wait(timeout),
            };
            if status != FenceStatus::Success {
                prism_debug!(
                    LogCategory::Device,
                    "fence {} not signaled within {:?}",
                    fence.id(),
                    timeout
                );
                return status;
            }
        }
        FenceStatus::Success
    }

    /// Wait until every fence signals, without a time limit
    fn wait_for_fences(&self, fences: &[Arc<Fence>]) {
        for fence in fences {
            fence.wait(Duration::MAX);
        }
    }

    fn reset_fences(&self, fences: &[Arc<Fence>]) {
        for fence in fences {
            fence.reset();
        }
    }
}
