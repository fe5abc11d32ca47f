//! Prism video HAL
//!
//! An explicit, Vulkan-style object model (buffers, fences, descriptor sets,
//! pipelines, command buffers, queues) plus the utilities built on it: address
//! allocators, a fence-aware streaming staging buffer, a descriptor-set ring
//! cache and the property pool transfer scheduler.

use std::sync::atomic::{AtomicU64, Ordering};

pub mod alloc;
pub mod backend;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod descriptor_cache;
pub mod device;
pub mod limits;
pub mod pipeline;
pub mod property_pool;
pub mod queue;
pub mod streaming;
pub mod sync;

pub use alloc::{
    AddressAllocator, GeneralPurposeAddressAllocator, LinearAddressAllocator, INVALID_ADDRESS,
};
pub use backend::software::{
    QueueMode, RecordedCommand, SoftwareCommandBuffer, SoftwareDevice, SoftwareQueue,
};
pub use buffer::{
    Buffer, BufferBinding, BufferCreationParams, DeviceMemory, MappedMemoryRange, MemoryProperties,
};
pub use command::{
    AccessFlags, BufferMemoryBarrier, CommandBuffer, CommandBufferResetFlags, CommandBufferState,
    CommandBufferUsage, PipelineBindPoint, PipelineStageFlags,
};
pub use descriptor::{
    DescriptorInfo, DescriptorPool, DescriptorPoolCreateFlags, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBinding, DescriptorType, WriteDescriptorSet,
};
pub use descriptor_cache::{DescriptorSetCache, SlotState};
pub use device::LogicalDevice;
pub use limits::DeviceLimits;
pub use pipeline::{
    ComputePipeline, ComputePipelineCreationParams, GraphicsPipeline,
    GraphicsPipelineCreationParams, Pipeline, PipelineCommon, PipelineCreateFlags, PipelineLayout,
    PushConstantRange, SpecializedShader,
};
pub use property_pool::{
    PropertyPoolHandler, TransferDescriptor, TransferError, TransferFlags, TransferRequest,
    UpStreamingRequest, UpStreamingSource,
};
pub use queue::{Queue, SubmitInfo, WaitSemaphore, WaitSemaphores};
pub use streaming::StreamingTransientDataBuffer;
pub use sync::{Fence, FenceStatus, Semaphore};

/// Identifier shared by every HAL object, unique for the process lifetime
pub type ObjectId = u64;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_object_id() -> ObjectId {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Round `value` up to a multiple of `alignment` (a power of two or any non-zero value)
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Round `value` down to a multiple of `alignment`
#[inline]
pub fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value - value % alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(17, 12), 24);
        assert_eq!(align_down(1023, 256), 768);
        assert_eq!(align_down(5, 1), 5);
    }

    #[test]
    fn test_object_ids_are_unique() {
        let a = next_object_id();
        let b = next_object_id();
        assert_ne!(a, b);
    }
}
