//! Device backends
//!
//! A backend supplies memory, command recording and queue execution behind
//! the `LogicalDevice`, `CommandBuffer` and `Queue` traits. The software
//! backend runs everything on the CPU against host-shadowed memory.

pub mod software;

pub use software::{
    property_pool_copy_kernel, DispatchContext, QueueMode, RecordedCommand,
    SoftwareCommandBuffer, SoftwareDevice, SoftwareKernel, SoftwareQueue,
};
