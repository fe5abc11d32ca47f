//! Prism - an explicit GPU abstraction layer
//!
//! Prism exposes a Vulkan-style object model and, on top of it, the utilities
//! needed to keep large property pools fed: address allocators, a fence-aware
//! streaming buffer, a descriptor set ring and a batched transfer scheduler.

pub use prism_core;
pub use prism_video;

pub use prism_core::{init_with, PrismConfig, PrismError};

/// Unified prelude module that exports all commonly used types
pub mod prelude {
    pub use prism_core::{LogCategory, PrismConfig, TransferConfig};
    pub use prism_video::{
        BufferBinding, BufferCreationParams, CommandBuffer, CommandBufferUsage, Fence,
        LogicalDevice, PropertyPoolHandler, Queue, StreamingTransientDataBuffer, SubmitInfo,
        TransferError, TransferRequest, UpStreamingRequest, WaitSemaphores,
    };
}

/// Initialize logging and configuration with defaults
pub fn init() -> prism_core::Result<()> {
    prism_core::init()?;
    Ok(())
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init() {
        assert!(init().is_ok());
        // a second call keeps the first configuration
        assert!(init().is_ok());
    }
}
