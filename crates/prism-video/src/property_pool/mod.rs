//! Batched property-pool transfers
//!
//! A property pool stores each property as one array in GPU memory. The
//! [`PropertyPoolHandler`] moves element ranges between such arrays and other
//! buffers with a single compute kernel, packing up to
//! `max_properties_per_transfer_dispatch()` properties into one dispatch, and
//! streams host data in through a [`StreamingTransientDataBuffer`].
//!
//! [`StreamingTransientDataBuffer`]: crate::streaming::StreamingTransientDataBuffer

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::buffer::BufferBinding;

mod handler;
mod histogram;
mod upstream;

pub use handler::PropertyPoolHandler;

/// Hard cap on properties serviced by one dispatch
pub const MAX_PROPERTIES_PER_DISPATCH: u32 = 128;

/// Descriptor sets cycled by a handler unless configured otherwise
pub const DEFAULT_DESCRIPTOR_CACHE_SIZE: u32 = 32;

/// Index-list offset meaning "address elements directly"
pub const INVALID_INDEX_OFFSET: u32 = u32::MAX;

/// Label of the builtin copy kernel; the software backend dispatches on it
pub const PROPERTY_POOL_COPY_SHADER: &str = "property_pool_copy";

/// Local workgroup size of the copy kernel
pub const COPY_WORKGROUP_SIZE: u32 = 256;

/// Size in bytes of one transfer-table entry
pub const TRANSFER_DESCRIPTOR_SIZE: u64 = std::mem::size_of::<TransferDescriptor>() as u64;

pub(crate) const COPY_SHADER_SOURCE: &str = include_str!("../../shaders/property_pool_copy.wgsl");

bitflags! {
    /// Per-request behaviour bits packed into the top of the dword-size field
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransferFlags: u32 {
        /// Replicate the first source element over the whole range
        const FILL = 1 << 0;
        /// Read from the pool, write to the request's buffer
        const DOWNLOAD = 1 << 1;
        /// Source binding holds only the `[base_dword, end_dword)` window
        const STAGED_SOURCE = 1 << 2;
    }
}

impl TransferFlags {
    pub const BIT_COUNT: u32 = 3;

    /// Bits left for the element dword size
    pub const DWORD_SIZE_MASK: u32 = (1 << (32 - Self::BIT_COUNT)) - 1;
}

/// One entry of the device-visible transfer table
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TransferDescriptor {
    pub property_dword_size_flags: u32,
    pub element_count: u32,
    pub src_index_offset: u32,
    pub dst_index_offset: u32,
}

impl TransferDescriptor {
    pub fn new(
        element_dwords: u32,
        flags: TransferFlags,
        element_count: u32,
        src_index_offset: u32,
        dst_index_offset: u32,
    ) -> Self {
        Self {
            property_dword_size_flags: (element_dwords & TransferFlags::DWORD_SIZE_MASK)
                | (flags.bits() << (32 - TransferFlags::BIT_COUNT)),
            element_count,
            src_index_offset,
            dst_index_offset,
        }
    }

    pub fn element_dwords(&self) -> u32 {
        self.property_dword_size_flags & TransferFlags::DWORD_SIZE_MASK
    }

    pub fn flags(&self) -> TransferFlags {
        TransferFlags::from_bits_truncate(
            self.property_dword_size_flags >> (32 - TransferFlags::BIT_COUNT),
        )
    }

    /// Dwords covered by the whole property range
    pub fn total_dwords(&self) -> u64 {
        u64::from(self.element_dwords()) * u64::from(self.element_count)
    }
}

/// Move `element_count` elements between a pool array and another buffer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// The property pool side of the transfer
    pub memblock: BufferBinding,
    /// Source for uploads, destination for downloads
    pub buffer: BufferBinding,
    pub element_size: u32,
    pub element_count: u32,
    pub src_addresses_offset: u32,
    pub dst_addresses_offset: u32,
    pub flags: TransferFlags,
}

impl TransferRequest {
    /// Copy `element_count` elements from `source` into the pool array `memblock`
    pub fn upload(
        memblock: BufferBinding,
        source: BufferBinding,
        element_size: u32,
        element_count: u32,
    ) -> Self {
        Self {
            memblock,
            buffer: source,
            element_size,
            element_count,
            src_addresses_offset: INVALID_INDEX_OFFSET,
            dst_addresses_offset: INVALID_INDEX_OFFSET,
            flags: TransferFlags::empty(),
        }
    }

    /// Replicate the single element at `source` over `element_count` pool elements
    pub fn fill(
        memblock: BufferBinding,
        source: BufferBinding,
        element_size: u32,
        element_count: u32,
    ) -> Self {
        Self {
            flags: TransferFlags::FILL,
            ..Self::upload(memblock, source, element_size, element_count)
        }
    }

    /// Copy pool elements out into `destination`
    pub fn download(
        memblock: BufferBinding,
        destination: BufferBinding,
        element_size: u32,
        element_count: u32,
    ) -> Self {
        Self {
            flags: TransferFlags::DOWNLOAD,
            ..Self::upload(memblock, destination, element_size, element_count)
        }
    }

    pub fn with_addresses(mut self, src_offset: u32, dst_offset: u32) -> Self {
        self.src_addresses_offset = src_offset;
        self.dst_addresses_offset = dst_offset;
        self
    }

    pub fn is_download(&self) -> bool {
        self.flags.contains(TransferFlags::DOWNLOAD)
    }

    pub fn is_fill(&self) -> bool {
        self.flags.contains(TransferFlags::FILL)
    }

    /// Dwords moved when the whole request completes
    pub fn total_dwords(&self) -> u64 {
        u64::from(self.element_size / 4) * u64::from(self.element_count)
    }

    pub fn total_bytes(&self) -> u64 {
        u64::from(self.element_size) * u64::from(self.element_count)
    }

    /// Bytes the source binding must expose
    pub fn source_bytes(&self) -> u64 {
        if self.is_fill() {
            u64::from(self.element_size)
        } else {
            self.total_bytes()
        }
    }

    pub fn descriptor(&self) -> TransferDescriptor {
        TransferDescriptor::new(
            self.element_size / 4,
            self.flags,
            self.element_count,
            self.src_addresses_offset,
            self.dst_addresses_offset,
        )
    }
}

/// Where an upstreamed property's data comes from
#[derive(Debug, Clone)]
pub enum UpStreamingSource<'a> {
    /// Host bytes, staged through the streaming buffer
    Host(&'a [u8]),
    /// Already resident on the device
    Device(BufferBinding),
}

/// Fill or overwrite a pool array, possibly from host memory
#[derive(Debug, Clone)]
pub struct UpStreamingRequest<'a> {
    pub destination: BufferBinding,
    pub element_size: u32,
    pub element_count: u32,
    pub source: UpStreamingSource<'a>,
    /// Gather indices; carried for callers but not applied when streaming
    pub src_addresses: Option<&'a [u32]>,
    /// Scatter indices; carried for callers but not applied when streaming
    pub dst_addresses: Option<&'a [u32]>,
    pub fill: bool,
}

impl<'a> UpStreamingRequest<'a> {
    pub fn from_host(
        destination: BufferBinding,
        data: &'a [u8],
        element_size: u32,
        element_count: u32,
    ) -> Self {
        Self {
            destination,
            element_size,
            element_count,
            source: UpStreamingSource::Host(data),
            src_addresses: None,
            dst_addresses: None,
            fill: false,
        }
    }

    pub fn from_device(
        destination: BufferBinding,
        source: BufferBinding,
        element_size: u32,
        element_count: u32,
    ) -> Self {
        Self {
            source: UpStreamingSource::Device(source),
            ..Self::from_host(destination, &[], element_size, element_count)
        }
    }

    pub fn filled(mut self) -> Self {
        self.fill = true;
        self
    }

    pub fn is_host(&self) -> bool {
        matches!(self.source, UpStreamingSource::Host(_))
    }

    /// Dwords of the destination range, saturated to `u32`
    pub fn element_dwords(&self) -> u32 {
        let dwords = u64::from(self.element_size / 4) * u64::from(self.element_count);
        u32::try_from(dwords).unwrap_or(u32::MAX)
    }

    /// Bytes the source must provide
    pub fn source_bytes(&self) -> u64 {
        if self.fill {
            u64::from(self.element_size)
        } else {
            u64::from(self.element_size) * u64::from(self.element_count)
        }
    }

    /// Staging bytes per transferred dword when streaming from the host
    pub(crate) fn staged_bytes_per_dword(&self) -> u64 {
        if self.is_host() && !self.fill {
            4
        } else {
            0
        }
    }

    /// Staging bytes needed regardless of how many dwords move
    pub(crate) fn staged_fixed_bytes(&self) -> u64 {
        if self.is_host() && self.fill {
            u64::from(self.element_size)
        } else {
            0
        }
    }

    pub(crate) fn validate(&self) -> Result<(), TransferError> {
        if self.element_size % 4 != 0 {
            return Err(TransferError::MisalignedElementSize {
                element_size: self.element_size,
            });
        }
        if self.element_size / 4 > TransferFlags::DWORD_SIZE_MASK {
            return Err(TransferError::ElementSizeTooLarge {
                element_size: self.element_size,
            });
        }
        if let UpStreamingSource::Host(data) = self.source {
            if (data.len() as u64) < self.source_bytes() {
                return Err(TransferError::SourceTooSmall {
                    required: self.source_bytes(),
                    available: data.len() as u64,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("scratch buffer does not support sub-range updates")]
    InvalidScratchBuffer,

    #[error("scratch buffer has {available} bytes, pass needs {required}")]
    ScratchTooSmall { required: u64, available: u64 },

    #[error("element size {element_size} is not a multiple of 4")]
    MisalignedElementSize { element_size: u32 },

    #[error("source provides {available} bytes, request needs {required}")]
    SourceTooSmall { required: u64, available: u64 },

    #[error("element size {element_size} exceeds the descriptor dword field")]
    ElementSizeTooLarge { element_size: u32 },

    #[error("dword window [{base_dword}, {end_dword}) is empty for this pass")]
    NothingToTransfer { base_dword: u32, end_dword: u32 },

    #[error("every cached descriptor set is in flight")]
    DescriptorSetExhausted,

    #[error("descriptor update failed: {0}")]
    DescriptorUpdate(String),

    #[error("recording failed: {0}")]
    Recording(String),

    #[error("{failed} of {passes} transfer passes failed")]
    PassesFailed { failed: u32, passes: u32 },
}
