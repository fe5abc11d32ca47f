//! Buffers and the host-shadowed memory that backs them
//!
//! Every `DeviceMemory` keeps a host copy of its contents. Backends that talk
//! to real hardware mirror it into mapped allocations; the software backend
//! executes directly against it.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use anyhow::{bail, Result};
use bitflags::bitflags;
use parking_lot::RwLock;
use wgpu::BufferUsages;

use crate::{next_object_id, ObjectId};

bitflags! {
    /// Properties of the memory a buffer is bound to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        const DEVICE_LOCAL = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED = 1 << 3;
    }
}

/// Parameters a buffer is created with
#[derive(Debug, Clone)]
pub struct BufferCreationParams {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsages,
    /// Allows `update_buffer` to write sub-ranges from a command buffer
    pub can_update_sub_range: bool,
    pub memory: MemoryProperties,
}

impl BufferCreationParams {
    /// A device-local storage buffer
    pub fn device_local(size: u64) -> Self {
        Self {
            label: None,
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            can_update_sub_range: true,
            memory: MemoryProperties::DEVICE_LOCAL,
        }
    }

    /// A host-visible staging buffer
    pub fn host_visible(size: u64, coherent: bool) -> Self {
        let mut memory = MemoryProperties::HOST_VISIBLE;
        if coherent {
            memory |= MemoryProperties::HOST_COHERENT;
        }
        Self {
            label: None,
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::MAP_WRITE,
            can_update_sub_range: false,
            memory,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_sub_range_updates(mut self, enabled: bool) -> Self {
        self.can_update_sub_range = enabled;
        self
    }
}

/// A memory allocation with a host-side shadow of its bytes
pub struct DeviceMemory {
    id: ObjectId,
    properties: MemoryProperties,
    bytes: RwLock<Vec<u8>>,
}

impl DeviceMemory {
    pub fn new(size: u64, properties: MemoryProperties) -> Result<Self> {
        let Ok(len) = usize::try_from(size) else {
            bail!("memory allocation of {} bytes exceeds the address space", size);
        };
        Ok(Self {
            id: next_object_id(),
            properties,
            bytes: RwLock::new(vec![0; len]),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    pub fn properties(&self) -> MemoryProperties {
        self.properties
    }

    pub fn is_host_visible(&self) -> bool {
        self.properties.contains(MemoryProperties::HOST_VISIBLE)
    }

    pub fn is_coherent(&self) -> bool {
        self.properties.contains(MemoryProperties::HOST_COHERENT)
    }

    fn checked_range(&self, offset: u64, len: u64) -> Result<Range<usize>> {
        let size = self.size();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset as usize..end as usize),
            _ => bail!(
                "range {}+{} is outside memory {} of {} bytes",
                offset,
                len,
                self.id,
                size
            ),
        }
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.checked_range(offset, data.len() as u64)?;
        self.bytes.write()[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let range = self.checked_range(offset, len)?;
        Ok(self.bytes.read()[range].to_vec())
    }
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("properties", &self.properties)
            .finish()
    }
}

/// A linear GPU buffer bound to a region of `DeviceMemory`
#[derive(Debug)]
pub struct Buffer {
    id: ObjectId,
    params: BufferCreationParams,
    memory: Arc<DeviceMemory>,
    memory_offset: u64,
}

impl Buffer {
    /// Bind a buffer to `memory` at `memory_offset`
    pub fn new(
        params: BufferCreationParams,
        memory: Arc<DeviceMemory>,
        memory_offset: u64,
    ) -> Result<Self> {
        if params.size == 0 {
            bail!("buffer size must be non-zero");
        }
        if memory_offset
            .checked_add(params.size)
            .map_or(true, |end| end > memory.size())
        {
            bail!(
                "buffer of {} bytes at offset {} does not fit memory of {} bytes",
                params.size,
                memory_offset,
                memory.size()
            );
        }
        Ok(Self {
            id: next_object_id(),
            params,
            memory,
            memory_offset,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.params.size
    }

    pub fn creation_params(&self) -> &BufferCreationParams {
        &self.params
    }

    pub fn label(&self) -> Option<&str> {
        self.params.label.as_deref()
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    pub fn memory_offset(&self) -> u64 {
        self.memory_offset
    }

    pub fn can_update_sub_range(&self) -> bool {
        self.params.can_update_sub_range
    }

    fn check(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size() => Ok(()),
            _ => bail!(
                "range {}+{} is outside buffer {} of {} bytes",
                offset,
                len,
                self.id,
                self.size()
            ),
        }
    }

    /// Write through the host mapping
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check(offset, data.len() as u64)?;
        self.memory.write(self.memory_offset + offset, data)
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        self.memory.read(self.memory_offset + offset, len)
    }
}

/// A buffer plus a byte offset into it
#[derive(Debug, Clone)]
pub struct BufferBinding {
    pub offset: u64,
    pub buffer: Arc<Buffer>,
}

impl BufferBinding {
    pub fn new(buffer: Arc<Buffer>, offset: u64) -> Self {
        Self { offset, buffer }
    }

    /// Bytes from `offset` to the end of the buffer
    pub fn remaining_size(&self) -> u64 {
        self.buffer.size().saturating_sub(self.offset)
    }
}

/// A range of mapped memory to flush or invalidate
#[derive(Debug, Clone)]
pub struct MappedMemoryRange {
    pub memory: Arc<DeviceMemory>,
    pub offset: u64,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(size: u64) -> Buffer {
        let memory = Arc::new(DeviceMemory::new(size * 2, MemoryProperties::DEVICE_LOCAL).unwrap());
        Buffer::new(BufferCreationParams::device_local(size), memory, size).unwrap()
    }

    #[test]
    fn test_write_lands_at_memory_offset() {
        let buffer = buffer(16);
        buffer.write(4, &[1, 2, 3, 4]).unwrap();

        assert_eq!(buffer.read(4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(buffer.memory().read(20, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(buffer.memory().read(4, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_out_of_range_access_is_rejected() {
        let buffer = buffer(16);
        assert!(buffer.write(14, &[0; 4]).is_err());
        assert!(buffer.read(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_buffer_must_fit_memory() {
        let memory = Arc::new(DeviceMemory::new(8, MemoryProperties::DEVICE_LOCAL).unwrap());
        assert!(Buffer::new(BufferCreationParams::device_local(16), memory, 0).is_err());
    }

    #[test]
    fn test_host_visible_params() {
        let params = BufferCreationParams::host_visible(64, false);
        let memory = Arc::new(DeviceMemory::new(64, params.memory).unwrap());
        assert!(memory.is_host_visible());
        assert!(!memory.is_coherent());
    }
}
