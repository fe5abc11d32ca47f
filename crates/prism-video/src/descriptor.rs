//! Descriptor set layouts, pools and sets

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use bitflags::bitflags;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use wgpu::ShaderStages;

use crate::buffer::{Buffer, BufferBinding};
use crate::{next_object_id, ObjectId};

/// Size sentinel meaning "to the end of the buffer"
pub const WHOLE_SIZE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorType {
    StorageBuffer,
    StorageBufferDynamic,
    UniformBuffer,
    UniformBufferDynamic,
}

impl DescriptorType {
    pub fn is_dynamic(self) -> bool {
        matches!(
            self,
            DescriptorType::StorageBufferDynamic | DescriptorType::UniformBufferDynamic
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    pub stages: ShaderStages,
}

impl DescriptorSetLayoutBinding {
    pub fn storage(binding: u32, count: u32, stages: ShaderStages) -> Self {
        Self {
            binding,
            ty: DescriptorType::StorageBuffer,
            count,
            stages,
        }
    }
}

#[derive(Debug)]
pub struct DescriptorSetLayout {
    id: ObjectId,
    bindings: Vec<DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    /// Build a layout, keeping bindings ordered by binding number
    pub fn new(bindings: &[DescriptorSetLayoutBinding]) -> Result<Self> {
        let mut bindings = bindings.to_vec();
        bindings.sort_by_key(|b| b.binding);
        if let Some(pair) = bindings.windows(2).find(|w| w[0].binding == w[1].binding) {
            bail!("binding {} declared more than once", pair[0].binding);
        }
        Ok(Self {
            id: next_object_id(),
            bindings,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn bindings(&self) -> &[DescriptorSetLayoutBinding] {
        &self.bindings
    }

    pub fn binding(&self, binding: u32) -> Option<&DescriptorSetLayoutBinding> {
        self.binding_index(binding).map(|ix| &self.bindings[ix])
    }

    fn binding_index(&self, binding: u32) -> Option<usize> {
        self.bindings
            .binary_search_by_key(&binding, |b| b.binding)
            .ok()
    }

    /// Total descriptors of `ty` across all bindings
    pub fn descriptor_count(&self, ty: DescriptorType) -> u32 {
        self.bindings
            .iter()
            .filter(|b| b.ty == ty)
            .map(|b| b.count)
            .sum()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescriptorPoolCreateFlags: u32 {
        const FREE_DESCRIPTOR_SET = 1 << 0;
        const UPDATE_AFTER_BIND = 1 << 1;
    }
}

#[derive(Debug)]
pub struct DescriptorPool {
    id: ObjectId,
    flags: DescriptorPoolCreateFlags,
    max_sets: u32,
    allocated: AtomicU32,
}

impl DescriptorPool {
    pub fn new(flags: DescriptorPoolCreateFlags, max_sets: u32) -> Self {
        Self {
            id: next_object_id(),
            flags,
            max_sets,
            allocated: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn flags(&self) -> DescriptorPoolCreateFlags {
        self.flags
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    pub fn allocated_sets(&self) -> u32 {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn allows_freeing_descriptor_sets(&self) -> bool {
        self.flags
            .contains(DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
    }

    pub(crate) fn try_reserve(&self, count: u32) -> bool {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(count)
                    .filter(|&total| total <= self.max_sets)
            })
            .is_ok()
    }

    pub(crate) fn release(&self, count: u32) {
        let _ = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(count))
            });
    }
}

/// A buffer range written into a descriptor slot
#[derive(Debug, Clone)]
pub struct DescriptorInfo {
    pub buffer: Arc<Buffer>,
    pub offset: u64,
    pub size: u64,
}

impl DescriptorInfo {
    /// Bind from the binding's offset to the end of the buffer
    pub fn whole(binding: &BufferBinding) -> Self {
        Self {
            buffer: Arc::clone(&binding.buffer),
            offset: binding.offset,
            size: WHOLE_SIZE,
        }
    }

    pub fn sized(binding: &BufferBinding, size: u64) -> Self {
        Self {
            buffer: Arc::clone(&binding.buffer),
            offset: binding.offset,
            size,
        }
    }

    /// Byte length with `WHOLE_SIZE` resolved against the buffer
    pub fn resolved_size(&self) -> u64 {
        if self.size == WHOLE_SIZE {
            self.buffer.size().saturating_sub(self.offset)
        } else {
            self.size
        }
    }
}

/// One descriptor update: `infos` land in consecutive array elements
#[derive(Debug, Clone)]
pub struct WriteDescriptorSet<'a> {
    pub dst_set: &'a DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: DescriptorType,
    pub infos: &'a [DescriptorInfo],
}

#[derive(Debug)]
pub struct DescriptorSet {
    id: ObjectId,
    layout: Arc<DescriptorSetLayout>,
    pool: Arc<DescriptorPool>,
    /// Indexed like `layout.bindings()`, one slot per array element
    storage: RwLock<Vec<Vec<Option<DescriptorInfo>>>>,
    version: AtomicU64,
}

impl DescriptorSet {
    pub(crate) fn new(layout: Arc<DescriptorSetLayout>, pool: Arc<DescriptorPool>) -> Self {
        let storage = layout
            .bindings()
            .iter()
            .map(|b| vec![None; b.count as usize])
            .collect();
        Self {
            id: next_object_id(),
            layout,
            pool,
            storage: RwLock::new(storage),
            version: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn pool(&self) -> &Arc<DescriptorPool> {
        &self.pool
    }

    /// Incremented on every successful write
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Check a write against the layout without applying it
    pub fn validate_write(&self, write: &WriteDescriptorSet<'_>) -> Result<()> {
        let Some(binding) = self.layout.binding(write.binding) else {
            bail!("descriptor set {} has no binding {}", self.id, write.binding);
        };
        if binding.ty != write.descriptor_type {
            bail!(
                "binding {} is {:?}, write uses {:?}",
                write.binding,
                binding.ty,
                write.descriptor_type
            );
        }
        let end = u64::from(write.array_element) + write.infos.len() as u64;
        if end > u64::from(binding.count) {
            bail!(
                "write of {} descriptors at element {} overflows binding {} of {}",
                write.infos.len(),
                write.array_element,
                write.binding,
                binding.count
            );
        }
        for info in write.infos {
            if info.size != WHOLE_SIZE
                && info
                    .offset
                    .checked_add(info.size)
                    .map_or(true, |e| e > info.buffer.size())
            {
                bail!(
                    "descriptor range {}+{} exceeds buffer {}",
                    info.offset,
                    info.size,
                    info.buffer.id()
                );
            }
        }
        Ok(())
    }

    /// Validate and apply a write
    pub fn process_write(&self, write: &WriteDescriptorSet<'_>) -> Result<()> {
        self.validate_write(write)?;
        let Some(index) = self.layout.binding_index(write.binding) else {
            bail!("descriptor set {} has no binding {}", self.id, write.binding);
        };

        let mut storage = self.storage.write();
        let first = write.array_element as usize;
        for (slot, info) in storage[index][first..].iter_mut().zip(write.infos) {
            *slot = Some(info.clone());
        }
        drop(storage);

        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn descriptor(&self, binding: u32, element: u32) -> Option<DescriptorInfo> {
        let index = self.layout.binding_index(binding)?;
        self.storage
            .read()
            .get(index)?
            .get(element as usize)?
            .clone()
    }
}
