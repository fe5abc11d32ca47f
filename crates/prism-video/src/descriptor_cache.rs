//! Ring of pre-allocated descriptor sets recycled behind fences

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use prism_core::{logging::LogCategory, prism_trace, prism_warn};

use crate::descriptor::{DescriptorPool, DescriptorSet, DescriptorSetLayout};
use crate::device::LogicalDevice;
use crate::sync::{Fence, FenceWatch};

/// Lifecycle of one cached set
#[derive(Debug, Clone)]
pub enum SlotState {
    Free,
    InUse,
    PendingRelease(FenceWatch),
}

#[derive(Debug)]
pub struct DescriptorSetCache {
    layout: Arc<DescriptorSetLayout>,
    pool: Arc<DescriptorPool>,
    sets: Vec<Arc<DescriptorSet>>,
    states: Vec<SlotState>,
    free: Vec<u32>,
    pending: VecDeque<u32>,
}

impl DescriptorSetCache {
    /// Allocate `capacity` sets of `layout` from `pool` up front
    pub fn new<D: LogicalDevice>(
        device: &D,
        pool: Arc<DescriptorPool>,
        layout: Arc<DescriptorSetLayout>,
        capacity: u32,
    ) -> Result<Self> {
        let sets = device.create_descriptor_sets(&pool, &layout, capacity)?;
        Ok(Self {
            layout,
            pool,
            states: vec![SlotState::Free; sets.len()],
            free: (0..capacity).rev().collect(),
            pending: VecDeque::new(),
            sets,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.sets.len() as u32
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn pool(&self) -> &Arc<DescriptorPool> {
        &self.pool
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn state(&self, index: u32) -> Option<&SlotState> {
        self.states.get(index as usize)
    }

    pub fn get(&self, index: u32) -> Option<&Arc<DescriptorSet>> {
        self.sets.get(index as usize)
    }

    /// Take a free slot, reclaiming finished ones first if none is free
    pub fn acquire(&mut self) -> Option<u32> {
        if self.free.is_empty() {
            self.poll_and_reclaim();
        }
        let index = self.free.pop()?;
        self.states[index as usize] = SlotState::InUse;
        Some(index)
    }

    /// Hand a slot back; it becomes free once `fence` signals
    pub fn release(&mut self, index: u32, fence: &Arc<Fence>) {
        let slot = index as usize;
        if !matches!(self.states.get(slot), Some(SlotState::InUse)) {
            prism_warn!(
                LogCategory::Descriptor,
                "release of descriptor slot {} in state {:?} ignored",
                index,
                self.states.get(slot)
            );
            return;
        }
        self.states[slot] = SlotState::PendingRelease(FenceWatch::new(Arc::clone(fence)));
        self.pending.push_back(index);
    }

    /// Return a slot that was acquired but never recorded
    pub fn release_unused(&mut self, index: u32) {
        let slot = index as usize;
        if matches!(self.states.get(slot), Some(SlotState::InUse)) {
            self.states[slot] = SlotState::Free;
            self.free.push(index);
        }
    }

    /// Move every slot whose fence has signaled back to the free list
    pub fn poll_and_reclaim(&mut self) -> usize {
        let mut reclaimed = 0;
        let states = &mut self.states;
        let free = &mut self.free;
        self.pending.retain(|&index| {
            let done = matches!(
                &states[index as usize],
                SlotState::PendingRelease(watch) if watch.is_complete()
            );
            if done {
                states[index as usize] = SlotState::Free;
                free.push(index);
                reclaimed += 1;
            }
            !done
        });
        if reclaimed > 0 {
            prism_trace!(
                LogCategory::Descriptor,
                "reclaimed {} descriptor sets, {} pending",
                reclaimed,
                self.pending.len()
            );
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareDevice;
    use crate::descriptor::{DescriptorPoolCreateFlags, DescriptorSetLayoutBinding};
    use wgpu::ShaderStages;

    fn cache(capacity: u32) -> DescriptorSetCache {
        let device = SoftwareDevice::new();
        let layout = device
            .create_descriptor_set_layout(&[DescriptorSetLayoutBinding::storage(
                0,
                1,
                ShaderStages::COMPUTE,
            )])
            .unwrap();
        let pool =
            device.create_descriptor_pool(DescriptorPoolCreateFlags::UPDATE_AFTER_BIND, capacity);
        DescriptorSetCache::new(&device, pool, layout, capacity).unwrap()
    }

    #[test]
    fn test_exhaustion_until_fence_signals() {
        let mut cache = cache(2);
        let fence = Arc::new(Fence::new(false));

        let a = cache.acquire().unwrap();
        let b = cache.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.acquire(), None);

        cache.release(a, &fence);
        cache.release(b, &fence);
        assert_eq!(cache.acquire(), None);
        assert_eq!(cache.pending_count(), 2);

        fence.signal();
        assert!(cache.acquire().is_some());
        assert!(cache.acquire().is_some());
        assert_eq!(cache.acquire(), None);
    }

    #[test]
    fn test_reclaim_after_fence_reset() {
        let mut cache = cache(1);
        let fence = Arc::new(Fence::new(false));

        let slot = cache.acquire().unwrap();
        cache.release(slot, &fence);
        fence.signal();
        fence.reset();

        assert_eq!(cache.poll_and_reclaim(), 1);
        assert!(matches!(cache.state(slot), Some(SlotState::Free)));
    }

    #[test]
    fn test_release_of_free_slot_is_ignored() {
        let mut cache = cache(1);
        let fence = Arc::new(Fence::new(true));

        cache.release(0, &fence);
        assert_eq!(cache.pending_count(), 0);
        assert_eq!(cache.free_count(), 1);
    }

    #[test]
    fn test_release_unused_returns_slot_immediately() {
        let mut cache = cache(1);
        let slot = cache.acquire().unwrap();
        cache.release_unused(slot);
        assert_eq!(cache.acquire(), Some(slot));
    }

    #[test]
    fn test_pool_capacity_is_enforced() {
        let device = SoftwareDevice::new();
        let layout = device
            .create_descriptor_set_layout(&[DescriptorSetLayoutBinding::storage(
                0,
                1,
                ShaderStages::COMPUTE,
            )])
            .unwrap();
        let pool = device.create_descriptor_pool(DescriptorPoolCreateFlags::empty(), 1);
        assert!(DescriptorSetCache::new(&device, pool, layout, 2).is_err());
    }
}
