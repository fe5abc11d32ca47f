//! Device limits relevant to compute scheduling and descriptor binding

use serde::{Deserialize, Serialize};
use wgpu::Limits;

/// Hardware limits consulted by the HAL and the transfer utilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub max_per_stage_storage_buffers: u32,
    pub storage_buffer_offset_alignment: u32,
    pub max_storage_buffer_range: u64,
    pub max_push_constant_size: u32,
    pub max_dynamic_storage_buffers: u32,
    pub max_dynamic_uniform_buffers: u32,
    pub max_compute_workgroup_invocations: u32,
    /// Granularity of host-visible, non-coherent flushes
    pub non_coherent_atom_size: u32,
    /// Workgroup invocations one compute unit keeps resident without stalls
    pub max_optimally_resident_workgroup_invocations: u32,
    /// Invocations the whole device keeps resident at once
    pub max_resident_invocations: u32,
}

impl DeviceLimits {
    /// Derive limits from a `wgpu` limit set
    pub fn from_wgpu(limits: &Limits) -> Self {
        let max_compute_workgroup_invocations = limits.max_compute_invocations_per_workgroup;
        let max_optimally_resident_workgroup_invocations =
            max_compute_workgroup_invocations.clamp(1, 512);

        Self {
            max_per_stage_storage_buffers: limits.max_storage_buffers_per_shader_stage,
            storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            max_storage_buffer_range: u64::from(limits.max_storage_buffer_binding_size),
            max_push_constant_size: limits.max_push_constant_size,
            max_dynamic_storage_buffers: limits.max_dynamic_storage_buffers_per_pipeline_layout,
            max_dynamic_uniform_buffers: limits.max_dynamic_uniform_buffers_per_pipeline_layout,
            max_compute_workgroup_invocations,
            non_coherent_atom_size: 64,
            max_optimally_resident_workgroup_invocations,
            max_resident_invocations: max_optimally_resident_workgroup_invocations * 128,
        }
    }

    /// Override the number of storage buffers a single stage may bind
    pub fn with_max_per_stage_storage_buffers(mut self, count: u32) -> Self {
        self.max_per_stage_storage_buffers = count;
        self
    }

    /// Workgroup count for a persistent-threads dispatch over `element_count` items
    ///
    /// Enough workgroups to cover the work once, but never more than the
    /// device can keep resident, so each invocation loops over a strided range.
    pub fn compute_optimal_persistent_workgroup_dispatch_size(
        &self,
        element_count: u64,
        workgroup_size: u32,
        spinning_protection: u32,
    ) -> u32 {
        let workgroup_size = u64::from(workgroup_size.max(1));
        let per_group = workgroup_size * u64::from(spinning_protection.max(1));
        let needed = element_count.div_ceil(per_group);
        let resident = (u64::from(self.max_resident_invocations) / workgroup_size).max(1);
        needed.min(resident) as u32
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        let mut limits = Limits::default();
        // Vulkan-class devices expose push constants; the wgpu default is zero.
        limits.max_push_constant_size = 128;
        Self::from_wgpu(&limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_wgpu() {
        let limits = DeviceLimits::default();
        let wgpu_limits = Limits::default();

        assert_eq!(
            limits.max_per_stage_storage_buffers,
            wgpu_limits.max_storage_buffers_per_shader_stage
        );
        assert_eq!(limits.max_push_constant_size, 128);
        assert!(
            limits.max_resident_invocations >= limits.max_optimally_resident_workgroup_invocations
        );
    }

    #[test]
    fn test_dispatch_size_covers_small_workloads() {
        let limits = DeviceLimits::default();

        assert_eq!(limits.compute_optimal_persistent_workgroup_dispatch_size(0, 256, 1), 0);
        assert_eq!(limits.compute_optimal_persistent_workgroup_dispatch_size(1, 256, 1), 1);
        assert_eq!(limits.compute_optimal_persistent_workgroup_dispatch_size(257, 256, 1), 2);
        assert_eq!(limits.compute_optimal_persistent_workgroup_dispatch_size(512, 256, 2), 1);
    }

    #[test]
    fn test_dispatch_size_is_capped_by_residency() {
        let limits = DeviceLimits {
            max_resident_invocations: 1024,
            ..DeviceLimits::default()
        };

        assert_eq!(
            limits.compute_optimal_persistent_workgroup_dispatch_size(1 << 30, 256, 1),
            4
        );
        // a workgroup larger than the resident budget still gets one group
        assert_eq!(
            limits.compute_optimal_persistent_workgroup_dispatch_size(1 << 30, 4096, 1),
            1
        );
    }
}
