use std::slice;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use prism_core::config::TransferConfig;
use prism_core::{
    logging::LogCategory, prism_debug, prism_error, prism_info, prism_warn_rate_limited,
};
use smallvec::SmallVec;
use tracing::instrument;
use wgpu::ShaderStages;

use super::{
    TransferDescriptor, TransferError, TransferRequest, TransferFlags, COPY_SHADER_SOURCE,
    MAX_PROPERTIES_PER_DISPATCH, PROPERTY_POOL_COPY_SHADER, TRANSFER_DESCRIPTOR_SIZE,
};
use crate::buffer::BufferBinding;
use crate::command::{
    AccessFlags, BufferMemoryBarrier, CommandBuffer, PipelineBindPoint, PipelineStageFlags,
};
use crate::descriptor::{
    DescriptorInfo, DescriptorPoolCreateFlags, DescriptorSetLayoutBinding, DescriptorType,
    WriteDescriptorSet,
};
use crate::descriptor_cache::DescriptorSetCache;
use crate::device::LogicalDevice;
use crate::pipeline::{
    ComputePipelineCreationParams, Pipeline, PipelineCreateFlags, PushConstantRange,
    SpecializedShader,
};
use crate::sync::Fence;

/// Batches property transfers into compute dispatches
///
/// Not internally synchronized: every recording method takes `&mut self`, so
/// callers sharing a handler across threads wrap it in a lock.
pub struct PropertyPoolHandler<D: LogicalDevice> {
    pub(super) device: Arc<D>,
    pipeline: Arc<Pipeline>,
    pub(super) descriptor_cache: DescriptorSetCache,
    max_properties_per_pass: u32,
    alignment: u32,
    upload_timeout: Duration,
}

impl<D: LogicalDevice> PropertyPoolHandler<D> {
    pub fn new(device: Arc<D>) -> Result<Self> {
        Self::with_config(device, &TransferConfig::default())
    }

    pub fn with_config(device: Arc<D>, config: &TransferConfig) -> Result<Self> {
        let limits = device.limits();
        let cap = config
            .max_properties_per_dispatch
            .clamp(1, MAX_PROPERTIES_PER_DISPATCH);
        // two bindings for the transfer and index tables, the rest split
        // between sources and destinations
        let max_properties_per_pass =
            (limits.max_per_stage_storage_buffers.saturating_sub(2) / 2).min(cap);
        if max_properties_per_pass == 0 {
            bail!(
                "device binds {} storage buffers per stage, property transfers need at least 4",
                limits.max_per_stage_storage_buffers
            );
        }
        if config.descriptor_cache_size == 0 {
            bail!("descriptor cache size must be non-zero");
        }
        let alignment = limits
            .storage_buffer_offset_alignment
            .max(limits.non_coherent_atom_size)
            .max(config.min_staging_alignment)
            .max(4);

        let set_layout = device.create_descriptor_set_layout(&[
            DescriptorSetLayoutBinding::storage(0, 1, ShaderStages::COMPUTE),
            DescriptorSetLayoutBinding::storage(1, 1, ShaderStages::COMPUTE),
            DescriptorSetLayoutBinding::storage(2, max_properties_per_pass, ShaderStages::COMPUTE),
            DescriptorSetLayoutBinding::storage(3, max_properties_per_pass, ShaderStages::COMPUTE),
        ])?;
        let pool = device.create_descriptor_pool(
            DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
            config.descriptor_cache_size,
        );
        let descriptor_cache = DescriptorSetCache::new(
            device.as_ref(),
            pool,
            Arc::clone(&set_layout),
            config.descriptor_cache_size,
        )?;

        let layout = device.create_pipeline_layout(
            &[PushConstantRange {
                stages: ShaderStages::COMPUTE,
                offset: 0,
                size: 8,
            }],
            vec![Some(set_layout)],
        )?;
        let source = format!(
            "const MAX_PROPERTIES_PER_PASS: u32 = {}u;\n{}",
            max_properties_per_pass, COPY_SHADER_SOURCE
        );
        let pipeline = device.create_compute_pipeline(ComputePipelineCreationParams {
            label: Some("property pool copy".to_string()),
            layout: Some(layout),
            shader: SpecializedShader::compute(PROPERTY_POOL_COPY_SHADER, source),
            flags: PipelineCreateFlags::empty(),
        })?;

        prism_info!(
            LogCategory::Transfer,
            "property pool handler ready: {} properties per pass, {} byte staging alignment, \
             {} cached sets",
            max_properties_per_pass,
            alignment,
            config.descriptor_cache_size
        );

        Ok(Self {
            device,
            pipeline,
            descriptor_cache,
            max_properties_per_pass,
            alignment,
            upload_timeout: Duration::from_millis(config.default_upload_timeout_ms),
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn descriptor_cache(&self) -> &DescriptorSetCache {
        &self.descriptor_cache
    }

    pub fn max_properties_per_transfer_dispatch(&self) -> u32 {
        self.max_properties_per_pass
    }

    /// Alignment of every staging sub-allocation
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Scratch bytes one full pass needs for its transfer table
    pub fn max_scratch_size(&self) -> u64 {
        TRANSFER_DESCRIPTOR_SIZE * u64::from(self.max_properties_per_pass)
    }

    /// Deadline for an upload starting now, from the configured timeout
    pub fn default_deadline(&self) -> Instant {
        Instant::now() + self.upload_timeout
    }

    /// Return descriptor sets whose fences have signaled
    ///
    /// Callers that reset the fence passed to `transfer_properties` themselves
    /// need not call this first; released sets remember the signal.
    pub fn poll_descriptor_sets(&mut self) -> usize {
        self.descriptor_cache.poll_and_reclaim()
    }

    /// Record the dispatches moving `requests` into `cmdbuf`
    ///
    /// Requests are split into passes of at most
    /// `max_properties_per_transfer_dispatch()`. Only dwords in
    /// `[base_dword, end_dword)` of each property are moved. Every pass is
    /// attempted; a failed pass records nothing. Descriptor sets used here
    /// come back once `fence` signals.
    #[instrument(skip_all, fields(requests = requests.len(), base_dword, end_dword))]
    pub fn transfer_properties(
        &mut self,
        cmdbuf: &mut D::CommandBuffer,
        fence: &Arc<Fence>,
        scratch: &BufferBinding,
        addresses: &BufferBinding,
        requests: &[TransferRequest],
        base_dword: u32,
        end_dword: u32,
    ) -> Result<(), TransferError> {
        if requests.is_empty() {
            return Ok(());
        }
        if !scratch.buffer.can_update_sub_range() {
            prism_error!(
                LogCategory::Transfer,
                "scratch buffer {} cannot be updated from command buffers",
                scratch.buffer.id()
            );
            return Err(TransferError::InvalidScratchBuffer);
        }
        if scratch.remaining_size() < self.max_scratch_size() {
            prism_warn_rate_limited!(
                LogCategory::Transfer,
                "scratch binding holds {} bytes, a full pass needs {}",
                scratch.remaining_size(),
                self.max_scratch_size()
            );
        }

        let mut passes = 0u32;
        let mut failed = 0u32;
        let mut last_error = None;
        for pass in requests.chunks(self.max_properties_per_pass as usize) {
            passes += 1;
            if let Err(err) =
                self.copy_pass(cmdbuf, fence, scratch, addresses, pass, base_dword, end_dword)
            {
                prism_debug!(LogCategory::Transfer, "transfer pass {} failed: {}", passes - 1, err);
                failed += 1;
                last_error = Some(err);
            }
        }

        match last_error {
            None => Ok(()),
            Some(err) if passes == 1 => Err(err),
            Some(_) => Err(TransferError::PassesFailed { failed, passes }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_pass(
        &mut self,
        cmdbuf: &mut D::CommandBuffer,
        fence: &Arc<Fence>,
        scratch: &BufferBinding,
        addresses: &BufferBinding,
        requests: &[TransferRequest],
        base_dword: u32,
        end_dword: u32,
    ) -> Result<(), TransferError> {
        let table_size = TRANSFER_DESCRIPTOR_SIZE * requests.len() as u64;
        if scratch.remaining_size() < table_size {
            return Err(TransferError::ScratchTooSmall {
                required: table_size,
                available: scratch.remaining_size(),
            });
        }

        let mut max_dwords = 0u64;
        for request in requests {
            if request.element_size % 4 != 0 {
                prism_error!(
                    LogCategory::Transfer,
                    "element size {} is not a multiple of 4, pass skipped",
                    request.element_size
                );
                return Err(TransferError::MisalignedElementSize {
                    element_size: request.element_size,
                });
            }
            if request.element_size / 4 > TransferFlags::DWORD_SIZE_MASK {
                prism_error!(
                    LogCategory::Transfer,
                    "element size {} does not fit a transfer descriptor, pass skipped",
                    request.element_size
                );
                return Err(TransferError::ElementSizeTooLarge {
                    element_size: request.element_size,
                });
            }
            max_dwords = max_dwords.max(request.total_dwords());
        }
        let max_dwords = max_dwords.min(u64::from(end_dword));
        if max_dwords <= u64::from(base_dword) {
            return Err(TransferError::NothingToTransfer {
                base_dword,
                end_dword,
            });
        }

        let slot = self.acquire_transfer_set(scratch, addresses, requests, base_dword, end_dword)?;
        let Some(set) = self.descriptor_cache.get(slot).cloned() else {
            return Err(TransferError::DescriptorSetExhausted);
        };

        let table: SmallVec<[TransferDescriptor; 16]> =
            requests.iter().map(TransferRequest::descriptor).collect();
        let window = [base_dword, max_dwords as u32];
        let property_count = requests.len() as u32;
        let limits = self.device.limits();
        let groups = limits
            .compute_optimal_persistent_workgroup_dispatch_size(
                max_dwords - u64::from(base_dword),
                super::COPY_WORKGROUP_SIZE,
                property_count,
            )
            .max(1);

        let barrier = |src_access, dst_access| {
            BufferMemoryBarrier::new(
                Arc::clone(&scratch.buffer),
                scratch.offset,
                table_size,
                src_access,
                dst_access,
            )
        };
        let layout = self.pipeline.layout();
        let recorded = cmdbuf
            .update_buffer(&scratch.buffer, scratch.offset, bytemuck::cast_slice(&table))
            .and_then(|_| {
                cmdbuf.pipeline_barrier(
                    PipelineStageFlags::TRANSFER,
                    PipelineStageFlags::COMPUTE_SHADER,
                    &[barrier(AccessFlags::TRANSFER_WRITE, AccessFlags::SHADER_READ)],
                )
            })
            .and_then(|_| cmdbuf.bind_compute_pipeline(&self.pipeline))
            .and_then(|_| {
                cmdbuf.bind_descriptor_sets(
                    PipelineBindPoint::Compute,
                    layout,
                    0,
                    slice::from_ref(&set),
                )
            })
            .and_then(|_| {
                let constants = bytemuck::cast_slice(&window);
                cmdbuf.push_constants(layout, ShaderStages::COMPUTE, 0, constants)
            })
            .and_then(|_| cmdbuf.dispatch(groups, property_count, 1))
            .and_then(|_| {
                cmdbuf.pipeline_barrier(
                    PipelineStageFlags::COMPUTE_SHADER,
                    PipelineStageFlags::TRANSFER,
                    &[barrier(AccessFlags::SHADER_READ, AccessFlags::TRANSFER_WRITE)],
                )
            });

        // the set may already be referenced by recorded commands
        self.descriptor_cache.release(slot, fence);
        recorded.map_err(|e| TransferError::Recording(e.to_string()))
    }

    /// Acquire a cached set and point it at this pass's buffers
    fn acquire_transfer_set(
        &mut self,
        scratch: &BufferBinding,
        addresses: &BufferBinding,
        requests: &[TransferRequest],
        base_dword: u32,
        end_dword: u32,
    ) -> Result<u32, TransferError> {
        let Some(slot) = self.descriptor_cache.acquire() else {
            prism_debug!(LogCategory::Descriptor, "no free transfer descriptor set");
            return Err(TransferError::DescriptorSetExhausted);
        };
        let Some(set) = self.descriptor_cache.get(slot).cloned() else {
            return Err(TransferError::DescriptorSetExhausted);
        };

        let per_pass = self.max_properties_per_pass as usize;
        let table_info =
            DescriptorInfo::sized(scratch, TRANSFER_DESCRIPTOR_SIZE * requests.len() as u64);
        let index_info = DescriptorInfo::whole(addresses);

        let mut sources = Vec::with_capacity(per_pass);
        let mut destinations = Vec::with_capacity(per_pass);
        for request in requests {
            let pool_side = DescriptorInfo::sized(&request.memblock, request.total_bytes());
            if request.is_download() {
                sources.push(pool_side);
                destinations.push(DescriptorInfo::sized(&request.buffer, request.total_bytes()));
            } else {
                let source_bytes = if request.flags.contains(TransferFlags::STAGED_SOURCE) {
                    let last = request.total_dwords().min(u64::from(end_dword));
                    last.saturating_sub(u64::from(base_dword)) * 4
                } else {
                    request.source_bytes()
                };
                sources.push(if source_bytes == 0 {
                    DescriptorInfo::whole(&request.buffer)
                } else {
                    DescriptorInfo::sized(&request.buffer, source_bytes)
                });
                destinations.push(pool_side);
            }
        }
        sources.resize(per_pass, table_info.clone());
        destinations.resize(per_pass, table_info.clone());

        let writes = [
            WriteDescriptorSet {
                dst_set: &set,
                binding: 0,
                array_element: 0,
                descriptor_type: DescriptorType::StorageBuffer,
                infos: slice::from_ref(&table_info),
            },
            WriteDescriptorSet {
                dst_set: &set,
                binding: 1,
                array_element: 0,
                descriptor_type: DescriptorType::StorageBuffer,
                infos: slice::from_ref(&index_info),
            },
            WriteDescriptorSet {
                dst_set: &set,
                binding: 2,
                array_element: 0,
                descriptor_type: DescriptorType::StorageBuffer,
                infos: &sources,
            },
            WriteDescriptorSet {
                dst_set: &set,
                binding: 3,
                array_element: 0,
                descriptor_type: DescriptorType::StorageBuffer,
                infos: &destinations,
            },
        ];

        if let Err(err) = self.device.update_descriptor_sets(&writes) {
            self.descriptor_cache.release_unused(slot);
            prism_error!(
                LogCategory::Descriptor,
                "transfer descriptor update failed: {}",
                err
            );
            return Err(TransferError::DescriptorUpdate(err.to_string()));
        }
        Ok(slot)
    }
}
