//! Streaming host and device data into property pools
//!
//! Host data is staged through a streaming buffer a window of dwords at a
//! time. When staging space or descriptor sets run out, the command buffer
//! is submitted, waited on and restarted so the ring drains.

use std::slice;
use std::sync::Arc;
use std::time::Instant;

use prism_core::{
    logging::LogCategory, prism_debug, prism_error, prism_trace, prism_warn_rate_limited,
};
use smallvec::SmallVec;
use tracing::instrument;

use super::histogram::CumulativeHistogram;
use super::{
    PropertyPoolHandler, TransferError, TransferFlags, TransferRequest, UpStreamingRequest,
    UpStreamingSource, INVALID_INDEX_OFFSET,
};
use crate::alloc::{AddressAllocator, INVALID_ADDRESS};
use crate::buffer::BufferBinding;
use crate::command::{CommandBuffer, CommandBufferResetFlags, CommandBufferUsage};
use crate::device::LogicalDevice;
use crate::queue::{Queue, SubmitInfo, WaitSemaphores};
use crate::streaming::StreamingTransientDataBuffer;
use crate::sync::Fence;
use crate::{align_down, align_up};

struct UpstreamContext<'a, D: LogicalDevice, A: AddressAllocator> {
    streaming: &'a StreamingTransientDataBuffer<A>,
    cmdbuf: &'a mut D::CommandBuffer,
    fence: &'a Arc<Fence>,
    queue: &'a D::Queue,
    scratch: &'a BufferBinding,
    wait_semaphores: &'a mut WaitSemaphores,
    deadline: Instant,
}

impl<D: LogicalDevice> PropertyPoolHandler<D> {
    /// Transfer every request into its destination pool array
    ///
    /// `cmdbuf` must be recording. Requests are sorted in place by size.
    /// Work that fits is recorded into `cmdbuf`; whenever staging space or
    /// descriptor sets run out the buffer is submitted to `queue` (waiting on
    /// `wait_semaphores` the first time), `fence` is waited on and reset, and
    /// recording restarts. Those waits block until the fence signals and do
    /// not observe `deadline`. The final batch is left recorded for the
    /// caller to submit. If a mid-upload submission is rejected, `cmdbuf`
    /// stays ended and `fence` untouched, and the untransferred dwords are
    /// returned.
    ///
    /// Returns the number of dwords that could not be transferred before
    /// `deadline`; zero means everything was recorded. Index lists on the
    /// requests are not applied.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(requests = requests.len()))]
    pub fn upstream_properties<A: AddressAllocator>(
        &mut self,
        streaming: &StreamingTransientDataBuffer<A>,
        cmdbuf: &mut D::CommandBuffer,
        fence: &Arc<Fence>,
        queue: &D::Queue,
        scratch: &BufferBinding,
        requests: &mut [UpStreamingRequest<'_>],
        wait_semaphores: &mut WaitSemaphores,
        deadline: Instant,
    ) -> u32 {
        let total = |requests: &[UpStreamingRequest<'_>]| {
            requests
                .iter()
                .fold(0u32, |sum, r| sum.saturating_add(r.element_dwords()))
        };
        if requests.is_empty() {
            return 0;
        }
        if !scratch.buffer.can_update_sub_range() {
            prism_error!(
                LogCategory::Transfer,
                "scratch buffer {} cannot be updated from command buffers",
                scratch.buffer.id()
            );
            return total(&*requests);
        }
        for request in requests.iter() {
            if let Err(err) = request.validate() {
                prism_error!(LogCategory::Transfer, "upstream request rejected: {}", err);
                return total(&*requests);
            }
        }
        if requests
            .iter()
            .any(|r| r.src_addresses.is_some() || r.dst_addresses.is_some())
        {
            prism_warn_rate_limited!(
                LogCategory::Transfer,
                "index lists are not applied when streaming, elements are addressed directly"
            );
        }

        requests.sort_by_key(UpStreamingRequest::element_dwords);

        let mut ctx = UpstreamContext::<D, A> {
            streaming,
            cmdbuf,
            fence,
            queue,
            scratch,
            wait_semaphores,
            deadline,
        };
        let mut remaining = 0u32;
        let mut aborted = false;
        for pass in requests.chunks(self.max_properties_per_transfer_dispatch() as usize) {
            if aborted {
                remaining = remaining.saturating_add(pass_dwords(pass));
                continue;
            }
            let left = self.upstream_pass(&mut ctx, pass);
            if left > 0 {
                aborted = true;
                remaining = remaining.saturating_add(left);
            }
        }

        if remaining > 0 {
            prism_debug!(
                LogCategory::Transfer,
                "upstream left {} dwords untransferred",
                remaining
            );
        }
        remaining
    }

    /// Drive one pass to completion; returns dwords left when it stalls
    fn upstream_pass<A: AddressAllocator>(
        &mut self,
        ctx: &mut UpstreamContext<'_, D, A>,
        pass: &[UpStreamingRequest<'_>],
    ) -> u32 {
        let max_dwords = pass_dwords(pass);
        let mut done = 0u32;
        let mut progress_since_submit = true;

        while done < max_dwords {
            let advanced = self.upstream_attempt(ctx, pass, done);
            if advanced > 0 {
                done += advanced;
                progress_since_submit = true;
                continue;
            }
            if !progress_since_submit || !self.submit_and_restart(ctx) {
                break;
            }
            progress_since_submit = false;
        }

        max_dwords - done
    }

    /// Stage and record as many dwords of every live request as fit
    fn upstream_attempt<A: AddressAllocator>(
        &mut self,
        ctx: &mut UpstreamContext<'_, D, A>,
        pass: &[UpStreamingRequest<'_>],
        done: u32,
    ) -> u32 {
        let live = &pass[pass.partition_point(|r| r.element_dwords() <= done)..];
        if live.is_empty() {
            return 0;
        }

        let count = live.len() as u64;
        let alignment = u64::from(self.alignment());
        let free_space = align_down(ctx.streaming.max_size(), alignment);
        let worst_case_padding = alignment * count - count;
        if free_space <= worst_case_padding {
            prism_trace!(
                LogCategory::Transfer,
                "{} staging bytes free, {} needed for padding alone",
                free_space,
                worst_case_padding
            );
            return 0;
        }

        let fixed: u64 = live.iter().map(UpStreamingRequest::staged_fixed_bytes).sum();
        let histogram = CumulativeHistogram::build(
            fixed,
            live.iter()
                .map(|r| (r.element_dwords() - done, r.staged_bytes_per_dword())),
        );
        let (dwords, staged_bytes) = histogram.dwords_for_budget(free_space - worst_case_padding);
        if dwords == 0 {
            return 0;
        }
        let end = done.saturating_add(dwords);

        let mut allocation = None;
        if live.iter().any(UpStreamingRequest::is_host) {
            let size = staged_bytes + worst_case_padding;
            let mut addr = [INVALID_ADDRESS];
            if ctx
                .streaming
                .multi_alloc(ctx.deadline, &mut addr, &[size], &[alignment])
                != 0
            {
                return 0;
            }
            allocation = Some((addr[0], size));
        }

        match self.stage_and_record(ctx, live, done, end, allocation) {
            Ok(()) => {
                if let Some((addr, size)) = allocation {
                    ctx.streaming
                        .multi_free(&[addr], &[size], Some(Arc::clone(ctx.fence)));
                }
                end - done
            }
            Err(err) => {
                prism_debug!(LogCategory::Transfer, "upstream attempt stalled: {}", err);
                if let Some((addr, size)) = allocation {
                    ctx.streaming.multi_free(&[addr], &[size], None);
                }
                0
            }
        }
    }

    fn stage_and_record<A: AddressAllocator>(
        &mut self,
        ctx: &mut UpstreamContext<'_, D, A>,
        live: &[UpStreamingRequest<'_>],
        done: u32,
        end: u32,
        allocation: Option<(u64, u64)>,
    ) -> Result<(), TransferError> {
        let alignment = u64::from(self.alignment());
        let staging = ctx.streaming.buffer();
        let mut cursor = allocation.map_or(0, |(addr, _)| addr);

        let mut transfers: SmallVec<[TransferRequest; 16]> = SmallVec::with_capacity(live.len());
        for request in live {
            let (buffer, flags) = match &request.source {
                UpStreamingSource::Device(binding) => (
                    binding.clone(),
                    if request.fill {
                        TransferFlags::FILL
                    } else {
                        TransferFlags::empty()
                    },
                ),
                UpStreamingSource::Host(data) => {
                    let (bytes, flags) = if request.fill {
                        (&data[..request.element_size as usize], TransferFlags::FILL)
                    } else {
                        let first = done as usize * 4;
                        let last = end.min(request.element_dwords()) as usize * 4;
                        (&data[first..last], TransferFlags::STAGED_SOURCE)
                    };
                    ctx.streaming
                        .write(cursor, bytes)
                        .map_err(|e| TransferError::Recording(e.to_string()))?;
                    let binding = BufferBinding::new(Arc::clone(staging), cursor);
                    cursor = align_up(cursor + bytes.len() as u64, alignment);
                    (binding, flags)
                }
            };
            transfers.push(TransferRequest {
                memblock: request.destination.clone(),
                buffer,
                element_size: request.element_size,
                element_count: request.element_count,
                src_addresses_offset: INVALID_INDEX_OFFSET,
                dst_addresses_offset: INVALID_INDEX_OFFSET,
                flags,
            });
        }

        if let Some((addr, size)) = allocation {
            if ctx.streaming.needs_manual_flush_or_invalidate() {
                self.device
                    .flush_mapped_memory_ranges(&[ctx.streaming.mapped_range(addr, size)])
                    .map_err(|e| TransferError::Recording(e.to_string()))?;
            }
        }

        let addresses = BufferBinding::new(Arc::clone(staging), 0);
        self.transfer_properties(
            &mut *ctx.cmdbuf,
            ctx.fence,
            ctx.scratch,
            &addresses,
            &transfers,
            done,
            end,
        )
    }

    /// Submit the recorded work, wait for it and begin a fresh recording
    fn submit_and_restart<A: AddressAllocator>(
        &mut self,
        ctx: &mut UpstreamContext<'_, D, A>,
    ) -> bool {
        if let Err(err) = ctx.cmdbuf.end() {
            prism_error!(LogCategory::Transfer, "cannot end upstream command buffer: {}", err);
            return false;
        }

        let waits = std::mem::take(ctx.wait_semaphores);
        let submitted = {
            let mut submits = [SubmitInfo {
                wait_semaphores: &waits,
                command_buffers: vec![&mut *ctx.cmdbuf],
                signal_semaphores: &[],
            }];
            ctx.queue.submit(&mut submits, Some(ctx.fence))
        };
        if let Err(err) = submitted {
            prism_error!(LogCategory::Transfer, "upstream submission failed: {}", err);
            *ctx.wait_semaphores = waits;
            return false;
        }

        let fences = slice::from_ref(ctx.fence);
        self.device.wait_for_fences(fences);

        let reclaimed = ctx.streaming.cull_frees();
        self.descriptor_cache.poll_and_reclaim();
        self.device.reset_fences(fences);
        prism_trace!(
            LogCategory::Transfer,
            "upstream submission retired, {} staging bytes reclaimed",
            reclaimed
        );

        let restarted = ctx
            .cmdbuf
            .reset(CommandBufferResetFlags::RELEASE_RESOURCES)
            .and_then(|_| ctx.cmdbuf.begin(CommandBufferUsage::ONE_TIME_SUBMIT));
        if let Err(err) = restarted {
            prism_error!(LogCategory::Transfer, "cannot restart upstream recording: {}", err);
            return false;
        }
        true
    }
}

fn pass_dwords(pass: &[UpStreamingRequest<'_>]) -> u32 {
    pass.iter()
        .map(UpStreamingRequest::element_dwords)
        .max()
        .unwrap_or(0)
}
