//! Streaming transient data buffer
//!
//! A host-visible staging buffer carved up by an address allocator. Ranges
//! handed to the GPU are freed against a fence and only return to the
//! allocator once that fence has signaled.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use prism_core::{logging::LogCategory, prism_debug, prism_trace};
use smallvec::SmallVec;
use tracing::instrument;

use crate::alloc::{AddressAllocator, GeneralPurposeAddressAllocator, INVALID_ADDRESS};
use crate::buffer::{Buffer, BufferCreationParams, MappedMemoryRange};
use crate::device::LogicalDevice;
use crate::sync::{Fence, FenceStatus, FenceWatch};

#[derive(Debug)]
struct DeferredFree {
    watch: FenceWatch,
    ranges: SmallVec<[(u64, u64); 4]>,
}

#[derive(Debug)]
struct StreamingState<A> {
    allocator: A,
    deferred: VecDeque<DeferredFree>,
}

impl<A: AddressAllocator> StreamingState<A> {
    fn cull(&mut self) -> u64 {
        let mut reclaimed = 0;
        let mut i = 0;
        while i < self.deferred.len() {
            if self.deferred[i].watch.is_complete() {
                if let Some(entry) = self.deferred.remove(i) {
                    for (addr, size) in entry.ranges {
                        self.allocator.free_addr(addr, size);
                        reclaimed += size;
                    }
                }
            } else {
                i += 1;
            }
        }
        reclaimed
    }
}

/// Host-visible staging memory with fence-deferred reclamation
///
/// Internally locked: allocation, freeing and culling may happen from any
/// thread.
#[derive(Debug)]
pub struct StreamingTransientDataBuffer<A: AddressAllocator = GeneralPurposeAddressAllocator> {
    buffer: Arc<Buffer>,
    state: Mutex<StreamingState<A>>,
    freed: Condvar,
}

impl StreamingTransientDataBuffer<GeneralPurposeAddressAllocator> {
    /// Create a host-visible buffer of `size` bytes managed first-fit
    pub fn new<D: LogicalDevice>(
        device: &D,
        size: u64,
        coherent: bool,
        max_alignment: u64,
    ) -> Result<Self> {
        let params = BufferCreationParams::host_visible(size, coherent)
            .with_label("streaming transient data buffer");
        let buffer = device.create_buffer(params)?;
        Self::with_allocator(buffer, GeneralPurposeAddressAllocator::new(size, max_alignment))
    }
}

impl<A: AddressAllocator> StreamingTransientDataBuffer<A> {
    pub fn with_allocator(buffer: Arc<Buffer>, allocator: A) -> Result<Self> {
        if !buffer.memory().is_host_visible() {
            bail!("streaming buffer {} must be host visible", buffer.id());
        }
        if allocator.total_size() > buffer.size() {
            bail!(
                "allocator manages {} bytes but buffer {} holds {}",
                allocator.total_size(),
                buffer.id(),
                buffer.size()
            );
        }
        Ok(Self {
            buffer,
            state: Mutex::new(StreamingState {
                allocator,
                deferred: VecDeque::new(),
            }),
            freed: Condvar::new(),
        })
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Host writes must be flushed explicitly before the GPU reads them
    pub fn needs_manual_flush_or_invalidate(&self) -> bool {
        !self.buffer.memory().is_coherent()
    }

    /// Mapped range covering `[addr, addr+size)` of this buffer
    pub fn mapped_range(&self, addr: u64, size: u64) -> MappedMemoryRange {
        MappedMemoryRange {
            memory: Arc::clone(self.buffer.memory()),
            offset: self.buffer.memory_offset() + addr,
            size,
        }
    }

    /// Largest allocation that currently fits, after reclaiming finished frees
    pub fn max_size(&self) -> u64 {
        let mut state = self.state.lock();
        state.cull();
        state.allocator.max_size()
    }

    pub fn max_alignment(&self) -> u64 {
        self.state.lock().allocator.max_alignment()
    }

    pub fn pending_free_count(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Return every deferred range whose fence has signaled; yields reclaimed bytes
    pub fn cull_frees(&self) -> u64 {
        let reclaimed = self.state.lock().cull();
        if reclaimed > 0 {
            self.freed.notify_all();
        }
        reclaimed
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.buffer.write(addr, data)
    }

    /// Allocate every entry of `addrs` still holding `INVALID_ADDRESS`
    ///
    /// Blocks on the oldest deferred free until `deadline`. Returns the number
    /// of bytes left unallocated; on a non-zero return every allocation made
    /// by this call has been rolled back.
    #[instrument(skip_all, fields(count = sizes.len()))]
    pub fn multi_alloc(
        &self,
        deadline: Instant,
        addrs: &mut [u64],
        sizes: &[u64],
        alignments: &[u64],
    ) -> u64 {
        debug_assert_eq!(addrs.len(), sizes.len());
        debug_assert_eq!(addrs.len(), alignments.len());

        let mut made_here: SmallVec<[bool; 8]> = SmallVec::from_elem(false, addrs.len());
        let mut state = self.state.lock();

        loop {
            state.cull();
            let unallocated = Self::try_alloc(&mut state, addrs, sizes, alignments, &mut made_here);
            if unallocated == 0 {
                return 0;
            }

            if Instant::now() >= deadline || !self.wait_for_space(&mut state, deadline) {
                for (i, made) in made_here.iter().enumerate() {
                    if *made {
                        state.allocator.free_addr(addrs[i], sizes[i]);
                        addrs[i] = INVALID_ADDRESS;
                    }
                }
                let remaining: u64 = addrs
                    .iter()
                    .zip(sizes)
                    .filter(|(addr, _)| **addr == INVALID_ADDRESS)
                    .map(|(_, size)| *size)
                    .sum();
                prism_debug!(
                    LogCategory::Allocator,
                    "streaming allocation timed out with {} bytes unallocated",
                    remaining
                );
                return remaining;
            }
        }
    }

    fn try_alloc(
        state: &mut StreamingState<A>,
        addrs: &mut [u64],
        sizes: &[u64],
        alignments: &[u64],
        made_here: &mut [bool],
    ) -> u64 {
        let mut unallocated = 0;
        for i in 0..addrs.len() {
            if addrs[i] != INVALID_ADDRESS {
                continue;
            }
            let addr = state.allocator.alloc_addr(sizes[i], alignments[i]);
            if addr == INVALID_ADDRESS {
                unallocated += sizes[i];
            } else {
                addrs[i] = addr;
                made_here[i] = true;
            }
        }
        unallocated
    }

    /// Wait for the oldest deferred free, or for someone else's free
    fn wait_for_space(
        &self,
        state: &mut MutexGuard<'_, StreamingState<A>>,
        deadline: Instant,
    ) -> bool {
        match state.deferred.front().map(|entry| entry.watch.clone()) {
            Some(watch) => {
                prism_trace!(
                    LogCategory::Allocator,
                    "waiting on fence {} for staging space",
                    watch.fence().id()
                );
                let status = MutexGuard::unlocked(state, || watch.wait_until(deadline));
                status == FenceStatus::Success
                    || state.deferred.iter().any(|e| e.watch.is_complete())
            }
            None => !self.freed.wait_until(state, deadline).timed_out(),
        }
    }

    /// Free ranges now, or once `fence` signals
    pub fn multi_free(&self, addrs: &[u64], sizes: &[u64], fence: Option<Arc<Fence>>) {
        let ranges: SmallVec<[(u64, u64); 4]> = addrs
            .iter()
            .zip(sizes)
            .filter(|(addr, _)| **addr != INVALID_ADDRESS)
            .map(|(addr, size)| (*addr, *size))
            .collect();
        if ranges.is_empty() {
            return;
        }

        let mut state = self.state.lock();
        match fence {
            Some(fence) if !fence.is_signaled() => {
                state.deferred.push_back(DeferredFree {
                    watch: FenceWatch::new(fence),
                    ranges,
                });
            }
            _ => {
                for (addr, size) in ranges {
                    state.allocator.free_addr(addr, size);
                }
                drop(state);
                self.freed.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareDevice;
    use std::thread;
    use std::time::Duration;

    fn streaming(size: u64) -> StreamingTransientDataBuffer {
        let device = SoftwareDevice::new();
        StreamingTransientDataBuffer::new(&device, size, true, 256).unwrap()
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(5)
    }

    #[test]
    fn test_multi_alloc_skips_existing_addresses() {
        let stream = streaming(1024);
        let mut addrs = [INVALID_ADDRESS, 768, INVALID_ADDRESS];

        let left = stream.multi_alloc(soon(), &mut addrs, &[256, 256, 256], &[256, 256, 256]);

        assert_eq!(left, 0);
        assert_eq!(addrs, [0, 768, 256]);
    }

    #[test]
    fn test_timeout_rolls_back_partial_allocations() {
        let stream = streaming(1024);
        let mut addrs = [INVALID_ADDRESS, INVALID_ADDRESS];

        let left = stream.multi_alloc(soon(), &mut addrs, &[512, 1024], &[256, 256]);

        // the rolled-back 512 bytes count as unallocated too
        assert_eq!(left, 1536);
        assert_eq!(addrs, [INVALID_ADDRESS, INVALID_ADDRESS]);
        assert_eq!(stream.max_size(), 1024);
    }

    #[test]
    fn test_fenced_free_is_deferred_until_signal() {
        let stream = streaming(512);
        let fence = Arc::new(Fence::new(false));
        let mut addrs = [INVALID_ADDRESS];
        assert_eq!(stream.multi_alloc(soon(), &mut addrs, &[512], &[256]), 0);

        stream.multi_free(&addrs, &[512], Some(Arc::clone(&fence)));
        assert_eq!(stream.pending_free_count(), 1);
        assert_eq!(stream.max_size(), 0);

        fence.signal();
        assert_eq!(stream.cull_frees(), 512);
        assert_eq!(stream.max_size(), 512);
    }

    #[test]
    fn test_free_with_signaled_fence_is_immediate() {
        let stream = streaming(512);
        let mut addrs = [INVALID_ADDRESS];
        stream.multi_alloc(soon(), &mut addrs, &[100], &[4]);

        stream.multi_free(&addrs, &[100], Some(Arc::new(Fence::new(true))));
        assert_eq!(stream.pending_free_count(), 0);
        assert_eq!(stream.max_size(), 512);
    }

    #[test]
    fn test_alloc_waits_for_fence_signaled_elsewhere() {
        let stream = Arc::new(streaming(512));
        let fence = Arc::new(Fence::new(false));
        let mut first = [INVALID_ADDRESS];
        stream.multi_alloc(soon(), &mut first, &[512], &[256]);
        stream.multi_free(&first, &[512], Some(Arc::clone(&fence)));

        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            fence.signal();
        });

        let mut second = [INVALID_ADDRESS];
        let left = stream.multi_alloc(
            Instant::now() + Duration::from_secs(5),
            &mut second,
            &[256],
            &[256],
        );
        signaller.join().unwrap();

        assert_eq!(left, 0);
        assert_eq!(second, [0]);
    }
}
