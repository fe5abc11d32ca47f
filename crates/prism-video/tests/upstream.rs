//! Streaming host and device data into property pools

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use prism_core::config::TransferConfig;
use prism_video::{
    BufferBinding, BufferCreationParams, CommandBuffer, CommandBufferState, CommandBufferUsage,
    DeviceLimits, Fence,
    LogicalDevice, PipelineStageFlags, PropertyPoolHandler, QueueMode, RecordedCommand,
    SoftwareCommandBuffer, SoftwareDevice, SoftwareQueue, StreamingTransientDataBuffer,
    UpStreamingRequest, WaitSemaphore, WaitSemaphores, INVALID_ADDRESS,
};

struct Harness {
    device: Arc<SoftwareDevice>,
    queue: Arc<SoftwareQueue>,
    handler: PropertyPoolHandler<SoftwareDevice>,
    streaming: StreamingTransientDataBuffer,
    scratch: BufferBinding,
    fence: Arc<Fence>,
    cmdbuf: SoftwareCommandBuffer,
}

impl Harness {
    fn new(storage_buffers: u32, staging_size: u64, coherent: bool) -> Self {
        Self::with_mode(storage_buffers, staging_size, coherent, QueueMode::Immediate)
    }

    fn with_mode(storage_buffers: u32, staging_size: u64, coherent: bool, mode: QueueMode) -> Self {
        let limits = DeviceLimits::default().with_max_per_stage_storage_buffers(storage_buffers);
        let device = Arc::new(SoftwareDevice::with_limits(limits));
        let handler =
            PropertyPoolHandler::with_config(Arc::clone(&device), &TransferConfig::default())
                .unwrap();
        let streaming = StreamingTransientDataBuffer::new(
            device.as_ref(),
            staging_size,
            coherent,
            u64::from(handler.alignment()),
        )
        .unwrap();
        let scratch = buffer(&device, handler.max_scratch_size());
        let mut cmdbuf = device.create_command_buffer(0).unwrap();
        cmdbuf.begin(CommandBufferUsage::ONE_TIME_SUBMIT).unwrap();
        Self {
            queue: Arc::new(device.queue(0, mode)),
            fence: device.create_fence(false),
            device,
            handler,
            streaming,
            scratch,
            cmdbuf,
        }
    }

    fn upstream(
        &mut self,
        requests: &mut [UpStreamingRequest<'_>],
        waits: &mut WaitSemaphores,
        deadline: Instant,
    ) -> u32 {
        self.handler.upstream_properties(
            &self.streaming,
            &mut self.cmdbuf,
            &self.fence,
            self.queue.as_ref(),
            &self.scratch,
            requests,
            waits,
            deadline,
        )
    }

    fn finish(&mut self) {
        use prism_video::{Queue, SubmitInfo};

        self.cmdbuf.end().unwrap();
        self.queue
            .submit(
                &mut [SubmitInfo::new(vec![&mut self.cmdbuf])],
                Some(&self.fence),
            )
            .unwrap();
    }

    fn dispatches(&self) -> usize {
        self.cmdbuf
            .commands()
            .iter()
            .filter(|c| matches!(c, RecordedCommand::Dispatch { .. }))
            .count()
    }
}

fn buffer(device: &SoftwareDevice, size: u64) -> BufferBinding {
    let buffer = device
        .create_buffer(BufferCreationParams::device_local(size))
        .unwrap();
    BufferBinding::new(buffer, 0)
}

fn words(binding: &BufferBinding, count: usize) -> Vec<u32> {
    binding
        .buffer
        .read(binding.offset, count as u64 * 4)
        .unwrap()
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

fn soon() -> Instant {
    Instant::now() + Duration::from_millis(20)
}

#[test]
fn test_host_round_trip() {
    let mut h = Harness::new(8, 4096, true);
    let positions: Vec<u32> = (0..64).collect();
    let pairs: Vec<u32> = (500..520).collect();
    let flag = [0xdead_beefu32];
    let (dst_positions, dst_pairs, dst_flags) = (
        buffer(&h.device, 256),
        buffer(&h.device, 80),
        buffer(&h.device, 128),
    );
    let mut requests = [
        UpStreamingRequest::from_host(
            dst_positions.clone(),
            bytemuck::cast_slice(&positions),
            4,
            64,
        ),
        UpStreamingRequest::from_host(dst_pairs.clone(), bytemuck::cast_slice(&pairs), 8, 10),
        UpStreamingRequest::from_host(dst_flags.clone(), bytemuck::cast_slice(&flag), 4, 32)
            .filled(),
    ];

    let left = h.upstream(&mut requests, &mut WaitSemaphores::new(), soon());
    assert_eq!(left, 0);
    // everything fit in one staging allocation and one pass
    assert_eq!(h.dispatches(), 1);
    assert_eq!(h.queue.submission_count(), 0);
    assert_eq!(h.streaming.pending_free_count(), 1);

    h.finish();
    assert_eq!(words(&dst_positions, 64), positions);
    assert_eq!(words(&dst_pairs, 20), pairs);
    assert_eq!(words(&dst_flags, 32), vec![0xdead_beefu32; 32]);

    assert_eq!(h.streaming.cull_frees(), 340 + 765);
    assert_eq!(h.streaming.pending_free_count(), 0);
    assert_eq!(h.streaming.max_size(), 4096);
}

#[test]
fn test_requests_are_sorted_by_size() {
    let mut h = Harness::new(8, 4096, true);
    let big = vec![1u32; 32];
    let small = vec![2u32; 4];
    let mut requests = [
        UpStreamingRequest::from_host(buffer(&h.device, 128), bytemuck::cast_slice(&big), 4, 32),
        UpStreamingRequest::from_host(buffer(&h.device, 16), bytemuck::cast_slice(&small), 4, 4),
    ];

    h.upstream(&mut requests, &mut WaitSemaphores::new(), soon());

    let sizes: Vec<u32> = requests.iter().map(|r| r.element_dwords()).collect();
    assert_eq!(sizes, vec![4, 32]);
}

#[test]
fn test_small_staging_submits_mid_upload() {
    let mut h = Harness::new(8, 1024, false);
    let data: Vec<u32> = (0..256).map(|i| i * 7 + 1).collect();
    let dst = buffer(&h.device, 1024);
    let mut requests = [UpStreamingRequest::from_host(
        dst.clone(),
        bytemuck::cast_slice(&data),
        4,
        256,
    )];
    let mut waits = vec![WaitSemaphore {
        semaphore: h.device.create_semaphore(),
        stages: PipelineStageFlags::COMPUTE_SHADER,
    }];

    let left = h.upstream(&mut requests, &mut waits, soon());

    assert_eq!(left, 0);
    assert_eq!(h.queue.submission_count(), 1);
    assert!(waits.is_empty());
    // the first 192 dwords went out with the forced submission
    assert_eq!(words(&dst, 192), data[..192].to_vec());
    assert_eq!(words(&dst, 256)[192..].to_vec(), vec![0u32; 64]);
    assert_eq!(h.dispatches(), 1);
    assert!(h.device.stats().flushed_ranges() >= 2);

    h.finish();
    assert_eq!(words(&dst, 256), data);
}

#[test]
fn test_mid_upload_submission_waits_for_deferred_completion() {
    let mut h = Harness::with_mode(8, 1024, false, QueueMode::Deferred);
    let data: Vec<u32> = (0..256).map(|i| i * 3 + 2).collect();
    let dst = buffer(&h.device, 1024);
    let mut requests = [UpStreamingRequest::from_host(
        dst.clone(),
        bytemuck::cast_slice(&data),
        4,
        256,
    )];

    let stop = Arc::new(AtomicBool::new(false));
    let completer = {
        let (queue, stop) = (Arc::clone(&h.queue), Arc::clone(&stop));
        thread::spawn(move || {
            let mut completed = 0;
            while !stop.load(Ordering::Acquire) {
                completed += queue.complete_pending().unwrap();
                thread::sleep(Duration::from_millis(1));
            }
            completed
        })
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    let left = h.upstream(&mut requests, &mut WaitSemaphores::new(), deadline);
    stop.store(true, Ordering::Release);
    let completed = completer.join().unwrap();

    assert_eq!(left, 0);
    assert_eq!(completed, 1);
    assert_eq!(h.queue.submission_count(), 1);
    // the forced submission retired and recording restarted
    assert_eq!(h.cmdbuf.state(), CommandBufferState::Recording);
    assert!(!h.fence.is_signaled());
    assert_eq!(words(&dst, 192), data[..192].to_vec());

    h.finish();
    assert_eq!(h.queue.complete_pending().unwrap(), 1);
    assert_eq!(words(&dst, 256), data);
}

#[test]
fn test_empty_upload_is_a_no_op() {
    let mut h = Harness::new(8, 1024, true);
    let left = h.upstream(&mut [], &mut WaitSemaphores::new(), soon());
    assert_eq!(left, 0);
    assert_eq!(h.dispatches(), 0);
    assert_eq!(h.queue.submission_count(), 0);
}

#[test]
fn test_device_sources_skip_staging() {
    let mut h = Harness::new(8, 1024, true);
    let src = buffer(&h.device, 128);
    let values: Vec<u32> = (0..32).map(|i| i ^ 0x55).collect();
    src.buffer.write(0, bytemuck::cast_slice(&values)).unwrap();
    let fill_src = buffer(&h.device, 8);
    fill_src.buffer.write(0, bytemuck::cast_slice(&[3u32, 4])).unwrap();
    let (dst, dst_fill) = (buffer(&h.device, 128), buffer(&h.device, 64));
    let mut requests = [
        UpStreamingRequest::from_device(dst.clone(), src, 4, 32),
        UpStreamingRequest::from_device(dst_fill.clone(), fill_src, 8, 8).filled(),
    ];

    assert_eq!(h.upstream(&mut requests, &mut WaitSemaphores::new(), soon()), 0);
    assert_eq!(h.streaming.pending_free_count(), 0);
    assert_eq!(h.streaming.max_size(), 1024);

    h.finish();
    assert_eq!(words(&dst, 32), values);
    assert_eq!(words(&dst_fill, 16), [3u32, 4].repeat(8));
}

#[test]
fn test_padding_larger_than_staging_makes_no_progress() {
    // 12 storage bindings allow 5 properties per pass, whose worst-case
    // alignment padding alone exceeds the 1024 byte staging buffer
    let mut h = Harness::new(12, 1024, true);
    assert_eq!(h.handler.max_properties_per_transfer_dispatch(), 5);
    let data = vec![9u32; 16];
    let destinations: Vec<BufferBinding> = (0..5).map(|_| buffer(&h.device, 64)).collect();
    let mut requests: Vec<UpStreamingRequest<'_>> = destinations
        .iter()
        .map(|dst| UpStreamingRequest::from_host(dst.clone(), bytemuck::cast_slice(&data), 4, 16))
        .collect();

    let left = h.upstream(&mut requests, &mut WaitSemaphores::new(), soon());

    assert_eq!(left, 16);
    assert_eq!(h.dispatches(), 0);
    for dst in &destinations {
        assert_eq!(words(dst, 16), vec![0u32; 16]);
    }
}

#[test]
fn test_exhausted_staging_times_out_without_writes() {
    let mut h = Harness::new(8, 1024, true);
    let held_by = h.device.create_fence(false);
    let mut addr = [INVALID_ADDRESS];
    assert_eq!(h.streaming.multi_alloc(soon(), &mut addr, &[1024], &[256]), 0);
    h.streaming.multi_free(&addr, &[1024], Some(Arc::clone(&held_by)));

    let data = vec![5u32; 8];
    let dst = buffer(&h.device, 32);
    let mut requests = [UpStreamingRequest::from_host(
        dst.clone(),
        bytemuck::cast_slice(&data),
        4,
        8,
    )];

    let started = Instant::now();
    let left = h.upstream(&mut requests, &mut WaitSemaphores::new(), soon());

    assert_eq!(left, 8);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(words(&dst, 8), vec![0u32; 8]);

    held_by.signal();
    assert_eq!(h.streaming.cull_frees(), 1024);
}

#[test]
fn test_stalled_pass_skips_the_rest() {
    let mut h = Harness::new(8, 1024, true);
    let small = vec![1u32; 4];
    let medium = vec![2u32; 8];
    let large = vec![3u32; 16];
    let firsts: Vec<BufferBinding> = (0..3).map(|_| buffer(&h.device, 16)).collect();
    let seconds = [buffer(&h.device, 32), buffer(&h.device, 32), buffer(&h.device, 8)];
    let last = buffer(&h.device, 64);
    let mut requests: Vec<UpStreamingRequest<'_>> = firsts
        .iter()
        .map(|dst| UpStreamingRequest::from_host(dst.clone(), bytemuck::cast_slice(&small), 4, 4))
        .chain(seconds.iter().map(|dst| {
            UpStreamingRequest::from_host(dst.clone(), bytemuck::cast_slice(&medium), 4, 8)
        }))
        .chain(std::iter::once(UpStreamingRequest::from_host(
            last.clone(),
            bytemuck::cast_slice(&large),
            4,
            16,
        )))
        .collect();

    // the second pass can never bind its undersized destination, so the
    // third pass is not attempted
    let left = h.upstream(&mut requests, &mut WaitSemaphores::new(), soon());

    assert_eq!(left, 8 + 16);
    assert_eq!(h.queue.submission_count(), 1);
    for dst in &firsts {
        assert_eq!(words(dst, 4), small);
    }
    assert_eq!(words(&seconds[0], 8), vec![0u32; 8]);
    assert_eq!(words(&last, 16), vec![0u32; 16]);
}

#[test]
fn test_invalid_request_is_rejected_whole() {
    let mut h = Harness::new(8, 1024, true);
    let short = vec![1u32; 2];
    let mut requests = [
        UpStreamingRequest::from_host(buffer(&h.device, 16), bytemuck::cast_slice(&short), 4, 4),
        UpStreamingRequest::from_device(buffer(&h.device, 24), buffer(&h.device, 24), 6, 4),
    ];

    let left = h.upstream(&mut requests, &mut WaitSemaphores::new(), soon());

    assert_eq!(left, 4 + 4);
    assert!(h.cmdbuf.commands().is_empty());
}

#[test]
fn test_index_lists_are_ignored() {
    let mut h = Harness::new(8, 1024, true);
    let data = [10u32, 20, 30];
    let scatter = [2u32, 0, 1];
    let dst = buffer(&h.device, 12);
    let mut request =
        UpStreamingRequest::from_host(dst.clone(), bytemuck::cast_slice(&data), 4, 3);
    request.dst_addresses = Some(&scatter);

    assert_eq!(
        h.upstream(&mut [request], &mut WaitSemaphores::new(), soon()),
        0
    );
    h.finish();
    assert_eq!(words(&dst, 3), data.to_vec());
}
