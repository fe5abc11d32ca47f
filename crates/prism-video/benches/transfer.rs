// Benchmarks for property pool transfers on the software backend

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use prism_video::{
    AddressAllocator, BufferBinding, BufferCreationParams, CommandBuffer, CommandBufferUsage,
    GeneralPurposeAddressAllocator, LogicalDevice, PropertyPoolHandler, Queue, QueueMode,
    SoftwareDevice, StreamingTransientDataBuffer, SubmitInfo, TransferRequest, UpStreamingRequest,
    WaitSemaphores,
};

fn device_buffer(device: &SoftwareDevice, size: u64) -> BufferBinding {
    let buffer = device
        .create_buffer(BufferCreationParams::device_local(size))
        .unwrap();
    BufferBinding::new(buffer, 0)
}

fn bench_transfer_properties(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer_properties");
    for &properties in &[1usize, 3, 12] {
        let device = Arc::new(SoftwareDevice::new());
        let queue = device.queue(0, QueueMode::Immediate);
        let mut handler = PropertyPoolHandler::new(Arc::clone(&device)).unwrap();
        let scratch = device_buffer(&device, handler.max_scratch_size());
        let addresses = device_buffer(&device, 16);
        let fence = device.create_fence(false);
        let requests: Vec<TransferRequest> = (0..properties)
            .map(|_| {
                TransferRequest::upload(
                    device_buffer(&device, 4096),
                    device_buffer(&device, 4096),
                    16,
                    256,
                )
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(properties), &requests, |b, requests| {
            b.iter(|| {
                let mut cmdbuf = device.create_command_buffer(0).unwrap();
                cmdbuf.begin(CommandBufferUsage::ONE_TIME_SUBMIT).unwrap();
                handler
                    .transfer_properties(
                        &mut cmdbuf,
                        &fence,
                        &scratch,
                        &addresses,
                        requests,
                        0,
                        u32::MAX,
                    )
                    .unwrap();
                cmdbuf.end().unwrap();
                queue
                    .submit(&mut [SubmitInfo::new(vec![&mut cmdbuf])], Some(&fence))
                    .unwrap();
                device.reset_fences(std::slice::from_ref(&fence));
                black_box(cmdbuf);
            })
        });
    }
    group.finish();
}

fn bench_upstream_host(c: &mut Criterion) {
    let device = Arc::new(SoftwareDevice::new());
    let queue = device.queue(0, QueueMode::Immediate);
    let mut handler = PropertyPoolHandler::new(Arc::clone(&device)).unwrap();
    let alignment = u64::from(handler.alignment());
    let streaming =
        StreamingTransientDataBuffer::new(device.as_ref(), 1 << 16, true, alignment).unwrap();
    let scratch = device_buffer(&device, handler.max_scratch_size());
    let fence = device.create_fence(false);
    let data: Vec<u32> = (0..4096).collect();
    let destination = device_buffer(&device, 4 * 4096);

    c.bench_function("upstream_host_16k", |b| {
        b.iter(|| {
            let mut cmdbuf = device.create_command_buffer(0).unwrap();
            cmdbuf.begin(CommandBufferUsage::ONE_TIME_SUBMIT).unwrap();
            let mut requests = [UpStreamingRequest::from_host(
                destination.clone(),
                bytemuck::cast_slice(&data),
                4,
                4096,
            )];
            let left = handler.upstream_properties(
                &streaming,
                &mut cmdbuf,
                &fence,
                &queue,
                &scratch,
                &mut requests,
                &mut WaitSemaphores::new(),
                Instant::now() + Duration::from_millis(50),
            );
            cmdbuf.end().unwrap();
            queue
                .submit(&mut [SubmitInfo::new(vec![&mut cmdbuf])], Some(&fence))
                .unwrap();
            streaming.cull_frees();
            device.reset_fences(std::slice::from_ref(&fence));
            black_box(left);
        })
    });
}

fn bench_general_purpose_allocator(c: &mut Criterion) {
    c.bench_function("general_purpose_alloc_free", |b| {
        b.iter(|| {
            let mut allocator = GeneralPurposeAddressAllocator::new(1 << 20, 256);
            let addrs: Vec<u64> = (1..=64u64)
                .map(|i| allocator.alloc_addr(i * 48, 256))
                .collect();
            for (i, addr) in addrs.iter().enumerate().step_by(2) {
                allocator.free_addr(*addr, (i as u64 + 1) * 48);
            }
            black_box(allocator.max_size());
        })
    });
}

criterion_group!(
    benches,
    bench_transfer_properties,
    bench_upstream_host,
    bench_general_purpose_allocator
);
criterion_main!(benches);
