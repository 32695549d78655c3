// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Samples a synthetic workload through the global allocator shim and
//! prints the live heap estimate next to the true retained size.
//!
//! ```text
//! cargo run --release --example sampling_report
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use libdd_heap_sampler::{AllocationSampler, AllocatorType, SamplesObserver, SamplingAllocator};
use parking_lot::Mutex;

#[global_allocator]
static ALLOC: SamplingAllocator<std::alloc::System> =
    SamplingAllocator::new(std::alloc::System);

struct Sample {
    size: usize,
    total_allocated: usize,
}

#[derive(Default)]
struct LiveSamples {
    live: Mutex<BTreeMap<usize, Sample>>,
}

impl SamplesObserver for LiveSamples {
    fn sample_added(
        &self,
        address: usize,
        size: usize,
        total_allocated: usize,
        _allocator_type: AllocatorType,
        _context: Option<&'static str>,
    ) {
        self.live.lock().insert(
            address,
            Sample {
                size,
                total_allocated,
            },
        );
    }

    fn sample_removed(&self, address: usize) {
        self.live.lock().remove(&address);
    }
}

fn main() {
    let sampler = AllocationSampler::get();
    sampler.set_sampling_interval(16 * 1024);

    let observer = Arc::new(LiveSamples::default());
    sampler.add_samples_observer(observer.clone());

    // Allocate 256 buffers between 1 KiB and 64 KiB and keep every other
    // one alive; the dropped half must disappear from the live samples.
    let mut retained = Vec::new();
    let mut retained_bytes = 0usize;
    for i in 0..256 {
        let size = 1024 * (1 + i % 64);
        let buffer = vec![0u8; size];
        if i % 2 == 0 {
            retained_bytes += size;
            retained.push(buffer);
        }
    }

    // Stop sampling before reading the results so the printing below does
    // not race with our own callbacks.
    let as_dyn: Arc<dyn SamplesObserver> = observer.clone();
    sampler.remove_samples_observer(&as_dyn);

    let live = observer.live.lock();
    let estimated: usize = live.values().map(|sample| sample.total_allocated).sum();

    println!(
        "workload retained {} buffers totalling {} bytes",
        retained.len(),
        retained_bytes
    );
    println!(
        "sampler holds {} live samples estimating {} bytes ({:+.1}% off)",
        live.len(),
        estimated,
        100.0 * (estimated as f64 - retained_bytes as f64) / retained_bytes as f64,
    );
    println!("largest live samples:");
    let mut largest: Vec<_> = live.iter().collect();
    largest.sort_by(|a, b| b.1.total_allocated.cmp(&a.1.total_allocated));
    for (address, sample) in largest.into_iter().take(8) {
        println!(
            "  {address:#x}  {} bytes allocated, weighted {}",
            sample.size, sample.total_allocated
        );
    }
}
