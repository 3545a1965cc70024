//! Allocator Benchmark Suite
//!
//! Benchmarks the caching-allocator hot paths over the mock device, so the
//! numbers isolate bookkeeping cost from driver latency:
//! - cached reuse of a single size (the steady-state inference pattern)
//! - mixed-size churn across bins
//! - the pass-through allocator for comparison
//!
//! Run with: `cargo bench --bench allocator_bench`

use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memforge::{BFCachingAllocator, CacheAllocator, MockDevice, RawCachingAllocator};

const MIB: usize = 1 << 20;

// ============================================================================
// Benchmark Harness
// ============================================================================

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(100),
        }
    }

    fn run<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            iterations: self.iterations,
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    iterations: usize,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self) {
        let total: Duration = self.durations.iter().sum();
        let avg = total / self.iterations as u32;
        let min = *self.durations.iter().min().unwrap();
        let max = *self.durations.iter().max().unwrap();

        let mut sorted = self.durations.clone();
        sorted.sort();
        let p50 = sorted[sorted.len() / 2];
        let p99 = sorted[(sorted.len() * 99) / 100];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", self.iterations);
        println!("Average: {:?}", avg);
        println!("Min:     {:?}", min);
        println!("Max:     {:?}", max);
        println!("P50:     {:?}", p50);
        println!("P99:     {:?}", p99);
        let ops_per_sec = 1_000_000_000.0 / avg.as_nanos().max(1) as f64;
        println!("Throughput: {:.2} ops/sec", ops_per_sec);
    }
}

// ============================================================================
// Scenarios
// ============================================================================

fn bench_cached_reuse() {
    let dev = Arc::new(MockDevice::new());
    let bf = BFCachingAllocator::new(dev, 0);

    // Prime the cache so the measured loop never touches the device.
    drop(bf.allocate(MIB).unwrap());

    Benchmark::new("bf cached reuse (1 MiB)", 10_000)
        .run(|| {
            let handle = bf.allocate(MIB).unwrap();
            black_box(handle.ptr());
        })
        .report();
}

fn bench_mixed_sizes() {
    let dev = Arc::new(MockDevice::new());
    let bf = BFCachingAllocator::new(dev, 0);
    let sizes = [512usize, 4096, 64 * 1024, 512 * 1024, 2 * MIB];

    let mut i = 0;
    Benchmark::new("bf mixed-size churn", 10_000)
        .run(|| {
            let handle = bf.allocate(sizes[i % sizes.len()]).unwrap();
            i += 1;
            black_box(handle.ptr());
        })
        .report();
}

fn bench_batched_release() {
    let dev = Arc::new(MockDevice::new());
    let bf = BFCachingAllocator::new(dev, 0);

    Benchmark::new("bf allocate 16 / release 16", 1_000)
        .run(|| {
            let handles: Vec<_> = (0..16).map(|_| bf.allocate(256 * 1024).unwrap()).collect();
            black_box(handles.len())
        })
        .report();
}

fn bench_raw_passthrough() {
    let dev = Arc::new(MockDevice::new());
    let raw = RawCachingAllocator::new(dev, 0);

    Benchmark::new("raw pass-through (1 MiB)", 10_000)
        .run(|| {
            let handle = raw.allocate(MIB).unwrap();
            black_box(handle.ptr());
        })
        .report();
}

fn main() {
    println!("MemForge allocator benchmarks (mock device)");
    bench_cached_reuse();
    bench_mixed_sizes();
    bench_batched_release();
    bench_raw_passthrough();
}
