//! extalloc workload simulator
//!
//! Drives a seeded random allocate/release workload against an allocator
//! backed by a simulated medium, growing the medium whenever the allocator
//! reports a shortfall, and prints the final statistics as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use extalloc::{AllocatorConfig, ExtAllocError, ExternalAllocator, MAX_ALLOCATION_SIZE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "extalloc-sim")]
#[command(about = "Random workload simulator for the extalloc allocator")]
struct Args {
    /// Number of operations to run
    #[arg(short = 'n', long, default_value = "100000")]
    ops: usize,

    /// RNG seed
    #[arg(short = 's', long, default_value = "42")]
    seed: u64,

    /// Largest request size in bytes
    #[arg(short = 'm', long, default_value = "4194304")]
    max_size: u64,

    /// Probability that an operation releases a live block
    #[arg(short = 'r', long, default_value = "0.4")]
    release_ratio: f64,

    /// Allocator configuration (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

/// Stand-in for a file or device: only tracks its length
#[derive(Debug, Default)]
struct SimulatedMedium {
    len: u64,
    grow_calls: u64,
}

impl SimulatedMedium {
    fn grow(&mut self, offset: u64, len: u64) -> std::result::Result<(), ExtAllocError> {
        debug_assert_eq!(offset, self.len);
        self.len = offset + len;
        self.grow_calls += 1;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Report {
    ops: usize,
    allocations: u64,
    releases: u64,
    live_blocks: usize,
    medium_len: u64,
    grow_calls: u64,
    stats: extalloc::AllocationStats,
    utilization: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.max_size == 0 || args.max_size > MAX_ALLOCATION_SIZE {
        anyhow::bail!("--max-size must be between 1 and {}", MAX_ALLOCATION_SIZE);
    }
    if !(0.0..=1.0).contains(&args.release_ratio) {
        anyhow::bail!("--release-ratio must be within 0.0..=1.0");
    }

    let config = match &args.config {
        Some(path) => AllocatorConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => AllocatorConfig::default(),
    };

    let mut medium = SimulatedMedium {
        len: config.initial_capacity,
        grow_calls: 0,
    };
    let mut alloc = ExternalAllocator::with_config(config)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut live: Vec<(u64, u64)> = Vec::new();
    let (mut allocations, mut releases) = (0u64, 0u64);

    info!(
        "Running {} operations (seed {}, max size {})",
        args.ops, args.seed, args.max_size
    );

    for _ in 0..args.ops {
        if !live.is_empty() && rng.gen_bool(args.release_ratio) {
            let (offset, size) = live.swap_remove(rng.gen_range(0..live.len()));
            alloc.release(offset, size)?;
            releases += 1;
            continue;
        }

        // skew towards small requests the way real workloads do
        let size = if rng.gen_bool(0.9) {
            rng.gen_range(1..=args.max_size.min(64 * 1024))
        } else {
            rng.gen_range(1..=args.max_size)
        };

        let offset = alloc
            .allocate_or_grow(size, |offset, len| medium.grow(offset, len))
            .with_context(|| format!("allocation of {} bytes failed", size))?;
        live.push((offset, size));
        allocations += 1;
    }

    let stats = alloc.stats();
    info!(
        "Finished: {} live blocks, {} bytes live, capacity {}",
        live.len(),
        stats.allocated_bytes,
        stats.capacity
    );

    let report = Report {
        ops: args.ops,
        allocations,
        releases,
        live_blocks: live.len(),
        medium_len: medium.len,
        grow_calls: medium.grow_calls,
        utilization: stats.utilization(),
        stats,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
