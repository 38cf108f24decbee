//! Headless streaming demo: flies a viewpoint across the terrain and logs
//! pipeline statistics.
//!
//! Usage: cargo run --release -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>    JSON config file (default: built-in defaults)
//!   --frames <N>       Frames to simulate (default: 600)
//!   --backend <NAME>   `gpu` or `cpu` (default: gpu, falls back to cpu)
//!   --speed <UNITS>    Viewpoint speed in world units per second (default: 40)
//!   --threads <N>      CPU backend worker threads (default: 4)

use std::path::PathBuf;
use std::time::Duration;

use glam::Vec3;

use abyss::compute::{ComputeBackend, CpuBackend, GpuBackend};
use abyss::config::Config;
use abyss::core::time::FrameTimer;
use abyss::core::Result;
use abyss::streaming::{ChunkCoordinator, NullSink};

/// Simulated frame pacing
const FRAME_TIME: Duration = Duration::from_millis(16);

struct DemoOptions {
    frames: u64,
    speed: f32,
}

fn main() {
    abyss::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_str_arg(&args, "--config").map(PathBuf::from);
    let frames = parse_u64_arg(&args, "--frames").unwrap_or(600);
    let backend = parse_str_arg(&args, "--backend").unwrap_or_else(|| "gpu".to_string());
    let speed = parse_f32_arg(&args, "--speed").unwrap_or(40.0);
    let threads = parse_usize_arg(&args, "--threads").unwrap_or(4);

    let config = match config_path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    println!("=== Abyss Streaming Demo ===");
    println!("Backend: {}", backend);
    println!("Frames:  {}", frames);
    println!("Speed:   {} units/s", speed);
    println!(
        "Chunks:  {} units, {}x{}x{} cubes, render distance {}",
        config.world.chunk_size,
        config.world.num_cubes_xz,
        config.world.num_cubes_y,
        config.world.num_cubes_xz,
        config.streaming.render_distance
    );
    println!();

    let options = DemoOptions { frames, speed };
    let result = match backend.as_str() {
        "cpu" => CpuBackend::with_seed(config.noise.seed, threads).and_then(|b| run(b, config, &options)),
        "gpu" => match GpuBackend::new() {
            Ok(gpu) => run(gpu, config, &options),
            Err(e) => {
                log::warn!("GPU backend unavailable ({}), using CPU", e);
                CpuBackend::with_seed(config.noise.seed, threads).and_then(|b| run(b, config, &options))
            }
        },
        other => {
            log::error!("Unknown backend '{}', expected 'gpu' or 'cpu'", other);
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        log::error!("Streaming failed: {}", e);
        std::process::exit(1);
    }
}

fn run<B: ComputeBackend>(backend: B, config: Config, options: &DemoOptions) -> Result<()> {
    let altitude = config.world.surface_level();
    let mut coordinator = ChunkCoordinator::new(
        backend,
        config,
        Box::new(NullSink),
        Box::new(NullSink),
    )?;

    let mut timer = FrameTimer::new();
    let mut position = Vec3::new(0.0, altitude, 0.0);
    let mut last_report = 0;

    while timer.frame_count() < options.frames {
        timer.tick();
        // Fixed step keeps runs reproducible regardless of frame jitter
        position.x += options.speed * FRAME_TIME.as_secs_f32();
        coordinator.set_viewpoint(position);
        coordinator.update()?;

        if timer.frame_count() - last_report >= 60 {
            last_report = timer.frame_count();
            let stats = coordinator.stats();
            log::info!(
                "frame {} at {}: {} active, {} extracting, {} assembling, {} pooled, buffers {}/{} (peak {}), {:.0} fps, worst {:.1}ms",
                timer.frame_count(),
                coordinator.view_coord().map(|c| c.to_string()).unwrap_or_default(),
                stats.active,
                stats.extracting,
                stats.assembling,
                stats.pooled,
                stats.buffers.in_use,
                stats.buffers.total,
                stats.buffers.high_water,
                timer.fps(),
                timer.worst_frame_ms()
            );
        }
        std::thread::sleep(FRAME_TIME);
    }

    let stats = coordinator.stats();
    let triangles: usize = coordinator.active_chunks().map(|c| c.indices().len() / 3).sum();
    coordinator.shutdown()?;

    println!();
    println!("=== Done ===");
    println!("Activated:   {}", stats.activated_total);
    println!("Deactivated: {}", stats.deactivated_total);
    println!("Dispatched:  {}", stats.dispatched_total);
    println!("Active:      {} chunks, {} triangles", stats.active, triangles);
    println!("Buffer sets: {} (peak in use {})", stats.buffers.total, stats.buffers.high_water);
    println!("Slow frames: {} of {}", timer.over_budget(), timer.frame_count());
    Ok(())
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u64_arg(args: &[String], flag: &str) -> Option<u64> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
