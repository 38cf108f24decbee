//! Multi-threaded CPU device running both kernels on a rayon pool

use std::sync::Arc;

use glam::Vec3;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::sync::mpsc;

use crate::compute::backend::{BufferLayout, ComputeBackend, ExtractionJob, Readback};
use crate::compute::density::fill_densities;
use crate::compute::marching::march_into;
use crate::compute::noise::{NoiseSampler, PerlinSampler};
use crate::compute::pool::DeviceBufferSet;
use crate::core::{Error, Result};
use crate::terrain::Triangle;

/// Host-memory equivalent of a device buffer set
pub struct CpuStorage {
    densities: Vec<f32>,
    triangles: Vec<Triangle>,
    /// Append counter
    count: usize,
    offsets: Vec<Vec3>,
}

pub struct CpuBackend {
    sampler: Arc<dyn NoiseSampler>,
    pool: ThreadPool,
    result_tx: mpsc::UnboundedSender<Readback<CpuStorage>>,
    result_rx: mpsc::UnboundedReceiver<Readback<CpuStorage>>,
    in_flight: usize,
}

impl CpuBackend {
    /// Create a backend sampling `sampler` on `threads` workers (0 = one per core)
    pub fn new(sampler: Arc<dyn NoiseSampler>, threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("abyss-compute-{}", i))
            .build()
            .map_err(|e| Error::Compute(format!("Failed to build compute thread pool: {}", e)))?;
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        log::info!("CPU compute backend ready ({} threads)", pool.current_num_threads());
        Ok(Self {
            sampler,
            pool,
            result_tx,
            result_rx,
            in_flight: 0,
        })
    }

    /// Perlin-backed backend for the given noise seed
    pub fn with_seed(seed: i32, threads: usize) -> Result<Self> {
        Self::new(Arc::new(PerlinSampler::new(seed as u32)), threads)
    }
}

fn run_job(job: &ExtractionJob, sampler: &dyn NoiseSampler, buffers: &mut DeviceBufferSet<CpuStorage>) -> Result<Vec<Triangle>> {
    let storage = buffers
        .storage_mut()
        .ok_or_else(|| Error::Compute("buffer set dispatched before initialization".into()))?;
    if storage.densities.len() < job.grid.num_points() || storage.triangles.len() < job.grid.max_triangles() {
        return Err(Error::Compute("buffer set too small for grid".into()));
    }

    let octaves = job.offsets.len().min(storage.offsets.len());
    storage.offsets[..octaves].copy_from_slice(&job.offsets[..octaves]);
    storage.count = 0;

    fill_densities(&job.params, &storage.offsets[..octaves], sampler, job.grid, &mut storage.densities);
    storage.count = march_into(&job.params, job.grid, &storage.densities, &mut storage.triangles);

    // Read back exactly the appended triangles; the set returns to the pool
    Ok(storage.triangles[..storage.count].to_vec())
}

impl ComputeBackend for CpuBackend {
    type Storage = CpuStorage;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn allocate(&self, layout: &BufferLayout) -> Result<CpuStorage> {
        Ok(CpuStorage {
            densities: vec![0.0; layout.num_points],
            triangles: vec![Triangle::default(); layout.max_triangles],
            count: 0,
            offsets: vec![Vec3::ZERO; layout.max_octaves],
        })
    }

    fn dispatch(&mut self, job: ExtractionJob, mut buffers: DeviceBufferSet<CpuStorage>) {
        self.in_flight += 1;
        let sampler = Arc::clone(&self.sampler);
        let tx = self.result_tx.clone();

        self.pool.spawn(move || {
            let result = run_job(&job, sampler.as_ref(), &mut buffers);
            if let Ok(tris) = &result {
                log::trace!("Ticket {:?}: {} triangles", job.ticket, tris.len());
            }
            // Receiver gone means the backend was dropped
            let _ = tx.send(Readback { ticket: job.ticket, result, buffers });
        });
    }

    fn poll(&mut self) -> Result<Vec<Readback<CpuStorage>>> {
        let mut done = Vec::new();
        while let Ok(readback) = self.result_rx.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            done.push(readback);
        }
        Ok(done)
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::density::{DensityParams, octave_offsets};
    use crate::compute::pool::DeviceBufferPool;
    use crate::compute::{GridDims, backend::Ticket};
    use crate::config::{NoiseSettings, WorldSettings};
    use std::time::{Duration, Instant};

    fn wait_for(backend: &mut CpuBackend, count: usize) -> Vec<Readback<CpuStorage>> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut done = Vec::new();
        while done.len() < count && Instant::now() < deadline {
            done.extend(backend.poll().unwrap());
            std::thread::sleep(Duration::from_millis(1));
        }
        done
    }

    #[test]
    fn test_dispatch_round_trip() {
        let world = WorldSettings {
            chunk_size: 8.0,
            num_cubes_xz: 8,
            num_cubes_y: 16,
            ..Default::default()
        };
        let noise = NoiseSettings::default();
        let grid = GridDims::from_world(&world);
        let layout = BufferLayout::for_grid(grid);

        let mut backend = CpuBackend::with_seed(noise.seed, 2).unwrap();
        let mut pool = DeviceBufferPool::new(1);
        let buffers = pool.acquire(&backend, &layout).unwrap();

        let job = ExtractionJob {
            ticket: Ticket(7),
            grid,
            params: DensityParams::new(Vec3::ZERO, &world, &noise),
            offsets: octave_offsets(noise.seed, noise.num_octaves),
        };
        backend.dispatch(job, buffers);
        assert_eq!(backend.in_flight(), 1);

        let mut done = wait_for(&mut backend, 1);
        assert_eq!(done.len(), 1);
        assert_eq!(backend.in_flight(), 0);

        let readback = done.pop().unwrap();
        assert_eq!(readback.ticket, Ticket(7));
        // Hard floor and ceiling guarantee a surface somewhere in the column
        let tris = readback.result.unwrap();
        assert!(!tris.is_empty());
        assert!(tris.len() <= layout.max_triangles);
        pool.release(readback.buffers);
    }

    #[test]
    fn test_uninitialized_set_reports_error() {
        let world = WorldSettings {
            num_cubes_xz: 2,
            num_cubes_y: 2,
            ..Default::default()
        };
        let noise = NoiseSettings::default();
        let mut backend = CpuBackend::with_seed(0, 1).unwrap();
        let mut pool: DeviceBufferPool<CpuStorage> = DeviceBufferPool::new(1);
        let mut buffers = pool.acquire(&backend, &BufferLayout::for_grid(GridDims::from_world(&world))).unwrap();
        buffers.release();

        let job = ExtractionJob {
            ticket: Ticket(1),
            grid: GridDims::from_world(&world),
            params: DensityParams::new(Vec3::ZERO, &world, &noise),
            offsets: Vec::new(),
        };
        backend.dispatch(job, buffers);

        let done = wait_for(&mut backend, 1);
        assert!(matches!(done[0].result, Err(Error::Compute(_))));
    }
}
