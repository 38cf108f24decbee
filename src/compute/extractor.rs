//! Chunk-level facade over a compute backend and its buffer pool

use std::time::{Duration, Instant};

use glam::Vec3;

use crate::compute::backend::{BufferLayout, ComputeBackend, ExtractionJob, Ticket};
use crate::compute::density::{DensityParams, octave_offsets};
use crate::compute::pool::{DeviceBufferPool, PoolStats};
use crate::compute::GridDims;
use crate::config::{Config, NoiseSettings, WorldSettings};
use crate::core::Result;
use crate::terrain::{ChunkEntity, Triangle};

/// Buffer sets created up front per unit of the per-frame budget
pub const BUFFER_SETS_PER_FRAME_SLOT: usize = 3;

/// Outcome of an extraction request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extraction {
    /// The chunk already carries geometry; nothing was dispatched
    NoData,
    /// Work was queued; the result arrives from `poll` under this ticket
    Dispatched(Ticket),
}

/// Triangles (or the failure) of one finished extraction
#[derive(Debug)]
pub struct CompletedExtraction {
    pub ticket: Ticket,
    pub triangles: Result<Vec<Triangle>>,
}

pub struct DensityMeshExtractor<B: ComputeBackend> {
    backend: B,
    pool: DeviceBufferPool<B::Storage>,
    world: WorldSettings,
    noise: NoiseSettings,
    grid: GridDims,
    layout: BufferLayout,
    offsets: Vec<Vec3>,
    next_ticket: u64,
}

impl<B: ComputeBackend> DensityMeshExtractor<B> {
    pub fn new(backend: B, config: &Config) -> Self {
        let initial = config.streaming.max_chunks_per_frame as usize * BUFFER_SETS_PER_FRAME_SLOT;
        let grid = GridDims::from_world(&config.world);
        log::info!(
            "Extractor on {} backend: {} buffer sets, {} triangles per set",
            backend.name(),
            initial,
            grid.max_triangles()
        );

        Self {
            backend,
            pool: DeviceBufferPool::new(initial),
            world: config.world.clone(),
            noise: config.noise.clone(),
            grid,
            layout: BufferLayout::for_grid(grid),
            offsets: octave_offsets(config.noise.seed, config.noise.num_octaves),
            next_ticket: 0,
        }
    }

    /// Queue extraction of `chunk`'s surface.
    ///
    /// Returns [`Extraction::NoData`] without dispatching when the chunk is
    /// already generated and `force` is false.
    pub fn request(&mut self, chunk: &ChunkEntity, force: bool) -> Result<Extraction> {
        if chunk.is_generated() && !force {
            return Ok(Extraction::NoData);
        }

        let buffers = self.pool.acquire(&self.backend, &self.layout)?;
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;

        let job = ExtractionJob {
            ticket,
            grid: self.grid,
            params: DensityParams::new(chunk.origin(), &self.world, &self.noise),
            offsets: self.offsets.clone(),
        };
        log::trace!("Chunk {} -> ticket {:?} (buffer set {})", chunk.coord(), ticket, buffers.id());
        self.backend.dispatch(job, buffers);
        Ok(Extraction::Dispatched(ticket))
    }

    /// Collect finished extractions in arrival order, returning their buffers to the pool
    pub fn poll(&mut self) -> Result<Vec<CompletedExtraction>> {
        let readbacks = self.backend.poll()?;
        let mut completed = Vec::with_capacity(readbacks.len());
        for readback in readbacks {
            self.pool.release(readback.buffers);
            completed.push(CompletedExtraction {
                ticket: readback.ticket,
                triangles: readback.result,
            });
        }
        Ok(completed)
    }

    /// Apply new world and noise settings to subsequent requests.
    ///
    /// Pooled buffer sets are reallocated lazily if the grid size changed.
    pub fn update_settings(&mut self, world: &WorldSettings, noise: &NoiseSettings) {
        self.world = world.clone();
        self.noise = noise.clone();
        self.grid = GridDims::from_world(world);
        self.layout = BufferLayout::for_grid(self.grid);
        self.offsets = octave_offsets(noise.seed, noise.num_octaves);
    }

    /// Wait up to `timeout` for in-flight work, discarding its results.
    ///
    /// Returns the number of extractions drained.
    pub fn drain(&mut self, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut drained = 0;
        while self.backend.in_flight() > 0 && Instant::now() < deadline {
            drained += self.poll()?.len();
            std::thread::sleep(Duration::from_millis(1));
        }
        drained += self.poll()?.len();
        Ok(drained)
    }

    pub fn in_flight(&self) -> usize {
        self.backend.in_flight()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Release every pooled buffer set
    pub fn dispose(&mut self) {
        if self.backend.in_flight() > 0 {
            log::warn!("Disposing extractor with {} dispatches in flight", self.backend.in_flight());
        }
        self.pool.dispose_all();
    }
}
