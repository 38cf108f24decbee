//! Frame-driven chunk streaming around a moving viewpoint
//!
//! A background discovery task diffs the view footprint against the active
//! set and queues coordinates. Each [`ChunkCoordinator::update`] then drains
//! those queues in four budgeted stages:
//!
//! 1. all pending deactivations
//! 2. up to `max_chunks_per_frame` activations (extraction requests)
//! 3. up to `max_chunks_per_frame` finished extractions (spawn mesh assembly)
//! 4. up to `max_chunks_per_frame` finished assemblies (attach and activate)

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use glam::{IVec2, Vec3};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::compute::backend::{ComputeBackend, Ticket};
use crate::compute::extractor::{CompletedExtraction, DensityMeshExtractor, Extraction};
use crate::compute::pool::PoolStats;
use crate::config::{Config, NoiseSettings, WorldSettings};
use crate::core::{Error, Result};
use crate::streaming::active::{ActiveSet, ChunkPool};
use crate::streaming::discovery::{DiscoveryLoop, ViewState, is_retained};
use crate::streaming::sink::{MeshSink, ResourcePlacer};
use crate::streaming::CancelToken;
use crate::terrain::{ChunkCoord, ChunkEntity, ChunkState, MeshAssembler, MeshData};

/// Longest wait for in-flight device work at shutdown
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot of the streaming pipeline
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamingStats {
    pub active: usize,
    pub pooled: usize,
    /// Extractions dispatched but not yet read back
    pub extracting: usize,
    /// Read back and waiting for or undergoing mesh assembly
    pub assembling: usize,
    pub activated_total: u64,
    pub deactivated_total: u64,
    /// Extractions sent to the device; cached geometry does not count
    pub dispatched_total: u64,
    pub duplicates_rejected: u64,
    pub buffers: PoolStats,
}

struct AssemblyTask {
    chunk: ChunkEntity,
    epoch: u64,
    handle: JoinHandle<Result<MeshData>>,
}

pub struct ChunkCoordinator<B: ComputeBackend> {
    config: Config,
    runtime: Runtime,
    extractor: DensityMeshExtractor<B>,
    active: ActiveSet,
    pool: ChunkPool,

    /// Chunks whose extraction is in flight, by ticket
    activating: HashMap<Ticket, ChunkEntity>,
    /// Coordinates currently extracting or assembling
    in_flight: HashSet<ChunkCoord>,
    /// Tickets issued before the last reconfigure
    stale: HashSet<Ticket>,
    completed: VecDeque<CompletedExtraction>,
    assembling: VecDeque<AssemblyTask>,

    activate_tx: mpsc::UnboundedSender<ChunkCoord>,
    activate_rx: mpsc::UnboundedReceiver<ChunkCoord>,
    deactivate_rx: mpsc::UnboundedReceiver<ChunkCoord>,
    view_tx: watch::Sender<Option<ViewState>>,
    view: Option<ViewState>,
    epoch: u64,
    fixed_map: Option<IVec2>,
    active_snapshot: Arc<RwLock<HashSet<ChunkCoord>>>,
    snapshot_dirty: bool,

    cancel: CancelToken,
    discovery: Option<JoinHandle<()>>,
    mesh_sink: Box<dyn MeshSink>,
    placer: Box<dyn ResourcePlacer>,

    activated_total: u64,
    deactivated_total: u64,
    dispatched_total: u64,
    duplicates_rejected: u64,
    shut_down: bool,
}

impl<B: ComputeBackend> ChunkCoordinator<B> {
    /// Start streaming with the given device and collaborators.
    ///
    /// Nothing is activated until a viewpoint is set or a fixed map requested.
    pub fn new(
        backend: B,
        config: Config,
        mesh_sink: Box<dyn MeshSink>,
        placer: Box<dyn ResourcePlacer>,
    ) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("abyss-streaming")
            .enable_time()
            .build()
            .map_err(|e| Error::Streaming(format!("Failed to create tokio runtime: {}", e)))?;

        let (activate_tx, activate_rx) = mpsc::unbounded_channel();
        let (deactivate_tx, deactivate_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(None);
        let active_snapshot = Arc::new(RwLock::new(HashSet::new()));
        let cancel = CancelToken::new();

        let discovery = DiscoveryLoop::new(
            view_rx,
            Arc::clone(&active_snapshot),
            activate_tx.clone(),
            deactivate_tx,
            config.streaming.render_distance,
            Duration::from_millis(config.streaming.discovery_interval_ms),
            cancel.clone(),
        );
        let discovery = runtime.spawn(discovery.run());

        let mut pool = ChunkPool::new();
        pool.prewarm(config.streaming.prewarm_count(), &config.world);

        log::info!(
            "Chunk streaming started: render distance {}, {} chunks per frame, {} pooled",
            config.streaming.render_distance,
            config.streaming.max_chunks_per_frame,
            pool.len()
        );

        Ok(Self {
            extractor: DensityMeshExtractor::new(backend, &config),
            config,
            runtime,
            active: ActiveSet::new(),
            pool,
            activating: HashMap::new(),
            in_flight: HashSet::new(),
            stale: HashSet::new(),
            completed: VecDeque::new(),
            assembling: VecDeque::new(),
            activate_tx,
            activate_rx,
            deactivate_rx,
            view_tx,
            view: None,
            epoch: 0,
            fixed_map: None,
            active_snapshot,
            snapshot_dirty: false,
            cancel,
            discovery: Some(discovery),
            mesh_sink,
            placer,
            activated_total: 0,
            deactivated_total: 0,
            dispatched_total: 0,
            duplicates_rejected: 0,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Move the viewpoint; discovery picks up the change on its next pass
    pub fn set_viewpoint(&mut self, position: Vec3) {
        let coord = ChunkCoord::from_world_pos(position, self.config.world.chunk_size);
        if self.view.map(|v| v.coord) == Some(coord) {
            return;
        }
        self.fixed_map = None;
        self.publish_view(ViewState { coord, epoch: self.epoch });
    }

    /// Chunk containing the current viewpoint
    pub fn view_coord(&self) -> Option<ChunkCoord> {
        self.view.map(|v| v.coord)
    }

    /// Activate a fixed `size.x` by `size.y` block of chunks centered on the origin.
    ///
    /// Intended for previews without a moving viewpoint; the block is never
    /// culled while no viewpoint is set.
    pub fn set_fixed_map(&mut self, size: IVec2) -> Result<()> {
        if size.x <= 0 || size.y <= 0 {
            return Err(Error::Config(format!("fixed map size must be positive, got {}", size)));
        }
        self.fixed_map = Some(size);
        self.request_fixed_map(size);
        Ok(())
    }

    fn request_fixed_map(&mut self, size: IVec2) {
        let down = -size / 2;
        let up = size + down;
        for x in down.x..up.x {
            for z in down.y..up.y {
                let coord = ChunkCoord::new(x, z);
                if !self.active.contains(coord) {
                    let _ = self.activate_tx.send(coord);
                }
            }
        }
    }

    fn publish_view(&mut self, view: ViewState) {
        self.view = Some(view);
        self.view_tx.send_replace(Some(view));
    }

    /// Drain the streaming queues for one frame
    pub fn update(&mut self) -> Result<()> {
        if self.shut_down {
            return Err(Error::Streaming("coordinator has been shut down".into()));
        }
        let budget = self.config.streaming.max_chunks_per_frame as usize;

        while let Ok(coord) = self.deactivate_rx.try_recv() {
            self.deactivate(coord);
        }

        for _ in 0..budget {
            let Ok(coord) = self.activate_rx.try_recv() else {
                break;
            };
            self.activate(coord)?;
        }

        self.completed.extend(self.extractor.poll()?);
        for _ in 0..budget {
            let Some(done) = self.completed.pop_front() else {
                break;
            };
            self.start_assembly(done)?;
        }

        for _ in 0..budget {
            let Some(task) = self.assembling.pop_front() else {
                break;
            };
            self.finish_assembly(task)?;
        }

        self.publish_snapshot();
        Ok(())
    }

    fn deactivate(&mut self, coord: ChunkCoord) {
        let Some(mut chunk) = self.active.remove(coord) else {
            log::debug!("Chunk {} was already not active", coord);
            return;
        };
        chunk.state = ChunkState::Deactivating;
        self.mesh_sink.detach(coord);
        self.pool.put(chunk);
        self.deactivated_total += 1;
        self.snapshot_dirty = true;
        log::trace!("Deactivated chunk {}", coord);
    }

    fn activate(&mut self, coord: ChunkCoord) -> Result<()> {
        if self.active.contains(coord) || self.in_flight.contains(&coord) {
            return Ok(());
        }
        if let Some(view) = self.view {
            if !is_retained(view.coord, coord, self.config.streaming.render_distance) {
                log::trace!("Skipping stale activation of {}", coord);
                return Ok(());
            }
        }

        let mut chunk = self.pool.take(coord, &self.config.world);
        chunk.state = ChunkState::Activating;

        match self.extractor.request(&chunk, false) {
            Ok(Extraction::NoData) => {
                log::trace!("Reusing cached geometry for {}", coord);
                self.make_active(chunk);
                Ok(())
            }
            Ok(Extraction::Dispatched(ticket)) => {
                self.in_flight.insert(coord);
                self.activating.insert(ticket, chunk);
                self.dispatched_total += 1;
                Ok(())
            }
            Err(e) => {
                self.pool.put(chunk);
                Err(e)
            }
        }
    }

    fn start_assembly(&mut self, done: CompletedExtraction) -> Result<()> {
        let Some(chunk) = self.activating.remove(&done.ticket) else {
            log::debug!("Discarding result for unknown ticket {:?}", done.ticket);
            return Ok(());
        };
        if self.stale.remove(&done.ticket) {
            self.discard(chunk);
            return Ok(());
        }

        let triangles = match done.triangles {
            Ok(triangles) => triangles,
            Err(e) => {
                self.in_flight.remove(&chunk.coord());
                self.pool.put(chunk);
                return Err(e);
            }
        };

        let cancel = self.cancel.clone();
        let handle = self.runtime.spawn_blocking(move || {
            MeshAssembler::new().assemble_cancellable(&triangles, &cancel)
        });
        self.assembling.push_back(AssemblyTask { chunk, epoch: self.epoch, handle });
        Ok(())
    }

    fn finish_assembly(&mut self, task: AssemblyTask) -> Result<()> {
        let AssemblyTask { mut chunk, epoch, handle } = task;
        let joined = self.runtime.block_on(handle);

        if epoch != self.epoch {
            self.discard(chunk);
            return Ok(());
        }
        self.in_flight.remove(&chunk.coord());

        let mesh = match joined {
            Ok(Ok(mesh)) => mesh,
            Ok(Err(Error::Cancelled)) => {
                self.pool.put(chunk);
                return Ok(());
            }
            Ok(Err(e)) => {
                self.pool.put(chunk);
                return Err(e);
            }
            Err(e) => {
                self.pool.put(chunk);
                return Err(Error::Streaming(format!("Mesh assembly task failed: {}", e)));
            }
        };

        chunk.set_geometry(mesh);
        if let Some(view) = self.view {
            if !is_retained(view.coord, chunk.coord(), self.config.streaming.render_distance) {
                log::trace!("Chunk {} left the view while generating", chunk.coord());
                self.pool.put(chunk);
                return Ok(());
            }
        }
        self.make_active(chunk);
        Ok(())
    }

    /// Attach, place resources and insert into the active map
    fn make_active(&mut self, mut chunk: ChunkEntity) {
        let coord = chunk.coord();
        chunk.state = ChunkState::Active;
        match self.active.insert(chunk) {
            Ok(chunk) => {
                self.mesh_sink.attach(chunk);
                chunk.attached = true;
                self.placer.place(chunk);
                self.activated_total += 1;
                self.snapshot_dirty = true;
                log::trace!("Activated chunk {}", coord);
            }
            Err(rejected) => {
                // The entity already shown keeps its mesh
                self.duplicates_rejected += 1;
                self.discard(rejected);
            }
        }
    }

    /// Return an entity whose pending work no longer applies
    fn discard(&mut self, mut chunk: ChunkEntity) {
        chunk.clear_geometry();
        self.pool.put(chunk);
    }

    fn publish_snapshot(&mut self) {
        if !self.snapshot_dirty {
            return;
        }
        let coords = self.active.coords();
        match self.active_snapshot.write() {
            Ok(mut guard) => *guard = coords,
            Err(poisoned) => *poisoned.into_inner() = coords,
        }
        self.snapshot_dirty = false;
    }

    /// Regenerate the world with new settings.
    ///
    /// Every active chunk is dropped, cached geometry is invalidated, work in
    /// flight is marked stale and the current view (or fixed map) is
    /// rediscovered from scratch.
    pub fn reconfigure(&mut self, world: WorldSettings, noise: NoiseSettings) -> Result<()> {
        let config = Config {
            world,
            noise,
            streaming: self.config.streaming.clone(),
        };
        config.validate()?;

        let coords: Vec<ChunkCoord> = self.active.coords().into_iter().collect();
        for coord in coords {
            self.deactivate(coord);
        }
        self.pool.invalidate();

        self.stale.extend(self.activating.keys().copied());
        self.in_flight.clear();
        // Queued requests were computed for the old world
        while self.activate_rx.try_recv().is_ok() {}
        while self.deactivate_rx.try_recv().is_ok() {}

        self.extractor.update_settings(&config.world, &config.noise);
        self.config = config;
        self.epoch += 1;
        self.publish_snapshot();

        if let Some(view) = self.view {
            self.publish_view(ViewState { coord: view.coord, epoch: self.epoch });
        } else if let Some(size) = self.fixed_map {
            self.request_fixed_map(size);
        }

        log::info!("World reconfigured (epoch {})", self.epoch);
        Ok(())
    }

    pub fn active_chunks(&self) -> impl Iterator<Item = &ChunkEntity> {
        self.active.iter()
    }

    pub fn is_active(&self, coord: ChunkCoord) -> bool {
        self.active.contains(coord)
    }

    pub fn active_chunk(&self, coord: ChunkCoord) -> Option<&ChunkEntity> {
        self.active.get(coord)
    }

    pub fn stats(&self) -> StreamingStats {
        StreamingStats {
            active: self.active.len(),
            pooled: self.pool.len(),
            extracting: self.activating.len(),
            assembling: self.completed.len() + self.assembling.len(),
            activated_total: self.activated_total,
            deactivated_total: self.deactivated_total,
            dispatched_total: self.dispatched_total,
            duplicates_rejected: self.duplicates_rejected,
            buffers: self.extractor.pool_stats(),
        }
    }

    /// Stop discovery, drain in-flight work and release every chunk
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.cancel.cancel();
        // Wakes the discovery task so it observes cancellation
        self.view_tx.send_replace(None);

        if let Some(discovery) = self.discovery.take() {
            if let Err(e) = self.runtime.block_on(discovery) {
                log::warn!("Discovery task ended abnormally: {}", e);
            }
        }

        let drained = self.extractor.drain(SHUTDOWN_DRAIN_TIMEOUT);
        let mut chunks: Vec<ChunkEntity> = self.activating.drain().map(|(_, chunk)| chunk).collect();
        for task in self.assembling.drain(..) {
            // Assemblies observe the cancel token; results are discarded
            let _ = self.runtime.block_on(task.handle);
            chunks.push(task.chunk);
        }
        self.completed.clear();

        for chunk in self.active.drain() {
            self.mesh_sink.detach(chunk.coord());
            chunks.push(chunk);
        }
        chunks.extend(self.pool.drain());

        let released = chunks.len();
        for chunk in &mut chunks {
            chunk.dispose();
        }
        self.extractor.dispose();
        self.in_flight.clear();
        self.stale.clear();

        log::info!("Chunk streaming stopped: {} chunks released", released);
        drained.map(|_| ())
    }
}

impl<B: ComputeBackend> Drop for ChunkCoordinator<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Error during streaming shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::CpuBackend;
    use crate::streaming::{NullSink, footprint};
    use crate::terrain::Triangle;
    use std::time::Instant;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.world.chunk_size = 8.0;
        config.world.num_cubes_xz = 4;
        config.world.num_cubes_y = 8;
        config.streaming.render_distance = 1;
        config.streaming.render_distance_offset = 1;
        config.streaming.max_chunks_per_frame = 4;
        config.streaming.discovery_interval_ms = 5;
        config
    }

    fn coordinator(config: Config) -> ChunkCoordinator<CpuBackend> {
        let backend = CpuBackend::with_seed(config.noise.seed, 2).unwrap();
        ChunkCoordinator::new(backend, config, Box::new(NullSink), Box::new(NullSink)).unwrap()
    }

    fn run_until(coordinator: &mut ChunkCoordinator<CpuBackend>, done: impl Fn(&ChunkCoordinator<CpuBackend>) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !done(coordinator) {
            assert!(Instant::now() < deadline, "streaming did not settle: {:?}", coordinator.stats());
            coordinator.update().unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_prewarmed_pool() {
        let coordinator = coordinator(small_config());
        assert_eq!(coordinator.stats().pooled, 4);
        assert_eq!(coordinator.stats().active, 0);
    }

    #[test]
    fn test_idle_without_viewpoint() {
        let mut coordinator = coordinator(small_config());
        for _ in 0..10 {
            coordinator.update().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(coordinator.stats().active, 0);
        assert_eq!(coordinator.stats().buffers.in_use, 0);
    }

    #[test]
    fn test_activates_footprint() {
        let mut coordinator = coordinator(small_config());
        coordinator.set_viewpoint(Vec3::new(4.0, 0.0, 4.0));
        run_until(&mut coordinator, |c| c.stats().active == 9);

        for dx in -1..=1 {
            for dz in -1..=1 {
                assert!(coordinator.is_active(ChunkCoord::new(dx, dz)));
            }
        }
        assert!(coordinator.active_chunks().all(|c| c.is_generated() && c.attached));
    }

    #[test]
    fn test_activations_limited_per_frame() {
        let mut config = small_config();
        config.streaming.max_chunks_per_frame = 2;
        let mut coordinator = coordinator(config);

        for coord in footprint(ChunkCoord::new(0, 0), 1) {
            coordinator.activate_tx.send(coord).unwrap();
        }
        coordinator.update().unwrap();

        // Two requests dispatched; whatever finished already moved to active
        assert_eq!(coordinator.stats().dispatched_total, 2);
        assert_eq!(coordinator.in_flight.len() + coordinator.stats().active, 2);
        let mut queued = 0;
        while coordinator.activate_rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 7);
    }

    #[test]
    fn test_assemblies_limited_per_frame() {
        let mut config = small_config();
        config.streaming.max_chunks_per_frame = 2;
        let mut coordinator = coordinator(config);

        let world = coordinator.config().world.clone();
        for i in 0..5 {
            let coord = ChunkCoord::new(i, 0);
            let ticket = Ticket(1000 + i as u64);
            coordinator.activating.insert(ticket, coordinator.pool.take(coord, &world));
            coordinator.in_flight.insert(coord);
            coordinator.completed.push_back(CompletedExtraction {
                ticket,
                triangles: Ok(vec![Triangle::new(Vec3::ZERO, Vec3::X, Vec3::Z)]),
            });
        }

        coordinator.update().unwrap();
        assert_eq!(coordinator.stats().active, 2);
        assert_eq!(coordinator.completed.len(), 3);

        coordinator.update().unwrap();
        assert_eq!(coordinator.stats().active, 4);
        assert_eq!(coordinator.completed.len(), 1);

        coordinator.update().unwrap();
        assert_eq!(coordinator.stats().active, 5);
        assert!(coordinator.in_flight.is_empty());
        assert!(coordinator.active_chunks().all(|c| c.is_generated() && c.attached));
    }

    #[test]
    fn test_duplicate_activation_keeps_original() {
        let mut coordinator = coordinator(small_config());
        coordinator.set_fixed_map(IVec2::new(1, 1)).unwrap();
        run_until(&mut coordinator, |c| c.stats().active == 1);

        let origin = ChunkCoord::new(0, 0);
        let original = coordinator.active_chunk(origin).unwrap().vertices().to_vec();
        let before = coordinator.stats();

        let world = coordinator.config().world.clone();
        let mut duplicate = ChunkEntity::new(origin, &world);
        duplicate.set_geometry(MeshAssembler::new().assemble(&[Triangle::new(
            Vec3::splat(1.0),
            Vec3::new(2.0, 1.0, 1.0),
            Vec3::new(1.0, 1.0, 2.0),
        )]));
        coordinator.make_active(duplicate);

        let stats = coordinator.stats();
        assert_eq!(stats.duplicates_rejected, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.activated_total, before.activated_total);
        // The rejected entity is pooled without its geometry
        assert_eq!(stats.pooled, before.pooled + 1);
        assert!(!coordinator.pool.contains_bound(origin));

        let kept = coordinator.active_chunk(origin).unwrap();
        assert_eq!(kept.vertices(), original.as_slice());
        assert!(kept.attached);
        assert_eq!(kept.state, ChunkState::Active);
    }

    #[test]
    fn test_fixed_map() {
        let mut coordinator = coordinator(small_config());
        coordinator.set_fixed_map(IVec2::new(2, 3)).unwrap();
        run_until(&mut coordinator, |c| c.stats().active == 6);

        assert!(coordinator.is_active(ChunkCoord::new(-1, -1)));
        assert!(coordinator.is_active(ChunkCoord::new(0, 1)));
        assert!(!coordinator.is_active(ChunkCoord::new(1, 0)));
        assert!(coordinator.set_fixed_map(IVec2::new(0, 3)).is_err());
    }

    #[test]
    fn test_reconfigure_regenerates() {
        let mut coordinator = coordinator(small_config());
        coordinator.set_viewpoint(Vec3::ZERO);
        run_until(&mut coordinator, |c| c.stats().active == 9);

        let mut noise = coordinator.config().noise.clone();
        noise.seed = 99;
        let world = coordinator.config().world.clone();
        coordinator.reconfigure(world, noise).unwrap();
        assert_eq!(coordinator.stats().active, 0);

        run_until(&mut coordinator, |c| c.stats().active == 9);
        assert_eq!(coordinator.config().noise.seed, 99);
    }

    #[test]
    fn test_reconfigure_rejects_invalid() {
        let mut coordinator = coordinator(small_config());
        let mut world = coordinator.config().world.clone();
        world.num_cubes_y = 0;
        let noise = coordinator.config().noise.clone();
        assert!(matches!(coordinator.reconfigure(world, noise), Err(Error::Config(_))));
    }

    #[test]
    fn test_update_after_shutdown_fails() {
        let mut coordinator = coordinator(small_config());
        coordinator.shutdown().unwrap();
        assert!(matches!(coordinator.update(), Err(Error::Streaming(_))));
        // Second shutdown is a no-op
        assert!(coordinator.shutdown().is_ok());
    }
}
