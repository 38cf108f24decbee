//! End-to-end streaming on the CPU backend

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use glam::Vec3;

use abyss::compute::CpuBackend;
use abyss::config::Config;
use abyss::streaming::{ChunkCoordinator, MeshSink, ResourcePlacer, footprint};
use abyss::terrain::{ChunkCoord, ChunkEntity};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Event {
    Attach(ChunkCoord),
    Detach(ChunkCoord),
    Place(ChunkCoord),
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Coordinates attached and not since detached
    fn shown(&self) -> HashSet<ChunkCoord> {
        let mut shown = HashSet::new();
        for event in self.events() {
            match event {
                Event::Attach(c) => {
                    assert!(shown.insert(c), "chunk {} attached twice", c);
                }
                Event::Detach(c) => {
                    assert!(shown.remove(&c), "chunk {} detached while not shown", c);
                }
                Event::Place(_) => {}
            }
        }
        shown
    }
}

impl MeshSink for Recorder {
    fn attach(&mut self, chunk: &ChunkEntity) {
        self.events.lock().unwrap().push(Event::Attach(chunk.coord()));
    }

    fn detach(&mut self, coord: ChunkCoord) {
        self.events.lock().unwrap().push(Event::Detach(coord));
    }
}

impl ResourcePlacer for Recorder {
    fn place(&mut self, chunk: &ChunkEntity) {
        assert!(chunk.is_generated(), "resources placed on chunk {} without geometry", chunk.coord());
        self.events.lock().unwrap().push(Event::Place(chunk.coord()));
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.world.chunk_size = 8.0;
    config.world.num_cubes_xz = 8;
    config.world.num_cubes_y = 16;
    config.noise.num_octaves = 4;
    config.streaming.render_distance = 1;
    config.streaming.render_distance_offset = 1;
    config.streaming.max_chunks_per_frame = 3;
    config.streaming.discovery_interval_ms = 5;
    config
}

fn start(config: Config) -> (ChunkCoordinator<CpuBackend>, Recorder, Recorder) {
    abyss::core::logging::init_for_tests();
    let sink = Recorder::default();
    let placer = Recorder::default();
    let backend = CpuBackend::with_seed(config.noise.seed, 2).unwrap();
    let coordinator =
        ChunkCoordinator::new(backend, config, Box::new(sink.clone()), Box::new(placer.clone())).unwrap();
    (coordinator, sink, placer)
}

fn active_coords(coordinator: &ChunkCoordinator<CpuBackend>) -> HashSet<ChunkCoord> {
    coordinator.active_chunks().map(|c| c.coord()).collect()
}

fn run_until(coordinator: &mut ChunkCoordinator<CpuBackend>, done: impl Fn(&ChunkCoordinator<CpuBackend>) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !done(coordinator) {
        assert!(Instant::now() < deadline, "streaming never settled: {:?}", coordinator.stats());
        coordinator.update().unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Run until the footprint around `center` is shown and nothing is generating
fn settle(coordinator: &mut ChunkCoordinator<CpuBackend>, center: ChunkCoord) {
    let expected: HashSet<ChunkCoord> = footprint(center, 1).into_iter().collect();
    run_until(coordinator, |c| {
        let stats = c.stats();
        expected.is_subset(&active_coords(c)) && stats.extracting == 0 && stats.assembling == 0
    });
    // A few more discovery passes to flush deactivations
    for _ in 0..10 {
        coordinator.update().unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn detached(sink: &Recorder) -> HashSet<ChunkCoord> {
    sink.events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Detach(c) => Some(c),
            _ => None,
        })
        .collect()
}

fn attach_count(sink: &Recorder, coord: ChunkCoord) -> usize {
    sink.events().iter().filter(|&e| *e == Event::Attach(coord)).count()
}

fn column(x: i32) -> impl Iterator<Item = ChunkCoord> {
    (-1..=1).map(move |z| ChunkCoord::new(x, z))
}

#[test]
fn test_streams_footprint_around_viewpoint() {
    let (mut coordinator, sink, placer) = start(test_config());
    coordinator.set_viewpoint(Vec3::new(4.0, 100.0, 4.0));
    settle(&mut coordinator, ChunkCoord::new(0, 0));

    let expected: HashSet<ChunkCoord> = footprint(ChunkCoord::new(0, 0), 1).into_iter().collect();
    assert_eq!(active_coords(&coordinator), expected);
    assert_eq!(sink.shown(), expected);
    let placed: HashSet<Event> = placer.events().into_iter().collect();
    assert_eq!(placed.len(), 9);

    for chunk in coordinator.active_chunks() {
        assert!(chunk.is_generated());
        assert!(chunk.attached);
        assert_eq!(chunk.normals().len(), chunk.vertices().len());
        assert_eq!(chunk.indices().len() % 3, 0);
        let count = chunk.vertices().len() as u32;
        assert!(chunk.indices().iter().all(|&i| i < count));
        if let Some(bounds) = chunk.mesh_bounds() {
            assert!(chunk.world_bounds(&coordinator.config().world).contains(&bounds));
        }
    }
}

#[test]
fn test_moving_viewpoint_releases_trailing_chunks() {
    let (mut coordinator, sink, _placer) = start(test_config());
    coordinator.set_viewpoint(Vec3::new(4.0, 0.0, 4.0));
    settle(&mut coordinator, ChunkCoord::new(0, 0));

    // Three chunks along +X: columns -1 and 0 leave the padded square, column 1 stays
    coordinator.set_viewpoint(Vec3::new(28.0, 0.0, 4.0));
    settle(&mut coordinator, ChunkCoord::new(3, 0));

    let expected_detached: HashSet<ChunkCoord> = column(-1).chain(column(0)).collect();
    assert_eq!(detached(&sink), expected_detached);

    let expected_active: HashSet<ChunkCoord> =
        footprint(ChunkCoord::new(3, 0), 1).into_iter().chain(column(1)).collect();
    assert_eq!(active_coords(&coordinator), expected_active);
    assert_eq!(sink.shown(), expected_active);

    let stats = coordinator.stats();
    assert_eq!(stats.active, 12);
    assert_eq!(stats.deactivated_total, 6);
    assert_eq!(stats.duplicates_rejected, 0);
}

#[test]
fn test_boundary_crossing_keeps_chunks() {
    let (mut coordinator, sink, _placer) = start(test_config());
    coordinator.set_viewpoint(Vec3::new(7.0, 0.0, 4.0));
    settle(&mut coordinator, ChunkCoord::new(0, 0));

    coordinator.set_viewpoint(Vec3::new(9.0, 0.0, 4.0));
    settle(&mut coordinator, ChunkCoord::new(1, 0));
    coordinator.set_viewpoint(Vec3::new(7.0, 0.0, 4.0));
    settle(&mut coordinator, ChunkCoord::new(0, 0));

    let stats = coordinator.stats();
    assert_eq!(stats.deactivated_total, 0);
    assert_eq!(stats.active, 12);
    assert!(detached(&sink).is_empty());
    let attaches = sink.events().iter().filter(|e| matches!(e, Event::Attach(_))).count();
    assert_eq!(attaches, 12);
}

#[test]
fn test_returning_viewpoint_reuses_pooled_geometry() {
    let mut config = test_config();
    // Enough blank entities that cached chunks are never rebound
    config.streaming.render_distance_offset = 4;
    let (mut coordinator, sink, placer) = start(config);
    let origin = ChunkCoord::new(0, 0);

    coordinator.set_viewpoint(Vec3::new(4.0, 0.0, 4.0));
    settle(&mut coordinator, origin);
    coordinator.set_viewpoint(Vec3::new(28.0, 0.0, 4.0));
    settle(&mut coordinator, ChunkCoord::new(3, 0));
    assert!(!coordinator.is_active(origin));
    let dispatched = coordinator.stats().dispatched_total;

    coordinator.set_viewpoint(Vec3::new(4.0, 0.0, 4.0));
    settle(&mut coordinator, origin);

    assert_eq!(coordinator.stats().dispatched_total, dispatched);
    assert_eq!(attach_count(&sink, origin), 2);
    let placed = placer.events().iter().filter(|&e| *e == Event::Place(origin)).count();
    assert_eq!(placed, 2);
    assert!(coordinator.active_chunk(origin).unwrap().attached);
    assert_eq!(sink.shown(), active_coords(&coordinator));
}

#[test]
fn test_shutdown_detaches_everything() {
    let (mut coordinator, sink, _placer) = start(test_config());
    coordinator.set_viewpoint(Vec3::ZERO);
    settle(&mut coordinator, ChunkCoord::new(0, 0));

    coordinator.shutdown().unwrap();
    assert!(sink.shown().is_empty());
    assert_eq!(coordinator.stats().active, 0);
    assert_eq!(coordinator.stats().buffers.in_use, 0);
    assert!(coordinator.update().is_err());
}

#[test]
fn test_shutdown_with_work_in_flight() {
    let (mut coordinator, sink, _placer) = start(test_config());
    coordinator.set_viewpoint(Vec3::ZERO);
    // A few frames only, leaving extractions outstanding
    for _ in 0..3 {
        coordinator.update().unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }

    coordinator.shutdown().unwrap();
    assert!(sink.shown().is_empty());
    assert_eq!(coordinator.stats().extracting, 0);
    assert_eq!(coordinator.stats().assembling, 0);
}
