//! Active chunk map and the pool of idle chunk entities

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::config::WorldSettings;
use crate::terrain::{ChunkCoord, ChunkEntity, ChunkState};

/// Chunks currently shown, at most one per coordinate
#[derive(Default)]
pub struct ActiveSet {
    chunks: HashMap<ChunkCoord, ChunkEntity>,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a chunk, handing it back if its coordinate is already active
    pub fn insert(&mut self, chunk: ChunkEntity) -> Result<&mut ChunkEntity, ChunkEntity> {
        match self.chunks.entry(chunk.coord()) {
            Entry::Occupied(_) => {
                log::warn!("Chunk {} is already active", chunk.coord());
                Err(chunk)
            }
            Entry::Vacant(slot) => Ok(slot.insert(chunk)),
        }
    }

    pub fn remove(&mut self, coord: ChunkCoord) -> Option<ChunkEntity> {
        self.chunks.remove(&coord)
    }

    pub fn contains(&self, coord: ChunkCoord) -> bool {
        self.chunks.contains_key(&coord)
    }

    pub fn get(&self, coord: ChunkCoord) -> Option<&ChunkEntity> {
        self.chunks.get(&coord)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn coords(&self) -> HashSet<ChunkCoord> {
        self.chunks.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChunkEntity> {
        self.chunks.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ChunkEntity> + '_ {
        self.chunks.drain().map(|(_, chunk)| chunk)
    }
}

/// Idle chunk entities.
///
/// Entities still holding geometry stay keyed by their coordinate so a later
/// activation of the same coordinate can reuse it without regenerating.
#[derive(Default)]
pub struct ChunkPool {
    bound: HashMap<ChunkCoord, ChunkEntity>,
    unbound: Vec<ChunkEntity>,
}

impl ChunkPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `count` blank entities up front
    pub fn prewarm(&mut self, count: usize, world: &WorldSettings) {
        self.unbound.reserve(count);
        for _ in 0..count {
            self.unbound.push(ChunkEntity::new(ChunkCoord::default(), world));
        }
    }

    /// Return an entity to the pool
    pub fn put(&mut self, mut chunk: ChunkEntity) {
        chunk.state = ChunkState::Pooled;
        chunk.attached = false;
        if !chunk.is_generated() {
            self.unbound.push(chunk);
            return;
        }
        match self.bound.entry(chunk.coord()) {
            Entry::Vacant(slot) => {
                slot.insert(chunk);
            }
            Entry::Occupied(_) => {
                chunk.clear_geometry();
                self.unbound.push(chunk);
            }
        }
    }

    /// Get an entity for `coord`.
    ///
    /// Prefers an entity already holding geometry for `coord`, then a blank
    /// entity, then any other pooled entity (its geometry is discarded), and
    /// only then creates a new one.
    pub fn take(&mut self, coord: ChunkCoord, world: &WorldSettings) -> ChunkEntity {
        if let Some(chunk) = self.bound.remove(&coord) {
            return chunk;
        }

        let reusable = self.unbound.pop().or_else(|| {
            let key = self.bound.keys().next().copied()?;
            self.bound.remove(&key)
        });

        match reusable {
            Some(mut chunk) => {
                chunk.rebind(coord, world);
                chunk
            }
            None => {
                log::debug!("Chunk pool empty, creating entity for {}", coord);
                ChunkEntity::new(coord, world)
            }
        }
    }

    /// Discard cached geometry of every pooled entity
    pub fn invalidate(&mut self) {
        for (_, mut chunk) in self.bound.drain() {
            chunk.clear_geometry();
            self.unbound.push(chunk);
        }
    }

    pub fn contains_bound(&self, coord: ChunkCoord) -> bool {
        self.bound.contains_key(&coord)
    }

    pub fn len(&self) -> usize {
        self.bound.len() + self.unbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ChunkEntity> + '_ {
        self.bound.drain().map(|(_, chunk)| chunk).chain(self.unbound.drain(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::{MeshAssembler, Triangle};
    use glam::Vec3;

    fn generated(coord: ChunkCoord, world: &WorldSettings) -> ChunkEntity {
        let mut chunk = ChunkEntity::new(coord, world);
        chunk.set_geometry(MeshAssembler::new().assemble(&[Triangle::new(Vec3::ZERO, Vec3::X, Vec3::Z)]));
        chunk
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let world = WorldSettings::default();
        let mut active = ActiveSet::new();
        let coord = ChunkCoord::new(1, 2);

        assert!(active.insert(ChunkEntity::new(coord, &world)).is_ok());
        let rejected = active.insert(ChunkEntity::new(coord, &world));
        assert!(rejected.is_err());
        assert_eq!(active.len(), 1);
        assert!(active.contains(coord));
    }

    #[test]
    fn test_take_prefers_exact_match() {
        let world = WorldSettings::default();
        let mut pool = ChunkPool::new();
        pool.prewarm(2, &world);
        pool.put(generated(ChunkCoord::new(3, 3), &world));

        let chunk = pool.take(ChunkCoord::new(3, 3), &world);
        assert!(chunk.is_generated());
        assert_eq!(chunk.coord(), ChunkCoord::new(3, 3));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_take_prefers_blank_over_bound() {
        let world = WorldSettings::default();
        let mut pool = ChunkPool::new();
        pool.put(generated(ChunkCoord::new(3, 3), &world));
        pool.prewarm(1, &world);

        let chunk = pool.take(ChunkCoord::new(0, 5), &world);
        assert!(!chunk.is_generated());
        assert_eq!(chunk.coord(), ChunkCoord::new(0, 5));
        assert!(pool.contains_bound(ChunkCoord::new(3, 3)));
    }

    #[test]
    fn test_take_rebinds_bound_when_no_blank() {
        let world = WorldSettings::default();
        let mut pool = ChunkPool::new();
        pool.put(generated(ChunkCoord::new(3, 3), &world));

        let chunk = pool.take(ChunkCoord::new(-1, 0), &world);
        assert!(!chunk.is_generated());
        assert_eq!(chunk.coord(), ChunkCoord::new(-1, 0));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_take_creates_when_empty() {
        let world = WorldSettings::default();
        let mut pool = ChunkPool::new();
        let chunk = pool.take(ChunkCoord::new(4, 4), &world);
        assert_eq!(chunk.coord(), ChunkCoord::new(4, 4));
        assert_eq!(chunk.origin(), ChunkCoord::new(4, 4).world_origin(&world));
    }

    #[test]
    fn test_put_collision_clears_geometry() {
        let world = WorldSettings::default();
        let mut pool = ChunkPool::new();
        pool.put(generated(ChunkCoord::new(1, 1), &world));
        pool.put(generated(ChunkCoord::new(1, 1), &world));

        assert_eq!(pool.len(), 2);
        let generated_count = pool.drain().filter(|c| c.is_generated()).count();
        assert_eq!(generated_count, 1);
    }

    #[test]
    fn test_invalidate() {
        let world = WorldSettings::default();
        let mut pool = ChunkPool::new();
        pool.put(generated(ChunkCoord::new(1, 1), &world));
        pool.invalidate();

        assert!(!pool.contains_bound(ChunkCoord::new(1, 1)));
        assert!(!pool.take(ChunkCoord::new(1, 1), &world).is_generated());
    }
}
