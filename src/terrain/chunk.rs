//! Chunk entities cycled between the pool and the active map

use glam::Vec3;

use crate::config::WorldSettings;
use crate::math::Aabb;
use crate::terrain::{ChunkCoord, MeshData};

/// Lifecycle state of a chunk entity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    /// Idle in the pool, possibly still holding geometry for its last coordinate
    Pooled,
    /// Extraction or assembly in flight
    Activating,
    Active,
    Deactivating,
    /// Released at teardown
    Disposed,
}

/// One streamed chunk of terrain
#[derive(Debug)]
pub struct ChunkEntity {
    coord: ChunkCoord,
    origin: Vec3,
    pub state: ChunkState,
    generated: bool,
    mesh: MeshData,
    /// Whether a mesh sink currently holds this chunk's geometry
    pub attached: bool,
}

impl ChunkEntity {
    pub fn new(coord: ChunkCoord, world: &WorldSettings) -> Self {
        Self {
            coord,
            origin: coord.world_origin(world),
            state: ChunkState::Pooled,
            generated: false,
            mesh: MeshData::default(),
            attached: false,
        }
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    /// World-space minimum corner
    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    /// Whether the chunk already carries geometry for its coordinate
    pub fn is_generated(&self) -> bool {
        self.generated
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.mesh.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.mesh.indices
    }

    pub fn normals(&self) -> &[Vec3] {
        &self.mesh.normals
    }

    /// Bounds of the extracted surface, `None` when the chunk is empty
    pub fn mesh_bounds(&self) -> Option<Aabb> {
        self.mesh.bounds
    }

    /// Bounds of the whole chunk volume
    pub fn world_bounds(&self, world: &WorldSettings) -> Aabb {
        let extent = Vec3::new(world.chunk_size, world.chunk_height(), world.chunk_size);
        Aabb::new(self.origin, self.origin + extent)
    }

    /// Move the entity to a new coordinate, discarding stale geometry
    pub fn rebind(&mut self, coord: ChunkCoord, world: &WorldSettings) {
        self.coord = coord;
        self.origin = coord.world_origin(world);
        self.generated = false;
        self.mesh = MeshData::default();
    }

    /// Replace the geometry wholesale and mark the chunk generated
    pub fn set_geometry(&mut self, mesh: MeshData) {
        self.mesh = mesh;
        self.generated = true;
    }

    /// Drop the geometry and forget that it was generated
    pub fn clear_geometry(&mut self) {
        self.mesh = MeshData::default();
        self.generated = false;
    }

    /// Final teardown
    pub fn dispose(&mut self) {
        self.clear_geometry();
        self.attached = false;
        self.state = ChunkState::Disposed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::{MeshAssembler, Triangle};

    fn sample_mesh() -> MeshData {
        MeshAssembler::new().assemble(&[Triangle::new(Vec3::ZERO, Vec3::X, Vec3::Z)])
    }

    #[test]
    fn test_new_chunk() {
        let world = WorldSettings::default();
        let chunk = ChunkEntity::new(ChunkCoord::new(2, -1), &world);
        assert_eq!(chunk.state, ChunkState::Pooled);
        assert!(!chunk.is_generated());
        assert_eq!(chunk.origin(), Vec3::new(64.0, 0.0, -32.0));
    }

    #[test]
    fn test_set_geometry_marks_generated() {
        let mut chunk = ChunkEntity::new(ChunkCoord::default(), &WorldSettings::default());
        chunk.set_geometry(sample_mesh());
        assert!(chunk.is_generated());
        assert_eq!(chunk.vertices().len(), 3);
        assert_eq!(chunk.indices(), &[0, 1, 2]);
        assert_eq!(chunk.normals().len(), 3);
    }

    #[test]
    fn test_rebind_clears_geometry() {
        let world = WorldSettings::default();
        let mut chunk = ChunkEntity::new(ChunkCoord::default(), &world);
        chunk.set_geometry(sample_mesh());

        chunk.rebind(ChunkCoord::new(1, 1), &world);
        assert!(!chunk.is_generated());
        assert!(chunk.vertices().is_empty());
        assert_eq!(chunk.coord(), ChunkCoord::new(1, 1));
        assert_eq!(chunk.origin(), Vec3::new(32.0, 0.0, 32.0));
    }

    #[test]
    fn test_world_bounds() {
        let world = WorldSettings::default();
        let chunk = ChunkEntity::new(ChunkCoord::new(1, 0), &world);
        let bounds = chunk.world_bounds(&world);
        assert_eq!(bounds.min, Vec3::new(32.0, 0.0, 0.0));
        assert_eq!(bounds.max, Vec3::new(64.0, world.chunk_height(), 32.0));
    }

    #[test]
    fn test_dispose() {
        let mut chunk = ChunkEntity::new(ChunkCoord::default(), &WorldSettings::default());
        chunk.set_geometry(sample_mesh());
        chunk.attached = true;
        chunk.dispose();
        assert_eq!(chunk.state, ChunkState::Disposed);
        assert!(!chunk.attached);
        assert!(chunk.vertices().is_empty());
    }
}
