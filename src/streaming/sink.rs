//! Collaborators notified as chunks enter and leave the active set

use crate::terrain::{ChunkCoord, ChunkEntity};

/// Receives chunk geometry for rendering and collision
pub trait MeshSink: Send {
    /// Show `chunk`'s current geometry, replacing any earlier mesh for its coordinate
    fn attach(&mut self, chunk: &ChunkEntity);

    /// Stop showing the chunk at `coord`
    fn detach(&mut self, coord: ChunkCoord);
}

/// Places resources on a freshly activated chunk
pub trait ResourcePlacer: Send {
    fn place(&mut self, chunk: &ChunkEntity);
}

/// Sink and placer that ignore everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl MeshSink for NullSink {
    fn attach(&mut self, _chunk: &ChunkEntity) {}

    fn detach(&mut self, _coord: ChunkCoord) {}
}

impl ResourcePlacer for NullSink {
    fn place(&mut self, _chunk: &ChunkEntity) {}
}
