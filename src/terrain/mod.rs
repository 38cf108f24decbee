//! Chunk coordinates, entities and mesh assembly

pub mod coord;
pub mod triangle;
pub mod mesh;
pub mod chunk;

pub use coord::ChunkCoord;
pub use triangle::Triangle;
pub use mesh::{MeshAssembler, MeshData, compute_normals};
pub use chunk::{ChunkEntity, ChunkState};
