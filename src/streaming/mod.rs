//! Viewpoint-driven chunk streaming

pub mod cancel;
pub mod active;
pub mod discovery;
pub mod sink;
pub mod coordinator;

pub use cancel::CancelToken;
pub use active::{ActiveSet, ChunkPool};
pub use discovery::{DiscoveryLoop, ViewState, footprint, is_retained};
pub use sink::{MeshSink, NullSink, ResourcePlacer};
pub use coordinator::{ChunkCoordinator, StreamingStats};
