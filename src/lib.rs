//! Abyss - streamed marching-cubes terrain around a moving viewpoint

pub mod core;
pub mod math;
pub mod config;
pub mod compute;
pub mod terrain;
pub mod streaming;
