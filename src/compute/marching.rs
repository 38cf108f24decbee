//! CPU marching cubes over a sampled density grid

use glam::Vec3;
use rayon::prelude::*;

use crate::compute::GridDims;
use crate::compute::density::DensityParams;
use crate::compute::tables::{CORNER_OFFSETS, EDGE_CONNECTIONS, TRI_TABLE};
use crate::terrain::Triangle;

/// Interpolate the surface crossing between two corners
fn interpolate(iso: f32, p1: Vec3, v1: f32, p2: Vec3, v2: f32) -> Vec3 {
    let denom = v2 - v1;
    let t = if denom.abs() > f32::EPSILON { (iso - v1) / denom } else { 0.5 };
    p1 + (p2 - p1) * t
}

/// Emit the triangles of a single cube with origin at sample (x, y, z)
fn march_cube(
    params: &DensityParams,
    grid: GridDims,
    densities: &[f32],
    (x, y, z): (u32, u32, u32),
    emit: &mut impl FnMut(Triangle),
) {
    let mut positions = [Vec3::ZERO; 8];
    let mut values = [0.0f32; 8];
    let mut case = 0usize;
    for (i, offset) in CORNER_OFFSETS.iter().enumerate() {
        let (cx, cy, cz) = (x + offset[0], y + offset[1], z + offset[2]);
        values[i] = densities[grid.point_index(cx, cy, cz)];
        positions[i] = params.sample_position(cx, cy, cz);
        // Corners below the threshold are outside the solid
        if values[i] < params.threshold {
            case |= 1 << i;
        }
    }

    let row = &TRI_TABLE[case];
    let mut i = 0;
    while i + 2 < row.len() && row[i] >= 0 {
        let vertex = |edge: i8| {
            let [a, b] = EDGE_CONNECTIONS[edge as usize];
            interpolate(params.threshold, positions[a], values[a], positions[b], values[b])
        };
        emit(Triangle::new(vertex(row[i]), vertex(row[i + 1]), vertex(row[i + 2])));
        i += 3;
    }
}

/// Extract the isosurface of `densities` as an unordered triangle list
pub fn march_cubes(params: &DensityParams, grid: GridDims, densities: &[f32]) -> Vec<Triangle> {
    (0..grid.cubes_xz)
        .into_par_iter()
        .flat_map_iter(|z| {
            let mut slab = Vec::new();
            for y in 0..grid.cubes_y {
                for x in 0..grid.cubes_xz {
                    march_cube(params, grid, densities, (x, y, z), &mut |tri| slab.push(tri));
                }
            }
            slab
        })
        .collect()
}

/// Append into a fixed-capacity buffer, returning the counter.
///
/// Triangles beyond the buffer's capacity are dropped.
pub fn march_into(params: &DensityParams, grid: GridDims, densities: &[f32], out: &mut [Triangle]) -> usize {
    let mut count = 0;
    let mut dropped = 0usize;
    let mut append = |tri: Triangle| match out.get_mut(count) {
        Some(slot) => {
            *slot = tri;
            count += 1;
        }
        None => dropped += 1,
    };

    for z in 0..grid.cubes_xz {
        for y in 0..grid.cubes_y {
            for x in 0..grid.cubes_xz {
                march_cube(params, grid, densities, (x, y, z), &mut append);
            }
        }
    }

    if dropped > 0 {
        log::warn!(
            "Triangle buffer overflow: {} triangles dropped, capacity {}",
            dropped,
            out.len()
        );
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NoiseSettings, WorldSettings};

    fn setup(cubes_xz: u32, cubes_y: u32) -> (DensityParams, GridDims, WorldSettings) {
        let world = WorldSettings {
            chunk_size: cubes_xz as f32,
            num_cubes_xz: cubes_xz,
            num_cubes_y: cubes_y,
            threshold: 0.0,
            ..Default::default()
        };
        let params = DensityParams::new(Vec3::new(10.0, 0.0, 20.0), &world, &NoiseSettings::default());
        (params, GridDims::from_world(&world), world)
    }

    fn half_space(grid: GridDims, level: f32) -> Vec<f32> {
        let mut densities = vec![0.0; grid.num_points()];
        for z in 0..grid.points_xz() {
            for y in 0..grid.points_y() {
                for x in 0..grid.points_xz() {
                    densities[grid.point_index(x, y, z)] = level - y as f32;
                }
            }
        }
        densities
    }

    #[test]
    fn test_uniform_fields_are_empty() {
        let (params, grid, _) = setup(4, 4);
        let solid = vec![1.0; grid.num_points()];
        let empty = vec![-1.0; grid.num_points()];
        assert!(march_cubes(&params, grid, &solid).is_empty());
        assert!(march_cubes(&params, grid, &empty).is_empty());
    }

    #[test]
    fn test_half_space_is_flat_sheet() {
        let (params, grid, _) = setup(4, 6);
        let tris = march_cubes(&params, grid, &half_space(grid, 2.5));

        assert_eq!(tris.len(), 2 * 4 * 4);
        for tri in &tris {
            for p in tri.points() {
                assert!((p.y - 2.5).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_vertices_within_chunk_bounds() {
        let (params, grid, world) = setup(6, 6);
        let mut densities = vec![0.0; grid.num_points()];
        let center = Vec3::splat(3.0);
        for z in 0..grid.points_xz() {
            for y in 0..grid.points_y() {
                for x in 0..grid.points_xz() {
                    let d = 2.2 - Vec3::new(x as f32, y as f32, z as f32).distance(center);
                    densities[grid.point_index(x, y, z)] = d;
                }
            }
        }
        let tris = march_cubes(&params, grid, &densities);
        assert!(!tris.is_empty());

        let bounds = crate::math::Aabb::new(
            params.origin(),
            params.origin() + Vec3::new(world.chunk_size, world.chunk_height(), world.chunk_size),
        );
        for tri in &tris {
            for p in tri.points() {
                assert!(bounds.contains_point(p), "{:?} outside chunk", p);
            }
        }
    }

    #[test]
    fn test_march_into_clamps_to_capacity() {
        let (params, grid, _) = setup(4, 6);
        let densities = half_space(grid, 2.5);
        let mut out = vec![Triangle::default(); 10];
        assert_eq!(march_into(&params, grid, &densities, &mut out), 10);

        let mut out = vec![Triangle::default(); grid.max_triangles()];
        assert_eq!(march_into(&params, grid, &densities, &mut out), 32);
    }

    #[test]
    fn test_march_into_matches_march_cubes() {
        let (params, grid, _) = setup(5, 5);
        let mut densities = vec![0.0; grid.num_points()];
        for z in 0..grid.points_xz() {
            for y in 0..grid.points_y() {
                for x in 0..grid.points_xz() {
                    let p = Vec3::new(x as f32, y as f32, z as f32);
                    densities[grid.point_index(x, y, z)] = 2.0 - p.distance(Vec3::splat(2.5));
                }
            }
        }

        let expected = march_cubes(&params, grid, &densities);
        let mut out = vec![Triangle::default(); grid.max_triangles()];
        let count = march_into(&params, grid, &densities, &mut out);
        assert_eq!(&out[..count], expected.as_slice());
    }
}
