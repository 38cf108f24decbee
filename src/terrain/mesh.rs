//! Triangle soup to indexed mesh conversion

use std::collections::HashMap;

use glam::Vec3;

use crate::core::Result;
use crate::math::Aabb;
use crate::streaming::CancelToken;
use crate::terrain::Triangle;

/// Indexed mesh ready to hand to a renderer or collider
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<u32>,
    /// Smooth per-vertex normals, one per vertex
    pub normals: Vec<Vec3>,
    /// `None` for an empty mesh
    pub bounds: Option<Aabb>,
}

impl MeshData {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Welds an unordered triangle list into shared vertices and indices.
///
/// Points are keyed by their exact bit pattern (with `-0.0` folded into
/// `0.0`), so only bit-identical positions are merged. Each triangle is
/// visited in reverse point order, flipping the winding of the output.
#[derive(Default)]
pub struct MeshAssembler {
    lookup: HashMap<[u32; 3], u32>,
}

impl MeshAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mesh, refusing to start if `cancel` has already fired
    pub fn assemble_cancellable(&mut self, triangles: &[Triangle], cancel: &CancelToken) -> Result<MeshData> {
        cancel.check()?;
        Ok(self.assemble(triangles))
    }

    pub fn assemble(&mut self, triangles: &[Triangle]) -> MeshData {
        self.lookup.clear();
        self.lookup.reserve(triangles.len() * 3 / 2);

        let mut vertices = Vec::with_capacity(triangles.len() * 3 / 2);
        let mut indices = Vec::with_capacity(triangles.len() * 3);

        for tri in triangles {
            for point in tri.points().into_iter().rev() {
                let next = vertices.len() as u32;
                let index = *self.lookup.entry(point_key(point)).or_insert_with(|| {
                    vertices.push(point);
                    next
                });
                indices.push(index);
            }
        }

        let normals = compute_normals(&vertices, &indices);
        let bounds = Aabb::from_points(&vertices);
        MeshData { vertices, indices, normals, bounds }
    }
}

fn point_key(p: Vec3) -> [u32; 3] {
    // -0.0 + 0.0 == +0.0
    [(p.x + 0.0).to_bits(), (p.y + 0.0).to_bits(), (p.z + 0.0).to_bits()]
}

/// Area-weighted smooth normals
pub fn compute_normals(vertices: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; vertices.len()];
    for tri in indices.chunks_exact(3) {
        let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        let face = (vertices[i1] - vertices[i0]).cross(vertices[i2] - vertices[i0]);
        normals[i0] += face;
        normals[i1] += face;
        normals[i2] += face;
    }
    for n in &mut normals {
        *n = n.normalize_or_zero();
    }
    normals
}
