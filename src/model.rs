//! Vertex layout and OBJ loading.

use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::BufReader;
use std::mem::{offset_of, size_of};
use std::path::Path;

use anyhow::{anyhow, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use log::*;

use crate::error::RendererError;

pub type Vec2 = nalgebra::Vector2<f32>;
pub type Vec3 = nalgebra::Vector3<f32>;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct Vertex {
    pub pos: Vec3,
    pub color: Vec3,
    pub tex_coord: Vec2,
}

impl Vertex {
    pub const fn new(pos: Vec3, color: Vec3, tex_coord: Vec2) -> Self {
        Self {
            pos,
            color,
            tex_coord,
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, pos) as u32),
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, color) as u32),
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(2)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Vertex, tex_coord) as u32),
        ]
    }
}

impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        self.pos == other.pos && self.color == other.color && self.tex_coord == other.tex_coord
    }
}

impl Eq for Vertex {}

impl Hash for Vertex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for component in self.pos.iter().chain(self.color.iter()).chain(self.tex_coord.iter()) {
            component.to_bits().hash(state);
        }
    }
}

/// Indexed triangle list ready for upload.
#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Folds repeated vertices into one entry, emitting one index per input vertex.
    pub fn from_triangle_vertices<I>(vertices: I) -> Self
    where
        I: IntoIterator<Item = Vertex>,
    {
        let mut mesh = Mesh::default();
        let mut unique_vertices = HashMap::new();
        for vertex in vertices {
            let index = *unique_vertices.entry(vertex).or_insert_with(|| {
                mesh.vertices.push(vertex);
                (mesh.vertices.len() - 1) as u32
            });
            mesh.indices.push(index);
        }
        mesh
    }
}

/// Loads every model in an OBJ file as one white, textured mesh. The V texture
/// coordinate is flipped since OBJ puts the origin at the bottom left.
pub fn load_model(path: &Path) -> Result<Mesh> {
    let file = File::open(path).map_err(|source| RendererError::MissingFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let (models, _) = tobj::load_obj_buf(
        &mut reader,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
        |_| Ok(Default::default()),
    )
    .map_err(|e| anyhow!("Failed to parse model '{}': {}", path.display(), e))?;

    let white = Vec3::new(1.0, 1.0, 1.0);
    let vertices = models.iter().flat_map(|model| {
        let mesh = &model.mesh;
        mesh.indices.iter().map(move |&index| {
            let index = index as usize;
            let pos = Vec3::new(
                mesh.positions[3 * index],
                mesh.positions[3 * index + 1],
                mesh.positions[3 * index + 2],
            );
            let tex_coord = if mesh.texcoords.is_empty() {
                Vec2::zeros()
            } else {
                Vec2::new(mesh.texcoords[2 * index], 1.0 - mesh.texcoords[2 * index + 1])
            };
            Vertex::new(pos, white, tex_coord)
        })
    });
    let mesh = Mesh::from_triangle_vertices(vertices);

    info!(
        "Loaded model '{}' ({} vertices, {} indices).",
        path.display(),
        mesh.vertices.len(),
        mesh.indices.len()
    );
    Ok(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32, u: f32) -> Vertex {
        Vertex::new(Vec3::new(x, 0.0, 0.0), Vec3::new(1.0, 1.0, 1.0), Vec2::new(u, 0.0))
    }

    #[test]
    fn vertex_bytes_follow_the_attribute_layout() {
        let v = Vertex::new(
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(4.0, 5.0, 6.0),
            Vec2::new(7.0, 8.0),
        );
        let bytes: &[u8] = bytemuck::bytes_of(&v);
        assert_eq!(bytes.len(), Vertex::binding_description().stride as usize);

        let floats: &[f32] = bytemuck::cast_slice(bytes);
        assert_eq!(floats, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let [_, _, tex] = Vertex::attribute_descriptions();
        assert_eq!(floats[tex.offset as usize / 4], 7.0);
    }

    #[test]
    fn repeated_vertices_share_an_index() {
        let a = vertex(0.0, 0.0);
        let b = vertex(1.0, 0.0);
        let c = vertex(1.0, 1.0);
        let mesh = Mesh::from_triangle_vertices([a, b, c, c, b, a]);
        assert_eq!(mesh.vertices, vec![a, b, c]);
        assert_eq!(mesh.indices, vec![0, 1, 2, 2, 1, 0]);
    }

    #[test]
    fn differing_tex_coords_are_distinct_vertices() {
        let mesh = Mesh::from_triangle_vertices([vertex(0.0, 0.0), vertex(0.0, 0.5)]);
        assert_eq!(mesh.vertices.len(), 2);
        assert_eq!(mesh.indices, vec![0, 1]);
    }

    #[test]
    fn attribute_offsets_follow_field_order() {
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
        assert_eq!(Vertex::binding_description().stride, 32);
    }

    #[test]
    fn loads_bundled_cube() {
        let mesh = load_model(Path::new(crate::config::MODEL_PATH)).unwrap();
        // Six quads, each split into two triangles.
        assert_eq!(mesh.indices.len(), 36);
        assert_eq!(mesh.vertices.len(), 20);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
        assert!(mesh
            .vertices
            .iter()
            .all(|v| (0.0..=1.0).contains(&v.tex_coord.y) && v.color == Vec3::new(1.0, 1.0, 1.0)));
    }

    #[test]
    fn missing_model_is_reported() {
        let err = load_model(Path::new("assets/models/missing.obj")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendererError>(),
            Some(RendererError::MissingFile { .. })
        ));
    }
}
