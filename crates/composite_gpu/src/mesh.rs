//! UI geometry
//!
//! Vertex layout matches what UI widgets emit: position, 8-bit RGBA color
//! and one UV set. The layout is `Pod` so a mesh can be uploaded as raw
//! bytes.

use bytemuck::{Pod, Zeroable};
use composite_core::{gamma_to_linear_rgba8, Vec2, Vec3};

/// One UI vertex
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct UiVertex {
    pub position: [f32; 3],
    pub color: [u8; 4],
    pub uv: [f32; 2],
}

impl UiVertex {
    pub fn new(position: Vec3, color: [u8; 4], uv: Vec2) -> Self {
        Self {
            position: [position.x, position.y, position.z],
            color,
            uv: [uv.x, uv.y],
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(self.position[0], self.position[1], self.position[2])
    }
}

/// Indexed triangle list
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<UiVertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn add_vertex(&mut self, vertex: UiVertex) {
        self.vertices.push(vertex);
    }

    pub fn add_triangle(&mut self, a: u32, b: u32, c: u32) {
        self.indices.extend_from_slice(&[a, b, c]);
    }

    /// Replace contents with a copy of `other`, reusing allocations.
    pub fn copy_from(&mut self, other: &Mesh) {
        self.vertices.clear();
        self.vertices.extend_from_slice(&other.vertices);
        self.indices.clear();
        self.indices.extend_from_slice(&other.indices);
    }

    /// Convert every vertex color from gamma to linear space.
    pub fn convert_colors_to_linear(&mut self) {
        for v in &mut self.vertices {
            v.color = gamma_to_linear_rgba8(v.color);
        }
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}
