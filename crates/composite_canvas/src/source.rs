//! Sources
//!
//! A [`Source`] adapts one node's drawable content for baking. It holds a
//! snapshot of the content's mesh (colors converted to linear space when the
//! canvas needs it), the last observed tint and the last sampled transform,
//! plus a plain id of the renderer it is registered with. The renderer owns
//! the list of its sources; a source never owns its renderer.

use composite_core::{Color, Mat4};
use composite_gpu::{MaterialHandle, Mesh, PropertyBlock};
use slotmap::new_key_type;

use crate::renderer::RendererId;
use crate::scene::NodeId;

new_key_type! {
    /// Source registered with a compositor
    pub struct SourceId;
}

/// Per-node bake adapter
#[derive(Debug)]
pub struct Source {
    pub(crate) node: NodeId,
    pub(crate) renderer: Option<RendererId>,
    pub(crate) ignore_self: bool,
    pub(crate) ignore_children: bool,
    pub(crate) enabled: bool,
    pub(crate) mesh: Mesh,
    pub(crate) properties: PropertyBlock,
    pub(crate) captured_version: Option<u64>,
    pub(crate) color: Color,
    pub(crate) prev_transform: Mat4,
    pub(crate) default_material: Option<MaterialHandle>,
}

impl Source {
    pub(crate) fn new(node: NodeId, mesh: Mesh, properties: PropertyBlock) -> Self {
        Self {
            node,
            renderer: None,
            ignore_self: false,
            ignore_children: false,
            enabled: true,
            mesh,
            properties,
            captured_version: None,
            color: Color::TRANSPARENT,
            prev_transform: Mat4::ZERO,
            default_material: None,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Renderer this source is registered with, if any
    pub fn renderer(&self) -> Option<RendererId> {
        self.renderer
    }

    pub fn ignore_self(&self) -> bool {
        self.ignore_self
    }

    pub fn ignore_children(&self) -> bool {
        self.ignore_children
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Captured geometry used for baking
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Tint with inherited alpha applied, as of the last check
    pub fn color(&self) -> Color {
        self.color
    }

    /// Record a transform sample; true when any element moved by more than
    /// `epsilon` since the previous sample.
    pub(crate) fn sample_transform(&mut self, current: Mat4, epsilon: f32) -> bool {
        if self.prev_transform.approx_eq(&current, epsilon) {
            return false;
        }
        self.prev_transform = current;
        true
    }
}
