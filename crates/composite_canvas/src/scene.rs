//! Scene graph mirror
//!
//! The compositor does not own the host's UI hierarchy; the host mirrors the
//! parts it needs into a [`Scene`]: parent/child structure, local transforms,
//! rect layouts, group alpha, canvases and the drawable widgets. Structural
//! edits queue [`HierarchyEvent`]s that the compositor drains at the start of
//! each frame. Transform edits are not evented; they are detected by sampling.

use composite_core::{Bounds, Color, Mat4, Quat, Rect, Size, Vec2, Vec3};
use composite_gpu::{MaterialHandle, Mesh, TextureId};
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use std::cmp::Ordering;

use crate::error::{CompositeError, Result};

new_key_type! {
    /// Node in the scene mirror
    pub struct NodeId;
}

// ─────────────────────────────────────────────────────────────────────────────
// Node data
// ─────────────────────────────────────────────────────────────────────────────

/// Position, rotation and scale relative to the parent
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalTransform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for LocalTransform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl LocalTransform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::trs(self.position, self.rotation, self.scale)
    }

    /// Rotation and scale only
    pub fn rotation_scale(&self) -> Mat4 {
        Mat4::rotation(self.rotation).mul(&Mat4::scale(self.scale.x, self.scale.y, self.scale.z))
    }
}

/// Size and pivot of a node's rect in its own space
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RectLayout {
    pub size: Size,
    /// Normalized pivot, (0,0) bottom-left and (1,1) top-right
    pub pivot: Vec2,
}

impl Default for RectLayout {
    fn default() -> Self {
        Self {
            size: Size::new(100.0, 100.0),
            pivot: Vec2::new(0.5, 0.5),
        }
    }
}

impl RectLayout {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            size: Size::new(width, height),
            ..Default::default()
        }
    }

    pub fn with_pivot(mut self, pivot: Vec2) -> Self {
        self.pivot = pivot;
        self
    }

    /// Rect in local space, offset so the pivot sits at the origin
    pub fn rect(&self) -> Rect {
        Rect::new(
            -self.pivot.x * self.size.width,
            -self.pivot.y * self.size.height,
            self.size.width,
            self.size.height,
        )
    }
}

/// Pixel format of a widget texture
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextureFormat {
    #[default]
    Rgba8,
    /// Single-channel coverage, e.g. font atlases
    Alpha8,
}

/// Host texture bound to a widget
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WidgetTexture {
    pub id: TextureId,
    pub format: TextureFormat,
}

/// Drawable content of a node
#[derive(Clone, Debug, PartialEq)]
pub struct Widget {
    pub mesh: Mesh,
    /// Custom material; `None` uses the shared source material
    pub material: Option<MaterialHandle>,
    /// Material restoring stencil state after a masking widget
    pub pop_material: Option<MaterialHandle>,
    pub texture: Option<WidgetTexture>,
    pub color: Color,
    /// Draw order assigned by the host canvas, if resolved
    pub depth: Option<i32>,
    pub active: bool,
    version: u64,
}

impl Widget {
    pub fn new(mesh: Mesh) -> Self {
        Self {
            mesh,
            material: None,
            pop_material: None,
            texture: None,
            color: Color::WHITE,
            depth: None,
            active: true,
            version: 0,
        }
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    pub fn with_depth(mut self, depth: i32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_texture(mut self, id: TextureId, format: TextureFormat) -> Self {
        self.texture = Some(WidgetTexture { id, format });
        self
    }

    pub fn with_material(mut self, material: MaterialHandle) -> Self {
        self.material = Some(material);
        self
    }

    pub fn with_pop_material(mut self, material: MaterialHandle) -> Self {
        self.pop_material = Some(material);
        self
    }

    /// Bumped on every edit made through [`Scene::update_widget`]
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// How a canvas is presented
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderMode {
    #[default]
    ScreenSpaceOverlay,
    ScreenSpaceCamera,
    WorldSpace,
}

/// Camera rendering a screen-space-camera canvas
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub view: Mat4,
    pub projection: Mat4,
    pub orthographic: bool,
}

impl Camera {
    /// OpenGL-style perspective projection
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32, view: Mat4) -> Self {
        let f = 1.0 / (fov_y_degrees.to_radians() / 2.0).tan();
        let mut projection = Mat4::ZERO;
        projection.set(0, 0, f / aspect);
        projection.set(1, 1, f);
        projection.set(2, 2, (far + near) / (near - far));
        projection.set(2, 3, 2.0 * far * near / (near - far));
        projection.set(3, 2, -1.0);
        Self {
            view,
            projection,
            orthographic: false,
        }
    }
}

/// Canvas settings on a canvas root node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Canvas {
    pub render_mode: RenderMode,
    pub camera: Option<Camera>,
    pub scale_factor: f32,
    /// Vertex colors must be converted to linear space on capture
    pub linear_vertex_colors: bool,
    /// The shader converts sampled colors to linear space
    pub linear_in_shader: bool,
}

impl Default for Canvas {
    fn default() -> Self {
        Self {
            render_mode: RenderMode::ScreenSpaceOverlay,
            camera: None,
            scale_factor: 1.0,
            linear_vertex_colors: false,
            linear_in_shader: false,
        }
    }
}

/// One node of the mirrored hierarchy
#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    active_self: bool,
    pub transform: LocalTransform,
    pub layout: RectLayout,
    /// Group alpha applied to this node and its subtree
    pub alpha: f32,
    widget: Option<Widget>,
    canvas: Option<Canvas>,
}

impl Node {
    fn new(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            active_self: true,
            transform: LocalTransform::default(),
            layout: RectLayout::default(),
            alpha: 1.0,
            widget: None,
            canvas: None,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn active_self(&self) -> bool {
        self.active_self
    }

    pub fn widget(&self) -> Option<&Widget> {
        self.widget.as_ref()
    }

    pub fn canvas(&self) -> Option<&Canvas> {
        self.canvas.as_ref()
    }
}

/// Structural change notifications
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HierarchyEvent {
    Added(NodeId),
    Reparented(NodeId),
    /// Node and its whole subtree were removed
    Removed(NodeId),
    ActiveChanged(NodeId),
}

// ─────────────────────────────────────────────────────────────────────────────
// Scene
// ─────────────────────────────────────────────────────────────────────────────

/// Arena of mirrored nodes
#[derive(Debug, Default)]
pub struct Scene {
    nodes: SlotMap<NodeId, Node>,
    roots: Vec<NodeId>,
    events: Vec<HierarchyEvent>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(id).ok_or(CompositeError::NodeNotFound(id))
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Append a node under `parent`, or as a new root.
    pub fn add_node(&mut self, parent: Option<NodeId>, name: impl Into<String>) -> Result<NodeId> {
        if let Some(p) = parent {
            if !self.nodes.contains_key(p) {
                return Err(CompositeError::NodeNotFound(p));
            }
        }
        let id = self.nodes.insert(Node::new(name.into(), parent));
        match parent {
            Some(p) => self.nodes[p].children.push(id),
            None => self.roots.push(id),
        }
        self.events.push(HierarchyEvent::Added(id));
        Ok(id)
    }

    /// Move `id` under `new_parent` (appended last).
    pub fn reparent(&mut self, id: NodeId, new_parent: Option<NodeId>) -> Result<()> {
        if !self.nodes.contains_key(id) {
            return Err(CompositeError::NodeNotFound(id));
        }
        if let Some(p) = new_parent {
            if !self.nodes.contains_key(p) {
                return Err(CompositeError::NodeNotFound(p));
            }
            if p == id || self.is_ancestor_of(id, p) {
                return Err(CompositeError::HierarchyCycle(id));
            }
        }
        self.detach(id);
        self.nodes[id].parent = new_parent;
        match new_parent {
            Some(p) => self.nodes[p].children.push(id),
            None => self.roots.push(id),
        }
        self.events.push(HierarchyEvent::Reparented(id));
        Ok(())
    }

    /// Move `id` to `index` among its siblings.
    pub fn set_sibling_index(&mut self, id: NodeId, index: usize) -> Result<()> {
        let parent = self.node(id).ok_or(CompositeError::NodeNotFound(id))?.parent;
        let siblings = match parent {
            Some(p) => &mut self.nodes[p].children,
            None => &mut self.roots,
        };
        if let Some(pos) = siblings.iter().position(|c| *c == id) {
            siblings.remove(pos);
            let index = index.min(siblings.len());
            siblings.insert(index, id);
        }
        Ok(())
    }

    /// Remove `id` and its subtree. Returns the removed ids, parents first.
    pub fn remove(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        if !self.nodes.contains_key(id) {
            return Err(CompositeError::NodeNotFound(id));
        }
        let removed = self.descendants(id);
        self.detach(id);
        for n in &removed {
            self.nodes.remove(*n);
        }
        self.events.push(HierarchyEvent::Removed(id));
        Ok(removed)
    }

    fn detach(&mut self, id: NodeId) {
        match self.nodes[id].parent {
            Some(p) => {
                if let Some(parent) = self.nodes.get_mut(p) {
                    parent.children.retain(|c| *c != id);
                }
            }
            None => self.roots.retain(|c| *c != id),
        }
    }

    pub fn set_active(&mut self, id: NodeId, active: bool) -> Result<()> {
        let node = self.node_mut(id)?;
        if node.active_self != active {
            node.active_self = active;
            self.events.push(HierarchyEvent::ActiveChanged(id));
        }
        Ok(())
    }

    pub fn set_transform(&mut self, id: NodeId, transform: LocalTransform) -> Result<()> {
        self.node_mut(id)?.transform = transform;
        Ok(())
    }

    pub fn set_position(&mut self, id: NodeId, position: Vec3) -> Result<()> {
        self.node_mut(id)?.transform.position = position;
        Ok(())
    }

    pub fn set_layout(&mut self, id: NodeId, layout: RectLayout) -> Result<()> {
        self.node_mut(id)?.layout = layout;
        Ok(())
    }

    pub fn set_alpha(&mut self, id: NodeId, alpha: f32) -> Result<()> {
        self.node_mut(id)?.alpha = alpha.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn set_canvas(&mut self, id: NodeId, canvas: Option<Canvas>) -> Result<()> {
        self.node_mut(id)?.canvas = canvas;
        Ok(())
    }

    pub fn set_widget(&mut self, id: NodeId, widget: Option<Widget>) -> Result<()> {
        let node = self.node_mut(id)?;
        let version = node.widget.as_ref().map_or(0, |w| w.version) + 1;
        node.widget = widget.map(|mut w| {
            w.version = version;
            w
        });
        Ok(())
    }

    /// Edit a widget in place; its version is bumped.
    pub fn update_widget(&mut self, id: NodeId, f: impl FnOnce(&mut Widget)) -> Result<()> {
        let node = self.node_mut(id)?;
        let widget = node.widget.as_mut().ok_or(CompositeError::NoWidget(id))?;
        f(widget);
        widget.version += 1;
        Ok(())
    }

    /// Structural events queued since the last drain
    pub fn drain_events(&mut self) -> Vec<HierarchyEvent> {
        std::mem::take(&mut self.events)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes.get(id).map_or(&[], |n| &n.children)
    }

    pub fn widget(&self, id: NodeId) -> Option<&Widget> {
        self.nodes.get(id).and_then(|n| n.widget.as_ref())
    }

    pub fn sibling_index(&self, id: NodeId) -> usize {
        let siblings = match self.parent(id) {
            Some(p) => self.children(p),
            None => &self.roots,
        };
        siblings.iter().position(|c| *c == id).unwrap_or(0)
    }

    /// Ancestors from the parent upward
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(id), move |n| self.parent(*n))
    }

    pub fn is_ancestor_of(&self, ancestor: NodeId, id: NodeId) -> bool {
        self.ancestors(id).any(|a| a == ancestor)
    }

    /// `id` and everything below it, depth first, parents before children
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if !self.nodes.contains_key(n) {
                continue;
            }
            out.push(n);
            stack.extend(self.children(n).iter().rev().copied());
        }
        out
    }

    pub fn is_active_in_hierarchy(&self, id: NodeId) -> bool {
        match self.nodes.get(id) {
            Some(n) if n.active_self => self.ancestors(id).all(|a| self.nodes[a].active_self),
            _ => false,
        }
    }

    pub fn local_to_world(&self, id: NodeId) -> Mat4 {
        let mut chain: SmallVec<[NodeId; 16]> = SmallVec::new();
        chain.push(id);
        chain.extend(self.ancestors(id));
        chain
            .iter()
            .rev()
            .filter_map(|n| self.nodes.get(*n))
            .fold(Mat4::IDENTITY, |acc, n| acc.mul(&n.transform.matrix()))
    }

    pub fn world_to_local(&self, id: NodeId) -> Mat4 {
        self.local_to_world(id).inverse().unwrap_or(Mat4::ZERO)
    }

    pub fn lossy_scale(&self, id: NodeId) -> Vec3 {
        self.local_to_world(id).lossy_scale()
    }

    /// Rect in the node's own space
    pub fn rect(&self, id: NodeId) -> Rect {
        self.nodes.get(id).map_or(Rect::ZERO, |n| n.layout.rect())
    }

    /// Product of group alphas from the root down to `id`
    pub fn inherited_alpha(&self, id: NodeId) -> f32 {
        let own = self.nodes.get(id).map_or(1.0, |n| n.alpha);
        self.ancestors(id)
            .filter_map(|a| self.nodes.get(a))
            .fold(own, |acc, n| acc * n.alpha)
    }

    /// Nearest canvas at or above `id`
    pub fn canvas(&self, id: NodeId) -> Option<(NodeId, &Canvas)> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find_map(|n| self.nodes.get(n)?.canvas.as_ref().map(|c| (n, c)))
    }

    /// Outermost canvas at or above `id`
    pub fn root_canvas(&self, id: NodeId) -> Option<(NodeId, &Canvas)> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .filter_map(|n| self.nodes.get(n)?.canvas.as_ref().map(|c| (n, c)))
            .last()
    }

    /// Bounds of the active rects in `child`'s subtree, in `root` space.
    pub fn relative_bounds(&self, root: NodeId, child: NodeId) -> Rect {
        let to_root = self.world_to_local(root);
        let mut bounds: Option<Bounds> = None;
        for n in self.descendants(child) {
            if !self.is_active_in_hierarchy(n) {
                continue;
            }
            let m = to_root.mul(&self.local_to_world(n));
            let r = self.rect(n);
            for corner in [
                Vec3::new(r.x_min(), r.y_min(), 0.0),
                Vec3::new(r.x_min(), r.y_max(), 0.0),
                Vec3::new(r.x_max(), r.y_max(), 0.0),
                Vec3::new(r.x_max(), r.y_min(), 0.0),
            ] {
                let p = m.transform_point(corner);
                match bounds.as_mut() {
                    Some(b) => b.encapsulate(p),
                    None => bounds = Some(Bounds::from_point(p)),
                }
            }
        }
        bounds.map_or(Rect::ZERO, |b| b.to_rect())
    }

    /// Sibling-index path from below `stop_at` down to `id`
    fn index_path(&self, id: NodeId, stop_at: Option<NodeId>) -> SmallVec<[usize; 8]> {
        let mut path: SmallVec<[usize; 8]> = SmallVec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            if Some(n) == stop_at {
                break;
            }
            path.push(self.sibling_index(n));
            cur = self.parent(n);
        }
        path.reverse();
        path
    }

    /// Hierarchy order of two nodes below `stop_at`: an ancestor sorts before
    /// its descendants, siblings by index.
    pub fn compare_hierarchy(&self, a: NodeId, b: NodeId, stop_at: Option<NodeId>) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        self.index_path(a, stop_at).cmp(&self.index_path(b, stop_at))
    }
}
