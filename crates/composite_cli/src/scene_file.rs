//! Scene description files
//!
//! A scene file lists nodes in parent-before-child order. Each node may
//! carry a canvas, a widget (drawn as a single tinted quad) and a renderer
//! with optional effect.
//!
//! ```toml
//! [screen]
//! width = 1280
//! height = 720
//!
//! [[node]]
//! name = "canvas"
//! size = [1280, 720]
//! canvas = {}
//!
//! [[node]]
//! name = "panel"
//! parent = "canvas"
//! size = [320, 200]
//! renderer = { preset = "shadow" }
//! ```

use anyhow::{bail, Context, Result};
use composite_canvas::geometry::build_quad;
use composite_canvas::{
    Camera, Canvas, Compositor, Effect, EffectPreset, LocalTransform, NodeId, RectLayout, RenderMode, RendererId,
    RendererSettings, Widget,
};
use composite_core::{Color, Mat4, Quat, Rect, Size, Vec2, Vec3};
use composite_gpu::{GpuDevice, Mesh};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level scene description
#[derive(Debug, Deserialize, Serialize)]
pub struct SceneFile {
    #[serde(default)]
    pub screen: ScreenConfig,
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeSpec>,
}

/// Headless screen size used for render target clamping
#[derive(Debug, Deserialize, Serialize)]
pub struct ScreenConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub position: [f32; 3],
    /// Euler angles in degrees
    #[serde(default)]
    pub rotation: [f32; 3],
    #[serde(default = "default_scale")]
    pub scale: [f32; 3],
    #[serde(default = "default_size")]
    pub size: [f32; 2],
    #[serde(default = "default_pivot")]
    pub pivot: [f32; 2],
    #[serde(default = "default_one")]
    pub alpha: f32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub canvas: Option<CanvasSpec>,
    #[serde(default)]
    pub widget: Option<WidgetSpec>,
    #[serde(default)]
    pub renderer: Option<RendererSpec>,
}

fn default_scale() -> [f32; 3] {
    [1.0; 3]
}

fn default_size() -> [f32; 2] {
    [100.0, 100.0]
}

fn default_pivot() -> [f32; 2] {
    [0.5, 0.5]
}

fn default_one() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CanvasSpec {
    #[serde(default)]
    pub render_mode: RenderMode,
    #[serde(default = "default_one")]
    pub scale_factor: f32,
    #[serde(default)]
    pub linear_vertex_colors: bool,
    #[serde(default)]
    pub linear_in_shader: bool,
    /// Perspective camera for `ScreenSpaceCamera` canvases
    #[serde(default)]
    pub camera: Option<CameraSpec>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CameraSpec {
    #[serde(default = "default_fov")]
    pub fov: f32,
    #[serde(default = "default_near")]
    pub near: f32,
    #[serde(default = "default_far")]
    pub far: f32,
    /// Distance from the camera to the canvas plane
    #[serde(default = "default_distance")]
    pub distance: f32,
}

fn default_fov() -> f32 {
    60.0
}

fn default_near() -> f32 {
    0.3
}

fn default_far() -> f32 {
    1000.0
}

fn default_distance() -> f32 {
    100.0
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WidgetSpec {
    #[serde(default = "default_white")]
    pub color: [f32; 4],
    #[serde(default)]
    pub depth: Option<i32>,
    /// Quad size; the node size when absent
    #[serde(default)]
    pub size: Option<[f32; 2]>,
}

fn default_white() -> [f32; 4] {
    [1.0; 4]
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RendererSpec {
    #[serde(flatten)]
    pub settings: RendererSettings,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub preset: Option<EffectPreset>,
    /// Explicit effect; applied after the preset
    #[serde(default)]
    pub effect: Option<Effect>,
}

/// Renderers created from a scene file, in file order
#[derive(Debug, Default)]
pub struct BuiltScene {
    pub renderers: Vec<(String, RendererId)>,
}

impl BuiltScene {
    pub fn name_of(&self, id: RendererId) -> &str {
        self.renderers
            .iter()
            .find(|(_, r)| *r == id)
            .map_or("?", |(name, _)| name.as_str())
    }
}

impl SceneFile {
    /// Load and validate a scene file
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid scene {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let scene: SceneFile = toml::from_str(content).context("Failed to parse scene")?;
        scene.validate()?;
        Ok(scene)
    }

    /// Check names, parent references and numeric ranges.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("scene has no nodes");
        }
        if self.screen.width == 0 || self.screen.height == 0 {
            bail!("screen size must be positive");
        }
        let mut seen: FxHashMap<&str, usize> = FxHashMap::default();
        for (index, node) in self.nodes.iter().enumerate() {
            if node.name.is_empty() {
                bail!("node #{index} has an empty name");
            }
            if seen.insert(node.name.as_str(), index).is_some() {
                bail!("duplicate node name `{}`", node.name);
            }
            if let Some(parent) = &node.parent {
                if !seen.contains_key(parent.as_str()) || parent == &node.name {
                    bail!("node `{}` references parent `{parent}` before it is declared", node.name);
                }
            }
            if node.size.iter().any(|v| !v.is_finite() || *v < 0.0) {
                bail!("node `{}` has an invalid size", node.name);
            }
            if !(0.0..=1.0).contains(&node.alpha) {
                bail!("node `{}` alpha must be within 0..=1", node.name);
            }
            if let Some(canvas) = &node.canvas {
                if canvas.scale_factor <= 0.0 {
                    bail!("canvas `{}` scale factor must be positive", node.name);
                }
            }
        }
        Ok(())
    }

    /// Build the hierarchy into the compositor's scene and attach renderers.
    pub fn build<D: GpuDevice>(&self, compositor: &mut Compositor<D>) -> Result<BuiltScene> {
        let aspect = self.screen.width as f32 / self.screen.height as f32;
        let mut ids: FxHashMap<&str, NodeId> = FxHashMap::default();
        for entry in &self.nodes {
            let parent = entry.parent.as_deref().and_then(|p| ids.get(p).copied());
            let scene = compositor.scene_mut();
            let id = scene.add_node(parent, entry.name.as_str())?;
            scene.set_transform(id, entry.transform())?;
            scene.set_layout(id, entry.layout())?;
            scene.set_alpha(id, entry.alpha)?;
            if let Some(canvas) = &entry.canvas {
                scene.set_canvas(id, Some(canvas.to_canvas(aspect)))?;
            }
            if let Some(widget) = &entry.widget {
                scene.set_widget(id, Some(widget.to_widget(entry)))?;
            }
            if !entry.active {
                scene.set_active(id, false)?;
            }
            ids.insert(entry.name.as_str(), id);
        }

        let mut built = BuiltScene::default();
        for entry in &self.nodes {
            let (Some(renderer), Some(&node)) = (&entry.renderer, ids.get(entry.name.as_str())) else {
                continue;
            };
            let id = compositor
                .add_renderer(node, renderer.settings.clone())
                .with_context(|| format!("Failed to attach renderer to `{}`", entry.name))?;
            if let Some(preset) = renderer.preset {
                compositor.apply_preset(id, preset)?;
            }
            if let Some(effect) = &renderer.effect {
                compositor.set_effect(id, Some(effect.clone()))?;
            }
            if !renderer.enabled {
                compositor.set_renderer_enabled(id, false)?;
            }
            tracing::debug!(node = %entry.name, renderer = ?id, "renderer attached");
            built.renderers.push((entry.name.clone(), id));
        }
        Ok(built)
    }
}

impl NodeSpec {
    fn transform(&self) -> LocalTransform {
        let [x, y, z] = self.rotation;
        LocalTransform {
            position: Vec3::new(self.position[0], self.position[1], self.position[2]),
            rotation: Quat::from_euler_degrees(x, y, z),
            scale: Vec3::new(self.scale[0], self.scale[1], self.scale[2]),
        }
    }

    fn layout(&self) -> RectLayout {
        RectLayout {
            size: Size::new(self.size[0], self.size[1]),
            pivot: Vec2::new(self.pivot[0], self.pivot[1]),
        }
    }
}

impl CanvasSpec {
    fn to_canvas(&self, aspect: f32) -> Canvas {
        let camera = self.camera.as_ref().map(|c| {
            Camera::perspective(c.fov, aspect, c.near, c.far, Mat4::translation(0.0, 0.0, -c.distance))
        });
        Canvas {
            render_mode: self.render_mode,
            camera,
            scale_factor: self.scale_factor,
            linear_vertex_colors: self.linear_vertex_colors,
            linear_in_shader: self.linear_in_shader,
        }
    }
}

impl WidgetSpec {
    fn to_widget(&self, node: &NodeSpec) -> Widget {
        let [w, h] = self.size.unwrap_or(node.size);
        let rect = Rect::new(-w * node.pivot[0], -h * node.pivot[1], w, h);
        let mut mesh = Mesh::new();
        build_quad(&mut mesh, rect, [255; 4]);
        let [r, g, b, a] = self.color;
        let mut widget = Widget::new(mesh).with_color(Color::rgba(r, g, b, a));
        if let Some(depth) = self.depth {
            widget = widget.with_depth(depth);
        }
        widget
    }
}
