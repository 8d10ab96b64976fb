//! Renderers and dirty tracking
//!
//! A [`Renderer`] owns the bake of one subtree: its settings, the sources
//! registered under it, the held bake target and materials, the optional
//! post effect and the quad geometry that presents the result. The bake
//! itself is driven by [`crate::Compositor`].

use composite_core::{Color, Mat4, Vec2};
use composite_gpu::{
    BlendFactor, BlendType, ColorMode, CommandBuffer, DownSamplingRate, MaterialHandle, Mesh, RenderTargetHandle,
};
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

use crate::effect::Effect;
use crate::scene::NodeId;
use crate::source::SourceId;

new_key_type! {
    /// Renderer registered with a compositor
    pub struct RendererId;
}

/// When a renderer re-bakes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BakingTrigger {
    /// Re-bake when sources or the renderer move or change
    #[default]
    Automatic,
    /// Only on explicit [`crate::Compositor::set_dirty`]
    Manually,
    /// Every frame
    Always,
    /// Once when enabled, then only on explicit requests
    OnEnable,
}

/// Projection used for the bake
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewType {
    /// Perspective when the canvas camera is perspective and any source is
    /// out of the renderer plane
    #[default]
    Automatic,
    Orthographic,
    Perspective,
}

/// Per-renderer configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    pub down_sampling: DownSamplingRate,
    /// Multiply the target size by the canvas scale factor
    pub use_canvas_scaler: bool,
    /// Renderers with the same non-zero group share one target
    pub sharing_group: u32,
    pub view_type: ViewType,
    /// Padding added around the rect, in rect units
    pub extents: Vec2,
    pub culling: bool,
    pub use_stencil: bool,
    pub trigger: BakingTrigger,
    pub show_source_graphics: bool,
    /// Draw the composited quad in front of the live sources
    pub foreground: bool,
    pub color_mode: ColorMode,
    pub blend_type: BlendType,
    pub src_blend: BlendFactor,
    pub dst_blend: BlendFactor,
    pub color: Color,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            down_sampling: DownSamplingRate::X1,
            use_canvas_scaler: true,
            sharing_group: 0,
            view_type: ViewType::Automatic,
            extents: Vec2::ZERO,
            culling: true,
            use_stencil: true,
            trigger: BakingTrigger::Automatic,
            show_source_graphics: true,
            foreground: false,
            color_mode: ColorMode::Multiply,
            blend_type: BlendType::AlphaBlend,
            src_blend: BlendFactor::One,
            dst_blend: BlendFactor::OneMinusSrcAlpha,
            color: Color::WHITE,
        }
    }
}

impl RendererSettings {
    pub fn with_trigger(mut self, trigger: BakingTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_sharing_group(mut self, group: u32) -> Self {
        self.sharing_group = group;
        self
    }

    pub fn with_extents(mut self, extents: Vec2) -> Self {
        self.extents = extents;
        self
    }

    pub fn with_view_type(mut self, view_type: ViewType) -> Self {
        self.view_type = view_type;
        self
    }

    pub fn with_down_sampling(mut self, rate: DownSamplingRate) -> Self {
        self.down_sampling = rate;
        self
    }

    pub fn with_culling(mut self, culling: bool) -> Self {
        self.culling = culling;
        self
    }

    pub fn with_stencil(mut self, use_stencil: bool) -> Self {
        self.use_stencil = use_stencil;
        self
    }

    pub fn with_color_mode(mut self, mode: ColorMode) -> Self {
        self.color_mode = mode;
        self
    }

    /// Select a blend preset; presets overwrite the explicit factors.
    pub fn with_blend_type(mut self, blend: BlendType) -> Self {
        self.blend_type = blend;
        self.sync_blend_factors();
        self
    }

    /// Copy the preset factors of `blend_type` into `src_blend`/`dst_blend`.
    pub fn sync_blend_factors(&mut self) {
        if let Some((src, dst)) = self.blend_type.factors() {
            self.src_blend = src;
            self.dst_blend = dst;
        }
    }

    /// What a move from `old` to `self` requires of the renderer
    pub(crate) fn change_from(&self, old: &RendererSettings) -> SettingsChange {
        let mut change = SettingsChange::default();
        if self.color_mode != old.color_mode
            || self.blend_type != old.blend_type
            || self.src_blend != old.src_blend
            || self.dst_blend != old.dst_blend
            || self.foreground != old.foreground
        {
            change.material = true;
        }
        if self.use_canvas_scaler != old.use_canvas_scaler
            || self.sharing_group != old.sharing_group
            || self.down_sampling != old.down_sampling
            || self.culling != old.culling
            || self.use_stencil != old.use_stencil
            || self.view_type != old.view_type
        {
            change.rebake = true;
        }
        if self.extents != old.extents {
            change.rebake = true;
            change.vertices = true;
        }
        if self.color != old.color {
            change.vertices = true;
        }
        change.source_visibility = self.show_source_graphics != old.show_source_graphics;
        change
    }
}

/// Side effects of a settings edit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SettingsChange {
    pub rebake: bool,
    pub vertices: bool,
    pub material: bool,
    pub source_visibility: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Dirty tracking
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a dirty request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirtyRequest {
    Accepted,
    AlreadyDirty,
    /// Inactive renderers never become dirty
    Inactive,
    /// Non-forced request on a renderer that is not automatic
    Cancelled,
}

/// Clean/Dirty state of one renderer
#[derive(Clone, Debug)]
pub struct DirtyTracker {
    dirty: bool,
    prev_rotation_scale: Mat4,
}

impl Default for DirtyTracker {
    fn default() -> Self {
        Self {
            dirty: false,
            prev_rotation_scale: Mat4::ZERO,
        }
    }
}

impl DirtyTracker {
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Move to Dirty. Forced requests bypass the trigger mode; non-forced
    /// ones only apply to automatic renderers.
    pub fn request(&mut self, force: bool, active: bool, trigger: BakingTrigger) -> DirtyRequest {
        if self.dirty {
            return DirtyRequest::AlreadyDirty;
        }
        if !active {
            return DirtyRequest::Inactive;
        }
        if !force && trigger != BakingTrigger::Automatic {
            return DirtyRequest::Cancelled;
        }
        self.dirty = true;
        DirtyRequest::Accepted
    }

    /// Move to Clean. Returns whether the tracker was dirty.
    pub fn clear(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Record the renderer's local rotation*scale; true when it moved.
    pub fn sample_rotation_scale(&mut self, m: Mat4) -> bool {
        let changed = !self.prev_rotation_scale.approx_eq(&m, 1e-5);
        self.prev_rotation_scale = m;
        changed
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Renderer
// ─────────────────────────────────────────────────────────────────────────────

/// Effect attached to a renderer
#[derive(Clone, Debug)]
pub struct EffectSlot {
    pub effect: Effect,
    pub enabled: bool,
}

/// Bake state of one subtree
#[derive(Debug)]
pub struct Renderer {
    pub(crate) node: NodeId,
    pub(crate) instance: u64,
    pub(crate) settings: RendererSettings,
    pub(crate) tracker: DirtyTracker,
    pub(crate) enabled: bool,
    pub(crate) active: bool,
    pub(crate) sources: Vec<SourceId>,
    pub(crate) bake_target: Option<RenderTargetHandle>,
    pub(crate) displayed: Option<RenderTargetHandle>,
    pub(crate) material: Option<MaterialHandle>,
    pub(crate) material_dirty: bool,
    pub(crate) blur_material: Option<MaterialHandle>,
    pub(crate) effect: Option<EffectSlot>,
    pub(crate) output: Mesh,
    pub(crate) vertices_dirty: bool,
    pub(crate) command_buffer: Option<CommandBuffer>,
    pub(crate) prev_world: Mat4,
    pub(crate) bake_count: u64,
}

impl Renderer {
    pub(crate) fn new(node: NodeId, instance: u64, settings: RendererSettings) -> Self {
        Self {
            node,
            instance,
            settings,
            tracker: DirtyTracker::default(),
            enabled: false,
            active: false,
            sources: Vec::new(),
            bake_target: None,
            displayed: None,
            material: None,
            material_dirty: true,
            blur_material: None,
            effect: None,
            output: Mesh::new(),
            vertices_dirty: true,
            command_buffer: None,
            prev_world: Mat4::ZERO,
            bake_count: 0,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    pub fn is_dirty(&self) -> bool {
        self.tracker.is_dirty()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enabled and active in the hierarchy
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Registered sources, in registration order
    pub fn sources(&self) -> &[SourceId] {
        &self.sources
    }

    /// Target presenting the last successful bake
    pub fn output_texture(&self) -> Option<RenderTargetHandle> {
        self.displayed
    }

    /// Quad geometry presenting the bake, after effect modifications
    pub fn output_mesh(&self) -> &Mesh {
        &self.output
    }

    /// Material used to present the bake
    pub fn material(&self) -> Option<MaterialHandle> {
        self.material
    }

    pub fn effect(&self) -> Option<&EffectSlot> {
        self.effect.as_ref()
    }

    /// Successful bakes performed by this renderer
    pub fn bake_count(&self) -> u64 {
        self.bake_count
    }

    pub(crate) fn active_effect(&self) -> Option<&Effect> {
        self.effect.as_ref().filter(|s| s.enabled).map(|s| &s.effect)
    }

    pub(crate) fn request_dirty(&mut self, force: bool) -> DirtyRequest {
        let result = self.tracker.request(force, self.active, self.settings.trigger);
        match result {
            DirtyRequest::Accepted => tracing::debug!(node = ?self.node, force, "renderer marked dirty"),
            DirtyRequest::Cancelled => {
                tracing::debug!(node = ?self.node, trigger = ?self.settings.trigger, "dirty request cancelled")
            }
            _ => {}
        }
        result
    }
}
