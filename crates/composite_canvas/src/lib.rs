//! Composite Canvas
//!
//! Bakes UI subtrees into off-screen render targets and presents each bake
//! as a single textured quad.
//!
//! # Pipeline
//!
//! - [`Scene`]: mirror of the host hierarchy (transforms, rects, widgets,
//!   canvases) with structural change events
//! - [`Renderer`]: one baked subtree, with its settings and [`DirtyTracker`]
//! - [`Source`]: per-node content snapshot registered with the nearest
//!   active renderer above it
//! - [`Compositor`]: the render context tying scene, renderers, shared
//!   registries and the frame cache together, and running bakes
//! - [`Effect`]: post-bake passes and quad modifications (blur, shadow,
//!   outline, glow, mirror)
//!
//! # Example
//!
//! ```ignore
//! use composite_canvas::{Compositor, RendererSettings};
//! use composite_core::BakeSettings;
//! use composite_gpu::HeadlessDevice;
//!
//! let mut compositor = Compositor::new(HeadlessDevice::new(1920, 1080), BakeSettings::default());
//! let root = compositor.scene_mut().add_node(None, "canvas")?;
//! let panel = compositor.scene_mut().add_node(Some(root), "panel")?;
//! let renderer = compositor.add_renderer(panel, RendererSettings::default())?;
//! compositor.frame();
//! assert!(compositor.output_texture(renderer).is_some());
//! ```

pub mod compositor;
pub mod culling;
pub mod effect;
pub mod error;
pub mod geometry;
pub mod gradient;
pub mod renderer;
pub mod scene;
pub mod source;
pub mod view;
pub mod walker;

pub use compositor::{BakeOutcome, CacheObject, Compositor};
pub use effect::{
    BlurParams, Effect, EffectChange, EffectPreset, GlowParams, MirrorParams, OutlineParams, OutlinePattern,
    ShadowParams,
};
pub use error::{CompositeError, Result};
pub use gradient::{AlphaKey, ColorKey, Gradient};
pub use renderer::{BakingTrigger, DirtyRequest, DirtyTracker, EffectSlot, Renderer, RendererId, RendererSettings, ViewType};
pub use scene::{
    Camera, Canvas, HierarchyEvent, LocalTransform, Node, NodeId, RectLayout, RenderMode, Scene, TextureFormat, Widget,
    WidgetTexture,
};
pub use source::{Source, SourceId};
pub use view::{orthographic_projection, perspective_projection};
pub use walker::{draw_order, nest_steps, sort_leaves, Leaf, Visit, WalkStep};
