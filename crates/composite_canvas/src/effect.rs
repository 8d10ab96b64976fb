//! Post-bake effects
//!
//! At most one effect is attached to a renderer. Every effect carries blur
//! parameters and runs the blur/cutoff post pass over the baked target;
//! shadow, outline, glow and mirror additionally reshape the quad that
//! presents the bake. The variants compose their parameters instead of
//! inheriting them: `Glow` holds an outline, which holds a shadow, which
//! holds the blur settings.

use composite_core::{approximately, Color, Rect, Vec2, Vec3};
use composite_gpu::{BlendType, BlitPass, ColorMode, CommandBuffer, MaterialHandle, Mesh, TextureRef, UiVertex};
use serde::{Deserialize, Serialize};

use crate::gradient::Gradient;
use crate::renderer::RendererSettings;

/// Global shader parameter names used by the blur passes
pub const BLUR_OFFSET: &str = "_Blur";
pub const INNER_CUTOFF: &str = "_InnerCutoff";
pub const POWER: &str = "_Power";
pub const MULTIPLIER: &str = "_Multiplier";
pub const LIMIT: &str = "_Limit";

/// Number of offset copies drawn by an outline
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OutlinePattern {
    /// No geometry at all
    X0,
    /// Four diagonal copies
    #[default]
    X4,
    /// Diagonal and cardinal copies
    X8,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameters
// ─────────────────────────────────────────────────────────────────────────────

/// Separable blur with an optional cutoff stage
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurParams {
    /// Radius in logical units, 0..=1
    pub blur: f32,
    /// Horizontal+vertical passes, 1..=10
    pub iteration: u32,
    /// 0.05..=3
    pub power: f32,
    /// 0.05..=3
    pub multiplier: f32,
    /// 0..=1
    pub limit: f32,
}

impl Default for BlurParams {
    fn default() -> Self {
        Self {
            blur: 0.5,
            iteration: 3,
            power: 1.0,
            multiplier: 1.0,
            limit: 1.0,
        }
    }
}

impl BlurParams {
    /// Clamp every field into its valid range.
    pub fn sanitized(mut self) -> Self {
        self.blur = self.blur.clamp(0.0, 1.0);
        self.iteration = self.iteration.clamp(1, 10);
        self.power = self.power.clamp(0.05, 3.0);
        self.multiplier = self.multiplier.clamp(0.05, 3.0);
        self.limit = self.limit.clamp(0.0, 1.0);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowParams {
    pub blur: BlurParams,
    pub distance: Vec2,
}

impl Default for ShadowParams {
    fn default() -> Self {
        Self {
            blur: BlurParams::default(),
            distance: Vec2::new(1.0, -1.0),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlineParams {
    pub shadow: ShadowParams,
    pub pattern: OutlinePattern,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlowParams {
    pub outline: OutlineParams,
    /// 0..=1; below 1 the glow fades out toward the shape
    pub inner_cutoff: f32,
}

impl Default for GlowParams {
    fn default() -> Self {
        Self {
            outline: OutlineParams::default(),
            inner_cutoff: 1.0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorParams {
    pub blur: BlurParams,
    /// Vertical gap between the shape and its reflection
    pub offset: f32,
    pub gradient: Gradient,
    #[serde(skip)]
    samples: Option<Vec<(f32, Color)>>,
}

impl MirrorParams {
    pub fn set_gradient(&mut self, gradient: Gradient) {
        self.gradient = gradient;
        self.samples = None;
    }

    pub(crate) fn invalidate_samples(&mut self) {
        self.samples = None;
    }

    /// Gradient samples, rebuilt after the gradient changed
    fn samples(&mut self) -> &[(f32, Color)] {
        let gradient = &self.gradient;
        self.samples.get_or_insert_with(|| gradient.samples())
    }
}

impl PartialEq for MirrorParams {
    fn eq(&self, other: &Self) -> bool {
        self.blur == other.blur && self.offset == other.offset && self.gradient == other.gradient
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Effect
// ─────────────────────────────────────────────────────────────────────────────

/// Effect attached to a renderer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Effect {
    Blur(BlurParams),
    Shadow(ShadowParams),
    Outline(OutlineParams),
    Glow(GlowParams),
    Mirror(MirrorParams),
}

/// Effect plus the renderer settings it is usually paired with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectPreset {
    Blur,
    Bloom,
    Shadow,
    Outline,
    Glow,
    Mirror,
}

impl EffectPreset {
    /// Effect parameters for this preset
    pub fn effect(self) -> Effect {
        match self {
            EffectPreset::Blur => Effect::Blur(BlurParams::default()),
            EffectPreset::Bloom => Effect::Blur(BlurParams {
                power: 2.0,
                multiplier: 1.5,
                ..Default::default()
            }),
            EffectPreset::Shadow => Effect::Shadow(ShadowParams::default()),
            EffectPreset::Outline => Effect::Outline(OutlineParams::default()),
            EffectPreset::Glow => Effect::Glow(GlowParams {
                outline: OutlineParams {
                    shadow: ShadowParams {
                        blur: BlurParams {
                            blur: 1.0,
                            iteration: 10,
                            ..Default::default()
                        },
                        distance: Vec2::new(5.0, -5.0),
                    },
                    pattern: OutlinePattern::X4,
                },
                inner_cutoff: 0.8,
            }),
            EffectPreset::Mirror => Effect::Mirror(MirrorParams::default()),
        }
    }

    /// Adjust renderer settings the way this preset expects.
    pub fn apply_to(self, settings: &mut RendererSettings) {
        match self {
            EffectPreset::Blur | EffectPreset::Mirror => {}
            EffectPreset::Bloom => {
                settings.blend_type = BlendType::MultiplyAdditive;
                settings.sync_blend_factors();
                settings.foreground = true;
            }
            EffectPreset::Shadow | EffectPreset::Outline => {
                settings.color_mode = ColorMode::Fill;
            }
            EffectPreset::Glow => {
                settings.color_mode = ColorMode::Fill;
                settings.blend_type = BlendType::Additive;
                settings.sync_blend_factors();
                settings.foreground = true;
                settings.color = Color::rgba(0.0, 1.0, 0.0, 0.5);
            }
        }
    }
}

/// What a parameter edit invalidates
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EffectChange {
    /// Baked pixels change; needs a re-bake
    pub pixels: bool,
    /// Only the presenting quad changes; needs a geometry rebuild
    pub geometry: bool,
}

impl Effect {
    pub fn blur_params(&self) -> &BlurParams {
        match self {
            Effect::Blur(b) => b,
            Effect::Shadow(s) => &s.blur,
            Effect::Outline(o) => &o.shadow.blur,
            Effect::Glow(g) => &g.outline.shadow.blur,
            Effect::Mirror(m) => &m.blur,
        }
    }

    pub fn inner_cutoff(&self) -> f32 {
        match self {
            Effect::Glow(g) => g.inner_cutoff,
            _ => 1.0,
        }
    }

    /// Whether any cutoff parameter differs from its neutral value
    pub fn uses_cutoff_pass(&self) -> bool {
        let b = self.blur_params();
        !approximately(self.inner_cutoff(), 1.0)
            || !approximately(b.power, 1.0)
            || !approximately(b.multiplier, 1.0)
            || !approximately(b.limit, 1.0)
    }

    /// Drop cached geometry inputs after an edit.
    pub(crate) fn invalidate_geometry_cache(&mut self) {
        if let Effect::Mirror(m) = self {
            m.invalidate_samples();
        }
    }

    /// Whether the effect reshapes the presenting quad
    pub fn modifies_geometry(&self) -> bool {
        !matches!(self, Effect::Blur(_))
    }

    /// Clamp parameters into range.
    pub fn sanitized(mut self) -> Self {
        match &mut self {
            Effect::Blur(b) => *b = b.sanitized(),
            Effect::Shadow(s) => s.blur = s.blur.sanitized(),
            Effect::Outline(o) => o.shadow.blur = o.shadow.blur.sanitized(),
            Effect::Glow(g) => {
                g.outline.shadow.blur = g.outline.shadow.blur.sanitized();
                g.inner_cutoff = g.inner_cutoff.clamp(0.0, 1.0);
            }
            Effect::Mirror(m) => m.blur = m.blur.sanitized(),
        }
        self
    }

    /// Classify the edit from `old` to `self`.
    pub fn change_from(&self, old: &Effect) -> EffectChange {
        if std::mem::discriminant(self) != std::mem::discriminant(old) {
            return EffectChange {
                pixels: true,
                geometry: true,
            };
        }
        let pixels = self.blur_params() != old.blur_params() || self.inner_cutoff() != old.inner_cutoff();
        let geometry = match (self, old) {
            (Effect::Shadow(a), Effect::Shadow(b)) => a.distance != b.distance,
            (Effect::Outline(a), Effect::Outline(b)) => a.shadow.distance != b.shadow.distance || a.pattern != b.pattern,
            (Effect::Glow(a), Effect::Glow(b)) => {
                a.outline.shadow.distance != b.outline.shadow.distance || a.outline.pattern != b.outline.pattern
            }
            (Effect::Mirror(a), Effect::Mirror(b)) => a.offset != b.offset || a.gradient != b.gradient,
            _ => false,
        };
        EffectChange { pixels, geometry }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Geometry
    // ─────────────────────────────────────────────────────────────────────────

    /// Reshape the presenting quad. `rect` is the rendering rect and `tint`
    /// the renderer color.
    pub fn modify_mesh(&mut self, mesh: &mut Mesh, rect: Rect, tint: [u8; 4]) {
        match self {
            Effect::Blur(_) => {}
            Effect::Shadow(s) => {
                let count = mesh.vertex_count();
                offset_copy(mesh, count, s.distance.x, s.distance.y, tint, false);
            }
            Effect::Outline(o) => outline(mesh, o, tint),
            Effect::Glow(g) => outline(mesh, &g.outline, tint),
            Effect::Mirror(m) => {
                let offset = m.offset;
                mirror(mesh, rect, offset, m.samples());
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Post pass
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether [`Effect::record_post_pass`] would record anything
    pub fn needs_post_pass(&self, target_width: u32, rendering_width: f32) -> bool {
        blur_value(self.blur_params().blur, target_width, rendering_width) > 0.0 || self.uses_cutoff_pass()
    }

    /// Record the blur and cutoff passes over `result`. Temporaries are
    /// acquired and released inside `cb`.
    pub fn record_post_pass(
        &self,
        cb: &mut CommandBuffer,
        result: TextureRef,
        target_size: (u32, u32),
        rendering_width: f32,
        material: MaterialHandle,
    ) {
        let params = self.blur_params();
        let value = blur_value(params.blur, target_size.0, rendering_width);
        let cutoff = self.uses_cutoff_pass();
        if value <= 0.0 && !cutoff {
            return;
        }

        let (w, h) = target_size;
        if value > 0.0 {
            let tmp = TextureRef::Temporary(cb.get_temporary(w, h));
            for i in 0..params.iteration {
                cb.set_global_vector(BLUR_OFFSET, [value, 0.0, 0.0, 0.0]);
                cb.blit(result, tmp, material, BlitPass::Blur);

                cb.set_global_vector(BLUR_OFFSET, [0.0, value, 0.0, 0.0]);
                if cutoff && i + 1 == params.iteration {
                    self.set_cutoff_globals(cb);
                    cb.blit(tmp, result, material, BlitPass::BlurCutoff);
                } else {
                    cb.blit(tmp, result, material, BlitPass::Blur);
                }
            }
            if let TextureRef::Temporary(id) = tmp {
                cb.release_temporary(id);
            }
        } else {
            let id = cb.get_temporary(w, h);
            let tmp = TextureRef::Temporary(id);
            self.set_cutoff_globals(cb);
            cb.blit(result, tmp, material, BlitPass::Cutoff);
            cb.copy_texture(tmp, result);
            cb.release_temporary(id);
        }
    }

    fn set_cutoff_globals(&self, cb: &mut CommandBuffer) {
        let p = self.blur_params();
        cb.set_global_float(INNER_CUTOFF, self.inner_cutoff());
        cb.set_global_float(POWER, p.power);
        cb.set_global_float(MULTIPLIER, p.multiplier);
        cb.set_global_float(LIMIT, p.limit);
    }
}

/// Blur radius in target pixels for a radius in logical units
fn blur_value(blur: f32, target_width: u32, rendering_width: f32) -> f32 {
    if rendering_width <= 0.0 {
        return 0.0;
    }
    blur * (target_width as f32 / rendering_width)
}

/// Offset the first `count` vertices by (x, y) and recolor them, either in
/// place or as an appended copy.
fn offset_copy(mesh: &mut Mesh, count: usize, x: f32, y: f32, tint: [u8; 4], append: bool) {
    if append {
        let start = mesh.vertex_count() as u32;
        let pattern: Vec<u32> = mesh
            .indices
            .iter()
            .copied()
            .filter(|i| (*i as usize) < count)
            .collect();
        mesh.indices.extend(pattern.into_iter().map(|i| start + i));
    }
    for i in 0..count {
        let mut v = mesh.vertices[i];
        v.position[0] += x;
        v.position[1] += y;
        v.color = tint;
        if append {
            mesh.vertices.push(v);
        } else {
            mesh.vertices[i] = v;
        }
    }
}

fn outline(mesh: &mut Mesh, params: &OutlineParams, tint: [u8; 4]) {
    if params.pattern == OutlinePattern::X0 {
        mesh.clear();
        return;
    }
    let count = mesh.vertex_count();
    let Vec2 { x, y } = params.shadow.distance;
    let original_indices = mesh.indices.len();

    let mut copies: Vec<(f32, f32)> = Vec::with_capacity(7);
    if params.pattern >= OutlinePattern::X8 {
        copies.extend([(x, 0.0), (-x, 0.0), (0.0, y), (0.0, -y)]);
    }
    if params.pattern >= OutlinePattern::X4 {
        copies.extend([(x, -y), (-x, y), (-x, -y)]);
    }
    for (dx, dy) in copies {
        // Copy the original triangle pattern, not the copies appended so far.
        let start = mesh.vertex_count() as u32;
        let pattern: Vec<u32> = mesh.indices[..original_indices].to_vec();
        mesh.indices.extend(pattern.into_iter().map(|i| start + i));
        for i in 0..count {
            let mut v = mesh.vertices[i];
            v.position[0] += dx;
            v.position[1] += dy;
            v.color = tint;
            mesh.vertices.push(v);
        }
    }
    offset_copy(mesh, count, x, y, tint, false);
}

fn mirror(mesh: &mut Mesh, rect: Rect, offset: f32, samples: &[(f32, Color)]) {
    mesh.clear();
    for &(time, color) in samples {
        let y = rect.y_min() - rect.height() * time + offset;
        let c = color.to_rgba8();
        mesh.add_vertex(UiVertex::new(Vec3::new(rect.x_min(), y, 0.0), c, Vec2::new(0.0, time)));
        mesh.add_vertex(UiVertex::new(Vec3::new(rect.x_max(), y, 0.0), c, Vec2::new(1.0, time)));
        if time <= 0.0 {
            continue;
        }
        let n = mesh.vertex_count() as u32;
        mesh.add_triangle(n - 4, n - 3, n - 2);
        mesh.add_triangle(n - 2, n - 3, n - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use composite_gpu::{Command, MaterialHandle, RenderTargetHandle};

    fn quad() -> Mesh {
        let mut mesh = Mesh::new();
        for (x, y) in [(0.0, 0.0), (0.0, 10.0), (10.0, 10.0), (10.0, 0.0)] {
            mesh.add_vertex(UiVertex::new(Vec3::new(x, y, 0.0), [255; 4], Vec2::ZERO));
        }
        mesh.add_triangle(0, 1, 2);
        mesh.add_triangle(2, 3, 0);
        mesh
    }

    const TINT: [u8; 4] = [10, 20, 30, 255];
    const TARGET: TextureRef = TextureRef::Target(RenderTargetHandle(1));

    fn blits(cb: &CommandBuffer) -> Vec<BlitPass> {
        cb.commands()
            .iter()
            .filter_map(|c| match c {
                Command::Blit { pass, .. } => Some(*pass),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_shadow_moves_and_recolors_in_place() {
        let mut mesh = quad();
        let mut effect = EffectPreset::Shadow.effect();
        effect.modify_mesh(&mut mesh, Rect::ZERO, TINT);
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.vertices[0].position, [1.0, -1.0, 0.0]);
        assert!(mesh.vertices.iter().all(|v| v.color == TINT));
    }

    #[test]
    fn test_outline_patterns() {
        let mut effect = Effect::Outline(OutlineParams::default());
        let mut mesh = quad();
        effect.modify_mesh(&mut mesh, Rect::ZERO, TINT);
        assert_eq!(mesh.vertex_count(), 16);
        assert_eq!(mesh.triangle_count(), 8);
        // Last appended copy is (-x, -y); the original moved by (+x, +y).
        assert_eq!(mesh.vertices[12].position, [-1.0, 1.0, 0.0]);
        assert_eq!(mesh.vertices[0].position, [1.0, -1.0, 0.0]);
        assert_eq!(&mesh.indices[6..12], &[4, 5, 6, 6, 7, 4]);

        let mut x8 = Effect::Outline(OutlineParams {
            pattern: OutlinePattern::X8,
            ..Default::default()
        });
        let mut mesh = quad();
        x8.modify_mesh(&mut mesh, Rect::ZERO, TINT);
        assert_eq!(mesh.vertex_count(), 32);
        assert_eq!(mesh.triangle_count(), 16);

        let mut x0 = Effect::Outline(OutlineParams {
            pattern: OutlinePattern::X0,
            ..Default::default()
        });
        let mut mesh = quad();
        x0.modify_mesh(&mut mesh, Rect::ZERO, TINT);
        assert!(mesh.is_empty());
    }

    #[test]
    fn test_mirror_builds_gradient_rows() {
        let mut effect = Effect::Mirror(MirrorParams {
            offset: 2.0,
            ..Default::default()
        });
        let mut mesh = quad();
        effect.modify_mesh(&mut mesh, Rect::new(0.0, 0.0, 10.0, 20.0), TINT);
        // Samples at 0, 0.5 and 1: three rows, two quads.
        assert_eq!(mesh.vertex_count(), 6);
        assert_eq!(mesh.triangle_count(), 4);
        assert_eq!(mesh.vertices[0].position, [0.0, 2.0, 0.0]);
        assert_eq!(mesh.vertices[3].position, [10.0, -8.0, 0.0]);
        assert_eq!(mesh.vertices[3].uv, [1.0, 0.5]);
        assert_eq!(mesh.vertices[0].color[3], 255);
        assert_eq!(mesh.vertices[5].color[3], 0);
    }

    #[test]
    fn test_mirror_gradient_cache_invalidates() {
        let mut params = MirrorParams::default();
        assert_eq!(params.samples().len(), 3);
        let mut g = Gradient::default();
        g.alpha_keys[1].time = 0.25;
        g.alpha_keys.push(crate::gradient::AlphaKey { alpha: 0.5, time: 0.75 });
        params.set_gradient(g);
        assert_eq!(params.samples().len(), 4);
    }

    #[test]
    fn test_blur_records_paired_passes() {
        let effect = EffectPreset::Blur.effect();
        let mut cb = CommandBuffer::new("blur");
        effect.record_post_pass(&mut cb, TARGET, (128, 128), 128.0, MaterialHandle(9));
        assert_eq!(blits(&cb), vec![BlitPass::Blur; 6]);
        assert!(matches!(cb.commands().first(), Some(Command::GetTemporary { .. })));
        assert!(matches!(cb.commands().last(), Some(Command::ReleaseTemporary(_))));
    }

    #[test]
    fn test_cutoff_fuses_into_last_iteration() {
        let effect = EffectPreset::Bloom.effect();
        let mut cb = CommandBuffer::new("bloom");
        effect.record_post_pass(&mut cb, TARGET, (64, 64), 128.0, MaterialHandle(9));
        let passes = blits(&cb);
        assert_eq!(passes.len(), 6);
        assert_eq!(passes.last(), Some(&BlitPass::BlurCutoff));
        assert_eq!(passes.iter().filter(|p| **p == BlitPass::BlurCutoff).count(), 1);
    }

    #[test]
    fn test_cutoff_alone_when_blur_is_zero() {
        let effect = Effect::Glow(GlowParams {
            outline: OutlineParams {
                shadow: ShadowParams {
                    blur: BlurParams {
                        blur: 0.0,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                ..Default::default()
            },
            inner_cutoff: 0.5,
        });
        let mut cb = CommandBuffer::new("cutoff");
        effect.record_post_pass(&mut cb, TARGET, (64, 64), 64.0, MaterialHandle(9));
        assert_eq!(blits(&cb), vec![BlitPass::Cutoff]);
        assert!(cb
            .commands()
            .iter()
            .any(|c| matches!(c, Command::CopyTexture { .. })));
    }

    #[test]
    fn test_nothing_recorded_without_blur_or_cutoff() {
        let effect = Effect::Blur(BlurParams {
            blur: 0.0,
            ..Default::default()
        });
        let mut cb = CommandBuffer::new("noop");
        assert!(!effect.needs_post_pass(64, 64.0));
        effect.record_post_pass(&mut cb, TARGET, (64, 64), 64.0, MaterialHandle(9));
        assert!(cb.is_empty());
    }

    #[test]
    fn test_change_classification() {
        let base = EffectPreset::Shadow.effect();
        let mut moved = base.clone();
        if let Effect::Shadow(s) = &mut moved {
            s.distance = Vec2::new(3.0, 3.0);
        }
        assert_eq!(
            moved.change_from(&base),
            EffectChange {
                pixels: false,
                geometry: true
            }
        );

        let mut blurrier = base.clone();
        if let Effect::Shadow(s) = &mut blurrier {
            s.blur.blur = 1.0;
        }
        assert_eq!(
            blurrier.change_from(&base),
            EffectChange {
                pixels: true,
                geometry: false
            }
        );
        assert!(EffectPreset::Blur.effect().change_from(&base).geometry);
    }

    #[test]
    fn test_presets_adjust_renderer() {
        let mut settings = RendererSettings::default();
        EffectPreset::Glow.apply_to(&mut settings);
        assert!(settings.foreground);
        assert_eq!(settings.blend_type, BlendType::Additive);
        assert_eq!(settings.color, Color::rgba(0.0, 1.0, 0.0, 0.5));

        let sanitized = Effect::Blur(BlurParams {
            iteration: 40,
            blur: 3.0,
            ..Default::default()
        })
        .sanitized();
        assert_eq!(sanitized.blur_params().iteration, 10);
        assert_eq!(sanitized.blur_params().blur, 1.0);
    }
}
