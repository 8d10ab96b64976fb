//! Composite materials
//!
//! Materials are derived from a small configuration tuple: which shader, the
//! color mode (a shader keyword) and the blend factor pair. Identical tuples
//! share one device material through [`MaterialRegistry`]; changing a
//! renderer's blend mode releases its old material and gets another, never
//! mutating a material other holders may be using.

use crate::device::{GpuDevice, MaterialHandle, Result};
use crate::repository::{RepositoryStats, SharedRepository};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Blend factor applied to source or destination color
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendFactor {
    Zero,
    One,
    DstColor,
    SrcColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcColor,
    DstAlpha,
    OneMinusDstAlpha,
    SrcAlphaSaturate,
    OneMinusSrcAlpha,
}

/// Preset blend configurations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendType {
    /// Factors are set explicitly
    Custom,
    /// Premultiplied alpha: (One, OneMinusSrcAlpha)
    #[default]
    AlphaBlend,
    /// (One, One)
    Additive,
    /// (DstColor, One)
    MultiplyAdditive,
}

impl BlendType {
    /// Factor pair for presets, `None` for `Custom`.
    pub fn factors(self) -> Option<(BlendFactor, BlendFactor)> {
        match self {
            BlendType::Custom => None,
            BlendType::AlphaBlend => Some((BlendFactor::One, BlendFactor::OneMinusSrcAlpha)),
            BlendType::Additive => Some((BlendFactor::One, BlendFactor::One)),
            BlendType::MultiplyAdditive => Some((BlendFactor::DstColor, BlendFactor::One)),
        }
    }
}

/// How the renderer tint combines with the baked texture
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorMode {
    #[default]
    Multiply,
    Additive,
    Subtract,
    Fill,
}

impl ColorMode {
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            ColorMode::Multiply => &[],
            ColorMode::Additive => &["COLOR_MODE_ADDITIVE"],
            ColorMode::Subtract => &["COLOR_MODE_SUBTRACT"],
            ColorMode::Fill => &["COLOR_MODE_FILL"],
        }
    }
}

/// Shader family a material is built from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    /// Draws a baked target as a quad
    Composite,
    /// Draws source widgets into a bake target
    Source,
    /// Full-screen blur and cutoff passes
    Blur,
}

impl ShaderKind {
    pub fn shader_name(self) -> &'static str {
        match self {
            ShaderKind::Composite => "composite/renderer",
            ShaderKind::Source => "composite/source",
            ShaderKind::Blur => "composite/blur",
        }
    }
}

/// Cache key for a material variant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MaterialKey {
    pub shader: ShaderKind,
    pub color_mode: ColorMode,
    pub src_blend: BlendFactor,
    pub dst_blend: BlendFactor,
}

impl MaterialKey {
    pub fn composite(color_mode: ColorMode, src_blend: BlendFactor, dst_blend: BlendFactor) -> Self {
        Self {
            shader: ShaderKind::Composite,
            color_mode,
            src_blend,
            dst_blend,
        }
    }

    /// Default material for source widgets: premultiplied blending so
    /// overlapping translucent draws into one target do not double-blend.
    pub fn source_default() -> Self {
        Self {
            shader: ShaderKind::Source,
            color_mode: ColorMode::Multiply,
            src_blend: BlendFactor::One,
            dst_blend: BlendFactor::OneMinusSrcAlpha,
        }
    }

    pub fn blur() -> Self {
        Self {
            shader: ShaderKind::Blur,
            color_mode: ColorMode::Multiply,
            src_blend: BlendFactor::One,
            dst_blend: BlendFactor::Zero,
        }
    }

    /// Device-facing description of this variant
    pub fn desc(&self) -> MaterialDesc {
        MaterialDesc {
            shader: self.shader.shader_name(),
            keywords: self.color_mode.keywords().iter().copied().collect(),
            src_blend: self.src_blend,
            dst_blend: self.dst_blend,
        }
    }
}

/// What the device needs to build a material
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialDesc {
    pub shader: &'static str,
    pub keywords: SmallVec<[&'static str; 2]>,
    pub src_blend: BlendFactor,
    pub dst_blend: BlendFactor,
}

/// Shared materials keyed by [`MaterialKey`]
#[derive(Debug)]
pub struct MaterialRegistry {
    repo: SharedRepository<MaterialKey, MaterialHandle>,
}

impl Default for MaterialRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MaterialRegistry {
    pub fn new() -> Self {
        Self {
            repo: SharedRepository::new("materials"),
        }
    }

    pub fn valid(&self, key: &MaterialKey, held: Option<MaterialHandle>) -> bool {
        self.repo.valid(key, held)
    }

    /// Resolve `held` to the material for `key`, releasing what it held before.
    pub fn get<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        key: MaterialKey,
        held: &mut Option<MaterialHandle>,
    ) -> Result<MaterialHandle> {
        // Creation and destruction both need the device; destruction of the
        // previous handle is deferred until after the lookup.
        let mut stale = None;
        let handle = self.repo.get(
            key,
            held,
            |k| device.create_material(&k.desc()),
            |old| stale = Some(old),
        );
        if let Some(old) = stale {
            device.destroy_material(old);
        }
        handle
    }

    pub fn release<D: GpuDevice + ?Sized>(&mut self, device: &mut D, held: &mut Option<MaterialHandle>) {
        self.repo.release(held, |h| device.destroy_material(h));
    }

    pub fn key_of(&self, handle: MaterialHandle) -> Option<&MaterialKey> {
        self.repo.key_of(handle)
    }

    pub fn ref_count(&self, key: &MaterialKey) -> usize {
        self.repo.ref_count(key)
    }

    pub fn active_count(&self) -> usize {
        self.repo.active_count()
    }

    pub fn stats(&self) -> RepositoryStats {
        self.repo.stats()
    }

    pub fn clear<D: GpuDevice + ?Sized>(&mut self, device: &mut D) {
        self.repo.clear(|h| device.destroy_material(h));
    }
}
