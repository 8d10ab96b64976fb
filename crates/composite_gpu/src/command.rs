//! Command recording
//!
//! A [`CommandBuffer`] is an ordered list of GPU operations recorded on the
//! CPU and later handed to [`crate::GpuDevice::execute`]. Temporary targets
//! are scoped to one buffer: every `get_temporary` must be matched by a
//! `release_temporary` before submission.

use crate::device::{MaterialHandle, RenderTargetHandle, TextureId};
use crate::mesh::Mesh;
use composite_core::{Color, Mat4};

/// Temporary full-screen target scoped to one command buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TempTargetId(pub u32);

/// Anything a command can read from or render into
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureRef {
    Target(RenderTargetHandle),
    Temporary(TempTargetId),
    External(TextureId),
}

/// Blur shader passes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlitPass {
    /// One separable blur step
    Blur,
    /// Threshold/power/multiplier/limit only
    Cutoff,
    /// Blur step followed by cutoff in the same pass
    BlurCutoff,
}

/// Per-draw material overrides
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyBlock {
    pub color: Option<Color>,
    pub main_texture: Option<TextureRef>,
    /// Added to the texture sample; `(1,1,1,0)` turns alpha-only textures
    /// into white glyph coverage.
    pub texture_sample_add: Option<[f32; 4]>,
    pub gamma_to_linear: bool,
}

impl PropertyBlock {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Single recorded operation
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    SetRenderTarget(TextureRef),
    ClearRenderTarget {
        clear_depth: bool,
        color: Option<Color>,
        depth: f32,
    },
    SetViewProjection {
        view: Mat4,
        projection: Mat4,
    },
    DrawMesh {
        mesh: Mesh,
        matrix: Mat4,
        material: MaterialHandle,
        properties: PropertyBlock,
    },
    GetTemporary {
        id: TempTargetId,
        width: u32,
        height: u32,
    },
    ReleaseTemporary(TempTargetId),
    SetGlobalVector {
        name: &'static str,
        value: [f32; 4],
    },
    SetGlobalFloat {
        name: &'static str,
        value: f32,
    },
    Blit {
        source: TextureRef,
        dest: TextureRef,
        material: MaterialHandle,
        pass: BlitPass,
    },
    CopyTexture {
        source: TextureRef,
        dest: TextureRef,
    },
}

/// Ordered list of commands
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandBuffer {
    name: String,
    commands: Vec<Command>,
    next_temporary: u32,
}

impl CommandBuffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Drop all recorded commands, keeping the allocation.
    pub fn clear(&mut self) {
        self.commands.clear();
        self.next_temporary = 0;
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::DrawMesh { .. }))
            .count()
    }

    pub fn set_render_target(&mut self, target: TextureRef) {
        self.commands.push(Command::SetRenderTarget(target));
    }

    pub fn clear_render_target(&mut self, clear_depth: bool, color: Option<Color>, depth: f32) {
        self.commands.push(Command::ClearRenderTarget {
            clear_depth,
            color,
            depth,
        });
    }

    pub fn set_view_projection(&mut self, view: Mat4, projection: Mat4) {
        self.commands
            .push(Command::SetViewProjection { view, projection });
    }

    pub fn draw_mesh(&mut self, mesh: &Mesh, matrix: Mat4, material: MaterialHandle, properties: &PropertyBlock) {
        self.commands.push(Command::DrawMesh {
            mesh: mesh.clone(),
            matrix,
            material,
            properties: properties.clone(),
        });
    }

    /// Reserve a temporary target for the rest of this buffer.
    pub fn get_temporary(&mut self, width: u32, height: u32) -> TempTargetId {
        let id = TempTargetId(self.next_temporary);
        self.next_temporary += 1;
        self.commands.push(Command::GetTemporary { id, width, height });
        id
    }

    pub fn release_temporary(&mut self, id: TempTargetId) {
        self.commands.push(Command::ReleaseTemporary(id));
    }

    pub fn set_global_vector(&mut self, name: &'static str, value: [f32; 4]) {
        self.commands.push(Command::SetGlobalVector { name, value });
    }

    pub fn set_global_float(&mut self, name: &'static str, value: f32) {
        self.commands.push(Command::SetGlobalFloat { name, value });
    }

    pub fn blit(&mut self, source: TextureRef, dest: TextureRef, material: MaterialHandle, pass: BlitPass) {
        self.commands.push(Command::Blit {
            source,
            dest,
            material,
            pass,
        });
    }

    pub fn copy_texture(&mut self, source: TextureRef, dest: TextureRef) {
        self.commands.push(Command::CopyTexture { source, dest });
    }
}
