//! Device boundary
//!
//! The compositor never talks to a graphics API directly. It creates render
//! targets and materials through [`GpuDevice`] and submits recorded
//! [`CommandBuffer`]s. Submission is fire-and-forget: `execute` returns once
//! the work is queued and no fence is waited on.

use crate::command::CommandBuffer;
use crate::material::MaterialDesc;
use crate::render_target::RenderTargetDesc;
use thiserror::Error;

/// Render target owned by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderTargetHandle(pub u64);

/// Material owned by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialHandle(pub u64);

/// Texture owned by the host (widget images, font atlases)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// Device-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The device refused to allocate a render target
    #[error("Render target allocation failed ({width}x{height}): {reason}")]
    TargetAllocation {
        width: u32,
        height: u32,
        reason: String,
    },

    /// The device refused to build a material
    #[error("Material creation failed for shader {shader}: {reason}")]
    MaterialCreation { shader: &'static str, reason: String },

    /// A command referenced a resource that does not exist
    #[error("Command {index} in '{buffer}' references a missing {what}")]
    MissingResource {
        buffer: String,
        index: usize,
        what: &'static str,
    },

    /// A temporary target was acquired but never released
    #[error("Temporary target {id} leaked by command buffer '{buffer}'")]
    LeakedTemporary { buffer: String, id: u32 },

    /// Draw or blit issued without a bound render target
    #[error("Command {index} in '{buffer}' has no render target bound")]
    NoRenderTarget { buffer: String, index: usize },

    /// Generic submission failure
    #[error("Submission failed: {0}")]
    Submit(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Graphics backend used by the compositor
pub trait GpuDevice {
    /// Allocate a color target, with a stencil attachment when requested.
    fn create_render_target(&mut self, desc: &RenderTargetDesc) -> Result<RenderTargetHandle>;

    fn destroy_render_target(&mut self, handle: RenderTargetHandle);

    /// Build a material variant from shader, keywords and blend factors.
    fn create_material(&mut self, desc: &MaterialDesc) -> Result<MaterialHandle>;

    fn destroy_material(&mut self, handle: MaterialHandle);

    /// Queue recorded work. Does not wait for completion.
    fn execute(&mut self, commands: &CommandBuffer) -> Result<()>;

    /// Current output resolution, used to clamp bake targets.
    fn screen_size(&self) -> (u32, u32);
}
