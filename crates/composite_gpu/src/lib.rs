//! Composite GPU
//!
//! The device-facing half of the compositor:
//!
//! - [`GpuDevice`]: the backend boundary (targets, materials, submission)
//! - [`CommandBuffer`]: recorded draws, blits and temporary targets
//! - [`MaterialRegistry`] / [`RenderTargetRegistry`]: ref-counted sharing of
//!   device resources keyed by configuration
//! - [`HeadlessDevice`]: a validating, recording backend without a GPU

pub mod command;
pub mod device;
pub mod headless;
pub mod material;
pub mod mesh;
pub mod render_target;
pub mod repository;

pub use command::{BlitPass, Command, CommandBuffer, PropertyBlock, TempTargetId, TextureRef};
pub use device::{DeviceError, GpuDevice, MaterialHandle, RenderTargetHandle, Result, TextureId};
pub use headless::{DeviceStats, HeadlessDevice, Submission};
pub use material::{BlendFactor, BlendType, ColorMode, MaterialDesc, MaterialKey, MaterialRegistry, ShaderKind};
pub use mesh::{Mesh, UiVertex};
pub use render_target::{
    prefer_size, DownSamplingRate, RenderTargetDesc, RenderTargetKey, RenderTargetRegistry, TargetOwner,
};
pub use repository::{RepositoryStats, SharedRepository};
