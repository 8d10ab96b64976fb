//! Composite Core
//!
//! Building blocks shared by the composite crates:
//!
//! - **Math**: vectors, quaternions, column-major matrices, rects and colors
//! - **FrameCache**: generation-stamped per-frame memoization
//! - **ResourcePool**: rent/return pooling of reusable objects
//! - **BakeSettings**: project-wide configuration with TOML and env loading

pub mod error;
pub mod frame_cache;
pub mod math;
pub mod pool;
pub mod settings;

pub use error::{CoreError, Result};
pub use frame_cache::{FrameCache, FrameCached, FrameKey, FrameValue};
pub use math::{
    approximately, gamma_to_linear, gamma_to_linear_rgba8, next_power_of_two, Bounds, Color, Mat4,
    Point, Quat, Rect, Size, Vec2, Vec3,
};
pub use pool::ResourcePool;
pub use settings::{BakeSettings, SensitivityEpsilons, TransformSensitivity};
