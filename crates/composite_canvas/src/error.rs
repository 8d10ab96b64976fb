//! Canvas error types

use crate::renderer::RendererId;
use crate::scene::NodeId;
use composite_gpu::DeviceError;
use thiserror::Error;

/// Compositor errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompositeError {
    /// Node id is not (or no longer) part of the scene
    #[error("Node {0:?} not found")]
    NodeNotFound(NodeId),

    /// Reparenting would make a node its own ancestor
    #[error("Reparenting {0:?} would create a cycle")]
    HierarchyCycle(NodeId),

    /// Node carries no widget
    #[error("Node {0:?} has no widget")]
    NoWidget(NodeId),

    /// Renderer id is unknown
    #[error("Renderer {0:?} not found")]
    RendererNotFound(RendererId),

    /// A node can host a single renderer
    #[error("Node {0:?} already hosts a renderer")]
    RendererExists(NodeId),

    /// Device refused an operation
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Result type for compositor operations
pub type Result<T> = std::result::Result<T, CompositeError>;
