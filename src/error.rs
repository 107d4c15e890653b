//! Render error types

use crate::technique::ShaderPassName;
use thiserror::Error;

/// Errors raised by the rendering core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Render host has not been started")]
    NotStarted,
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Failed to create resource: {0}")]
    ResourceCreationFailed(String),
    #[error("Shader pass {0} is not registered")]
    MissingShaderPass(ShaderPassName),
    #[error("Node '{0}' is not attached to a render host")]
    NotAttached(String),
    #[error("Device lost")]
    DeviceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Command list error: {0}")]
    CommandList(String),
    #[error("Draw failed: {0}")]
    Draw(String),
    #[error("Render task for partition starting at {0} panicked")]
    TaskPanicked(usize),
    #[error("Backend error: {0}")]
    Backend(String),
}

impl RenderError {
    /// Whether the error requires tearing down and restarting the device
    pub fn is_device_lost(&self) -> bool {
        matches!(self, RenderError::DeviceLost)
    }
}

pub type RenderResult<T> = Result<T, RenderError>;
