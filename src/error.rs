//! Typed fatal conditions.
//!
//! Functions return `anyhow::Result`; these enums are what ends up inside the
//! `anyhow::Error` so callers (and tests) can `downcast_ref` the cause.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

use crate::frame::FrameState;

/// Unrecoverable renderer failures. None of these are retried.
#[derive(Debug, Error)]
pub enum RendererError {
    #[error("No suitable GPU found.")]
    NoSuitableGpu,

    #[error("No memory type matches filter {type_filter:#b} with properties {properties:?}.")]
    NoSuitableMemoryType {
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("No supported depth format among the candidates.")]
    NoSupportedDepthFormat,

    #[error("Failed to read `{}`: {source}", .path.display())]
    MissingFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported image layout transition: {old:?} to {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("Unsupported window or display handle type.")]
    UnsupportedWindowHandle,

    #[error("SPIR-V code is empty after reading.")]
    EmptyShader,

    #[error("Swapchain no longer matches the surface; recreation is not supported.")]
    SurfaceOutOfDate,

    #[error("Invalid frame state transition: {from:?} -> {to:?}")]
    InvalidFrameTransition { from: FrameState, to: FrameState },
}

/// Reason a physical device was rejected during selection.
#[derive(Debug, Error)]
pub enum SuitabilityError {
    #[error("{0}")]
    Static(&'static str),
    #[error("{0}")]
    Dynamic(String),
}
