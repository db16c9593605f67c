// Renderer error taxonomy
//
// Everything is propagated as anyhow::Error with context attached at the
// call site. The conditions a caller has to tell apart are raised as a
// RenderError so they can be recovered with `downcast_ref`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// No physical device passed the capability checks
    #[error("no suitable physical device found: {0}")]
    NoSuitableDevice(String),

    /// The surface cannot be used the way the swapchain needs it
    #[error("surface is not usable for presentation: {0}")]
    UnsupportedSurface(String),

    /// A SPIR-V file is missing or malformed
    #[error("shader `{}` is invalid: {reason}", path.display())]
    InvalidShader { path: PathBuf, reason: String },

    /// More textures were pushed than the bindless array can hold
    #[error("bindless texture capacity exceeded: {requested} textures requested, capacity is {capacity}")]
    BindlessCapacityExceeded { requested: usize, capacity: u32 },

    /// A map was rejected before any GPU work was recorded
    #[error("invalid map: {0}")]
    InvalidMap(String),

    /// A bounded fence wait expired; the GPU is presumed hung
    #[error("timed out after {} ms waiting for the {what} fence, the device is presumed lost", timeout.as_millis())]
    FenceTimeout { what: &'static str, timeout: Duration },

    /// The driver reported VK_ERROR_DEVICE_LOST
    #[error("device lost while waiting for the {what} fence")]
    DeviceLost { what: &'static str },

    /// The swapchain no longer matches the surface and must be recreated
    #[error("swapchain is out of date")]
    SwapchainOutOfDate,
}

impl RenderError {
    /// Fatal errors leave the GPU in an unknown state; the caller must stop
    /// rendering instead of drawing the next frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RenderError::FenceTimeout { .. } | RenderError::DeviceLost { .. }
        )
    }
}

/// True when `err` (or anything in its context chain) is a fatal RenderError
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<RenderError>())
        .any(RenderError::is_fatal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn messages_are_single_line_and_non_empty() {
        let errors = [
            RenderError::NoSuitableDevice("integrated GPUs are skipped".into()),
            RenderError::UnsupportedSurface("no B8G8R8A8_UNORM format".into()),
            RenderError::InvalidShader {
                path: PathBuf::from("shaders/gbuffer.vert.spv"),
                reason: "file not found".into(),
            },
            RenderError::BindlessCapacityExceeded { requested: 20, capacity: 16 },
            RenderError::InvalidMap("primitive 0 has no indices".into()),
            RenderError::FenceTimeout { what: "render", timeout: Duration::from_secs(1) },
            RenderError::DeviceLost { what: "transfer" },
            RenderError::SwapchainOutOfDate,
        ];

        for err in errors {
            let message = err.to_string();
            assert!(!message.is_empty());
            assert!(!message.contains('\n'), "{message}");
            assert!(message.is_ascii(), "{message}");
        }
    }

    #[test]
    fn fence_timeout_reports_milliseconds() {
        let err = RenderError::FenceTimeout { what: "render", timeout: Duration::from_millis(1500) };
        assert!(err.to_string().contains("1500 ms"));
    }

    #[test]
    fn only_sync_failures_are_fatal() {
        assert!(RenderError::FenceTimeout { what: "render", timeout: Duration::from_secs(1) }.is_fatal());
        assert!(RenderError::DeviceLost { what: "render" }.is_fatal());
        assert!(!RenderError::SwapchainOutOfDate.is_fatal());
        assert!(!RenderError::InvalidMap("empty".into()).is_fatal());
    }

    #[test]
    fn fatal_errors_survive_added_context() {
        let err: anyhow::Result<()> = Err(RenderError::DeviceLost { what: "render" }.into());
        let err = err.context("Failed to draw frame").unwrap_err();
        assert!(is_fatal(&err));

        let err = anyhow::anyhow!("plain failure");
        assert!(!is_fatal(&err));
    }
}
