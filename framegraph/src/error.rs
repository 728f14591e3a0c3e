use api_types::handle::ResourceHandle;
use thiserror::Error;

/// Failure modes of the runtime, grouped by recovery policy.
///
/// `OutOfMemory` is retried once after a frame retires before surfacing.
/// `InvalidHandle` is a programmer error: it panics in debug builds and is
/// logged (with the offending pass skipped) in release. `BackendError` culls
/// the offending pass and its dependents for the frame. `DeviceLost` flushes
/// all backings and re-materializes on the next frame.
#[derive(Debug, Error)]
pub enum FrameGraphError {
    #[error("out of device memory while materializing '{name}'")]
    OutOfMemory { name: String },

    #[error("stale or invalid resource handle {0:?}")]
    InvalidHandle(ResourceHandle),

    #[error("descriptor mismatch while replacing backing of {0:?}")]
    DescriptorMismatch(ResourceHandle),

    #[error("validation failure: {0}")]
    ValidationFailure(String),

    #[error("backend error in pass '{pass}': {message}")]
    BackendError { pass: String, message: String },

    #[error("device lost: {0}")]
    DeviceLost(String),
}
