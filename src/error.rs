use std::time::Duration;
use thiserror::Error;

/// Errors surfaced at the core's public seams.
///
/// Per-target scan failures are not errors; they are carried inline in each
/// [`crate::scan::GroupScanResult`]. Transient fetch failures are retried
/// internally and only become visible once retries are exhausted.
#[derive(Debug, Error)]
pub enum Error {
    /// The automation client never came up, even after retries. The session
    /// is left in `AuthError` until a caller explicitly retries.
    #[error("automation client failed to start after {attempts} attempt(s): {cause}")]
    Initialization { attempts: u32, cause: anyhow::Error },

    /// An operation that needs a live authenticated session was called
    /// without one. Rejected before any automation-client call is made.
    #[error("operation requires an authenticated session")]
    AuthenticationRequired,

    /// No authentication completed within the configured window.
    #[error("authentication timed out after {}s", .window.as_secs())]
    AuthTimeout { window: Duration },

    /// A scan batch is already running against the single client handle.
    #[error("a group scan is already in progress")]
    ScanInProgress,

    /// Saving or deleting the persisted session artifact failed. Not retried
    /// internally; the caller may retry the whole operation.
    #[error("session artifact persistence failed: {0}")]
    BlobPersistence(anyhow::Error),
}
