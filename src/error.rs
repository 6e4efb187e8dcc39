use thiserror::Error;

/// Errors surfaced by the engine and its collaborators.
///
/// Transient boundary conditions (a ring `reserve` granting fewer slots than
/// requested, a send finding no capacity) are not errors; they are counted
/// and retried on the next loop iteration.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected before any resource is acquired.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// Arena or ring allocation failure. Fatal, aborts startup.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Interface binding failure at the driver boundary.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Interface binding refused by the platform.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Push attempted after the handoff queue was shut down. A lifecycle bug,
    /// not a retry condition.
    #[error("handoff queue is closed")]
    QueueClosed,

    /// Slot index outside the arena.
    #[error("invalid slot index {index} (slot count {count})")]
    InvalidIndex { index: usize, count: usize },

    /// The boundary itself became invalid mid-run.
    #[error("boundary failure: {0}")]
    Boundary(String),
}
