//! Error types crossing the engine's customer-facing seams.

/// Returned by customer consumers (and by the engine's own [`Emitter`]) to
/// stop the feeding of an operation.
///
/// [`Emitter`]: crate::Emitter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerError {
    /// The operation is already over; the caller should stop producing.
    #[error("operation abandoned")]
    Abandoned,
    /// Customer code failed. The operation aborts with the local failure outcome.
    #[error("customer code failed: {0}")]
    Failed(String),
}

/// Errors returned by a [`Servicer`](crate::Servicer) when asked to start a method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServicerError {
    /// The back does not serve the requested method. Aborts with `RECEPTION_FAILURE`.
    #[error("no such method: {0}")]
    NoSuchMethod(String),
    /// The servicer failed while starting. Aborts with `SERVICER_FAILURE`.
    #[error("servicer failed: {0}")]
    Failed(String),
}

/// Errors from setting up engine infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}
