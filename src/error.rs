//! Unified error handling for slbnc.

use crate::db::DbError;
use thiserror::Error;

/// Errors that can occur while handling a client verb.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The connection must be closed (any pending replies are flushed first).
    #[error("connection closed")]
    Quit,

    /// The whole process should shut down (KILL verb).
    #[error("shutdown requested")]
    Shutdown,

    /// A persistence write failed. Fatal for the handler: the acknowledgment
    /// for the state change must not be emitted.
    #[error("database error: {0}")]
    Db(#[from] DbError),

    /// The peer's outbound queue is gone, i.e. the connection already closed.
    #[error("connection gone")]
    Gone,
}

/// Result type for verb handlers: forward decision or error.
pub type HandlerResult = Result<crate::handlers::Disposition, HandlerError>;
