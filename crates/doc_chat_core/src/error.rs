//! crates/doc_chat_core/src/error.rs
//!
//! Local validation failures returned synchronously by the session components.
//! None of these mutate state.

/// Errors raised when a caller asks a session component for something it cannot do right now.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Unsupported media type '{found}', only PDF documents are accepted")]
    InvalidMediaType { found: String },
    #[error("The uploaded file is empty")]
    EmptyFile,
    #[error("An upload is already in progress")]
    UploadInProgress,
    #[error("A document can only be replaced once the session is ready or failed (currently {state})")]
    ReplaceNotAllowed { state: String },
    #[error("No document is ready for this session")]
    NotReady,
    #[error("The query is empty")]
    EmptyQuery,
    #[error("A query is already awaiting a response")]
    QueryAlreadyInFlight,
    #[error("The session coordinator has shut down")]
    CoordinatorClosed,
}

pub type SessionResult<T> = Result<T, SessionError>;
