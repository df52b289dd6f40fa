//! crates/doc_chat_core/src/domain.rs
//!
//! Defines the pure, core data structures for the document chat session.
//! These structs are independent of any transport or serialization format.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// The only media type a session will accept for upload.
pub const ACCEPTED_MEDIA_TYPE: &str = "application/pdf";

/// A file as handed to the session by the user, before it becomes a `Document`.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub media_type: String,
    pub data: Bytes,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, media_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            filename: filename.into(),
            media_type: media_type.into(),
            data,
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Represents a document owned by the active session.
///
/// Only the `DocumentSessionController` holds a strong reference; everything
/// else (viewer, renderer, answering requests in flight) borrows it.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    pub filename: String,
    pub byte_size: u64,
    pub media_type: String,
    pub data: Bytes,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn from_upload(file: UploadFile) -> Self {
        Self {
            id: Uuid::new_v4(),
            byte_size: file.byte_size(),
            filename: file.filename,
            media_type: file.media_type,
            data: file.data,
            uploaded_at: Utc::now(),
        }
    }
}

/// Generation counter distinguishing one session instance from the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessionEpoch(pub u64);

impl SessionEpoch {
    pub fn next(self) -> Self {
        SessionEpoch(self.0 + 1)
    }
}

impl fmt::Display for SessionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch#{}", self.0)
    }
}

/// Lifecycle of the uploaded document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Uploading { progress: u8 },
    Ready,
    Failed { reason: String },
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Uploading { .. } => "uploading",
            SessionState::Ready => "ready",
            SessionState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uploading { progress } => write!(f, "uploading ({progress}%)"),
            SessionState::Failed { reason } => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Assistant,
    System,
}

/// A source location in the document attached to an assistant answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    pub target_page: u32,
    pub label: String,
}

impl Citation {
    pub fn new(target_page: u32, label: impl Into<String>) -> Self {
        Self {
            target_page,
            label: label.into(),
        }
    }
}

/// A single entry in the conversation transcript.
///
/// `seq` is the order of truth; `created_at` is informational only.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub seq: u64,
    pub sender: Sender,
    pub body: String,
    pub citations: Vec<Citation>,
    pub created_at: DateTime<Utc>,
    /// Set on assistant messages that report a failed answer.
    pub is_error: bool,
}
