//! crates/doc_chat_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the external collaborators of a session:
//! the upload transport, the answering service and the document renderer.
//! These traits form the boundary of the hexagonal architecture, so the session logic
//! stays independent of any concrete network, model or rendering engine.

use crate::domain::{Citation, Document, Message, SessionEpoch};
use crate::viewer::RenderRequest;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Weak;
use tokio::sync::mpsc;
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., network, model API).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Upload Transport
//=========================================================================================

/// One observation from the upload transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw progress as reported by the transport; may be out of range or out of order.
    Progress(i32),
    Completed,
    Failed(String),
}

/// Progress events followed by exactly one terminal `Completed` or `Failed`.
pub type TransportStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

pub trait UploadTransport: Send + Sync {
    /// Starts moving the document's bytes and returns the stream observing that transfer.
    /// Dropping the stream abandons the transfer.
    fn start(&self, document: &Document) -> TransportStream;

    /// Releases whatever a finished transfer left behind for `document`.
    /// Called once the session stops owning the document (replace, retry, end).
    fn release(&self, _document: &DocumentRef) {}
}

//=========================================================================================
// Answering Service
//=========================================================================================

/// Identity of the document a question is about. Holds no ownership of the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub id: Uuid,
    pub filename: String,
    pub byte_size: u64,
}

impl From<&Document> for DocumentRef {
    fn from(document: &Document) -> Self {
        Self {
            id: document.id,
            filename: document.filename.clone(),
            byte_size: document.byte_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub document: DocumentRef,
    pub query: String,
    /// Transcript preceding the query, oldest first.
    pub transcript: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
}

#[async_trait]
pub trait AnsweringService: Send + Sync {
    /// Answers a question about a document, citing the pages the answer draws on.
    async fn answer(&self, request: AnswerRequest) -> PortResult<Answer>;
}

//=========================================================================================
// Document Renderer
//=========================================================================================

/// What a renderer reports back about a document it was asked to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendererReport {
    Loaded { epoch: SessionEpoch, total_pages: u32 },
    Failed { epoch: SessionEpoch, reason: String },
}

/// Channel a renderer uses to report load results for one opened document.
#[derive(Debug, Clone)]
pub struct RenderReporter {
    epoch: SessionEpoch,
    tx: mpsc::UnboundedSender<RendererReport>,
}

impl RenderReporter {
    pub fn new(epoch: SessionEpoch, tx: mpsc::UnboundedSender<RendererReport>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    pub fn loaded(&self, total_pages: u32) {
        let _ = self.tx.send(RendererReport::Loaded {
            epoch: self.epoch,
            total_pages,
        });
    }

    pub fn failed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(RendererReport::Failed {
            epoch: self.epoch,
            reason: reason.into(),
        });
    }
}

pub trait DocumentRenderer: Send + Sync {
    /// Begins loading a document. The page count (or a load failure) is reported later
    /// through `reporter`.
    fn open(&self, document: Weak<Document>, reporter: RenderReporter);

    /// Draws a page at a zoom level. Only called once the document has loaded.
    fn render(&self, epoch: SessionEpoch, request: RenderRequest);

    /// The document previously opened for `epoch` is gone.
    fn close(&self, epoch: SessionEpoch);
}
