//! services/api/src/adapters/renderer.rs
//!
//! The document is drawn by the browser's PDF engine. This adapter implements the
//! `DocumentRenderer` port by turning renderer calls into directives for connected
//! clients, and routes the clients' load reports back to the session.

use doc_chat_core::{Document, DocumentRenderer, RenderReporter, RenderRequest, SessionEpoch};
use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// What a connected client should do with its document view.
#[derive(Debug, Clone, PartialEq)]
pub enum RendererDirective {
    Open {
        epoch: SessionEpoch,
        filename: String,
        byte_size: u64,
    },
    Render {
        epoch: SessionEpoch,
        request: RenderRequest,
    },
    Close {
        epoch: SessionEpoch,
    },
}

/// Renderer bridge for one session.
pub struct ClientRenderer {
    directives: broadcast::Sender<RendererDirective>,
    reporters: Mutex<HashMap<SessionEpoch, RenderReporter>>,
}

impl ClientRenderer {
    pub fn new(capacity: usize) -> Self {
        let (directives, _) = broadcast::channel(capacity.max(1));
        Self {
            directives,
            reporters: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RendererDirective> {
        self.directives.subscribe()
    }

    /// A client finished loading the document opened for `epoch`.
    pub fn report_loaded(&self, epoch: SessionEpoch, total_pages: u32) -> bool {
        match self.reporter(epoch) {
            Some(reporter) => {
                reporter.loaded(total_pages);
                true
            }
            None => false,
        }
    }

    /// A client failed to load or draw the document opened for `epoch`.
    pub fn report_failed(&self, epoch: SessionEpoch, reason: impl Into<String>) -> bool {
        match self.reporter(epoch) {
            Some(reporter) => {
                reporter.failed(reason);
                true
            }
            None => false,
        }
    }

    fn reporter(&self, epoch: SessionEpoch) -> Option<RenderReporter> {
        let reporter = self
            .reporters
            .lock()
            .ok()
            .and_then(|reporters| reporters.get(&epoch).cloned());
        if reporter.is_none() {
            debug!("No open document for {epoch}; ignoring renderer report.");
        }
        reporter
    }

    fn send(&self, directive: RendererDirective) {
        // No connected client is fine; it will get a snapshot on connect.
        let _ = self.directives.send(directive);
    }
}

impl DocumentRenderer for ClientRenderer {
    fn open(&self, document: Weak<Document>, reporter: RenderReporter) {
        let epoch = reporter.epoch();
        let Some(document) = document.upgrade() else {
            reporter.failed("document was released before it could be opened");
            return;
        };
        let directive = RendererDirective::Open {
            epoch,
            filename: document.filename.clone(),
            byte_size: document.byte_size,
        };
        drop(document);

        match self.reporters.lock() {
            Ok(mut reporters) => {
                reporters.insert(epoch, reporter);
            }
            Err(_) => {
                warn!("Renderer reporter table poisoned; {epoch} cannot report back.");
            }
        }
        self.send(directive);
    }

    fn render(&self, epoch: SessionEpoch, request: RenderRequest) {
        self.send(RendererDirective::Render { epoch, request });
    }

    fn close(&self, epoch: SessionEpoch) {
        if let Ok(mut reporters) = self.reporters.lock() {
            reporters.remove(&epoch);
        }
        self.send(RendererDirective::Close { epoch });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use doc_chat_core::{RendererReport, UploadFile, Zoom, ACCEPTED_MEDIA_TYPE};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn open_announces_document_and_routes_reports() {
        let renderer = ClientRenderer::new(8);
        let mut directives = renderer.subscribe();
        let (tx, mut reports) = mpsc::unbounded_channel();
        let document = Arc::new(Document::from_upload(UploadFile::new(
            "slides.pdf",
            ACCEPTED_MEDIA_TYPE,
            Bytes::from_static(b"%PDF"),
        )));

        renderer.open(Arc::downgrade(&document), RenderReporter::new(SessionEpoch(3), tx));
        assert_eq!(
            directives.try_recv().unwrap(),
            RendererDirective::Open {
                epoch: SessionEpoch(3),
                filename: "slides.pdf".to_string(),
                byte_size: 4,
            }
        );

        assert!(renderer.report_loaded(SessionEpoch(3), 12));
        assert!(!renderer.report_loaded(SessionEpoch(2), 12));
        assert_eq!(
            reports.try_recv().unwrap(),
            RendererReport::Loaded {
                epoch: SessionEpoch(3),
                total_pages: 12
            }
        );

        let request = RenderRequest {
            page: 2,
            zoom: Zoom::snap(125),
        };
        renderer.render(SessionEpoch(3), request);
        assert_eq!(
            directives.try_recv().unwrap(),
            RendererDirective::Render {
                epoch: SessionEpoch(3),
                request
            }
        );

        renderer.close(SessionEpoch(3));
        assert!(!renderer.report_failed(SessionEpoch(3), "late"));
    }

    #[test]
    fn released_document_fails_to_open() {
        let renderer = ClientRenderer::new(8);
        let (tx, mut reports) = mpsc::unbounded_channel();
        renderer.open(Weak::new(), RenderReporter::new(SessionEpoch(1), tx));
        assert!(matches!(
            reports.try_recv().unwrap(),
            RendererReport::Failed { .. }
        ));
    }
}
