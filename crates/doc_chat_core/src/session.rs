//! crates/doc_chat_core/src/session.rs
//!
//! The `DocumentSessionController`: owns the active document and its upload lifecycle.
//!
//! Lifecycle: `Idle -> Uploading(p) -> Ready`, with `Uploading -> Failed`, `Failed -> Idle`
//! (retry) and `Ready | Failed -> Uploading` (replace). Every new upload starts a new
//! `SessionEpoch`. Observers learn about transitions through `LifecycleEvent`s on a
//! broadcast channel.

use crate::domain::{Document, SessionEpoch, SessionState, UploadFile, ACCEPTED_MEDIA_TYPE};
use crate::error::{SessionError, SessionResult};
use crate::events::LifecycleEvent;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const DEFAULT_EVENT_CAPACITY: usize = 32;

pub struct DocumentSessionController {
    state: SessionState,
    document: Option<Arc<Document>>,
    epoch: SessionEpoch,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Default for DocumentSessionController {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl DocumentSessionController {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            state: SessionState::Idle,
            document: None,
            epoch: SessionEpoch::default(),
            events,
        }
    }

    /// Subscribes to lifecycle events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    /// Borrows the owned document, if any.
    pub fn document(&self) -> Option<&Document> {
        self.document.as_deref()
    }

    /// A non-owning reference to the document for collaborators such as the renderer.
    pub fn document_ref(&self) -> Option<Weak<Document>> {
        self.document.as_ref().map(Arc::downgrade)
    }

    /// Starts uploading a new document from `Idle`, `Failed` or `Ready`.
    pub fn begin_upload(&mut self, file: UploadFile) -> SessionResult<SessionEpoch> {
        validate_file(&file)?;
        if matches!(self.state, SessionState::Uploading { .. }) {
            warn!("Rejected upload of '{}': an upload is already running.", file.filename);
            return Err(SessionError::UploadInProgress);
        }
        Ok(self.start(file))
    }

    /// Discards the current document and uploads `file` in its place.
    /// Only allowed once the session is `Ready` or `Failed`.
    pub fn replace(&mut self, file: UploadFile) -> SessionResult<SessionEpoch> {
        validate_file(&file)?;
        if !matches!(self.state, SessionState::Ready | SessionState::Failed { .. }) {
            warn!("Rejected replacement while session is {}.", self.state);
            return Err(SessionError::ReplaceNotAllowed {
                state: self.state.label().to_string(),
            });
        }
        Ok(self.start(file))
    }

    fn start(&mut self, file: UploadFile) -> SessionEpoch {
        let previous = self.epoch;
        let next = previous.next();
        self.epoch = next;

        if let Some(old) = self.document.take() {
            info!("Discarding '{}' ({}) for a new upload.", old.filename, previous);
            drop(old);
            self.emit(LifecycleEvent::Replaced { previous, next });
        }

        let document = Document::from_upload(file);
        info!(
            "Upload of '{}' ({} bytes) started for {}.",
            document.filename, document.byte_size, next
        );
        self.document = Some(Arc::new(document));
        self.state = SessionState::Uploading { progress: 0 };
        next
    }

    /// Applies a transport progress report. Values are clamped to `[0, 100]` and
    /// reports that would move progress backwards are ignored.
    ///
    /// Returns the new progress when it visibly changed.
    pub fn on_transport_progress(&mut self, percent: i32) -> Option<u8> {
        let current = match self.state {
            SessionState::Uploading { progress } => progress,
            _ => {
                debug!("Ignoring progress {percent} while session is {}.", self.state);
                return None;
            }
        };
        let clamped = percent.clamp(0, 100) as u8;
        if clamped <= current {
            if clamped < current {
                debug!("Ignoring regressing progress {clamped} (currently {current}).");
            }
            return None;
        }
        self.state = SessionState::Uploading { progress: clamped };
        Some(clamped)
    }

    /// The transport finished. Moves `Uploading` to `Ready` and emits `Ready`.
    ///
    /// Callers that show progress report `on_transport_progress(100)` first so the bar
    /// always finishes before `Ready`.
    pub fn on_transport_complete(&mut self) -> bool {
        if !matches!(self.state, SessionState::Uploading { .. }) {
            debug!("Ignoring completion while session is {}.", self.state);
            return false;
        }
        // Media type was validated before entering `Uploading`.
        let Some(document) = self.document.as_ref() else {
            warn!("Transport completed without an owned document; ignoring.");
            return false;
        };
        let weak = Arc::downgrade(document);
        info!("Document '{}' is ready ({}).", document.filename, self.epoch);
        self.state = SessionState::Ready;
        self.emit(LifecycleEvent::Ready {
            epoch: self.epoch,
            document: weak,
        });
        true
    }

    /// The transport gave up. Moves `Uploading` to `Failed(reason)`.
    pub fn on_transport_failure(&mut self, reason: impl Into<String>) -> bool {
        if !matches!(self.state, SessionState::Uploading { .. }) {
            debug!("Ignoring transport failure while session is {}.", self.state);
            return false;
        }
        let reason = reason.into();
        warn!("Upload failed for {}: {}", self.epoch, reason);
        self.state = SessionState::Failed {
            reason: reason.clone(),
        };
        self.emit(LifecycleEvent::Failed {
            epoch: self.epoch,
            reason,
        });
        true
    }

    /// Returns a `Failed` session to `Idle`, releasing the failed document.
    pub fn retry(&mut self) -> bool {
        if !matches!(self.state, SessionState::Failed { .. }) {
            return false;
        }
        self.document = None;
        self.state = SessionState::Idle;
        info!("Session reset to idle after failure ({}).", self.epoch);
        true
    }

    /// Tears the session down, releasing the document.
    pub fn end(&mut self) {
        let had_session = self.document.take().is_some() || self.state != SessionState::Idle;
        self.state = SessionState::Idle;
        if had_session {
            info!("Session {} ended.", self.epoch);
            self.emit(LifecycleEvent::Ended { epoch: self.epoch });
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine; nobody is observing yet.
        let _ = self.events.send(event);
    }
}

fn validate_file(file: &UploadFile) -> SessionResult<()> {
    if file.media_type != ACCEPTED_MEDIA_TYPE {
        warn!(
            "Rejected '{}': media type '{}' is not accepted.",
            file.filename, file.media_type
        );
        return Err(SessionError::InvalidMediaType {
            found: file.media_type.clone(),
        });
    }
    if file.data.is_empty() {
        warn!("Rejected '{}': file is empty.", file.filename);
        return Err(SessionError::EmptyFile);
    }
    Ok(())
}
