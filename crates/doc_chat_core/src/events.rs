//! crates/doc_chat_core/src/events.rs
//!
//! Lifecycle notifications emitted by the `DocumentSessionController`.
//! Other components observe these instead of being called directly.

use crate::domain::{Document, SessionEpoch};
use std::sync::Weak;

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// The upload finished and the document may be used.
    Ready {
        epoch: SessionEpoch,
        document: Weak<Document>,
    },
    /// The upload failed; the session rests in `Failed` until retried or replaced.
    Failed { epoch: SessionEpoch, reason: String },
    /// The document of `previous` was discarded in favour of a new upload.
    Replaced {
        previous: SessionEpoch,
        next: SessionEpoch,
    },
    /// The session was torn down and its document released.
    Ended { epoch: SessionEpoch },
}

impl LifecycleEvent {
    /// The epoch this event belongs to (the new one, for replacements).
    pub fn epoch(&self) -> SessionEpoch {
        match self {
            LifecycleEvent::Ready { epoch, .. }
            | LifecycleEvent::Failed { epoch, .. }
            | LifecycleEvent::Ended { epoch } => *epoch,
            LifecycleEvent::Replaced { next, .. } => *next,
        }
    }
}
