//! services/api/src/adapters/transport.rs
//!
//! An upload transport that stages the document's bytes into a local directory in
//! fixed-size chunks, reporting progress after every chunk.
//! It implements the `UploadTransport` port from the `core` crate.

use async_stream::stream;
use doc_chat_core::{Document, DocumentRef, TransportEvent, TransportStream, UploadTransport};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// Writes uploads to `<dir>/<document id>.pdf`. A staged file lives until the session
/// releases its document.
#[derive(Clone, Debug)]
pub struct StagedFileTransport {
    dir: PathBuf,
    chunk_bytes: usize,
}

impl StagedFileTransport {
    /// Creates a new `StagedFileTransport`.
    pub fn new(dir: impl Into<PathBuf>, chunk_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    pub fn staged_path(&self, document_id: Uuid) -> PathBuf {
        self.dir.join(format!("{document_id}.pdf"))
    }
}

/// Removes a partially written file unless the transfer finished.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    fn keep(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            remove_staged(&self.path);
        }
    }
}

fn remove_staged(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed staged upload {:?}.", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove staged upload {:?}: {}", path, e),
    }
}

//=========================================================================================
// `UploadTransport` Trait Implementation
//=========================================================================================

impl UploadTransport for StagedFileTransport {
    fn start(&self, document: &Document) -> TransportStream {
        let dir = self.dir.clone();
        let path = self.staged_path(document.id);
        let data = document.data.clone();
        let chunk_bytes = self.chunk_bytes;
        let filename = document.filename.clone();

        Box::pin(stream! {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                error!("Could not create upload directory {:?}: {}", dir, e);
                yield TransportEvent::Failed(format!("could not prepare storage: {e}"));
                return;
            }
            let mut file = match tokio::fs::File::create(&path).await {
                Ok(file) => file,
                Err(e) => {
                    error!("Could not create {:?}: {}", path, e);
                    yield TransportEvent::Failed(format!("could not create file: {e}"));
                    return;
                }
            };
            let mut guard = PartialFile::new(&path);

            yield TransportEvent::Progress(0);
            let total = data.len();
            let mut written = 0usize;
            for chunk in data.chunks(chunk_bytes) {
                if let Err(e) = file.write_all(chunk).await {
                    error!("Write to {:?} failed after {} bytes: {}", path, written, e);
                    yield TransportEvent::Failed(format!("write failed: {e}"));
                    return;
                }
                written += chunk.len();
                yield TransportEvent::Progress((written * 100 / total.max(1)) as i32);
            }
            if let Err(e) = file.sync_all().await {
                yield TransportEvent::Failed(format!("could not flush file: {e}"));
                return;
            }
            guard.keep();
            info!("Staged '{}' at {:?} ({} bytes).", filename, path, written);
            yield TransportEvent::Completed;
        })
    }

    fn release(&self, document: &DocumentRef) {
        remove_staged(&self.staged_path(document.id));
    }
}
