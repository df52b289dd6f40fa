//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::state::{AppState, SessionEntry};
use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use doc_chat_core::{SessionError, SessionState, UploadFile};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

type RestError = (StatusCode, String);

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        create_session_handler,
        upload_document_handler,
        download_document_handler,
        end_session_handler,
    ),
    components(
        schemas(CreateSessionResponse, UploadAcceptedResponse)
    ),
    tags(
        (name = "Document Chat API", description = "Upload a PDF, chat about it and navigate its pages.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

/// The response payload sent after successfully creating a session.
#[derive(Serialize, ToSchema)]
pub struct CreateSessionResponse {
    session_id: Uuid,
}

/// The response payload sent once an upload has been accepted.
#[derive(Serialize, ToSchema)]
pub struct UploadAcceptedResponse {
    session_id: Uuid,
    /// Progress and the final outcome are pushed over the session's WebSocket.
    epoch: u64,
    replaced: bool,
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Create a new, empty session.
#[utoipa::path(
    post,
    path = "/sessions",
    responses(
        (status = 201, description = "Session created successfully", body = CreateSessionResponse)
    )
)]
pub async fn create_session_handler(
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let (session_id, _) = app_state.open_session();
    (
        StatusCode::CREATED,
        Json(CreateSessionResponse { session_id }),
    )
}

/// Upload the session's document, replacing the current one if the session is ready or failed.
///
/// Accepts a multipart/form-data request with a single PDF file part.
#[utoipa::path(
    post,
    path = "/sessions/{id}/document",
    request_body(content_type = "multipart/form-data", description = "The PDF document to upload."),
    responses(
        (status = 202, description = "Upload accepted", body = UploadAcceptedResponse),
        (status = 400, description = "Missing or empty file"),
        (status = 404, description = "Unknown session"),
        (status = 409, description = "An upload is already in progress"),
        (status = 415, description = "The file is not a PDF"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("id" = Uuid, Path, description = "The session ID.")
    )
)]
pub async fn upload_document_handler(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, RestError> {
    let entry = find_session(&app_state, session_id)?;

    let file = if let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("Failed to read multipart data: {}", e),
        )
    })? {
        let filename = field.file_name().unwrap_or("untitled.pdf").to_string();
        let media_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field.bytes().await.map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                format!("Failed to read file bytes: {}", e),
            )
        })?;
        UploadFile::new(filename, media_type, data)
    } else {
        return Err((
            StatusCode::BAD_REQUEST,
            "Multipart form must include a file".to_string(),
        ));
    };

    let snapshot = entry.handle.snapshot().await.map_err(session_error)?;
    let replaced = matches!(
        snapshot.state,
        SessionState::Ready | SessionState::Failed { .. }
    );
    info!(
        "Session {}: {} '{}' ({} bytes).",
        session_id,
        if replaced { "replacing with" } else { "uploading" },
        file.filename,
        file.byte_size()
    );
    let result = if replaced {
        entry.handle.replace(file).await
    } else {
        entry.handle.upload(file).await
    };
    let epoch = result.map_err(session_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadAcceptedResponse {
            session_id,
            epoch: epoch.0,
            replaced,
        }),
    ))
}

/// Download the session's current document.
#[utoipa::path(
    get,
    path = "/sessions/{id}/document",
    responses(
        (status = 200, description = "The document bytes, served with their uploaded media type"),
        (status = 404, description = "Unknown session or no document")
    ),
    params(
        ("id" = Uuid, Path, description = "The session ID.")
    )
)]
pub async fn download_document_handler(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, RestError> {
    let entry = find_session(&app_state, session_id)?;
    let download = entry
        .handle
        .download()
        .await
        .map_err(session_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                "The session has no document".to_string(),
            )
        })?;

    let disposition = format!(
        "inline; filename=\"{}\"",
        download.filename.replace(['"', '\\'], "_")
    );
    Ok((
        [
            (header::CONTENT_TYPE, download.media_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        download.data,
    ))
}

/// End a session, releasing its document.
#[utoipa::path(
    delete,
    path = "/sessions/{id}",
    responses(
        (status = 204, description = "Session ended"),
        (status = 404, description = "Unknown session")
    ),
    params(
        ("id" = Uuid, Path, description = "The session ID.")
    )
)]
pub async fn end_session_handler(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, RestError> {
    let entry = app_state
        .sessions
        .remove(session_id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Session not found".to_string()))?;

    // The coordinator may already have stopped; the session is gone either way.
    if let Err(e) = entry.handle.end().await {
        warn!("Session {} was already closed: {}", session_id, e);
    }
    if let Err(e) = entry.handle.shutdown().await {
        warn!("Session {} did not accept shutdown: {}", session_id, e);
    }
    Ok(StatusCode::NO_CONTENT)
}

//=========================================================================================
// Helpers
//=========================================================================================

fn find_session(app_state: &AppState, session_id: Uuid) -> Result<SessionEntry, RestError> {
    app_state
        .sessions
        .get(session_id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Session not found".to_string()))
}

/// Maps a refused session request onto an HTTP status.
pub fn session_status(error: &SessionError) -> StatusCode {
    match error {
        SessionError::InvalidMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        SessionError::EmptyFile | SessionError::EmptyQuery | SessionError::NotReady => {
            StatusCode::BAD_REQUEST
        }
        SessionError::UploadInProgress
        | SessionError::ReplaceNotAllowed { .. }
        | SessionError::QueryAlreadyInFlight => StatusCode::CONFLICT,
        SessionError::CoordinatorClosed => StatusCode::NOT_FOUND,
    }
}

fn session_error(error: SessionError) -> RestError {
    let status = session_status(&error);
    if status.is_server_error() {
        error!("Session request failed: {}", error);
    } else {
        warn!("Session request rejected: {}", error);
    }
    (status, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_client_statuses() {
        assert_eq!(
            session_status(&SessionError::InvalidMediaType {
                found: "text/plain".to_string()
            }),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            session_status(&SessionError::EmptyFile),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            session_status(&SessionError::UploadInProgress),
            StatusCode::CONFLICT
        );
        assert_eq!(
            session_status(&SessionError::CoordinatorClosed),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn openapi_lists_every_route() {
        let doc = ApiDoc::openapi();
        let paths: Vec<_> = doc.paths.paths.keys().cloned().collect();
        assert!(paths.contains(&"/sessions".to_string()));
        assert!(paths.contains(&"/sessions/{id}".to_string()));
        assert!(paths.contains(&"/sessions/{id}/document".to_string()));
    }
}
