//! services/api/src/web/ws_handler.rs
//!
//! This is the main entry point and control loop for a WebSocket connection.
//! It attaches the connection to a session, forwards the session's updates and renderer
//! directives to the client, and turns client messages into session commands.

use crate::{
    adapters::RendererDirective,
    error::ApiError,
    web::{
        protocol::{
            ClientMessage, LifecycleKind, MessagePayload, ServerMessage, SnapshotPayload,
            StatePayload, ViewPayload,
        },
        state::{AppState, SessionEntry},
    },
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use doc_chat_core::{SessionEpoch, SessionResult, SessionState, SessionUpdate};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>) {
    info!("New WebSocket connection established.");

    // The sender is wrapped in an Arc<Mutex<>> to allow for shared mutable access across tasks.
    let (sender, mut receiver) = socket.split();
    let ws_sender: WsSender = Arc::new(Mutex::new(sender));

    // --- 1. Initialization Phase ---
    let (session_id, entry, _attachment) = match receiver.next().await {
        Some(Ok(Message::Text(init_json))) => match serde_json::from_str::<ClientMessage>(&init_json) {
            Ok(ClientMessage::Init { session_id }) => match app_state.sessions.attach(session_id) {
                Some((entry, attachment)) => (session_id, entry, attachment),
                None => {
                    error!("Init for unknown session {}.", session_id);
                    let _ = send_message(&ws_sender, &ServerMessage::error("Session not found.")).await;
                    return;
                }
            },
            _ => {
                error!("First message was not a valid Init message.");
                let _ = send_message(
                    &ws_sender,
                    &ServerMessage::error("The first message must be init."),
                )
                .await;
                return;
            }
        },
        _ => {
            error!("Client disconnected before sending Init message.");
            return;
        }
    };
    info!("Initializing connection for session {}.", session_id);

    // Subscribe before taking the snapshot so nothing published in between is missed.
    let updates = entry.handle.subscribe();
    let directives = entry.renderer.subscribe();
    if let Err(e) = send_initial_view(&ws_sender, session_id, &entry).await {
        error!("Failed to initialize session {}: {}", session_id, e);
        return;
    }

    // --- 2. Forward session output to the client ---
    let token = CancellationToken::new();
    let forwarder = {
        let ws_sender = ws_sender.clone();
        let entry = entry.clone();
        let token = token.clone();
        tokio::spawn(async move {
            forward_output(ws_sender, session_id, entry, updates, directives, token).await;
        })
    };

    // --- 3. Main Message Loop ---
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(reply) = handle_text_message(&text, &entry).await {
                    if send_message(&ws_sender, &reply).await.is_err() {
                        break;
                    }
                }
            }
            Some(Ok(Message::Close(_))) => {
                info!("Client sent close message.");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("WebSocket receive failed: {}", e);
                break;
            }
            None => {
                info!("Client disconnected.");
                break;
            }
        }
    }

    // --- 4. Cleanup ---
    // The session outlives the connection; dropping the attachment starts its idle clock.
    token.cancel();
    if let Err(e) = forwarder.await {
        warn!("Forwarder task ended abnormally: {}", e);
    }
    info!("WebSocket connection for session {} closed.", session_id);
}

/// Sends the full snapshot, then re-issues the renderer instructions a late joiner needs.
async fn send_initial_view(
    ws_sender: &WsSender,
    session_id: Uuid,
    entry: &SessionEntry,
) -> Result<(), ApiError> {
    let snapshot = entry.handle.snapshot().await?;
    send_message(
        ws_sender,
        &ServerMessage::SessionInitialized {
            session_id,
            snapshot: SnapshotPayload::from(&snapshot),
        },
    )
    .await?;

    if snapshot.state != SessionState::Ready {
        return Ok(());
    }
    if let Some(document) = &snapshot.document {
        send_message(
            ws_sender,
            &ServerMessage::OpenDocument {
                epoch: snapshot.epoch.0,
                url: document_url(session_id),
                filename: document.filename.clone(),
                byte_size: document.byte_size,
            },
        )
        .await?;
    }
    if let Some(request) = snapshot.viewer.render_request() {
        send_message(
            ws_sender,
            &ServerMessage::render_page(snapshot.epoch.0, request),
        )
        .await?;
    }
    Ok(())
}

async fn forward_output(
    ws_sender: WsSender,
    session_id: Uuid,
    entry: SessionEntry,
    mut updates: tokio::sync::broadcast::Receiver<SessionUpdate>,
    mut directives: tokio::sync::broadcast::Receiver<RendererDirective>,
    token: CancellationToken,
) {
    loop {
        let outgoing = tokio::select! {
            _ = token.cancelled() => break,
            update = updates.recv() => match update {
                Ok(update) => update_message(update),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Session {} client lagged by {} update(s); resending snapshot.", session_id, skipped);
                    if send_initial_view(&ws_sender, session_id, &entry).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(RecvError::Closed) => {
                    info!("Session {} stopped publishing updates.", session_id);
                    break;
                }
            },
            directive = directives.recv() => match directive {
                Ok(directive) => directive_message(session_id, directive),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Session {} client missed {} renderer directive(s).", session_id, skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        if let Err(e) = send_message(&ws_sender, &outgoing).await {
            debug!("Stopped forwarding to session {} client: {}", session_id, e);
            break;
        }
    }
}

/// Applies one client message. Returns a message to send back when the request was refused.
async fn handle_text_message(text: &str, entry: &SessionEntry) -> Option<ServerMessage> {
    let client_msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(client_msg) => client_msg,
        Err(e) => {
            warn!("Failed to deserialize client message: {}", e);
            return Some(ServerMessage::error(format!("Unrecognized message: {e}")));
        }
    };

    let handle = &entry.handle;
    let result: SessionResult<()> = match client_msg {
        ClientMessage::SubmitQuery { text } => handle.submit_query(text).await.map(|seq| {
            debug!("Query accepted as message {}.", seq);
        }),
        ClientMessage::AbandonQuery => handle.abandon_query().await,
        ClientMessage::ActivateCitation { page } => handle.activate_citation(page).await,
        ClientMessage::GoToPage { page } => handle.go_to_page(page).await,
        ClientMessage::StepPage { direction } => handle.step_page(direction.into()).await,
        ClientMessage::SetZoom { percent } => handle.set_zoom(percent).await,
        ClientMessage::ZoomIn => handle.zoom_in().await,
        ClientMessage::ZoomOut => handle.zoom_out().await,
        ClientMessage::RendererLoaded { epoch, total_pages } => {
            if !entry.renderer.report_loaded(SessionEpoch(epoch), total_pages) {
                debug!("Ignored load report for closed epoch {}.", epoch);
            }
            Ok(())
        }
        ClientMessage::RendererFailed { epoch, reason } => {
            if !entry.renderer.report_failed(SessionEpoch(epoch), reason) {
                debug!("Ignored failure report for closed epoch {}.", epoch);
            }
            Ok(())
        }
        ClientMessage::ReloadViewer => handle.reload_viewer().await,
        ClientMessage::RetryUpload => match handle.retry_upload().await {
            Ok(true) => Ok(()),
            Ok(false) => return Some(ServerMessage::error("There is no failed upload to retry.")),
            Err(e) => Err(e),
        },
        ClientMessage::Init { .. } => {
            warn!("Received subsequent Init message, which is ignored.");
            Ok(())
        }
    };

    match result {
        Ok(()) => None,
        Err(e) => {
            warn!("Client request rejected: {}", e);
            Some(ServerMessage::error(e))
        }
    }
}

fn update_message(update: SessionUpdate) -> ServerMessage {
    match update {
        SessionUpdate::Lifecycle(event) => ServerMessage::Lifecycle {
            epoch: event.epoch().0,
            event: LifecycleKind::from(&event),
        },
        SessionUpdate::State { epoch, state } => ServerMessage::SessionState {
            epoch: epoch.0,
            state: StatePayload::from(&state),
        },
        SessionUpdate::MessageAppended(message) => ServerMessage::MessageAppended {
            message: MessagePayload::from(&message),
        },
        SessionUpdate::TranscriptCleared => ServerMessage::TranscriptCleared,
        SessionUpdate::AwaitingResponse(awaiting) => ServerMessage::AwaitingResponse { awaiting },
        SessionUpdate::View(view) => ServerMessage::ViewChanged {
            view: ViewPayload::from(&view),
        },
    }
}

fn directive_message(session_id: Uuid, directive: RendererDirective) -> ServerMessage {
    match directive {
        RendererDirective::Open {
            epoch,
            filename,
            byte_size,
        } => ServerMessage::OpenDocument {
            epoch: epoch.0,
            url: document_url(session_id),
            filename,
            byte_size,
        },
        RendererDirective::Render { epoch, request } => {
            ServerMessage::render_page(epoch.0, request)
        }
        RendererDirective::Close { epoch } => ServerMessage::CloseDocument { epoch: epoch.0 },
    }
}

fn document_url(session_id: Uuid) -> String {
    format!("/sessions/{session_id}/document")
}

async fn send_message(ws_sender: &WsSender, message: &ServerMessage) -> Result<(), ApiError> {
    let json = serde_json::to_string(message).map_err(|e| ApiError::Internal(e.to_string()))?;
    ws_sender
        .lock()
        .await
        .send(Message::Text(json.into()))
        .await?;
    Ok(())
}
