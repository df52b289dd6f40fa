//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the browser client and the API server
//! for the document chat application.

use doc_chat_core::{
    Citation, DocumentRef, LifecycleEvent, LoadState, Message, PageStep, RenderRequest, Sender,
    SessionSnapshot, SessionState, ViewerState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attaches the connection to a session. This must be the first message sent on the connection.
    Init { session_id: Uuid },

    SubmitQuery { text: String },

    /// Gives up on the query currently awaiting a response.
    AbandonQuery,

    /// The user selected a citation attached to an assistant message.
    ActivateCitation { page: u32 },

    GoToPage { page: i64 },

    StepPage { direction: StepDirection },

    SetZoom { percent: i32 },

    ZoomIn,

    ZoomOut,

    /// The client's PDF engine finished loading the document it was told to open.
    RendererLoaded { epoch: u64, total_pages: u32 },

    /// The client's PDF engine could not load or draw the document.
    RendererFailed { epoch: u64, reason: String },

    ReloadViewer,

    RetryUpload,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepDirection {
    Previous,
    Next,
}

impl From<StepDirection> for PageStep {
    fn from(direction: StepDirection) -> Self {
        match direction {
            StepDirection::Previous => PageStep::Previous,
            StepDirection::Next => PageStep::Next,
        }
    }
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the connection is attached, with everything needed to draw the session.
    SessionInitialized {
        session_id: Uuid,
        snapshot: SnapshotPayload,
    },

    SessionState { epoch: u64, state: StatePayload },

    /// A document lifecycle transition. `session_state` carries the resulting state.
    Lifecycle { epoch: u64, event: LifecycleKind },

    MessageAppended { message: MessagePayload },

    /// The transcript was reset because the document went away.
    TranscriptCleared,

    /// Whether a query is pending. The UI shows a loading indicator and disables input while `true`.
    AwaitingResponse { awaiting: bool },

    ViewChanged { view: ViewPayload },

    /// Tells the client's PDF engine to fetch and open the session's document.
    OpenDocument {
        epoch: u64,
        url: String,
        filename: String,
        byte_size: u64,
    },

    RenderPage {
        epoch: u64,
        page: u32,
        zoom_percent: u16,
    },

    CloseDocument { epoch: u64 },

    /// Reports a rejected request or a fatal connection error.
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl ToString) -> Self {
        ServerMessage::Error {
            message: message.to_string(),
        }
    }

    pub fn render_page(epoch: u64, request: RenderRequest) -> Self {
        ServerMessage::RenderPage {
            epoch,
            page: request.page,
            zoom_percent: request.zoom.percent(),
        }
    }
}

//=========================================================================================
// Payloads
//=========================================================================================

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatePayload {
    Idle,
    Uploading { progress: u8 },
    Ready,
    Failed { reason: String },
}

impl From<&SessionState> for StatePayload {
    fn from(state: &SessionState) -> Self {
        match state {
            SessionState::Idle => StatePayload::Idle,
            SessionState::Uploading { progress } => StatePayload::Uploading {
                progress: *progress,
            },
            SessionState::Ready => StatePayload::Ready,
            SessionState::Failed { reason } => StatePayload::Failed {
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Ready,
    Failed,
    Replaced,
    Ended,
}

impl From<&LifecycleEvent> for LifecycleKind {
    fn from(event: &LifecycleEvent) -> Self {
        match event {
            LifecycleEvent::Ready { .. } => LifecycleKind::Ready,
            LifecycleEvent::Failed { .. } => LifecycleKind::Failed,
            LifecycleEvent::Replaced { .. } => LifecycleKind::Replaced,
            LifecycleEvent::Ended { .. } => LifecycleKind::Ended,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CitationPayload {
    pub target_page: u32,
    pub label: String,
}

impl From<&Citation> for CitationPayload {
    fn from(citation: &Citation) -> Self {
        Self {
            target_page: citation.target_page,
            label: citation.label.clone(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MessagePayload {
    pub seq: u64,
    pub sender: &'static str,
    pub body: String,
    pub citations: Vec<CitationPayload>,
    pub created_at: DateTime<Utc>,
    pub is_error: bool,
}

impl From<&Message> for MessagePayload {
    fn from(message: &Message) -> Self {
        let sender = match message.sender {
            Sender::User => "user",
            Sender::Assistant => "assistant",
            Sender::System => "system",
        };
        Self {
            seq: message.seq,
            sender,
            body: message.body.clone(),
            citations: message.citations.iter().map(CitationPayload::from).collect(),
            created_at: message.created_at,
            is_error: message.is_error,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadPayload {
    Loading,
    Loaded,
    Error { reason: String },
}

/// Toolbar data: page indicator, zoom and which controls are inert.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ViewPayload {
    pub current_page: u32,
    pub total_pages: Option<u32>,
    pub zoom_percent: u16,
    pub load: LoadPayload,
    pub can_go_previous: bool,
    pub can_go_next: bool,
    pub can_zoom_in: bool,
    pub can_zoom_out: bool,
}

impl From<&ViewerState> for ViewPayload {
    fn from(view: &ViewerState) -> Self {
        let load = match view.load_state() {
            LoadState::Loading => LoadPayload::Loading,
            LoadState::Loaded => LoadPayload::Loaded,
            LoadState::Error { reason } => LoadPayload::Error {
                reason: reason.clone(),
            },
        };
        Self {
            current_page: view.current_page(),
            total_pages: view.total_pages(),
            zoom_percent: view.zoom().percent(),
            load,
            can_go_previous: view.can_go_previous(),
            can_go_next: view.can_go_next(),
            can_zoom_in: view.can_zoom_in(),
            can_zoom_out: view.can_zoom_out(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DocumentPayload {
    pub id: Uuid,
    pub filename: String,
    pub byte_size: u64,
}

impl From<&DocumentRef> for DocumentPayload {
    fn from(document: &DocumentRef) -> Self {
        Self {
            id: document.id,
            filename: document.filename.clone(),
            byte_size: document.byte_size,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SnapshotPayload {
    pub epoch: u64,
    pub state: StatePayload,
    pub document: Option<DocumentPayload>,
    pub messages: Vec<MessagePayload>,
    pub awaiting_response: bool,
    pub view: ViewPayload,
}

impl From<&SessionSnapshot> for SnapshotPayload {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            epoch: snapshot.epoch.0,
            state: StatePayload::from(&snapshot.state),
            document: snapshot.document.as_ref().map(DocumentPayload::from),
            messages: snapshot.messages.iter().map(MessagePayload::from).collect(),
            awaiting_response: snapshot.awaiting_response,
            view: ViewPayload::from(&snapshot.viewer),
        }
    }
}
