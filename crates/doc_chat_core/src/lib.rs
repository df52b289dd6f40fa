pub mod conversation;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod events;
pub mod navigation;
pub mod ports;
pub mod session;
pub mod viewer;

pub use conversation::{ConversationEngine, PendingQuery, QueryStatus, QueryTicket, Resolution};
pub use coordinator::{
    Collaborators, CoordinatorSettings, DocumentDownload, SessionCoordinator, SessionHandle,
    SessionSnapshot, SessionUpdate,
};
pub use domain::{
    Citation, Document, Message, Sender, SessionEpoch, SessionState, UploadFile,
    ACCEPTED_MEDIA_TYPE,
};
pub use error::{SessionError, SessionResult};
pub use events::LifecycleEvent;
pub use navigation::NavigationBridge;
pub use ports::{
    Answer, AnswerRequest, AnsweringService, DocumentRef, DocumentRenderer, PortError,
    PortResult, RenderReporter, RendererReport, TransportEvent, TransportStream, UploadTransport,
};
pub use session::DocumentSessionController;
pub use viewer::{LoadState, PageStep, RenderRequest, ViewerState, Zoom};
