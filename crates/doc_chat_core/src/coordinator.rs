//! crates/doc_chat_core/src/coordinator.rs
//!
//! The single cooperative event loop of a document chat session.
//!
//! `SessionCoordinator` owns the `DocumentSessionController`, the `ConversationEngine`
//! and the `ViewerState`, and is the only place any of them is mutated. It reacts to:
//! - commands sent through a `SessionHandle`,
//! - events from the active upload transport stream,
//! - answers coming back from the answering service,
//! - load reports from the document renderer.
//!
//! Lifecycle events emitted by the controller are drained after every step and fanned
//! out to the conversation and the viewer. Presentation layers watch `SessionUpdate`s.

use crate::conversation::{ConversationEngine, QueryTicket, Resolution, DEFAULT_WELCOME_TEXT};
use crate::domain::{Message, SessionEpoch, SessionState, UploadFile};
use crate::error::{SessionError, SessionResult};
use crate::events::LifecycleEvent;
use crate::navigation::NavigationBridge;
use crate::ports::{
    Answer, AnsweringService, DocumentRef, DocumentRenderer, PortError, PortResult,
    RenderReporter, RendererReport, TransportEvent, TransportStream, UploadTransport,
};
use crate::session::DocumentSessionController;
use crate::viewer::{PageStep, RenderRequest, ViewerState};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

//=========================================================================================
// Configuration and Collaborators
//=========================================================================================

/// The external services a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn UploadTransport>,
    pub answering: Arc<dyn AnsweringService>,
    pub renderer: Arc<dyn DocumentRenderer>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// How long a query may await the answering service before it is reported as failed.
    pub answer_timeout: Duration,
    pub welcome_text: String,
    pub update_capacity: usize,
    pub command_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            answer_timeout: Duration::from_secs(30),
            welcome_text: DEFAULT_WELCOME_TEXT.to_string(),
            update_capacity: 64,
            command_capacity: 32,
        }
    }
}

//=========================================================================================
// Observable Output
//=========================================================================================

/// A change the presentation layer may want to reflect.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Lifecycle(LifecycleEvent),
    State {
        epoch: SessionEpoch,
        state: SessionState,
    },
    MessageAppended(Message),
    TranscriptCleared,
    AwaitingResponse(bool),
    View(ViewerState),
}

/// Everything needed to draw the session from scratch.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub epoch: SessionEpoch,
    pub state: SessionState,
    pub document: Option<DocumentRef>,
    pub messages: Vec<Message>,
    pub awaiting_response: bool,
    pub viewer: ViewerState,
}

/// The owned document's content, lent out for a download.
#[derive(Debug, Clone)]
pub struct DocumentDownload {
    pub filename: String,
    pub media_type: String,
    pub data: Bytes,
}

//=========================================================================================
// Commands and the Handle
//=========================================================================================

#[derive(Debug)]
enum Command {
    Upload {
        file: UploadFile,
        reply: oneshot::Sender<SessionResult<SessionEpoch>>,
    },
    Replace {
        file: UploadFile,
        reply: oneshot::Sender<SessionResult<SessionEpoch>>,
    },
    RetryUpload {
        reply: oneshot::Sender<bool>,
    },
    End,
    SubmitQuery {
        text: String,
        reply: oneshot::Sender<SessionResult<u64>>,
    },
    AbandonQuery,
    ActivateCitation {
        page: u32,
    },
    GoToPage {
        page: i64,
    },
    StepPage(PageStep),
    SetZoom {
        percent: i32,
    },
    ZoomIn,
    ZoomOut,
    ReloadViewer,
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Download {
        reply: oneshot::Sender<Option<DocumentDownload>>,
    },
    Shutdown,
}

/// Cloneable front door to a running `SessionCoordinator`.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    activations: mpsc::UnboundedSender<u32>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionHandle {
    /// Subscribes to updates published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn upload(&self, file: UploadFile) -> SessionResult<SessionEpoch> {
        self.request(|reply| Command::Upload { file, reply }).await?
    }

    pub async fn replace(&self, file: UploadFile) -> SessionResult<SessionEpoch> {
        self.request(|reply| Command::Replace { file, reply }).await?
    }

    /// Returns a failed session to idle. `false` if the session had not failed.
    pub async fn retry_upload(&self) -> SessionResult<bool> {
        self.request(|reply| Command::RetryUpload { reply }).await
    }

    pub async fn end(&self) -> SessionResult<()> {
        self.send(Command::End).await
    }

    /// Appends the user message and starts the answering call.
    /// Returns the sequence id of the user message.
    pub async fn submit_query(&self, text: impl Into<String>) -> SessionResult<u64> {
        let text = text.into();
        self.request(|reply| Command::SubmitQuery { text, reply }).await?
    }

    pub async fn abandon_query(&self) -> SessionResult<()> {
        self.send(Command::AbandonQuery).await
    }

    pub async fn activate_citation(&self, page: u32) -> SessionResult<()> {
        self.send(Command::ActivateCitation { page }).await
    }

    pub async fn go_to_page(&self, page: i64) -> SessionResult<()> {
        self.send(Command::GoToPage { page }).await
    }

    pub async fn step_page(&self, step: PageStep) -> SessionResult<()> {
        self.send(Command::StepPage(step)).await
    }

    pub async fn set_zoom(&self, percent: i32) -> SessionResult<()> {
        self.send(Command::SetZoom { percent }).await
    }

    pub async fn zoom_in(&self) -> SessionResult<()> {
        self.send(Command::ZoomIn).await
    }

    pub async fn zoom_out(&self) -> SessionResult<()> {
        self.send(Command::ZoomOut).await
    }

    pub async fn reload_viewer(&self) -> SessionResult<()> {
        self.send(Command::ReloadViewer).await
    }

    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn download(&self) -> SessionResult<Option<DocumentDownload>> {
        self.request(|reply| Command::Download { reply }).await
    }

    pub async fn shutdown(&self) -> SessionResult<()> {
        self.send(Command::Shutdown).await
    }

    /// The callback the presentation layer invokes when a citation is selected.
    ///
    /// Activations never wait on the command queue, so a click is not lost while the
    /// coordinator is busy.
    pub fn citation_activator(&self) -> impl Fn(u32) + Clone + Send + Sync + 'static {
        let activations = self.activations.clone();
        move |page| {
            if activations.send(page).is_err() {
                warn!("Dropped citation activation for page {page}: coordinator closed.");
            }
        }
    }

    async fn send(&self, command: Command) -> SessionResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::CoordinatorClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> SessionResult<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| SessionError::CoordinatorClosed)
    }
}

//=========================================================================================
// The Coordinator
//=========================================================================================

type AnswerOutcome = (QueryTicket, PortResult<Answer>);

pub struct SessionCoordinator {
    controller: DocumentSessionController,
    lifecycle: broadcast::Receiver<LifecycleEvent>,
    conversation: ConversationEngine,
    viewer: ViewerState,
    collaborators: Collaborators,
    answer_timeout: Duration,
    commands: mpsc::Receiver<Command>,
    activations: mpsc::UnboundedReceiver<u32>,
    reports_tx: mpsc::UnboundedSender<RendererReport>,
    reports_rx: mpsc::UnboundedReceiver<RendererReport>,
    updates: broadcast::Sender<SessionUpdate>,
    transport: Option<TransportStream>,
    /// The document whose transfer was started and not yet released.
    staged: Option<DocumentRef>,
    answers: FuturesUnordered<BoxFuture<'static, AnswerOutcome>>,
}

impl SessionCoordinator {
    /// Builds a coordinator and its handle without starting the loop.
    pub fn new(collaborators: Collaborators, settings: CoordinatorSettings) -> (Self, SessionHandle) {
        let (tx, commands) = mpsc::channel(settings.command_capacity.max(1));
        let (activations_tx, activations) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(settings.update_capacity.max(1));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let controller = DocumentSessionController::new(settings.update_capacity);
        let lifecycle = controller.subscribe();

        let coordinator = Self {
            controller,
            lifecycle,
            conversation: ConversationEngine::new(settings.welcome_text),
            viewer: ViewerState::new(),
            collaborators,
            answer_timeout: settings.answer_timeout,
            commands,
            activations,
            reports_tx,
            reports_rx,
            updates: updates.clone(),
            transport: None,
            staged: None,
            answers: FuturesUnordered::new(),
        };
        let handle = SessionHandle {
            tx,
            activations: activations_tx,
            updates,
        };
        (coordinator, handle)
    }

    /// Starts the loop on the current tokio runtime and returns its handle.
    pub fn spawn(collaborators: Collaborators, settings: CoordinatorSettings) -> SessionHandle {
        let (coordinator, handle) = Self::new(collaborators, settings);
        tokio::spawn(coordinator.run());
        handle
    }

    /// Runs until `Shutdown` is received or every handle is dropped.
    pub async fn run(mut self) {
        info!("Session coordinator started.");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(page) = self.activations.recv() => {
                    self.activate_citation(page);
                }
                event = next_transport_event(&mut self.transport) => {
                    self.handle_transport_event(event);
                }
                Some(outcome) = self.answers.next(), if !self.answers.is_empty() => {
                    self.handle_answer(outcome);
                }
                Some(report) = self.reports_rx.recv() => {
                    self.handle_renderer_report(report);
                }
            }
            self.drain_lifecycle();
        }
        self.teardown();
        info!("Session coordinator stopped.");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Upload { file, reply } => {
                let result = self.controller.begin_upload(file);
                self.after_upload_started(&result);
                let _ = reply.send(result);
            }
            Command::Replace { file, reply } => {
                let result = self.controller.replace(file);
                self.after_upload_started(&result);
                let _ = reply.send(result);
            }
            Command::RetryUpload { reply } => {
                let reset = self.controller.retry();
                if reset {
                    self.release_staged();
                    self.publish_state();
                }
                let _ = reply.send(reset);
            }
            Command::End => {
                self.transport = None;
                self.controller.end();
                self.release_staged();
                self.publish_state();
            }
            Command::SubmitQuery { text, reply } => {
                let _ = reply.send(self.submit_query(&text));
            }
            Command::AbandonQuery => {
                if self.conversation.abandon() {
                    self.publish(SessionUpdate::AwaitingResponse(false));
                }
            }
            Command::ActivateCitation { page } => self.activate_citation(page),
            Command::GoToPage { page } => {
                let request = self.viewer.go_to(page);
                self.apply_view(request);
            }
            Command::StepPage(step) => {
                let request = self.viewer.step_page(step);
                self.apply_view(request);
            }
            Command::SetZoom { percent } => {
                let request = self.viewer.set_zoom(percent);
                self.apply_view(request);
            }
            Command::ZoomIn => {
                let request = self.viewer.zoom_in();
                self.apply_view(request);
            }
            Command::ZoomOut => {
                let request = self.viewer.zoom_out();
                self.apply_view(request);
            }
            Command::ReloadViewer => {
                if self.viewer.begin_reload() {
                    self.open_renderer();
                    self.publish(SessionUpdate::View(self.viewer.clone()));
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Download { reply } => {
                let download = self.controller.document().map(|document| DocumentDownload {
                    filename: document.filename.clone(),
                    media_type: document.media_type.clone(),
                    data: document.data.clone(),
                });
                let _ = reply.send(download);
            }
            Command::Shutdown => {}
        }
    }

    fn after_upload_started(&mut self, result: &SessionResult<SessionEpoch>) {
        if result.is_err() {
            return;
        }
        // Dropping the stream abandons any previous transfer.
        self.transport = None;
        self.release_staged();
        if let Some(document) = self.controller.document() {
            self.transport = Some(self.collaborators.transport.start(document));
            self.staged = Some(DocumentRef::from(document));
        }
        self.publish_state();
    }

    fn release_staged(&mut self) {
        if let Some(document) = self.staged.take() {
            debug!("Releasing transfer of '{}'.", document.filename);
            self.collaborators.transport.release(&document);
        }
    }

    fn activate_citation(&mut self, page: u32) {
        let request = NavigationBridge::activate_page(page, &mut self.viewer);
        self.apply_view(request);
    }

    fn submit_query(&mut self, text: &str) -> SessionResult<u64> {
        let pending = self.conversation.submit_query(text)?;
        let mut seq = 0;
        if let Some(message) = self.conversation.messages().last() {
            seq = message.seq;
            self.publish(SessionUpdate::MessageAppended(message.clone()));
        }
        self.publish(SessionUpdate::AwaitingResponse(true));

        let service = Arc::clone(&self.collaborators.answering);
        let timeout = self.answer_timeout;
        let ticket = pending.ticket;
        self.answers.push(
            async move {
                let outcome = match tokio::time::timeout(timeout, service.answer(pending.request))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PortError::Timeout(timeout)),
                };
                (ticket, outcome)
            }
            .boxed(),
        );
        Ok(seq)
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Progress(percent) => {
                if self.controller.on_transport_progress(percent).is_some() {
                    self.publish_state();
                }
            }
            TransportEvent::Completed => {
                self.transport = None;
                if self.controller.on_transport_progress(100).is_some() {
                    self.publish_state();
                }
                if self.controller.on_transport_complete() {
                    self.publish_state();
                }
            }
            TransportEvent::Failed(reason) => {
                self.transport = None;
                if self.controller.on_transport_failure(reason) {
                    self.publish_state();
                }
            }
        }
    }

    fn handle_answer(&mut self, (ticket, outcome): AnswerOutcome) {
        if Some(ticket.epoch) != self.conversation.epoch() {
            warn!(
                "Dropping response to query #{} from {}: session has moved on.",
                ticket.id, ticket.epoch
            );
            return;
        }
        match self.conversation.resolve(ticket, outcome) {
            Resolution::Appended(message) => {
                self.publish(SessionUpdate::MessageAppended(message));
                self.publish(SessionUpdate::AwaitingResponse(false));
            }
            Resolution::Discarded => {}
        }
    }

    fn handle_renderer_report(&mut self, report: RendererReport) {
        let current = self.controller.epoch();
        let ready = *self.controller.state() == SessionState::Ready;
        match report {
            RendererReport::Loaded { epoch, total_pages } if epoch == current && ready => {
                let request = self.viewer.set_total_pages(total_pages);
                self.apply_view(request);
            }
            RendererReport::Failed { epoch, reason } if epoch == current && ready => {
                self.viewer.report_load_error(reason);
                self.publish(SessionUpdate::View(self.viewer.clone()));
            }
            stale => debug!("Ignoring renderer report for another session: {stale:?}"),
        }
    }

    fn drain_lifecycle(&mut self) {
        loop {
            match self.lifecycle.try_recv() {
                Ok(event) => self.on_lifecycle(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Missed {skipped} lifecycle event(s).");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn on_lifecycle(&mut self, event: LifecycleEvent) {
        debug!("Lifecycle event: {event:?}");
        let welcome = self.conversation.observe(&event);
        match &event {
            LifecycleEvent::Ready { .. } => {
                self.viewer.reset_for_new_document();
                self.open_renderer();
            }
            LifecycleEvent::Replaced { previous, .. } => {
                self.collaborators.renderer.close(*previous);
                self.viewer.reset_for_new_document();
            }
            LifecycleEvent::Ended { epoch } => {
                self.collaborators.renderer.close(*epoch);
                self.viewer.reset_for_new_document();
            }
            LifecycleEvent::Failed { .. } => {}
        }
        let is_ready = matches!(event, LifecycleEvent::Ready { .. });
        self.publish(SessionUpdate::Lifecycle(event));
        if is_ready {
            if let Some(welcome) = welcome {
                self.publish(SessionUpdate::MessageAppended(welcome));
            }
        } else {
            self.publish(SessionUpdate::TranscriptCleared);
            self.publish(SessionUpdate::AwaitingResponse(false));
        }
        self.publish(SessionUpdate::View(self.viewer.clone()));
    }

    fn open_renderer(&self) {
        let Some(document) = self.controller.document_ref() else {
            return;
        };
        let epoch = self.controller.epoch();
        let reporter = RenderReporter::new(epoch, self.reports_tx.clone());
        self.collaborators.renderer.open(document, reporter);
    }

    fn apply_view(&mut self, request: Option<RenderRequest>) {
        if let Some(request) = request {
            self.collaborators
                .renderer
                .render(self.controller.epoch(), request);
        }
        self.publish(SessionUpdate::View(self.viewer.clone()));
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            epoch: self.controller.epoch(),
            state: self.controller.state().clone(),
            document: self.controller.document().map(DocumentRef::from),
            messages: self.conversation.messages().to_vec(),
            awaiting_response: self.conversation.is_awaiting_response(),
            viewer: self.viewer.clone(),
        }
    }

    fn publish_state(&self) {
        self.publish(SessionUpdate::State {
            epoch: self.controller.epoch(),
            state: self.controller.state().clone(),
        });
    }

    fn publish(&self, update: SessionUpdate) {
        // Nobody watching is fine.
        let _ = self.updates.send(update);
    }

    fn teardown(&mut self) {
        self.transport = None;
        self.controller.end();
        self.release_staged();
        self.drain_lifecycle();
    }
}

/// Next event of the active transfer; never resolves while there is none.
async fn next_transport_event(stream: &mut Option<TransportStream>) -> TransportEvent {
    let Some(active) = stream.as_mut() else {
        return futures::future::pending().await;
    };
    match active.next().await {
        Some(event) => event,
        None => TransportEvent::Failed("upload transport closed without finishing".to_string()),
    }
}
