//! crates/doc_chat_core/src/conversation.rs
//!
//! The `ConversationEngine`: the ordered transcript of one session and the
//! `Idle -> AwaitingResponse -> Idle` cycle of each query.
//!
//! A query is split in two halves so the caller can suspend on the answering
//! service in between: `submit_query` appends the user message and hands back a
//! `PendingQuery`, and `resolve` appends the answer (or a visible error) for it.
//! Each query carries a `QueryTicket` tagged with the session epoch, so a response
//! arriving after the document was replaced or the query abandoned is dropped.

use crate::domain::{Citation, Message, Sender, SessionEpoch};
use crate::error::{SessionError, SessionResult};
use crate::events::LifecycleEvent;
use crate::ports::{Answer, AnswerRequest, AnsweringService, DocumentRef, PortError, PortResult};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_WELCOME_TEXT: &str = "Your document is ready! You can now ask questions about \
your document. For example:\n\n\
• \"What is the main topic of this document?\"\n\
• \"Can you summarize the key points?\"\n\
• \"What are the conclusions or recommendations?\"";

/// Identifies one submitted query within one session epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryTicket {
    pub epoch: SessionEpoch,
    pub id: u64,
}

/// A query whose user message is already in the transcript and which now waits
/// for the answering service.
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub ticket: QueryTicket,
    pub request: AnswerRequest,
}

/// What became of a response handed to `resolve`.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Appended(Message),
    /// The response belonged to a replaced session or an abandoned query.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    AwaitingResponse,
}

struct ActiveSession {
    epoch: SessionEpoch,
    document: DocumentRef,
    welcomed: bool,
}

pub struct ConversationEngine {
    welcome_text: String,
    session: Option<ActiveSession>,
    messages: Vec<Message>,
    next_seq: u64,
    next_ticket: u64,
    in_flight: Option<QueryTicket>,
}

impl Default for ConversationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_WELCOME_TEXT)
    }
}

impl ConversationEngine {
    pub fn new(welcome_text: impl Into<String>) -> Self {
        Self {
            welcome_text: welcome_text.into(),
            session: None,
            messages: Vec::new(),
            next_seq: 0,
            next_ticket: 0,
            in_flight: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn epoch(&self) -> Option<SessionEpoch> {
        self.session.as_ref().map(|s| s.epoch)
    }

    pub fn status(&self) -> QueryStatus {
        if self.in_flight.is_some() {
            QueryStatus::AwaitingResponse
        } else {
            QueryStatus::Idle
        }
    }

    pub fn is_awaiting_response(&self) -> bool {
        self.status() == QueryStatus::AwaitingResponse
    }

    /// Reacts to a session lifecycle event. Returns the welcome message if one was appended.
    pub fn observe(&mut self, event: &LifecycleEvent) -> Option<Message> {
        match event {
            LifecycleEvent::Ready { epoch, document } => {
                if self.epoch() != Some(*epoch) {
                    let Some(document) = document.upgrade() else {
                        debug!("Ready event for {epoch} arrived after its document was released.");
                        return None;
                    };
                    self.reset();
                    self.session = Some(ActiveSession {
                        epoch: *epoch,
                        document: DocumentRef::from(document.as_ref()),
                        welcomed: false,
                    });
                }
                self.initialize().ok().flatten()
            }
            LifecycleEvent::Failed { .. }
            | LifecycleEvent::Replaced { .. }
            | LifecycleEvent::Ended { .. } => {
                self.reset();
                None
            }
        }
    }

    /// Appends the system welcome message once per ready session.
    /// Calling it again for the same session does nothing.
    pub fn initialize(&mut self) -> SessionResult<Option<Message>> {
        let Some(session) = self.session.as_mut() else {
            return Err(SessionError::NotReady);
        };
        if session.welcomed {
            return Ok(None);
        }
        session.welcomed = true;
        let body = self.welcome_text.clone();
        Ok(Some(self.append(Sender::System, body, Vec::new(), false)))
    }

    /// Appends the user's message and returns the request to send to the answering service.
    pub fn submit_query(&mut self, text: &str) -> SessionResult<PendingQuery> {
        let query = text.trim();
        if query.is_empty() {
            return Err(SessionError::EmptyQuery);
        }
        let Some(session) = self.session.as_ref() else {
            return Err(SessionError::NotReady);
        };
        if self.in_flight.is_some() {
            warn!("Rejected query while another one is awaiting a response.");
            return Err(SessionError::QueryAlreadyInFlight);
        }

        let ticket = QueryTicket {
            epoch: session.epoch,
            id: self.next_ticket,
        };
        let document = session.document.clone();
        self.next_ticket += 1;

        let transcript = self.messages.clone();
        self.append(Sender::User, query.to_string(), Vec::new(), false);
        self.in_flight = Some(ticket);
        info!("Query #{} submitted for {}.", ticket.id, ticket.epoch);

        Ok(PendingQuery {
            ticket,
            request: AnswerRequest {
                document,
                query: query.to_string(),
                transcript,
            },
        })
    }

    /// Records the outcome of the answering service for `ticket`.
    ///
    /// Failures become a visible assistant message; the engine returns to idle either way.
    pub fn resolve(&mut self, ticket: QueryTicket, outcome: PortResult<Answer>) -> Resolution {
        if self.in_flight != Some(ticket) {
            warn!(
                "Dropping response to query #{} ({}): no longer awaited.",
                ticket.id, ticket.epoch
            );
            return Resolution::Discarded;
        }
        self.in_flight = None;

        let message = match outcome {
            Ok(answer) => {
                info!(
                    "Query #{} answered with {} citation(s).",
                    ticket.id,
                    answer.citations.len()
                );
                self.append(Sender::Assistant, answer.text, answer.citations, false)
            }
            Err(e) => {
                warn!("Answering service failed for query #{}: {}", ticket.id, e);
                let body = format!("Sorry, I couldn't answer that question. ({e})");
                self.append(Sender::Assistant, body, Vec::new(), true)
            }
        };
        Resolution::Appended(message)
    }

    /// Gives up on the in-flight query. Its eventual response will be discarded.
    pub fn abandon(&mut self) -> bool {
        match self.in_flight.take() {
            Some(ticket) => {
                info!("Query #{} abandoned.", ticket.id);
                true
            }
            None => false,
        }
    }

    /// Submits a query and waits for the service, bounded by `timeout`.
    pub async fn ask(
        &mut self,
        service: &dyn AnsweringService,
        text: &str,
        timeout: Duration,
    ) -> SessionResult<Resolution> {
        let pending = self.submit_query(text)?;
        let outcome = match tokio::time::timeout(timeout, service.answer(pending.request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PortError::Timeout(timeout)),
        };
        Ok(self.resolve(pending.ticket, outcome))
    }

    fn append(
        &mut self,
        sender: Sender,
        body: String,
        citations: Vec<Citation>,
        is_error: bool,
    ) -> Message {
        let message = Message {
            seq: self.next_seq,
            sender,
            body,
            citations,
            created_at: Utc::now(),
            is_error,
        };
        self.next_seq += 1;
        self.messages.push(message.clone());
        message
    }

    fn reset(&mut self) {
        if self.session.is_some() || !self.messages.is_empty() {
            debug!("Conversation reset ({} messages dropped).", self.messages.len());
        }
        self.session = None;
        self.messages.clear();
        self.next_seq = 0;
        self.in_flight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Document, UploadFile, ACCEPTED_MEDIA_TYPE};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;

    fn document() -> Arc<Document> {
        Arc::new(Document::from_upload(UploadFile::new(
            "report.pdf",
            ACCEPTED_MEDIA_TYPE,
            Bytes::from_static(b"%PDF-1.7"),
        )))
    }

    fn ready(engine: &mut ConversationEngine, epoch: u64, document: &Arc<Document>) {
        engine.observe(&LifecycleEvent::Ready {
            epoch: SessionEpoch(epoch),
            document: Arc::downgrade(document),
        });
    }

    struct FixedAnswer(PortResult<Answer>);

    #[async_trait]
    impl AnsweringService for FixedAnswer {
        async fn answer(&self, _request: AnswerRequest) -> PortResult<Answer> {
            self.0.clone()
        }
    }

    struct NeverAnswers;

    #[async_trait]
    impl AnsweringService for NeverAnswers {
        async fn answer(&self, _request: AnswerRequest) -> PortResult<Answer> {
            futures::future::pending().await
        }
    }

    #[test]
    fn welcome_is_appended_exactly_once_per_ready_session() {
        let doc = document();
        let mut engine = ConversationEngine::default();
        ready(&mut engine, 1, &doc);
        ready(&mut engine, 1, &doc);
        for _ in 0..3 {
            assert_eq!(engine.initialize(), Ok(None));
        }
        let welcomes: Vec<_> = engine
            .messages()
            .iter()
            .filter(|m| m.sender == Sender::System)
            .collect();
        assert_eq!(welcomes.len(), 1);
        assert_eq!(welcomes[0].seq, 0);
        assert_eq!(welcomes[0].body, DEFAULT_WELCOME_TEXT);
    }

    #[test]
    fn initialize_without_session_is_not_ready() {
        let mut engine = ConversationEngine::default();
        assert_eq!(engine.initialize(), Err(SessionError::NotReady));
        assert!(matches!(
            engine.submit_query("hello"),
            Err(SessionError::NotReady)
        ));
    }

    #[test]
    fn blank_query_is_rejected_without_appending() {
        let doc = document();
        let mut engine = ConversationEngine::default();
        ready(&mut engine, 1, &doc);
        assert!(matches!(
            engine.submit_query("   \n\t"),
            Err(SessionError::EmptyQuery)
        ));
        assert_eq!(engine.messages().len(), 1);
        assert_eq!(engine.status(), QueryStatus::Idle);
    }

    #[test]
    fn second_query_in_flight_is_rejected() {
        let doc = document();
        let mut engine = ConversationEngine::default();
        ready(&mut engine, 1, &doc);
        let pending = engine.submit_query("  summary ").unwrap();
        assert_eq!(pending.request.query, "summary");
        assert_eq!(pending.request.transcript.len(), 1);
        assert_eq!(pending.request.document.filename, "report.pdf");

        assert!(matches!(
            engine.submit_query("another"),
            Err(SessionError::QueryAlreadyInFlight)
        ));
        let users = engine
            .messages()
            .iter()
            .filter(|m| m.sender == Sender::User)
            .count();
        assert_eq!(users, 1);
        assert!(engine.is_awaiting_response());
    }

    #[test]
    fn answer_follows_question_with_citations_unmodified() {
        let doc = document();
        let mut engine = ConversationEngine::default();
        ready(&mut engine, 1, &doc);
        let pending = engine.submit_query("where?").unwrap();
        let citations = vec![Citation::new(42, "p42"), Citation::new(0, "cover")];
        let resolution = engine.resolve(
            pending.ticket,
            Ok(Answer {
                text: "On page 42.".to_string(),
                citations: citations.clone(),
            }),
        );
        let Resolution::Appended(message) = resolution else {
            panic!("answer was discarded");
        };
        assert_eq!(message.seq, 2);
        assert_eq!(message.sender, Sender::Assistant);
        assert_eq!(message.citations, citations);

        let seqs: Vec<_> = engine.messages().iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(engine.status(), QueryStatus::Idle);
    }

    #[test]
    fn service_failure_becomes_visible_error_message() {
        let doc = document();
        let mut engine = ConversationEngine::default();
        ready(&mut engine, 1, &doc);
        let pending = engine.submit_query("why?").unwrap();
        let resolution = engine.resolve(
            pending.ticket,
            Err(PortError::Unexpected("model overloaded".to_string())),
        );
        let Resolution::Appended(message) = resolution else {
            panic!("error was discarded");
        };
        assert!(message.is_error);
        assert!(message.body.contains("model overloaded"));
        assert_eq!(engine.status(), QueryStatus::Idle);
        assert!(engine.submit_query("retry").is_ok());
    }

    #[test]
    fn stale_response_after_replacement_is_discarded() {
        let first = document();
        let mut engine = ConversationEngine::default();
        ready(&mut engine, 1, &first);
        let pending = engine.submit_query("summary").unwrap();

        engine.observe(&LifecycleEvent::Replaced {
            previous: SessionEpoch(1),
            next: SessionEpoch(2),
        });
        assert!(engine.messages().is_empty());

        let second = document();
        ready(&mut engine, 2, &second);
        assert_eq!(engine.messages().len(), 1);

        let resolution = engine.resolve(
            pending.ticket,
            Ok(Answer {
                text: "old answer".to_string(),
                citations: Vec::new(),
            }),
        );
        assert_eq!(resolution, Resolution::Discarded);
        assert_eq!(engine.messages().len(), 1);
    }

    #[test]
    fn abandoned_query_frees_the_engine() {
        let doc = document();
        let mut engine = ConversationEngine::default();
        ready(&mut engine, 1, &doc);
        let first = engine.submit_query("one").unwrap();
        assert!(engine.abandon());
        let second = engine.submit_query("two").unwrap();
        assert_eq!(
            engine.resolve(
                first.ticket,
                Ok(Answer {
                    text: "late".to_string(),
                    citations: Vec::new()
                })
            ),
            Resolution::Discarded
        );
        assert!(engine.is_awaiting_response());
        assert!(matches!(
            engine.resolve(
                second.ticket,
                Ok(Answer {
                    text: "two".to_string(),
                    citations: Vec::new()
                })
            ),
            Resolution::Appended(_)
        ));
    }

    #[tokio::test]
    async fn ask_appends_answer() {
        let doc = document();
        let mut engine = ConversationEngine::default();
        ready(&mut engine, 1, &doc);
        let service = FixedAnswer(Ok(Answer {
            text: "It is about rust.".to_string(),
            citations: vec![Citation::new(1, "Page 1")],
        }));
        let resolution = engine
            .ask(&service, "topic?", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Appended(ref m) if m.body == "It is about rust."));
        assert_eq!(engine.messages().len(), 3);
    }

    #[tokio::test]
    async fn ask_times_out_into_error_message() {
        let doc = document();
        let mut engine = ConversationEngine::default();
        ready(&mut engine, 1, &doc);
        let resolution = engine
            .ask(&NeverAnswers, "topic?", Duration::from_millis(20))
            .await
            .unwrap();
        let Resolution::Appended(message) = resolution else {
            panic!("timeout was discarded");
        };
        assert!(message.is_error);
        assert_eq!(engine.status(), QueryStatus::Idle);
    }
}
