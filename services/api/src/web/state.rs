//! services/api/src/web/state.rs
//!
//! Defines the application's shared state and the registry of live sessions.

use crate::adapters::ClientRenderer;
use crate::config::Config;
use doc_chat_core::{
    AnsweringService, Collaborators, SessionCoordinator, SessionHandle, UploadTransport,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of each session's renderer directive channel.
const RENDERER_DIRECTIVE_CAPACITY: usize = 64;

/// Upper bound on the time between two idle sweeps.
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(60);

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub answering: Arc<dyn AnsweringService>,
    pub transport: Arc<dyn UploadTransport>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        answering: Arc<dyn AnsweringService>,
        transport: Arc<dyn UploadTransport>,
    ) -> Self {
        Self {
            config,
            answering,
            transport,
            sessions: Arc::new(SessionRegistry::default()),
        }
    }

    /// Spawns a coordinator for a new session and registers it.
    pub fn open_session(&self) -> (Uuid, SessionEntry) {
        let renderer = Arc::new(ClientRenderer::new(RENDERER_DIRECTIVE_CAPACITY));
        let collaborators = Collaborators {
            transport: self.transport.clone(),
            answering: self.answering.clone(),
            renderer: renderer.clone(),
        };
        let handle = SessionCoordinator::spawn(collaborators, self.config.coordinator_settings());
        let entry = SessionEntry { handle, renderer };
        let session_id = self.sessions.insert(entry.clone());
        (session_id, entry)
    }

    /// Ends and shuts down every session that has had no attached client for `ttl`.
    /// Returns how many sessions were evicted.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let evicted = self.sessions.take_idle(ttl, Instant::now());
        for (session_id, entry) in &evicted {
            info!("Evicting idle session {}.", session_id);
            if let Err(e) = entry.handle.end().await {
                debug!("Session {} was already closed: {}", session_id, e);
            }
            if let Err(e) = entry.handle.shutdown().await {
                debug!("Session {} did not accept shutdown: {}", session_id, e);
            }
        }
        evicted.len()
    }

    /// Runs `evict_idle` periodically for the lifetime of the service.
    pub fn spawn_idle_sweeper(self: Arc<Self>, ttl: Duration) -> JoinHandle<()> {
        let period = ttl.min(MAX_SWEEP_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = self.evict_idle(ttl).await;
                if evicted > 0 {
                    info!(
                        "Idle sweep evicted {} session(s); {} remain.",
                        evicted,
                        self.sessions.len()
                    );
                }
            }
        })
    }
}

//=========================================================================================
// Session Registry
//=========================================================================================

/// A live session: the coordinator's handle and the renderer bridge its clients talk to.
#[derive(Clone)]
pub struct SessionEntry {
    pub handle: SessionHandle,
    pub renderer: Arc<ClientRenderer>,
}

struct Tracked {
    entry: SessionEntry,
    connections: usize,
    last_active: Instant,
}

impl Tracked {
    fn is_idle(&self, ttl: Duration, now: Instant) -> bool {
        self.entry.handle.is_closed()
            || (self.connections == 0 && now.saturating_duration_since(self.last_active) >= ttl)
    }
}

/// Live sessions by id, with the number of WebSocket clients attached to each.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<Uuid, Tracked>>,
}

impl SessionRegistry {
    fn insert(&self, entry: SessionEntry) -> Uuid {
        let session_id = Uuid::new_v4();
        let tracked = Tracked {
            entry,
            connections: 0,
            last_active: Instant::now(),
        };
        match self.entries.lock() {
            Ok(mut entries) => {
                entries.insert(session_id, tracked);
                info!("Registered session {}.", session_id);
            }
            Err(_) => warn!("Session registry poisoned; session {} not registered.", session_id),
        }
        session_id
    }

    /// Looks up a session whose coordinator is still running and marks it active.
    pub fn get(&self, session_id: Uuid) -> Option<SessionEntry> {
        let mut entries = self.entries.lock().ok()?;
        let tracked = entries
            .get_mut(&session_id)
            .filter(|tracked| !tracked.entry.handle.is_closed())?;
        tracked.last_active = Instant::now();
        Some(tracked.entry.clone())
    }

    /// Attaches a client connection. The session is not evicted while the returned
    /// guard is alive.
    pub fn attach(self: &Arc<Self>, session_id: Uuid) -> Option<(SessionEntry, Attachment)> {
        let mut entries = self.entries.lock().ok()?;
        let tracked = entries
            .get_mut(&session_id)
            .filter(|tracked| !tracked.entry.handle.is_closed())?;
        tracked.connections += 1;
        tracked.last_active = Instant::now();
        debug!(
            "Client attached to session {} ({} connected).",
            session_id, tracked.connections
        );
        let attachment = Attachment {
            registry: Arc::clone(self),
            session_id,
        };
        Some((tracked.entry.clone(), attachment))
    }

    fn detach(&self, session_id: Uuid) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if let Some(tracked) = entries.get_mut(&session_id) {
            tracked.connections = tracked.connections.saturating_sub(1);
            tracked.last_active = Instant::now();
            debug!(
                "Client detached from session {} ({} connected).",
                session_id, tracked.connections
            );
        }
    }

    /// Removes every session that is closed, or has had no client attached for `ttl`.
    pub fn take_idle(&self, ttl: Duration, now: Instant) -> Vec<(Uuid, SessionEntry)> {
        let Ok(mut entries) = self.entries.lock() else {
            return Vec::new();
        };
        let idle: Vec<Uuid> = entries
            .iter()
            .filter(|(_, tracked)| tracked.is_idle(ttl, now))
            .map(|(session_id, _)| *session_id)
            .collect();
        idle.into_iter()
            .filter_map(|session_id| {
                entries
                    .remove(&session_id)
                    .map(|tracked| (session_id, tracked.entry))
            })
            .collect()
    }

    pub fn remove(&self, session_id: Uuid) -> Option<SessionEntry> {
        let removed = self.entries.lock().ok()?.remove(&session_id);
        if removed.is_some() {
            info!("Removed session {}.", session_id);
        }
        removed.map(|tracked| tracked.entry)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A client's hold on a session; detaches on drop.
pub struct Attachment {
    registry: Arc<SessionRegistry>,
    session_id: Uuid,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.registry.detach(self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use doc_chat_core::{
        Answer, AnswerRequest, Document, LifecycleEvent, PortResult, SessionState,
        SessionUpdate, TransportEvent, TransportStream, UploadFile, ACCEPTED_MEDIA_TYPE,
    };

    struct NoAnswers;

    #[async_trait]
    impl AnsweringService for NoAnswers {
        async fn answer(&self, _request: AnswerRequest) -> PortResult<Answer> {
            Ok(Answer {
                text: String::new(),
                citations: Vec::new(),
            })
        }
    }

    struct InstantTransport;

    impl UploadTransport for InstantTransport {
        fn start(&self, _document: &Document) -> TransportStream {
            Box::pin(futures::stream::iter(vec![TransportEvent::Completed]))
        }
    }

    fn app_state() -> AppState {
        let config = Config::from_lookup(|_| None).unwrap();
        AppState::new(
            Arc::new(config),
            Arc::new(NoAnswers),
            Arc::new(InstantTransport),
        )
    }

    #[tokio::test]
    async fn opened_sessions_are_reachable_until_removed() {
        let state = app_state();
        let (session_id, entry) = state.open_session();
        assert_eq!(state.sessions.len(), 1);

        let snapshot = entry.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(state.sessions.get(session_id).is_some());
        assert!(state.sessions.get(Uuid::new_v4()).is_none());

        let removed = state.sessions.remove(session_id).unwrap();
        removed.handle.shutdown().await.unwrap();
        assert!(state.sessions.get(session_id).is_none());
        assert!(state.sessions.is_empty());
    }

    #[tokio::test]
    async fn idle_sessions_are_ended_and_shut_down() {
        let state = app_state();
        let (_, entry) = state.open_session();
        entry
            .handle
            .upload(UploadFile::new(
                "a.pdf",
                ACCEPTED_MEDIA_TYPE,
                Bytes::from_static(b"%PDF-1.7"),
            ))
            .await
            .unwrap();
        let mut updates = entry.handle.subscribe();

        assert_eq!(state.evict_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(state.sessions.len(), 1);

        assert_eq!(state.evict_idle(Duration::ZERO).await, 1);
        assert!(state.sessions.is_empty());

        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(SessionUpdate::Lifecycle(LifecycleEvent::Ended { .. })) =
                    updates.recv().await
                {
                    break;
                }
            }
        })
        .await;
        assert!(ended.is_ok());

        for _ in 0..200 {
            if entry.handle.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(entry.handle.is_closed());
    }

    #[tokio::test]
    async fn attached_sessions_survive_until_their_clients_leave() {
        let state = app_state();
        let (session_id, _) = state.open_session();
        let (_, first) = state.sessions.attach(session_id).unwrap();
        let (_, second) = state.sessions.attach(session_id).unwrap();
        let later = Instant::now() + Duration::from_secs(120);

        assert!(state
            .sessions
            .take_idle(Duration::from_secs(60), later)
            .is_empty());
        drop(first);
        assert!(state
            .sessions
            .take_idle(Duration::from_secs(60), later)
            .is_empty());
        drop(second);

        assert!(state
            .sessions
            .take_idle(Duration::from_secs(60), Instant::now())
            .is_empty());
        let evicted = state
            .sessions
            .take_idle(Duration::from_secs(60), Instant::now() + Duration::from_secs(61));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, session_id);
        assert!(state.sessions.attach(session_id).is_none());
    }
}
