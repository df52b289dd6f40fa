//! End-to-end flow through a running coordinator: upload, welcome, question,
//! cited answer, citation navigation.

use async_trait::async_trait;
use bytes::Bytes;
use doc_chat_core::{
    Answer, AnswerRequest, AnsweringService, Citation, Collaborators, CoordinatorSettings,
    Document, DocumentRenderer, PortResult, RenderReporter, RenderRequest, Sender,
    SessionCoordinator, SessionEpoch, SessionHandle, SessionSnapshot, SessionState,
    SessionUpdate, TransportEvent, TransportStream, UploadFile, UploadTransport,
    ACCEPTED_MEDIA_TYPE,
};
use futures::StreamExt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

struct ProgressTransport;

impl UploadTransport for ProgressTransport {
    fn start(&self, _document: &Document) -> TransportStream {
        futures::stream::iter(vec![
            TransportEvent::Progress(0),
            TransportEvent::Progress(30),
            TransportEvent::Progress(70),
            TransportEvent::Progress(100),
            TransportEvent::Completed,
        ])
        .boxed()
    }
}

struct CitingService {
    seen: Mutex<Vec<AnswerRequest>>,
}

#[async_trait]
impl AnsweringService for CitingService {
    async fn answer(&self, request: AnswerRequest) -> PortResult<Answer> {
        self.seen.lock().unwrap().push(request);
        Ok(Answer {
            text: "The document summarises quarterly results.".to_string(),
            citations: vec![Citation::new(2, "p2")],
        })
    }
}

/// Reports ten pages as soon as a document is opened.
struct TenPageRenderer {
    rendered: Mutex<Vec<RenderRequest>>,
}

impl DocumentRenderer for TenPageRenderer {
    fn open(&self, document: Weak<Document>, reporter: RenderReporter) {
        assert!(document.upgrade().is_some());
        reporter.loaded(10);
    }

    fn render(&self, _epoch: SessionEpoch, request: RenderRequest) {
        self.rendered.lock().unwrap().push(request);
    }

    fn close(&self, _epoch: SessionEpoch) {}
}

async fn wait_until(
    handle: &SessionHandle,
    check: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    for _ in 0..200 {
        let snapshot = handle.snapshot().await.unwrap();
        if check(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never reached");
}

#[tokio::test]
async fn upload_ask_and_follow_citation() {
    let service = Arc::new(CitingService {
        seen: Mutex::new(Vec::new()),
    });
    let renderer = Arc::new(TenPageRenderer {
        rendered: Mutex::new(Vec::new()),
    });
    let handle = SessionCoordinator::spawn(
        Collaborators {
            transport: Arc::new(ProgressTransport),
            answering: service.clone(),
            renderer: renderer.clone(),
        },
        CoordinatorSettings::default(),
    );
    let mut updates = handle.subscribe();

    let two_megabytes = Bytes::from(vec![0u8; 2 * 1024 * 1024]);
    handle
        .upload(UploadFile::new("report.pdf", ACCEPTED_MEDIA_TYPE, two_megabytes))
        .await
        .unwrap();

    let snapshot = wait_until(&handle, |s| {
        s.state == SessionState::Ready && s.viewer.is_loaded()
    })
    .await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].seq, 0);
    assert_eq!(snapshot.messages[0].sender, Sender::System);
    assert_eq!(snapshot.viewer.total_pages(), Some(10));
    assert_eq!(snapshot.document.as_ref().unwrap().byte_size, 2 * 1024 * 1024);

    assert_eq!(handle.submit_query("summary").await.unwrap(), 1);
    let snapshot = wait_until(&handle, |s| s.messages.len() == 3).await;
    let user = &snapshot.messages[1];
    let assistant = &snapshot.messages[2];
    assert_eq!((user.seq, user.sender), (1, Sender::User));
    assert_eq!(user.body, "summary");
    assert_eq!((assistant.seq, assistant.sender), (2, Sender::Assistant));
    assert_eq!(assistant.citations, vec![Citation::new(2, "p2")]);

    let request = service.seen.lock().unwrap()[0].clone();
    assert_eq!(request.query, "summary");
    assert_eq!(request.document.filename, "report.pdf");
    assert_eq!(request.transcript.len(), 1);

    handle
        .activate_citation(assistant.citations[0].target_page)
        .await
        .unwrap();
    let snapshot = wait_until(&handle, |s| s.viewer.current_page() == 2).await;
    assert_eq!(snapshot.viewer.current_page(), 2);
    assert_eq!(renderer.rendered.lock().unwrap().last().map(|r| r.page), Some(2));

    // Progress as seen by observers never went backwards.
    let mut progress = Vec::new();
    while let Ok(update) = updates.try_recv() {
        if let SessionUpdate::State {
            state: SessionState::Uploading { progress: p },
            ..
        } = update
        {
            progress.push(p);
        }
    }
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&100));

    handle.shutdown().await.unwrap();
}
