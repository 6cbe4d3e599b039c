use super::*;
use crate::llm::{LlmError, TextStream};
use futures::stream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

// =========================================================================
// MockChatModel
// =========================================================================

enum Script {
    Reply(Vec<&'static str>),
    FailOpen,
    FailAfter(Vec<&'static str>),
    /// Signals `started` once the stream is open, then waits for `release`.
    Gated { started: oneshot::Sender<()>, release: oneshot::Receiver<()>, fragments: Vec<&'static str> },
}

fn ok_fragments(fragments: Vec<&'static str>) -> impl Iterator<Item = Result<String, LlmError>> {
    fragments.into_iter().map(|f| Ok(f.to_string()))
}

struct MockChat {
    script: VecDeque<Script>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl ChatSession for MockChat {
    async fn send_message_stream<'a>(&'a mut self, message: &str) -> Result<TextStream<'a>, LlmError> {
        self.sent.lock().unwrap().push(message.to_string());
        match self.script.pop_front().unwrap_or(Script::Reply(vec!["done"])) {
            Script::Reply(fragments) => Ok(stream::iter(ok_fragments(fragments)).boxed()),
            Script::FailOpen => Err(LlmError::ApiRequest("connection refused".into())),
            Script::FailAfter(fragments) => {
                let tail = stream::once(async { Err(LlmError::ApiRequest("connection reset".into())) });
                Ok(stream::iter(ok_fragments(fragments)).chain(tail).boxed())
            }
            Script::Gated { started, release, fragments } => {
                let _ = started.send(());
                let gate = stream::once(async move {
                    let _ = release.await;
                });
                Ok(gate.flat_map(move |()| stream::iter(ok_fragments(fragments.clone()))).boxed())
            }
        }
    }
}

struct MockChatModel {
    script: Mutex<VecDeque<Script>>,
    fail_start: bool,
    starts: AtomicUsize,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockChatModel {
    fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fail_start: false,
            starts: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fail_start: true,
            starts: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ChatModel for MockChatModel {
    async fn start_chat(&self, system: &str) -> Result<Box<dyn ChatSession>, LlmError> {
        assert_eq!(system, SYSTEM_INSTRUCTION);
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(LlmError::MissingApiKey { var: "GEMINI_API_KEY".into() });
        }
        let script = std::mem::take(&mut *self.script.lock().unwrap());
        Ok(Box::new(MockChat { script, sent: Arc::clone(&self.sent) }))
    }
}

async fn ready_manager(model: &Arc<MockChatModel>) -> ChatSessionManager {
    let manager = ChatSessionManager::new(model.clone());
    manager.initialize().await;
    manager
}

// =========================================================================
// initialize
// =========================================================================

#[test]
fn new_manager_starts_with_greeting() {
    let manager = ChatSessionManager::new(MockChatModel::new(Vec::new()));
    assert_eq!(manager.transcript(), vec![Message::model(GREETING)]);
    assert!(!manager.is_busy());
    assert!(!manager.is_ready());
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let model = MockChatModel::new(Vec::new());
    let manager = ready_manager(&model).await;
    manager.initialize().await;
    assert_eq!(model.starts.load(Ordering::SeqCst), 1);
    assert!(manager.is_ready());
}

#[tokio::test]
async fn each_manager_gets_its_own_session() {
    let model = MockChatModel::new(vec![Script::Reply(vec!["first answer"])]);
    let first = ready_manager(&model).await;
    first.send_turn("hello").await.unwrap();
    drop(first);

    let second = ready_manager(&model).await;
    assert_eq!(model.starts.load(Ordering::SeqCst), 2);
    assert_eq!(second.transcript(), vec![Message::model(GREETING)]);
}

#[tokio::test]
async fn session_ids_differ_between_managers() {
    let model = MockChatModel::new(Vec::new());
    let a = ChatSessionManager::new(model.clone());
    let b = ChatSessionManager::new(model);
    assert_ne!(a.session_id(), b.session_id());
}

// =========================================================================
// send_turn: success
// =========================================================================

#[tokio::test]
async fn fragments_concatenate_in_arrival_order() {
    let model = MockChatModel::new(vec![Script::Reply(vec!["Hello", ", ", "gardener!"])]);
    let manager = ready_manager(&model).await;

    let outcome = manager.send_turn("Hi there").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed(Message::model("Hello, gardener!")));

    let transcript = manager.transcript();
    assert_eq!(transcript.len(), 3);
    assert_eq!(transcript[1], Message::user("Hi there"));
    assert_eq!(transcript[2], Message::model("Hello, gardener!"));
    assert!(!manager.is_busy());
}

#[tokio::test]
async fn observer_sees_placeholder_then_growing_reply() {
    let model = MockChatModel::new(vec![Script::Reply(vec!["Hello", ", ", "gardener!"])]);
    let manager = ready_manager(&model).await;

    let mut seen = Vec::new();
    manager
        .send_turn_with("Hi", |m| seen.push(m.text.clone()))
        .await
        .unwrap();
    assert_eq!(seen, vec!["", "Hello", "Hello, ", "Hello, gardener!"]);
}

#[tokio::test]
async fn user_text_is_kept_as_typed() {
    let model = MockChatModel::new(Vec::new());
    let manager = ready_manager(&model).await;

    manager.send_turn("  tomatoes?  ").await.unwrap();
    assert_eq!(manager.transcript()[1], Message::user("  tomatoes?  "));
    assert_eq!(model.sent(), vec!["  tomatoes?  "]);
}

#[tokio::test]
async fn every_turn_adds_one_user_and_one_model_message() {
    let model = MockChatModel::new(vec![
        Script::Reply(vec!["a"]),
        Script::FailOpen,
        Script::FailAfter(vec!["par", "tial"]),
        Script::Reply(vec!["b"]),
    ]);
    let manager = ready_manager(&model).await;

    for (i, text) in ["one", "two", "three", "four"].iter().enumerate() {
        manager.send_turn(text).await.unwrap();
        let transcript = manager.transcript();
        assert_eq!(transcript.len(), 1 + 2 * (i + 1));
        assert_eq!(transcript[transcript.len() - 2].role, Role::User);
        assert_eq!(transcript[transcript.len() - 1].role, Role::Model);
    }
}

#[tokio::test]
async fn empty_reply_completes_with_empty_text() {
    let model = MockChatModel::new(vec![Script::Reply(Vec::new())]);
    let manager = ready_manager(&model).await;

    let outcome = manager.send_turn("anything?").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed(Message::model("")));
    assert!(!manager.is_busy());
}

// =========================================================================
// send_turn: rejection
// =========================================================================

#[tokio::test]
async fn blank_input_is_rejected_without_side_effects() {
    let model = MockChatModel::new(Vec::new());
    let manager = ready_manager(&model).await;

    assert_eq!(manager.send_turn("").await, Err(ChatError::EmptyInput));
    assert_eq!(manager.send_turn(" \t\n").await, Err(ChatError::EmptyInput));
    assert_eq!(manager.transcript().len(), 1);
    assert!(model.sent().is_empty());
}

#[tokio::test]
async fn send_while_busy_is_rejected() {
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let model = MockChatModel::new(vec![Script::Gated {
        started: started_tx,
        release: release_rx,
        fragments: vec!["slow ", "reply"],
    }]);
    let manager = ready_manager(&model).await;

    let first = manager.send_turn("first");
    let second = async {
        started_rx.await.unwrap();
        assert!(manager.is_busy());
        let len_before = manager.transcript().len();
        let rejected = manager.send_turn("second").await;
        assert_eq!(manager.transcript().len(), len_before);
        release_tx.send(()).unwrap();
        rejected
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(second, Err(ChatError::Busy));
    assert_eq!(first.unwrap(), TurnOutcome::Completed(Message::model("slow reply")));
    assert_eq!(manager.transcript().len(), 3);
    assert_eq!(model.sent(), vec!["first"]);
    assert!(!manager.is_busy());
}

// =========================================================================
// send_turn: failure
// =========================================================================

#[tokio::test]
async fn session_creation_failure_surfaces_on_send() {
    let model = MockChatModel::failing();
    let manager = ready_manager(&model).await;
    assert!(!manager.is_ready());

    let outcome = manager.send_turn("hello").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Failed(Message::model(FALLBACK_REPLY)));
    let transcript = manager.transcript();
    assert_eq!(transcript.len(), 3);
    assert_eq!(transcript[2], Message::model(FALLBACK_REPLY));
    assert!(!manager.is_busy());
}

#[tokio::test]
async fn send_before_initialize_fails_softly() {
    let model = MockChatModel::new(Vec::new());
    let manager = ChatSessionManager::new(model.clone());

    let outcome = manager.send_turn("hello").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Failed(_)));
    assert!(model.sent().is_empty());
    assert!(!manager.is_busy());
}

#[tokio::test]
async fn open_failure_ends_with_fallback() {
    let model = MockChatModel::new(vec![Script::FailOpen]);
    let manager = ready_manager(&model).await;

    let outcome = manager.send_turn("hello").await.unwrap();
    assert_eq!(outcome.message(), &Message::model(FALLBACK_REPLY));
    assert_eq!(manager.transcript().last(), Some(&Message::model(FALLBACK_REPLY)));
    assert!(!manager.is_busy());
}

#[tokio::test]
async fn mid_stream_failure_replaces_partial_text() {
    let model = MockChatModel::new(vec![Script::FailAfter(vec!["Aphids are ", "tiny"])]);
    let manager = ready_manager(&model).await;

    let mut seen = Vec::new();
    let outcome = manager
        .send_turn_with("what are aphids", |m| seen.push(m.text.clone()))
        .await
        .unwrap();

    assert!(matches!(outcome, TurnOutcome::Failed(_)));
    assert_eq!(seen, vec!["", "Aphids are ", "Aphids are tiny", FALLBACK_REPLY]);
    let transcript = manager.transcript();
    assert_eq!(transcript.len(), 3);
    assert_eq!(transcript[2], Message::model(FALLBACK_REPLY));
    assert!(!manager.is_busy());
}

#[tokio::test]
async fn session_survives_a_failed_turn() {
    let model = MockChatModel::new(vec![Script::FailOpen, Script::Reply(vec!["Mulch in spring."])]);
    let manager = ready_manager(&model).await;

    manager.send_turn("first").await.unwrap();
    let outcome = manager.send_turn("second").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed(Message::model("Mulch in spring.")));
    assert_eq!(model.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_turn_ends_with_fallback_and_frees_manager() {
    let (started_tx, started_rx) = oneshot::channel();
    let (_release_tx, release_rx) = oneshot::channel();
    let model = MockChatModel::new(vec![
        Script::Gated { started: started_tx, release: release_rx, fragments: vec!["never"] },
        Script::Reply(vec!["Water at dawn."]),
    ]);
    let manager = ready_manager(&model).await;

    tokio::select! {
        _ = manager.send_turn("first") => panic!("gated turn finished early"),
        _ = started_rx => {}
    }

    assert!(!manager.is_busy());
    assert!(manager.is_ready());
    let transcript = manager.transcript();
    assert_eq!(transcript.len(), 3);
    assert_eq!(transcript[1], Message::user("first"));
    assert_eq!(transcript[2], Message::model(FALLBACK_REPLY));

    let outcome = manager.send_turn("second").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed(Message::model("Water at dawn.")));
    assert_eq!(manager.transcript().len(), 5);
    assert_eq!(model.starts.load(Ordering::SeqCst), 1);
    assert_eq!(model.sent(), vec!["first", "second"]);
}

// =========================================================================
// Message
// =========================================================================

#[test]
fn message_role_serializes_lowercase() {
    let json = serde_json::to_value(Message::model("hi")).unwrap();
    assert_eq!(json, serde_json::json!({ "role": "model", "text": "hi" }));
}
