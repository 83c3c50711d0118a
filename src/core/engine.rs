//! One conversational lane: builds outbound requests, owns the lane's
//! cancellation slot, and reports incremental state to a message sink.
//!
//! A lane has at most one live generation. Starting a new one cancels the
//! previous token before the new token is installed, and every increment is
//! checked against the live generation id before it is applied, so output of
//! a superseded generation never reaches the sink.

use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::chat_stream::{ChatBackend, Completion, GenerateRequest, Increment, StreamError};
use crate::core::config::GenerationConfig;
use crate::core::errors::translate;
use crate::core::lanes::Lane;
use crate::core::message::{Attachment, Message};
use crate::core::retrieval::{augment_system_instruction, retrieve, KnowledgeFile, DEFAULT_MAX_CHARS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LanePhase {
    #[default]
    Idle,
    Generating,
    /// `stop` was requested; the backend has not returned yet.
    Cancelling,
}

/// Receives the full message list whenever a lane's view changes.
pub trait MessageSink: Send + Sync {
    fn publish(&self, messages: &[Message]);
}

impl<F> MessageSink for F
where
    F: Fn(&[Message]) + Send + Sync,
{
    fn publish(&self, messages: &[Message]) {
        self(messages)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub id: String,
    pub name: String,
}

impl ModelSelection {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Turn {
    pub text: String,
    pub attachments: Vec<Attachment>,
    /// Hidden turns are sent but not shown, e.g. relayed replies.
    pub hidden: bool,
}

impl Turn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaneSettings {
    pub system_instruction: Option<String>,
    pub generation: GenerationConfig,
    pub knowledge: Vec<KnowledgeFile>,
    pub knowledge_max_chars: usize,
}

impl Default for LaneSettings {
    fn default() -> Self {
        Self {
            system_instruction: None,
            generation: GenerationConfig::default(),
            knowledge: Vec::new(),
            knowledge_max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub completion: Completion,
    /// The lane's messages as last published for this generation.
    pub messages: Vec<Message>,
}

#[derive(Debug)]
pub enum EngineError {
    /// The backend failed; `message` is the translated text shown on the
    /// errored placeholder.
    Generation { message: String, source: StreamError },
    NothingToRegenerate,
    NothingToRelay,
    LanesBusy,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Generation { message, .. } => f.write_str(message),
            EngineError::NothingToRegenerate => {
                write!(f, "The last message is not a model reply that can be regenerated")
            }
            EngineError::NothingToRelay => write!(f, "There is no completed reply to relay"),
            EngineError::LanesBusy => write!(f, "Both lanes must be idle to relay"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::Generation { source, .. } => Some(source),
            _ => None,
        }
    }
}

struct ActiveGeneration {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct LaneState {
    phase: LanePhase,
    active: Option<ActiveGeneration>,
    next_id: u64,
}

pub struct ChatEngine {
    lane: Lane,
    backend: Arc<dyn ChatBackend>,
    settings: Mutex<LaneSettings>,
    state: Mutex<LaneState>,
}

impl ChatEngine {
    pub fn new(lane: Lane, backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            lane,
            backend,
            settings: Mutex::new(LaneSettings::default()),
            state: Mutex::new(LaneState::default()),
        }
    }

    pub fn with_settings(self, settings: LaneSettings) -> Self {
        self.set_settings(settings);
        self
    }

    pub fn set_settings(&self, settings: LaneSettings) {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn settings(&self) -> LaneSettings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn phase(&self) -> LanePhase {
        self.state().phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase() == LanePhase::Idle
    }

    fn state(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel whatever is live, then install a fresh token.
    fn begin(&self) -> (u64, CancellationToken) {
        let mut state = self.state();
        if let Some(previous) = state.active.take() {
            debug!(lane = self.lane.label(), id = previous.id, "superseding generation");
            previous.token.cancel();
        }
        state.next_id += 1;
        let id = state.next_id;
        let token = CancellationToken::new();
        state.active = Some(ActiveGeneration {
            id,
            token: token.clone(),
        });
        state.phase = LanePhase::Generating;
        (id, token)
    }

    fn is_current(&self, id: u64) -> bool {
        self.state()
            .active
            .as_ref()
            .is_some_and(|active| active.id == id && !active.token.is_cancelled())
    }

    fn finish(&self, id: u64) {
        let mut state = self.state();
        if state.active.as_ref().is_some_and(|active| active.id == id) {
            state.active = None;
            state.phase = LanePhase::Idle;
        }
    }

    /// Cancel the live generation, if any. Calling it again is harmless.
    pub fn stop(&self) {
        let mut state = self.state();
        let Some(active) = state.active.as_ref() else {
            return;
        };
        if !active.token.is_cancelled() {
            debug!(lane = self.lane.label(), id = active.id, "stop requested");
            active.token.cancel();
            state.phase = LanePhase::Cancelling;
        }
    }

    pub async fn send(
        &self,
        turn: Turn,
        history: &[Message],
        model: &ModelSelection,
        sink: &dyn MessageSink,
    ) -> Result<SendOutcome, EngineError> {
        let settings = self.settings();
        let request = build_request(self.lane, &settings, &turn, history, &model.id);

        let (id, token) = self.begin();

        let mut messages = history.to_vec();
        messages.push(
            Message::user(turn.text)
                .with_attachments(turn.attachments)
                .with_hidden(turn.hidden),
        );
        messages.push(Message::placeholder(&model.id, &model.name));
        let reply_index = messages.len() - 1;
        sink.publish(&messages);

        let result = {
            let mut on_increment = |increment: Increment| {
                if !self.is_current(id) {
                    debug!(lane = self.lane.label(), id, "discarding increment from stale generation");
                    return;
                }
                let reply = &mut messages[reply_index];
                reply.content = increment.text;
                if let Some(metadata) = increment.metadata.filter(has_content) {
                    reply.grounding = Some(metadata);
                }
                sink.publish(&messages);
            };
            self.backend
                .stream_generate(&request, &mut on_increment, &token)
                .await
        };

        let current = self.is_current(id);
        self.finish(id);

        let completion = match result {
            Ok(_) if token.is_cancelled() => Completion::Cancelled,
            Ok(completion) => completion,
            Err(err) if token.is_cancelled() => {
                debug!(lane = self.lane.label(), id, "ignoring failure after cancellation: {err}");
                Completion::Cancelled
            }
            Err(err) => {
                let message = translate(&err.to_string());
                debug!(lane = self.lane.label(), id, "generation failed: {err}");
                if current {
                    let reply = &mut messages[reply_index];
                    reply.is_error = true;
                    reply.content = message.clone();
                    sink.publish(&messages);
                }
                return Err(EngineError::Generation {
                    message,
                    source: err,
                });
            }
        };

        Ok(SendOutcome {
            completion,
            messages,
        })
    }

    /// Replace the trailing model reply by re-sending the user turn before it.
    pub async fn regenerate(
        &self,
        history: &[Message],
        model: &ModelSelection,
        sink: &dyn MessageSink,
    ) -> Result<SendOutcome, EngineError> {
        let Some((last, earlier)) = history.split_last() else {
            return Err(EngineError::NothingToRegenerate);
        };
        if !last.is_model() {
            return Err(EngineError::NothingToRegenerate);
        }
        let user_index = earlier
            .iter()
            .rposition(Message::is_user)
            .ok_or(EngineError::NothingToRegenerate)?;
        let user = &earlier[user_index];
        let turn = Turn {
            text: user.content.clone(),
            attachments: user.attachments.clone(),
            hidden: user.hidden,
        };
        self.send(turn, &earlier[..user_index], model, sink).await
    }
}

fn build_request(
    lane: Lane,
    settings: &LaneSettings,
    turn: &Turn,
    history: &[Message],
    model_id: &str,
) -> GenerateRequest {
    let knowledge: Vec<KnowledgeFile> = settings
        .knowledge
        .iter()
        .filter(|file| file.is_enabled_for(lane))
        .cloned()
        .collect();
    let base = settings.system_instruction.as_deref();
    let system_instruction = if knowledge.is_empty() {
        base.map(str::to_string)
    } else {
        let context = retrieve(&turn.text, &knowledge, settings.knowledge_max_chars);
        if context.is_empty() {
            base.map(str::to_string)
        } else {
            debug!(lane = lane.label(), chars = context.chars().count(), "attaching knowledge context");
            Some(augment_system_instruction(base, &context, &turn.text))
        }
    };

    GenerateRequest {
        model_id: model_id.to_string(),
        turn_text: turn.text.clone(),
        attachments: turn.attachments.clone(),
        history: windowed_history(history, settings.generation.history_window),
        system_instruction,
        config: settings.generation.clone(),
    }
}

/// The last `window` conversational turns.
fn windowed_history(history: &[Message], window: usize) -> Vec<Message> {
    let conversational: Vec<&Message> = history
        .iter()
        .filter(|message| message.is_conversational())
        .collect();
    let skip = conversational.len().saturating_sub(window);
    conversational.into_iter().skip(skip).cloned().collect()
}

fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{Script, ScriptedBackend, Step};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingSink {
        snapshots: StdMutex<Vec<Vec<Message>>>,
    }

    impl RecordingSink {
        fn snapshots(&self) -> Vec<Vec<Message>> {
            self.snapshots.lock().unwrap().clone()
        }

        fn last(&self) -> Vec<Message> {
            self.snapshots().last().cloned().unwrap_or_default()
        }
    }

    impl MessageSink for RecordingSink {
        fn publish(&self, messages: &[Message]) {
            self.snapshots.lock().unwrap().push(messages.to_vec());
        }
    }

    fn engine(backend: Arc<ScriptedBackend>) -> Arc<ChatEngine> {
        Arc::new(ChatEngine::new(Lane::Primary, backend))
    }

    fn model() -> ModelSelection {
        ModelSelection::new("test-model")
    }

    #[tokio::test]
    async fn send_publishes_optimistically_then_streams() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::new(vec![
            Step::Emit("Hel".to_string()),
            Step::Emit("Hello".to_string()),
        ])]));
        let engine = engine(backend.clone());
        let sink = RecordingSink::default();

        let outcome = engine
            .send(Turn::text("Hi"), &[], &model(), &sink)
            .await
            .unwrap();

        assert_eq!(outcome.completion, Completion::Finished);
        let snapshots = sink.snapshots();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].len(), 2);
        assert_eq!(snapshots[0][0].content, "Hi");
        assert_eq!(snapshots[0][1].content, "");
        assert_eq!(snapshots[0][1].model_id.as_deref(), Some("test-model"));
        assert_eq!(snapshots[2][1].content, "Hello");
        assert_eq!(outcome.messages, snapshots[2]);
        assert!(engine.is_idle());
    }

    #[tokio::test]
    async fn metadata_is_merged_only_when_non_empty() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::new(vec![
            Step::EmitWithMetadata("a".to_string(), json!({"webSearchQueries": ["q"]})),
            Step::EmitWithMetadata("ab".to_string(), json!({})),
            Step::EmitWithMetadata("abc".to_string(), Value::Null),
        ])]));
        let engine = engine(backend);
        let sink = RecordingSink::default();

        let outcome = engine
            .send(Turn::text("Hi"), &[], &model(), &sink)
            .await
            .unwrap();

        let reply = &outcome.messages[1];
        assert_eq!(reply.content, "abc");
        assert_eq!(reply.grounding, Some(json!({"webSearchQueries": ["q"]})));
    }

    #[tokio::test]
    async fn failure_marks_placeholder_and_propagates() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::new(vec![
            Step::Emit("partial".to_string()),
            Step::Fail(StreamError::Http {
                status: 429,
                message: "You exceeded your current quota".to_string(),
            }),
        ])]));
        let engine = engine(backend);
        let sink = RecordingSink::default();

        let err = engine
            .send(Turn::text("Hi"), &[], &model(), &sink)
            .await
            .unwrap_err();

        let EngineError::Generation { message, source } = &err else {
            panic!("expected generation error, got {err:?}");
        };
        assert!(message.starts_with("Quota exhausted"));
        assert!(matches!(source, StreamError::Http { status: 429, .. }));
        let last = sink.last();
        assert!(last[1].is_error);
        assert_eq!(&last[1].content, message);
        assert!(engine.is_idle());
    }

    #[tokio::test]
    async fn stop_before_any_increment_is_not_an_error() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend::new(vec![Script::new(vec![
            Step::Wait(gate.clone()),
            Step::Emit("too late".to_string()),
        ])]));
        let engine = engine(backend);
        let sink = Arc::new(RecordingSink::default());

        let task = {
            let engine = engine.clone();
            let sink = sink.clone();
            tokio::spawn(async move { engine.send(Turn::text("Hi"), &[], &model(), &*sink).await })
        };
        while engine.is_idle() {
            tokio::task::yield_now().await;
        }
        engine.stop();
        engine.stop();
        assert_eq!(engine.phase(), LanePhase::Cancelling);

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.completion, Completion::Cancelled);
        assert_eq!(sink.snapshots().len(), 1);
        assert_eq!(outcome.messages[1].content, "");
        assert!(!outcome.messages[1].is_error);
        assert!(engine.is_idle());
    }

    #[tokio::test]
    async fn stop_is_a_no_op_when_idle() {
        let engine = engine(Arc::new(ScriptedBackend::default()));
        engine.stop();
        assert!(engine.is_idle());
    }

    #[tokio::test]
    async fn second_send_supersedes_the_first() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend::new(vec![
            Script::new(vec![
                Step::Emit("first".to_string()),
                Step::Wait(gate.clone()),
                Step::Emit("first, late".to_string()),
            ])
            .ignoring_cancel(),
            Script::new(vec![Step::Emit("second".to_string())]),
        ]));
        let engine = engine(backend);
        let first_sink = Arc::new(RecordingSink::default());

        let first = {
            let engine = engine.clone();
            let sink = first_sink.clone();
            tokio::spawn(async move { engine.send(Turn::text("one"), &[], &model(), &*sink).await })
        };
        while first_sink.snapshots().len() < 2 {
            tokio::task::yield_now().await;
        }

        let second_sink = RecordingSink::default();
        let second = engine
            .send(Turn::text("two"), &[], &model(), &second_sink)
            .await
            .unwrap();
        assert_eq!(second.completion, Completion::Finished);
        assert_eq!(second.messages[1].content, "second");

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.completion, Completion::Cancelled);
        assert_eq!(first.messages[1].content, "first");
        assert!(first_sink
            .snapshots()
            .iter()
            .all(|snapshot| snapshot[1].content != "first, late"));
        assert!(engine.is_idle());
    }

    #[tokio::test]
    async fn regenerate_resends_the_preceding_user_turn() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::new(vec![Step::Emit(
            "better".to_string(),
        )])]));
        let engine = engine(backend.clone());
        let sink = RecordingSink::default();
        let history = vec![
            Message::user("earlier"),
            Message::model("earlier reply"),
            Message::user("question").with_hidden(true),
            Message::model("bad answer"),
        ];

        let outcome = engine.regenerate(&history, &model(), &sink).await.unwrap();

        assert_eq!(outcome.messages.len(), 4);
        assert_eq!(outcome.messages[2].content, "question");
        assert!(outcome.messages[2].hidden);
        assert_eq!(outcome.messages[3].content, "better");
        let request = &backend.requests()[0];
        assert_eq!(request.turn_text, "question");
        assert_eq!(request.history.len(), 2);
    }

    #[tokio::test]
    async fn regenerate_requires_a_trailing_model_turn() {
        let engine = engine(Arc::new(ScriptedBackend::default()));
        let sink = RecordingSink::default();
        for history in [vec![], vec![Message::user("q")], vec![Message::model("a")]] {
            assert!(matches!(
                engine.regenerate(&history, &model(), &sink).await,
                Err(EngineError::NothingToRegenerate)
            ));
        }
    }

    #[tokio::test]
    async fn request_uses_window_and_knowledge() {
        let backend = Arc::new(ScriptedBackend::default());
        let mut settings = LaneSettings {
            system_instruction: Some("Be brief.".to_string()),
            ..LaneSettings::default()
        };
        settings.generation.history_window = 2;
        settings.knowledge = vec![
            KnowledgeFile::new("policy.txt", "Our refund policy lasts 30 days."),
            KnowledgeFile::new("other.txt", "refund for the other lane").for_lanes(vec![Lane::Secondary]),
        ];
        let engine = Arc::new(ChatEngine::new(Lane::Primary, backend.clone()).with_settings(settings));
        let mut errored = Message::model("boom");
        errored.is_error = true;
        let history = vec![
            Message::user("one"),
            Message::model("two"),
            Message::user("three"),
            errored,
            Message::model("four"),
        ];

        engine
            .send(Turn::text("refund?"), &history, &model(), &RecordingSink::default())
            .await
            .unwrap();

        let request = &backend.requests()[0];
        let contents: Vec<&str> = request.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["three", "four"]);
        let system = request.system_instruction.as_deref().unwrap();
        assert!(system.starts_with("Be brief."));
        assert!(system.contains("[Source: policy.txt (score: 1)]"));
        assert!(!system.contains("other.txt"));
        assert!(system.ends_with("User question: refund?"));
    }
}
