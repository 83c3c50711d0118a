//! Two side-by-side chat lanes with reply relay and auto-battle.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::chat_stream::{split_reasoning, Completion};
use crate::core::engine::{ChatEngine, EngineError, ModelSelection, SendOutcome, Turn};
use crate::core::message::Message;
use crate::core::retry::Sleeper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Primary,
    Secondary,
}

impl Lane {
    pub fn other(self) -> Lane {
        match self {
            Lane::Primary => Lane::Secondary,
            Lane::Secondary => Lane::Primary,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Lane::Primary => "primary",
            Lane::Secondary => "secondary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    PrimaryToSecondary,
    SecondaryToPrimary,
}

impl RelayDirection {
    pub fn from_source(source: Lane) -> Self {
        match source {
            Lane::Primary => RelayDirection::PrimaryToSecondary,
            Lane::Secondary => RelayDirection::SecondaryToPrimary,
        }
    }

    pub fn source(self) -> Lane {
        match self {
            RelayDirection::PrimaryToSecondary => Lane::Primary,
            RelayDirection::SecondaryToPrimary => Lane::Secondary,
        }
    }

    pub fn target(self) -> Lane {
        self.source().other()
    }
}

/// Notified with a lane's full message list whenever it changes.
pub trait LaneObserver: Send + Sync {
    fn lane_updated(&self, lane: Lane, messages: &[Message]);
}

impl<F> LaneObserver for F
where
    F: Fn(Lane, &[Message]) + Send + Sync,
{
    fn lane_updated(&self, lane: Lane, messages: &[Message]) {
        self(lane, messages)
    }
}

pub struct LaneSlot {
    engine: ChatEngine,
    model: ModelSelection,
    transcript: Mutex<Vec<Message>>,
}

impl LaneSlot {
    pub fn new(engine: ChatEngine, model: ModelSelection) -> Self {
        Self {
            engine,
            model,
            transcript: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &ChatEngine {
        &self.engine
    }

    pub fn model(&self) -> &ModelSelection {
        &self.model
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_transcript(&self, messages: &[Message]) {
        *self.transcript.lock().unwrap_or_else(PoisonError::into_inner) = messages.to_vec();
    }
}

pub struct DualLane {
    primary: LaneSlot,
    secondary: LaneSlot,
}

impl DualLane {
    pub fn new(primary: LaneSlot, secondary: LaneSlot) -> Self {
        Self { primary, secondary }
    }

    pub fn slot(&self, lane: Lane) -> &LaneSlot {
        match lane {
            Lane::Primary => &self.primary,
            Lane::Secondary => &self.secondary,
        }
    }

    pub fn both_idle(&self) -> bool {
        self.primary.engine.is_idle() && self.secondary.engine.is_idle()
    }

    pub fn stop_all(&self) {
        self.primary.engine.stop();
        self.secondary.engine.stop();
    }

    /// Send a turn into one lane, continuing its transcript.
    pub async fn send(
        &self,
        lane: Lane,
        turn: Turn,
        observer: &dyn LaneObserver,
    ) -> Result<SendOutcome, EngineError> {
        let slot = self.slot(lane);
        let history = slot.transcript();
        let sink = |messages: &[Message]| {
            slot.replace_transcript(messages);
            observer.lane_updated(lane, messages);
        };
        slot.engine.send(turn, &history, &slot.model, &sink).await
    }

    /// Regenerate the trailing reply of one lane.
    pub async fn regenerate(
        &self,
        lane: Lane,
        observer: &dyn LaneObserver,
    ) -> Result<SendOutcome, EngineError> {
        let slot = self.slot(lane);
        let history = slot.transcript();
        let sink = |messages: &[Message]| {
            slot.replace_transcript(messages);
            observer.lane_updated(lane, messages);
        };
        slot.engine.regenerate(&history, &slot.model, &sink).await
    }

    /// Resend the source lane's latest reply into the target lane as a
    /// hidden user turn.
    pub async fn relay(
        &self,
        direction: RelayDirection,
        observer: &dyn LaneObserver,
    ) -> Result<SendOutcome, EngineError> {
        if !self.both_idle() {
            return Err(EngineError::LanesBusy);
        }
        let transcript = self.slot(direction.source()).transcript();
        let reply = latest_reply(&transcript).ok_or(EngineError::NothingToRelay)?;

        let (_, answer) = split_reasoning(&reply.content);
        let text = if answer.is_empty() {
            reply.content.clone()
        } else {
            answer
        };
        debug!(
            from = direction.source().label(),
            to = direction.target().label(),
            chars = text.chars().count(),
            "relaying reply"
        );

        let turn = Turn {
            text,
            attachments: Vec::new(),
            hidden: true,
        };
        self.send(direction.target(), turn, observer).await
    }

    /// The relay that would bring the lanes back in step, if any.
    pub fn next_relay(&self) -> Option<RelayDirection> {
        next_relay(&self.primary.transcript(), &self.secondary.transcript())
    }

    /// Keep relaying the newer lane's reply into the other lane until
    /// `max_turns` relays have run, nothing is left to relay, or `stop` is
    /// cancelled. Returns the number of completed relays.
    pub async fn run_auto_battle(
        &self,
        max_turns: usize,
        cooldown: Duration,
        sleeper: &dyn Sleeper,
        stop: &CancellationToken,
        observer: &dyn LaneObserver,
    ) -> Result<usize, EngineError> {
        let mut turns = 0;
        while turns < max_turns && !stop.is_cancelled() {
            if !self.both_idle() {
                tokio::select! {
                    _ = sleeper.sleep(cooldown) => continue,
                    _ = stop.cancelled() => break,
                }
            }
            let Some(direction) = self.next_relay() else {
                debug!("lanes are in step; auto-battle finished");
                break;
            };

            let relay = self.relay(direction, observer);
            tokio::pin!(relay);
            let finished = tokio::select! {
                outcome = &mut relay => Some(outcome),
                _ = stop.cancelled() => None,
            };
            let outcome = match finished {
                Some(outcome) => outcome,
                None => {
                    self.stop_all();
                    relay.await
                }
            }?;
            if outcome.completion == Completion::Cancelled {
                break;
            }

            turns += 1;
            info!(turn = turns, ?direction, "auto-battle relay complete");
            if turns < max_turns {
                tokio::select! {
                    _ = sleeper.sleep(cooldown) => {}
                    _ = stop.cancelled() => break,
                }
            }
        }
        Ok(turns)
    }
}

/// Most recent completed, non-errored model reply.
pub fn latest_reply(messages: &[Message]) -> Option<&Message> {
    messages
        .iter()
        .rev()
        .find(|message| message.is_model() && !message.is_error && !message.content.trim().is_empty())
}

/// The lane whose latest reply is newer than anything in the other lane
/// relays next. `None` when neither lane has a reply or the other lane has
/// already moved past it.
pub fn next_relay(primary: &[Message], secondary: &[Message]) -> Option<RelayDirection> {
    let source = match (latest_reply(primary), latest_reply(secondary)) {
        (None, None) => return None,
        (Some(_), None) => Lane::Primary,
        (None, Some(_)) => Lane::Secondary,
        (Some(p), Some(s)) => {
            if p.created_at >= s.created_at {
                Lane::Primary
            } else {
                Lane::Secondary
            }
        }
    };

    let (source_messages, target_messages) = match source {
        Lane::Primary => (primary, secondary),
        Lane::Secondary => (secondary, primary),
    };
    let reply_at = latest_reply(source_messages)?.created_at;
    let in_step = target_messages
        .last()
        .is_some_and(|latest| latest.created_at >= reply_at);
    (!in_step).then(|| RelayDirection::from_source(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chat_stream::StreamError;
    use crate::utils::test_utils::{RecordingSleeper, Script, ScriptedBackend, Step};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    fn at(message: Message, offset_ms: i64) -> Message {
        let mut message = message;
        message.created_at = Utc::now() + ChronoDuration::milliseconds(offset_ms);
        message
    }

    fn dual(primary: Arc<ScriptedBackend>, secondary: Arc<ScriptedBackend>) -> DualLane {
        DualLane::new(
            LaneSlot::new(
                ChatEngine::new(Lane::Primary, primary),
                ModelSelection::new("left-model"),
            ),
            LaneSlot::new(
                ChatEngine::new(Lane::Secondary, secondary),
                ModelSelection::new("right-model"),
            ),
        )
    }

    fn ignore(_: Lane, _: &[Message]) {}

    fn script(text: &str) -> Script {
        Script::new(vec![Step::Emit(text.to_string())])
    }

    #[test]
    fn lanes_pair_up() {
        assert_eq!(Lane::Primary.other(), Lane::Secondary);
        assert_eq!(Lane::Secondary.other().label(), "primary");
        assert_eq!(RelayDirection::from_source(Lane::Secondary).target(), Lane::Primary);
    }

    #[test]
    fn next_relay_follows_the_newer_reply() {
        let primary = vec![at(Message::user("q"), 0), at(Message::model("p1"), 10)];
        assert_eq!(
            next_relay(&primary, &[]),
            Some(RelayDirection::PrimaryToSecondary)
        );

        let secondary = vec![
            at(Message::user("p1").with_hidden(true), 20),
            at(Message::model("s1"), 30),
        ];
        assert_eq!(
            next_relay(&primary, &secondary),
            Some(RelayDirection::SecondaryToPrimary)
        );

        let mut primary_after = primary.clone();
        primary_after.push(at(Message::user("s1").with_hidden(true), 40));
        assert_eq!(next_relay(&primary_after, &secondary), None);
        assert_eq!(next_relay(&[], &[]), None);
    }

    #[test]
    fn errored_replies_are_not_relayed() {
        let mut failed = at(Message::model("Rate limited"), 10);
        failed.is_error = true;
        let primary = vec![at(Message::user("q"), 0), failed];
        assert_eq!(latest_reply(&primary), None);
        assert_eq!(next_relay(&primary, &[]), None);
    }

    #[tokio::test]
    async fn relay_sends_hidden_answer_without_reasoning() {
        let primary = Arc::new(ScriptedBackend::new(vec![script(
            "<think>\nprivate\n</think>\n\nPublic answer",
        )]));
        let secondary = Arc::new(ScriptedBackend::new(vec![script("Rebuttal")]));
        let lanes = dual(primary, secondary.clone());

        lanes
            .send(Lane::Primary, Turn::text("Topic"), &ignore)
            .await
            .unwrap();
        let outcome = lanes
            .relay(RelayDirection::PrimaryToSecondary, &ignore)
            .await
            .unwrap();

        assert_eq!(outcome.completion, Completion::Finished);
        let transcript = lanes.slot(Lane::Secondary).transcript();
        assert_eq!(transcript.len(), 2);
        assert!(transcript[0].hidden);
        assert_eq!(transcript[0].content, "Public answer");
        assert_eq!(transcript[1].content, "Rebuttal");
        assert_eq!(secondary.requests()[0].turn_text, "Public answer");
    }

    #[tokio::test]
    async fn relay_without_reply_fails() {
        let lanes = dual(
            Arc::new(ScriptedBackend::default()),
            Arc::new(ScriptedBackend::default()),
        );
        assert!(matches!(
            lanes.relay(RelayDirection::SecondaryToPrimary, &ignore).await,
            Err(EngineError::NothingToRelay)
        ));
    }

    #[tokio::test]
    async fn relay_is_refused_while_a_lane_is_busy() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let primary = Arc::new(ScriptedBackend::new(vec![
            script("answer"),
            Script::new(vec![Step::Wait(gate.clone())]),
        ]));
        let lanes = Arc::new(dual(primary, Arc::new(ScriptedBackend::default())));
        lanes
            .send(Lane::Primary, Turn::text("Topic"), &ignore)
            .await
            .unwrap();

        let busy = {
            let lanes = lanes.clone();
            tokio::spawn(async move {
                lanes
                    .send(Lane::Primary, Turn::text("again"), &ignore)
                    .await
            })
        };
        while lanes.slot(Lane::Primary).engine().is_idle() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            lanes.relay(RelayDirection::PrimaryToSecondary, &ignore).await,
            Err(EngineError::LanesBusy)
        ));
        gate.notify_one();
        busy.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn auto_battle_alternates_with_cooldown() {
        let primary = Arc::new(ScriptedBackend::new(vec![
            script("opening"),
            script("left 2"),
        ]));
        let secondary = Arc::new(ScriptedBackend::new(vec![
            script("right 1"),
            script("right 2"),
        ]));
        let lanes = dual(primary.clone(), secondary.clone());
        let sleeper = RecordingSleeper::default();
        let stop = CancellationToken::new();

        lanes
            .send(Lane::Primary, Turn::text("Debate tabs vs spaces"), &ignore)
            .await
            .unwrap();
        let turns = lanes
            .run_auto_battle(3, Duration::from_millis(1500), &sleeper, &stop, &ignore)
            .await
            .unwrap();

        assert_eq!(turns, 3);
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(1500); 2]);
        let relayed: Vec<String> = secondary
            .requests()
            .iter()
            .map(|request| request.turn_text.clone())
            .collect();
        assert_eq!(relayed, vec!["opening", "left 2"]);
        assert_eq!(primary.requests()[1].turn_text, "right 1");
        assert_eq!(lanes.slot(Lane::Secondary).transcript().len(), 4);
    }

    #[tokio::test]
    async fn auto_battle_stops_on_failure() {
        let primary = Arc::new(ScriptedBackend::new(vec![script("opening")]));
        let secondary = Arc::new(ScriptedBackend::new(vec![Script::new(vec![Step::Fail(
            StreamError::Network("connection refused".to_string()),
        )])]));
        let lanes = dual(primary, secondary);
        let sleeper = RecordingSleeper::default();

        lanes
            .send(Lane::Primary, Turn::text("Topic"), &ignore)
            .await
            .unwrap();
        let result = lanes
            .run_auto_battle(4, Duration::ZERO, &sleeper, &CancellationToken::new(), &ignore)
            .await;

        assert!(matches!(result, Err(EngineError::Generation { .. })));
        assert!(lanes.slot(Lane::Secondary).transcript()[1].is_error);
    }

    #[tokio::test]
    async fn auto_battle_honors_stop_token() {
        let lanes = dual(
            Arc::new(ScriptedBackend::new(vec![script("opening")])),
            Arc::new(ScriptedBackend::default()),
        );
        lanes
            .send(Lane::Primary, Turn::text("Topic"), &ignore)
            .await
            .unwrap();
        let stop = CancellationToken::new();
        stop.cancel();

        let turns = lanes
            .run_auto_battle(5, Duration::ZERO, &RecordingSleeper::default(), &stop, &ignore)
            .await
            .unwrap();
        assert_eq!(turns, 0);
        assert!(lanes.slot(Lane::Secondary).transcript().is_empty());
    }
}
