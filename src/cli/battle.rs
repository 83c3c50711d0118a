//! "battle" command: two lanes relaying replies into each other.

use std::error::Error;
use std::str::FromStr;

use tokio_util::sync::CancellationToken;

use crate::cli::{build_adapter, lane_settings, pick_model, resolve_identity_or_exit};
use crate::core::chat_stream::split_reasoning;
use crate::core::config::Config;
use crate::core::engine::{ChatEngine, Turn};
use crate::core::lanes::{DualLane, Lane, LaneSlot};
use crate::core::message::Message;
use crate::core::retry::TokioSleeper;

/// `PROVIDER[:MODEL]` as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneTarget {
    pub provider: String,
    pub model: Option<String>,
}

impl FromStr for LaneTarget {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (provider, model) = match value.split_once(':') {
            Some((provider, model)) => (provider, Some(model)),
            None => (value, None),
        };
        let provider = provider.trim();
        if provider.is_empty() {
            return Err(format!("expected PROVIDER[:MODEL], got '{value}'"));
        }
        Ok(Self {
            provider: provider.to_string(),
            model: model
                .map(str::trim)
                .filter(|model| !model.is_empty())
                .map(str::to_string),
        })
    }
}

pub async fn run_battle(
    left: LaneTarget,
    right: LaneTarget,
    turns: Option<usize>,
    system: Option<String>,
    prompt: String,
) -> Result<(), Box<dyn Error>> {
    if prompt.trim().is_empty() {
        eprintln!("Usage: parley battle --left PROVIDER[:MODEL] --right PROVIDER[:MODEL] <prompt>");
        std::process::exit(1);
    }

    let config = Config::load()?;
    let mut slots = Vec::with_capacity(2);
    for (lane, target) in [(Lane::Primary, left), (Lane::Secondary, right)] {
        let identity = resolve_identity_or_exit(&config, Some(target.provider.as_str()));
        let adapter = build_adapter(&config, identity);
        let model = pick_model(&config, &adapter, target.model).await?;
        let engine = ChatEngine::new(lane, adapter)
            .with_settings(lane_settings(&config, system.clone(), Vec::new()));
        slots.push(LaneSlot::new(engine, model));
    }
    let secondary = slots.pop().ok_or("missing secondary lane")?;
    let primary = slots.pop().ok_or("missing primary lane")?;
    let lanes = DualLane::new(primary, secondary);

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.cancel();
            }
        });
    }

    let observer = |_: Lane, _: &[Message]| {};
    let label = |lane: Lane| lanes.slot(lane).model().name.clone();
    eprintln!("⚔️  {} vs {}", label(Lane::Primary), label(Lane::Secondary));

    let opening = lanes.send(Lane::Primary, Turn::text(prompt), &observer);
    tokio::pin!(opening);
    let finished = tokio::select! {
        outcome = &mut opening => Some(outcome),
        _ = stop.cancelled() => None,
    };
    let opened = match finished {
        Some(outcome) => outcome,
        None => {
            lanes.stop_all();
            opening.await
        }
    };

    let battle = match opened {
        Ok(_) if stop.is_cancelled() => Ok(0),
        Ok(_) => {
            lanes
                .run_auto_battle(
                    turns.unwrap_or(config.battle.max_turns),
                    config.battle.cooldown(),
                    &TokioSleeper,
                    &stop,
                    &observer,
                )
                .await
        }
        Err(err) => Err(err),
    };

    print!(
        "{}",
        render_transcript(
            &lanes.slot(Lane::Primary).transcript(),
            &lanes.slot(Lane::Secondary).transcript(),
            &label(Lane::Primary),
            &label(Lane::Secondary),
        )
    );

    match battle {
        Ok(relays) => {
            eprintln!("🏁 {relays} relays");
            Ok(())
        }
        Err(err) => {
            eprintln!("\n❌ Error: {err}");
            std::process::exit(1);
        }
    }
}

/// Visible turns of both lanes in time order. Relayed turns are hidden, so
/// each reply appears once under the model that wrote it.
fn render_transcript(
    primary: &[Message],
    secondary: &[Message],
    left_name: &str,
    right_name: &str,
) -> String {
    let mut entries: Vec<(&Message, &str)> = primary
        .iter()
        .map(|message| (message, left_name))
        .chain(secondary.iter().map(|message| (message, right_name)))
        .filter(|(message, _)| !message.hidden && !message.content.trim().is_empty())
        .collect();
    entries.sort_by_key(|(message, _)| message.created_at);

    let mut out = String::new();
    for (message, name) in entries {
        let speaker = if message.is_user() { "You" } else { name };
        let text = if message.is_error {
            format!("⚠️ {}", message.content)
        } else {
            split_reasoning(&message.content).1
        };
        out.push_str(&format!("── {speaker} ──\n{text}\n\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn lane_targets_parse() {
        assert_eq!(
            "openrouter:meta/llama-3:free".parse::<LaneTarget>().unwrap(),
            LaneTarget {
                provider: "openrouter".to_string(),
                model: Some("meta/llama-3:free".to_string()),
            }
        );
        assert_eq!("gemini:".parse::<LaneTarget>().unwrap().model, None);
        assert!(":gpt-4o".parse::<LaneTarget>().is_err());
    }

    #[test]
    fn transcript_interleaves_lanes_and_skips_relays() {
        let base = Utc::now();
        let stamp = |message: Message, offset: i64| {
            let mut message = message;
            message.created_at = base + Duration::milliseconds(offset);
            message
        };
        let primary = vec![
            stamp(Message::user("Tabs or spaces?"), 0),
            stamp(Message::model("<think>\nhmm\n</think>\n\nTabs."), 1),
            stamp(Message::user("Spaces.").with_hidden(true), 4),
            stamp(Message::model("Still tabs."), 5),
        ];
        let secondary = vec![
            stamp(Message::user("Tabs.").with_hidden(true), 2),
            stamp(Message::model("Spaces."), 3),
        ];

        let rendered = render_transcript(&primary, &secondary, "left", "right");
        assert_eq!(
            rendered,
            "── You ──\nTabs or spaces?\n\n── left ──\nTabs.\n\n── right ──\nSpaces.\n\n── left ──\nStill tabs.\n\n"
        );
    }
}
