//! One-shot "say" command: a single lane streaming to stdout.

use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::cli::{build_adapter, lane_settings, pick_model, resolve_identity_or_exit};
use crate::core::chat_stream::{split_reasoning, Completion};
use crate::core::config::Config;
use crate::core::engine::{ChatEngine, Turn};
use crate::core::lanes::Lane;
use crate::core::message::{guess_mime_type, Attachment, Message};
use crate::core::retrieval::KnowledgeFile;

pub struct SayOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub system: Option<String>,
    pub knowledge: Vec<PathBuf>,
    pub attach: Vec<PathBuf>,
    pub show_reasoning: bool,
    pub prompt: String,
}

pub async fn run_say(options: SayOptions) -> Result<(), Box<dyn Error>> {
    if options.prompt.trim().is_empty() {
        eprintln!("Usage: parley say <prompt>");
        std::process::exit(1);
    }

    let config = Config::load()?;
    let identity = resolve_identity_or_exit(&config, options.provider.as_deref());
    let adapter = build_adapter(&config, identity);
    let model = pick_model(&config, &adapter, options.model).await?;

    let knowledge = options
        .knowledge
        .iter()
        .map(|path| read_knowledge(path))
        .collect::<Result<Vec<_>, _>>()?;
    let attachments = options
        .attach
        .iter()
        .map(|path| read_attachment(path))
        .collect::<Result<Vec<_>, _>>()?;

    let engine = ChatEngine::new(Lane::Primary, adapter)
        .with_settings(lane_settings(&config, options.system, knowledge));

    let printer = AnswerPrinter::default();
    let sink = |messages: &[Message]| {
        if let Some(reply) = messages.last() {
            printer.update(&reply.content);
        }
    };

    let turn = Turn {
        text: options.prompt,
        attachments,
        hidden: false,
    };
    let send = engine.send(turn, &[], &model, &sink);
    tokio::pin!(send);
    let finished = tokio::select! {
        outcome = &mut send => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match finished {
        Some(outcome) => outcome,
        None => {
            engine.stop();
            send.await
        }
    };

    match result {
        Ok(outcome) => {
            println!();
            if outcome.completion == Completion::Cancelled {
                eprintln!("⏹  Cancelled");
            }
            if options.show_reasoning {
                if let Some(reply) = outcome.messages.last() {
                    let (reasoning, _) = split_reasoning(&reply.content);
                    if !reasoning.is_empty() {
                        eprintln!();
                        eprintln!("💭 Reasoning:");
                        eprintln!("{reasoning}");
                    }
                }
            }
            Ok(())
        }
        Err(err) => {
            eprintln!("\n\n❌ Error: {err}");
            std::process::exit(1);
        }
    }
}

/// Prints the growing answer, skipping `<think>` sections.
#[derive(Default)]
struct AnswerPrinter {
    printed: Mutex<String>,
}

impl AnswerPrinter {
    fn update(&self, content: &str) {
        let (_, answer) = split_reasoning(content);
        let mut printed = self.printed.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(fresh) = answer.strip_prefix(printed.as_str()) else {
            return;
        };
        if fresh.is_empty() {
            return;
        }
        print!("{fresh}");
        let _ = io::stdout().flush();
        *printed = answer;
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub(crate) fn read_knowledge(path: &Path) -> Result<KnowledgeFile, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("Failed to read knowledge file {}: {err}", path.display()))?;
    Ok(KnowledgeFile::new(file_name(path), text))
}

fn read_attachment(path: &Path) -> Result<Attachment, Box<dyn Error>> {
    let bytes = std::fs::read(path)
        .map_err(|err| format!("Failed to read attachment {}: {err}", path.display()))?;
    Ok(Attachment::from_bytes(guess_mime_type(&file_name(path)), &bytes))
}
