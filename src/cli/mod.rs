//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod battle;
pub mod model_list;
pub mod provider_list;
pub mod say;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::battle::{run_battle, LaneTarget};
use crate::cli::model_list::list_models;
use crate::cli::provider_list::list_providers;
use crate::cli::say::{run_say, SayOptions};
use crate::core::chat_stream::{ChatBackend, ProviderAdapter};
use crate::core::config::Config;
use crate::core::engine::{LaneSettings, ModelSelection};
use crate::core::providers::{resolve_identity, EnvCredentials, ProviderIdentity};
use crate::core::retrieval::KnowledgeFile;
use crate::core::retry::RetryPolicy;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("VERGEN_GIT_SHA"),
    "\nbuilt: ",
    env!("VERGEN_BUILD_DATE"),
    "\nrustc: ",
    env!("VERGEN_RUSTC_SEMVER")
);

#[derive(Parser)]
#[command(name = "parley")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "Stream chats from Gemini, OpenAI-compatible and Anthropic-compatible providers")]
#[command(
    long_about = "Parley streams conversations from several LLM provider families through one \
interface. Two lanes can run side by side and relay replies into each other.\n\n\
Authentication:\n\
  Set <PROVIDER>_API_KEY for each provider you use, for example GEMINI_API_KEY or \
OPENAI_API_KEY.\n\
  <PROVIDER>_BASE_URL overrides the provider's base address.\n\n\
Logging:\n\
  PARLEY_LOG        Log filter written to stderr (default: warn)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List known providers and whether a key is available
    Providers,
    /// List the models a provider offers
    Models {
        /// Provider to query (defaults to the configured provider)
        #[arg(short = 'p', long)]
        provider: Option<String>,
    },
    /// Send a single prompt and stream the answer to stdout
    Say {
        #[arg(short = 'p', long)]
        provider: Option<String>,
        #[arg(short = 'm', long)]
        model: Option<String>,
        /// System instruction for this request
        #[arg(short = 's', long)]
        system: Option<String>,
        /// Text file to search for context (repeatable)
        #[arg(short = 'k', long = "knowledge", value_name = "FILE")]
        knowledge: Vec<PathBuf>,
        /// File to attach to the prompt (repeatable)
        #[arg(short = 'a', long = "attach", value_name = "FILE")]
        attach: Vec<PathBuf>,
        /// Also print the model's reasoning to stderr
        #[arg(long)]
        show_reasoning: bool,
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
    },
    /// Let two lanes answer each other, starting from a prompt
    Battle {
        /// PROVIDER[:MODEL] for the lane that opens
        #[arg(long)]
        left: LaneTarget,
        /// PROVIDER[:MODEL] for the lane that answers
        #[arg(long)]
        right: LaneTarget,
        /// Number of relays after the opening answer
        #[arg(short = 't', long)]
        turns: Option<usize>,
        #[arg(short = 's', long)]
        system: Option<String>,
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
    },
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the current configuration
    Show,
    /// Set a configuration value
    Set {
        key: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        value: Vec<String>,
    },
    /// Set the default model for a provider
    SetModel { provider: String, model: String },
    /// Remove the default model for a provider
    UnsetModel { provider: String },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("PARLEY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    // A second init (tests, embedding) keeps the existing subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Providers => list_providers(),
        Commands::Models { provider } => list_models(provider).await,
        Commands::Say {
            provider,
            model,
            system,
            knowledge,
            attach,
            show_reasoning,
            prompt,
        } => {
            run_say(SayOptions {
                provider,
                model,
                system,
                knowledge,
                attach,
                show_reasoning,
                prompt: prompt.join(" "),
            })
            .await
        }
        Commands::Battle {
            left,
            right,
            turns,
            system,
            prompt,
        } => run_battle(left, right, turns, system, prompt.join(" ")).await,
        Commands::Config { action } => run_config(action.unwrap_or(ConfigAction::Show)),
    }
}

fn run_config(action: ConfigAction) -> Result<(), Box<dyn Error>> {
    let mut config = Config::load()?;
    match action {
        ConfigAction::Show => config.print_all(),
        ConfigAction::Set { key, value } => {
            let value = value.join(" ");
            if let Err(message) = config.set_value(&key, &value) {
                eprintln!("❌ {message}");
                std::process::exit(1);
            }
            config.save()?;
            println!("✅ Set {key} to: {value}");
        }
        ConfigAction::SetModel { provider, model } => {
            config.set_default_model(provider.clone(), model.clone());
            config.save()?;
            println!("✅ Set default model for provider '{provider}' to: {model}");
        }
        ConfigAction::UnsetModel { provider } => {
            config.unset_default_model(&provider);
            config.save()?;
            println!("✅ Unset default model for provider: {provider}");
        }
    }
    Ok(())
}

/// Resolve a provider or exit with the resolution error and its quick fixes.
pub(crate) fn resolve_identity_or_exit(config: &Config, provider: Option<&str>) -> ProviderIdentity {
    match resolve_identity(&EnvCredentials, config, provider) {
        Ok(identity) => identity,
        Err(err) => {
            eprintln!("{err}");
            let fixes = err.quick_fixes();
            if !fixes.is_empty() {
                eprintln!();
                eprintln!("💡 Quick fixes:");
                for fix in fixes {
                    eprintln!("  • {fix}");
                }
            }
            std::process::exit(err.exit_code());
        }
    }
}

pub(crate) fn build_adapter(config: &Config, identity: ProviderIdentity) -> Arc<ProviderAdapter> {
    Arc::new(ProviderAdapter::new(
        reqwest::Client::new(),
        identity,
        RetryPolicy::from_settings(&config.retry),
    ))
}

pub(crate) fn lane_settings(
    config: &Config,
    system: Option<String>,
    knowledge: Vec<KnowledgeFile>,
) -> LaneSettings {
    LaneSettings {
        system_instruction: system.or_else(|| config.system_instruction.clone()),
        generation: config.generation.clone(),
        knowledge,
        knowledge_max_chars: config.retrieval.max_chars,
    }
}

/// Explicit model, then the provider's configured default, then the first
/// model the provider lists.
pub(crate) async fn pick_model(
    config: &Config,
    adapter: &ProviderAdapter,
    explicit: Option<String>,
) -> Result<ModelSelection, Box<dyn Error>> {
    if let Some(model) = explicit.filter(|model| !model.trim().is_empty()) {
        return Ok(ModelSelection::new(model));
    }
    let identity = adapter.identity();
    if let Some(model) = config.get_default_model(&identity.provider_id) {
        return Ok(ModelSelection::new(model.clone()));
    }

    let catalog = adapter.list_models().await?;
    let first = catalog.models.into_iter().next().ok_or_else(|| {
        format!(
            "{} lists no models; pass one with -m or run 'parley config set-model {} MODEL'",
            identity.display_name, identity.provider_id
        )
    })?;
    Ok(ModelSelection {
        id: first.id,
        name: first.display_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn say_collects_repeatable_files() {
        let args = Args::try_parse_from([
            "parley", "say", "-p", "gemini", "-k", "a.txt", "-k", "b.txt", "--attach", "cat.png",
            "What", "is", "this?",
        ])
        .unwrap();
        let Commands::Say {
            provider,
            knowledge,
            attach,
            prompt,
            ..
        } = args.command
        else {
            panic!("expected say");
        };
        assert_eq!(provider.as_deref(), Some("gemini"));
        assert_eq!(knowledge, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
        assert_eq!(attach, vec![PathBuf::from("cat.png")]);
        assert_eq!(prompt.join(" "), "What is this?");
    }

    #[test]
    fn battle_parses_lane_targets() {
        let args = Args::try_parse_from([
            "parley",
            "battle",
            "--left",
            "gemini:gemini-2.0-flash",
            "--right",
            "deepseek",
            "--turns",
            "4",
            "Tabs",
            "or",
            "spaces?",
        ])
        .unwrap();
        let Commands::Battle {
            left, right, turns, ..
        } = args.command
        else {
            panic!("expected battle");
        };
        assert_eq!(left.provider, "gemini");
        assert_eq!(left.model.as_deref(), Some("gemini-2.0-flash"));
        assert_eq!(right.provider, "deepseek");
        assert_eq!(right.model, None);
        assert_eq!(turns, Some(4));
    }

    #[test]
    fn config_set_joins_words() {
        let args =
            Args::try_parse_from(["parley", "config", "set", "system-instruction", "Be", "brief."])
                .unwrap();
        let Commands::Config {
            action: Some(ConfigAction::Set { key, value }),
        } = args.command
        else {
            panic!("expected config set");
        };
        assert_eq!(key, "system-instruction");
        assert_eq!(value.join(" "), "Be brief.");
    }
}
