//! Model listing functionality
//!
//! This module handles listing available models from the selected provider.

use std::error::Error;

use crate::api::models::ModelInfo;
use crate::cli::{build_adapter, resolve_identity_or_exit};
use crate::core::chat_stream::ChatBackend;
use crate::core::config::Config;

pub async fn list_models(provider: Option<String>) -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    let identity = resolve_identity_or_exit(&config, provider.as_deref());
    let provider_id = identity.provider_id.clone();
    let adapter = build_adapter(&config, identity);

    let catalog = adapter.list_models().await?;

    println!("🤖 Available Models for {}", catalog.platform_label);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();

    if let Some(balance) = &catalog.balance {
        println!("💰 Balance: {balance}");
        println!();
    }
    if let Some(default_model) = config.get_default_model(&provider_id) {
        println!("🎯 Default model for this provider: {default_model} (from config)");
        println!();
    }

    if catalog.models.is_empty() {
        println!("No models found for this provider.");
        return Ok(());
    }

    println!("Found {} models:", catalog.models.len());
    println!();
    for model in &catalog.models {
        println!("  • {}", model.id);
        if !model.display_name.is_empty() && model.display_name != model.id {
            println!("    Name: {}", model.display_name);
        }
        if let Some(tags) = capability_tags(model) {
            println!("    Supports: {tags}");
        }
        if let Some(window) = model.context_window {
            println!("    Context: {window} tokens");
        }
    }

    Ok(())
}

fn capability_tags(model: &ModelInfo) -> Option<String> {
    let caps = &model.capabilities;
    let tags: Vec<&str> = [
        (caps.image, "images"),
        (caps.video, "video"),
        (caps.audio, "audio"),
        (caps.thinking, "thinking"),
    ]
    .into_iter()
    .filter_map(|(enabled, tag)| enabled.then_some(tag))
    .collect();
    (!tags.is_empty()).then(|| tags.join(", "))
}
