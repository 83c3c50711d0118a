//! Built-in provider configuration
//!
//! This module handles loading and managing built-in provider configurations
//! from the builtin_providers.toml file embedded at build time.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::core::providers::ProviderFamily;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinProvider {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    pub mode: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BuiltinProvidersConfig {
    providers: Vec<BuiltinProvider>,
}

impl BuiltinProvider {
    /// Get the wire protocol mode for this provider
    pub fn mode(&self) -> &str {
        self.mode.as_deref().unwrap_or("openai")
    }

    pub fn family(&self) -> ProviderFamily {
        ProviderFamily::from_mode(self.mode.as_deref())
    }
}

/// Load built-in providers from the embedded configuration
pub fn load_builtin_providers() -> Vec<BuiltinProvider> {
    const CONFIG_CONTENT: &str = include_str!("../builtin_providers.toml");

    match toml::from_str::<BuiltinProvidersConfig>(CONFIG_CONTENT) {
        Ok(config) => config.providers,
        Err(err) => {
            error!("failed to parse builtin_providers.toml: {err}");
            Vec::new()
        }
    }
}

/// Find a built-in provider by ID (case-insensitive)
pub fn find_builtin_provider(id: &str) -> Option<BuiltinProvider> {
    load_builtin_providers()
        .into_iter()
        .find(|p| p.id.eq_ignore_ascii_case(id))
}
