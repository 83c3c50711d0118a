use std::error::Error;
use std::fmt;

use crate::core::builtin_providers::load_builtin_providers;
use crate::core::config::Config;

const QUICK_FIXES: &[&str] = &[
    "parley providers                # Check provider status",
    "export GEMINI_API_KEY=...       # Credentials are read from <PROVIDER>_API_KEY",
    "parley config set default-provider deepseek",
];

/// Wire protocol spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderFamily {
    /// Google Gemini `generateContent` protocol.
    Native,
    OpenAiCompatible,
    AnthropicCompatible,
}

impl ProviderFamily {
    pub fn from_mode(mode: Option<&str>) -> Self {
        match mode.map(str::to_ascii_lowercase).as_deref() {
            Some("gemini") | Some("google") | Some("native") => ProviderFamily::Native,
            Some("anthropic") => ProviderFamily::AnthropicCompatible,
            _ => ProviderFamily::OpenAiCompatible,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProviderFamily::Native => "Gemini",
            ProviderFamily::OpenAiCompatible => "OpenAI-compatible",
            ProviderFamily::AnthropicCompatible => "Anthropic-compatible",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderMetadata {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    pub family: ProviderFamily,
}

/// Everything an adapter call needs to reach one backend. Built once per
/// session and passed by reference; never mutated in place.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderIdentity {
    pub provider_id: String,
    pub display_name: String,
    pub family: ProviderFamily,
    pub api_key: String,
    pub base_url: String,
}

impl ProviderIdentity {
    pub fn new(metadata: ProviderMetadata, api_key: impl Into<String>) -> Self {
        Self {
            provider_id: metadata.id.to_lowercase(),
            display_name: metadata.display_name,
            family: metadata.family,
            api_key: api_key.into(),
            base_url: metadata.base_url,
        }
    }
}

impl fmt::Debug for ProviderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderIdentity")
            .field("provider_id", &self.provider_id)
            .field("family", &self.family)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
pub struct ProviderResolutionError {
    message: String,
    quick_fixes: &'static [&'static str],
    exit_code: i32,
}

impl ProviderResolutionError {
    pub fn missing_authentication() -> Self {
        Self::new(
            "❌ No provider credentials found\n\nSet an API key for one of the providers listed by 'parley providers', for example:\n   export GEMINI_API_KEY=\"your-api-key-here\"",
            QUICK_FIXES,
            2,
        )
    }

    pub fn provider_not_configured(provider: &str) -> Self {
        Self::new(
            format!(
                "No API key found for provider '{provider}'. Set {} to use it.",
                api_key_env_var(provider)
            ),
            QUICK_FIXES,
            2,
        )
    }

    pub fn unknown_provider(provider: &str) -> Self {
        Self::new(
            format!("Unknown provider '{provider}'. Run 'parley providers' to list providers."),
            QUICK_FIXES,
            1,
        )
    }

    fn new(
        message: impl Into<String>,
        quick_fixes: &'static [&'static str],
        exit_code: i32,
    ) -> Self {
        Self {
            message: message.into(),
            quick_fixes,
            exit_code,
        }
    }

    pub fn quick_fixes(&self) -> &'static [&'static str] {
        self.quick_fixes
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

impl fmt::Display for ProviderResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ProviderResolutionError {}

/// Where API keys and base-address overrides come from.
pub trait CredentialSource {
    fn api_key(&self, provider_id: &str) -> Option<String>;
    fn base_url_override(&self, provider_id: &str) -> Option<String>;
}

/// Reads `<PROVIDER>_API_KEY` and `<PROVIDER>_BASE_URL` from the environment.
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn api_key(&self, provider_id: &str) -> Option<String> {
        std::env::var(api_key_env_var(provider_id))
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    fn base_url_override(&self, provider_id: &str) -> Option<String> {
        std::env::var(env_prefix(provider_id) + "_BASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

fn env_prefix(provider_id: &str) -> String {
    provider_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub fn api_key_env_var(provider_id: &str) -> String {
    env_prefix(provider_id) + "_API_KEY"
}

/// Built-in providers followed by custom ones; a custom provider shadows a
/// built-in with the same id.
pub fn known_providers(config: &Config) -> Vec<ProviderMetadata> {
    let mut providers: Vec<ProviderMetadata> = load_builtin_providers()
        .into_iter()
        .filter(|builtin| config.get_custom_provider(&builtin.id).is_none())
        .map(|builtin| ProviderMetadata {
            family: builtin.family(),
            id: builtin.id,
            display_name: builtin.display_name,
            base_url: builtin.base_url,
        })
        .collect();

    providers.extend(config.custom_providers.iter().map(|custom| ProviderMetadata {
        id: custom.id.clone(),
        display_name: custom.display_name.clone(),
        base_url: custom.base_url.clone(),
        family: ProviderFamily::from_mode(custom.mode.as_deref()),
    }));

    providers
}

pub fn find_provider(config: &Config, provider: &str) -> Option<ProviderMetadata> {
    known_providers(config)
        .into_iter()
        .find(|p| p.id.eq_ignore_ascii_case(provider))
}

pub fn resolve_identity<S: CredentialSource>(
    source: &S,
    config: &Config,
    provider_override: Option<&str>,
) -> Result<ProviderIdentity, ProviderResolutionError> {
    let requested = provider_override
        .filter(|value| !value.is_empty())
        .or(config.default_provider.as_deref());

    if let Some(provider_name) = requested {
        let metadata = find_provider(config, provider_name)
            .ok_or_else(|| ProviderResolutionError::unknown_provider(provider_name))?;
        let api_key = source
            .api_key(&metadata.id)
            .ok_or_else(|| ProviderResolutionError::provider_not_configured(&metadata.id))?;
        return Ok(build_identity(source, metadata, api_key));
    }

    known_providers(config)
        .into_iter()
        .find_map(|metadata| {
            source
                .api_key(&metadata.id)
                .map(|api_key| build_identity(source, metadata, api_key))
        })
        .ok_or_else(ProviderResolutionError::missing_authentication)
}

fn build_identity<S: CredentialSource>(
    source: &S,
    mut metadata: ProviderMetadata,
    api_key: String,
) -> ProviderIdentity {
    if let Some(base_url) = source.base_url_override(&metadata.id) {
        metadata.base_url = base_url;
    }
    ProviderIdentity::new(metadata, api_key)
}
