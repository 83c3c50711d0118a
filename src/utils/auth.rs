//! Authentication utilities for API requests
//!
//! Each protocol family authenticates differently:
//! - Gemini: the key travels as the `key` query parameter, no header
//! - Anthropic-compatible: `x-api-key` plus `anthropic-version`
//! - Everything else: standard `Authorization: Bearer`

use crate::core::providers::ProviderFamily;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Add family-specific authentication headers to an HTTP request
pub fn add_auth_headers(
    request: reqwest::RequestBuilder,
    family: ProviderFamily,
    api_key: &str,
) -> reqwest::RequestBuilder {
    match family {
        ProviderFamily::Native => request,
        ProviderFamily::AnthropicCompatible => request
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION),
        ProviderFamily::OpenAiCompatible => {
            request.header("Authorization", format!("Bearer {api_key}"))
        }
    }
}
