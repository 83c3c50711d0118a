use serde_json::Value;
use tracing::debug;

use crate::api::balance::{probe_balance, Balance};
use crate::api::{GeminiModelInfo, GeminiModelList};
use crate::core::chat_stream::{response_error, StreamError};
use crate::core::providers::{ProviderFamily, ProviderIdentity};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::utils::auth::add_auth_headers;
use crate::utils::url::{construct_api_url, native_api_url, with_query};

/// Name prefixes of Gemini-family models that can serve chat turns.
const NATIVE_MODEL_PREFIXES: &[&str] = &["gemini-", "gemma-", "learnlm-"];

const MAX_NATIVE_PAGES: usize = 10;

const VISION_HINTS: &[&str] = &[
    "vision", "gpt-4o", "gpt-4.1", "gpt-4-turbo", "gpt-5", "o1", "o3", "o4", "claude-3",
    "claude-sonnet", "claude-opus", "claude-haiku", "gemini", "-vl", "vl-", "pixtral", "llava",
    "qwen2.5-omni", "glm-4v", "kimi-latest", "grok-2-vision", "grok-4",
];

const THINKING_HINTS: &[&str] = &[
    "thinking", "reasoner", "reasoning", "-r1", "qwq", "o1", "o3", "o4-mini", "gemini-2.5",
    "gemini-3",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub image: bool,
    pub video: bool,
    pub audio: bool,
    pub thinking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub capabilities: Capabilities,
    pub context_window: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub models: Vec<ModelInfo>,
    pub platform_label: String,
    pub balance: Option<Balance>,
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Capability flags inferred from a model identifier.
pub fn capabilities_for(family: ProviderFamily, model_id: &str) -> Capabilities {
    let id = model_id.to_ascii_lowercase();
    let thinking = contains_any(&id, THINKING_HINTS);
    match family {
        ProviderFamily::Native => {
            let gemini = id.contains("gemini");
            let multimodal = gemini && !id.contains("embedding") && !id.contains("imagen");
            Capabilities {
                image: multimodal || id.contains("gemma-3"),
                video: multimodal,
                audio: multimodal,
                thinking,
            }
        }
        ProviderFamily::OpenAiCompatible | ProviderFamily::AnthropicCompatible => {
            let image = contains_any(&id, VISION_HINTS)
                && !id.contains("deepseek-r1")
                && !id.contains("embedding");
            Capabilities {
                image,
                video: id.contains("gemini") || id.contains("omni"),
                audio: id.contains("audio") || id.contains("omni"),
                thinking,
            }
        }
    }
}

pub fn supports_vision(family: ProviderFamily, model_id: &str) -> bool {
    capabilities_for(family, model_id).image
}

/// Convert a Gemini model listing, keeping chat-capable models only.
pub fn native_models(list: GeminiModelList) -> Vec<ModelInfo> {
    let mut models: Vec<ModelInfo> = list
        .models
        .into_iter()
        .filter_map(native_model_info)
        .collect();
    sort_native_models(&mut models);
    models
}

fn native_model_info(model: GeminiModelInfo) -> Option<ModelInfo> {
    let id = model
        .name
        .strip_prefix("models/")
        .unwrap_or(&model.name)
        .to_string();
    if !NATIVE_MODEL_PREFIXES
        .iter()
        .any(|prefix| id.starts_with(prefix))
    {
        return None;
    }
    if !model.supported_generation_methods.is_empty()
        && !model
            .supported_generation_methods
            .iter()
            .any(|method| method == "generateContent" || method == "streamGenerateContent")
    {
        return None;
    }

    let mut capabilities = capabilities_for(ProviderFamily::Native, &id);
    if model
        .display_name
        .as_deref()
        .is_some_and(|name| name.to_ascii_lowercase().contains("thinking"))
    {
        capabilities.thinking = true;
    }

    Some(ModelInfo {
        display_name: model.display_name.unwrap_or_else(|| id.clone()),
        id,
        capabilities,
        context_window: model.input_token_limit,
    })
}

/// "pro" variants first; otherwise keep the server's order.
pub fn sort_native_models(models: &mut [ModelInfo]) {
    models.sort_by_key(|model| !model.id.contains("pro"));
}

/// Convert a `/models` listing from an OpenAI- or Anthropic-compatible
/// server. Accepts a bare array or a `data` / `models` envelope.
pub fn compatible_models(family: ProviderFamily, body: &Value) -> Vec<ModelInfo> {
    let entries = body
        .as_array()
        .or_else(|| body.get("data").and_then(Value::as_array))
        .or_else(|| body.get("models").and_then(Value::as_array));

    let Some(entries) = entries else {
        debug!("model listing has no recognizable array");
        return Vec::new();
    };

    let mut models: Vec<ModelInfo> = entries
        .iter()
        .filter_map(|entry| {
            let id = entry
                .get("id")
                .or_else(|| entry.get("name"))
                .and_then(Value::as_str)
                .or_else(|| entry.as_str())?
                .to_string();
            let display_name = entry
                .get("display_name")
                .or_else(|| entry.get("name"))
                .and_then(Value::as_str)
                .unwrap_or(&id)
                .to_string();
            let context_window = ["context_length", "context_window", "max_context_length"]
                .iter()
                .find_map(|key| entry.get(*key).and_then(Value::as_u64));
            Some(ModelInfo {
                capabilities: capabilities_for(family, &id),
                display_name,
                id,
                context_window,
            })
        })
        .collect();

    models.sort_by(|a, b| a.id.cmp(&b.id));
    models
}

pub async fn fetch_catalog(
    client: &reqwest::Client,
    identity: &ProviderIdentity,
    policy: &RetryPolicy,
) -> Result<ModelCatalog, StreamError> {
    let models = match identity.family {
        ProviderFamily::Native => {
            let list = fetch_native_list(client, identity, policy).await?;
            native_models(list)
        }
        family => {
            let url = construct_api_url(&identity.base_url, "models");
            let body: Value = with_retry(policy, || get_json(client, identity, &url)).await?;
            compatible_models(family, &body)
        }
    };

    let balance = match identity.family {
        ProviderFamily::Native => None,
        _ => probe_balance(client, identity, &policy.for_probe()).await,
    };

    Ok(ModelCatalog {
        models,
        platform_label: format!("{} ({})", identity.display_name, identity.family.label()),
        balance,
    })
}

/// Follow `nextPageToken` until the listing is exhausted or
/// [`MAX_NATIVE_PAGES`] pages have been read.
async fn fetch_native_list(
    client: &reqwest::Client,
    identity: &ProviderIdentity,
    policy: &RetryPolicy,
) -> Result<GeminiModelList, StreamError> {
    let base = native_api_url(&identity.base_url, "models");
    let mut all = GeminiModelList::default();
    let mut page_token: Option<String> = None;

    for _ in 0..MAX_NATIVE_PAGES {
        let mut params = vec![("key", identity.api_key.as_str()), ("pageSize", "1000")];
        if let Some(token) = page_token.as_deref() {
            params.push(("pageToken", token));
        }
        let url = with_query(&base, &params).map_err(StreamError::Request)?;
        let page: GeminiModelList =
            with_retry(policy, || get_json(client, identity, &url)).await?;
        all.models.extend(page.models);

        match page.next_page_token.filter(|token| !token.is_empty()) {
            Some(token) => page_token = Some(token),
            None => return Ok(all),
        }
    }
    debug!(provider = %identity.provider_id, "model listing truncated after {MAX_NATIVE_PAGES} pages");
    Ok(all)
}

pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    identity: &ProviderIdentity,
    url: &str,
) -> Result<T, StreamError> {
    let request = add_auth_headers(client.get(url), identity.family, &identity.api_key);
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(response_error(response).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|err| StreamError::Decode(err.to_string()))
}
