use tracing::debug;

use super::{
    encode_body, extract_error_summary, inline_images, GenerateRequest, PreparedRequest,
    StreamAccumulator, StreamError,
};
use crate::api::{ChatContent, ChatContentPart, ChatImageUrl, ChatMessage, ChatRequest, ChatResponse};
use crate::core::message::{Attachment, Role};
use crate::core::providers::{ProviderFamily, ProviderIdentity};
use crate::utils::url::construct_api_url;

pub(super) fn prepare(
    identity: &ProviderIdentity,
    request: &GenerateRequest,
) -> Result<PreparedRequest, StreamError> {
    if request.config.search {
        debug!(provider = %identity.provider_id, "search augmentation ignored for this family");
    }

    let mut messages = Vec::new();
    if let Some(system) = request.system_instruction() {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: ChatContent::Text(system.to_string()),
        });
    }
    for message in request.conversational_history() {
        messages.push(ChatMessage {
            role: wire_role(message.role).to_string(),
            content: content_for(&request.model_id, &message.content, &message.attachments),
        });
    }
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: content_for(&request.model_id, &request.turn_text, &request.attachments),
    });

    let body = ChatRequest {
        model: request.model_id.clone(),
        messages,
        stream: true,
        temperature: request.config.temperature,
        top_p: request.config.top_p,
        max_tokens: request.config.max_output_tokens,
    };
    encode_body(construct_api_url(&identity.base_url, "chat/completions"), &body)
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Model => "assistant",
        Role::System => "system",
        Role::User => "user",
    }
}

fn content_for(model_id: &str, text: &str, attachments: &[Attachment]) -> ChatContent {
    let images = inline_images(ProviderFamily::OpenAiCompatible, model_id, attachments);
    if images.is_empty() {
        return ChatContent::Text(text.to_string());
    }

    let mut parts = Vec::with_capacity(images.len() + 1);
    if !text.is_empty() {
        parts.push(ChatContentPart::Text {
            text: text.to_string(),
        });
    }
    parts.extend(images.into_iter().map(|image| ChatContentPart::ImageUrl {
        image_url: ChatImageUrl {
            url: image.to_data_uri(),
        },
    }));
    ChatContent::Parts(parts)
}

/// Reasoning deltas (`reasoning_content` or `reasoning`) are wrapped in a
/// think block ahead of the answer text.
pub(super) fn apply_frame(
    accumulator: &mut StreamAccumulator,
    payload: &str,
) -> Result<bool, StreamError> {
    let frame: ChatResponse = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(err) => {
            debug!("skipping malformed frame: {err}");
            return Ok(false);
        }
    };

    if let Some(error) = frame.error {
        let wrapped = serde_json::json!({ "error": error.clone() });
        let message = extract_error_summary(&wrapped).unwrap_or_else(|| error.to_string());
        return Err(StreamError::Api(message));
    }

    let before = accumulator.len();
    if let Some(choice) = frame.choices.first() {
        let delta = &choice.delta;
        if let Some(reasoning) = delta.reasoning_content.as_deref().or(delta.reasoning.as_deref()) {
            accumulator.push_reasoning(reasoning);
        }
        if let Some(content) = delta.content.as_deref() {
            accumulator.push_text(content);
        }
    }
    Ok(accumulator.len() != before)
}
