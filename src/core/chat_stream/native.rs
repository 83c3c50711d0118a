//! Gemini `streamGenerateContent` requests and frames.

use serde_json::json;
use tracing::debug;

use super::{encode_body, GenerateRequest, PreparedRequest, StreamAccumulator, StreamError};
use crate::api::{
    GeminiBlob, GeminiContent, GeminiFileData, GeminiGenerationConfig, GeminiPart,
    GenerateContentRequest, GenerateContentResponse,
};
use crate::core::message::{Attachment, AttachmentPayload, Message, Role};
use crate::core::providers::ProviderIdentity;
use crate::utils::url::{native_api_url, with_query};

/// Inserted between two consecutive model turns.
pub const USER_FILLER: &str = "Continue.";
/// Inserted between two consecutive user turns, and after a trailing one.
pub const MODEL_FILLER: &str = "Understood.";

pub(super) fn prepare(
    identity: &ProviderIdentity,
    request: &GenerateRequest,
) -> Result<PreparedRequest, StreamError> {
    let mut contents = normalize_history(request.conversational_history());
    contents.push(content_for(
        Role::User,
        &request.turn_text,
        &request.attachments,
    ));

    let tools = if request.config.search {
        vec![json!({ "googleSearch": {} })]
    } else {
        Vec::new()
    };

    let body = GenerateContentRequest {
        contents,
        system_instruction: request.system_instruction().map(|text| GeminiContent {
            role: None,
            parts: vec![GeminiPart::Text {
                text: text.to_string(),
            }],
        }),
        generation_config: GeminiGenerationConfig {
            temperature: request.config.temperature,
            top_p: request.config.top_p,
            max_output_tokens: request.config.max_output_tokens,
        },
        tools,
    };

    let model = request
        .model_id
        .strip_prefix("models/")
        .unwrap_or(&request.model_id);
    let url = with_query(
        &native_api_url(
            &identity.base_url,
            &format!("models/{model}:streamGenerateContent"),
        ),
        &[("alt", "sse"), ("key", identity.api_key.as_str())],
    )
    .map_err(StreamError::Request)?;

    encode_body(url, &body)
}

/// Strictly alternating history. A trailing user turn gets a model filler so
/// the caller's new user turn can follow it.
pub(crate) fn normalize_history<'a>(
    history: impl IntoIterator<Item = &'a Message>,
) -> Vec<GeminiContent> {
    let mut contents: Vec<GeminiContent> = Vec::new();
    let mut last_role: Option<Role> = None;

    for message in history {
        if message.role == Role::System {
            continue;
        }
        if last_role == Some(message.role) {
            let filler_role = message.role.opposite();
            contents.push(filler(filler_role));
        }
        contents.push(content_for(
            message.role,
            &message.content,
            &message.attachments,
        ));
        last_role = Some(message.role);
    }

    if last_role == Some(Role::User) {
        contents.push(filler(Role::Model));
    }
    contents
}

fn filler(role: Role) -> GeminiContent {
    let text = if role == Role::User {
        USER_FILLER
    } else {
        MODEL_FILLER
    };
    GeminiContent {
        role: Some(wire_role(role).to_string()),
        parts: vec![GeminiPart::Text {
            text: text.to_string(),
        }],
    }
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Model => "model",
        Role::User | Role::System => "user",
    }
}

fn content_for(role: Role, text: &str, attachments: &[Attachment]) -> GeminiContent {
    let mut parts: Vec<GeminiPart> = attachments.iter().map(attachment_part).collect();
    if !text.is_empty() || parts.is_empty() {
        parts.insert(
            0,
            GeminiPart::Text {
                text: text.to_string(),
            },
        );
    }
    GeminiContent {
        role: Some(wire_role(role).to_string()),
        parts,
    }
}

fn attachment_part(attachment: &Attachment) -> GeminiPart {
    match &attachment.payload {
        AttachmentPayload::Inline(data) => GeminiPart::InlineData {
            inline_data: GeminiBlob {
                mime_type: attachment.mime_type.clone(),
                data: data.clone(),
            },
        },
        AttachmentPayload::Uri(uri) => GeminiPart::FileData {
            file_data: GeminiFileData {
                mime_type: attachment.mime_type.clone(),
                file_uri: uri.clone(),
            },
        },
    }
}

/// Every decodable payload yields an increment, even one with no text, so
/// metadata-only frames still reach the caller.
pub(super) fn apply_frame(
    accumulator: &mut StreamAccumulator,
    payload: &str,
) -> Result<bool, StreamError> {
    let frame: GenerateContentResponse = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(err) => {
            debug!("skipping malformed frame: {err}");
            return Ok(false);
        }
    };

    if let Some(error) = frame.error {
        let message =
            super::extract_error_summary(&error).unwrap_or_else(|| error.to_string());
        return Err(StreamError::Api(message));
    }

    if let Some(candidate) = frame.candidates.into_iter().next() {
        for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
            let Some(text) = part.text else {
                continue;
            };
            if part.thought {
                accumulator.push_reasoning(&text);
            } else {
                accumulator.push_text(&text);
            }
        }
        if let Some(metadata) = candidate.grounding_metadata {
            accumulator.set_metadata(metadata);
        }
    }
    Ok(true)
}
