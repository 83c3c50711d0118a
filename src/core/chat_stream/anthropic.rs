use tracing::debug;

use super::{
    encode_body, inline_images, GenerateRequest, PreparedRequest, StreamAccumulator, StreamError,
};
use crate::api::{
    AnthropicBlock, AnthropicContent, AnthropicDelta, AnthropicImageSource, AnthropicMessage,
    AnthropicStreamEvent, MessagesRequest,
};
use crate::core::message::{Attachment, AttachmentPayload, Role};
use crate::core::providers::{ProviderFamily, ProviderIdentity};
use crate::utils::url::construct_api_url;

/// The Messages API rejects temperatures above this.
const MAX_TEMPERATURE: f32 = 1.0;

pub(super) fn prepare(
    identity: &ProviderIdentity,
    request: &GenerateRequest,
) -> Result<PreparedRequest, StreamError> {
    if request.config.search {
        debug!(provider = %identity.provider_id, "search augmentation ignored for this family");
    }

    let mut messages: Vec<AnthropicMessage> = request
        .conversational_history()
        .map(|message| AnthropicMessage {
            role: wire_role(message.role).to_string(),
            content: content_for(&request.model_id, &message.content, &message.attachments),
        })
        .collect();
    messages.push(AnthropicMessage {
        role: "user".to_string(),
        content: content_for(&request.model_id, &request.turn_text, &request.attachments),
    });

    let body = MessagesRequest {
        model: request.model_id.clone(),
        messages,
        max_tokens: request.config.max_output_tokens,
        system: request.system_instruction().map(str::to_string),
        stream: true,
        temperature: request.config.temperature.min(MAX_TEMPERATURE),
    };
    encode_body(construct_api_url(&identity.base_url, "messages"), &body)
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Model => "assistant",
        Role::User | Role::System => "user",
    }
}

fn content_for(model_id: &str, text: &str, attachments: &[Attachment]) -> AnthropicContent {
    let images = inline_images(ProviderFamily::AnthropicCompatible, model_id, attachments);
    if images.is_empty() {
        return AnthropicContent::Text(text.to_string());
    }

    // Images lead the text block, as the Messages API recommends.
    let mut blocks: Vec<AnthropicBlock> = images
        .into_iter()
        .map(|image| AnthropicBlock::Image {
            source: match &image.payload {
                AttachmentPayload::Inline(data) => AnthropicImageSource::Base64 {
                    media_type: image.mime_type.clone(),
                    data: data.clone(),
                },
                AttachmentPayload::Uri(uri) => AnthropicImageSource::Url { url: uri.clone() },
            },
        })
        .collect();
    if !text.is_empty() {
        blocks.push(AnthropicBlock::Text {
            text: text.to_string(),
        });
    }
    AnthropicContent::Blocks(blocks)
}

pub(super) fn apply_frame(
    accumulator: &mut StreamAccumulator,
    payload: &str,
) -> Result<bool, StreamError> {
    let event: AnthropicStreamEvent = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(err) => {
            debug!("skipping malformed frame: {err}");
            return Ok(false);
        }
    };

    match event {
        AnthropicStreamEvent::ContentBlockDelta { delta } => match delta {
            AnthropicDelta::TextDelta { text } => {
                accumulator.push_text(&text);
                Ok(!text.is_empty())
            }
            AnthropicDelta::ThinkingDelta { thinking } => {
                accumulator.push_reasoning(&thinking);
                Ok(!thinking.is_empty())
            }
            AnthropicDelta::Other => Ok(false),
        },
        AnthropicStreamEvent::Error { error } => {
            let message = match error.kind {
                Some(kind) if !error.message.contains(&kind) => {
                    format!("{kind}: {}", error.message)
                }
                _ => error.message,
            };
            Err(StreamError::Api(message))
        }
        AnthropicStreamEvent::Other => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chat_stream::{THINK_CLOSE, THINK_OPEN};

    #[test]
    fn text_and_thinking_deltas_accumulate() {
        let mut accumulator = StreamAccumulator::default();
        let frames = [
            r#"{"type":"message_start","message":{"id":"msg_1","role":"assistant"}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Weighing it."}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"abc"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Yes"}}"#,
            r#"{"type":"message_stop"}"#,
        ];
        let emitted: Vec<bool> = frames
            .iter()
            .map(|frame| apply_frame(&mut accumulator, frame).unwrap())
            .collect();

        assert_eq!(emitted, vec![false, false, true, false, true, false]);
        assert_eq!(
            accumulator.snapshot().text,
            format!("{THINK_OPEN}Weighing it.{THINK_CLOSE}Yes")
        );
    }

    #[test]
    fn error_event_ends_the_stream() {
        let mut accumulator = StreamAccumulator::default();
        let err = apply_frame(
            &mut accumulator,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )
        .unwrap_err();
        assert_eq!(err, StreamError::Api("overloaded_error: Overloaded".to_string()));
        assert!(err.to_string().contains("overloaded"));
    }
}
