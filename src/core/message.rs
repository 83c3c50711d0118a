use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Model,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::System => "system",
        }
    }

    pub fn is_user(self) -> bool {
        self == Role::User
    }

    pub fn is_model(self) -> bool {
        self == Role::Model
    }

    /// The role a filler turn must take to sit between two turns of `self`.
    pub fn opposite(self) -> Role {
        match self {
            Role::User => Role::Model,
            Role::Model | Role::System => Role::User,
        }
    }
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "model" | "assistant" => Ok(Role::Model),
            "system" => Ok(Role::System),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Text,
    Image,
    Video,
    Audio,
}

impl AttachmentKind {
    /// Classify a MIME type; anything unrecognised is treated as text.
    pub fn from_mime(mime_type: &str) -> Self {
        let lower = mime_type.to_ascii_lowercase();
        if lower.starts_with("image/") {
            AttachmentKind::Image
        } else if lower.starts_with("video/") {
            AttachmentKind::Video
        } else if lower.starts_with("audio/") {
            AttachmentKind::Audio
        } else {
            AttachmentKind::Text
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentPayload {
    /// Base64-encoded bytes carried inline with the request.
    Inline(String),
    /// A reference the backend resolves itself (e.g. an uploaded file URI).
    Uri(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub mime_type: String,
    pub payload: AttachmentPayload,
}

impl Attachment {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        let mime_type = mime_type.into();
        Self {
            kind: AttachmentKind::from_mime(&mime_type),
            payload: AttachmentPayload::Inline(BASE64_STANDARD.encode(bytes)),
            mime_type,
        }
    }

    pub fn from_uri(mime_type: impl Into<String>, uri: impl Into<String>) -> Self {
        let mime_type = mime_type.into();
        Self {
            kind: AttachmentKind::from_mime(&mime_type),
            payload: AttachmentPayload::Uri(uri.into()),
            mime_type,
        }
    }

    /// `data:` URI form used by OpenAI-style image parts.
    pub fn to_data_uri(&self) -> String {
        match &self.payload {
            AttachmentPayload::Inline(data) => format!("data:{};base64,{}", self.mime_type, data),
            AttachmentPayload::Uri(uri) => uri.clone(),
        }
    }
}

/// Best-effort MIME type for a file name, keyed off its extension.
pub fn guess_mime_type(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "pdf" => "application/pdf",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        _ => "text/plain",
    }
}

static NEXT_MESSAGE_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_message_id(created_at: DateTime<Utc>) -> String {
    let seq = NEXT_MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{seq}", created_at.timestamp_millis())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub bookmarked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding: Option<Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let created_at = Utc::now();
        Self {
            id: next_message_id(created_at),
            role,
            content: content.into(),
            attachments: Vec::new(),
            created_at,
            is_error: false,
            hidden: false,
            bookmarked: false,
            model_id: None,
            model_name: None,
            grounding: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self::new(Role::Model, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Empty model turn that streaming output is written into.
    pub fn placeholder(model_id: &str, model_name: &str) -> Self {
        let mut message = Self::model(String::new());
        message.model_id = Some(model_id.to_string());
        message.model_name = Some(model_name.to_string());
        message
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn is_user(&self) -> bool {
        self.role.is_user()
    }

    pub fn is_model(&self) -> bool {
        self.role.is_model()
    }

    /// Whether this turn should be replayed to a backend as history.
    pub fn is_conversational(&self) -> bool {
        !self.is_error
            && self.role != Role::System
            && (!self.content.trim().is_empty() || !self.attachments.is_empty())
    }
}
