use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_IMAGE_MIME: &str = "image/png";

/// Image bytes as handed back by the model: base64 text plus media type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: String,
}

impl ImagePayload {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::new(mime_type, BASE64.encode(bytes))
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.data.trim().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: String,
    pub payload: ImagePayload,
    /// Prompt exactly as sent, baseline included.
    pub prompt: String,
    pub file_name: String,
    pub original_name: String,
    pub created_at: String,
}

impl GeneratedImage {
    pub fn new(
        payload: ImagePayload,
        prompt: impl Into<String>,
        file_name: impl Into<String>,
        original_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            prompt: prompt.into(),
            file_name: file_name.into(),
            original_name: original_name.into(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}
