use std::io::Cursor;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use lens_contracts::runs::results::{ImagePayload, DEFAULT_IMAGE_MIME};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::LensConfig;
use crate::error::{GenerationError, LensError};

const GEMINI_PROVIDER: &str = "Gemini";
const DRYRUN_IMAGE_SIZE: u32 = 64;

/// The two calls the app makes against the hosted model.
///
/// Every call is an independent request: no retry, no cache, and errors are
/// returned to the caller untouched.
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn edit_image(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<ImagePayload, GenerationError>;
    fn generate_image(&self, prompt: &str) -> Result<ImagePayload, GenerationError>;
}

pub fn generator_for(config: &LensConfig) -> Result<Box<dyn ImageGenerator>, LensError> {
    if config.is_dryrun() {
        return Ok(Box::new(DryrunGenerator));
    }
    Ok(Box::new(GeminiClient::from_config(config)?))
}

pub struct GeminiClient {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, LensError> {
        // A hung request blocks until the user gives up; there is no timeout.
        let http = HttpClient::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| LensError::Config(format!("http client setup failed: {err}")))?;
        Ok(Self::with_http_client(api_base, api_key, model, http))
    }

    pub fn with_http_client(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        http: HttpClient,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            http,
        }
    }

    pub fn from_config(config: &LensConfig) -> Result<Self, LensError> {
        let Some(api_key) = config.api_key.clone() else {
            return Err(LensError::Config(
                "GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string(),
            ));
        };
        Self::new(&config.api_base, api_key, &config.image_model)
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn request_body(parts: Vec<Value>) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
            },
        })
    }

    fn send(&self, body: &Value) -> Result<ImagePayload, GenerationError> {
        let endpoint = self.endpoint();
        debug!(endpoint = %endpoint, model = %self.model, "sending generateContent request");
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .map_err(|source| GenerationError::Transport {
                provider: GEMINI_PROVIDER.to_string(),
                source,
            })?;
        let payload = response_json_or_error(response)?;
        extract_first_image(&payload).ok_or_else(|| GenerationError::NoImage {
            model_text: first_candidate_text(&payload),
        })
    }
}

impl ImageGenerator for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn edit_image(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<ImagePayload, GenerationError> {
        let parts = vec![
            json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": BASE64.encode(image),
                }
            }),
            json!({ "text": prompt }),
        ];
        self.send(&Self::request_body(parts))
    }

    fn generate_image(&self, prompt: &str) -> Result<ImagePayload, GenerationError> {
        self.send(&Self::request_body(vec![json!({ "text": prompt })]))
    }
}

/// Picks the first inline image from the first candidate.
///
/// Later candidates are ignored. A part without a declared media type is
/// taken as PNG.
pub fn extract_first_image(response: &Value) -> Option<ImagePayload> {
    first_candidate_parts(response)?.iter().find_map(|part| {
        let inline = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)?;
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .filter(|data| !data.is_empty())?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|mime| !mime.is_empty())
            .unwrap_or(DEFAULT_IMAGE_MIME);
        Some(ImagePayload::new(mime_type, data))
    })
}

fn first_candidate_parts(response: &Value) -> Option<&Vec<Value>> {
    response
        .get("candidates")
        .and_then(Value::as_array)?
        .first()?
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
}

fn first_candidate_text(response: &Value) -> Option<String> {
    let text = first_candidate_parts(response)?
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<&str>>()
        .join(" ");
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(truncate_text(text, 240))
    }
}

fn response_json_or_error(response: HttpResponse) -> Result<Value, GenerationError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|source| GenerationError::Transport {
            provider: GEMINI_PROVIDER.to_string(),
            source,
        })?;
    if !status.is_success() {
        return Err(GenerationError::Status {
            provider: GEMINI_PROVIDER.to_string(),
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|err| GenerationError::InvalidResponse {
        provider: GEMINI_PROVIDER.to_string(),
        reason: err.to_string(),
    })
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Offline generator: a flat PNG whose colour is derived from the prompt
/// (and the source image when editing).
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunGenerator;

impl DryrunGenerator {
    fn render(seed_parts: &[&[u8]]) -> Result<ImagePayload, GenerationError> {
        let mut hasher = Sha256::new();
        for part in seed_parts {
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut canvas = RgbImage::new(DRYRUN_IMAGE_SIZE, DRYRUN_IMAGE_SIZE);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([digest[0], digest[1], digest[2]]);
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| GenerationError::Encoding(err.to_string()))?;
        Ok(ImagePayload::from_bytes(DEFAULT_IMAGE_MIME, &bytes))
    }
}

impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn edit_image(
        &self,
        image: &[u8],
        _mime_type: &str,
        prompt: &str,
    ) -> Result<ImagePayload, GenerationError> {
        Self::render(&[image, prompt.as_bytes()])
    }

    fn generate_image(&self, prompt: &str) -> Result<ImagePayload, GenerationError> {
        Self::render(&[prompt.as_bytes()])
    }
}
