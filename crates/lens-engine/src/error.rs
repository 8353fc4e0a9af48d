use thiserror::Error;

/// Failure of a single call to the image model.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("no image generated{}", model_text_suffix(.model_text))]
    NoImage { model_text: Option<String> },

    #[error("{provider} request failed ({status}): {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} request failed: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned an unreadable response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("image encoding failed: {0}")]
    Encoding(String),
}

#[derive(Error, Debug)]
pub enum LensError {
    #[error("could not read spreadsheet: {0}")]
    Ingestion(String),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("archive export failed: {0}")]
    Export(String),

    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn model_text_suffix(text: &Option<String>) -> String {
    match text.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => format!(" (model replied: {text})"),
        _ => String::new(),
    }
}
