use serde::{Deserialize, Serialize};

/// Column mapping and style prefix for a bulk run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GenerationJobConfig {
    pub prompt_column: Option<String>,
    pub filename_column: Option<String>,
    #[serde(default)]
    pub baseline_prompt: String,
}

impl GenerationJobConfig {
    pub fn is_ready(&self) -> bool {
        self.prompt_column.is_some() && self.filename_column.is_some()
    }
}

pub fn compose_prompt(baseline: &str, row_prompt: &str) -> String {
    let baseline = baseline.trim();
    if baseline.is_empty() {
        return row_prompt.to_string();
    }
    format!("{baseline}. {row_prompt}")
}

/// Maps a raw row value to an archive-safe base name.
///
/// Anything outside `[A-Za-z0-9_- ]` becomes `_`. When nothing usable is
/// left the name falls back to `image-<index>`.
pub fn sanitize_file_name(raw: &str, index: usize) -> String {
    let replaced: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | ' ') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = replaced.trim();
    if trimmed.is_empty() {
        return format!("image-{index}");
    }
    trimmed.to_string()
}
