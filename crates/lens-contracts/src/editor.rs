use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::runs::results::ImagePayload;

pub const DEFAULT_DOWNLOAD_NAME: &str = "edited-gemini-lens.png";

pub fn is_image_mime(mime_type: &str) -> bool {
    mime_type.trim().to_ascii_lowercase().starts_with("image/")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceImage {
    pub name: String,
    pub payload: ImagePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditTurn {
    pub prompt: String,
    pub result: ImagePayload,
    pub created_at: String,
}

/// A prompt ready to send: the image it applies to plus the trimmed text.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdit {
    pub image: ImagePayload,
    pub prompt: String,
}

/// Conversational editing session. Each turn edits the latest result, the
/// first one edits the source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EditorState {
    pub source: Option<SourceImage>,
    pub history: Vec<EditTurn>,
    pub error: Option<String>,
    pub is_busy: bool,
}

impl EditorState {
    pub fn load_source(&mut self, name: impl Into<String>, payload: ImagePayload) {
        *self = Self {
            source: Some(SourceImage {
                name: name.into(),
                payload,
            }),
            ..Self::default()
        };
    }

    pub fn current(&self) -> Option<&ImagePayload> {
        self.history.last().map(|turn| &turn.result)
    }

    pub fn working_image(&self) -> Option<&ImagePayload> {
        self.current()
            .or_else(|| self.source.as_ref().map(|source| &source.payload))
    }

    /// Marks the session busy and returns what to send, or `None` when there
    /// is no image, the prompt is blank, or an edit is already in flight.
    pub fn begin_edit(&mut self, prompt: &str) -> Option<PendingEdit> {
        let prompt = prompt.trim();
        if prompt.is_empty() || self.is_busy {
            return None;
        }
        let image = self.working_image()?.clone();
        self.is_busy = true;
        self.error = None;
        Some(PendingEdit {
            image,
            prompt: prompt.to_string(),
        })
    }

    pub fn complete_edit(&mut self, prompt: impl Into<String>, result: ImagePayload) {
        self.history.push(EditTurn {
            prompt: prompt.into(),
            result,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        self.is_busy = false;
    }

    pub fn fail_edit(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.is_busy = false;
    }

    pub fn undo(&mut self) -> bool {
        if self.is_busy {
            return false;
        }
        self.error = None;
        self.history.pop().is_some()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::{is_image_mime, EditorState};
    use crate::runs::results::ImagePayload;

    fn payload(tag: &[u8]) -> ImagePayload {
        ImagePayload::from_bytes("image/png", tag)
    }

    #[test]
    fn edits_chain_from_latest_result() {
        let mut editor = EditorState::default();
        editor.load_source("shoe.png", payload(b"source"));

        let first = editor.begin_edit("  make it red ").expect("pending edit");
        assert_eq!(first.prompt, "make it red");
        assert_eq!(first.image, payload(b"source"));
        assert!(editor.is_busy);
        assert!(editor.begin_edit("again").is_none());
        editor.complete_edit(first.prompt, payload(b"red"));

        let second = editor.begin_edit("add a shadow").expect("pending edit");
        assert_eq!(second.image, payload(b"red"));
        editor.complete_edit(second.prompt, payload(b"shadow"));
        assert_eq!(editor.current(), Some(&payload(b"shadow")));
        assert_eq!(editor.history.len(), 2);
    }

    #[test]
    fn failure_keeps_current_image_and_sets_banner() {
        let mut editor = EditorState::default();
        editor.load_source("shoe.png", payload(b"source"));
        let pending = editor.begin_edit("make it red").expect("pending edit");
        editor.fail_edit("no image generated");
        assert_eq!(editor.error.as_deref(), Some("no image generated"));
        assert!(!editor.is_busy);
        assert_eq!(editor.working_image(), Some(&pending.image));
        assert!(editor.current().is_none());
    }

    #[test]
    fn blank_prompt_or_missing_source_is_noop() {
        let mut editor = EditorState::default();
        assert!(editor.begin_edit("make it red").is_none());
        editor.load_source("shoe.png", payload(b"source"));
        assert!(editor.begin_edit("   ").is_none());
        assert!(!editor.is_busy);
    }

    #[test]
    fn undo_restores_previous_image_and_load_resets() {
        let mut editor = EditorState::default();
        editor.load_source("shoe.png", payload(b"source"));
        editor.complete_edit("red", payload(b"red"));
        editor.complete_edit("blue", payload(b"blue"));
        assert!(editor.undo());
        assert_eq!(editor.current(), Some(&payload(b"red")));

        editor.load_source("hat.png", payload(b"hat"));
        assert!(editor.history.is_empty());
        assert!(!editor.undo());
        assert_eq!(editor.working_image(), Some(&payload(b"hat")));
    }

    #[test]
    fn image_mime_check_uses_prefix() {
        assert!(is_image_mime("image/png"));
        assert!(is_image_mime("IMAGE/JPEG"));
        assert!(!is_image_mime("text/csv"));
        assert!(!is_image_mime(""));
    }
}
