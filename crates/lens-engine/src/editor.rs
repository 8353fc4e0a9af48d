use std::fs;
use std::path::{Path, PathBuf};

use lens_contracts::editor::{is_image_mime, EditorState, DEFAULT_DOWNLOAD_NAME};
use lens_contracts::runs::results::ImagePayload;
use tracing::{debug, warn};

use crate::client::ImageGenerator;
use crate::error::LensError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// Nothing was sent: no image loaded, blank prompt, or an edit in flight.
    Ignored,
    Applied,
    /// The model call failed; the message is in `EditorState::error`.
    Failed,
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

/// Media type from the extension, else sniffed from the bytes.
pub fn detect_image_mime(path: &Path, bytes: &[u8]) -> Option<String> {
    if let Some(mime) = mime_for_path(path) {
        return Some(mime.to_string());
    }
    image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type().to_string())
        .filter(|mime| is_image_mime(mime))
}

/// Reads an image from disk into the session, replacing any previous one.
pub fn load_source_file(state: &mut EditorState, path: &Path) -> Result<(), LensError> {
    let bytes = fs::read(path)?;
    let mime = detect_image_mime(path, &bytes)
        .ok_or_else(|| LensError::UnsupportedImage(path.display().to_string()))?;
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("image")
        .to_string();
    debug!(name = %name, mime = %mime, bytes = bytes.len(), "editor source loaded");
    state.load_source(name, ImagePayload::from_bytes(mime, &bytes));
    Ok(())
}

/// Sends one conversational edit: the latest result, or the source on the
/// first turn, together with `prompt`.
pub fn apply_edit(
    state: &mut EditorState,
    generator: &dyn ImageGenerator,
    prompt: &str,
) -> EditOutcome {
    let Some(pending) = state.begin_edit(prompt) else {
        return EditOutcome::Ignored;
    };
    let bytes = match pending.image.decode() {
        Ok(bytes) => bytes,
        Err(err) => {
            state.fail_edit(format!("current image is not valid base64: {err}"));
            return EditOutcome::Failed;
        }
    };
    match generator.edit_image(&bytes, &pending.image.mime_type, &pending.prompt) {
        Ok(result) => {
            state.complete_edit(pending.prompt, result);
            EditOutcome::Applied
        }
        Err(err) => {
            warn!(error = %err, "edit failed");
            state.fail_edit(err.to_string());
            EditOutcome::Failed
        }
    }
}

/// Writes the current image. A directory target gets the default download
/// name.
pub fn save_current(state: &EditorState, target: &Path) -> Result<PathBuf, LensError> {
    let payload = state
        .working_image()
        .ok_or_else(|| LensError::UnsupportedImage("no image loaded".to_string()))?;
    let bytes = payload
        .decode()
        .map_err(|err| LensError::UnsupportedImage(format!("invalid image data: {err}")))?;
    let path = if target.is_dir() {
        target.join(DEFAULT_DOWNLOAD_NAME)
    } else {
        target.to_path_buf()
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, bytes)?;
    Ok(path)
}
