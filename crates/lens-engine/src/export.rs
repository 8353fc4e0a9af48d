use std::collections::HashMap;
use std::fs;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use lens_contracts::runs::results::GeneratedImage;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::LensError;

pub const ARCHIVE_FILE_NAME: &str = "gemini-lens-catalog.zip";
pub const ARCHIVE_FOLDER: &str = "catalog_images";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportOptions {
    pub include_manifest: bool,
}

/// Where one result lands inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub result_index: usize,
    pub name: String,
}

impl ArchiveEntry {
    pub fn path(&self) -> String {
        format!("{ARCHIVE_FOLDER}/{}.png", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExportReport {
    pub entries: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ManifestRow<'a> {
    file: String,
    id: &'a str,
    prompt: &'a str,
    original_name: &'a str,
    created_at: &'a str,
    sha256: String,
}

/// Names archive entries in processing order.
///
/// The counter is keyed by the result's own name: its first use keeps the
/// name and the Nth use becomes `<name>_<N>`. Generated names are not
/// checked against later originals, so `a`, `a_2`, `a` yields `a_2` twice.
pub fn plan_entries(results: &[GeneratedImage]) -> Vec<ArchiveEntry> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    results
        .iter()
        .enumerate()
        .map(|(result_index, result)| {
            let count = seen.entry(result.file_name.as_str()).or_insert(0);
            *count += 1;
            let name = if *count > 1 {
                format!("{}_{}", result.file_name, count)
            } else {
                result.file_name.clone()
            };
            ArchiveEntry { result_index, name }
        })
        .collect()
}

pub fn export_zip<W: Write + Seek>(
    results: &[GeneratedImage],
    writer: W,
    options: ExportOptions,
) -> Result<(W, ExportReport), LensError> {
    if results.is_empty() {
        return Err(LensError::Export("no generated images to export".to_string()));
    }

    let mut report = ExportReport::default();
    // When two entries still share a path, the later image replaces the earlier one.
    let mut files: Vec<(String, usize, Vec<u8>)> = Vec::new();
    for entry in plan_entries(results) {
        let result = &results[entry.result_index];
        let bytes = result.payload.decode().map_err(|err| {
            LensError::Export(format!("{}: invalid image data ({err})", result.file_name))
        })?;
        let path = entry.path();
        if let Some(slot) = files.iter_mut().find(|(existing, _, _)| *existing == path) {
            let message = format!("{path} written twice; keeping the later image");
            warn!("{message}");
            report.warnings.push(message);
            *slot = (path, entry.result_index, bytes);
        } else {
            files.push((path, entry.result_index, bytes));
        }
    }

    let zip_error = |err: zip::result::ZipError| LensError::Export(err.to_string());
    let io_error = |err: std::io::Error| LensError::Export(err.to_string());
    let file_options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(writer);
    let mut manifest = Vec::new();
    for (path, result_index, bytes) in &files {
        zip.start_file(path.as_str(), file_options)
            .map_err(zip_error)?;
        zip.write_all(bytes).map_err(io_error)?;
        if options.include_manifest {
            let result = &results[*result_index];
            manifest.push(ManifestRow {
                file: path.clone(),
                id: &result.id,
                prompt: &result.prompt,
                original_name: &result.original_name,
                created_at: &result.created_at,
                sha256: hex::encode(Sha256::digest(bytes)),
            });
        }
        report.entries.push(path.clone());
    }
    if options.include_manifest {
        let body = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| LensError::Export(err.to_string()))?;
        zip.start_file(MANIFEST_FILE_NAME, file_options)
            .map_err(zip_error)?;
        zip.write_all(&body).map_err(io_error)?;
    }
    let writer = zip.finish().map_err(zip_error)?;
    Ok((writer, report))
}

/// Writes the archive into `out_dir` under [`ARCHIVE_FILE_NAME`].
///
/// The zip is assembled in a temporary file first, so a failure never
/// leaves a partial archive behind.
pub fn write_archive(
    results: &[GeneratedImage],
    out_dir: &Path,
    options: ExportOptions,
) -> Result<(PathBuf, ExportReport), LensError> {
    fs::create_dir_all(out_dir)
        .map_err(|err| LensError::Export(format!("{}: {err}", out_dir.display())))?;
    let mut temp = tempfile::NamedTempFile::new_in(out_dir)
        .map_err(|err| LensError::Export(err.to_string()))?;
    let (_, report) = export_zip(results, temp.as_file_mut(), options)?;
    let path = out_dir.join(ARCHIVE_FILE_NAME);
    temp.persist(&path)
        .map_err(|err| LensError::Export(err.to_string()))?;
    info!(path = %path.display(), entries = report.entries.len(), "archive written");
    Ok((path, report))
}
