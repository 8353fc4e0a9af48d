pub mod client;
pub mod config;
pub mod editor;
pub mod error;
pub mod export;
pub mod ingest;
pub mod pipeline;

pub use client::{generator_for, DryrunGenerator, GeminiClient, ImageGenerator};
pub use config::LensConfig;
pub use error::{GenerationError, LensError};
pub use export::{write_archive, ExportOptions, ExportReport};
pub use ingest::{parse_spreadsheet, read_spreadsheet};
pub use pipeline::{BulkPipeline, CancellationToken};
