use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::catalog::{
    default_filename_column, default_prompt_column, Catalog, ColumnSet, GenerationJobConfig,
    RowRecord,
};
use crate::editor::EditorState;
use crate::runs::activity_log::ActivityLog;
use crate::runs::results::GeneratedImage;
use crate::runs::status::{BulkPhase, ProcessingStatus, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Editor,
    Bulk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunTally {
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Everything the bulk view shows. The pipeline is its only writer while a
/// run is in progress.
#[derive(Debug, Clone, Default)]
pub struct BulkState {
    pub source_name: Option<String>,
    pub rows: Vec<RowRecord>,
    pub columns: ColumnSet,
    pub config: GenerationJobConfig,
    pub status: ProcessingStatus,
    pub results: Vec<GeneratedImage>,
    pub log: ActivityLog,
    pub phase: BulkPhase,
    pub tally: RunTally,
}

impl BulkState {
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            log: ActivityLog::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == BulkPhase::Running
    }

    pub fn load_catalog(&mut self, catalog: Catalog) {
        if self.is_running() {
            return;
        }
        let Catalog {
            source_name,
            rows,
            columns,
        } = catalog;
        self.config.prompt_column = default_prompt_column(&columns);
        self.config.filename_column = default_filename_column(&columns);
        self.log
            .push(format!("Loaded {} rows from {source_name}", rows.len()));
        self.source_name = Some(source_name);
        self.rows = rows;
        self.columns = columns;
        self.results.clear();
        self.status = ProcessingStatus::default();
        self.tally = RunTally::default();
        self.phase = BulkPhase::Idle;
    }

    /// Records an ingestion failure; whatever was loaded before stays.
    pub fn reject_catalog(&mut self, err: &dyn Display) {
        self.log.push(format!("Error parsing file: {err}"));
    }

    pub fn set_prompt_column(&mut self, column: &str) -> bool {
        if self.is_running() || !self.columns.contains(column) {
            return false;
        }
        self.config.prompt_column = Some(column.to_string());
        true
    }

    pub fn set_filename_column(&mut self, column: &str) -> bool {
        if self.is_running() || !self.columns.contains(column) {
            return false;
        }
        self.config.filename_column = Some(column.to_string());
        true
    }

    pub fn set_baseline_prompt(&mut self, baseline: impl Into<String>) -> bool {
        if self.is_running() {
            return false;
        }
        self.config.baseline_prompt = baseline.into();
        true
    }

    pub fn can_start(&self) -> bool {
        !self.rows.is_empty() && self.config.is_ready() && !self.is_running()
    }

    /// Moves to `Running` when the entry guard passes; otherwise leaves the
    /// state alone and returns false.
    pub fn begin_run(&mut self) -> bool {
        if !self.can_start() {
            return false;
        }
        self.status = ProcessingStatus::started(self.rows.len());
        self.results.clear();
        self.tally = RunTally::default();
        self.phase = BulkPhase::Running;
        self.log
            .push(format!("Starting batch of {} rows.", self.rows.len()));
        true
    }

    pub fn finish_run(&mut self, outcome: RunOutcome) {
        self.status = self.status.finished(outcome);
        self.phase = outcome.into();
    }

    pub fn reset(&mut self) {
        *self = Self::with_log_capacity(self.log.capacity());
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppState {
    pub mode: Mode,
    pub editor: EditorState,
    pub bulk: BulkState,
}

impl AppState {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            mode: Mode::default(),
            editor: EditorState::default(),
            bulk: BulkState::with_log_capacity(log_capacity),
        }
    }

    pub fn switch_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }
}
