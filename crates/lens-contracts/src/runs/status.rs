use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Stopped,
}

impl RunOutcome {
    pub fn label(self) -> &'static str {
        match self {
            Self::Completed => "Completed!",
            Self::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BulkPhase {
    #[default]
    Idle,
    Running,
    Completed,
    Stopped,
}

impl From<RunOutcome> for BulkPhase {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed => Self::Completed,
            RunOutcome::Stopped => Self::Stopped,
        }
    }
}

/// Progress of the current bulk run.
///
/// Every transition builds a fresh value; readers never observe a half
/// updated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProcessingStatus {
    pub total: usize,
    pub completed: usize,
    pub is_processing: bool,
    pub current_action: Option<String>,
}

impl ProcessingStatus {
    pub fn started(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            is_processing: true,
            current_action: Some(format!("Starting batch of {total} rows...")),
        }
    }

    pub fn with_action(&self, action: impl Into<String>) -> Self {
        Self {
            current_action: Some(action.into()),
            ..self.clone()
        }
    }

    /// Counts one more row as done, saturating at `total`.
    pub fn advanced(&self) -> Self {
        Self {
            completed: (self.completed + 1).min(self.total),
            ..self.clone()
        }
    }

    pub fn finished(&self, outcome: RunOutcome) -> Self {
        Self {
            is_processing: false,
            current_action: Some(outcome.label().to_string()),
            ..self.clone()
        }
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::{BulkPhase, ProcessingStatus, RunOutcome};

    #[test]
    fn advanced_never_exceeds_total() {
        let mut status = ProcessingStatus::started(2);
        for _ in 0..5 {
            status = status.advanced();
        }
        assert_eq!(status.completed, 2);
        assert!(status.is_processing);
        assert_eq!(status.fraction(), 1.0);
    }

    #[test]
    fn finished_sets_outcome_label() {
        let status = ProcessingStatus::started(3).advanced();
        let done = status.finished(RunOutcome::Stopped);
        assert!(!done.is_processing);
        assert_eq!(done.completed, 1);
        assert_eq!(done.current_action.as_deref(), Some("Stopped"));
        assert_eq!(
            status.finished(RunOutcome::Completed).current_action.as_deref(),
            Some("Completed!")
        );
        assert_eq!(BulkPhase::from(RunOutcome::Stopped), BulkPhase::Stopped);
    }

    #[test]
    fn empty_status_reports_zero_fraction() {
        assert_eq!(ProcessingStatus::default().fraction(), 0.0);
    }
}
