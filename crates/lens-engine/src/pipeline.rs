use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lens_contracts::catalog::{compose_prompt, sanitize_file_name};
use lens_contracts::events::{EventPayload, EventWriter};
use lens_contracts::runs::results::GeneratedImage;
use lens_contracts::runs::status::RunOutcome;
use lens_contracts::state::BulkState;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::ImageGenerator;

/// Stop request shared between the pipeline and whoever drives the UI.
///
/// Only checked between rows: a request already sent is always allowed to
/// finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct BulkPipeline<'a> {
    generator: &'a dyn ImageGenerator,
    events: EventWriter,
}

impl<'a> BulkPipeline<'a> {
    pub fn new(generator: &'a dyn ImageGenerator) -> Self {
        Self {
            generator,
            events: EventWriter::disabled("bulk"),
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    /// Generates one image per row, strictly in row order.
    ///
    /// Returns `None` without touching `state` when there are no rows or a
    /// column is not selected. Per-row failures are logged and the run goes
    /// on; `observer` sees the state after every change.
    pub fn run(
        &self,
        state: &mut BulkState,
        cancel: &CancellationToken,
        mut observer: impl FnMut(&BulkState),
    ) -> Option<RunOutcome> {
        let config = state.config.clone();
        let (Some(prompt_column), Some(filename_column)) =
            (config.prompt_column.clone(), config.filename_column.clone())
        else {
            return None;
        };
        if !state.begin_run() {
            return None;
        }
        let total = state.rows.len();
        self.emit(
            "bulk_started",
            json!({
                "total": total,
                "prompt_column": prompt_column,
                "filename_column": filename_column,
                "baseline_prompt": config.baseline_prompt,
                "generator": self.generator.name(),
            }),
        );
        observer(&*state);

        let mut outcome = RunOutcome::Completed;
        for index in 0..total {
            if cancel.is_cancelled() {
                state.log.push("Stopped by user.");
                outcome = RunOutcome::Stopped;
                break;
            }
            let row_number = index + 1;
            let (row_prompt, raw_name) = {
                let row = &state.rows[index];
                (row.text(&prompt_column), row.text(&filename_column))
            };

            if row_prompt.trim().is_empty() {
                state.log.push(format!("Skipping row {row_number}: empty prompt."));
                state.tally.skipped += 1;
                self.emit("row_skipped", json!({ "row": row_number }));
            } else {
                let prompt = compose_prompt(&config.baseline_prompt, &row_prompt);
                state.status = state
                    .status
                    .with_action(format!("Generating {row_number}/{total}: {raw_name}"));
                observer(&*state);

                match self.generator.generate_image(&prompt) {
                    Ok(payload) => {
                        let file_name = sanitize_file_name(&raw_name, row_number);
                        state.log.push(format!("Generated {file_name}.png"));
                        state.tally.generated += 1;
                        self.emit(
                            "row_generated",
                            json!({
                                "row": row_number,
                                "file_name": file_name,
                                "mime_type": payload.mime_type,
                            }),
                        );
                        state.results.push(GeneratedImage::new(
                            payload, prompt, file_name, raw_name,
                        ));
                    }
                    Err(err) => {
                        warn!(row = row_number, error = %err, "row generation failed");
                        state.log.push(format!("Row {row_number} failed: {err}"));
                        state.tally.failed += 1;
                        self.emit(
                            "row_failed",
                            json!({ "row": row_number, "error": err.to_string() }),
                        );
                    }
                }
            }

            state.status = state.status.advanced();
            observer(&*state);
        }

        // A stop requested during the last row still ends the run as stopped.
        if outcome == RunOutcome::Completed && cancel.is_cancelled() {
            state.log.push("Stopped by user.");
            outcome = RunOutcome::Stopped;
        }
        state.finish_run(outcome);
        cancel.reset();
        if outcome == RunOutcome::Completed {
            state.log.push(format!(
                "Batch completed: {} generated, {} skipped, {} failed.",
                state.tally.generated, state.tally.skipped, state.tally.failed
            ));
        }
        info!(
            outcome = outcome.label(),
            completed = state.status.completed,
            total,
            "bulk run finished"
        );
        self.emit(
            "bulk_finished",
            json!({
                "outcome": outcome,
                "completed": state.status.completed,
                "total": total,
                "generated": state.tally.generated,
                "skipped": state.tally.skipped,
                "failed": state.tally.failed,
            }),
        );
        observer(&*state);
        Some(outcome)
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let payload: EventPayload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        if let Err(err) = self.events.emit(event_type, payload) {
            warn!(event_type, error = %err, "failed to record event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use lens_contracts::catalog::{Catalog, RowRecord};
    use lens_contracts::events::EventWriter;
    use lens_contracts::runs::results::ImagePayload;
    use lens_contracts::runs::status::{BulkPhase, RunOutcome};
    use lens_contracts::state::BulkState;
    use serde_json::Value;

    use super::{BulkPipeline, CancellationToken};
    use crate::client::ImageGenerator;
    use crate::error::GenerationError;

    /// Records prompts and answers from a script; `fail_on` prompts error out.
    struct ScriptedGenerator {
        prompts: Mutex<Vec<String>>,
        fail_on: Vec<String>,
        cancel_after_call: Option<(usize, CancellationToken)>,
    }

    impl ScriptedGenerator {
        fn new() -> Self {
            Self {
                prompts: Mutex::new(Vec::new()),
                fail_on: Vec::new(),
                cancel_after_call: None,
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().map(|guard| guard.clone()).unwrap_or_default()
        }
    }

    impl ImageGenerator for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }

        fn edit_image(
            &self,
            _image: &[u8],
            _mime_type: &str,
            prompt: &str,
        ) -> Result<ImagePayload, GenerationError> {
            self.generate_image(prompt)
        }

        fn generate_image(&self, prompt: &str) -> Result<ImagePayload, GenerationError> {
            let call_count = {
                let mut prompts = self.prompts.lock().expect("prompt log");
                prompts.push(prompt.to_string());
                prompts.len()
            };
            if let Some((after, token)) = &self.cancel_after_call {
                if call_count == *after {
                    token.cancel();
                }
            }
            if self.fail_on.iter().any(|value| value == prompt) {
                return Err(GenerationError::NoImage { model_text: None });
            }
            Ok(ImagePayload::from_bytes("image/png", prompt.as_bytes()))
        }
    }

    fn state_with_rows(rows: Vec<RowRecord>) -> BulkState {
        let mut state = BulkState::default();
        state.load_catalog(Catalog::new("catalog.csv", rows));
        state
    }

    fn sku_rows() -> Vec<RowRecord> {
        vec![
            RowRecord::from_iter([("sku", "A1"), ("desc", "a mug")]),
            RowRecord::from_iter([("sku", "A1"), ("desc", "")]),
            RowRecord::from_iter([("sku", "B2"), ("desc", "a hat")]),
        ]
    }

    #[test]
    fn three_row_catalog_skips_blank_prompt() {
        let mut state = state_with_rows(sku_rows());
        assert!(state.set_prompt_column("desc"));
        assert!(state.set_filename_column("sku"));
        let generator = ScriptedGenerator::new();
        let cancel = CancellationToken::new();

        let mut seen_completed = Vec::new();
        let outcome = BulkPipeline::new(&generator).run(&mut state, &cancel, |snapshot| {
            seen_completed.push(snapshot.status.completed);
        });

        assert_eq!(outcome, Some(RunOutcome::Completed));
        assert_eq!(generator.prompts(), vec!["a mug", "a hat"]);
        assert_eq!(state.status.completed, 3);
        assert_eq!(state.status.total, 3);
        assert!(!state.status.is_processing);
        assert_eq!(state.status.current_action.as_deref(), Some("Completed!"));
        assert_eq!(state.phase, BulkPhase::Completed);
        let names: Vec<&str> = state.results.iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, vec!["A1", "B2"]);
        assert_eq!(state.tally.skipped, 1);

        assert!(seen_completed.windows(2).all(|pair| pair[1] >= pair[0]));
        assert!(seen_completed
            .windows(2)
            .all(|pair| pair[1] - pair[0] <= 1));
        assert_eq!(seen_completed.last(), Some(&3));
    }

    #[test]
    fn baseline_prompt_is_prefixed() {
        let mut state = state_with_rows(vec![RowRecord::from_iter([
            ("prompt", "red sneaker"),
            ("name", "shoe/01"),
        ])]);
        assert!(state.set_baseline_prompt("studio lighting"));
        let generator = ScriptedGenerator::new();
        BulkPipeline::new(&generator).run(&mut state, &CancellationToken::new(), |_| {});

        assert_eq!(generator.prompts(), vec!["studio lighting. red sneaker"]);
        let result = &state.results[0];
        assert_eq!(result.prompt, "studio lighting. red sneaker");
        assert_eq!(result.file_name, "shoe_01");
        assert_eq!(result.original_name, "shoe/01");
    }

    #[test]
    fn failures_are_logged_and_run_continues() {
        let mut state = state_with_rows(vec![
            RowRecord::from_iter([("prompt", "first"), ("sku", "S1")]),
            RowRecord::from_iter([("prompt", "broken"), ("sku", "S2")]),
            RowRecord::from_iter([("prompt", "third"), ("sku", "S3")]),
        ]);
        let mut generator = ScriptedGenerator::new();
        generator.fail_on = vec!["broken".to_string()];
        let outcome =
            BulkPipeline::new(&generator).run(&mut state, &CancellationToken::new(), |_| {});

        assert_eq!(outcome, Some(RunOutcome::Completed));
        assert_eq!(state.status.completed, 3);
        assert_eq!(state.results.len(), 2);
        assert_eq!(state.tally.failed, 1);
        assert!(state
            .log
            .iter()
            .any(|line| line == "Row 2 failed: no image generated"));
    }

    #[test]
    fn cancellation_finishes_in_flight_row_then_stops() {
        let rows = (1..=4)
            .map(|idx| {
                RowRecord::from_iter([
                    ("prompt", format!("item {idx}")),
                    ("sku", format!("S{idx}")),
                ])
            })
            .collect();
        let mut state = state_with_rows(rows);
        let cancel = CancellationToken::new();
        let mut generator = ScriptedGenerator::new();
        generator.cancel_after_call = Some((2, cancel.clone()));

        let outcome = BulkPipeline::new(&generator).run(&mut state, &cancel, |_| {});

        assert_eq!(outcome, Some(RunOutcome::Stopped));
        assert_eq!(generator.prompts(), vec!["item 1", "item 2"]);
        assert_eq!(state.results.len(), 2);
        assert_eq!(state.status.completed, 2);
        assert_eq!(state.status.current_action.as_deref(), Some("Stopped"));
        assert_eq!(state.phase, BulkPhase::Stopped);
        assert_eq!(state.log.latest(), Some("Stopped by user."));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn stop_during_last_row_ends_stopped() {
        let mut state = state_with_rows(vec![
            RowRecord::from_iter([("prompt", "item 1"), ("sku", "S1")]),
            RowRecord::from_iter([("prompt", "item 2"), ("sku", "S2")]),
        ]);
        let cancel = CancellationToken::new();
        let mut generator = ScriptedGenerator::new();
        generator.cancel_after_call = Some((state.rows.len(), cancel.clone()));

        let outcome = BulkPipeline::new(&generator).run(&mut state, &cancel, |_| {});

        assert_eq!(outcome, Some(RunOutcome::Stopped));
        assert_eq!(state.results.len(), 2);
        assert_eq!(state.status.completed, 2);
        assert_eq!(state.status.current_action.as_deref(), Some("Stopped"));
        assert_eq!(state.phase, BulkPhase::Stopped);
        assert_eq!(state.log.latest(), Some("Stopped by user."));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn whitespace_prompt_is_skipped_without_a_call() {
        let mut state = state_with_rows(vec![
            RowRecord::from_iter([("sku", "A1"), ("desc", "a mug")]),
            RowRecord::from_iter([("sku", "A2"), ("desc", "   ")]),
            RowRecord::from_iter([("sku", "B2"), ("desc", "a hat")]),
        ]);
        assert!(state.set_prompt_column("desc"));
        let generator = ScriptedGenerator::new();

        let outcome =
            BulkPipeline::new(&generator).run(&mut state, &CancellationToken::new(), |_| {});

        assert_eq!(outcome, Some(RunOutcome::Completed));
        assert_eq!(generator.prompts(), vec!["a mug", "a hat"]);
        assert_eq!(state.status.completed, state.status.total);
        assert_eq!(state.status.completed, 3);
        assert_eq!(state.tally.skipped, 1);
        assert_eq!(state.results.len(), 2);
    }

    #[test]
    fn missing_columns_or_rows_is_a_noop() {
        let generator = ScriptedGenerator::new();
        let mut empty = BulkState::default();
        assert_eq!(
            BulkPipeline::new(&generator).run(&mut empty, &CancellationToken::new(), |_| {}),
            None
        );
        assert_eq!(empty.phase, BulkPhase::Idle);

        let mut state = state_with_rows(sku_rows());
        state.config.filename_column = None;
        assert_eq!(
            BulkPipeline::new(&generator).run(&mut state, &CancellationToken::new(), |_| {}),
            None
        );
        assert!(generator.prompts().is_empty());
        assert_eq!(state.status.total, 0);
    }

    #[test]
    fn new_run_clears_previous_results() {
        let mut state = state_with_rows(sku_rows());
        state.set_prompt_column("desc");
        let generator = ScriptedGenerator::new();
        let pipeline = BulkPipeline::new(&generator);
        pipeline.run(&mut state, &CancellationToken::new(), |_| {});
        assert_eq!(state.results.len(), 2);
        pipeline.run(&mut state, &CancellationToken::new(), |_| {});
        assert_eq!(state.results.len(), 2);
        assert_eq!(state.status.completed, 3);
    }

    #[test]
    fn missing_filename_value_falls_back_to_row_number() {
        let mut state = state_with_rows(vec![
            RowRecord::from_iter([("prompt", "first"), ("sku", "S1")]),
            RowRecord::from_iter([("prompt", "second")]),
        ]);
        let generator = ScriptedGenerator::new();
        BulkPipeline::new(&generator).run(&mut state, &CancellationToken::new(), |_| {});
        assert_eq!(state.results[1].file_name, "image-2");
        assert_eq!(state.results[1].original_name, "");
    }

    #[test]
    fn events_are_written_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let mut state = state_with_rows(sku_rows());
        state.set_prompt_column("desc");
        let generator = ScriptedGenerator::new();
        BulkPipeline::new(&generator)
            .with_events(EventWriter::new(&events_path, "bulk-test"))
            .run(&mut state, &CancellationToken::new(), |_| {});

        let types: Vec<String> = std::fs::read_to_string(&events_path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(
            types,
            vec![
                "bulk_started",
                "row_generated",
                "row_skipped",
                "row_generated",
                "bulk_finished"
            ]
        );
        Ok(())
    }
}
