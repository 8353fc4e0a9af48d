use std::fs;
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use lens_contracts::catalog::{default_filename_column, default_prompt_column};
use lens_contracts::chat::{parse_intent, EDITOR_HELP_COMMANDS};
use lens_contracts::editor::EditorState;
use lens_contracts::events::EventWriter;
use lens_contracts::runs::status::{ProcessingStatus, RunOutcome};
use lens_contracts::runs::summary::{write_summary, BulkRunSummary};
use lens_contracts::state::{AppState, Mode};
use lens_engine::config::DRYRUN_MODEL;
use lens_engine::editor::{apply_edit, load_source_file, save_current, EditOutcome};
use lens_engine::{
    generator_for, read_spreadsheet, write_archive, BulkPipeline, CancellationToken,
    ExportOptions, ImageGenerator, LensConfig,
};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const LOG_ENV: &str = "GEMINI_LENS_LOG";
const GENERATED_FILE_NAME: &str = "gemini-lens.png";
const EXIT_STOPPED: i32 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "gemini-lens",
    version,
    about = "Edit product images and generate catalog images with Gemini"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Edit an image, once with --prompt or interactively.
    Edit(EditArgs),
    /// Generate a single image from text.
    Generate(GenerateArgs),
    /// Show the columns of a spreadsheet and the default selections.
    Inspect(InspectArgs),
    /// Generate one image per spreadsheet row and zip the results.
    Bulk(BulkArgs),
}

#[derive(Debug, Args)]
struct ModelArgs {
    #[arg(long)]
    model: Option<String>,
    /// Use the offline generator instead of calling the API.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: Option<PathBuf>,
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Debug, Parser)]
struct InspectArgs {
    #[arg(long)]
    sheet: PathBuf,
}

#[derive(Debug, Parser)]
struct BulkArgs {
    #[arg(long)]
    sheet: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    prompt_column: Option<String>,
    #[arg(long)]
    filename_column: Option<String>,
    #[arg(long, default_value = "")]
    baseline: String,
    /// Add manifest.json with prompts and digests to the archive.
    #[arg(long)]
    manifest: bool,
    #[arg(long)]
    log_capacity: Option<usize>,
    #[command(flatten)]
    model: ModelArgs,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("gemini-lens error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Edit(args) => run_edit(args),
        Command::Generate(args) => run_generate(args),
        Command::Inspect(args) => run_inspect(args),
        Command::Bulk(args) => run_bulk(args),
    }
}

fn resolve_config(args: &ModelArgs) -> LensConfig {
    let model = if args.dryrun {
        Some(DRYRUN_MODEL.to_string())
    } else {
        args.model.clone()
    };
    LensConfig::from_env().with_model(model)
}

fn run_edit(args: EditArgs) -> Result<i32> {
    let config = resolve_config(&args.model);
    let generator = generator_for(&config)?;
    let mut state = AppState::new(config.log_capacity);
    state.switch_mode(Mode::Editor);
    load_source_file(&mut state.editor, &args.image)?;

    let Some(prompt) = args.prompt else {
        run_editor_repl(&mut state.editor, generator.as_ref())?;
        return Ok(0);
    };
    match apply_edit(&mut state.editor, generator.as_ref(), &prompt) {
        EditOutcome::Applied => {}
        EditOutcome::Ignored => bail!("edit prompt is empty"),
        EditOutcome::Failed => bail!(
            "edit failed: {}",
            state.editor.error.as_deref().unwrap_or("unknown error")
        ),
    }
    let target = args.out.unwrap_or_else(|| PathBuf::from("."));
    let saved = save_current(&state.editor, &target)?;
    println!("Saved {}", saved.display());
    Ok(0)
}

fn run_editor_repl(editor: &mut EditorState, generator: &dyn ImageGenerator) -> Result<()> {
    let stdin = io::stdin();
    let mut line = String::new();
    println!(
        "Editing {} with {}. Type /help for commands.",
        editor
            .source
            .as_ref()
            .map(|source| source.name.as_str())
            .unwrap_or("image"),
        generator.name()
    );

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        match intent.action.as_str() {
            "noop" => {}
            "help" => println!("Commands: {}", EDITOR_HELP_COMMANDS.join(" ")),
            "quit" => break,
            "load_image" => match intent.path {
                Some(path) => match load_source_file(editor, Path::new(&path)) {
                    Ok(()) => println!("Loaded {path}"),
                    Err(err) => println!("Load failed: {err}"),
                },
                None => println!("/load requires a path"),
            },
            "save_image" => {
                let target = intent.path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
                match save_current(editor, &target) {
                    Ok(saved) => println!("Saved {}", saved.display()),
                    Err(err) => println!("Save failed: {err}"),
                }
            }
            "undo" => {
                if editor.undo() {
                    println!("Reverted to the previous image.");
                } else {
                    println!("Nothing to undo.");
                }
            }
            "reset" => {
                editor.reset();
                println!("Session cleared. Use /load to pick an image.");
            }
            "history" => {
                if editor.history.is_empty() {
                    println!("No edits yet.");
                }
                for (index, turn) in editor.history.iter().enumerate() {
                    println!("{}. {} ({})", index + 1, turn.prompt, turn.created_at);
                }
            }
            "edit" => {
                let prompt = intent.prompt.unwrap_or_default();
                match apply_edit(editor, generator, &prompt) {
                    EditOutcome::Applied => {
                        println!("Edit {} applied.", editor.history.len())
                    }
                    EditOutcome::Failed => println!(
                        "Edit failed: {}",
                        editor.error.as_deref().unwrap_or("unknown error")
                    ),
                    EditOutcome::Ignored => println!("Load an image first with /load <path>."),
                }
            }
            _ => println!(
                "Unknown command /{}. Type /help.",
                intent.prompt.unwrap_or_default()
            ),
        }
    }
    Ok(())
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = resolve_config(&args.model);
    let generator = generator_for(&config)?;
    let payload = generator.generate_image(args.prompt.trim())?;
    let bytes = payload
        .decode()
        .context("generated image is not valid base64")?;
    let target = match args.out {
        Some(path) if path.is_dir() => path.join(GENERATED_FILE_NAME),
        Some(path) => path,
        None => PathBuf::from(GENERATED_FILE_NAME),
    };
    fs::write(&target, bytes).with_context(|| format!("failed writing {}", target.display()))?;
    println!("Saved {}", target.display());
    Ok(0)
}

fn run_inspect(args: InspectArgs) -> Result<i32> {
    let catalog = read_spreadsheet(&args.sheet)?;
    println!("{}: {} rows", catalog.source_name, catalog.rows.len());
    println!("Columns:");
    for column in catalog.columns.iter() {
        println!("  {column}");
    }
    if let Some(column) = default_prompt_column(&catalog.columns) {
        println!("Default prompt column: {column}");
    }
    if let Some(column) = default_filename_column(&catalog.columns) {
        println!("Default filename column: {column}");
    }
    Ok(0)
}

fn run_bulk(args: BulkArgs) -> Result<i32> {
    let mut config = resolve_config(&args.model);
    if let Some(capacity) = args.log_capacity.filter(|value| *value > 0) {
        config.log_capacity = capacity;
    }
    let generator = generator_for(&config)?;
    let mut state = AppState::new(config.log_capacity);
    state.switch_mode(Mode::Bulk);
    let bulk = &mut state.bulk;

    match read_spreadsheet(&args.sheet) {
        Ok(catalog) => bulk.load_catalog(catalog),
        Err(err) => {
            bulk.reject_catalog(&err);
            return Err(err).context("spreadsheet ingestion failed");
        }
    }
    if let Some(column) = args.prompt_column.as_deref() {
        if !bulk.set_prompt_column(column) {
            bail!("unknown prompt column '{column}'");
        }
    }
    if let Some(column) = args.filename_column.as_deref() {
        if !bulk.set_filename_column(column) {
            bail!("unknown filename column '{column}'");
        }
    }
    bulk.set_baseline_prompt(args.baseline.clone());
    if !bulk.can_start() {
        bail!("nothing to generate: the spreadsheet has no rows or columns");
    }

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let run_id = Uuid::new_v4().to_string();
    let events = EventWriter::new(args.out.join("events.jsonl"), run_id.clone());
    let started_at = now_utc_iso();

    let cancel = CancellationToken::new();
    spawn_stop_listener(cancel.clone());
    println!("Type 'stop' and press Enter to stop after the current row.");

    let mut last_action: Option<String> = None;
    let mut last_log: Option<String> = None;
    let outcome = BulkPipeline::new(generator.as_ref())
        .with_events(events)
        .run(bulk, &cancel, |snapshot| {
            let progress = progress_label(&snapshot.status);
            let latest = snapshot.log.latest().map(str::to_string);
            if latest.is_some() && latest != last_log {
                println!("{progress} {}", latest.as_deref().unwrap_or_default());
                last_log = latest;
            }
            let action = snapshot.status.current_action.clone();
            if action.is_some() && action != last_action {
                println!("{progress} {}", action.as_deref().unwrap_or_default());
                last_action = action;
            }
        });
    let Some(outcome) = outcome else {
        bail!("bulk run did not start");
    };
    let mut archive_path = None;
    let mut export_error = None;
    if bulk.results.is_empty() {
        println!("No images were generated; skipping archive.");
    } else {
        let options = ExportOptions {
            include_manifest: args.manifest,
        };
        match write_archive(&bulk.results, &args.out, options) {
            Ok((path, report)) => {
                for warning in &report.warnings {
                    eprintln!("warning: {warning}");
                }
                println!(
                    "Wrote {} images to {}",
                    report.entries.len(),
                    path.display()
                );
                archive_path = Some(path.to_string_lossy().to_string());
            }
            Err(err) => {
                bulk.log.push(format!("Error creating zip: {err}"));
                export_error = Some(err);
            }
        }
    }

    let summary = BulkRunSummary {
        run_id,
        source_name: bulk.source_name.clone().unwrap_or_default(),
        started_at,
        finished_at: now_utc_iso(),
        outcome,
        total_rows: bulk.status.total as u64,
        completed_rows: bulk.status.completed as u64,
        generated: bulk.tally.generated as u64,
        skipped: bulk.tally.skipped as u64,
        failed: bulk.tally.failed as u64,
        archive_path,
    };
    let extra = json!({
        "generator": generator.name(),
        "baseline_prompt": bulk.config.baseline_prompt,
        "prompt_column": bulk.config.prompt_column,
        "filename_column": bulk.config.filename_column,
    });
    write_summary(&args.out.join("summary.json"), &summary, extra.as_object())?;
    info!(run_id = %summary.run_id, outcome = outcome.label(), "summary written");

    if let Some(err) = export_error {
        return Err(err.into());
    }
    Ok(match outcome {
        RunOutcome::Completed => 0,
        RunOutcome::Stopped => EXIT_STOPPED,
    })
}

fn progress_label(status: &ProcessingStatus) -> String {
    format!(
        "[{}/{} {:>3.0}%]",
        status.completed,
        status.total,
        status.fraction() * 100.0
    )
}

/// Cancels the run when a line reading `stop` arrives on stdin.
fn spawn_stop_listener(cancel: CancellationToken) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().eq_ignore_ascii_case("stop") {
                cancel.cancel();
                break;
            }
        }
    });
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use lens_contracts::runs::status::ProcessingStatus;

    use super::{progress_label, Cli, Command};

    #[test]
    fn progress_label_shows_counts_and_percent() {
        let status = ProcessingStatus::started(4).advanced();
        assert_eq!(progress_label(&status), "[1/4  25%]");
        assert_eq!(progress_label(&ProcessingStatus::default()), "[0/0   0%]");
    }

    #[test]
    fn bulk_arguments_parse() {
        let cli = Cli::parse_from([
            "gemini-lens",
            "bulk",
            "--sheet",
            "products.csv",
            "--out",
            "out",
            "--prompt-column",
            "Description",
            "--baseline",
            "studio photo",
            "--dryrun",
            "--manifest",
        ]);
        let Command::Bulk(args) = cli.command else {
            panic!("expected bulk command");
        };
        assert_eq!(args.prompt_column.as_deref(), Some("Description"));
        assert_eq!(args.baseline, "studio photo");
        assert!(args.model.dryrun);
        assert!(args.manifest);
        assert!(args.filename_column.is_none());
    }

    #[test]
    fn edit_without_prompt_is_interactive() {
        let cli = Cli::parse_from(["gemini-lens", "edit", "--image", "shoe.png"]);
        let Command::Edit(args) = cli.command else {
            panic!("expected edit command");
        };
        assert!(args.prompt.is_none());
        assert!(!args.model.dryrun);
    }
}
