//! `emodt` command surface.
//!
//! - `task run` drives a full headless session (simulated participant,
//!   manual clock) and writes the transcript a real session would.
//! - `task score` replays a written transcript and re-derives its metrics.
//! - `task sequence` previews the subject-seeded presentation order.
//! - `task classify` validates a stimulus-set directory.
//!
//! [`run_cli`] executes a parsed [`Cli`]; [`run_task`] executes a single
//! [`TaskCommand`], which is what the integration tests drive directly.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use emodt_core::{
    classify_listing, session_orders, DiscriminationMetrics, ManualClock, Metric, Phase, Session,
    SessionReport, SimulatedRenderer, StimulusDescriptor, StimulusInventory, TaskConfig, Valence,
};
use emodt_transcript::{replay, ReplayReport, TranscriptFile};
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "emodt")]
#[command(about = "Emotional Mnemonic Discrimination Task runner")]
pub struct Cli {
    /// Directory session transcripts are written to.
    #[arg(long, default_value = "./logs")]
    logs: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Task {
        #[command(subcommand)]
        command: Box<TaskCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    Run(RunArgs),
    Score(ScoreArgs),
    Sequence(SequenceArgs),
    Classify(ClassifyArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    pub subject: u32,
    /// Stimulus set label; images are read from `<stimuli-root>/set<SET>`.
    #[arg(long)]
    pub set: String,
    #[arg(long)]
    pub stimuli_root: PathBuf,
    /// Optional timing config JSON; absent fields keep standard values.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    pub responder_seed: u64,
    /// Probability the simulated participant responds on a given trial.
    #[arg(long, default_value_t = 0.9)]
    pub response_rate: f64,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ScoreArgs {
    #[arg(long)]
    pub log: PathBuf,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct SequenceArgs {
    #[arg(long)]
    pub subject: u32,
    #[arg(long)]
    pub set: String,
    #[arg(long)]
    pub stimuli_root: PathBuf,
    #[arg(long)]
    pub phase: PhaseArg,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    #[arg(long)]
    pub set: String,
    #[arg(long)]
    pub stimuli_root: PathBuf,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PhaseArg {
    Study,
    Test,
}

/// Executes the parsed top-level command graph.
///
/// # Errors
/// Returns an error when stimulus loading, session execution, transcript
/// I/O, or replay fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Task { command } => run_task(&cli.logs, *command),
    }
}

/// Executes a single task command against the given log directory.
///
/// # Errors
/// Returns an error when the command's inputs are invalid or its I/O fails.
pub fn run_task(logs: &Path, command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::Run(args) => run_session(logs, &args),
        TaskCommand::Score(args) => {
            let report = replay(&args.log)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_replay(&report);
            }
            Ok(())
        }
        TaskCommand::Sequence(args) => {
            let inventory = load_inventory(&args.stimuli_root, &args.set)?;
            let (study, test) = session_orders(args.subject, &inventory.stimuli);
            let (phase, order) = match args.phase {
                PhaseArg::Study => (Phase::Study, study),
                PhaseArg::Test => (Phase::Test, test),
            };
            if args.json {
                let payload = SequenceJsonPayload::new(args.subject, &args.set, phase, &order);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_sequence(phase, &order);
            }
            Ok(())
        }
        TaskCommand::Classify(args) => {
            let inventory = load_inventory(&args.stimuli_root, &args.set)?;
            if args.json {
                let payload = ClassifyJsonPayload::new(&args.set, &inventory);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_classification(&inventory);
            }

            if inventory.excluded.is_empty() {
                Ok(())
            } else {
                Err(anyhow!(
                    "{} malformed stimulus name(s): {}",
                    inventory.excluded.len(),
                    inventory.excluded.join(", ")
                ))
            }
        }
    }
}

fn run_session(logs: &Path, args: &RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let inventory = load_inventory(&args.stimuli_root, &args.set)?;
    if inventory.stimuli.is_empty() {
        return Err(anyhow!(
            "no classifiable stimuli in set {} under {}",
            args.set,
            args.stimuli_root.display()
        ));
    }

    let mut transcript =
        TranscriptFile::create(logs, args.subject, &args.set, OffsetDateTime::now_utc())?;
    let transcript_path = transcript.path().to_path_buf();

    let clock = Rc::new(ManualClock::new());
    let mut renderer =
        SimulatedRenderer::new(Rc::clone(&clock), args.responder_seed, args.response_rate)?;
    let session = Session::new(args.subject, &args.set, config)?;
    let report = session.run(&inventory, &mut renderer, &*clock, &mut transcript, None)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("transcript: {}", transcript_path.display());
        print_report(&report);
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<TaskConfig> {
    let Some(path) = path else {
        return Ok(TaskConfig::standard());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("config {} is not valid JSON", path.display()))?;
    Ok(TaskConfig::from_json(&value)?)
}

/// Reads a stimulus-set directory into a classified inventory. Names are
/// sorted before classification so presentation order never depends on
/// filesystem iteration order.
fn load_inventory(stimuli_root: &Path, set: &str) -> Result<StimulusInventory> {
    let dir = stimuli_root.join(format!("set{set}"));
    let entries = fs::read_dir(&dir)
        .with_context(|| format!("failed to read stimulus directory {}", dir.display()))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read stimulus directory {}", dir.display()))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    Ok(classify_listing(names))
}

fn format_metric(metric: Metric) -> String {
    if metric.insufficient_data {
        format!("{:.2}*", metric.value)
    } else {
        format!("{:.2}", metric.value)
    }
}

fn metrics_have_flags(metrics: &DiscriminationMetrics) -> bool {
    Valence::ALL.iter().any(|&valence| {
        let per = metrics.for_valence(valence);
        per.ldi_low_sim.insufficient_data
            || per.ldi_high_sim.insufficient_data
            || per.ldi_collapsed.insufficient_data
            || per.recognition_memory.insufficient_data
    })
}

fn print_metrics(metrics: &DiscriminationMetrics) {
    println!(
        "{:<10} {:<10} {:<10} {:<14} {:<10}",
        "valence", "ldi_low", "ldi_high", "ldi_collapsed", "rec_mem"
    );
    println!("{}", "-".repeat(58));
    for valence in Valence::ALL {
        let per = metrics.for_valence(valence);
        println!(
            "{:<10} {:<10} {:<10} {:<14} {:<10}",
            valence.as_str(),
            format_metric(per.ldi_low_sim),
            format_metric(per.ldi_high_sim),
            format_metric(per.ldi_collapsed),
            format_metric(per.recognition_memory),
        );
    }
    if metrics_have_flags(metrics) {
        println!("* insufficient data: an empty cell was scored 0 by policy");
    }
}

fn print_report(report: &SessionReport) {
    println!(
        "run_id={} subject={} set={} scored_trials={}",
        report.run_id, report.subject_id, report.stimulus_set, report.scored_trials
    );
    println!(
        "study: outcome={} trials={}",
        report.study.outcome.as_str(),
        report.study.trials
    );
    println!(
        "test: outcome={} trials={}",
        report.test.outcome.as_str(),
        report.test.trials
    );
    if !report.excluded_stimuli.is_empty() {
        println!("excluded: {}", report.excluded_stimuli.join(", "));
    }
    print_metrics(&report.metrics);
}

fn print_replay(report: &ReplayReport) {
    let subject = report
        .subject_id
        .map_or_else(|| "?".to_string(), |id| id.to_string());
    let set = report.stimulus_set.as_deref().unwrap_or("?");
    println!(
        "subject={subject} set={set} scored_trials={}",
        report.scored_trials
    );
    for (phase, summary) in [(Phase::Study, report.study), (Phase::Test, report.test)] {
        let outcome = summary
            .outcome
            .map_or("absent", emodt_core::PhaseOutcome::as_str);
        println!(
            "{}: outcome={outcome} trials={}",
            phase.as_str().to_lowercase(),
            summary.trials
        );
    }
    print_metrics(&report.metrics);
}

fn print_sequence(phase: Phase, order: &[StimulusDescriptor]) {
    println!("{:<6} {:<20} {:<10} valence", "trial", "image", "type");
    println!("{}", "-".repeat(48));
    for (index, stimulus) in order.iter().enumerate() {
        println!(
            "{:<6} {:<20} {:<10} {}",
            index + 1,
            stimulus.id,
            stimulus.trial_type.label(),
            stimulus.valence.as_str(),
        );
    }
    println!("{} {} trials", order.len(), phase.as_str().to_lowercase());
}

fn print_classification(inventory: &StimulusInventory) {
    println!("{:<20} {:<10} {:<10} study/test", "image", "type", "valence");
    println!("{}", "-".repeat(52));
    for stimulus in &inventory.stimuli {
        let membership = match (stimulus.is_study_item(), stimulus.is_test_item()) {
            (true, true) => "both",
            (true, false) => "study",
            _ => "test",
        };
        println!(
            "{:<20} {:<10} {:<10} {membership}",
            stimulus.id,
            stimulus.trial_type.label(),
            stimulus.valence.as_str(),
        );
    }
    for name in &inventory.excluded {
        println!("{name:<20} malformed (excluded)");
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SequenceJsonPayload {
    subject_id: u32,
    stimulus_set: String,
    phase: Phase,
    trials: Vec<SequenceTrialJson>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SequenceTrialJson {
    trial_num: u32,
    image: String,
    trial_type: String,
    valence: Valence,
}

impl SequenceJsonPayload {
    fn new(subject_id: u32, stimulus_set: &str, phase: Phase, order: &[StimulusDescriptor]) -> Self {
        let trials = order
            .iter()
            .enumerate()
            .map(|(index, stimulus)| SequenceTrialJson {
                trial_num: u32::try_from(index + 1).unwrap_or(u32::MAX),
                image: stimulus.id.clone(),
                trial_type: stimulus.trial_type.label().to_string(),
                valence: stimulus.valence,
            })
            .collect();
        Self {
            subject_id,
            stimulus_set: stimulus_set.to_string(),
            phase,
            trials,
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ClassifyJsonPayload {
    stimulus_set: String,
    stimuli: Vec<ClassifyStimulusJson>,
    excluded: Vec<String>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ClassifyStimulusJson {
    image: String,
    trial_type: String,
    valence: Valence,
    study_item: bool,
    test_item: bool,
}

impl ClassifyJsonPayload {
    fn new(stimulus_set: &str, inventory: &StimulusInventory) -> Self {
        let stimuli = inventory
            .stimuli
            .iter()
            .map(|stimulus| ClassifyStimulusJson {
                image: stimulus.id.clone(),
                trial_type: stimulus.trial_type.label().to_string(),
                valence: stimulus.valence,
                study_item: stimulus.is_study_item(),
                test_item: stimulus.is_test_item(),
            })
            .collect();
        Self {
            stimulus_set: stimulus_set.to_string(),
            stimuli,
            excluded: inventory.excluded.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn cli_parses_a_full_run_invocation() {
        let cli = must(
            Cli::try_parse_from([
                "emodt",
                "--logs",
                "/tmp/logs",
                "task",
                "run",
                "--subject",
                "999",
                "--set",
                "A",
                "--stimuli-root",
                "/tmp/stimuli",
                "--responder-seed",
                "7",
                "--response-rate",
                "0.8",
                "--json",
            ])
            .map_err(Into::into),
        );

        let Command::Task { command } = cli.command;
        match *command {
            TaskCommand::Run(args) => {
                assert_eq!(args.subject, 999);
                assert_eq!(args.set, "A");
                assert_eq!(args.responder_seed, 7);
                assert!(args.json);
            }
            other => panic!("expected run command, got {other:?}"),
        }
    }

    #[test]
    fn metric_formatting_marks_policy_zeros() {
        let flagged = Metric {
            value: 0.0,
            insufficient_data: true,
        };
        let plain = Metric {
            value: 0.7,
            insufficient_data: false,
        };
        assert_eq!(format_metric(flagged), "0.00*");
        assert_eq!(format_metric(plain), "0.70");
    }

    #[test]
    fn load_config_falls_back_to_standard() {
        let config = must(load_config(None));
        assert!((config.study_trial_duration_s - 2.5).abs() < 1e-9);
    }
}
