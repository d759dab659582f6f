//! Session transcript boundary: the append-only per-subject log file and
//! the replay parser that re-derives metrics from one.
//!
//! The layout is the task's historical format - header block, `Begin
//! Study`/`Begin Test` sections of CSV rows, termination markers, and a
//! `Scores:` block - kept stable so existing downstream aggregation keeps
//! parsing it. A pre-existing transcript for the same (subject, set) key is
//! preserved under a timestamped `_old` name, never overwritten.

#![allow(clippy::missing_errors_doc)]

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use emodt_core::{
    leading_digit, DiscriminationMetrics, Key, Phase, PhaseOutcome, ResponseScorer, TaskConfig,
    TaskError, TranscriptSink, TrialRecord, TrialType, Valence,
};
use serde::{Deserialize, Serialize};
use time::{format_description, OffsetDateTime};

const HEADER_PREFIX: &str = "EmoDT Task: ";
const HEADER_STAMP_FORMAT: &str =
    "[hour]:[minute]:[second] on [month]-[day]-[year repr:last_two]";
const STUDY_COLUMNS: &str = "TrialNum,Image,TrialType,Keypress,RT";
const TEST_COLUMNS: &str = "TrialNum,Image,TrialType,Valence,Keypress,RT";

/// File-backed [`TranscriptSink`] for one session.
pub struct TranscriptFile {
    writer: BufWriter<File>,
    path: PathBuf,
    started_at: OffsetDateTime,
}

impl TranscriptFile {
    /// Creates `<log_dir>/<subject>_<set>_log.txt` for a new session. An
    /// existing transcript for the same key is first renamed with the
    /// timestamp recorded in its own header (or `unknown` when that header
    /// cannot be read), so earlier sessions are never lost.
    pub fn create(
        log_dir: &Path,
        subject_id: u32,
        stimulus_set: &str,
        started_at: OffsetDateTime,
    ) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

        let path = log_dir.join(format!("{subject_id}_{stimulus_set}_log.txt"));
        if path.is_file() {
            preserve_stale(&path, log_dir, subject_id, stimulus_set)?;
        }

        let file = File::create(&path)
            .with_context(|| format!("failed to create transcript {}", path.display()))?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            started_at,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, text: &str) -> Result<(), TaskError> {
        self.writer
            .write_all(text.as_bytes())
            .map_err(|err| TaskError::Transcript(format!("failed to append transcript: {err}")))
    }
}

fn preserve_stale(
    path: &Path,
    log_dir: &Path,
    subject_id: u32,
    stimulus_set: &str,
) -> Result<()> {
    let file = File::open(path)
        .with_context(|| format!("failed to open stale transcript {}", path.display()))?;
    let mut first_line = String::new();
    let _ = BufReader::new(file)
        .read_line(&mut first_line)
        .with_context(|| format!("failed to read stale transcript {}", path.display()))?;

    let suffix = stale_suffix(&first_line).unwrap_or_else(|| "unknown".to_string());

    let mut target = log_dir.join(format!("{subject_id}_{stimulus_set}_{suffix}_old.txt"));
    let mut attempt = 1_u32;
    while target.exists() {
        target = log_dir.join(format!(
            "{subject_id}_{stimulus_set}_{suffix}_old_{attempt}.txt"
        ));
        attempt += 1;
    }

    fs::rename(path, &target).with_context(|| {
        format!(
            "failed to preserve stale transcript {} as {}",
            path.display(),
            target.display()
        )
    })
}

/// `mmddyy_HHMMSS` extracted from a header line of the form
/// `EmoDT Task: HH:MM:SS on mm-dd-yy`.
fn stale_suffix(header_line: &str) -> Option<String> {
    let stamp = header_line.strip_prefix(HEADER_PREFIX)?;
    let (time_part, date_part) = stamp.trim_end().split_once(" on ")?;
    let time_digits: String = time_part.chars().filter(char::is_ascii_digit).collect();
    let date_digits: String = date_part.chars().filter(char::is_ascii_digit).collect();
    (time_digits.len() == 6 && date_digits.len() == 6)
        .then(|| format!("{date_digits}_{time_digits}"))
}

fn transcript_err(err: impl std::fmt::Display) -> TaskError {
    TaskError::Transcript(err.to_string())
}

impl TranscriptSink for TranscriptFile {
    fn write_header(
        &mut self,
        subject_id: u32,
        stimulus_set: &str,
        config: &TaskConfig,
    ) -> Result<(), TaskError> {
        let items = format_description::parse(HEADER_STAMP_FORMAT).map_err(transcript_err)?;
        let stamp = self.started_at.format(&items).map_err(transcript_err)?;
        self.append(&format!(
            "{HEADER_PREFIX}{stamp}\nSubject ID: {subject_id}\nUsing set {stimulus_set}\n\
             Trial Duration (Study): {:.2}\nTrial Duration (Test): {:.2}\nITI: {:.2}\n\n",
            config.study_trial_duration_s,
            config.test_trial_duration_s,
            config.inter_trial_interval_s,
        ))
    }

    fn phase_started(&mut self, phase: Phase) -> Result<(), TaskError> {
        let columns = match phase {
            Phase::Study => STUDY_COLUMNS,
            Phase::Test => TEST_COLUMNS,
        };
        self.append(&format!("\n\nBegin {}\n\n{columns}\n", phase.as_str()))
    }

    fn phase_skipped(&mut self, phase: Phase) -> Result<(), TaskError> {
        self.append(&format!("\n\n\n#### {} Not Run ####\n\n\n", phase.as_str()))
    }

    fn phase_aborted(&mut self, phase: Phase) -> Result<(), TaskError> {
        self.append(&format!("\n### {} Terminated Early ###\n", phase.as_str()))
    }

    fn write_trial_row(&mut self, phase: Phase, record: &TrialRecord) -> Result<(), TaskError> {
        match phase {
            Phase::Study => self.append(&format!(
                "{},{},{},{},{:.2}\n",
                record.trial_num,
                record.stimulus_id,
                record.trial_type.label(),
                record.keypress_label(),
                record.reaction_time,
            )),
            Phase::Test => {
                let valence = record.valence.ok_or_else(|| {
                    TaskError::Transcript(format!(
                        "test row for {} is missing its valence",
                        record.stimulus_id
                    ))
                })?;
                self.append(&format!(
                    "{},{},{},{},{},{:.2}\n",
                    record.trial_num,
                    record.stimulus_id,
                    record.trial_type.label(),
                    leading_digit(record.trial_type, valence),
                    record.keypress_label(),
                    record.reaction_time,
                ))
            }
        }
    }

    fn write_metrics(&mut self, metrics: &DiscriminationMetrics) -> Result<(), TaskError> {
        self.append("\n\n\nScores:\n\n")?;
        for valence in Valence::ALL {
            let per = metrics.for_valence(valence);
            self.append(&format!(
                "\nLDI-{} Low Sim: {:.2}",
                valence.name(),
                per.ldi_low_sim.value
            ))?;
            self.append(&format!(
                "\nLDI-{} High Sim: {:.2}",
                valence.name(),
                per.ldi_high_sim.value
            ))?;
        }
        self.append("\n\n")?;
        for valence in Valence::ALL {
            self.append(&format!(
                "\nLDI-{} Collapsed: {:.2}",
                valence.name(),
                metrics.for_valence(valence).ldi_collapsed.value
            ))?;
        }
        self.append("\n\n")?;
        for valence in Valence::ALL {
            self.append(&format!(
                "\nRecMem-{}: {:.2}",
                valence.label(),
                metrics.for_valence(valence).recognition_memory.value
            ))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TaskError> {
        self.writer
            .flush()
            .map_err(|err| TaskError::Transcript(format!("failed to flush transcript: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseReplay {
    /// `None` when the transcript shows no trace of the phase at all.
    pub outcome: Option<PhaseOutcome>,
    pub trials: u32,
}

/// Result of re-projecting a written transcript: row counts per phase and
/// the metrics re-derived by feeding every test row through a fresh
/// [`ResponseScorer`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayReport {
    pub subject_id: Option<u32>,
    pub stimulus_set: Option<String>,
    pub study: PhaseReplay,
    pub test: PhaseReplay,
    pub scored_trials: u32,
    pub metrics: DiscriminationMetrics,
}

/// Replays a transcript file from disk.
pub fn replay(path: &Path) -> Result<ReplayReport> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read transcript {}", path.display()))?;
    replay_str(&body)
}

/// Replays transcript text. Strict about row shape: a malformed trial row
/// is an error, not a silent skip.
pub fn replay_str(body: &str) -> Result<ReplayReport> {
    let mut subject_id = None;
    let mut stimulus_set = None;
    let mut study = PhaseReplay {
        outcome: None,
        trials: 0,
    };
    let mut test = PhaseReplay {
        outcome: None,
        trials: 0,
    };
    let mut scorer = ResponseScorer::new();
    let mut section: Option<Phase> = None;

    for raw_line in body.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("Subject ID: ") {
            subject_id = rest.trim().parse::<u32>().ok();
            continue;
        }
        if let Some(rest) = line.strip_prefix("Using set ") {
            stimulus_set = Some(rest.trim().to_string());
            continue;
        }

        match line {
            "Begin Study" => {
                section = Some(Phase::Study);
                study.outcome = Some(PhaseOutcome::Completed);
                continue;
            }
            "Begin Test" => {
                section = Some(Phase::Test);
                test.outcome = Some(PhaseOutcome::Completed);
                continue;
            }
            "#### Study Not Run ####" => {
                study.outcome = Some(PhaseOutcome::Skipped);
                section = None;
                continue;
            }
            "#### Test Not Run ####" => {
                test.outcome = Some(PhaseOutcome::Skipped);
                section = None;
                continue;
            }
            "### Study Terminated Early ###" => {
                study.outcome = Some(PhaseOutcome::Aborted);
                section = None;
                continue;
            }
            "### Test Terminated Early ###" => {
                test.outcome = Some(PhaseOutcome::Aborted);
                section = None;
                continue;
            }
            "Scores:" => {
                section = None;
                continue;
            }
            _ => {}
        }

        if line.starts_with("TrialNum,") {
            continue;
        }

        let Some(phase) = section else {
            continue;
        };

        match phase {
            Phase::Study => {
                let _ = parse_study_row(line)?;
                study.trials += 1;
            }
            Phase::Test => {
                let (trial_type, valence, response) = parse_test_row(line)?;
                scorer.record(trial_type, response, valence);
                test.trials += 1;
            }
        }
    }

    Ok(ReplayReport {
        subject_id,
        stimulus_set,
        study,
        test,
        scored_trials: scorer.scored_trials(),
        metrics: scorer.finalize(),
    })
}

fn parse_response(field: &str, line: &str) -> Result<Option<Key>> {
    if field.is_empty() {
        return Ok(None);
    }
    Key::parse(field)
        .map(Some)
        .ok_or_else(|| anyhow!("unknown keypress {field:?} in row: {line}"))
}

fn parse_study_row(line: &str) -> Result<(TrialType, Option<Key>)> {
    let fields: Vec<&str> = line.split(',').collect();
    let [num, _image, trial_type, keypress, rt] = fields.as_slice() else {
        return Err(anyhow!("malformed study row: {line}"));
    };
    let _ = num
        .parse::<u32>()
        .with_context(|| format!("bad trial number in study row: {line}"))?;
    let trial_type = TrialType::parse(trial_type)
        .ok_or_else(|| anyhow!("unknown trial type {trial_type:?} in row: {line}"))?;
    let response = parse_response(keypress, line)?;
    let _ = rt
        .parse::<f64>()
        .with_context(|| format!("bad reaction time in study row: {line}"))?;
    Ok((trial_type, response))
}

fn parse_test_row(line: &str) -> Result<(TrialType, Valence, Option<Key>)> {
    let fields: Vec<&str> = line.split(',').collect();
    let [num, _image, trial_type, valence, keypress, rt] = fields.as_slice() else {
        return Err(anyhow!("malformed test row: {line}"));
    };
    let _ = num
        .parse::<u32>()
        .with_context(|| format!("bad trial number in test row: {line}"))?;
    let trial_type = TrialType::parse(trial_type)
        .ok_or_else(|| anyhow!("unknown trial type {trial_type:?} in row: {line}"))?;
    let valence = valence
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .and_then(Valence::from_leading_digit)
        .ok_or_else(|| anyhow!("unknown valence digit {valence:?} in row: {line}"))?;
    let response = parse_response(keypress, line)?;
    let _ = rt
        .parse::<f64>()
        .with_context(|| format!("bad reaction time in test row: {line}"))?;
    Ok((trial_type, valence, response))
}
