//! Deterministic core of the Emotional Mnemonic Discrimination Task.
//!
//! Everything in this crate is pure task logic: stimulus classification from
//! the filename encoding, subject-seeded presentation order, the per-trial
//! response-window state machine, the recognition score matrix, and the
//! derived discrimination metrics. Rendering, input, gaze tracking, and the
//! transcript file are collaborator traits implemented elsewhere; the crate
//! itself performs no I/O and never reads the wall clock unless handed one.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TaskError {
    #[error("malformed stimulus name: {0}")]
    MalformedStimulusName(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("renderer error: {0}")]
    Renderer(String),
    #[error("transcript error: {0}")]
    Transcript(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Valence {
    Negative,
    Neutral,
    Positive,
}

impl Valence {
    pub const ALL: [Self; 3] = [Self::Negative, Self::Neutral, Self::Positive];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Negative => "negative",
            Self::Neutral => "neutral",
            Self::Positive => "positive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "negative" => Some(Self::Negative),
            "neutral" => Some(Self::Neutral),
            "positive" => Some(Self::Positive),
            _ => None,
        }
    }

    /// Three-letter label used in trial-type strings and metric lines.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Negative => "Neg",
            Self::Neutral => "Neu",
            Self::Positive => "Pos",
        }
    }

    /// Full name used in the LDI metric lines of the transcript.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Negative => "Negative",
            Self::Neutral => "Neutral",
            Self::Positive => "Positive",
        }
    }

    /// Valence channel of a leading stimulus digit: 1/4/7 negative,
    /// 2/5/8 neutral, 3/6/9 positive.
    #[must_use]
    pub fn from_leading_digit(digit: u32) -> Option<Self> {
        if !(1..=9).contains(&digit) {
            return None;
        }
        match digit % 3 {
            1 => Some(Self::Negative),
            2 => Some(Self::Neutral),
            _ => Some(Self::Positive),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityTier {
    Low,
    High,
}

impl SimilarityTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

/// Lure variant letter from the stimulus filename. `A` marks the studied
/// original; the remaining letters are test-phase variants paired b/d = low
/// similarity, c/e = high similarity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LureMarker {
    A,
    B,
    C,
    D,
    E,
}

impl LureMarker {
    #[must_use]
    pub fn from_char(value: char) -> Option<Self> {
        match value {
            'a' => Some(Self::A),
            'b' => Some(Self::B),
            'c' => Some(Self::C),
            'd' => Some(Self::D),
            'e' => Some(Self::E),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_char(self) -> char {
        match self {
            Self::A => 'a',
            Self::B => 'b',
            Self::C => 'c',
            Self::D => 'd',
            Self::E => 'e',
        }
    }

    /// Similarity tier of the variant; the studied original has none.
    #[must_use]
    pub fn tier(self) -> Option<SimilarityTier> {
        match self {
            Self::A => None,
            Self::B | Self::D => Some(SimilarityTier::Low),
            Self::C | Self::E => Some(SimilarityTier::High),
        }
    }
}

/// Trial type as it appears in the transcript's `TrialType` column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrialType {
    Lure(LureMarker),
    Repeat(Valence),
    Foil(Valence),
}

impl TrialType {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Lure(LureMarker::A) => "LureA",
            Self::Lure(LureMarker::B) => "LureB",
            Self::Lure(LureMarker::C) => "LureC",
            Self::Lure(LureMarker::D) => "LureD",
            Self::Lure(LureMarker::E) => "LureE",
            Self::Repeat(Valence::Negative) => "R-Neg",
            Self::Repeat(Valence::Neutral) => "R-Neu",
            Self::Repeat(Valence::Positive) => "R-Pos",
            Self::Foil(Valence::Negative) => "F-Neg",
            Self::Foil(Valence::Neutral) => "F-Neu",
            Self::Foil(Valence::Positive) => "F-Pos",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LureA" => Some(Self::Lure(LureMarker::A)),
            "LureB" => Some(Self::Lure(LureMarker::B)),
            "LureC" => Some(Self::Lure(LureMarker::C)),
            "LureD" => Some(Self::Lure(LureMarker::D)),
            "LureE" => Some(Self::Lure(LureMarker::E)),
            "R-Neg" => Some(Self::Repeat(Valence::Negative)),
            "R-Neu" => Some(Self::Repeat(Valence::Neutral)),
            "R-Pos" => Some(Self::Repeat(Valence::Positive)),
            "F-Neg" => Some(Self::Foil(Valence::Negative)),
            "F-Neu" => Some(Self::Foil(Valence::Neutral)),
            "F-Pos" => Some(Self::Foil(Valence::Positive)),
            _ => None,
        }
    }
}

/// Experimental category of a stimulus, refined from its trial type.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Category {
    Encoding,
    Lure(SimilarityTier),
    Repeat,
    Foil,
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StimulusDescriptor {
    pub id: String,
    pub valence: Valence,
    pub trial_type: TrialType,
}

impl StimulusDescriptor {
    #[must_use]
    pub fn category(&self) -> Category {
        match self.trial_type {
            TrialType::Lure(marker) => match marker.tier() {
                None => Category::Encoding,
                Some(tier) => Category::Lure(tier),
            },
            TrialType::Repeat(_) => Category::Repeat,
            TrialType::Foil(_) => Category::Foil,
        }
    }

    /// Study items are the encoding originals plus every repeat.
    #[must_use]
    pub fn is_study_item(&self) -> bool {
        matches!(
            self.trial_type,
            TrialType::Lure(LureMarker::A) | TrialType::Repeat(_)
        )
    }

    /// Everything except the encoding originals is shown at test.
    #[must_use]
    pub fn is_test_item(&self) -> bool {
        !matches!(self.trial_type, TrialType::Lure(LureMarker::A))
    }

    /// Leading digit of the filename convention, reconstructed from the
    /// classified valence and trial type. Inverse of [`classify`]'s digit
    /// channel; the transcript's test-phase `Valence` column carries it.
    #[must_use]
    pub fn leading_digit(&self) -> char {
        leading_digit(self.trial_type, self.valence)
    }
}

#[must_use]
pub fn leading_digit(trial_type: TrialType, valence: Valence) -> char {
    let base = match trial_type {
        TrialType::Lure(_) => 0,
        TrialType::Repeat(_) => 3,
        TrialType::Foil(_) => 6,
    };
    let offset = match valence {
        Valence::Negative => 1,
        Valence::Neutral => 2,
        Valence::Positive => 3,
    };
    char::from_digit(base + offset, 10).unwrap_or('0')
}

/// Classifies a stimulus filename into its experimental descriptor.
///
/// The stem's leading digit selects the valence channel (1-3 lures, 4-6
/// repeats, 7-9 foils); lure stems additionally end with a variant letter
/// a-e. Classification is total over well-formed names and deterministic.
///
/// # Errors
/// Returns [`TaskError::MalformedStimulusName`] when the name does not
/// follow the convention: empty stem, leading character not a digit 1-9, a
/// lure digit without a variant letter, or a repeat/foil digit combined
/// with one (ambiguous double marker).
pub fn classify(filename: &str) -> Result<StimulusDescriptor, TaskError> {
    let malformed = || TaskError::MalformedStimulusName(filename.to_string());
    let stem = filename
        .rsplit_once('.')
        .map_or(filename, |(stem, _ext)| stem);

    let lead = stem.chars().next().ok_or_else(malformed)?;
    let digit = lead.to_digit(10).ok_or_else(malformed)?;
    let valence = Valence::from_leading_digit(digit).ok_or_else(malformed)?;

    let marker = if stem.chars().count() > 1 {
        stem.chars().last().and_then(LureMarker::from_char)
    } else {
        None
    };

    let trial_type = match digit {
        1..=3 => TrialType::Lure(marker.ok_or_else(malformed)?),
        4..=6 => {
            if marker.is_some() {
                return Err(malformed());
            }
            TrialType::Repeat(valence)
        }
        _ => {
            if marker.is_some() {
                return Err(malformed());
            }
            TrialType::Foil(valence)
        }
    };

    Ok(StimulusDescriptor {
        id: filename.to_string(),
        valence,
        trial_type,
    })
}

/// Classified stimulus-set directory listing. Malformed names are excluded
/// from the session rather than failing it, and reported alongside.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StimulusInventory {
    pub stimuli: Vec<StimulusDescriptor>,
    pub excluded: Vec<String>,
}

/// Classifies a directory listing. Only `.jpg` entries count as stimuli;
/// anything else is ignored outright.
pub fn classify_listing<I, S>(names: I) -> StimulusInventory
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut inventory = StimulusInventory::default();
    for name in names {
        let name = name.as_ref();
        if !name.ends_with(".jpg") {
            continue;
        }
        match classify(name) {
            Ok(descriptor) => inventory.stimuli.push(descriptor),
            Err(_) => inventory.excluded.push(name.to_string()),
        }
    }
    inventory
}

#[must_use]
pub fn build_study_set(stimuli: &[StimulusDescriptor]) -> Vec<StimulusDescriptor> {
    stimuli
        .iter()
        .filter(|s| s.is_study_item())
        .cloned()
        .collect()
}

#[must_use]
pub fn build_test_set(stimuli: &[StimulusDescriptor]) -> Vec<StimulusDescriptor> {
    stimuli
        .iter()
        .filter(|s| s.is_test_item())
        .cloned()
        .collect()
}

/// Uniform random permutation of a phase set, drawn from the session's
/// subject-seeded generator. The input is copied, never mutated, so the
/// same seed and set always replay the same order.
#[must_use]
pub fn presentation_order(
    set: &[StimulusDescriptor],
    rng: &mut StdRng,
) -> Vec<StimulusDescriptor> {
    let mut order: Vec<StimulusDescriptor> = set.to_vec();
    // Fisher-Yates, high index down, one swap per draw.
    for i in (1..order.len()).rev() {
        let j = rng.gen_range(0..=i);
        order.swap(i, j);
    }
    order
}

/// Study and test presentation orders exactly as a session for this subject
/// draws them: one generator seeded by the subject id, study order first,
/// then test order from the same stream.
#[must_use]
pub fn session_orders(
    subject_id: u32,
    stimuli: &[StimulusDescriptor],
) -> (Vec<StimulusDescriptor>, Vec<StimulusDescriptor>) {
    let mut rng = StdRng::seed_from_u64(u64::from(subject_id));
    let study = presentation_order(&build_study_set(stimuli), &mut rng);
    let test = presentation_order(&build_test_set(stimuli), &mut rng);
    (study, test)
}

/// Keys the task reacts to. Digits double as valence ratings at study and
/// old/new choices at test; space pauses, escape aborts.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Key {
    Digit1,
    Digit2,
    Digit3,
    Space,
    Escape,
}

impl Key {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Digit1 => "1",
            Self::Digit2 => "2",
            Self::Digit3 => "3",
            Self::Space => "space",
            Self::Escape => "escape",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "1" => Some(Self::Digit1),
            "2" => Some(Self::Digit2),
            "3" => Some(Self::Digit3),
            "space" => Some(Self::Space),
            "escape" => Some(Self::Escape),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_response_digit(self) -> bool {
        matches!(self, Self::Digit1 | Self::Digit2 | Self::Digit3)
    }
}

/// Recognition choice at test: key 1 calls a stimulus old, key 2 new.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Recognition {
    Old,
    New,
}

impl Recognition {
    #[must_use]
    pub fn from_key(key: Key) -> Option<Self> {
        match key {
            Key::Digit1 => Some(Self::Old),
            Key::Digit2 => Some(Self::New),
            _ => None,
        }
    }
}

pub const STUDY_KEYS: [Key; 5] = [
    Key::Digit1,
    Key::Digit2,
    Key::Digit3,
    Key::Space,
    Key::Escape,
];
pub const TEST_KEYS: [Key; 4] = [Key::Digit1, Key::Digit2, Key::Space, Key::Escape];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Study,
    Test,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Study => "Study",
            Self::Test => "Test",
        }
    }
}

/// One transcript row: the immutable outcome of a presented trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    pub trial_num: u32,
    pub stimulus_id: String,
    pub trial_type: TrialType,
    /// Present on test rows only; study rows carry no valence column.
    pub valence: Option<Valence>,
    /// `None` when the response window elapsed without a qualifying key.
    pub response: Option<Key>,
    /// Seconds from stimulus onset; 0.0 when no response.
    pub reaction_time: f64,
}

impl TrialRecord {
    /// Keypress column text: the digit label, or empty for no response.
    #[must_use]
    pub fn keypress_label(&self) -> &'static str {
        self.response.map_or("", Key::as_str)
    }
}

/// Session timing parameters, validated before a run starts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    #[serde(default = "default_study_trial_duration")]
    pub study_trial_duration_s: f64,
    #[serde(default = "default_test_trial_duration")]
    pub test_trial_duration_s: f64,
    #[serde(default = "default_inter_trial_interval")]
    pub inter_trial_interval_s: f64,
    /// Fraction of the smaller window dimension the image may fill.
    #[serde(default = "default_image_fill")]
    pub image_fill: f64,
}

fn default_study_trial_duration() -> f64 {
    2.5
}

fn default_test_trial_duration() -> f64 {
    2.5
}

fn default_inter_trial_interval() -> f64 {
    0.5
}

fn default_image_fill() -> f64 {
    0.8
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl TaskConfig {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            study_trial_duration_s: default_study_trial_duration(),
            test_trial_duration_s: default_test_trial_duration(),
            inter_trial_interval_s: default_inter_trial_interval(),
            image_fill: default_image_fill(),
        }
    }

    /// Validates timing bounds.
    ///
    /// # Errors
    /// Returns [`TaskError::Configuration`] when a duration is not a
    /// positive finite number, the inter-trial interval is negative, or
    /// `image_fill` falls outside `(0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), TaskError> {
        for (name, value) in [
            ("study_trial_duration_s", self.study_trial_duration_s),
            ("test_trial_duration_s", self.test_trial_duration_s),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(TaskError::Configuration(format!(
                    "{name} MUST be a positive number of seconds"
                )));
            }
        }

        if !self.inter_trial_interval_s.is_finite() || self.inter_trial_interval_s < 0.0 {
            return Err(TaskError::Configuration(
                "inter_trial_interval_s MUST be >= 0".to_string(),
            ));
        }

        if !self.image_fill.is_finite() || self.image_fill <= 0.0 || self.image_fill > 1.0 {
            return Err(TaskError::Configuration(
                "image_fill MUST be in (0.0, 1.0]".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a config from JSON; absent fields keep their
    /// standard values.
    ///
    /// # Errors
    /// Returns [`TaskError::Configuration`] when decoding fails or decoded
    /// values violate the bounds above.
    pub fn from_json(value: &Value) -> Result<Self, TaskError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|err| TaskError::Configuration(format!("invalid config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}

/// Trial clock abstraction. Interior mutability lets a simulated renderer
/// hold a handle to the same clock the runner reads, so tests advance time
/// instead of sleeping.
pub trait Clock {
    fn restart(&self);
    /// Seconds since the last restart.
    fn elapsed(&self) -> f64;
}

/// Wall clock backed by `Instant`, for real presentation backends.
#[derive(Debug)]
pub struct WallClock {
    started: Cell<Instant>,
}

impl WallClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Cell::new(Instant::now()),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn restart(&self) {
        self.started.set(Instant::now());
    }

    fn elapsed(&self) -> f64 {
        self.started.get().elapsed().as_secs_f64()
    }
}

/// Manually advanced clock shared between the runner and a simulated
/// renderer; `flip` and `wait` move time forward.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<f64>,
    origin: Cell<f64>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, seconds: f64) {
        self.now.set(self.now.get() + seconds.max(0.0));
    }
}

impl Clock for ManualClock {
    fn restart(&self) {
        self.origin.set(self.now.get());
    }

    fn elapsed(&self) -> f64 {
        self.now.get() - self.origin.get()
    }
}

/// A keypress observed during a trial, timestamped on the trial clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyEvent {
    pub key: Key,
    pub at: f64,
}

/// Presentation and input collaborator. A real backend draws to a window
/// and polls a keyboard; the simulated one advances a manual clock and
/// plays back seeded responses.
pub trait Renderer {
    /// Draws the named stimulus scaled to `fill` of the window.
    ///
    /// # Errors
    /// Returns [`TaskError::Renderer`] when the backend cannot present.
    fn show_image(&mut self, stimulus_id: &str, fill: f64) -> Result<(), TaskError>;

    /// Draws a text screen (instructions, pause notice, fixation cross).
    ///
    /// # Errors
    /// Returns [`TaskError::Renderer`] when the backend cannot present.
    fn show_text(&mut self, text: &str) -> Result<(), TaskError>;

    /// Presents the drawn frame; blocks for at most one refresh interval.
    ///
    /// # Errors
    /// Returns [`TaskError::Renderer`] when the backend cannot present.
    fn flip(&mut self) -> Result<(), TaskError>;

    /// Reports the oldest pending key among `valid`, timestamped against
    /// `clock`, or `None` when no qualifying key is pending.
    ///
    /// # Errors
    /// Returns [`TaskError::Renderer`] when the input source failed.
    fn poll_key(&mut self, valid: &[Key], clock: &dyn Clock)
        -> Result<Option<KeyEvent>, TaskError>;

    /// Idles for the given duration (inter-trial interval, poll cadence).
    ///
    /// # Errors
    /// Returns [`TaskError::Renderer`] when the backend cannot wait.
    fn wait(&mut self, seconds: f64) -> Result<(), TaskError>;
}

/// Optional gaze-tracking collaborator. The default implementation of every
/// method is a no-op, so a tracker only overrides what it needs.
pub trait GazeHook {
    fn session_started(&mut self, _subject_id: u32) {}
    fn trial_started(&mut self, _phase: Phase, _trial_num: u32, _stimulus_id: &str) {}
    fn trial_ended(&mut self, _phase: Phase, _trial_num: u32) {}
    fn session_ended(&mut self) {}
}

/// Transcript boundary consumed by the session. The file-backed
/// implementation lives in `emodt-transcript`.
pub trait TranscriptSink {
    /// # Errors
    /// Returns [`TaskError::Transcript`] when the sink cannot be written.
    fn write_header(
        &mut self,
        subject_id: u32,
        stimulus_set: &str,
        config: &TaskConfig,
    ) -> Result<(), TaskError>;

    /// # Errors
    /// Returns [`TaskError::Transcript`] when the sink cannot be written.
    fn phase_started(&mut self, phase: Phase) -> Result<(), TaskError>;

    /// # Errors
    /// Returns [`TaskError::Transcript`] when the sink cannot be written.
    fn phase_skipped(&mut self, phase: Phase) -> Result<(), TaskError>;

    /// # Errors
    /// Returns [`TaskError::Transcript`] when the sink cannot be written.
    fn phase_aborted(&mut self, phase: Phase) -> Result<(), TaskError>;

    /// # Errors
    /// Returns [`TaskError::Transcript`] when the sink cannot be written.
    fn write_trial_row(&mut self, phase: Phase, record: &TrialRecord) -> Result<(), TaskError>;

    /// # Errors
    /// Returns [`TaskError::Transcript`] when the sink cannot be written.
    fn write_metrics(&mut self, metrics: &DiscriminationMetrics) -> Result<(), TaskError>;

    /// # Errors
    /// Returns [`TaskError::Transcript`] when the sink cannot be flushed.
    fn close(&mut self) -> Result<(), TaskError>;
}

/// Outcome of a single presented trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrialOutcome {
    Response { key: Key, reaction_time: f64 },
    NoResponse,
    /// Space was pressed; the experiment suspended and resumed, and the
    /// same trial must be re-run rather than recorded.
    Paused,
    /// Escape was pressed; the phase stops iterating.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseGate {
    Proceed,
    Skip,
}

const GATE_POLL_S: f64 = 0.05;
const RESUME_POLL_S: f64 = 0.05;
const PAUSE_MESSAGE: &str = "Experiment Paused\n\nPress space to continue";
const FIXATION_CROSS: &str = "+";

/// Per-trial response-window state machine.
///
/// A trial moves Presenting -> ResponseWindow -> Closed -> Recorded. The
/// window closes exactly at the trial duration: keys are polled before the
/// expiry check on every frame and accepted while their timestamp is within
/// the duration, inclusive, so a response in the expiry tick still counts.
/// Only the first qualifying key is kept; later events are drained and
/// dropped. Reaction time is measured from stimulus onset, not from flip
/// completion.
pub struct TrialRunner<'a> {
    renderer: &'a mut dyn Renderer,
    clock: &'a dyn Clock,
    config: TaskConfig,
}

impl<'a> TrialRunner<'a> {
    pub fn new(renderer: &'a mut dyn Renderer, clock: &'a dyn Clock, config: TaskConfig) -> Self {
        Self {
            renderer,
            clock,
            config,
        }
    }

    /// Presents the phase instructions and waits for space (proceed) or
    /// escape (skip the phase).
    ///
    /// # Errors
    /// Returns a renderer error when the backend fails.
    pub fn phase_gate(&mut self, instructions: &str) -> Result<PhaseGate, TaskError> {
        self.renderer.show_text(instructions)?;
        self.renderer.flip()?;
        loop {
            if let Some(event) = self
                .renderer
                .poll_key(&[Key::Space, Key::Escape], self.clock)?
            {
                return Ok(match event.key {
                    Key::Escape => PhaseGate::Skip,
                    _ => PhaseGate::Proceed,
                });
            }
            self.renderer.wait(GATE_POLL_S)?;
        }
    }

    /// Runs one trial of `duration` seconds and reports its outcome. The
    /// fixation cross and inter-trial interval follow every completed
    /// window; escape returns immediately and pause suspends until space.
    ///
    /// # Errors
    /// Returns a renderer error when the backend fails mid-trial.
    pub fn run(
        &mut self,
        stimulus: &StimulusDescriptor,
        duration: f64,
        valid: &[Key],
    ) -> Result<TrialOutcome, TaskError> {
        self.clock.restart();
        let mut first: Option<KeyEvent> = None;

        loop {
            self.renderer.show_image(&stimulus.id, self.config.image_fill)?;
            self.renderer.flip()?;

            if let Some(event) = self.renderer.poll_key(valid, self.clock)? {
                match event.key {
                    Key::Escape => return Ok(TrialOutcome::Aborted),
                    Key::Space => {
                        self.pause()?;
                        return Ok(TrialOutcome::Paused);
                    }
                    _ => {
                        if first.is_none() && event.at <= duration {
                            first = Some(event);
                        }
                    }
                }
            }

            if self.clock.elapsed() >= duration {
                break;
            }
        }

        self.renderer.show_text(FIXATION_CROSS)?;
        self.renderer.flip()?;
        self.renderer.wait(self.config.inter_trial_interval_s)?;

        Ok(first.map_or(TrialOutcome::NoResponse, |event| TrialOutcome::Response {
            key: event.key,
            reaction_time: event.at,
        }))
    }

    fn pause(&mut self) -> Result<(), TaskError> {
        self.renderer.show_text(PAUSE_MESSAGE)?;
        self.renderer.flip()?;
        loop {
            if let Some(event) = self.renderer.poll_key(&[Key::Space], self.clock)? {
                if event.key == Key::Space {
                    return Ok(());
                }
            }
            self.renderer.wait(RESUME_POLL_S)?;
        }
    }
}

/// Score matrix row a scorable test trial lands in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScoreCategory {
    LowSimLure,
    HighSimLure,
    Repeat,
    Foil,
}

impl ScoreCategory {
    pub const ALL: [Self; 4] = [Self::LowSimLure, Self::HighSimLure, Self::Repeat, Self::Foil];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowSimLure => "low_sim_lure",
            Self::HighSimLure => "high_sim_lure",
            Self::Repeat => "repeat",
            Self::Foil => "foil",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CellCounts {
    pub old_calls: u32,
    pub new_calls: u32,
}

impl CellCounts {
    #[must_use]
    pub fn total(self) -> u32 {
        self.old_calls + self.new_calls
    }
}

/// A derived metric plus whether any constituent proportion had an empty
/// cell and was forced to zero by policy. The flag keeps a policy zero
/// distinguishable from a genuinely computed one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub value: f64,
    pub insufficient_data: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ValenceMetrics {
    pub ldi_low_sim: Metric,
    pub ldi_high_sim: Metric,
    pub ldi_collapsed: Metric,
    pub recognition_memory: Metric,
}

/// The nine Lure Discrimination Index values and three corrected
/// recognition-memory values derived from the final score matrix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DiscriminationMetrics {
    pub negative: ValenceMetrics,
    pub neutral: ValenceMetrics,
    pub positive: ValenceMetrics,
}

impl DiscriminationMetrics {
    #[must_use]
    pub fn for_valence(&self, valence: Valence) -> &ValenceMetrics {
        match valence {
            Valence::Negative => &self.negative,
            Valence::Neutral => &self.neutral,
            Valence::Positive => &self.positive,
        }
    }
}

/// Accumulates old/new recognition calls per (valence, category) cell over
/// the test phase, then derives the discrimination metrics.
///
/// Every cell exists from session start; exactly one cell changes per
/// scorable trial, so the matrix total always equals the number of scorable
/// responses observed.
#[derive(Debug, Clone)]
pub struct ResponseScorer {
    cells: BTreeMap<(Valence, ScoreCategory), CellCounts>,
}

impl Default for ResponseScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseScorer {
    #[must_use]
    pub fn new() -> Self {
        let mut cells = BTreeMap::new();
        for valence in Valence::ALL {
            for category in ScoreCategory::ALL {
                cells.insert((valence, category), CellCounts::default());
            }
        }
        Self { cells }
    }

    /// Matrix row a trial type is scored in. Encoding originals (`LureA`)
    /// never appear at test and have no row.
    #[must_use]
    pub fn score_category(trial_type: TrialType) -> Option<ScoreCategory> {
        match trial_type {
            TrialType::Lure(marker) => marker.tier().map(|tier| match tier {
                SimilarityTier::Low => ScoreCategory::LowSimLure,
                SimilarityTier::High => ScoreCategory::HighSimLure,
            }),
            TrialType::Repeat(_) => Some(ScoreCategory::Repeat),
            TrialType::Foil(_) => Some(ScoreCategory::Foil),
        }
    }

    /// Tallies one test trial. A no-op unless the response is a recognition
    /// choice (old/new) and the trial type has a score row.
    pub fn record(&mut self, trial_type: TrialType, response: Option<Key>, valence: Valence) {
        let Some(call) = response.and_then(Recognition::from_key) else {
            return;
        };
        let Some(category) = Self::score_category(trial_type) else {
            return;
        };

        let cell = self.cells.entry((valence, category)).or_default();
        match call {
            Recognition::Old => cell.old_calls += 1,
            Recognition::New => cell.new_calls += 1,
        }
    }

    #[must_use]
    pub fn counts(&self, valence: Valence, category: ScoreCategory) -> CellCounts {
        self.cells
            .get(&(valence, category))
            .copied()
            .unwrap_or_default()
    }

    /// Total scorable responses accumulated across all cells.
    #[must_use]
    pub fn scored_trials(&self) -> u32 {
        self.cells.values().map(|cell| cell.total()).sum()
    }

    /// Derives the final metrics. Never fails and never yields NaN or
    /// infinity: an empty cell contributes a proportion of zero and sets
    /// `insufficient_data` on every metric it feeds.
    #[must_use]
    pub fn finalize(&self) -> DiscriminationMetrics {
        DiscriminationMetrics {
            negative: self.valence_metrics(Valence::Negative),
            neutral: self.valence_metrics(Valence::Neutral),
            positive: self.valence_metrics(Valence::Positive),
        }
    }

    fn valence_metrics(&self, valence: Valence) -> ValenceMetrics {
        let low = self.counts(valence, ScoreCategory::LowSimLure);
        let high = self.counts(valence, ScoreCategory::HighSimLure);
        let repeat = self.counts(valence, ScoreCategory::Repeat);
        let foil = self.counts(valence, ScoreCategory::Foil);

        let (low_old, low_empty) = proportion(low, Recognition::Old);
        let (high_old, high_empty) = proportion(high, Recognition::Old);
        let (repeat_old, repeat_empty) = proportion(repeat, Recognition::Old);
        let (repeat_new, _) = proportion(repeat, Recognition::New);
        let (foil_old, foil_empty) = proportion(foil, Recognition::Old);

        ValenceMetrics {
            ldi_low_sim: Metric {
                value: low_old - repeat_new,
                insufficient_data: low_empty || repeat_empty,
            },
            ldi_high_sim: Metric {
                value: high_old - repeat_new,
                insufficient_data: high_empty || repeat_empty,
            },
            ldi_collapsed: Metric {
                value: (low_old + high_old) / 2.0 - repeat_new,
                insufficient_data: low_empty || high_empty || repeat_empty,
            },
            recognition_memory: Metric {
                value: repeat_old - foil_old,
                insufficient_data: repeat_empty || foil_empty,
            },
        }
    }
}

/// Old-/new-call proportion of a cell; `(0.0, true)` when the cell is
/// empty, by the zero-denominator policy.
fn proportion(cell: CellCounts, call: Recognition) -> (f64, bool) {
    let total = cell.total();
    if total == 0 {
        return (0.0, true);
    }
    let count = match call {
        Recognition::Old => cell.old_calls,
        Recognition::New => cell.new_calls,
    };
    (f64::from(count) / f64::from(total), false)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Completed,
    Aborted,
    Skipped,
}

impl PhaseOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseSummary {
    pub outcome: PhaseOutcome,
    pub trials: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionReport {
    pub run_id: Ulid,
    pub subject_id: u32,
    pub stimulus_set: String,
    pub config: TaskConfig,
    pub study: PhaseSummary,
    pub test: PhaseSummary,
    pub excluded_stimuli: Vec<String>,
    pub scored_trials: u32,
    pub metrics: DiscriminationMetrics,
}

const STUDY_INSTRUCTIONS: &str = "1 = Negative   2 = Neutral   3 = Positive\n\n\
     Rate each image as it appears.\n\nPress space to begin";
const TEST_INSTRUCTIONS: &str = "Have you seen this EXACT image before?\n\n\
     1 = Old   2 = New\n\nPress space to begin";

/// One run of the task for one subject and stimulus set.
///
/// Owns the only mutable state of the session: the subject-seeded generator
/// (study order, then test order, drawn in sequence) and the score matrix.
/// Execution is a single cooperative loop; escape is observed only at poll
/// points and ends the current phase, never the finalization.
pub struct Session {
    subject_id: u32,
    stimulus_set: String,
    config: TaskConfig,
    rng: StdRng,
    scorer: ResponseScorer,
}

impl Session {
    /// # Errors
    /// Returns [`TaskError::Configuration`] when the config fails
    /// validation or the stimulus-set label is not alphanumeric.
    pub fn new(subject_id: u32, stimulus_set: &str, config: TaskConfig) -> Result<Self, TaskError> {
        config.validate()?;
        if stimulus_set.is_empty() || !stimulus_set.chars().all(char::is_alphanumeric) {
            return Err(TaskError::Configuration(format!(
                "stimulus set label MUST be alphanumeric, got {stimulus_set:?}"
            )));
        }

        Ok(Self {
            subject_id,
            stimulus_set: stimulus_set.to_string(),
            config,
            rng: StdRng::seed_from_u64(u64::from(subject_id)),
            scorer: ResponseScorer::new(),
        })
    }

    /// Runs both phases against the given collaborators and returns the
    /// session report. A skipped or aborted phase still leads to metric
    /// finalization and transcript closure with whatever was collected.
    ///
    /// # Errors
    /// Returns renderer or transcript errors from the collaborators; task
    /// outcomes (no response, pause, abort) are data, not errors.
    pub fn run(
        mut self,
        inventory: &StimulusInventory,
        renderer: &mut dyn Renderer,
        clock: &dyn Clock,
        transcript: &mut dyn TranscriptSink,
        mut gaze: Option<&mut dyn GazeHook>,
    ) -> Result<SessionReport, TaskError> {
        transcript.write_header(self.subject_id, &self.stimulus_set, &self.config)?;
        if let Some(hook) = gaze.as_deref_mut() {
            hook.session_started(self.subject_id);
        }

        let study_order = presentation_order(&build_study_set(&inventory.stimuli), &mut self.rng);
        let test_order = presentation_order(&build_test_set(&inventory.stimuli), &mut self.rng);

        let study = self.run_phase(
            Phase::Study,
            &study_order,
            renderer,
            clock,
            transcript,
            &mut gaze,
        )?;
        let test = self.run_phase(
            Phase::Test,
            &test_order,
            renderer,
            clock,
            transcript,
            &mut gaze,
        )?;

        let metrics = self.scorer.finalize();
        transcript.write_metrics(&metrics)?;
        transcript.close()?;
        if let Some(hook) = gaze.as_deref_mut() {
            hook.session_ended();
        }

        Ok(SessionReport {
            run_id: Ulid::new(),
            subject_id: self.subject_id,
            stimulus_set: self.stimulus_set.clone(),
            config: self.config,
            study,
            test,
            excluded_stimuli: inventory.excluded.clone(),
            scored_trials: self.scorer.scored_trials(),
            metrics,
        })
    }

    fn run_phase(
        &mut self,
        phase: Phase,
        order: &[StimulusDescriptor],
        renderer: &mut dyn Renderer,
        clock: &dyn Clock,
        transcript: &mut dyn TranscriptSink,
        gaze: &mut Option<&mut dyn GazeHook>,
    ) -> Result<PhaseSummary, TaskError> {
        let (duration, valid, instructions): (f64, &[Key], &str) = match phase {
            Phase::Study => (
                self.config.study_trial_duration_s,
                &STUDY_KEYS,
                STUDY_INSTRUCTIONS,
            ),
            Phase::Test => (
                self.config.test_trial_duration_s,
                &TEST_KEYS,
                TEST_INSTRUCTIONS,
            ),
        };

        let mut runner = TrialRunner::new(renderer, clock, self.config);

        if runner.phase_gate(instructions)? == PhaseGate::Skip {
            transcript.phase_skipped(phase)?;
            return Ok(PhaseSummary {
                outcome: PhaseOutcome::Skipped,
                trials: 0,
            });
        }
        transcript.phase_started(phase)?;

        let mut completed = 0_u32;
        for (index, stimulus) in order.iter().enumerate() {
            let trial_num = u32::try_from(index + 1).unwrap_or(u32::MAX);
            if let Some(hook) = gaze.as_deref_mut() {
                hook.trial_started(phase, trial_num, &stimulus.id);
            }

            // A paused trial re-runs the same stimulus until it completes.
            let outcome = loop {
                match runner.run(stimulus, duration, valid)? {
                    TrialOutcome::Paused => {}
                    outcome => break outcome,
                }
            };

            if outcome == TrialOutcome::Aborted {
                transcript.phase_aborted(phase)?;
                return Ok(PhaseSummary {
                    outcome: PhaseOutcome::Aborted,
                    trials: completed,
                });
            }

            let (response, reaction_time) = match outcome {
                TrialOutcome::Response { key, reaction_time } => (Some(key), reaction_time),
                _ => (None, 0.0),
            };
            let record = TrialRecord {
                trial_num,
                stimulus_id: stimulus.id.clone(),
                trial_type: stimulus.trial_type,
                valence: (phase == Phase::Test).then_some(stimulus.valence),
                response,
                reaction_time,
            };
            transcript.write_trial_row(phase, &record)?;

            if phase == Phase::Test {
                self.scorer
                    .record(stimulus.trial_type, response, stimulus.valence);
            }

            completed += 1;
            if let Some(hook) = gaze.as_deref_mut() {
                hook.trial_ended(phase, trial_num);
            }
        }

        Ok(PhaseSummary {
            outcome: PhaseOutcome::Completed,
            trials: completed,
        })
    }
}

const SIM_FRAME_INTERVAL_S: f64 = 1.0 / 60.0;

/// Headless renderer driving a [`ManualClock`]: frames advance simulated
/// time and a seeded responder stands in for the participant. Used by the
/// CLI's simulated runs and by tests; sessions with the same seeds replay
/// identically.
pub struct SimulatedRenderer {
    clock: Rc<ManualClock>,
    rng: StdRng,
    response_rate: f64,
    current_stimulus: Option<String>,
    at_trial_boundary: bool,
    planned_at: Option<f64>,
    delivered: bool,
}

impl SimulatedRenderer {
    /// # Errors
    /// Returns [`TaskError::Configuration`] when `response_rate` is outside
    /// `[0.0, 1.0]`.
    pub fn new(
        clock: Rc<ManualClock>,
        responder_seed: u64,
        response_rate: f64,
    ) -> Result<Self, TaskError> {
        if !(0.0..=1.0).contains(&response_rate) || !response_rate.is_finite() {
            return Err(TaskError::Configuration(
                "response_rate MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        Ok(Self {
            clock,
            rng: StdRng::seed_from_u64(responder_seed),
            response_rate,
            current_stimulus: None,
            at_trial_boundary: true,
            planned_at: None,
            delivered: false,
        })
    }
}

impl Renderer for SimulatedRenderer {
    fn show_image(&mut self, stimulus_id: &str, _fill: f64) -> Result<(), TaskError> {
        // A new trial begins when the stimulus changes or a text screen
        // (fixation, instructions) was shown since the last image frame.
        if self.current_stimulus.as_deref() != Some(stimulus_id) || self.at_trial_boundary {
            self.current_stimulus = Some(stimulus_id.to_string());
            self.at_trial_boundary = false;
            self.delivered = false;
            self.planned_at = self
                .rng
                .gen_bool(self.response_rate)
                .then(|| self.rng.gen_range(0.25..=2.0));
        }
        Ok(())
    }

    fn show_text(&mut self, _text: &str) -> Result<(), TaskError> {
        self.at_trial_boundary = true;
        Ok(())
    }

    fn flip(&mut self) -> Result<(), TaskError> {
        self.clock.advance(SIM_FRAME_INTERVAL_S);
        Ok(())
    }

    fn poll_key(
        &mut self,
        valid: &[Key],
        clock: &dyn Clock,
    ) -> Result<Option<KeyEvent>, TaskError> {
        let digits: Vec<Key> = valid
            .iter()
            .copied()
            .filter(|key| key.is_response_digit())
            .collect();

        // Gate and resume screens: acknowledge with the continue key.
        if digits.is_empty() {
            return Ok(Some(KeyEvent {
                key: Key::Space,
                at: clock.elapsed(),
            }));
        }

        match self.planned_at {
            Some(at) if !self.delivered && clock.elapsed() >= at => {
                self.delivered = true;
                let key = digits[self.rng.gen_range(0..digits.len())];
                Ok(Some(KeyEvent {
                    key,
                    at: clock.elapsed(),
                }))
            }
            _ => Ok(None),
        }
    }

    fn wait(&mut self, seconds: f64) -> Result<(), TaskError> {
        self.clock.advance(seconds);
        Ok(())
    }
}
