use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

const SET_A: &[&str] = &[
    "1001a.jpg",
    "1001b.jpg",
    "1001c.jpg",
    "2001a.jpg",
    "2001d.jpg",
    "3001a.jpg",
    "3001e.jpg",
    "4001.jpg",
    "5001.jpg",
    "6001.jpg",
    "7001.jpg",
    "8001.jpg",
    "9001.jpg",
];

fn emodt_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_emodt"))
}

fn emodt_output(logs: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(emodt_binary());
    command.arg("--logs").arg(logs);
    for arg in args {
        command.arg(arg);
    }
    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to execute emodt {args:?}: {err}"),
    }
}

fn temp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()))
}

fn seed_stimulus_set(root: &Path, set: &str, names: &[&str]) {
    let dir = root.join(format!("set{set}"));
    if let Err(err) = fs::create_dir_all(&dir) {
        panic!("failed to create stimulus dir {}: {err}", dir.display());
    }
    for name in names {
        if let Err(err) = File::create(dir.join(name)) {
            panic!("failed to seed stimulus {name}: {err}");
        }
    }
}

fn parse_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout json: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

#[test]
fn run_writes_a_transcript_and_score_replays_it() {
    let stimuli = temp_dir("emodt-stimuli");
    let logs = temp_dir("emodt-logs");
    seed_stimulus_set(&stimuli, "A", SET_A);
    let root = stimuli.to_string_lossy().into_owned();

    let run_output = emodt_output(
        &logs,
        &[
            "task",
            "run",
            "--subject",
            "999",
            "--set",
            "A",
            "--stimuli-root",
            &root,
            "--responder-seed",
            "11",
        ],
    );
    assert!(
        run_output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&run_output.stderr)
    );

    let transcript = logs.join("999_A_log.txt");
    assert!(transcript.is_file());
    let body = match fs::read_to_string(&transcript) {
        Ok(value) => value,
        Err(err) => panic!("failed to read transcript: {err}"),
    };
    assert!(body.starts_with("EmoDT Task: "));
    assert!(body.contains("Begin Study"));
    assert!(body.contains("Begin Test"));
    assert!(body.contains("RecMem-Pos:"));

    let score_output = emodt_output(
        &logs,
        &[
            "task",
            "score",
            "--log",
            &transcript.to_string_lossy(),
            "--json",
        ],
    );
    assert!(score_output.status.success());
    let payload = parse_json(&score_output);

    // Three encoding originals and three repeats study; everything but the
    // originals tests. The simulated participant never aborts, so every
    // trial leaves a row whether or not it was answered.
    assert_eq!(payload["subject_id"], serde_json::json!(999));
    assert_eq!(payload["stimulus_set"], serde_json::json!("A"));
    assert_eq!(payload["study"]["outcome"], serde_json::json!("completed"));
    assert_eq!(payload["study"]["trials"], serde_json::json!(6));
    assert_eq!(payload["test"]["outcome"], serde_json::json!("completed"));
    assert_eq!(payload["test"]["trials"], serde_json::json!(10));

    let _ = fs::remove_dir_all(&stimuli);
    let _ = fs::remove_dir_all(&logs);
}

#[test]
fn rerunning_a_subject_preserves_the_previous_transcript() {
    let stimuli = temp_dir("emodt-stimuli");
    let logs = temp_dir("emodt-logs");
    seed_stimulus_set(&stimuli, "A", SET_A);
    let root = stimuli.to_string_lossy().into_owned();
    let run_args = [
        "task",
        "run",
        "--subject",
        "999",
        "--set",
        "A",
        "--stimuli-root",
        root.as_str(),
    ];

    assert!(emodt_output(&logs, &run_args).status.success());
    assert!(emodt_output(&logs, &run_args).status.success());

    let entries = match fs::read_dir(&logs) {
        Ok(iter) => iter,
        Err(err) => panic!("failed to list log dir: {err}"),
    };
    let mut names = Vec::new();
    for entry in entries {
        match entry {
            Ok(value) => names.push(value.file_name().to_string_lossy().into_owned()),
            Err(err) => panic!("failed to list log dir: {err}"),
        }
    }

    assert!(names.iter().any(|name| name == "999_A_log.txt"));
    let old: Vec<&String> = names.iter().filter(|name| name.contains("_old")).collect();
    assert_eq!(old.len(), 1, "expected one preserved transcript: {names:?}");

    let _ = fs::remove_dir_all(&stimuli);
    let _ = fs::remove_dir_all(&logs);
}

#[test]
fn classify_rejects_a_malformed_stimulus_name() {
    let stimuli = temp_dir("emodt-stimuli");
    let logs = temp_dir("emodt-logs");
    seed_stimulus_set(&stimuli, "B", &["4001.jpg", "oops.jpg"]);
    let root = stimuli.to_string_lossy().into_owned();

    let output = emodt_output(
        &logs,
        &[
            "task",
            "classify",
            "--set",
            "B",
            "--stimuli-root",
            &root,
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("malformed"), "stderr={stderr}");
    assert!(stderr.contains("oops.jpg"), "stderr={stderr}");

    let _ = fs::remove_dir_all(&stimuli);
    let _ = fs::remove_dir_all(&logs);
}

#[test]
fn sequence_is_seed_stable_and_subject_sensitive() {
    let stimuli = temp_dir("emodt-stimuli");
    let logs = temp_dir("emodt-logs");
    seed_stimulus_set(&stimuli, "A", SET_A);
    let root = stimuli.to_string_lossy().into_owned();
    let sequence = |subject: &str| {
        let output = emodt_output(
            &logs,
            &[
                "task",
                "sequence",
                "--subject",
                subject,
                "--set",
                "A",
                "--stimuli-root",
                &root,
                "--phase",
                "test",
            ],
        );
        assert!(output.status.success());
        String::from_utf8_lossy(&output.stdout).into_owned()
    };

    let first = sequence("999");
    let second = sequence("999");
    let other = sequence("1000");

    assert!(!first.is_empty());
    assert_eq!(first, second);
    assert_ne!(first, other);

    let _ = fs::remove_dir_all(&stimuli);
    let _ = fs::remove_dir_all(&logs);
}

#[test]
fn run_json_report_is_well_formed() {
    let stimuli = temp_dir("emodt-stimuli");
    let logs = temp_dir("emodt-logs");
    seed_stimulus_set(&stimuli, "C", SET_A);
    let root = stimuli.to_string_lossy().into_owned();

    let output = emodt_output(
        &logs,
        &[
            "task",
            "run",
            "--subject",
            "7",
            "--set",
            "C",
            "--stimuli-root",
            &root,
            "--json",
        ],
    );
    assert!(output.status.success());
    let payload = parse_json(&output);

    assert_eq!(payload["subject_id"], serde_json::json!(7));
    assert_eq!(payload["stimulus_set"], serde_json::json!("C"));
    assert!(payload["run_id"].is_string());
    assert_eq!(payload["study"]["trials"], serde_json::json!(6));
    assert_eq!(payload["test"]["trials"], serde_json::json!(10));
    assert!(payload["metrics"]["negative"]["ldi_low_sim"]["value"].is_number());
    assert_eq!(payload["excluded_stimuli"], serde_json::json!([]));

    let _ = fs::remove_dir_all(&stimuli);
    let _ = fs::remove_dir_all(&logs);
}
