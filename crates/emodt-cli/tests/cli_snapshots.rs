use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use ulid::Ulid;

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

/// All-Negative test section with binary-exact proportions: low lures 3/4
/// old, high lures 1/2 old, repeats 3/4 old, foils 1/4 old.
const FIXTURE_TRANSCRIPT: &str = concat!(
    "EmoDT Task: 10:30:00 on 07-04-23\n",
    "Subject ID: 123\n",
    "Using set B\n",
    "Trial Duration (Study): 2.50\n",
    "Trial Duration (Test): 2.50\n",
    "ITI: 0.50\n",
    "\n",
    "\n\nBegin Study\n\n",
    "TrialNum,Image,TrialType,Keypress,RT\n",
    "1,1001a.jpg,LureA,1,0.55\n",
    "\n\nBegin Test\n\n",
    "TrialNum,Image,TrialType,Valence,Keypress,RT\n",
    "1,1001b.jpg,LureB,1,1,0.80\n",
    "2,1002b.jpg,LureB,1,1,0.70\n",
    "3,1003d.jpg,LureD,1,1,0.60\n",
    "4,1004d.jpg,LureD,1,2,0.50\n",
    "5,1005c.jpg,LureC,1,1,0.40\n",
    "6,1006e.jpg,LureE,1,2,0.90\n",
    "7,4001.jpg,R-Neg,4,1,0.30\n",
    "8,4002.jpg,R-Neg,4,1,0.20\n",
    "9,4003.jpg,R-Neg,4,1,0.10\n",
    "10,4004.jpg,R-Neg,4,2,0.60\n",
    "11,7001.jpg,F-Neg,7,1,0.70\n",
    "12,7002.jpg,F-Neg,7,2,0.80\n",
    "13,7003.jpg,F-Neg,7,2,0.90\n",
    "14,7004.jpg,F-Neg,7,2,1.00\n",
);

#[test]
fn snapshot_score_json() {
    let logs = temp_dir("emodt-logs");
    if let Err(err) = fs::create_dir_all(&logs) {
        panic!("failed to create log dir: {err}");
    }
    let transcript = logs.join("123_B_log.txt");
    if let Err(err) = fs::write(&transcript, FIXTURE_TRANSCRIPT) {
        panic!("failed to write fixture transcript: {err}");
    }

    let output = emodt_output(
        &logs,
        &[
            "task",
            "score",
            "--log",
            &transcript.to_string_lossy(),
            "--json",
        ],
    );
    assert!(
        output.status.success(),
        "score failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let snapshot = String::from_utf8_lossy(&output.stdout).into_owned();
    let expected = r#"{
  "subject_id": 123,
  "stimulus_set": "B",
  "study": {
    "outcome": "completed",
    "trials": 1
  },
  "test": {
    "outcome": "completed",
    "trials": 14
  },
  "scored_trials": 14,
  "metrics": {
    "negative": {
      "ldi_low_sim": {
        "value": 0.5,
        "insufficient_data": false
      },
      "ldi_high_sim": {
        "value": 0.25,
        "insufficient_data": false
      },
      "ldi_collapsed": {
        "value": 0.375,
        "insufficient_data": false
      },
      "recognition_memory": {
        "value": 0.5,
        "insufficient_data": false
      }
    },
    "neutral": {
      "ldi_low_sim": {
        "value": 0.0,
        "insufficient_data": true
      },
      "ldi_high_sim": {
        "value": 0.0,
        "insufficient_data": true
      },
      "ldi_collapsed": {
        "value": 0.0,
        "insufficient_data": true
      },
      "recognition_memory": {
        "value": 0.0,
        "insufficient_data": true
      }
    },
    "positive": {
      "ldi_low_sim": {
        "value": 0.0,
        "insufficient_data": true
      },
      "ldi_high_sim": {
        "value": 0.0,
        "insufficient_data": true
      },
      "ldi_collapsed": {
        "value": 0.0,
        "insufficient_data": true
      },
      "recognition_memory": {
        "value": 0.0,
        "insufficient_data": true
      }
    }
  }
}
"#;
    assert_eq!(snapshot, expected);

    let _ = fs::remove_dir_all(&logs);
}

#[test]
fn snapshot_classify_json() {
    let stimuli = temp_dir("emodt-stimuli");
    let logs = temp_dir("emodt-logs");
    let dir = stimuli.join("setA");
    if let Err(err) = fs::create_dir_all(&dir) {
        panic!("failed to create stimulus dir: {err}");
    }
    for name in ["1001b.jpg", "4001.jpg"] {
        if let Err(err) = File::create(dir.join(name)) {
            panic!("failed to seed stimulus {name}: {err}");
        }
    }

    let output = emodt_output(
        &logs,
        &[
            "task",
            "classify",
            "--set",
            "A",
            "--stimuli-root",
            &stimuli.to_string_lossy(),
            "--json",
        ],
    );
    assert!(output.status.success());

    let snapshot = String::from_utf8_lossy(&output.stdout).into_owned();
    let expected = r#"{
  "stimulus_set": "A",
  "stimuli": [
    {
      "image": "1001b.jpg",
      "trial_type": "LureB",
      "valence": "negative",
      "study_item": false,
      "test_item": true
    },
    {
      "image": "4001.jpg",
      "trial_type": "R-Neg",
      "valence": "negative",
      "study_item": true,
      "test_item": true
    }
  ],
  "excluded": []
}
"#;
    assert_eq!(snapshot, expected);

    let _ = fs::remove_dir_all(&stimuli);
    let _ = fs::remove_dir_all(&logs);
}
