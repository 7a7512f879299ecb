// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use workflow_synth::config::SaveMode;
use workflow_synth::reconciler::Reconciler;
use workflow_synth::saver::WorkflowSaver;
use workflow_synth::tracker::{load_execute_blocks, WorkflowTracker};
use workflow_synth::validator::WorkflowValidator;

/// P1: replaying the on-disk journal preserves execution order.
#[test]
fn journal_replay_preserves_order() {
    let dir = tempfile::tempdir().unwrap();
    let work_dir = dir.path().join("work");
    std::fs::create_dir_all(&work_dir).unwrap();
    let mut tracker = WorkflowTracker::new(Some(work_dir)).unwrap();
    for i in 0..5 {
        tracker.track_execution(format!("x = {i}"), "ok".into(), true, vec![], vec![], None).unwrap();
    }

    let blocks_dir = tracker.execute_blocks_dir.clone().unwrap();
    let replayed = load_execute_blocks(&blocks_dir, None);
    assert_eq!(replayed.len(), tracker.execution_history.len());
    for (live, replayed) in tracker.execution_history.iter().zip(replayed.iter()) {
        assert_eq!(live.execution_index, replayed.execution_index);
        assert_eq!(live.code, replayed.code);
    }
}

/// P4: reconciling already-correct code is a no-op.
#[test]
fn rule_based_fixes_are_idempotent_on_correct_code() {
    let code = "import pandas as pd\nimport numpy as np\n\ndf = pd.DataFrame()\narr = np.array([1, 2, 3])\n";
    let once = Reconciler::apply_rule_based_fixes(code);
    let twice = Reconciler::apply_rule_based_fixes(&once);
    assert_eq!(once, twice);
}

/// P5: a session's windowed view never reaches back before its own
/// `session_start_time` — a later tracker never sees an earlier session's
/// blocks, even though both share the same journal directory.
#[test]
fn later_session_window_excludes_earlier_session_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let work_dir = dir.path().join("work");
    std::fs::create_dir_all(&work_dir).unwrap();

    let mut first = WorkflowTracker::new(Some(work_dir.clone())).unwrap();
    first.track_execution("a = 1".into(), "ok".into(), true, vec![], vec![], None).unwrap();

    std::thread::sleep(std::time::Duration::from_secs(1));
    let mut second = WorkflowTracker::new(Some(work_dir)).unwrap();
    second.track_execution("b = 2".into(), "ok".into(), true, vec![], vec![], None).unwrap();

    let second_view = second.load_execute_blocks_from_files(true);
    let second_codes: Vec<&str> = second_view.iter().map(|e| e.code.as_str()).collect();
    assert!(second_codes.contains(&"b = 2"));
    assert!(!second_codes.contains(&"a = 1"));
}

/// P6: an artifact with no `.tmp.py` suffix exists exactly when there was
/// no validator, validation succeeded, or the mode is notebook.
#[test]
fn finalization_matches_validation_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
    let executions =
        vec![workflow_synth::entry::ExecutionEntry::new(0, "x = 1\n".into(), "ok".into(), true, vec![], vec![], None)];

    // No validator configured -> always finalized.
    let path = saver
        .save_and_validate_workflow(&executions, SaveMode::Simple, Some("no_validator"), &[], &HashMap::new(), None, None, 1)
        .unwrap();
    assert!(!path.to_string_lossy().ends_with(".tmp.py"));

    // Validator configured but no expected outputs -> finalized immediately.
    let validator = WorkflowValidator::new(dir.path().to_path_buf());
    let path = saver
        .save_and_validate_workflow(
            &executions,
            SaveMode::Simple,
            Some("no_outputs"),
            &[],
            &HashMap::new(),
            Some(&validator),
            None,
            1,
        )
        .unwrap();
    assert!(!path.to_string_lossy().ends_with(".tmp.py"));

    // Validator configured, expected output never produced -> left as .tmp.py.
    let mut expected = HashMap::new();
    expected.insert("never_written.txt".to_string(), b"hi".to_vec());
    let err = saver.save_and_validate_workflow(
        &executions,
        SaveMode::Simple,
        Some("unrepairable"),
        &[],
        &expected,
        Some(&validator),
        None,
        1,
    );
    assert!(err.is_err());
    let tmp_exists = std::fs::read_dir(dir.path().join("workflows"))
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().contains("unrepairable") && e.file_name().to_string_lossy().ends_with(".tmp.py"));
    assert!(tmp_exists);
}

/// P7 (round-trip, no LLM): a trivial read/write session produces a script
/// that reproduces the output byte-for-byte under re-execution.
#[test]
fn simple_mode_round_trip_reproduces_output() {
    let dir = tempfile::tempdir().unwrap();
    let session_dir = dir.path().join("session");
    std::fs::create_dir_all(&session_dir).unwrap();
    let input_path = session_dir.join("x.csv");
    std::fs::write(&input_path, "a,b\n1,2\n").unwrap();

    let code = format!(
        "import pandas as pd\ndf = pd.read_csv('{}')\ndf.to_csv('{}', index=False)\n",
        input_path.display(),
        session_dir.join("y.csv").display()
    );
    // Run the block for real so there is a ground-truth y.csv to compare against.
    let output = std::process::Command::new("python3").arg("-c").arg(&code).output();
    let Ok(output) = output else {
        eprintln!("skipping: python3 unavailable");
        return;
    };
    if !output.status.success() {
        eprintln!("skipping: python3/pandas unavailable in this environment");
        return;
    }
    let expected_bytes = std::fs::read(session_dir.join("y.csv")).unwrap();

    let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
    let executions = vec![workflow_synth::entry::ExecutionEntry::new(
        0,
        code,
        "ok".into(),
        true,
        vec![input_path.to_string_lossy().to_string()],
        vec![session_dir.join("y.csv").to_string_lossy().to_string()],
        None,
    )];

    let validator = WorkflowValidator::new(dir.path().to_path_buf());
    let mut expected = HashMap::new();
    expected.insert("y.csv".to_string(), expected_bytes);

    let path = saver
        .save_and_validate_workflow(
            &executions,
            SaveMode::Simple,
            Some("roundtrip"),
            &[input_path.to_string_lossy().to_string()],
            &expected,
            Some(&validator),
            None,
            1,
        )
        .unwrap();
    assert!(!path.to_string_lossy().ends_with(".tmp.py"));
}
