//! End-to-end pipeline tests against a scripted fake engine.
//!
//! The fake engine binary answers the same CLI surface the harness drives
//! (`version`, `image inspect`, `create`, `exec`, ...) and plays back a
//! scripted test log through the exec stream, so the whole
//! resolve -> build -> run -> parse -> grade -> persist path runs for real
//! without a container daemon.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use patchbench::grader::Resolution;
use patchbench::instance::{Instance, Language, Prediction};
use patchbench::report::RunLayout;
use patchbench::schedule::{run_eval, EvalOptions};

static DIR_N: AtomicUsize = AtomicUsize::new(0);

fn tmp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "patchbench_e2e_{}_{}",
        std::process::id(),
        DIR_N.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write the fake engine. `eval_body` is the shell fragment run when the
/// harness execs the eval script; `apply_exit` is the exit code for patch
/// apply execs. Every exec invocation is appended to `execs.log`.
fn fake_engine(dir: &Path, eval_body: &str, apply_exit: i32) -> PathBuf {
    let execs = dir.join("execs.log");
    let bin = dir.join("fake-engine.sh");
    let script = format!(
        r#"#!/bin/sh
case "$1" in
  version) echo "25.0.0"; exit 0 ;;
  image) exit 0 ;;
  create) echo "cid0123456789"; exit 0 ;;
  start|cp|stop|rm|container) exit 0 ;;
  exec)
    echo "exec $@" >> {execs}
    for a in "$@"; do
      case "$a" in
        *eval.sh*)
          {eval_body}
          exit 0 ;;
      esac
    done
    exit {apply_exit} ;;
esac
exit 0
"#,
        execs = execs.display(),
    );
    std::fs::write(&bin, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let mut perms = std::fs::metadata(&bin).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&bin, perms).unwrap();
    }
    bin
}

fn instance_a() -> Instance {
    Instance {
        instance_id: "A".to_string(),
        repo: "octo/widgets".to_string(),
        base_commit: "abc123".to_string(),
        patch: String::new(),
        test_patch: Some("diff --git a/tests/test_mod.py b/tests/test_mod.py\n".to_string()),
        version: "1.0".to_string(),
        language: Language::Python,
        fail_to_pass: vec!["pkg/test_mod.py::test_m1".to_string()],
        pass_to_pass: vec!["pkg/test_mod.py::test_m2".to_string()],
    }
}

fn predictions_for_a() -> std::collections::BTreeMap<String, Prediction> {
    [(
        "A".to_string(),
        Prediction {
            patch: "diff --git a/pkg/mod.py b/pkg/mod.py\n".to_string(),
            model_name_or_path: Some("test-model".to_string()),
        },
    )]
    .into_iter()
    .collect()
}

fn opts(dir: &Path, engine_bin: &Path, run_id: &str) -> EvalOptions {
    EvalOptions {
        run_id: run_id.to_string(),
        results_root: dir.join("results"),
        max_workers: 2,
        engine_bin: engine_bin.display().to_string(),
        ..EvalOptions::default()
    }
}

#[test]
fn both_expected_tests_pass_yields_resolved() {
    let dir = tmp_dir();
    let engine = fake_engine(
        &dir,
        r#"echo "PASSED pkg/test_mod.py::test_m1"; echo "PASSED pkg/test_mod.py::test_m2""#,
        0,
    );
    let o = opts(&dir, &engine, "s1");

    let report = run_eval(&o, vec![instance_a()], Some(predictions_for_a())).unwrap();
    assert_eq!(report.summary.totals.resolved, 1);

    let layout = RunLayout::new(dir.join("results"), "s1");
    assert!(layout.verdict_path("A").is_file());
    assert!(layout.parsed_path("A").is_file());
    assert!(layout.spec_path("A").is_file());
    assert!(layout.run_log_path("A").is_file());
    assert!(layout.summary_path().is_file());

    let verdict = patchbench::report::load_verdict(&layout, "A").unwrap();
    assert_eq!(verdict.resolved, Resolution::Resolved);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn failing_expected_test_yields_unresolved() {
    let dir = tmp_dir();
    let engine = fake_engine(
        &dir,
        r#"echo "FAILED pkg/test_mod.py::test_m1 - boom"; echo "PASSED pkg/test_mod.py::test_m2""#,
        0,
    );
    let o = opts(&dir, &engine, "s2");

    let report = run_eval(&o, vec![instance_a()], Some(predictions_for_a())).unwrap();
    assert_eq!(report.summary.totals.unresolved, 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn regression_yields_unresolved() {
    let dir = tmp_dir();
    let engine = fake_engine(
        &dir,
        r#"echo "PASSED pkg/test_mod.py::test_m1"; echo "FAILED pkg/test_mod.py::test_m2 - regressed""#,
        0,
    );
    let o = opts(&dir, &engine, "s3");

    let report = run_eval(&o, vec![instance_a()], Some(predictions_for_a())).unwrap();
    assert_eq!(report.summary.totals.unresolved, 1);

    let layout = RunLayout::new(dir.join("results"), "s3");
    let verdict = patchbench::report::load_verdict(&layout, "A").unwrap();
    assert_eq!(verdict.reason, "pass_to_pass_regression");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unapplicable_patch_yields_build_error_without_running_tests() {
    let dir = tmp_dir();
    let engine = fake_engine(&dir, r#"echo "should never run""#, 1);
    let o = opts(&dir, &engine, "s4");

    let report = run_eval(&o, vec![instance_a()], Some(predictions_for_a())).unwrap();
    assert_eq!(report.summary.totals.build_error, 1);

    let layout = RunLayout::new(dir.join("results"), "s4");
    let verdict = patchbench::report::load_verdict(&layout, "A").unwrap();
    assert_eq!(verdict.resolved, Resolution::BuildError);
    assert_eq!(verdict.reason, "patch_failed");
    // The test command never executed and nothing was parsed.
    assert!(!layout.parsed_path("A").is_file());
    let execs = std::fs::read_to_string(dir.join("execs.log")).unwrap();
    assert!(!execs.contains("eval.sh"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn overrunning_eval_yields_timeout() {
    let dir = tmp_dir();
    let engine = fake_engine(
        &dir,
        r#"echo "PASSED pkg/test_mod.py::test_m1"; sleep 5"#,
        0,
    );
    let mut o = opts(&dir, &engine, "s5");
    o.timeout_seconds = Some(1);
    o.grace_seconds = 1;

    let report = run_eval(&o, vec![instance_a()], Some(predictions_for_a())).unwrap();
    assert_eq!(report.summary.totals.timeout, 1);

    let layout = RunLayout::new(dir.join("results"), "s5");
    let verdict = patchbench::report::load_verdict(&layout, "A").unwrap();
    assert_eq!(verdict.resolved, Resolution::Timeout);
    // Output captured up to the kill is preserved.
    let log = std::fs::read_to_string(layout.run_log_path("A")).unwrap();
    assert!(log.contains("test_m1"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn second_run_resumes_without_touching_the_engine() {
    let dir = tmp_dir();
    let engine = fake_engine(
        &dir,
        r#"echo "PASSED pkg/test_mod.py::test_m1"; echo "PASSED pkg/test_mod.py::test_m2""#,
        0,
    );
    let o = opts(&dir, &engine, "idem");

    run_eval(&o, vec![instance_a()], Some(predictions_for_a())).unwrap();
    let execs_after_first = std::fs::read_to_string(dir.join("execs.log")).unwrap();
    let summary_path = RunLayout::new(dir.join("results"), "idem").summary_path();
    let summary_first = std::fs::read(&summary_path).unwrap();

    let report = run_eval(&o, vec![instance_a()], Some(predictions_for_a())).unwrap();
    assert_eq!(report.summary.totals.resolved, 1);

    let execs_after_second = std::fs::read_to_string(dir.join("execs.log")).unwrap();
    assert_eq!(execs_after_first, execs_after_second);
    assert_eq!(summary_first, std::fs::read(&summary_path).unwrap());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn conflicting_expected_sets_fail_resolution() {
    let dir = tmp_dir();
    let engine = fake_engine(&dir, "true", 0);
    let o = opts(&dir, &engine, "conflict");

    let mut inst = instance_a();
    inst.fail_to_pass = vec!["x::y".to_string(), "x::z".to_string()];
    inst.pass_to_pass = vec!["x::y".to_string()];

    let report = run_eval(&o, vec![inst], Some(predictions_for_a())).unwrap();
    assert_eq!(report.summary.totals.build_error, 1);

    let layout = RunLayout::new(dir.join("results"), "conflict");
    let verdict = patchbench::report::load_verdict(&layout, "A").unwrap();
    assert_eq!(verdict.reason, "conflicting_tests");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_prediction_is_skipped_and_counted() {
    let dir = tmp_dir();
    let engine = fake_engine(&dir, "true", 0);
    let o = opts(&dir, &engine, "nopred");

    let report = run_eval(
        &o,
        vec![instance_a()],
        Some(std::collections::BTreeMap::new()),
    )
    .unwrap();
    assert_eq!(report.summary.totals.instances, 0);
    assert_eq!(report.summary.totals.skipped_no_prediction, 1);
    let _ = std::fs::remove_dir_all(&dir);
}
