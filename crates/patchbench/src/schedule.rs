//! The work scheduler: bounded parallelism over instances.
//!
//! Workers pull instances from a shared cursor; each worker runs the full
//! resolve -> build -> run -> parse -> grade pipeline for one instance and
//! persists its verdict before taking the next. A raised cancel flag stops
//! dequeuing and propagates into in-flight runs. A worker panic is
//! contained and converted to a `run_error` verdict for the instance it was
//! holding; other workers continue. Engine-level failures abort the whole
//! run.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use patchbench_engine::Engine;
use tracing::{info, warn};

use crate::builder::{CacheLevel, ImageBuilder};
use crate::grader::{self, Resolution};
use crate::instance::{Instance, Prediction};
use crate::parser::{self, ParseError};
use crate::report::{self, RunLayout, Summary, Timings, Verdict};
use crate::runner::{self, RunPaths, RunRequest, RunnerOutcome};
use crate::spec::{self, ResolveOptions};
use crate::util;

static CANCELLED: AtomicBool = AtomicBool::new(false);
static SIGINT_HOOK: Once = Once::new();

/// Install a SIGINT handler that raises the global cancel flag. Idempotent;
/// a second interrupt falls back to the default disposition so a stuck run
/// can still be killed.
pub fn install_cancel_handler() {
    SIGINT_HOOK.call_once(|| {
        #[cfg(unix)]
        {
            extern "C" fn on_sigint(_sig: libc::c_int) {
                CANCELLED.store(true, Ordering::SeqCst);
                unsafe {
                    libc::signal(libc::SIGINT, libc::SIG_DFL);
                }
            }
            let handler: extern "C" fn(libc::c_int) = on_sigint;
            unsafe {
                libc::signal(libc::SIGINT, handler as libc::sighandler_t);
            }
        }
    });
}

pub fn cancel_requested() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn reset_cancel_for_tests() {
    CANCELLED.store(false, Ordering::SeqCst);
}

#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub run_id: String,
    pub results_root: PathBuf,
    pub max_workers: usize,
    pub timeout_seconds: Option<u64>,
    pub force_rebuild: bool,
    pub cache_level: CacheLevel,
    pub namespace: String,
    pub grace_seconds: u64,
    pub max_concurrent_builds: usize,
    pub build_timeout_seconds: u64,
    pub engine_bin: String,
    /// Evaluate each instance's own gold patch instead of predictions.
    pub oracle: bool,
    pub instance_ids: Vec<String>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            run_id: "run".to_string(),
            results_root: PathBuf::from("results"),
            max_workers: 8,
            timeout_seconds: None,
            force_rebuild: false,
            cache_level: CacheLevel::Env,
            namespace: String::new(),
            grace_seconds: 10,
            max_concurrent_builds: 4,
            build_timeout_seconds: 3600,
            engine_bin: "docker".to_string(),
            oracle: false,
            instance_ids: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct EvalReport {
    pub summary: Summary,
    pub cancelled: bool,
}

struct WorkItem {
    instance: Instance,
    patch: String,
}

enum WorkOutcome {
    Done(Verdict),
    Resumed(Verdict),
    Cancelled,
    Fatal(String),
}

pub fn run_eval(
    opts: &EvalOptions,
    dataset: Vec<Instance>,
    predictions: Option<BTreeMap<String, Prediction>>,
) -> Result<EvalReport> {
    let engine = Engine::new(&opts.engine_bin);

    let layout = RunLayout::new(&opts.results_root, &opts.run_id);
    std::fs::create_dir_all(layout.run_dir())
        .with_context(|| format!("create run dir {}", layout.run_dir().display()))?;

    let selected = select_instances(dataset, &opts.instance_ids);
    let (work, skipped_no_prediction) = attach_patches(selected, predictions, opts.oracle);
    info!(
        run_id = %opts.run_id,
        instances = work.len(),
        skipped_no_prediction,
        "evaluation starting"
    );

    // A fully-resumed run touches no containers; only probe the engine when
    // there is real work left.
    let needs_engine = opts.force_rebuild
        || work
            .iter()
            .any(|w| !layout.is_complete(&w.instance.instance_id));
    if needs_engine {
        let version = engine
            .ping()
            .map_err(|e| anyhow::anyhow!("E_ENGINE_UNAVAILABLE: {e}"))?;
        info!(engine = %opts.engine_bin, version = %version, "container engine ready");
    }

    let builder = ImageBuilder::new(
        engine.clone(),
        layout.build_logs_dir(),
        opts.max_concurrent_builds,
        opts.force_rebuild,
        Duration::from_secs(opts.build_timeout_seconds),
    );

    let cursor = AtomicUsize::new(0);
    let verdicts: Mutex<Vec<Verdict>> = Mutex::new(Vec::with_capacity(work.len()));
    let fatal: Mutex<Option<String>> = Mutex::new(None);

    std::thread::scope(|scope| {
        let workers = opts.max_workers.max(1).min(work.len().max(1));
        for _ in 0..workers {
            scope.spawn(|| loop {
                if cancel_requested() {
                    return;
                }
                if fatal.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
                    return;
                }
                let idx = cursor.fetch_add(1, Ordering::Relaxed);
                if idx >= work.len() {
                    return;
                }
                let item = &work[idx];

                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    process_instance(&engine, &builder, &layout, opts, item)
                }))
                .unwrap_or_else(|panic| {
                    let msg = panic_message(&panic);
                    warn!(instance = %item.instance.instance_id, message = %msg, "worker panicked");
                    let verdict = Verdict::new(
                        &item.instance.instance_id,
                        Resolution::RunError,
                        "worker_panic",
                    )
                    .with_message(msg);
                    let _ = report::write_verdict(&layout, &verdict);
                    WorkOutcome::Done(verdict)
                });

                match outcome {
                    WorkOutcome::Done(v) | WorkOutcome::Resumed(v) => {
                        info!(
                            instance = %v.instance_id,
                            verdict = v.resolved.as_str(),
                            reason = %v.reason,
                            "verdict"
                        );
                        verdicts
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(v);
                    }
                    WorkOutcome::Cancelled => return,
                    WorkOutcome::Fatal(msg) => {
                        let mut guard = fatal.lock().unwrap_or_else(|e| e.into_inner());
                        if guard.is_none() {
                            *guard = Some(msg);
                        }
                        return;
                    }
                }
            });
        }
    });

    if let Some(msg) = fatal.into_inner().unwrap_or_else(|e| e.into_inner()) {
        bail!("E_ENGINE_FATAL: {msg}");
    }

    let verdicts = verdicts.into_inner().unwrap_or_else(|e| e.into_inner());
    let summary = report::summarize(&opts.run_id, &verdicts, skipped_no_prediction);
    report::write_summary(&layout, &summary).context("write summary")?;

    builder.evict(opts.cache_level);

    let cancelled = cancel_requested();
    if cancelled {
        warn!(run_id = %opts.run_id, "run cancelled; partial results persisted");
    }

    Ok(EvalReport { summary, cancelled })
}

fn select_instances(dataset: Vec<Instance>, instance_ids: &[String]) -> Vec<Instance> {
    if instance_ids.is_empty() {
        return dataset;
    }
    dataset
        .into_iter()
        .filter(|i| instance_ids.iter().any(|id| id == &i.instance_id))
        .collect()
}

/// Pair each instance with its candidate patch. In oracle mode the gold
/// patch is evaluated; otherwise instances without a prediction are
/// skipped with a warning and counted.
fn attach_patches(
    dataset: Vec<Instance>,
    predictions: Option<BTreeMap<String, Prediction>>,
    oracle: bool,
) -> (Vec<WorkItem>, usize) {
    let mut work = Vec::with_capacity(dataset.len());
    let mut skipped = 0usize;

    for instance in dataset {
        let patch = if oracle {
            instance.patch.clone()
        } else {
            match predictions
                .as_ref()
                .and_then(|m| m.get(&instance.instance_id))
            {
                Some(p) => p.patch.clone(),
                None => {
                    warn!(instance = %instance.instance_id, "no prediction; skipping");
                    skipped += 1;
                    continue;
                }
            }
        };
        work.push(WorkItem { instance, patch });
    }

    (work, skipped)
}

fn process_instance(
    engine: &Engine,
    builder: &ImageBuilder,
    layout: &RunLayout,
    opts: &EvalOptions,
    item: &WorkItem,
) -> WorkOutcome {
    let instance = &item.instance;
    let id = &instance.instance_id;

    if !opts.force_rebuild && layout.is_complete(id) {
        match report::load_verdict(layout, id) {
            Ok(v) => {
                info!(instance = %id, "verdict already present; resumed");
                return WorkOutcome::Resumed(v);
            }
            Err(e) => {
                warn!(instance = %id, error = %e, "stale verdict unreadable; redoing");
            }
        }
    }

    let started = Instant::now();

    let resolve_opts = ResolveOptions {
        namespace: opts.namespace.clone(),
        timeout_seconds: opts.timeout_seconds,
    };
    let spec = match spec::resolve(instance, &resolve_opts) {
        Ok(spec) => spec,
        Err(e) => {
            let verdict = Verdict::new(id, Resolution::BuildError, e.reason())
                .with_message(e.to_string());
            let _ = report::write_verdict(layout, &verdict);
            return WorkOutcome::Done(verdict);
        }
    };

    if let Err(e) = report::write_spec_snapshot(layout, &spec) {
        warn!(instance = %id, error = %e, "spec snapshot write failed");
    }

    let build_started = Instant::now();
    if let Err(failure) = builder.ensure_for_spec(&spec) {
        if failure.fatal {
            return WorkOutcome::Fatal(failure.to_string());
        }
        let verdict = Verdict::new(id, Resolution::BuildError, "image_build_failed")
            .with_message(failure.to_string());
        let _ = report::write_verdict(layout, &verdict);
        return WorkOutcome::Done(verdict);
    }
    let build_ms = build_started.elapsed().as_millis() as u64;

    if cancel_requested() {
        return WorkOutcome::Cancelled;
    }

    let instance_dir = layout.instance_dir(id);
    let paths = RunPaths {
        patch_file: instance_dir.join("patch.diff"),
        eval_script_file: instance_dir.join("eval.sh"),
        run_log: layout.run_log_path(id),
        report_export_dir: layout.reports_dir(id),
    };
    let combined = instance.combined_patch(&item.patch);
    let request = RunRequest {
        spec: &spec,
        patch: &combined,
        container_name: runner::container_name(&opts.run_id, id),
        paths: &paths,
        grace_seconds: opts.grace_seconds,
        cancel: Some(&CANCELLED),
    };

    let run_started = Instant::now();
    let (outcome, _record) = match runner::run(engine, &request) {
        Ok(v) => v,
        Err(e) => {
            if e.is_fatal() {
                return WorkOutcome::Fatal(e.to_string());
            }
            let verdict = Verdict::new(id, Resolution::RunError, "engine_error")
                .with_message(e.to_string());
            let _ = report::write_verdict(layout, &verdict);
            return WorkOutcome::Done(verdict);
        }
    };
    let run_ms = run_started.elapsed().as_millis() as u64;

    let mut verdict = match outcome {
        RunnerOutcome::Cancelled => return WorkOutcome::Cancelled,
        RunnerOutcome::PatchFailed { apply_log } => {
            Verdict::new(id, Resolution::BuildError, "patch_failed")
                .with_message(util::truncate_str(&apply_log, 4096))
        }
        RunnerOutcome::Finished { timed_out: true, .. } => {
            Verdict::new(id, Resolution::Timeout, "tests_timed_out").with_message(format!(
                "wall clock exceeded {} seconds",
                spec.timeout_seconds
            ))
        }
        RunnerOutcome::Finished {
            exit_code,
            timed_out: false,
        } => grade_finished_run(layout, &spec, exit_code),
    };

    verdict.timings = Timings {
        build_ms,
        run_ms,
        total_ms: started.elapsed().as_millis() as u64,
    };

    if let Err(e) = report::write_verdict(layout, &verdict) {
        warn!(instance = %id, error = %e, "verdict write failed");
    }
    WorkOutcome::Done(verdict)
}

/// Parse and grade a run that finished under its own power.
fn grade_finished_run(
    layout: &RunLayout,
    spec: &crate::spec::TestSpec,
    exit_code: Option<i32>,
) -> Verdict {
    let id = &spec.instance_id;
    let log = std::fs::read(layout.run_log_path(id))
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();

    let report_dir = spec
        .report_dir
        .as_ref()
        .map(|_| layout.reports_dir(id))
        .filter(|d| d.is_dir());

    match parser::parse(spec.parser, &log, report_dir.as_deref()) {
        Ok(parsed) => {
            if let Err(e) = report::write_parsed(layout, id, &parsed) {
                warn!(instance = %id, error = %e, "parsed result write failed");
            }
            let grade = grader::grade(&parsed, &spec.fail_to_pass, &spec.pass_to_pass);
            let mut verdict = Verdict::new(id, grade.resolution, grade.reason);
            verdict.notes = grade.notes;
            verdict
        }
        Err(ParseError::NoTestsFound) if exit_code != Some(0) => {
            Verdict::new(id, Resolution::RunError, "eval_exec_failed").with_message(format!(
                "eval script exited {} and no test results were observed",
                exit_code.map_or_else(|| "on signal".to_string(), |c| c.to_string())
            ))
        }
        Err(e) => {
            Verdict::new(id, Resolution::ParseError, e.reason()).with_message(e.to_string())
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Language;
    use std::sync::atomic::AtomicUsize;

    static DIR_N: AtomicUsize = AtomicUsize::new(0);

    fn tmp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "patchbench_sched_{}_{}",
            std::process::id(),
            DIR_N.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn instance(id: &str) -> Instance {
        Instance {
            instance_id: id.to_string(),
            repo: "octo/widgets".to_string(),
            base_commit: "abc".to_string(),
            patch: "gold".to_string(),
            test_patch: None,
            version: "1.0".to_string(),
            language: Language::Python,
            fail_to_pass: vec!["t::a".to_string()],
            pass_to_pass: Vec::new(),
        }
    }

    #[test]
    fn attach_patches_counts_missing_predictions() {
        let preds: BTreeMap<String, Prediction> = [(
            "a".to_string(),
            Prediction {
                patch: "p".to_string(),
                model_name_or_path: None,
            },
        )]
        .into_iter()
        .collect();

        let (work, skipped) =
            attach_patches(vec![instance("a"), instance("b")], Some(preds), false);
        assert_eq!(work.len(), 1);
        assert_eq!(skipped, 1);
        assert_eq!(work[0].patch, "p");
    }

    #[test]
    fn oracle_mode_uses_gold_patch() {
        let (work, skipped) = attach_patches(vec![instance("a")], None, true);
        assert_eq!(skipped, 0);
        assert_eq!(work[0].patch, "gold");
    }

    #[test]
    fn select_instances_filters_by_id() {
        let got = select_instances(
            vec![instance("a"), instance("b")],
            &["b".to_string()],
        );
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].instance_id, "b");
    }

    #[test]
    fn resumed_verdicts_skip_work_and_keep_summary_stable() {
        reset_cancel_for_tests();
        let root = tmp_root();
        let layout = RunLayout::new(&root, "r1");

        // Pre-seed a completed instance the way a previous run would have.
        let seeded = Verdict::new("a", Resolution::Resolved, "all_expected_tests_passed");
        report::write_verdict(&layout, &seeded).unwrap();

        let opts = EvalOptions {
            run_id: "r1".to_string(),
            results_root: root.clone(),
            max_workers: 2,
            // A nonexistent engine binary: any instance that actually needs
            // the engine would abort, so completing proves resume skipped it.
            engine_bin: "/nonexistent/patchbench-engine".to_string(),
            oracle: true,
            ..EvalOptions::default()
        };

        let report1 = run_eval(&opts, vec![instance("a")], None).unwrap();
        assert_eq!(report1.summary.totals.resolved, 1);

        let bytes1 = std::fs::read(layout.summary_path()).unwrap();
        let report2 = run_eval(&opts, vec![instance("a")], None).unwrap();
        let bytes2 = std::fs::read(layout.summary_path()).unwrap();
        assert_eq!(bytes1, bytes2);
        assert_eq!(report2.summary.totals.resolved, 1);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "ééééé";
        let t = util::truncate_str(s, 3);
        assert!(t.starts_with("é"));
    }
}
