//! Two-pass test collection: populate `FAIL_TO_PASS` / `PASS_TO_PASS` for
//! instances that do not carry them yet.
//!
//! Pass one runs the tests with only the test patch applied (new tests must
//! exist to be observed failing); pass two runs them again, in a fresh
//! container, with the fix patch applied as well. The two result sets are
//! diffed into the expected-test labels. The output dataset is rewritten
//! atomically after every instance, so an interruption loses at most the
//! in-flight instance.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use patchbench_engine::Engine;
use serde::Serialize;
use tracing::{info, warn};

use crate::builder::ImageBuilder;
use crate::instance::Instance;
use crate::parser::{self, ParsedResult, TestStatus};
use crate::report::RunLayout;
use crate::runner::{self, RunPaths, RunRequest, RunnerOutcome};
use crate::schedule;
use crate::spec::{self, ResolveOptions, TestSpec};
use crate::util;

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub run_id: String,
    pub results_root: PathBuf,
    pub out_path: PathBuf,
    pub max_workers: usize,
    pub timeout_seconds: Option<u64>,
    pub force_rebuild: bool,
    pub namespace: String,
    pub grace_seconds: u64,
    pub max_concurrent_builds: usize,
    pub build_timeout_seconds: u64,
    pub engine_bin: String,
    pub instance_ids: Vec<String>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            run_id: "collect".to_string(),
            results_root: PathBuf::from("results"),
            out_path: PathBuf::from("dataset.collected.json"),
            max_workers: 8,
            timeout_seconds: None,
            force_rebuild: false,
            namespace: String::new(),
            grace_seconds: 10,
            max_concurrent_builds: 4,
            build_timeout_seconds: 3600,
            engine_bin: "docker".to_string(),
            instance_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectStatus {
    Collected,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectRow {
    pub instance_id: String,
    pub status: CollectStatus,
    pub fail_to_pass: usize,
    pub pass_to_pass: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CollectReport {
    pub schema_version: String,
    pub run_id: String,
    pub collected: usize,
    pub skipped: usize,
    pub errors: usize,
    pub rows: Vec<CollectRow>,
}

pub fn run_collect(opts: &CollectOptions, dataset: Vec<Instance>) -> Result<CollectReport> {
    let layout = RunLayout::new(&opts.results_root, &opts.run_id);
    std::fs::create_dir_all(layout.run_dir())
        .with_context(|| format!("create run dir {}", layout.run_dir().display()))?;

    // Indices into the shared dataset that still need collection. An
    // instance already carrying non-empty expected sets is settled unless a
    // rebuild is forced.
    let todo: Vec<usize> = dataset
        .iter()
        .enumerate()
        .filter(|(_, inst)| {
            opts.instance_ids.is_empty()
                || opts.instance_ids.iter().any(|id| id == &inst.instance_id)
        })
        .filter(|(_, inst)| {
            opts.force_rebuild || (inst.fail_to_pass.is_empty() && inst.pass_to_pass.is_empty())
        })
        .map(|(idx, _)| idx)
        .collect();

    info!(
        run_id = %opts.run_id,
        total = dataset.len(),
        todo = todo.len(),
        "collection starting"
    );

    let engine = Engine::new(&opts.engine_bin);
    if !todo.is_empty() {
        let version = engine
            .ping()
            .map_err(|e| anyhow!("E_ENGINE_UNAVAILABLE: {e}"))?;
        info!(engine = %opts.engine_bin, version = %version, "container engine ready");
    }

    let builder = ImageBuilder::new(
        engine.clone(),
        layout.build_logs_dir(),
        opts.max_concurrent_builds,
        opts.force_rebuild,
        Duration::from_secs(opts.build_timeout_seconds),
    );

    let skipped = dataset.len() - todo.len();
    let master: Mutex<Vec<Instance>> = Mutex::new(dataset);
    let rows: Mutex<Vec<CollectRow>> = Mutex::new(Vec::new());
    let cursor = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        let workers = opts.max_workers.max(1).min(todo.len().max(1));
        for _ in 0..workers {
            scope.spawn(|| loop {
                if schedule::cancel_requested() {
                    return;
                }
                let slot = cursor.fetch_add(1, Ordering::Relaxed);
                if slot >= todo.len() {
                    return;
                }
                let idx = todo[slot];
                let instance = {
                    let master = master.lock().unwrap_or_else(|e| e.into_inner());
                    master[idx].clone()
                };

                let row = match collect_one(&engine, &builder, &layout, opts, &instance) {
                    Ok(Some((f2p, p2p, warnings))) => {
                        let row = CollectRow {
                            instance_id: instance.instance_id.clone(),
                            status: CollectStatus::Collected,
                            fail_to_pass: f2p.len(),
                            pass_to_pass: p2p.len(),
                            warnings,
                            error: None,
                        };
                        let mut master = master.lock().unwrap_or_else(|e| e.into_inner());
                        master[idx].fail_to_pass = f2p;
                        master[idx].pass_to_pass = p2p;
                        if let Err(e) = write_dataset(&opts.out_path, &master) {
                            warn!(error = %e, "incremental dataset write failed");
                        }
                        row
                    }
                    Ok(None) => return, // cancelled mid-run
                    Err(e) => CollectRow {
                        instance_id: instance.instance_id.clone(),
                        status: CollectStatus::Error,
                        fail_to_pass: 0,
                        pass_to_pass: 0,
                        warnings: Vec::new(),
                        error: Some(format!("{e:#}")),
                    },
                };

                info!(
                    instance = %row.instance_id,
                    status = ?row.status,
                    fail_to_pass = row.fail_to_pass,
                    pass_to_pass = row.pass_to_pass,
                    "collection result"
                );
                rows.lock().unwrap_or_else(|e| e.into_inner()).push(row);
            });
        }
    });

    // Final rewrite covers the skipped instances too, so the output file is
    // always the complete dataset.
    {
        let master = master.lock().unwrap_or_else(|e| e.into_inner());
        write_dataset(&opts.out_path, &master)?;
    }

    let mut rows = rows.into_inner().unwrap_or_else(|e| e.into_inner());
    rows.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    let collected = rows
        .iter()
        .filter(|r| r.status == CollectStatus::Collected)
        .count();
    let errors = rows
        .iter()
        .filter(|r| r.status == CollectStatus::Error)
        .count();

    Ok(CollectReport {
        schema_version: patchbench_contracts::COLLECT_REPORT_SCHEMA_VERSION.to_string(),
        run_id: opts.run_id.clone(),
        collected,
        skipped,
        errors,
        rows,
    })
}

type CollectedSets = (Vec<String>, Vec<String>, Vec<String>);

/// Run the two passes for one instance. `Ok(None)` means the run was
/// cancelled mid-flight and no labels are owed.
fn collect_one(
    engine: &Engine,
    builder: &ImageBuilder,
    layout: &RunLayout,
    opts: &CollectOptions,
    instance: &Instance,
) -> Result<Option<CollectedSets>> {
    let resolve_opts = ResolveOptions {
        namespace: opts.namespace.clone(),
        timeout_seconds: opts.timeout_seconds,
    };
    // Expected sets play no part in collection; resolve on a cleared copy
    // so stale labels cannot be rejected as conflicting.
    let mut cleared = instance.clone();
    cleared.fail_to_pass.clear();
    cleared.pass_to_pass.clear();
    let spec = spec::resolve(&cleared, &resolve_opts).map_err(|e| anyhow!("{e}"))?;

    builder
        .ensure_for_spec(&spec)
        .map_err(|e| anyhow!("{e}"))?;

    let before = match run_pass(engine, layout, opts, &spec, instance, "", "before")? {
        Some(parsed) => parsed,
        None => return Ok(None),
    };
    let after = match run_pass(engine, layout, opts, &spec, instance, &instance.patch, "after")? {
        Some(parsed) => parsed,
        None => return Ok(None),
    };

    let mut fail_to_pass = Vec::new();
    let mut pass_to_pass = Vec::new();
    let mut warnings = Vec::new();

    for (id, after_status) in &after {
        let before_status = before.get(id);
        match (before_status, after_status) {
            (Some(TestStatus::Passed), TestStatus::Passed) => pass_to_pass.push(id.clone()),
            (Some(TestStatus::Failed) | Some(TestStatus::Error) | None, TestStatus::Passed) => {
                fail_to_pass.push(id.clone())
            }
            _ => {}
        }
    }
    for (id, before_status) in &before {
        if *before_status == TestStatus::Passed
            && matches!(after.get(id), Some(TestStatus::Failed) | Some(TestStatus::Error))
        {
            warnings.push(format!("regression under patch: {id}"));
        }
    }

    fail_to_pass.sort();
    pass_to_pass.sort();

    Ok(Some((fail_to_pass, pass_to_pass, warnings)))
}

fn run_pass(
    engine: &Engine,
    layout: &RunLayout,
    opts: &CollectOptions,
    spec: &TestSpec,
    instance: &Instance,
    candidate_patch: &str,
    pass: &str,
) -> Result<Option<ParsedResult>> {
    let instance_dir = layout.instance_dir(&instance.instance_id);
    let paths = RunPaths {
        patch_file: instance_dir.join(format!("{pass}.patch.diff")),
        eval_script_file: instance_dir.join("eval.sh"),
        run_log: instance_dir.join(format!("{pass}.run.log")),
        report_export_dir: instance_dir.join(format!("{pass}.reports")),
    };

    let combined = instance.combined_patch(candidate_patch);
    let request = RunRequest {
        spec,
        patch: &combined,
        container_name: format!(
            "{}.{pass}",
            runner::container_name(&opts.run_id, &instance.instance_id)
        ),
        paths: &paths,
        grace_seconds: opts.grace_seconds,
        cancel: None,
    };

    let (outcome, _record) = runner::run(engine, &request).map_err(|e| anyhow!("{e}"))?;

    let exit_code = match outcome {
        RunnerOutcome::Cancelled => return Ok(None),
        RunnerOutcome::PatchFailed { apply_log } => {
            anyhow::bail!(
                "E_COLLECT_PATCH_FAILED: {pass} pass patch did not apply: {}",
                util::truncate_str(&apply_log, 2048)
            )
        }
        RunnerOutcome::Finished { timed_out: true, .. } => {
            anyhow::bail!("E_COLLECT_TIMEOUT: {pass} pass exceeded the timeout")
        }
        RunnerOutcome::Finished { exit_code, .. } => exit_code,
    };

    let log = std::fs::read(&paths.run_log)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    let report_dir = spec
        .report_dir
        .as_ref()
        .map(|_| paths.report_export_dir.clone())
        .filter(|d| d.is_dir());

    match parser::parse(spec.parser, &log, report_dir.as_deref()) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(parser::ParseError::NoTestsFound) if exit_code != Some(0) => Err(anyhow!(
            "E_COLLECT_RUN_FAILED: {pass} pass exited {:?} with no observable tests",
            exit_code
        )),
        Err(e) => Err(anyhow!("E_COLLECT_PARSE: {pass} pass: {e}")),
    }
}

/// Full atomic rewrite of the output dataset, sorted by instance id.
fn write_dataset(path: &std::path::Path, dataset: &[Instance]) -> Result<()> {
    let mut sorted: Vec<&Instance> = dataset.iter().collect();
    sorted.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    util::write_json_atomic(path, &sorted)
}
