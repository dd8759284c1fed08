//! Per-instance container lifecycle: create, patch, test, tear down.
//!
//! Every exit path removes the container. The combined patch (test patch
//! first, then the candidate patch; test files must exist before anything
//! references them) is copied in and applied with the profile's command
//! ladder, fuzzing disabled. The eval script then runs under a hard
//! wall-clock timeout with its combined output streamed to `run.log`;
//! structured report trees, when the profile names one, are exported
//! before teardown.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use patchbench_engine::{Engine, EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::profile::{CONTAINER_EVAL_PATH, CONTAINER_PATCH_PATH, CONTAINER_WORKDIR};
use crate::spec::TestSpec;
use crate::util;

/// Cap on captured apply-command output folded into logs and verdicts.
const APPLY_OUTPUT_CAP: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub instance_id: String,
    pub image_tag: String,
    pub container_id: String,
    pub started_at_unix_ms: u64,
    pub finished_at_unix_ms: u64,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub log_path: String,
}

#[derive(Debug)]
pub enum RunnerOutcome {
    /// The combined patch did not apply; the test command never ran.
    PatchFailed { apply_log: String },
    /// The eval script ran (possibly into the timeout).
    Finished {
        exit_code: Option<i32>,
        timed_out: bool,
    },
    /// A cooperative cancel cut the run short; no verdict is owed.
    Cancelled,
}

/// Host-side paths for one run. Callers pick the file names so the
/// evaluation and collection pipelines can lay out their artifacts
/// differently.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub patch_file: PathBuf,
    pub eval_script_file: PathBuf,
    pub run_log: PathBuf,
    /// Local directory the in-container report tree is exported into.
    pub report_export_dir: PathBuf,
}

pub struct RunRequest<'a> {
    pub spec: &'a TestSpec,
    /// Combined patch bytes; empty means "apply nothing".
    pub patch: &'a str,
    pub container_name: String,
    pub paths: &'a RunPaths,
    pub grace_seconds: u64,
    /// Raised by the scheduler on cancellation; the in-flight exec is
    /// killed and the container torn down within the grace window.
    pub cancel: Option<&'a AtomicBool>,
}

/// Removes the container on drop, so early returns and panics cannot leak
/// one past its RunRecord.
struct ContainerGuard<'a> {
    engine: &'a Engine,
    id: String,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.engine.remove_container(&self.id) {
            warn!(container = %self.id, error = %e, "container removal failed");
        }
    }
}

/// Run the patch-then-test protocol. Engine-level errors surface as
/// `EngineError` so the scheduler can tell a broken engine from a failed
/// instance.
pub fn run(engine: &Engine, req: &RunRequest<'_>) -> EngineResult<(RunnerOutcome, RunRecord)> {
    let spec = req.spec;
    let started = util::unix_millis_now();

    // A leftover container with this name from a crashed run would make
    // create fail; probe and remove it first.
    if engine.container_exists(&req.container_name)? {
        warn!(container = %req.container_name, "removing leftover container");
        engine.remove_container(&req.container_name)?;
    }

    let container_id =
        engine.create_container(&spec.instance_tag, &req.container_name, spec.network_run)?;
    let guard = ContainerGuard {
        engine,
        id: container_id.clone(),
    };
    engine.start_container(&container_id)?;

    info!(
        instance = %spec.instance_id,
        container = %container_id,
        "container started"
    );

    let mut run_log = stage_files(req).map_err(|e| EngineError::Io {
        op: "stage run files".to_string(),
        source: std::io::Error::other(format!("{e:#}")),
    })?;

    engine.copy_in(&container_id, &req.paths.patch_file, CONTAINER_PATCH_PATH)?;
    engine.copy_in(&container_id, &req.paths.eval_script_file, CONTAINER_EVAL_PATH)?;

    if !req.patch.trim().is_empty() {
        match apply_patch(engine, &container_id, spec, &mut run_log)? {
            ApplyResult::Applied => {}
            ApplyResult::Rejected { apply_log } => {
                let record = finish_record(spec, &container_id, started, None, false, req);
                teardown(engine, &container_id, false, req.grace_seconds);
                drop(guard);
                return Ok((RunnerOutcome::PatchFailed { apply_log }, record));
            }
        }
    } else {
        log_line(&mut run_log, "empty patch; nothing to apply");
    }

    let status = engine.exec_streamed(
        &container_id,
        Some(CONTAINER_WORKDIR),
        &format!("/bin/bash {CONTAINER_EVAL_PATH}"),
        Duration::from_secs(spec.timeout_seconds),
        run_log,
        req.cancel,
    )?;

    if status.cancelled {
        info!(instance = %spec.instance_id, "run cancelled");
        let record = finish_record(spec, &container_id, started, None, false, req);
        teardown(engine, &container_id, true, req.grace_seconds);
        drop(guard);
        return Ok((RunnerOutcome::Cancelled, record));
    }

    if status.timed_out {
        warn!(instance = %spec.instance_id, "eval script timed out");
    }

    if let Some(dir) = &spec.report_dir {
        export_reports(engine, &container_id, dir, &req.paths.report_export_dir);
    }

    let record = finish_record(
        spec,
        &container_id,
        started,
        status.exit_code,
        status.timed_out,
        req,
    );
    teardown(engine, &container_id, status.timed_out, req.grace_seconds);
    drop(guard);

    Ok((
        RunnerOutcome::Finished {
            exit_code: status.exit_code,
            timed_out: status.timed_out,
        },
        record,
    ))
}

enum ApplyResult {
    Applied,
    Rejected { apply_log: String },
}

/// Try the apply ladder in order; the first zero-exit command wins. All
/// attempts and their output land in `run.log` ahead of the test output.
fn apply_patch(
    engine: &Engine,
    container_id: &str,
    spec: &TestSpec,
    run_log: &mut File,
) -> EngineResult<ApplyResult> {
    let mut transcript = String::new();

    for cmd in &spec.apply_cmds {
        let script = format!("{cmd} {CONTAINER_PATCH_PATH}");
        let out = engine.exec_capture(
            container_id,
            Some(CONTAINER_WORKDIR),
            &script,
            Duration::from_secs(300),
            APPLY_OUTPUT_CAP,
        )?;

        transcript.push_str(&format!("$ {script}\n"));
        transcript.push_str(&String::from_utf8_lossy(&out.stdout));
        transcript.push_str(&String::from_utf8_lossy(&out.stderr));
        if !transcript.ends_with('\n') {
            transcript.push('\n');
        }
        if out.stdout_truncated || out.stderr_truncated {
            transcript.push_str("[apply output truncated at capture cap]\n");
        }

        if out.success() {
            debug!(instance = %spec.instance_id, cmd = %cmd, "patch applied");
            log_line(run_log, &format!(">>>>> Applied Patch ({cmd})"));
            log_line(run_log, &transcript);
            return Ok(ApplyResult::Applied);
        }
    }

    log_line(run_log, ">>>>> Patch Apply Failed");
    log_line(run_log, &transcript);
    Ok(ApplyResult::Rejected {
        apply_log: transcript,
    })
}

fn export_reports(engine: &Engine, container_id: &str, container_dir: &str, dest: &Path) {
    if let Err(e) = std::fs::create_dir_all(dest) {
        warn!(error = %e, "report export dir creation failed");
        return;
    }
    match engine.copy_out(container_id, container_dir, dest) {
        Ok(true) => debug!(container_dir, "report tree exported"),
        Ok(false) => debug!(container_dir, "no report tree produced"),
        Err(e) => warn!(error = %e, "report export failed"),
    }
}

/// Graceful stop on the timeout path, then unconditional removal (the
/// guard repeats the removal, which is a no-op by then).
fn teardown(engine: &Engine, container_id: &str, timed_out: bool, grace_seconds: u64) {
    if timed_out {
        if let Err(e) = engine.stop_container(container_id, grace_seconds) {
            warn!(container = %container_id, error = %e, "container stop failed");
        }
    }
    if let Err(e) = engine.remove_container(container_id) {
        warn!(container = %container_id, error = %e, "container removal failed");
    }
}

fn stage_files(req: &RunRequest<'_>) -> Result<File> {
    util::write_atomic(&req.paths.patch_file, req.patch.as_bytes())
        .with_context(|| format!("write patch {}", req.paths.patch_file.display()))?;
    util::write_atomic(
        &req.paths.eval_script_file,
        req.spec.eval_script.as_bytes(),
    )
    .with_context(|| format!("write eval script {}", req.paths.eval_script_file.display()))?;

    if let Some(parent) = req.paths.run_log.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    File::create(&req.paths.run_log)
        .with_context(|| format!("create run log {}", req.paths.run_log.display()))
}

fn finish_record(
    spec: &TestSpec,
    container_id: &str,
    started_at_unix_ms: u64,
    exit_code: Option<i32>,
    timed_out: bool,
    req: &RunRequest<'_>,
) -> RunRecord {
    RunRecord {
        instance_id: spec.instance_id.clone(),
        image_tag: spec.instance_tag.clone(),
        container_id: container_id.to_string(),
        started_at_unix_ms,
        finished_at_unix_ms: util::unix_millis_now(),
        exit_code,
        timed_out,
        log_path: req.paths.run_log.display().to_string(),
    }
}

fn log_line(log: &mut File, line: &str) {
    use std::io::Write as _;
    let _ = writeln!(log, "{line}");
}

/// Container names are namespaced per run so a crashed run's leftovers
/// cannot collide with a live one.
pub fn container_name(run_id: &str, instance_id: &str) -> String {
    format!(
        "patchbench.{}.{}",
        util::safe_dir_name(run_id),
        util::safe_dir_name(instance_id)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_engine_safe() {
        let name = container_name("run 1", "owner/repo:1.2");
        assert_eq!(name, "patchbench.run_1.owner_repo_1.2");
    }
}
