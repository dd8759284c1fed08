//! Result persistence.
//!
//! Per-instance artifacts live under `<root>/<run_id>/<instance_id>/`;
//! `verdict.json` is the commit marker: its presence means the instance is
//! complete and a restarted run will not redo it. The run summary is
//! deterministic: rows are sorted by instance id and no timings are
//! recorded in it, so re-running a finished run rewrites it byte for byte.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::grader::Resolution;
use crate::parser::{ParsedResult, TestStatus};
use crate::schema;
use crate::spec::TestSpec;
use crate::util;

#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
    run_id: String,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(util::safe_dir_name(&self.run_id))
    }

    pub fn build_logs_dir(&self) -> PathBuf {
        self.run_dir().join("build_logs")
    }

    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.run_dir().join(util::safe_dir_name(instance_id))
    }

    pub fn spec_path(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("spec.json")
    }

    pub fn run_log_path(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("run.log")
    }

    pub fn parsed_path(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("parsed.json")
    }

    pub fn verdict_path(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("verdict.json")
    }

    pub fn reports_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("reports")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.run_dir().join("summary.json")
    }

    /// An instance is complete for this run iff its verdict file exists.
    pub fn is_complete(&self, instance_id: &str) -> bool {
        self.verdict_path(instance_id).is_file()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timings {
    #[serde(default)]
    pub build_ms: u64,
    #[serde(default)]
    pub run_ms: u64,
    #[serde(default)]
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub schema_version: String,
    pub instance_id: String,
    pub resolved: Resolution,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default)]
    pub timings: Timings,
}

impl Verdict {
    pub fn new(instance_id: &str, resolved: Resolution, reason: impl Into<String>) -> Self {
        Self {
            schema_version: patchbench_contracts::VERDICT_SCHEMA_VERSION.to_string(),
            instance_id: instance_id.to_string(),
            resolved,
            reason: reason.into(),
            message: None,
            notes: Vec::new(),
            timings: Timings::default(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub fn write_spec_snapshot(layout: &RunLayout, spec: &TestSpec) -> Result<()> {
    util::write_json_atomic(&layout.spec_path(&spec.instance_id), spec)
}

#[derive(Debug, Serialize, Deserialize)]
struct ParsedDoc {
    schema_version: String,
    instance_id: String,
    tests: BTreeMap<String, TestStatus>,
}

pub fn write_parsed(layout: &RunLayout, instance_id: &str, parsed: &ParsedResult) -> Result<()> {
    let doc = ParsedDoc {
        schema_version: patchbench_contracts::PARSED_RESULT_SCHEMA_VERSION.to_string(),
        instance_id: instance_id.to_string(),
        tests: parsed.clone(),
    };
    util::write_json_atomic(&layout.parsed_path(instance_id), &doc)
}

pub fn load_parsed(path: &Path) -> Result<ParsedResult> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let doc: ParsedDoc = serde_json::from_slice(&bytes)
        .with_context(|| format!("decode parsed result {}", path.display()))?;
    Ok(doc.tests)
}

/// The verdict write is the commit point; everything else for the instance
/// must already be on disk when this runs.
pub fn write_verdict(layout: &RunLayout, verdict: &Verdict) -> Result<()> {
    let value = serde_json::to_value(verdict).context("encode verdict")?;
    let validator = schema::verdict_validator()?;
    if let Some(err) = validator.iter_errors(&value).next() {
        bail!("E_VERDICT_SCHEMA: {err}");
    }
    util::write_json_atomic(&layout.verdict_path(&verdict.instance_id), verdict)
}

pub fn load_verdict(layout: &RunLayout, instance_id: &str) -> Result<Verdict> {
    let path = layout.verdict_path(instance_id);
    let bytes = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let verdict: Verdict = serde_json::from_slice(&bytes)
        .with_context(|| format!("decode verdict {}", path.display()))?;
    if verdict.schema_version != patchbench_contracts::VERDICT_SCHEMA_VERSION {
        bail!(
            "E_VERDICT_SCHEMA_VERSION: expected {} got {:?} in {}",
            patchbench_contracts::VERDICT_SCHEMA_VERSION,
            verdict.schema_version,
            path.display()
        );
    }
    Ok(verdict)
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryTotals {
    pub instances: usize,
    pub resolved: usize,
    pub partially_resolved: usize,
    pub unresolved: usize,
    pub build_error: usize,
    pub run_error: usize,
    pub timeout: usize,
    pub parse_error: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub skipped_no_prediction: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryRow {
    pub instance_id: String,
    pub resolved: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Summary {
    pub schema_version: String,
    pub run_id: String,
    pub totals: SummaryTotals,
    pub instances: Vec<SummaryRow>,
}

/// Fold verdicts into the aggregate summary. Rows are sorted by instance
/// id; timings are deliberately excluded so the summary is reproducible.
pub fn summarize(run_id: &str, verdicts: &[Verdict], skipped_no_prediction: usize) -> Summary {
    let mut totals = SummaryTotals {
        instances: verdicts.len(),
        skipped_no_prediction,
        ..SummaryTotals::default()
    };
    let mut rows = Vec::with_capacity(verdicts.len());

    for v in verdicts {
        match v.resolved {
            Resolution::Resolved => totals.resolved += 1,
            Resolution::PartiallyResolved => totals.partially_resolved += 1,
            Resolution::Unresolved => totals.unresolved += 1,
            Resolution::BuildError => totals.build_error += 1,
            Resolution::RunError => totals.run_error += 1,
            Resolution::Timeout => totals.timeout += 1,
            Resolution::ParseError => totals.parse_error += 1,
        }
        rows.push(SummaryRow {
            instance_id: v.instance_id.clone(),
            resolved: v.resolved.as_str().to_string(),
            reason: v.reason.clone(),
        });
    }

    rows.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    Summary {
        schema_version: patchbench_contracts::RUN_SUMMARY_SCHEMA_VERSION.to_string(),
        run_id: run_id.to_string(),
        totals,
        instances: rows,
    }
}

pub fn write_summary(layout: &RunLayout, summary: &Summary) -> Result<()> {
    let value = serde_json::to_value(summary).context("encode summary")?;
    let validator = schema::summary_validator()?;
    if let Some(err) = validator.iter_errors(&value).next() {
        bail!("E_SUMMARY_SCHEMA: {err}");
    }
    util::write_json_atomic(&layout.summary_path(), summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DIR_N: AtomicUsize = AtomicUsize::new(0);

    fn layout() -> RunLayout {
        let root = std::env::temp_dir().join(format!(
            "patchbench_report_{}_{}",
            std::process::id(),
            DIR_N.fetch_add(1, Ordering::Relaxed)
        ));
        RunLayout::new(root, "run1")
    }

    #[test]
    fn verdict_round_trips_and_marks_complete() {
        let layout = layout();
        assert!(!layout.is_complete("i1"));

        let verdict = Verdict::new("i1", Resolution::Resolved, "all_expected_tests_passed");
        write_verdict(&layout, &verdict).unwrap();
        assert!(layout.is_complete("i1"));

        let loaded = load_verdict(&layout, "i1").unwrap();
        assert_eq!(loaded.resolved, Resolution::Resolved);
        assert_eq!(loaded.reason, "all_expected_tests_passed");
        let _ = std::fs::remove_dir_all(layout.run_dir());
    }

    #[test]
    fn parsed_round_trips() {
        let layout = layout();
        let mut parsed = ParsedResult::new();
        parsed.insert("pkg.T::m1".to_string(), TestStatus::Passed);
        parsed.insert("pkg.T::m2".to_string(), TestStatus::Failed);

        write_parsed(&layout, "i1", &parsed).unwrap();
        let loaded = load_parsed(&layout.parsed_path("i1")).unwrap();
        assert_eq!(loaded, parsed);
        let _ = std::fs::remove_dir_all(layout.run_dir());
    }

    #[test]
    fn summary_is_deterministic_bytes() {
        let verdicts = vec![
            Verdict::new("b", Resolution::Unresolved, "fail_to_pass_unmet"),
            Verdict::new("a", Resolution::Resolved, "all_expected_tests_passed"),
        ];
        let one = summarize("run1", &verdicts, 0);
        let reordered = vec![verdicts[1].clone(), verdicts[0].clone()];
        let two = summarize("run1", &reordered, 0);
        assert_eq!(
            util::pretty_json_bytes(&one).unwrap(),
            util::pretty_json_bytes(&two).unwrap()
        );
        assert_eq!(one.instances[0].instance_id, "a");
        assert_eq!(one.totals.resolved, 1);
        assert_eq!(one.totals.unresolved, 1);
    }

    #[test]
    fn summary_write_validates_against_schema() {
        let layout = layout();
        let summary = summarize("run1", &[], 2);
        write_summary(&layout, &summary).unwrap();
        let bytes = std::fs::read(layout.summary_path()).unwrap();
        let doc: Summary = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc.totals.skipped_no_prediction, 2);
        let _ = std::fs::remove_dir_all(layout.run_dir());
    }
}
