//! Dataset and prediction inputs.
//!
//! A dataset is a sequence of task instances, stored either as one JSON
//! array or as JSON-lines; both are accepted and the format is sniffed from
//! the first non-whitespace byte. Every record is validated against the
//! embedded instance schema before decoding, so a malformed dataset fails
//! loudly at startup instead of mid-run.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "Python")]
    Python,
    #[serde(alias = "Java")]
    Java,
    #[serde(alias = "Kotlin")]
    Kotlin,
    #[serde(alias = "Go")]
    Go,
    #[serde(alias = "C")]
    C,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Kotlin => "kotlin",
            Language::Go => "go",
            Language::C => "c",
        }
    }
}

/// One evaluation task: a repository snapshot, a defect-fixing patch, and
/// the expected test transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub repo: String,
    pub base_commit: String,
    pub patch: String,
    #[serde(default)]
    pub test_patch: Option<String>,
    pub version: String,
    pub language: Language,
    #[serde(rename = "FAIL_TO_PASS", default)]
    pub fail_to_pass: Vec<String>,
    #[serde(rename = "PASS_TO_PASS", default)]
    pub pass_to_pass: Vec<String>,
}

impl Instance {
    /// The bytes applied inside the container: test patch first (it may
    /// introduce files the fix patch touches), then the candidate patch.
    pub fn combined_patch(&self, candidate: &str) -> String {
        let mut out = String::new();
        if let Some(tp) = &self.test_patch {
            if !tp.is_empty() {
                out.push_str(tp);
                if !tp.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        out.push_str(candidate);
        if !candidate.is_empty() && !candidate.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

pub fn load_dataset(path: &Path) -> Result<Vec<Instance>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("E_DATASET_READ: read dataset {}", path.display()))?;

    let docs = parse_record_stream(&bytes)
        .with_context(|| format!("E_DATASET_PARSE: parse dataset {}", path.display()))?;

    let validator = schema::instance_validator()?;
    let mut out = Vec::with_capacity(docs.len());
    let mut seen = BTreeMap::new();

    for (idx, doc) in docs.into_iter().enumerate() {
        if let Some(err) = validator.iter_errors(&doc).next() {
            bail!(
                "E_DATASET_SCHEMA: record {} invalid at {}: {}",
                idx,
                err.instance_path,
                err
            );
        }
        let inst: Instance = serde_json::from_value(doc)
            .with_context(|| format!("E_DATASET_DECODE: decode record {idx}"))?;

        if inst.instance_id.trim().is_empty() {
            bail!("E_DATASET_INSTANCE_ID_EMPTY: record {idx}");
        }
        if let Some(prev) = seen.insert(inst.instance_id.clone(), idx) {
            bail!(
                "E_DATASET_DUPLICATE_ID: {} appears at records {} and {}",
                inst.instance_id,
                prev,
                idx
            );
        }
        out.push(inst);
    }

    Ok(out)
}

/// A candidate patch for one instance.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub patch: String,
    pub model_name_or_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PredictionLine {
    #[serde(default)]
    schema_version: Option<String>,
    instance_id: String,
    #[serde(alias = "model_patch")]
    patch: String,
    #[serde(default)]
    model_name_or_path: Option<String>,
}

/// Predictions are either a JSON object map `{instance_id: patch}` or
/// JSON-lines records `{instance_id, patch, model_name_or_path?}`.
pub fn load_predictions(path: &Path) -> Result<BTreeMap<String, Prediction>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("E_PRED_READ: read predictions {}", path.display()))?;

    let first = bytes.iter().find(|b| !b.is_ascii_whitespace()).copied();
    let mut out = BTreeMap::new();

    if first == Some(b'{') {
        // Either a single map document or JSON-lines of objects; a map is
        // distinguished by parsing the whole file as one value. A lone
        // prediction record also parses whole, so the record marker key
        // excludes it.
        if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&bytes) {
            if !map.contains_key("instance_id") && map.values().all(Value::is_string) {
                for (id, patch) in map {
                    out.insert(
                        id,
                        Prediction {
                            patch: patch.as_str().unwrap_or_default().to_string(),
                            model_name_or_path: None,
                        },
                    );
                }
                return Ok(out);
            }
        }
    }

    let validator = schema::prediction_validator()?;
    for (idx, line) in bytes.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.with_context(|| {
            format!("E_PRED_IO: read {} line {}", path.display(), line_no)
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let doc: Value = serde_json::from_str(&line).with_context(|| {
            format!("E_PRED_JSON_PARSE: {}:{}", path.display(), line_no)
        })?;
        if let Some(err) = validator.iter_errors(&doc).next() {
            bail!("E_PRED_SCHEMA: {}:{}: {}", path.display(), line_no, err);
        }

        let row: PredictionLine = serde_json::from_value(doc)
            .with_context(|| format!("E_PRED_DECODE: {}:{}", path.display(), line_no))?;

        if let Some(sv) = &row.schema_version {
            if sv != patchbench_contracts::PREDICTION_SCHEMA_VERSION {
                bail!(
                    "E_PRED_SCHEMA_VERSION: unsupported {:?} at line {}",
                    sv,
                    line_no
                );
            }
        }
        if row.instance_id.trim().is_empty() {
            bail!("E_PRED_INSTANCE_ID_EMPTY at line {}", line_no);
        }
        if out.contains_key(&row.instance_id) {
            bail!(
                "E_PRED_DUPLICATE_INSTANCE_ID: {} at line {}",
                row.instance_id,
                line_no
            );
        }

        out.insert(
            row.instance_id,
            Prediction {
                patch: row.patch,
                model_name_or_path: row.model_name_or_path,
            },
        );
    }

    Ok(out)
}

/// Parse a byte stream as a JSON array of objects or as JSON-lines.
fn parse_record_stream(bytes: &[u8]) -> Result<Vec<Value>> {
    let first = bytes.iter().find(|b| !b.is_ascii_whitespace()).copied();
    match first {
        Some(b'[') => {
            let docs: Vec<Value> = serde_json::from_slice(bytes).context("parse JSON array")?;
            Ok(docs)
        }
        Some(_) => {
            let mut out = Vec::new();
            for (idx, line) in bytes.lines().enumerate() {
                let line = line.with_context(|| format!("read line {}", idx + 1))?;
                if line.trim().is_empty() {
                    continue;
                }
                let doc: Value = serde_json::from_str(&line)
                    .with_context(|| format!("parse JSON at line {}", idx + 1))?;
                out.push(doc);
            }
            Ok(out)
        }
        None => Err(anyhow!("empty input")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_instance_json(id: &str) -> String {
        format!(
            r#"{{"instance_id":"{id}","repo":"octocat/widgets","base_commit":"deadbeef","patch":"","version":"1.0","language":"python","FAIL_TO_PASS":[],"PASS_TO_PASS":[]}}"#
        )
    }

    fn tmp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("patchbench_inst_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn dataset_accepts_array_and_jsonl() {
        let a = tmp_file(
            "ds_array.json",
            &format!("[{}]", minimal_instance_json("i1")),
        );
        let got = load_dataset(&a).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].instance_id, "i1");
        assert_eq!(got[0].language, Language::Python);

        let b = tmp_file(
            "ds_lines.jsonl",
            &format!(
                "{}\n{}\n",
                minimal_instance_json("i1"),
                minimal_instance_json("i2")
            ),
        );
        let got = load_dataset(&b).unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn dataset_rejects_duplicate_ids() {
        let p = tmp_file(
            "ds_dup.jsonl",
            &format!(
                "{}\n{}\n",
                minimal_instance_json("same"),
                minimal_instance_json("same")
            ),
        );
        let err = load_dataset(&p).unwrap_err().to_string();
        assert!(err.contains("E_DATASET_DUPLICATE_ID"), "{err}");
    }

    #[test]
    fn dataset_rejects_missing_fields() {
        let p = tmp_file("ds_bad.jsonl", r#"{"instance_id":"x"}"#);
        let err = load_dataset(&p).unwrap_err().to_string();
        assert!(err.contains("E_DATASET_SCHEMA"), "{err}");
    }

    #[test]
    fn predictions_accept_map_and_jsonl() {
        let m = tmp_file("pred_map.json", r#"{"i1":"diff --git a b"}"#);
        let got = load_predictions(&m).unwrap();
        assert_eq!(got["i1"].patch, "diff --git a b");

        let l = tmp_file(
            "pred_lines.jsonl",
            "{\"instance_id\":\"i1\",\"patch\":\"p\",\"model_name_or_path\":\"m\"}\n",
        );
        let got = load_predictions(&l).unwrap();
        assert_eq!(got["i1"].model_name_or_path.as_deref(), Some("m"));
    }

    #[test]
    fn predictions_accept_model_patch_alias() {
        let l = tmp_file(
            "pred_alias.jsonl",
            "{\"instance_id\":\"i1\",\"model_patch\":\"p\"}\n",
        );
        let got = load_predictions(&l).unwrap();
        assert_eq!(got["i1"].patch, "p");
    }

    #[test]
    fn combined_patch_orders_test_patch_first() {
        let inst = Instance {
            instance_id: "i".into(),
            repo: "o/r".into(),
            base_commit: "c".into(),
            patch: String::new(),
            test_patch: Some("TEST".into()),
            version: "1".into(),
            language: Language::Go,
            fail_to_pass: Vec::new(),
            pass_to_pass: Vec::new(),
        };
        assert_eq!(inst.combined_patch("FIX"), "TEST\nFIX\n");
    }
}
