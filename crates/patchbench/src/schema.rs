//! Embedded JSON Schemas for machine-readable I/O.
//!
//! Input documents are validated before decoding; the run summary is
//! validated before it is written. Schemas live under `spec/` at the
//! workspace root and are compiled in.

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde_json::Value;

const INSTANCE_SCHEMA_BYTES: &[u8] =
    include_bytes!("../../../spec/patchbench.instance.schema.json");
const PREDICTION_SCHEMA_BYTES: &[u8] =
    include_bytes!("../../../spec/patchbench.prediction.schema.json");
const VERDICT_SCHEMA_BYTES: &[u8] = include_bytes!("../../../spec/patchbench.verdict.schema.json");
const SUMMARY_SCHEMA_BYTES: &[u8] = include_bytes!("../../../spec/patchbench.summary.schema.json");

pub fn instance_validator() -> Result<Validator> {
    build(INSTANCE_SCHEMA_BYTES)
}

pub fn prediction_validator() -> Result<Validator> {
    build(PREDICTION_SCHEMA_BYTES)
}

pub fn verdict_validator() -> Result<Validator> {
    build(VERDICT_SCHEMA_BYTES)
}

pub fn summary_validator() -> Result<Validator> {
    build(SUMMARY_SCHEMA_BYTES)
}

fn build(bytes: &[u8]) -> Result<Validator> {
    let schema: Value = serde_json::from_slice(bytes).context("parse embedded schema")?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|e| anyhow::anyhow!("build schema validator: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_schemas_compile() {
        instance_validator().unwrap();
        prediction_validator().unwrap();
        verdict_validator().unwrap();
        summary_validator().unwrap();
    }
}
