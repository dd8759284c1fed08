//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for the `schema_version`
//! strings that appear in machine-readable I/O. A document whose
//! `schema_version` does not match the pinned constant is rejected at load
//! time rather than silently reinterpreted.

pub const DATASET_INSTANCE_SCHEMA_VERSION: &str = "patchbench.instance@0.1.0";
pub const PREDICTION_SCHEMA_VERSION: &str = "patchbench.prediction@0.1.0";

pub const TEST_SPEC_SCHEMA_VERSION: &str = "patchbench.test-spec@0.1.0";
pub const PARSED_RESULT_SCHEMA_VERSION: &str = "patchbench.parsed@0.1.0";
pub const VERDICT_SCHEMA_VERSION: &str = "patchbench.verdict@0.1.0";
pub const RUN_SUMMARY_SCHEMA_VERSION: &str = "patchbench.summary@0.1.0";
pub const COLLECT_REPORT_SCHEMA_VERSION: &str = "patchbench.collect.report@0.1.0";
