//! patchbench: an evaluation harness for candidate code patches.
//!
//! For each task instance the harness builds a layered container
//! environment (base -> env -> instance), applies the candidate patch to a
//! pinned repository snapshot inside a fresh container, runs the declared
//! test command under a wall-clock timeout, parses the captured output into
//! a canonical test-status map, and grades it against the instance's
//! expected test transitions.

pub mod builder;
pub mod collect;
pub mod grader;
pub mod instance;
pub mod parser;
pub mod profile;
pub mod report;
pub mod runner;
pub mod schedule;
pub mod schema;
pub mod spec;
pub mod util;
