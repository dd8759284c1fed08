//! Verdict computation.
//!
//! Error categories (`build_error`, `run_error`, `timeout`, `parse_error`)
//! are decided upstream and take precedence, in that order, over the
//! resolution trichotomy computed here: a timed-out run means "we never
//! observed", which must not be conflated with "we observed no pass".

use serde::{Deserialize, Serialize};

use crate::parser::{ParsedResult, TestStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Resolved,
    PartiallyResolved,
    Unresolved,
    BuildError,
    RunError,
    Timeout,
    ParseError,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Resolved => "resolved",
            Resolution::PartiallyResolved => "partially_resolved",
            Resolution::Unresolved => "unresolved",
            Resolution::BuildError => "build_error",
            Resolution::RunError => "run_error",
            Resolution::Timeout => "timeout",
            Resolution::ParseError => "parse_error",
        }
    }

    /// Every variant is terminal; error variants mean the judgement is
    /// undefined for the stated reason.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Resolution::BuildError
                | Resolution::RunError
                | Resolution::Timeout
                | Resolution::ParseError
        )
    }
}

#[derive(Debug, Clone)]
pub struct Grade {
    pub resolution: Resolution,
    pub reason: &'static str,
    pub notes: Vec<String>,
}

/// Grade a parsed result against the expected test sets.
///
/// - `resolved`: every FAIL_TO_PASS test passed and every PASS_TO_PASS test
///   passed. With an empty FAIL_TO_PASS set the verdict is `resolved` iff
///   no PASS_TO_PASS test regressed.
/// - `partially_resolved`: at least one FAIL_TO_PASS test passed and no
///   PASS_TO_PASS test regressed, but not all FAIL_TO_PASS passed.
/// - `unresolved` otherwise.
///
/// A regression is a PASS_TO_PASS test observed as `failed` or `error`; a
/// test missing from the parsed result is "not passed" but not a
/// regression.
pub fn grade(parsed: &ParsedResult, fail_to_pass: &[String], pass_to_pass: &[String]) -> Grade {
    let mut notes = Vec::new();

    let mut f2p_passed = 0usize;
    for id in fail_to_pass {
        match parsed.get(id) {
            Some(TestStatus::Passed) => f2p_passed += 1,
            Some(status) => notes.push(format!("fail_to_pass {id} observed {}", status_str(*status))),
            None => notes.push(format!("fail_to_pass {id} not observed")),
        }
    }

    let mut p2p_passed = 0usize;
    let mut p2p_regressed = 0usize;
    for id in pass_to_pass {
        match parsed.get(id) {
            Some(TestStatus::Passed) => p2p_passed += 1,
            Some(TestStatus::Failed) | Some(TestStatus::Error) => {
                p2p_regressed += 1;
                notes.push(format!("pass_to_pass regression: {id}"));
            }
            Some(TestStatus::Skipped) => notes.push(format!("pass_to_pass {id} skipped")),
            None => notes.push(format!("pass_to_pass {id} not observed")),
        }
    }

    let all_f2p = f2p_passed == fail_to_pass.len();
    let all_p2p = p2p_passed == pass_to_pass.len();
    let no_regression = p2p_regressed == 0;

    if fail_to_pass.is_empty() {
        return if no_regression {
            Grade {
                resolution: Resolution::Resolved,
                reason: "no_fail_to_pass_and_no_regression",
                notes,
            }
        } else {
            Grade {
                resolution: Resolution::Unresolved,
                reason: "pass_to_pass_regression",
                notes,
            }
        };
    }

    if all_f2p && all_p2p {
        Grade {
            resolution: Resolution::Resolved,
            reason: "all_expected_tests_passed",
            notes,
        }
    } else if !no_regression {
        Grade {
            resolution: Resolution::Unresolved,
            reason: "pass_to_pass_regression",
            notes,
        }
    } else if !all_f2p && f2p_passed > 0 {
        Grade {
            resolution: Resolution::PartiallyResolved,
            reason: "some_fail_to_pass_unmet",
            notes,
        }
    } else if !all_f2p {
        Grade {
            resolution: Resolution::Unresolved,
            reason: "fail_to_pass_unmet",
            notes,
        }
    } else {
        Grade {
            resolution: Resolution::Unresolved,
            reason: "pass_to_pass_incomplete",
            notes,
        }
    }
}

fn status_str(s: TestStatus) -> &'static str {
    match s {
        TestStatus::Passed => "passed",
        TestStatus::Failed => "failed",
        TestStatus::Error => "error",
        TestStatus::Skipped => "skipped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::TestStatus;

    fn parsed(entries: &[(&str, TestStatus)]) -> ParsedResult {
        entries
            .iter()
            .map(|(id, s)| (id.to_string(), *s))
            .collect()
    }

    fn sets() -> (Vec<String>, Vec<String>) {
        (
            vec!["pkg.T::m1".to_string()],
            vec!["pkg.T::m2".to_string()],
        )
    }

    #[test]
    fn both_expected_sets_pass_is_resolved() {
        let (f2p, p2p) = sets();
        let g = grade(
            &parsed(&[("pkg.T::m1", TestStatus::Passed), ("pkg.T::m2", TestStatus::Passed)]),
            &f2p,
            &p2p,
        );
        assert_eq!(g.resolution, Resolution::Resolved);
    }

    #[test]
    fn failing_fail_to_pass_is_unresolved() {
        let (f2p, p2p) = sets();
        let g = grade(
            &parsed(&[("pkg.T::m1", TestStatus::Failed), ("pkg.T::m2", TestStatus::Passed)]),
            &f2p,
            &p2p,
        );
        assert_eq!(g.resolution, Resolution::Unresolved);
        assert_eq!(g.reason, "fail_to_pass_unmet");
    }

    #[test]
    fn pass_to_pass_regression_is_unresolved() {
        let (f2p, p2p) = sets();
        let g = grade(
            &parsed(&[("pkg.T::m1", TestStatus::Passed), ("pkg.T::m2", TestStatus::Failed)]),
            &f2p,
            &p2p,
        );
        assert_eq!(g.resolution, Resolution::Unresolved);
        assert_eq!(g.reason, "pass_to_pass_regression");
    }

    #[test]
    fn partial_progress_without_regression() {
        let f2p = vec!["a::one".to_string(), "a::two".to_string()];
        let p2p = vec!["a::base".to_string()];
        let g = grade(
            &parsed(&[
                ("a::one", TestStatus::Passed),
                ("a::two", TestStatus::Failed),
                ("a::base", TestStatus::Passed),
            ]),
            &f2p,
            &p2p,
        );
        assert_eq!(g.resolution, Resolution::PartiallyResolved);
    }

    #[test]
    fn empty_fail_to_pass_resolves_without_regression() {
        let p2p = vec!["a::base".to_string()];
        let g = grade(&parsed(&[("a::base", TestStatus::Passed)]), &[], &p2p);
        assert_eq!(g.resolution, Resolution::Resolved);

        let g = grade(&parsed(&[("a::base", TestStatus::Error)]), &[], &p2p);
        assert_eq!(g.resolution, Resolution::Unresolved);
    }

    #[test]
    fn missing_fail_to_pass_test_is_not_passed() {
        let (f2p, p2p) = sets();
        let g = grade(&parsed(&[("pkg.T::m2", TestStatus::Passed)]), &f2p, &p2p);
        assert_eq!(g.resolution, Resolution::Unresolved);
    }

    #[test]
    fn skipped_pass_to_pass_is_not_a_regression_but_blocks_resolved() {
        let (f2p, p2p) = sets();
        let g = grade(
            &parsed(&[("pkg.T::m1", TestStatus::Passed), ("pkg.T::m2", TestStatus::Skipped)]),
            &f2p,
            &p2p,
        );
        assert_eq!(g.resolution, Resolution::Unresolved);
        assert_eq!(g.reason, "pass_to_pass_incomplete");
    }
}
