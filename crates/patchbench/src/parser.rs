//! Log parsers: raw captured test output -> canonical `{test_id: status}`.
//!
//! Two styles coexist. Text parsers scan the captured stream line by line
//! with anchored patterns for one test framework; they never backtrack
//! across the log, and the last observed status for a test id wins (reruns
//! within a run are legal). Structured parsers read exported report files
//! (JUnit-style XML); when both exist the structured report is
//! authoritative and text results only fill in tests the report does not
//! mention.
//!
//! Canonical test id form is `<suite-or-file>::<name>`: tool-specific
//! separators are normalised to `::`, ANSI escapes stripped, whitespace
//! collapsed, parameterised suffixes kept verbatim.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Sentinel lines the eval script prints around the test command. When both
/// are present only the window between them is scanned.
pub const START_TEST_OUTPUT: &str = ">>>>> Start Test Output";
pub const END_TEST_OUTPUT: &str = ">>>>> End Test Output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParserId {
    Pytest,
    GoTest,
    GradleText,
    CtestText,
    /// JUnit XML report tree, with gradle-style text output as fill-in.
    JunitXml,
}

impl ParserId {
    pub fn as_str(self) -> &'static str {
        match self {
            ParserId::Pytest => "pytest",
            ParserId::GoTest => "go-test",
            ParserId::GradleText => "gradle-text",
            ParserId::CtestText => "ctest-text",
            ParserId::JunitXml => "junit-xml",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

pub type ParsedResult = BTreeMap<String, TestStatus>;

#[derive(Debug)]
pub enum ParseError {
    /// The run produced output but no test result could be recognised.
    NoTestsFound,
    /// A structured report exists but cannot be read as such.
    MalformedReport(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NoTestsFound => write!(f, "no test results observed in output"),
            ParseError::MalformedReport(msg) => write!(f, "malformed structured report: {msg}"),
        }
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    pub fn reason(&self) -> &'static str {
        match self {
            ParseError::NoTestsFound => "no_tests_found",
            ParseError::MalformedReport(_) => "log_unparseable",
        }
    }
}

/// Parse a captured log plus an optional exported report directory.
pub fn parse(
    id: ParserId,
    log: &str,
    report_dir: Option<&Path>,
) -> Result<ParsedResult, ParseError> {
    let window = sentinel_window(log);

    let mut out = match id {
        ParserId::Pytest => parse_pytest(window),
        ParserId::GoTest => parse_go_test(window),
        ParserId::GradleText | ParserId::JunitXml => parse_gradle_text(window),
        ParserId::CtestText => parse_ctest(window),
    };

    if let Some(dir) = report_dir {
        let structured = parse_junit_tree(dir)?;
        // Structured results overwrite text results for the same id.
        out.extend(structured);
    }

    if out.is_empty() {
        return Err(ParseError::NoTestsFound);
    }
    Ok(out)
}

/// Slice the log to the region between the output sentinels when both are
/// present; otherwise return the whole log.
fn sentinel_window(log: &str) -> &str {
    let Some(start) = log.find(START_TEST_OUTPUT) else {
        return log;
    };
    let after_start = start + START_TEST_OUTPUT.len();
    let Some(end_rel) = log[after_start..].find(END_TEST_OUTPUT) else {
        return log;
    };
    &log[after_start..after_start + end_rel]
}

fn canonical_id(raw: &str) -> String {
    let stripped = strip_ansi(raw);
    let mut out = String::with_capacity(stripped.len());
    let mut last_space = true;
    for c in stripped.trim().chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        // CSI sequence: ESC [ parameters final-byte. Anything else after
        // ESC is dropped as a two-character sequence.
        if chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if ('\u{40}'..='\u{7e}').contains(&c) {
                    break;
                }
            }
        } else {
            chars.next();
        }
    }
    out
}

/// pytest: short-summary lines (`PASSED path::test`, `FAILED path::test -
/// msg`) and verbose lines (`path::test PASSED [ 42%]`).
fn parse_pytest(log: &str) -> ParsedResult {
    let mut out = ParsedResult::new();
    for raw in log.lines() {
        let line = strip_ansi(raw);
        let line = line.trim();

        let prefixed = [
            ("PASSED ", TestStatus::Passed),
            ("FAILED ", TestStatus::Failed),
            ("ERROR ", TestStatus::Error),
            ("XFAIL ", TestStatus::Skipped),
            ("XPASS ", TestStatus::Passed),
        ];
        let mut matched = false;
        for (prefix, status) in prefixed {
            if let Some(rest) = line.strip_prefix(prefix) {
                // Failure lines append ` - <message>` after the id.
                let id = rest.split(" - ").next().unwrap_or(rest);
                if id.contains("::") {
                    out.insert(canonical_id(id), status);
                    matched = true;
                }
                break;
            }
        }
        if matched {
            continue;
        }

        // Verbose form: id first, status second, optional progress suffix.
        let mut tokens = line.split_whitespace();
        let (Some(first), Some(second)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        if !first.contains("::") {
            continue;
        }
        let status = match second {
            "PASSED" => TestStatus::Passed,
            "FAILED" => TestStatus::Failed,
            "ERROR" => TestStatus::Error,
            "SKIPPED" | "XFAIL" => TestStatus::Skipped,
            "XPASS" => TestStatus::Passed,
            _ => continue,
        };
        out.insert(canonical_id(first), status);
    }
    out
}

/// `go test -v`: `--- PASS: TestName (0.01s)` and friends. Subtests arrive
/// indented and keep their slash-joined name verbatim.
fn parse_go_test(log: &str) -> ParsedResult {
    let mut out = ParsedResult::new();
    for raw in log.lines() {
        let line = strip_ansi(raw);
        let line = line.trim_start();
        let (status, rest) = if let Some(rest) = line.strip_prefix("--- PASS: ") {
            (TestStatus::Passed, rest)
        } else if let Some(rest) = line.strip_prefix("--- FAIL: ") {
            (TestStatus::Failed, rest)
        } else if let Some(rest) = line.strip_prefix("--- SKIP: ") {
            (TestStatus::Skipped, rest)
        } else {
            continue;
        };
        let Some(name) = rest.split_whitespace().next() else {
            continue;
        };
        out.insert(canonical_id(name), status);
    }
    out
}

/// Gradle text output: `a.b.ClassName > method PASSED|FAILED|SKIPPED`.
/// The ` > ` separator is normalised to `::`.
fn parse_gradle_text(log: &str) -> ParsedResult {
    let mut out = ParsedResult::new();
    for raw in log.lines() {
        let line = strip_ansi(raw);
        let line = line.trim();
        let (status, head) = if let Some(head) = line.strip_suffix(" PASSED") {
            (TestStatus::Passed, head)
        } else if let Some(head) = line.strip_suffix(" FAILED") {
            (TestStatus::Failed, head)
        } else if let Some(head) = line.strip_suffix(" SKIPPED") {
            (TestStatus::Skipped, head)
        } else {
            continue;
        };
        let Some((class, method)) = head.split_once(" > ") else {
            continue;
        };
        let id = format!("{}::{}", canonical_id(class), canonical_id(method));
        out.insert(id, status);
    }
    out
}

/// ctest: `1/4 Test #1: unit_foo ..............   Passed    0.01 sec` and
/// the starred failure variants (`***Failed`, `***Timeout`, `***Not Run`).
fn parse_ctest(log: &str) -> ParsedResult {
    let mut out = ParsedResult::new();
    for raw in log.lines() {
        let line = strip_ansi(raw);
        let line = line.trim();
        let Some(pos) = line.find("Test #") else {
            continue;
        };
        let rest = &line[pos..];
        let mut tokens = rest.split_whitespace();
        // "Test", "#N:", name, dots..., status
        let (Some(_test), Some(num), Some(name)) = (tokens.next(), tokens.next(), tokens.next())
        else {
            continue;
        };
        if !num.starts_with('#') || !num.ends_with(':') {
            continue;
        }
        let status = tokens.find_map(|t| match t.trim_start_matches('.') {
            "Passed" => Some(TestStatus::Passed),
            "***Failed" | "Failed" => Some(TestStatus::Failed),
            "***Timeout" | "***Exception:" => Some(TestStatus::Error),
            "***Not" => Some(TestStatus::Error),
            "***Skipped" | "Skipped" => Some(TestStatus::Skipped),
            _ => None,
        });
        if let Some(status) = status {
            out.insert(canonical_id(name), status);
        }
    }
    out
}

/// Walk an exported report directory and fold every `*.xml` JUnit file into
/// one result map. Test id is `classname::name` (or `name` alone when the
/// classname attribute is absent).
fn parse_junit_tree(dir: &Path) -> Result<ParsedResult, ParseError> {
    let mut out = ParsedResult::new();
    let mut saw_file = false;

    let mut files: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("xml"))
        .collect();
    files.sort();

    for path in files {
        saw_file = true;
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ParseError::MalformedReport(format!("{}: {e}", path.display())))?;
        parse_junit_xml(&text, &mut out)
            .map_err(|msg| ParseError::MalformedReport(format!("{}: {msg}", path.display())))?;
    }

    if !saw_file {
        // An export directory with no XML files means the run never got as
        // far as producing reports; the text stream decides alone.
        return Ok(out);
    }
    Ok(out)
}

/// Minimal JUnit XML scan: every `<testcase>` element yields one result.
/// A nested `<failure>`/`<error>`/`<skipped>` child decides the status;
/// a bare testcase passed.
fn parse_junit_xml(text: &str, out: &mut ParsedResult) -> Result<(), String> {
    let mut rest = text;
    while let Some(start) = rest.find("<testcase") {
        let tag_rest = &rest[start..];
        let open_end = tag_rest
            .find('>')
            .ok_or_else(|| "unterminated <testcase> tag".to_string())?;
        let open_tag = &tag_rest[..open_end];

        let name = xml_attr(open_tag, "name").unwrap_or_default();
        let classname = xml_attr(open_tag, "classname").unwrap_or_default();
        if name.is_empty() {
            return Err("testcase without name attribute".to_string());
        }
        let id = if classname.is_empty() {
            canonical_id(&name)
        } else {
            format!("{}::{}", canonical_id(&classname), canonical_id(&name))
        };

        let self_closing = open_tag.trim_end().ends_with('/');
        let (status, consumed) = if self_closing {
            (TestStatus::Passed, open_end + 1)
        } else {
            let body_start = open_end + 1;
            let close = tag_rest[body_start..]
                .find("</testcase>")
                .ok_or_else(|| format!("unclosed testcase {id:?}"))?;
            let body = &tag_rest[body_start..body_start + close];
            let status = if body.contains("<failure") {
                TestStatus::Failed
            } else if body.contains("<error") {
                TestStatus::Error
            } else if body.contains("<skipped") {
                TestStatus::Skipped
            } else {
                TestStatus::Passed
            };
            (status, body_start + close + "</testcase>".len())
        };

        out.insert(id, status);
        rest = &tag_rest[consumed..];
    }
    Ok(())
}

fn xml_attr(tag: &str, attr: &str) -> Option<String> {
    let needle = format!("{attr}=\"");
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')?;
    Some(xml_unescape(&tag[start..start + end]))
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
