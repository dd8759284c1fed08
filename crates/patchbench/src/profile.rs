//! The repository/language knowledge base.
//!
//! Everything the harness must know per project family lives here as data:
//! base image, environment setup, repository setup, test command, report
//! location, parser, timeout. Resolution is by exact `(repo, version)`
//! first, then by `language` fallback. Adding support for a project means
//! adding a table entry, not code.
//!
//! Script templates use `{repo}`, `{version}` and `{base_commit}`
//! placeholders, substituted at resolution time.

use once_cell::sync::Lazy;

use crate::instance::Language;
use crate::parser::ParserId;

/// Commands tried in order to apply the combined patch from the repo root.
/// Fuzzing stays disabled: a patch either applies against the pinned
/// snapshot or the instance is graded `build_error`.
pub const APPLY_CMDS: &[&str] = &[
    "git apply --verbose",
    "git apply --verbose --reject",
    "patch --batch --fuzz=0 -p1 -i",
];

/// Path the combined patch is copied to inside the container.
pub const CONTAINER_PATCH_PATH: &str = "/tmp/patch.diff";
/// Path the rendered eval script is copied to inside the container.
pub const CONTAINER_EVAL_PATH: &str = "/eval.sh";
/// Repository checkout location inside the instance image.
pub const CONTAINER_WORKDIR: &str = "/testbed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKey {
    Repo {
        repo: &'static str,
        version: &'static str,
    },
    Lang(Language),
}

#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub key: ProfileKey,
    /// FROM image of the base layer.
    pub base_image: &'static str,
    /// Packages installed into the base layer.
    pub base_packages: &'static [&'static str],
    /// Environment layer setup (language/runtime/project deps).
    pub env_script: &'static str,
    /// Commands run after the repository checkout, inside the instance
    /// layer (project install/build priming).
    pub install_cmds: &'static [&'static str],
    /// Commands run by the eval script before the test command.
    pub build_cmds: &'static [&'static str],
    pub test_command: &'static str,
    /// Commands run by the eval script after the test command (report
    /// collection and similar).
    pub report_cmds: &'static [&'static str],
    /// In-container directory of structured reports, exported after the run.
    pub report_dir: Option<&'static str>,
    pub parser: ParserId,
    pub timeout_seconds: u64,
    /// Whether run containers get network access. Builds always do (the
    /// instance layer clones the repository).
    pub network_run: bool,
}

const GRADLE_ENV_SCRIPT: &str = r#"mkdir -p /root/.gradle
cat > /root/.gradle/gradle.properties <<'EOF'
org.gradle.jvmargs=-Xmx8g -XX:+HeapDumpOnOutOfMemoryError -Dfile.encoding=UTF-8
org.gradle.caching=true
org.gradle.parallel=true
org.gradle.vfs.watch=false
EOF
"#;

/// Merge every per-module JUnit tree into one file the harness exports.
/// Grown from per-module `build/test-results` layouts; the xml prologue of
/// each fragment is dropped so the concatenation stays well-formed.
const GRADLE_REPORT_MERGE: &str = r#"mkdir -p /testbed/reports/junit && { echo '<?xml version="1.0" encoding="UTF-8"?>'; echo '<testsuites>'; find /testbed -type f -path '*/build/test-results/*' -name 'TEST-*.xml' -exec sed '/<?xml/d' {} + 2>/dev/null; echo '</testsuites>'; } > /testbed/reports/junit/all-testsuites.xml"#;

static PROFILES: Lazy<Vec<Profile>> = Lazy::new(|| {
    let mut table = vec![
        // --- repo/version-keyed entries -------------------------------
        Profile {
            key: ProfileKey::Repo {
                repo: "psf/requests",
                version: "2.31",
            },
            base_image: "python:3.11-slim-bookworm",
            base_packages: &["git", "patch", "build-essential", "curl", "ca-certificates"],
            env_script: "python -m pip install --upgrade pip setuptools wheel\npython -m pip install pytest pytest-httpbin trustme",
            install_cmds: &["python -m pip install -e ."],
            build_cmds: &[],
            test_command: "python -m pytest -rA --tb=no -p no:cacheprovider tests/",
            report_cmds: &[],
            report_dir: None,
            parser: ParserId::Pytest,
            timeout_seconds: 1800,
            network_run: false,
        },
        Profile {
            key: ProfileKey::Repo {
                repo: "spacecowboy/Feeder",
                version: "1.0.0",
            },
            base_image: "gradle:8.13-jdk21-jammy",
            base_packages: &["git", "patch", "curl", "unzip", "zip", "ca-certificates"],
            env_script: GRADLE_ENV_SCRIPT,
            install_cmds: &[
                "find /testbed -type f -path '*/gradle/wrapper/gradle-wrapper.properties' -exec sed -i -E 's#(distributionUrl=.*)-all(\\.zip)#\\1-bin\\2#g' {} + || true",
                "chmod +x /testbed/gradlew || true",
                "cd /testbed && ./gradlew assemble --no-daemon || true",
            ],
            build_cmds: &["chmod +x gradlew || true"],
            test_command: "./gradlew test --no-daemon --continue",
            report_cmds: &[GRADLE_REPORT_MERGE],
            report_dir: Some("/testbed/reports/junit"),
            parser: ParserId::JunitXml,
            timeout_seconds: 2400,
            network_run: true,
        },
        Profile {
            key: ProfileKey::Repo {
                repo: "TrianguloY/URLCheck",
                version: "1.0.0",
            },
            base_image: "gradle:8.13-jdk17-jammy",
            base_packages: &["git", "patch", "curl", "unzip", "zip", "ca-certificates"],
            env_script: GRADLE_ENV_SCRIPT,
            install_cmds: &[
                "find /testbed -type f -path '*/gradle/wrapper/gradle-wrapper.properties' -exec sed -i -E 's#(distributionUrl=.*)-all(\\.zip)#\\1-bin\\2#g' {} + || true",
                "chmod +x /testbed/gradlew || true",
                "cd /testbed && ./gradlew assemble --no-daemon || true",
            ],
            build_cmds: &["chmod +x gradlew || true"],
            test_command: "./gradlew test --no-daemon --continue",
            report_cmds: &[GRADLE_REPORT_MERGE],
            report_dir: Some("/testbed/reports/junit"),
            parser: ParserId::JunitXml,
            timeout_seconds: 2400,
            network_run: true,
        },
        // --- language fallbacks ---------------------------------------
        Profile {
            key: ProfileKey::Lang(Language::Python),
            base_image: "python:3.11-slim-bookworm",
            base_packages: &["git", "patch", "build-essential", "curl", "ca-certificates"],
            env_script: "python -m pip install --upgrade pip setuptools wheel\npython -m pip install pytest",
            install_cmds: &[
                "python -m pip install -e '.[test]' || python -m pip install -e . || true",
                "python -m pip install -r requirements.txt || true",
            ],
            build_cmds: &[],
            test_command: "python -m pytest -rA --tb=no -p no:cacheprovider",
            report_cmds: &[],
            report_dir: None,
            parser: ParserId::Pytest,
            timeout_seconds: 1800,
            network_run: false,
        },
        Profile {
            key: ProfileKey::Lang(Language::Go),
            base_image: "golang:1.22-bookworm",
            base_packages: &["git", "patch", "ca-certificates"],
            env_script: "go env -w GOFLAGS=-mod=mod\ngo version",
            install_cmds: &["cd /testbed && go mod download || true"],
            build_cmds: &[],
            test_command: "go test ./... -v",
            report_cmds: &[],
            report_dir: None,
            parser: ParserId::GoTest,
            timeout_seconds: 1800,
            network_run: false,
        },
        Profile {
            key: ProfileKey::Lang(Language::C),
            base_image: "gcc:13-bookworm",
            base_packages: &["git", "patch", "make", "cmake", "ca-certificates"],
            env_script: "cmake --version\nmake --version",
            install_cmds: &["cd /testbed && cmake -S . -B build >/dev/null 2>&1 || true"],
            build_cmds: &["cmake -S . -B build", "cmake --build build -j"],
            test_command: "ctest --test-dir build --output-on-failure",
            report_cmds: &[],
            report_dir: None,
            parser: ParserId::CtestText,
            timeout_seconds: 1800,
            network_run: false,
        },
    ];

    // Java and Kotlin share the gradle fallback.
    for lang in [Language::Java, Language::Kotlin] {
        table.push(Profile {
            key: ProfileKey::Lang(lang),
            base_image: "gradle:8.13-jdk17-jammy",
            base_packages: &["git", "patch", "curl", "unzip", "zip", "ca-certificates"],
            env_script: GRADLE_ENV_SCRIPT,
            install_cmds: &[
                "find /testbed -type f -path '*/gradle/wrapper/gradle-wrapper.properties' -exec sed -i -E 's#(distributionUrl=.*)-all(\\.zip)#\\1-bin\\2#g' {} + || true",
                "chmod +x /testbed/gradlew || true",
            ],
            build_cmds: &["chmod +x gradlew || true"],
            test_command: "./gradlew test --no-daemon --continue",
            report_cmds: &[GRADLE_REPORT_MERGE],
            report_dir: Some("/testbed/reports/junit"),
            parser: ParserId::JunitXml,
            timeout_seconds: 2400,
            network_run: true,
        });
    }

    table
});

/// Exact `(repo, version)` match first, `language` fallback second.
pub fn lookup(repo: &str, version: &str, language: Language) -> Option<&'static Profile> {
    let by_repo = PROFILES.iter().find(|p| {
        matches!(p.key, ProfileKey::Repo { repo: r, version: v } if r == repo && v == version)
    });
    by_repo.or_else(|| {
        PROFILES
            .iter()
            .find(|p| matches!(p.key, ProfileKey::Lang(l) if l == language))
    })
}
