//! Test specification: the fully resolved recipe derived from an instance.
//!
//! Resolution is pure and deterministic: the same instance and options
//! always produce the same scripts and the same image keys. Keys are
//! content-addressed fingerprints over everything that feeds a layer, so
//! two instances with identical environment requirements share one env
//! image, and a rebuilt harness reuses images from a previous run.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::instance::{Instance, Language};
use crate::parser::{ParserId, END_TEST_OUTPUT, START_TEST_OUTPUT};
use crate::profile::{self, Profile, CONTAINER_WORKDIR};
use crate::util;

#[derive(Debug)]
pub enum ResolveError {
    UnknownProfile {
        repo: String,
        version: String,
        language: Language,
    },
    /// A test id listed in both expected sets makes the expectation
    /// ill-defined; such instances are rejected rather than guessed at.
    ConflictingTests { ids: Vec<String> },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::UnknownProfile {
                repo,
                version,
                language,
            } => write!(
                f,
                "no profile for repo={repo} version={version} language={}",
                language.as_str()
            ),
            ResolveError::ConflictingTests { ids } => write!(
                f,
                "test ids present in both FAIL_TO_PASS and PASS_TO_PASS: {}",
                ids.join(", ")
            ),
        }
    }
}

impl std::error::Error for ResolveError {}

impl ResolveError {
    pub fn reason(&self) -> &'static str {
        match self {
            ResolveError::UnknownProfile { .. } => "unknown_profile",
            ResolveError::ConflictingTests { .. } => "conflicting_tests",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Base,
    Env,
    Instance,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Base => "base",
            Level::Env => "env",
            Level::Instance => "instance",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub schema_version: String,
    pub instance_id: String,
    pub repo: String,
    pub version: String,
    pub language: Language,

    pub base_key: String,
    pub env_key: String,
    pub instance_key: String,
    pub base_tag: String,
    pub env_tag: String,
    pub instance_tag: String,

    pub base_dockerfile: String,
    pub env_dockerfile: String,
    pub instance_dockerfile: String,
    pub setup_env_script: String,
    pub setup_repo_script: String,
    pub eval_script: String,

    pub apply_cmds: Vec<String>,
    pub test_command: String,
    pub report_dir: Option<String>,
    pub parser: ParserId,
    pub timeout_seconds: u64,
    pub network_run: bool,

    pub fail_to_pass: Vec<String>,
    pub pass_to_pass: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Image-registry prefix, e.g. `ghcr.io/acme/`; may be empty.
    pub namespace: String,
    /// Overrides every profile timeout when set.
    pub timeout_seconds: Option<u64>,
}

pub fn resolve(instance: &Instance, opts: &ResolveOptions) -> Result<TestSpec, ResolveError> {
    let conflicting: Vec<String> = instance
        .fail_to_pass
        .iter()
        .filter(|id| instance.pass_to_pass.contains(id))
        .cloned()
        .collect();
    if !conflicting.is_empty() {
        return Err(ResolveError::ConflictingTests { ids: conflicting });
    }

    let profile = profile::lookup(&instance.repo, &instance.version, instance.language).ok_or_else(
        || ResolveError::UnknownProfile {
            repo: instance.repo.clone(),
            version: instance.version.clone(),
            language: instance.language,
        },
    )?;

    let setup_env_script = render(profile.env_script, instance);
    let setup_repo_script = repo_setup_script(profile, instance);
    let eval_script = eval_script(profile, instance);

    let base_dockerfile = base_dockerfile(profile);
    let base_key = image_key(Level::Base, None, &base_dockerfile, &[]);
    let base_tag = image_tag(&opts.namespace, Level::Base, &base_key);

    let env_dockerfile = env_dockerfile(&base_tag);
    let env_key = image_key(
        Level::Env,
        Some(&base_key),
        &env_dockerfile,
        &[("setup_env.sh", setup_env_script.as_str())],
    );
    let env_tag = image_tag(&opts.namespace, Level::Env, &env_key);

    let instance_dockerfile = instance_dockerfile(&env_tag);
    let instance_key = image_key(
        Level::Instance,
        Some(&env_key),
        &instance_dockerfile,
        &[("setup_repo.sh", setup_repo_script.as_str())],
    );
    let instance_tag = image_tag(&opts.namespace, Level::Instance, &instance_key);

    Ok(TestSpec {
        schema_version: patchbench_contracts::TEST_SPEC_SCHEMA_VERSION.to_string(),
        instance_id: instance.instance_id.clone(),
        repo: instance.repo.clone(),
        version: instance.version.clone(),
        language: instance.language,
        base_key,
        env_key,
        instance_key,
        base_tag,
        env_tag,
        instance_tag,
        base_dockerfile,
        env_dockerfile,
        instance_dockerfile,
        setup_env_script,
        setup_repo_script,
        eval_script,
        apply_cmds: profile::APPLY_CMDS.iter().map(|s| s.to_string()).collect(),
        test_command: profile.test_command.to_string(),
        report_dir: profile.report_dir.map(str::to_string),
        parser: profile.parser,
        timeout_seconds: opts.timeout_seconds.unwrap_or(profile.timeout_seconds),
        network_run: profile.network_run,
        fail_to_pass: instance.fail_to_pass.clone(),
        pass_to_pass: instance.pass_to_pass.clone(),
    })
}

/// Fingerprint for one image layer: level, parent fingerprint, the exact
/// dockerfile text and every file the dockerfile copies in. Length-prefixed
/// fields keep the digest unambiguous under concatenation.
fn image_key(level: Level, parent: Option<&str>, dockerfile: &str, files: &[(&str, &str)]) -> String {
    let mut buf = Vec::new();
    push_field(&mut buf, level.as_str().as_bytes());
    push_field(&mut buf, parent.unwrap_or("").as_bytes());
    push_field(&mut buf, dockerfile.as_bytes());
    for (name, contents) in files {
        push_field(&mut buf, name.as_bytes());
        push_field(&mut buf, contents.as_bytes());
    }
    let digest = util::sha256_hex(&buf);
    digest[..16].to_string()
}

fn push_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn image_tag(namespace: &str, level: Level, key: &str) -> String {
    format!("{namespace}patchbench-{}:{key}", level.as_str())
}

fn render(template: &str, instance: &Instance) -> String {
    template
        .replace("{repo}", &instance.repo)
        .replace("{version}", &instance.version)
        .replace("{base_commit}", &instance.base_commit)
}

fn base_dockerfile(profile: &Profile) -> String {
    let packages = profile.base_packages.join(" ");
    format!(
        "FROM {image}\n\
         ENV DEBIAN_FRONTEND=noninteractive\n\
         ENV TZ=Etc/UTC\n\
         RUN apt-get update && apt-get install -y --no-install-recommends {packages} && \
         apt-get clean && rm -rf /var/lib/apt/lists/*\n",
        image = profile.base_image,
    )
}

fn env_dockerfile(base_tag: &str) -> String {
    format!(
        "FROM {base_tag}\n\
         COPY ./setup_env.sh /root/setup_env.sh\n\
         RUN /bin/bash /root/setup_env.sh\n"
    )
}

fn instance_dockerfile(env_tag: &str) -> String {
    format!(
        "FROM {env_tag}\n\
         COPY ./setup_repo.sh /root/setup_repo.sh\n\
         RUN /bin/bash /root/setup_repo.sh\n\
         WORKDIR {CONTAINER_WORKDIR}\n"
    )
}

/// Checkout script baked into the instance layer: clone, pin the commit,
/// drop the remote so nothing inside the container can see newer history,
/// then run the profile's install commands.
fn repo_setup_script(profile: &Profile, instance: &Instance) -> String {
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        "set -euo pipefail".to_string(),
        format!(
            "git clone -o origin https://github.com/{} {}",
            instance.repo, CONTAINER_WORKDIR
        ),
        format!("cd {CONTAINER_WORKDIR}"),
        format!("git reset --hard {}", instance.base_commit),
        "git remote remove origin".to_string(),
        format!("chmod -R 777 {CONTAINER_WORKDIR}"),
    ];
    for cmd in profile.install_cmds {
        lines.push(render(cmd, instance));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// The script executed at run time, after the patch has been applied. Test
/// output is bracketed with sentinel lines so parsers can cut the window.
fn eval_script(profile: &Profile, instance: &Instance) -> String {
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        "set -uxo pipefail".to_string(),
        format!("cd {CONTAINER_WORKDIR}"),
        format!("git config --global --add safe.directory {CONTAINER_WORKDIR}"),
    ];
    for cmd in profile.build_cmds {
        lines.push(render(cmd, instance));
    }
    lines.push(format!(": '{START_TEST_OUTPUT}'"));
    lines.push(render(profile.test_command, instance));
    // The test command's status survives the sentinel and report steps; the
    // grader uses it to tell "ran and failed" from "never produced tests".
    lines.push("test_status=$?".to_string());
    lines.push(format!(": '{END_TEST_OUTPUT}'"));
    for cmd in profile.report_cmds {
        lines.push(render(cmd, instance));
    }
    lines.push("exit $test_status".to_string());
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, repo: &str, version: &str, language: Language) -> Instance {
        Instance {
            instance_id: id.to_string(),
            repo: repo.to_string(),
            base_commit: "abc123".to_string(),
            patch: String::new(),
            test_patch: None,
            version: version.to_string(),
            language,
            fail_to_pass: vec!["t::a".to_string()],
            pass_to_pass: vec!["t::b".to_string()],
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let inst = instance("i1", "octo/widgets", "1.0", Language::Python);
        let opts = ResolveOptions::default();
        let a = resolve(&inst, &opts).unwrap();
        let b = resolve(&inst, &opts).unwrap();
        assert_eq!(a.instance_key, b.instance_key);
        assert_eq!(a.eval_script, b.eval_script);
    }

    #[test]
    fn env_key_is_shared_across_instances_of_one_family() {
        let opts = ResolveOptions::default();
        let a = resolve(
            &instance("i1", "octo/widgets", "1.0", Language::Python),
            &opts,
        )
        .unwrap();
        let b = resolve(
            &instance("i2", "octo/widgets", "1.0", Language::Python),
            &opts,
        )
        .unwrap();
        assert_eq!(a.base_key, b.base_key);
        assert_eq!(a.env_key, b.env_key);
        // Different instance ids but identical repo/commit still share the
        // instance key; the snapshot is the same.
        assert_eq!(a.instance_key, b.instance_key);
    }

    #[test]
    fn instance_key_differs_per_commit() {
        let opts = ResolveOptions::default();
        let a = resolve(
            &instance("i1", "octo/widgets", "1.0", Language::Python),
            &opts,
        )
        .unwrap();
        let mut other = instance("i2", "octo/widgets", "1.0", Language::Python);
        other.base_commit = "def456".to_string();
        let b = resolve(&other, &opts).unwrap();
        assert_eq!(a.env_key, b.env_key);
        assert_ne!(a.instance_key, b.instance_key);
    }

    #[test]
    fn keys_differ_across_levels_and_languages() {
        let opts = ResolveOptions::default();
        let py = resolve(
            &instance("i1", "octo/widgets", "1.0", Language::Python),
            &opts,
        )
        .unwrap();
        assert_ne!(py.base_key, py.env_key);
        assert_ne!(py.env_key, py.instance_key);

        let go = resolve(&instance("i1", "octo/widgets", "1.0", Language::Go), &opts).unwrap();
        assert_ne!(py.base_key, go.base_key);
    }

    #[test]
    fn namespace_prefixes_tags_not_keys() {
        let inst = instance("i1", "octo/widgets", "1.0", Language::Python);
        let plain = resolve(&inst, &ResolveOptions::default()).unwrap();
        let spaced = resolve(
            &inst,
            &ResolveOptions {
                namespace: "registry.local/bench/".to_string(),
                timeout_seconds: None,
            },
        )
        .unwrap();
        assert_eq!(plain.base_key, spaced.base_key);
        assert!(spaced
            .instance_tag
            .starts_with("registry.local/bench/patchbench-instance:"));
    }

    #[test]
    fn conflicting_expected_sets_are_rejected() {
        let mut inst = instance("i1", "octo/widgets", "1.0", Language::Python);
        inst.pass_to_pass = vec!["t::a".to_string()];
        match resolve(&inst, &ResolveOptions::default()) {
            Err(ResolveError::ConflictingTests { ids }) => assert_eq!(ids, vec!["t::a"]),
            other => panic!("expected ConflictingTests, got {other:?}"),
        }
    }

    #[test]
    fn eval_script_brackets_test_command_with_sentinels() {
        let inst = instance("i1", "octo/widgets", "1.0", Language::Python);
        let spec = resolve(&inst, &ResolveOptions::default()).unwrap();
        let start = spec.eval_script.find(START_TEST_OUTPUT).unwrap();
        let cmd = spec.eval_script.find("python -m pytest").unwrap();
        let end = spec.eval_script.find(END_TEST_OUTPUT).unwrap();
        assert!(start < cmd && cmd < end);
    }

    #[test]
    fn repo_script_pins_commit_and_drops_remote() {
        let inst = instance("i1", "octo/widgets", "1.0", Language::Python);
        let spec = resolve(&inst, &ResolveOptions::default()).unwrap();
        assert!(spec.setup_repo_script.contains("git reset --hard abc123"));
        assert!(spec.setup_repo_script.contains("git remote remove origin"));
    }

    #[test]
    fn timeout_override_wins() {
        let inst = instance("i1", "octo/widgets", "1.0", Language::Python);
        let spec = resolve(
            &inst,
            &ResolveOptions {
                namespace: String::new(),
                timeout_seconds: Some(42),
            },
        )
        .unwrap();
        assert_eq!(spec.timeout_seconds, 42);
    }
}
