//! The layered image build graph.
//!
//! Three levels (base, env, instance) form a forest keyed by
//! content-addressed fingerprints. The builder owns a map from key to a
//! promise cell; the first caller of `ensure` for a key performs the build
//! while concurrent callers block on the same cell and observe the same
//! outcome. A failed build is cached for the lifetime of the process so
//! sibling instances of a broken env layer fail fast instead of rebuilding.
//!
//! At-most-one build per key is the invariant; across distinct keys builds
//! run in parallel up to a global slot bound.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use patchbench_engine::Engine;
use tracing::{debug, info, warn};

use crate::spec::{Level, TestSpec};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum CacheLevel {
    /// Remove every image this run built.
    None,
    /// Keep base images only.
    Base,
    /// Keep base and env images.
    Env,
    /// Keep everything (instance is an alias of all).
    Instance,
    All,
}

#[derive(Debug, Clone)]
pub struct BuildFailure {
    pub level: Level,
    pub key: String,
    pub message: String,
    /// Engine-level failure: retrying other instances is pointless.
    pub fatal: bool,
}

impl std::fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} image build failed (key {}): {}",
            self.level.as_str(),
            self.key,
            self.message
        )
    }
}

enum CellState {
    Building,
    Ready(String),
    Failed(Arc<BuildFailure>),
}

struct BuildCell {
    state: Mutex<CellState>,
    cv: Condvar,
}

struct Slots {
    max: usize,
    in_use: Mutex<usize>,
    cv: Condvar,
}

impl Slots {
    fn acquire(&self) {
        let mut n = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        while *n >= self.max {
            n = self.cv.wait(n).unwrap_or_else(|e| e.into_inner());
        }
        *n += 1;
    }

    fn release(&self) {
        let mut n = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        *n = n.saturating_sub(1);
        self.cv.notify_one();
    }
}

pub struct ImageBuilder {
    engine: Engine,
    cells: Mutex<BTreeMap<String, Arc<BuildCell>>>,
    slots: Slots,
    work_dir: PathBuf,
    force_rebuild: bool,
    build_timeout: Duration,
    /// Tags realised this run, per level, for end-of-run eviction.
    built: Mutex<Vec<(Level, String)>>,
}

impl ImageBuilder {
    pub fn new(
        engine: Engine,
        work_dir: PathBuf,
        max_concurrent_builds: usize,
        force_rebuild: bool,
        build_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            cells: Mutex::new(BTreeMap::new()),
            slots: Slots {
                max: max_concurrent_builds.max(1),
                in_use: Mutex::new(0),
                cv: Condvar::new(),
            },
            work_dir,
            force_rebuild,
            build_timeout,
            built: Mutex::new(Vec::new()),
        }
    }

    /// Realise the three layers an instance needs, in order. Returns the
    /// instance image tag.
    pub fn ensure_for_spec(&self, spec: &TestSpec) -> Result<String, Arc<BuildFailure>> {
        self.ensure(
            Level::Base,
            &spec.base_key,
            &spec.base_tag,
            &spec.base_dockerfile,
            &[],
            true,
        )?;
        self.ensure(
            Level::Env,
            &spec.env_key,
            &spec.env_tag,
            &spec.env_dockerfile,
            &[("setup_env.sh", spec.setup_env_script.as_str())],
            true,
        )?;
        self.ensure(
            Level::Instance,
            &spec.instance_key,
            &spec.instance_tag,
            &spec.instance_dockerfile,
            &[("setup_repo.sh", spec.setup_repo_script.as_str())],
            true,
        )
    }

    /// Idempotent per key: the first caller builds, everyone else waits on
    /// the same outcome.
    pub fn ensure(
        &self,
        level: Level,
        key: &str,
        tag: &str,
        dockerfile: &str,
        files: &[(&str, &str)],
        network: bool,
    ) -> Result<String, Arc<BuildFailure>> {
        let (cell, owner) = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            match cells.get(key) {
                Some(cell) => (Arc::clone(cell), false),
                None => {
                    let cell = Arc::new(BuildCell {
                        state: Mutex::new(CellState::Building),
                        cv: Condvar::new(),
                    });
                    cells.insert(key.to_string(), Arc::clone(&cell));
                    (cell, true)
                }
            }
        };

        if !owner {
            let mut state = cell.state.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                match &*state {
                    CellState::Building => {
                        state = cell.cv.wait(state).unwrap_or_else(|e| e.into_inner());
                    }
                    CellState::Ready(tag) => return Ok(tag.clone()),
                    CellState::Failed(err) => return Err(Arc::clone(err)),
                }
            }
        }

        let outcome = self.build_once(level, key, tag, dockerfile, files, network);

        let mut state = cell.state.lock().unwrap_or_else(|e| e.into_inner());
        match &outcome {
            Ok(tag) => *state = CellState::Ready(tag.clone()),
            Err(err) => *state = CellState::Failed(Arc::clone(err)),
        }
        cell.cv.notify_all();
        outcome
    }

    fn build_once(
        &self,
        level: Level,
        key: &str,
        tag: &str,
        dockerfile: &str,
        files: &[(&str, &str)],
        network: bool,
    ) -> Result<String, Arc<BuildFailure>> {
        let fail = |message: String, fatal: bool| {
            Arc::new(BuildFailure {
                level,
                key: key.to_string(),
                message,
                fatal,
            })
        };

        if !self.force_rebuild {
            match self.engine.image_exists(tag) {
                Ok(true) => {
                    debug!(level = level.as_str(), key, tag, "image cache hit");
                    self.record(level, tag);
                    return Ok(tag.to_string());
                }
                Ok(false) => {}
                Err(e) => return Err(fail(e.to_string(), e.is_fatal())),
            }
        }

        let ctx_dir = self.work_dir.join("ctx").join(format!("{}-{key}", level.as_str()));
        if let Err(e) = self.write_context(&ctx_dir, dockerfile, files) {
            return Err(fail(format!("assemble build context: {e:#}"), false));
        }

        let log_path = self
            .work_dir
            .join(format!("{}-{key}.log", level.as_str()));

        info!(level = level.as_str(), key, tag, "building image");
        self.slots.acquire();
        let built = self
            .engine
            .build_image(tag, &ctx_dir, network, &log_path, self.build_timeout);
        self.slots.release();

        let _ = std::fs::remove_dir_all(&ctx_dir);

        match built {
            Ok(()) => {
                info!(level = level.as_str(), key, tag, "image ready");
                self.record(level, tag);
                Ok(tag.to_string())
            }
            Err(e) => {
                warn!(level = level.as_str(), key, "image build failed");
                Err(fail(
                    format!("{e} (log: {})", log_path.display()),
                    e.is_fatal(),
                ))
            }
        }
    }

    fn write_context(&self, ctx_dir: &Path, dockerfile: &str, files: &[(&str, &str)]) -> Result<()> {
        std::fs::create_dir_all(ctx_dir)
            .with_context(|| format!("create context dir {}", ctx_dir.display()))?;
        util::write_atomic(&ctx_dir.join("Dockerfile"), dockerfile.as_bytes())
            .context("write Dockerfile")?;
        for (name, contents) in files {
            util::write_atomic(&ctx_dir.join(name), contents.as_bytes())
                .with_context(|| format!("write {name}"))?;
        }
        Ok(())
    }

    fn record(&self, level: Level, tag: &str) {
        let mut built = self.built.lock().unwrap_or_else(|e| e.into_inner());
        if !built.iter().any(|(_, t)| t == tag) {
            built.push((level, tag.to_string()));
        }
    }

    /// End-of-run eviction. `cache_level` names the highest layer kept:
    /// instance images go first, env and base only under the aggressive
    /// settings. Runs after every dependent container has terminated.
    pub fn evict(&self, cache_level: CacheLevel) {
        let built = {
            let built = self.built.lock().unwrap_or_else(|e| e.into_inner());
            built.clone()
        };
        for (level, tag) in built {
            let drop_it = match cache_level {
                CacheLevel::None => true,
                CacheLevel::Base => level > Level::Base,
                CacheLevel::Env => level > Level::Env,
                CacheLevel::Instance | CacheLevel::All => false,
            };
            if drop_it {
                debug!(tag = %tag, "evicting image");
                if let Err(e) = self.engine.remove_image(&tag) {
                    warn!(tag = %tag, error = %e, "image eviction failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DIR_N: AtomicUsize = AtomicUsize::new(0);

    fn tmp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "patchbench_builder_{}_{}",
            std::process::id(),
            DIR_N.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// A fake engine binary: `image inspect` always misses, `build` appends
    /// to a marker file and exits with the scripted status.
    fn fake_engine(dir: &Path, build_exit: i32) -> (Engine, PathBuf) {
        let marker = dir.join("builds.log");
        let bin = dir.join("fake-engine.sh");
        let script = format!(
            "#!/bin/sh\ncase \"$1\" in\n  image) exit 1 ;;\n  build) echo build >> {marker}; sleep 0.1; exit {build_exit} ;;\nesac\nexit 0\n",
            marker = marker.display(),
        );
        std::fs::write(&bin, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mut perms = std::fs::metadata(&bin).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&bin, perms).unwrap();
        }
        (Engine::new(bin), marker)
    }

    fn builder(dir: &Path, engine: Engine) -> ImageBuilder {
        ImageBuilder::new(
            engine,
            dir.join("work"),
            4,
            false,
            Duration::from_secs(30),
        )
    }

    fn build_count(marker: &Path) -> usize {
        std::fs::read_to_string(marker)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn concurrent_ensure_builds_once() {
        let dir = tmp_dir();
        let (engine, marker) = fake_engine(&dir, 0);
        let b = builder(&dir, engine);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let got = b
                        .ensure(Level::Env, "k1", "patchbench-env:k1", "FROM x\n", &[], false)
                        .unwrap();
                    assert_eq!(got, "patchbench-env:k1");
                });
            }
        });

        assert_eq!(build_count(&marker), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failed_build_is_cached_and_shared() {
        let dir = tmp_dir();
        let (engine, marker) = fake_engine(&dir, 7);
        let b = builder(&dir, engine);

        let first = b.ensure(Level::Env, "k1", "t:k1", "FROM x\n", &[], false);
        let second = b.ensure(Level::Env, "k1", "t:k1", "FROM x\n", &[], false);

        let first = first.unwrap_err();
        let second = second.unwrap_err();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.fatal);
        assert_eq!(build_count(&marker), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn distinct_keys_build_independently() {
        let dir = tmp_dir();
        let (engine, marker) = fake_engine(&dir, 0);
        let b = builder(&dir, engine);

        b.ensure(Level::Env, "k1", "t:k1", "FROM x\n", &[], false)
            .unwrap();
        b.ensure(Level::Env, "k2", "t:k2", "FROM y\n", &[], false)
            .unwrap();
        assert_eq!(build_count(&marker), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_engine_failure_is_fatal() {
        let dir = tmp_dir();
        let b = builder(&dir, Engine::new("/nonexistent/patchbench-engine"));
        let err = b
            .ensure(Level::Base, "k", "t:k", "FROM x\n", &[], false)
            .unwrap_err();
        assert!(err.fatal);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
