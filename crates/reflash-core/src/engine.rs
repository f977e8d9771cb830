//! Serial injection engine.
//!
//! All mutable recompilation state — the per-platform command caches and
//! the pipeline — lives on one worker thread fed by a channel. Intercepted
//! builds, editor saves and status queries arrive from their own threads
//! as jobs and are processed strictly in order, so a store can never race
//! the injection it satisfies. A job that panics poisons nothing: the
//! failure is recorded and the worker moves on.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use crossbeam_channel::{bounded, unbounded, Sender};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::cache::CompilationCache;
use crate::config::DaemonConfig;
use crate::pipeline::{InjectionOutcome, Pipeline};
use crate::queue::SerialQueue;
use crate::record::CompilationRecord;
use crate::server::ClientRegistry;
use crate::status::UiDelegate;
use crate::watch::buildlog;

/// Work items processed one at a time by the engine thread.
enum Job {
    Store(StoreJob),
    Inject {
        source: String,
    },
    FileSaved {
        source: PathBuf,
        project_root: Option<PathBuf>,
    },
    SetLoggedFrontend(Option<PathBuf>),
    SaveCaches,
    Status(Sender<EngineStatus>),
    LastInjectedAt {
        source: String,
        reply: Sender<Option<SystemTime>>,
    },
}

struct StoreJob {
    platform: String,
    source: String,
    record: CompilationRecord,
    refresh_existing: bool,
}

/// Point-in-time view of the engine, for status reporting and tests.
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    pub last_source: Option<String>,
    pub last_error: Option<String>,
    pub cached_records: usize,
    pub platforms: Vec<String>,
}

pub struct Engine {
    jobs: Sender<Job>,
    _worker: thread::JoinHandle<()>,
}

/// Cheap cloneable submission side of the engine.
#[derive(Clone)]
pub struct EngineHandle {
    jobs: Sender<Job>,
}

impl Engine {
    pub fn start(
        config: Arc<DaemonConfig>,
        registry: Arc<ClientRegistry>,
        delivery: Arc<SerialQueue>,
        ui: Arc<dyn UiDelegate>,
    ) -> std::io::Result<Self> {
        let (jobs, queue) = unbounded();
        let worker = thread::Builder::new()
            .name("engine".to_string())
            .spawn(move || {
                let mut state = EngineState {
                    pipeline: Pipeline::new(
                        Arc::clone(&config),
                        Arc::clone(&registry),
                        delivery,
                        ui,
                    ),
                    config,
                    registry,
                    caches: FxHashMap::default(),
                    last_source: None,
                    last_error: None,
                };
                for job in queue {
                    if panic::catch_unwind(AssertUnwindSafe(|| state.handle(job))).is_err() {
                        error!("Engine job panicked, continuing with the next one");
                        state.last_error = Some("Internal error: engine job panicked".to_string());
                    }
                }
            })?;
        Ok(Self {
            jobs,
            _worker: worker,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            jobs: self.jobs.clone(),
        }
    }
}

impl EngineHandle {
    /// Queues a captured compile of `source` into `platform`'s cache.
    /// While a client is connected, an existing record is kept unless
    /// `refresh_existing` is set: the running app was built with the old
    /// arguments, and replaying the newer ones could target a different
    /// configuration than the one on screen.
    pub fn store_record(
        &self,
        platform: &str,
        source: &str,
        record: CompilationRecord,
        refresh_existing: bool,
    ) {
        let _ = self.jobs.send(Job::Store(StoreJob {
            platform: platform.to_string(),
            source: source.to_string(),
            record,
            refresh_existing,
        }));
    }

    pub fn inject(&self, source: &str) {
        let _ = self.jobs.send(Job::Inject {
            source: source.to_string(),
        });
    }

    /// A watched file was saved. When no compile record is cached the
    /// engine tries the IDE's build logs before injecting.
    pub fn file_saved(&self, source: PathBuf, project_root: Option<PathBuf>) {
        let _ = self.jobs.send(Job::FileSaved {
            source,
            project_root,
        });
    }

    pub fn set_logged_frontend(&self, frontend: Option<PathBuf>) {
        let _ = self.jobs.send(Job::SetLoggedFrontend(frontend));
    }

    pub fn save_caches(&self) {
        let _ = self.jobs.send(Job::SaveCaches);
    }

    /// Reports the engine's state after every previously queued job has
    /// been processed.
    pub fn status(&self) -> EngineStatus {
        let (reply, answer) = bounded(1);
        if self.jobs.send(Job::Status(reply)).is_err() {
            return EngineStatus::default();
        }
        answer.recv().unwrap_or_default()
    }

    pub fn last_injected_at(&self, source: &str) -> Option<SystemTime> {
        let (reply, answer) = bounded(1);
        let job = Job::LastInjectedAt {
            source: source.to_string(),
            reply,
        };
        if self.jobs.send(job).is_err() {
            return None;
        }
        answer.recv().ok().flatten()
    }
}

struct EngineState {
    config: Arc<DaemonConfig>,
    registry: Arc<ClientRegistry>,
    caches: FxHashMap<String, CompilationCache>,
    pipeline: Pipeline,
    last_source: Option<String>,
    last_error: Option<String>,
}

impl EngineState {
    fn handle(&mut self, job: Job) {
        match job {
            Job::Store(store) => self.store(store),
            Job::Inject { source } => self.inject(&source),
            Job::FileSaved {
                source,
                project_root,
            } => self.file_saved(&source, project_root.as_deref()),
            Job::SetLoggedFrontend(frontend) => self.pipeline.set_logged_frontend(frontend),
            Job::SaveCaches => self.save_caches(),
            Job::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Job::LastInjectedAt { source, reply } => {
                let _ = reply.send(self.pipeline.last_injected_at(&source));
            }
        }
    }

    fn store(&mut self, job: StoreJob) {
        let StoreJob {
            platform,
            source,
            record,
            refresh_existing,
        } = job;
        let has_clients = self.registry.has_clients();
        let cache = self.cache_mut(&platform);
        if has_clients && !refresh_existing && cache.contains(&source) {
            debug!(%source, "Keeping existing compile record");
            return;
        }
        if let Some(pending) = cache.store(&source, record) {
            info!(source = %pending, "Delayed injection now has a compile record");
            self.inject(&pending);
        }
    }

    fn inject(&mut self, source: &str) {
        self.last_source = Some(source.to_string());
        self.last_error = None;
        let platform = self.client_platform();
        // Disjoint borrows: the pipeline takes the cache entry directly.
        let cache = self
            .caches
            .entry(platform.clone())
            .or_insert_with(|| CompilationCache::open(&self.config.cache_dir, &platform));
        match self.pipeline.inject(cache, source) {
            Ok(InjectionOutcome::Delivered { dylib, clients }) => {
                info!(source, clients, dylib = %dylib.display(), "Injection delivered");
            }
            Ok(InjectionOutcome::Prepared { dylib }) => {
                info!(source, dylib = %dylib.display(), "Module prepared for pickup");
            }
            Ok(InjectionOutcome::NotReady) => {
                debug!(source, "No compile record yet, injection postponed");
            }
            Err(err) => {
                warn!(source, "Injection failed: {err}");
                self.last_error = Some(err.detail());
            }
        }
    }

    fn file_saved(&mut self, source: &Path, project_root: Option<&Path>) {
        let source = source.to_string_lossy().into_owned();
        let platform = self.client_platform();
        let have_record = self
            .caches
            .get(&platform)
            .map(|cache| cache.contains(&source))
            .unwrap_or(false);
        if !have_record {
            self.try_build_log(&platform, &source, project_root);
        }
        self.inject(&source);
    }

    /// Recovers a compile record for `source` from the most recent build
    /// log, when a logs directory is configured.
    fn try_build_log(&mut self, platform: &str, source: &str, project_root: Option<&Path>) {
        let Some(logs_dir) = self.config.derived_logs_dir.clone() else {
            return;
        };
        let working_dir = project_root.unwrap_or_else(|| Path::new("/tmp"));
        match buildlog::record_for_source(&logs_dir, source, working_dir) {
            Ok(record) => {
                info!(source, logs = %logs_dir.display(), "Recovered compile from the build log");
                // The save itself drives the injection; a pending retry
                // firing here would inject twice.
                let _ = self.cache_mut(platform).store(source, record);
            }
            Err(err) => {
                debug!(source, "No build log fallback: {err}");
            }
        }
    }

    fn save_caches(&mut self) {
        for cache in self.caches.values() {
            if cache.is_empty() {
                continue;
            }
            if let Err(err) = cache.save_snapshot(&self.config.cache_dir) {
                warn!(platform = cache.platform(), "Could not save command cache: {err}");
            }
        }
    }

    fn status(&self) -> EngineStatus {
        let mut platforms: Vec<String> = self.caches.keys().cloned().collect();
        platforms.sort();
        EngineStatus {
            last_source: self.last_source.clone(),
            last_error: self.last_error.clone(),
            cached_records: self.caches.values().map(CompilationCache::len).sum(),
            platforms,
        }
    }

    /// Injections compile for the platform of the newest client, or for the
    /// host when nobody is connected.
    fn client_platform(&self) -> String {
        self.registry
            .current()
            .map(|client| client.snapshot().platform)
            .unwrap_or_else(|| "MacOSX".to_string())
    }

    fn cache_mut(&mut self, platform: &str) -> &mut CompilationCache {
        self.caches
            .entry(platform.to_string())
            .or_insert_with(|| CompilationCache::open(&self.config.cache_dir, platform))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::STANDALONE_PATCHES_SUBDIR;
    use crate::server::ClientHandle;
    use crate::status::LogUi;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs::{self, File};
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn engine_for(config: DaemonConfig) -> (Engine, Arc<ClientRegistry>) {
        let registry = Arc::new(ClientRegistry::default());
        let engine = Engine::start(
            Arc::new(config),
            Arc::clone(&registry),
            Arc::new(SerialQueue::new("test-engine-delivery")),
            Arc::new(LogUi::new(false)),
        )
        .unwrap();
        (engine, registry)
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Compiler and linker stand-ins that create whatever `-o` names.
    fn fake_tools(dir: &TempDir, config: &mut DaemonConfig) {
        let create_output = r#"out=""
while [ $# -gt 1 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
printf 'fake module' > "$out""#;
        config.compiler_override = Some(script(dir.path(), "fake-cc", create_output));
        config.linker_override = Some(script(dir.path(), "fake-ld", create_output));
        config.codesign_override = Some(script(dir.path(), "fake-codesign", "exit 0"));
    }

    fn write_log(path: &Path, entry: &str) {
        let file = File::create(path).unwrap();
        let mut gz = GzEncoder::new(file, Compression::default());
        gz.write_all(entry.as_bytes()).unwrap();
        gz.finish().unwrap();
    }

    #[test]
    fn test_pending_injection_fires_when_record_arrives() {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::for_tests(dir.path());
        fake_tools(&dir, &mut config);
        let tmp_base = config.tmp_base.clone();
        let (engine, _registry) = engine_for(config);
        let handle = engine.handle();

        let source = dir.path().join("Evaluator.cpp");
        fs::write(&source, "int answer() { return 42; }\n").unwrap();
        let source = source.display().to_string();

        // Nothing recorded yet: the injection parks as pending.
        handle.inject(&source);
        let status = handle.status();
        assert_eq!(status.last_source.as_deref(), Some(source.as_str()));
        assert_eq!(status.last_error, None);
        assert!(handle.last_injected_at(&source).is_none());

        handle.store_record(
            "MacOSX",
            &source,
            CompilationRecord::new(vec!["-std=c++17".into()], String::new(), dir.path()),
            true,
        );
        let status = handle.status();
        let patch = tmp_base
            .join(STANDALONE_PATCHES_SUBDIR)
            .join("eval_injection_Evaluator_1.dylib");
        assert!(patch.is_file());
        assert!(handle.last_injected_at(&source).is_some());
        assert_eq!(status.cached_records, 1);
        assert_eq!(status.platforms, vec!["MacOSX".to_string()]);
    }

    #[test]
    fn test_store_keeps_existing_record_while_client_connected() {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig::for_tests(dir.path());
        let cache_dir = config.cache_dir.clone();
        let (engine, registry) = engine_for(config);
        let handle = engine.handle();

        let client = ClientHandle::detached_for_tests(7);
        client.set_platform("iPhoneSimulator".to_string(), "arm64".to_string());
        registry.register(Arc::clone(&client));

        let record_a =
            CompilationRecord::new(vec!["-module-name".into(), "A".into()], String::new(), "/w");
        let record_b =
            CompilationRecord::new(vec!["-module-name".into(), "B".into()], String::new(), "/w");
        handle.store_record("iPhoneSimulator", "/app/Main.swift", record_a.clone(), false);
        handle.store_record("iPhoneSimulator", "/app/Main.swift", record_b.clone(), false);
        handle.save_caches();
        handle.status();

        // The second store was ignored: the running app was built with A.
        let cache = CompilationCache::load_snapshot(&cache_dir, "iPhoneSimulator").unwrap();
        assert_eq!(
            cache.lookup("/app/Main.swift").unwrap().arguments,
            record_a.arguments
        );

        // An explicit refresh replaces it.
        handle.store_record("iPhoneSimulator", "/app/Main.swift", record_b.clone(), true);
        handle.save_caches();
        handle.status();
        let cache = CompilationCache::load_snapshot(&cache_dir, "iPhoneSimulator").unwrap();
        assert_eq!(
            cache.lookup("/app/Main.swift").unwrap().arguments,
            record_b.arguments
        );
    }

    #[test]
    fn test_file_saved_recovers_record_from_build_log() {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::for_tests(dir.path());
        fake_tools(&dir, &mut config);
        let logs = dir.path().join("Logs/Build");
        fs::create_dir_all(&logs).unwrap();
        config.derived_logs_dir = Some(logs.clone());
        let tmp_base = config.tmp_base.clone();
        let (engine, _registry) = engine_for(config);
        let handle = engine.handle();

        let source = dir.path().join("B.swift");
        fs::write(&source, "struct B {}\n").unwrap();
        let source_str = source.display().to_string();
        write_log(
            &logs.join("build.xcactivitylog"),
            &format!(
                "    /tc/usr/bin/swift-frontend -frontend -c -primary-file {source_str} \
                 -module-name App -o /build/B.o"
            ),
        );

        handle.file_saved(source.clone(), Some(dir.path().to_path_buf()));
        let status = handle.status();
        assert_eq!(status.last_error, None);
        assert_eq!(status.cached_records, 1);
        assert!(tmp_base
            .join(STANDALONE_PATCHES_SUBDIR)
            .join("eval_injection_B_1.dylib")
            .is_file());
    }
}
