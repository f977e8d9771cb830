//! The recompile, link, codesign and deliver pipeline.
//!
//! A saved source file turns into a patch module in four steps: replay the
//! recorded compiler invocation with the file as the primary, link the
//! object into a `-interposable` dynamic library, sign it, then hand it to
//! every connected client either by path or as raw bytes. The pipeline is
//! driven from the engine's worker thread, one cycle at a time.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::SystemTime;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::CompilationCache;
use crate::config::DaemonConfig;
use crate::metrics::{timed, InjectionMetrics};
use crate::queue::SerialQueue;
use crate::record::CompilationRecord;
use crate::server::{broadcast_error, broadcast_log, ClientHandle, ClientRegistry};
use crate::status::{InjectionState, UiDelegate};
use crate::unhide::macho;
use crate::{APP_NAME, DYLIB_PREFIX};

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Subdirectory of the scratch base where patches land when no client is
/// connected, so host-side tooling can pick them up.
pub const STANDALONE_PATCHES_SUBDIR: &str = "reflash_patches";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("recompile failed for {source_file}")]
    Compile { source_file: String, errors: String },
    #[error("linking failed")]
    Link { command: String, errors: String },
}

impl PipelineError {
    /// Tool output where there is any, for the status surface.
    pub fn detail(&self) -> String {
        match self {
            PipelineError::Compile { errors, .. } | PipelineError::Link { errors, .. } => {
                errors.clone()
            }
            other => other.to_string(),
        }
    }
}

/// How an injection cycle ended, short of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionOutcome {
    /// The module reached `clients` connections.
    Delivered { dylib: PathBuf, clients: usize },
    /// No compile record yet; the cycle re-fires when one arrives.
    NotReady,
    /// No client connected; the module was prepared on the host for pickup.
    Prepared { dylib: PathBuf },
}

/// A linked module ready for signing and delivery.
struct PreparedModule {
    dylib: PathBuf,
    dylib_name: String,
    platform: String,
    use_filesystem: bool,
}

pub struct Pipeline {
    config: Arc<DaemonConfig>,
    registry: Arc<ClientRegistry>,
    delivery: Arc<SerialQueue>,
    ui: Arc<dyn UiDelegate>,
    /// Front-end binary reported by the most recent intercepted build,
    /// preferred over the toolchain default so compiler versions match.
    logged_frontend: Option<PathBuf>,
    /// Patch numbering when no client connection provides one.
    standalone_number: u32,
    /// Previously prepared module per source stem, unlinked on replacement.
    prepared: FxHashMap<String, PathBuf>,
    last_injected: FxHashMap<String, SystemTime>,
}

impl Pipeline {
    pub fn new(
        config: Arc<DaemonConfig>,
        registry: Arc<ClientRegistry>,
        delivery: Arc<SerialQueue>,
        ui: Arc<dyn UiDelegate>,
    ) -> Self {
        Self {
            config,
            registry,
            delivery,
            ui,
            logged_frontend: None,
            standalone_number: 0,
            prepared: FxHashMap::default(),
            last_injected: FxHashMap::default(),
        }
    }

    pub fn set_logged_frontend(&mut self, frontend: Option<PathBuf>) {
        self.logged_frontend = frontend;
    }

    pub fn last_injected_at(&self, source: &str) -> Option<SystemTime> {
        self.last_injected.get(source).copied()
    }

    /// Runs one full injection cycle for `source` and reports timing to
    /// every client regardless of the outcome.
    pub fn inject(
        &mut self,
        cache: &mut CompilationCache,
        source: &str,
    ) -> Result<InjectionOutcome> {
        let mut metrics = InjectionMetrics::begin(source);
        let result = self.run_cycle(cache, source, &mut metrics);
        let success = matches!(
            result,
            Ok(InjectionOutcome::Delivered { .. } | InjectionOutcome::Prepared { .. })
        );
        metrics.finish(success);
        let json = metrics.to_json();
        for client in self.registry.clients() {
            client.send_metrics(&self.delivery, &json);
        }
        if result.is_err() {
            self.ui.set_state(InjectionState::Error);
            broadcast_error(
                &self.registry,
                &self.delivery,
                "Injection failed. Was your app connected?",
            );
        }
        result
    }

    fn run_cycle(
        &mut self,
        cache: &mut CompilationCache,
        source: &str,
        metrics: &mut InjectionMetrics,
    ) -> Result<InjectionOutcome> {
        self.ui.set_state(InjectionState::Busy);

        let clients = self.registry.clients();
        if clients.is_empty() {
            let Some(module) = self.prepare_module(cache, source, None, metrics)? else {
                self.ui.set_state(InjectionState::Error);
                return Ok(InjectionOutcome::NotReady);
            };
            let _signed = self.codesign(&module)?;
            self.ui.set_state(InjectionState::Ready);
            return Ok(InjectionOutcome::Prepared {
                dylib: module.dylib,
            });
        }

        // Newest connection first, matching the client most likely in use.
        let mut delivered = 0;
        let mut last_dylib = None;
        for client in clients.iter().rev() {
            let Some(module) = self.prepare_module(cache, source, Some(client), metrics)? else {
                self.ui.set_state(InjectionState::Error);
                return Ok(InjectionOutcome::NotReady);
            };
            let contents = self.codesign(&module)?;
            self.deliver(client, &module, contents, source);
            delivered += 1;
            last_dylib = Some(module.dylib);
        }
        match last_dylib {
            Some(dylib) => Ok(InjectionOutcome::Delivered {
                dylib,
                clients: delivered,
            }),
            None => Ok(InjectionOutcome::NotReady),
        }
    }

    /// Recompiles and links `source`, or returns `None` after parking it as
    /// pending when no compile record exists yet.
    fn prepare_module(
        &mut self,
        cache: &mut CompilationCache,
        source: &str,
        client: Option<&Arc<ClientHandle>>,
        metrics: &mut InjectionMetrics,
    ) -> Result<Option<PreparedModule>> {
        let snapshot = client.map(|c| c.snapshot());
        let standalone_dir = self.config.tmp_base.join(STANDALONE_PATCHES_SUBDIR);
        let platform = snapshot
            .as_ref()
            .map(|s| s.platform.clone())
            .unwrap_or_else(|| "MacOSX".to_string());
        let arch = snapshot
            .as_ref()
            .map(|s| s.arch.clone())
            .unwrap_or_else(|| crate::server::default_arch().to_string());

        // Postponements must not consume an injection number.
        let Some(record) = cache.lookup(source) else {
            broadcast_error(
                &self.registry,
                &self.delivery,
                &format!("Postponing: {source} Have you viewed it in the editor?"),
            );
            cache.set_pending(source);
            return Ok(None);
        };

        let stem = Path::new(source)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.to_string());
        // Standalone C++ patches accumulate; replace the previous one.
        if client.is_none() && source.ends_with(".cpp") {
            if let Some(previous) = self.prepared.get(&stem) {
                let _ = fs::remove_file(previous);
            }
        }

        let number = match client {
            Some(client) => client.next_injection_number(),
            None => {
                self.standalone_number += 1;
                self.standalone_number
            }
        };
        let dylib_name = format!("{DYLIB_PREFIX}{stem}_{number}.dylib");
        let use_filesystem = snapshot
            .as_ref()
            .map(|s| s.local_filesystem)
            .unwrap_or(true);
        let dylib_dir = if let Some(snapshot) = &snapshot {
            if use_filesystem {
                snapshot
                    .tmp_path
                    .clone()
                    .unwrap_or_else(|| self.config.tmp_base.clone())
            } else {
                self.config.tmp_base.clone()
            }
        } else {
            standalone_dir.clone()
        };

        self.last_injected
            .insert(source.to_string(), SystemTime::now());
        let object = self.recompile(&record, source, &platform, number, metrics)?;

        if client.is_none() {
            fs::create_dir_all(&standalone_dir)?;
        }
        let dylib = dylib_dir.join(&dylib_name);
        let link_ms = self.link(&object, &dylib, &platform, &arch)?;
        metrics.set_linking_ms(link_ms);

        self.prepared.insert(stem, dylib.clone());
        debug!(dylib = %dylib.display(), "Prepared dylib");
        Ok(Some(PreparedModule {
            dylib,
            dylib_name,
            platform,
            use_filesystem,
        }))
    }

    /// Replays the recorded invocation with `source` as the primary file and
    /// returns the object file it produced.
    fn recompile(
        &mut self,
        record: &CompilationRecord,
        source: &str,
        platform: &str,
        number: u32,
        metrics: &mut InjectionMetrics,
    ) -> Result<PathBuf> {
        let scratch = self.config.tmp_base.join(APP_NAME);
        let object = PathBuf::from(format!("{}_{number}.o", scratch.display()));
        let filelist = PathBuf::from(format!("{}.filelist", scratch.display()));
        remove_if_present(&object)?;
        remove_if_present(&filelist)?;
        fs::write(&filelist, &record.member_files)?;

        broadcast_log(
            &self.registry,
            &self.delivery,
            &format!("Recompiling: {source}"),
        );

        let is_swift = source.ends_with(".swift");
        let compiler = self.compile_tool(is_swift);
        let mut extra: Vec<String> = if is_swift {
            let platform_usr = self.config.platform_usr_dir(platform);
            let plugin_server = platform_usr.join("bin/swift-plugin-server");
            let toolchain = self.config.toolchain_dir();
            vec![
                "-c".into(),
                "-filelist".into(),
                filelist.display().to_string(),
                "-primary-file".into(),
                source.into(),
                "-external-plugin-path".into(),
                format!(
                    "{}#{}",
                    platform_usr.join("lib/swift/host/plugins").display(),
                    plugin_server.display()
                ),
                "-external-plugin-path".into(),
                format!(
                    "{}#{}",
                    platform_usr.join("local/lib/swift/host/plugins").display(),
                    plugin_server.display()
                ),
                "-plugin-path".into(),
                toolchain.join("usr/lib/swift/host/plugins").display().to_string(),
                "-plugin-path".into(),
                toolchain
                    .join("usr/local/lib/swift/host/plugins")
                    .display()
                    .to_string(),
            ]
        } else {
            vec![
                "-c".into(),
                source.into(),
                "-Xclang".into(),
                "-fno-validate-pch".into(),
            ]
        };
        extra.extend([
            "-o".into(),
            object.display().to_string(),
            "-DDEBUG".into(),
            "-DINJECTING".into(),
        ]);

        metrics.mark_processing();
        let (output, compile_ms) = timed(|| {
            Command::new(&compiler)
                .args(&record.arguments)
                .args(&extra)
                .current_dir(&record.working_dir)
                .output()
        });
        let output = output?;
        let mut errors = String::from_utf8_lossy(&output.stdout).into_owned();
        errors.push_str(&String::from_utf8_lossy(&output.stderr));

        if errors.contains(" error: ") {
            let command = std::iter::once(compiler.display().to_string())
                .chain(record.arguments.iter().cloned())
                .chain(extra.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");
            info!(%command, "Recompile failed");
            broadcast_error(
                &self.registry,
                &self.delivery,
                &format!("Recompile failed for: {source}\n{errors}"),
            );
            return Err(PipelineError::Compile {
                source_file: source.to_string(),
                errors,
            });
        }

        debug!(source, "Compiled in {compile_ms:.0}ms");
        metrics.set_compilation_ms(compile_ms);
        Ok(object)
    }

    fn compile_tool(&self, is_swift: bool) -> PathBuf {
        if let Some(tool) = &self.config.compiler_override {
            return tool.clone();
        }
        if is_swift {
            self.logged_frontend
                .clone()
                .unwrap_or_else(|| self.config.swift_frontend_path())
        } else {
            self.config.toolchain_dir().join("usr/bin/clang")
        }
    }

    /// Links `object` into an interposable dynamic library at `dylib` and
    /// returns the linking time in milliseconds.
    fn link(&self, object: &Path, dylib: &Path, platform: &str, arch: &str) -> Result<f64> {
        let toolchain = self.config.toolchain_dir();
        let lowercased = platform.to_lowercase();
        let frameworks = self
            .config
            .support_frameworks_dir
            .clone()
            .unwrap_or_else(|| self.config.tmp_base.clone());

        let mut argv: Vec<String> = vec![
            "-arch".into(),
            arch.into(),
            "-Xlinker".into(),
            "-dylib".into(),
            "-isysroot".into(),
            self.config.sdk_path(platform).display().to_string(),
            format!(
                "-L{}",
                toolchain
                    .join(format!("usr/lib/swift/{lowercased}"))
                    .display()
            ),
        ];
        match min_os_flag(platform) {
            Ok(Some(flag)) => argv.push(flag.to_string()),
            Ok(None) => {}
            Err(()) => {
                broadcast_error(
                    &self.registry,
                    &self.delivery,
                    &format!("Invalid platform {platform}"),
                );
            }
        }
        argv.extend(
            [
                "-undefined",
                "dynamic_lookup",
                "-dead_strip",
                "-Xlinker",
                "-objc_abi_version",
                "-Xlinker",
                "2",
                "-Xlinker",
                "-interposable",
                "-fobjc-arc",
            ]
            .map(String::from),
        );
        if self.config.testing_support {
            let platform_dev = self.config.platform_dev_dir(platform);
            argv.extend([
                "-F".to_string(),
                self.config.products_dir().display().to_string(),
                "-F".to_string(),
                platform_dev.join("Library/Frameworks").display().to_string(),
                "-L".to_string(),
                platform_dev.join("usr/lib").display().to_string(),
            ]);
            argv.extend(
                self.config
                    .device_libraries
                    .split_whitespace()
                    .map(String::from),
            );
        }
        argv.extend([
            "-fprofile-instr-generate".to_string(),
            object.display().to_string(),
            "-L".to_string(),
            frameworks.display().to_string(),
            "-F".to_string(),
            frameworks.display().to_string(),
            "-rpath".to_string(),
            frameworks.display().to_string(),
            "-o".to_string(),
            dylib.display().to_string(),
            "-rpath".to_string(),
            "/usr/lib/swift".to_string(),
            "-rpath".to_string(),
            toolchain
                .join(format!("usr/lib/swift-5.5/{lowercased}"))
                .display()
                .to_string(),
        ]);

        let linker = self.config.clang_path();
        let (output, link_ms) = timed(|| Command::new(&linker).args(&argv).output());
        let output = output?;
        if !output.status.success() {
            let mut errors = String::from_utf8_lossy(&output.stdout).into_owned();
            errors.push_str(&String::from_utf8_lossy(&output.stderr));
            let command = std::iter::once(linker.display().to_string())
                .chain(argv.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");
            broadcast_error(
                &self.registry,
                &self.delivery,
                &format!("Linking failed:\n{command}\nerrors:\n{errors}"),
            );
            return Err(PipelineError::Link { command, errors });
        }
        Ok(link_ms)
    }

    /// Signs the module and returns its final bytes. Signing problems are
    /// reported but never block delivery; simulators load unsigned modules.
    fn codesign(&self, module: &PreparedModule) -> Result<Vec<u8>> {
        if module.platform != "iPhoneSimulator" {
            let identity = if !module.platform.ends_with("Simulator")
                && module.platform != "MacOSX"
            {
                let identity = self
                    .config
                    .signing_identity
                    .clone()
                    .unwrap_or_else(|| "-".to_string());
                broadcast_log(
                    &self.registry,
                    &self.delivery,
                    &format!("Codesigning dylib with identity {identity}"),
                );
                identity
            } else {
                "-".to_string()
            };

            if !is_shared_library(&module.dylib) {
                broadcast_error(
                    &self.registry,
                    &self.delivery,
                    &format!("Codesign failed: {} is not a dylib", module.dylib.display()),
                );
            } else {
                let result = Command::new(self.config.codesign_path())
                    .env("CODESIGN_ALLOCATE", self.config.codesign_allocate_path())
                    .arg("--force")
                    .arg("-s")
                    .arg(&identity)
                    .arg(&module.dylib)
                    .output();
                match result {
                    Ok(output) if output.status.success() => {}
                    Ok(output) => {
                        let errors = String::from_utf8_lossy(&output.stderr).into_owned();
                        broadcast_error(
                            &self.registry,
                            &self.delivery,
                            &format!("Codesign failed errors:\n{errors}"),
                        );
                    }
                    Err(err) => {
                        broadcast_error(
                            &self.registry,
                            &self.delivery,
                            &format!("Codesign failed: {err}"),
                        );
                    }
                }
            }
        }
        Ok(fs::read(&module.dylib)?)
    }

    fn deliver(
        &self,
        client: &Arc<ClientHandle>,
        module: &PreparedModule,
        contents: Vec<u8>,
        source: &str,
    ) {
        let symbols = macho::global_symbol_names(&contents);
        let sent = if module.use_filesystem {
            client.send_load(&self.delivery, &module.dylib.display().to_string())
        } else {
            client.send_inject(&self.delivery, &module.dylib_name, contents)
        };
        if !sent {
            warn!(client = client.id(), "Module delivery failed");
            return;
        }
        if let Some(symbols) = symbols {
            self.check_symbol_drift(client, source, symbols);
        }
    }

    /// Injection swaps function bodies; new or removed interposable symbols
    /// cannot be bound into the running process, so warn when the set moved.
    fn check_symbol_drift(&self, client: &Arc<ClientHandle>, source: &str, symbols: Vec<String>) {
        let mut interposable: Vec<String> = symbols
            .into_iter()
            .filter(|name| is_interposable_swift_symbol(name))
            .collect();
        interposable.sort();
        if let Some(previous) = client.exports_for(source) {
            if previous.len() != interposable.len() {
                broadcast_log(
                    &self.registry,
                    &self.delivery,
                    &format!(
                        "ℹ️ Symbols altered, this may not be supported. {} c.f. {}",
                        interposable.len(),
                        previous.len()
                    ),
                );
            }
        }
        client.set_exports(source.to_string(), interposable);
    }
}

/// Swift function symbols that interposing can rebind, excluding closures
/// and metadata that legitimately churn between compiles.
pub fn is_interposable_swift_symbol(name: &str) -> bool {
    name.starts_with("_$s")
        && !name.contains("fU")
        && !name.ends_with("MD")
        && !name.ends_with("Oh")
        && !name.ends_with("Wl")
        && !name.ends_with("WL")
}

/// Minimum-OS linker flag per platform; `Err` means the platform is unknown.
fn min_os_flag(platform: &str) -> std::result::Result<Option<&'static str>, ()> {
    match platform {
        "iPhoneSimulator" => Ok(Some("-mios-simulator-version-min=9.0")),
        "iPhoneOS" => Ok(Some("-miphoneos-version-min=9.0")),
        "AppleTVSimulator" => Ok(Some("-mtvos-simulator-version-min=9.0")),
        "AppleTVOS" => Ok(Some("-mtvos-version-min=9.0")),
        "MacOSX" => Ok(Some("-mmacosx-version-min=10.11")),
        "WatchSimulator" | "WatchOS" | "XRSimulator" | "XROS" => Ok(None),
        _ => Err(()),
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn is_shared_library(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .map(|()| macho::is_image_magic(&magic))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::LogUi;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn pipeline_for(config: DaemonConfig) -> (Pipeline, Arc<ClientRegistry>) {
        let registry = Arc::new(ClientRegistry::default());
        let pipeline = Pipeline::new(
            Arc::new(config),
            Arc::clone(&registry),
            Arc::new(SerialQueue::new("test-pipeline-delivery")),
            Arc::new(LogUi::new(false)),
        );
        (pipeline, registry)
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

    #[test]
    fn test_interposable_symbol_filter() {
        assert!(is_interposable_swift_symbol("_$s3App4mainyyF"));
        // Closures and metadata churn between compiles and are ignored.
        assert!(!is_interposable_swift_symbol("_$s3App4mainyyFyycfU_"));
        assert!(!is_interposable_swift_symbol("_$s3App1VVMD"));
        assert!(!is_interposable_swift_symbol("_$s3App1VVWl"));
        assert!(!is_interposable_swift_symbol("_main"));
    }

    #[test]
    fn test_min_os_flags_per_platform() {
        assert_eq!(
            min_os_flag("iPhoneSimulator"),
            Ok(Some("-mios-simulator-version-min=9.0"))
        );
        assert_eq!(min_os_flag("MacOSX"), Ok(Some("-mmacosx-version-min=10.11")));
        assert_eq!(min_os_flag("WatchOS"), Ok(None));
        assert_eq!(min_os_flag("PlayStation"), Err(()));
    }

    #[test]
    fn test_unrecorded_source_is_postponed() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, _registry) = pipeline_for(DaemonConfig::for_tests(dir.path()));
        let mut cache = CompilationCache::new("MacOSX");

        let outcome = pipeline
            .inject(&mut cache, "/app/Sources/Feature.swift")
            .unwrap();

        assert_eq!(outcome, InjectionOutcome::NotReady);
        assert_eq!(cache.pending_source(), Some("/app/Sources/Feature.swift"));
    }

    #[test]
    fn test_standalone_cycle_prepares_and_replaces_patches() {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::for_tests(dir.path());
        fake_tools(&dir, &mut config);
        let tmp_base = config.tmp_base.clone();
        let (mut pipeline, _registry) = pipeline_for(config);

        let mut cache = CompilationCache::new("MacOSX");
        let source = dir.path().join("Evaluator.cpp");
        fs::write(&source, "int answer() { return 42; }\n").unwrap();
        cache.store(
            &source.display().to_string(),
            CompilationRecord::new(vec!["-std=c++17".into()], String::new(), dir.path()),
        );

        let outcome = pipeline
            .inject(&mut cache, &source.display().to_string())
            .unwrap();
        let first = tmp_base
            .join(STANDALONE_PATCHES_SUBDIR)
            .join("eval_injection_Evaluator_1.dylib");
        assert_eq!(
            outcome,
            InjectionOutcome::Prepared {
                dylib: first.clone()
            }
        );
        assert!(first.is_file());

        // A second save supersedes the first prepared patch.
        let outcome = pipeline
            .inject(&mut cache, &source.display().to_string())
            .unwrap();
        let second = tmp_base
            .join(STANDALONE_PATCHES_SUBDIR)
            .join("eval_injection_Evaluator_2.dylib");
        assert_eq!(
            outcome,
            InjectionOutcome::Prepared {
                dylib: second.clone()
            }
        );
        assert!(second.is_file());
        assert!(!first.exists());
    }

    #[test]
    fn test_compiler_diagnostics_fail_the_cycle() {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::for_tests(dir.path());
        fake_tools(&dir, &mut config);
        config.compiler_override = Some(script(
            dir.path(),
            "failing-cc",
            r#"echo "Feature.cpp:3:1: error: expected expression""#,
        ));
        let (mut pipeline, _registry) = pipeline_for(config);

        let mut cache = CompilationCache::new("MacOSX");
        let source = dir.path().join("Feature.cpp");
        fs::write(&source, "int broken(\n").unwrap();
        cache.store(
            &source.display().to_string(),
            CompilationRecord::new(Vec::new(), String::new(), dir.path()),
        );

        let err = pipeline
            .inject(&mut cache, &source.display().to_string())
            .unwrap_err();
        match err {
            PipelineError::Compile { errors, .. } => {
                assert!(errors.contains("expected expression"));
            }
            other => panic!("expected compile failure, got {other:?}"),
        }
        // A failed compile is not a postponement.
        assert_eq!(cache.pending_source(), None);
    }

    #[test]
    fn test_link_failure_reports_command_and_output() {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::for_tests(dir.path());
        fake_tools(&dir, &mut config);
        config.linker_override = Some(script(
            dir.path(),
            "failing-ld",
            r#"echo "ld: framework not found Missing" >&2; exit 1"#,
        ));
        let (mut pipeline, _registry) = pipeline_for(config);

        let mut cache = CompilationCache::new("MacOSX");
        let source = dir.path().join("Feature.cpp");
        fs::write(&source, "int fine() { return 1; }\n").unwrap();
        cache.store(
            &source.display().to_string(),
            CompilationRecord::new(Vec::new(), String::new(), dir.path()),
        );

        let err = pipeline
            .inject(&mut cache, &source.display().to_string())
            .unwrap_err();
        match err {
            PipelineError::Link { command, errors } => {
                assert!(errors.contains("framework not found"));
                assert!(command.contains("-interposable"));
            }
            other => panic!("expected link failure, got {other:?}"),
        }
    }
}
