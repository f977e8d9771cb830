use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::unbounded;
use rustc_hash::FxHashMap;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reflash_core::capture::args::platform_from_sdk_path;
use reflash_core::capture::{CaptureEvent, IdeMonitor, InterceptContext, InterceptServer};
use reflash_core::{
    ClientRegistry, ConnectionServer, DaemonConfig, DirectoryWatcher, Engine, EngineHandle, LogUi,
    SerialQueue, ServerContext, UiDelegate, Unhider, DEFAULT_PLATFORM,
};

/// Reflash - recompiles saved source files and hot-swaps the result into
/// attached app processes
#[derive(Parser, Debug, Clone)]
#[command(name = "reflashd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to watch for saves (repeatable)
    #[arg(short, long, value_name = "DIR")]
    watch: Vec<PathBuf>,

    /// Project root used for build-log recovery of unseen files
    #[arg(long, value_name = "DIR")]
    project_root: Option<PathBuf>,

    /// Toolchain bundle to compile and link with, e.g. /Applications/Xcode.app
    #[arg(long, value_name = "APP")]
    toolchain: Option<PathBuf>,

    /// Port instrumented apps connect to
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Port the compiler shim relays intercepted invocations to
    #[arg(long, value_name = "PORT")]
    commands_port: Option<u16>,

    /// Code-signing identity for patches loaded on a physical device
    #[arg(long, value_name = "IDENTITY")]
    signing_identity: Option<String>,

    /// Linker flags appended for test targets, overriding the default set
    #[arg(long, value_name = "FLAGS")]
    device_libraries: Option<String>,

    /// Link test-runner support libraries into every patch
    #[arg(long)]
    testing_support: bool,

    /// IDE binary to launch and monitor for compiler diagnostics
    #[arg(long, value_name = "BINARY")]
    monitor: Option<PathBuf>,

    /// Restart the monitored IDE when it exits
    #[arg(long)]
    auto_relaunch: bool,

    /// Where per-platform command snapshots persist across runs
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// IDE build-log directory searched when a saved file was never
    /// compiled while the daemon was running
    #[arg(long, value_name = "DIR")]
    derived_logs: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    // Set RUST_LOG=debug for detailed logs, RUST_LOG=info for normal output
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(build_config(&cli));

    let delivery = Arc::new(SerialQueue::new("delivery"));
    let registry = Arc::new(ClientRegistry::default());
    let unhider = Arc::new(Unhider::new(Arc::clone(&registry), Arc::clone(&delivery)));
    let ui: Arc<dyn UiDelegate> = Arc::new(LogUi::new(true));

    let engine = Engine::start(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&delivery),
        Arc::clone(&ui),
    )?;
    let handle = engine.handle();
    if let Some(dir) = &config.derived_logs_dir {
        info!(dir = %dir.display(), "Build-log recovery enabled");
    }

    // Both servers and any connected client can nominate project roots to
    // watch; they all land on this channel.
    let (watch_tx, watch_rx) = unbounded::<PathBuf>();

    let clients = ConnectionServer::start(
        ServerContext {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            delivery: Arc::clone(&delivery),
            unhider: Arc::clone(&unhider),
            ui: Arc::clone(&ui),
            watch_offer: Some(watch_tx.clone()),
        },
        config.client_port,
    )?;
    let intercept = InterceptServer::start(
        InterceptContext {
            config: Arc::clone(&config),
            engine: handle.clone(),
            unhider: Arc::clone(&unhider),
            ui: Arc::clone(&ui),
            watch_offer: Some(watch_tx.clone()),
        },
        config.intercept_port,
    )?;

    let _monitor = match &cli.monitor {
        Some(ide) => {
            let sink_engine = handle.clone();
            let sink_unhider = Arc::clone(&unhider);
            let sink_root = cli.project_root.clone();
            let monitor = IdeMonitor::launch(ide, config.auto_relaunch, move |event| match event {
                CaptureEvent::Record {
                    source,
                    record,
                    package_frameworks,
                } => {
                    if let Some(dir) = package_frameworks {
                        sink_unhider.set_package_frameworks(PathBuf::from(dir));
                    }
                    // Diagnostic-stream records carry no platform of their
                    // own; the SDK path inside the arguments names it.
                    let platform = record
                        .arguments
                        .iter()
                        .find_map(|arg| platform_from_sdk_path(arg))
                        .unwrap_or_else(|| DEFAULT_PLATFORM.to_string());
                    sink_engine.store_record(&platform, &source, record, false);
                }
                CaptureEvent::FileSaved { path } => {
                    sink_engine.file_saved(PathBuf::from(path), sink_root.clone());
                }
            })?;
            info!(ide = %ide.display(), "Monitoring IDE diagnostics");
            Some(monitor)
        }
        None => None,
    };
    drop(watch_tx);

    let mut watchers: FxHashMap<PathBuf, DirectoryWatcher> = FxHashMap::default();
    for root in &cli.watch {
        watch_root(&mut watchers, root.clone(), &handle);
    }
    if let Some(root) = &cli.project_root {
        watch_root(&mut watchers, root.clone(), &handle);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        clients = %clients.local_addr(),
        builds = %intercept.local_addr(),
        "reflash daemon ready"
    );

    // Runs for the life of the servers: their contexts hold the sender.
    for root in watch_rx {
        watch_root(&mut watchers, root, &handle);
    }
    Ok(())
}

/// Environment defaults with command-line overrides applied on top.
fn build_config(cli: &Cli) -> DaemonConfig {
    let mut config = DaemonConfig::from_env();
    if let Some(toolchain) = &cli.toolchain {
        config.xcode_path = toolchain.clone();
    }
    if let Some(port) = cli.port {
        config.client_port = port;
    }
    if let Some(port) = cli.commands_port {
        config.intercept_port = port;
    }
    if let Some(identity) = &cli.signing_identity {
        config.signing_identity = Some(identity.clone());
    }
    if let Some(libraries) = &cli.device_libraries {
        config.device_libraries = libraries.clone();
    }
    if cli.testing_support {
        config.testing_support = true;
    }
    if cli.auto_relaunch {
        config.auto_relaunch = true;
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(dir) = &cli.derived_logs {
        config.derived_logs_dir = Some(dir.clone());
    }
    config
}

/// Starts watching `root` for saves. Saves inject through the engine with
/// the watched root as the project root for build-log recovery.
fn watch_root(
    watchers: &mut FxHashMap<PathBuf, DirectoryWatcher>,
    root: PathBuf,
    engine: &EngineHandle,
) {
    let canonical = root.canonicalize().unwrap_or(root);
    if let Some(existing) = watchers.get(&canonical) {
        // A repeated offer means the project was rebuilt or reconnected,
        // which is the cue to resume after a version-control lock.
        if existing.is_locked() {
            existing.relaunch();
        }
        return;
    }
    let handler_engine = engine.clone();
    let handler_root = canonical.clone();
    match DirectoryWatcher::start(
        &canonical,
        Box::new(move |path| handler_engine.file_saved(path, Some(handler_root.clone()))),
    ) {
        Ok(watcher) => {
            watchers.insert(canonical, watcher);
        }
        Err(err) => warn!(root = %canonical.display(), "Could not watch: {err}"),
    }
}
