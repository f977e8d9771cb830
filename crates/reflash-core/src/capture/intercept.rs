//! Receiver for compiler invocations relayed by the interception shim.
//!
//! When interception is applied, a small executable stands in for the
//! toolchain's compiler front end. Each build-time invocation dials in
//! here, relays its full argument list, then hands off to the real front
//! end; the build itself is never delayed by this server. One connection
//! carries exactly one invocation.

use std::fs;
use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use rustc_hash::FxHashSet;
use tracing::{debug, error, info, warn};

use crate::capture::args::extract_intercepted;
use crate::config::DaemonConfig;
use crate::engine::EngineHandle;
use crate::server::protocol::{self, ProtocolError};
use crate::status::UiDelegate;
use crate::unhide::Unhider;

/// Everything a relay connection needs, cloned into each thread.
#[derive(Clone)]
pub struct InterceptContext {
    pub config: Arc<DaemonConfig>,
    pub engine: EngineHandle,
    pub unhider: Arc<Unhider>,
    pub ui: Arc<dyn UiDelegate>,
    /// Project roots relayed by builds, offered for watching.
    pub watch_offer: Option<Sender<PathBuf>>,
}

/// Accepts shim connections and folds their invocations into the engine.
pub struct InterceptServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl InterceptServer {
    /// Binds `port` on the configured host and starts accepting. Pass port
    /// zero to let the OS choose.
    pub fn start(ctx: InterceptContext, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((ctx.config.bind_host.as_str(), port))?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name(format!("intercept-{}", local_addr.port()))
            .spawn(move || accept_loop(ctx, listener, flag))?;
        info!(%local_addr, "Listening for intercepted builds");
        Ok(Self {
            local_addr,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the accept loop so it observes the flag.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InterceptServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(ctx: InterceptContext, listener: TcpListener, shutdown: Arc<AtomicBool>) {
    // Each build relays its root dozens of times; offer it once.
    let offered_roots = Arc::new(Mutex::new(FxHashSet::default()));
    let mut next_id = 0u64;
    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, "Accept failed");
                continue;
            }
        };
        next_id += 1;
        let id = next_id;
        let ctx = ctx.clone();
        let offered = Arc::clone(&offered_roots);
        let spawned = thread::Builder::new()
            .name(format!("relay-{id}"))
            .spawn(move || {
                if let Err(err) = serve_relay(&ctx, &offered, stream, id) {
                    warn!(relay = id, %err, "Relay closed with error");
                }
            });
        if let Err(err) = spawned {
            error!(%err, "Failed to spawn relay thread");
        }
    }
}

fn serve_relay(
    ctx: &InterceptContext,
    offered: &Mutex<FxHashSet<PathBuf>>,
    stream: TcpStream,
    id: u64,
) -> protocol::Result<()> {
    stream.set_nodelay(true).ok();
    let mut reader = BufReader::new(stream);

    let version = protocol::read_string(&mut reader)?;
    if version != protocol::INTERCEPT_VERSION {
        error!(
            relay = id,
            version, "Shim version mismatch; re-select the toolchain to re-apply interception."
        );
        return Ok(());
    }
    let project_root = PathBuf::from(protocol::read_string(&mut reader)?);
    let frontend = PathBuf::from(protocol::read_string(&mut reader)?);

    // Only direct per-file compiles are worth capturing; the shim execs
    // straight through for everything else, but double-check here.
    let flag1 = protocol::read_string(&mut reader)?;
    let flag2 = protocol::read_string(&mut reader)?;
    if flag1 != "-frontend" || flag2 != "-c" {
        debug!(relay = id, flag1, flag2, "Not a compile invocation, skipped");
        return Ok(());
    }

    let mut raw = vec![flag1, flag2];
    loop {
        let arg = match protocol::read_string(&mut reader) {
            Ok(arg) => arg,
            Err(ProtocolError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err),
        };
        if arg == protocol::ARGUMENTS_END {
            break;
        }
        raw.push(arg);
    }
    debug!(relay = id, args = raw.len(), root = %project_root.display(), "Relayed invocation");

    note_package_frameworks(ctx, &raw);

    let extracted = extract_intercepted(&raw, |filelist| fs::read_to_string(filelist))?;
    let Some(invocation) = extracted else {
        debug!(relay = id, "Not a per-file compile, skipped");
        return Ok(());
    };
    info!(
        relay = id,
        platform = %invocation.platform,
        primaries = invocation.primary_files.len(),
        "Captured compile"
    );

    // Replays must go through the same front end the build used, not the
    // daemon's configured toolchain, or module formats can mismatch.
    ctx.engine.set_logged_frontend(Some(frontend));
    let record = invocation.to_record();
    for source in &invocation.primary_files {
        ctx.engine
            .store_record(&invocation.platform, source, record.clone(), false);
    }
    ctx.engine.save_caches();

    offer_watch(ctx, offered, project_root);
    Ok(())
}

/// `-F` search paths ending in `/PackageFrameworks` pinpoint the build's
/// derived data, which the symbol patcher needs to locate object files.
fn note_package_frameworks(ctx: &InterceptContext, raw: &[String]) {
    for pair in raw.windows(2) {
        if pair[0] == "-F" && pair[1].ends_with("/PackageFrameworks") {
            ctx.unhider.set_package_frameworks(PathBuf::from(&pair[1]));
        }
    }
}

fn offer_watch(ctx: &InterceptContext, offered: &Mutex<FxHashSet<PathBuf>>, root: PathBuf) {
    let Some(offer) = &ctx.watch_offer else {
        return;
    };
    if root.as_os_str().is_empty() || !offered.lock().unwrap().insert(root.clone()) {
        return;
    }
    if ctx.ui.offer_watch(&root) {
        let _ = offer.send(root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CompilationCache;
    use crate::engine::Engine;
    use crate::queue::SerialQueue;
    use crate::server::ClientRegistry;
    use crate::status::LogUi;
    use crossbeam_channel::unbounded;
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct Rig {
        ctx: InterceptContext,
        engine: EngineHandle,
        _engine: Engine,
    }

    fn rig(base: &TempDir, watch_offer: Option<Sender<PathBuf>>) -> Rig {
        let config = Arc::new(DaemonConfig::for_tests(base.path()));
        let registry = Arc::new(ClientRegistry::default());
        let delivery = Arc::new(SerialQueue::new("test-intercept-delivery"));
        let ui: Arc<dyn UiDelegate> = Arc::new(LogUi::new(true));
        let engine = Engine::start(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&delivery),
            Arc::clone(&ui),
        )
        .unwrap();
        let handle = engine.handle();
        Rig {
            ctx: InterceptContext {
                config,
                engine: handle.clone(),
                unhider: Arc::new(Unhider::new(registry, delivery)),
                ui,
                watch_offer,
            },
            engine: handle,
            _engine: engine,
        }
    }

    fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// One buffered write per relay, so a server that drops the connection
    /// early cannot break the test mid-sequence.
    fn relay(addr: SocketAddr, version: &str, root: &str, frontend: &str, args: &[&str]) {
        let mut frames = Vec::new();
        protocol::write_string(&mut frames, version).unwrap();
        protocol::write_string(&mut frames, root).unwrap();
        protocol::write_string(&mut frames, frontend).unwrap();
        for arg in args {
            protocol::write_string(&mut frames, arg).unwrap();
        }
        protocol::write_string(&mut frames, protocol::ARGUMENTS_END).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&frames).unwrap();
    }

    #[test]
    fn test_relayed_invocation_reaches_the_cache() {
        let dir = TempDir::new().unwrap();
        let rig = rig(&dir, None);
        let cache_dir = rig.ctx.config.cache_dir.clone();
        let unhider = Arc::clone(&rig.ctx.unhider);
        let server = InterceptServer::start(rig.ctx, 0).unwrap();

        relay(
            server.local_addr(),
            protocol::INTERCEPT_VERSION,
            "/app",
            "/tc/usr/bin/swift-frontend",
            &[
                "-frontend",
                "-c",
                "-primary-file",
                "/app/A.swift",
                "-module-name",
                "App",
                "-sdk",
                "/sdks/iPhoneSimulator17.4.sdk",
                "-F",
                "/dd/App-abc/Build/Products/Debug-iphonesimulator/PackageFrameworks",
            ],
        );

        wait_until("the compile to be cached", || {
            rig.engine.status().cached_records == 1
        });
        assert_eq!(
            rig.engine.status().platforms,
            vec!["iPhoneSimulator".to_string()]
        );

        // The batch was snapshotted for the next daemon run.
        let cache = CompilationCache::load_snapshot(&cache_dir, "iPhoneSimulator").unwrap();
        let record = cache.lookup("/app/A.swift").unwrap();
        assert!(record.arguments.contains(&"-module-name".to_string()));

        // The -F pair located the build's derived data.
        assert_eq!(
            unhider.intermediates_dir(),
            Some(PathBuf::from("/dd/Build/Intermediates.noindex"))
        );
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let rig = rig(&dir, None);
        let server = InterceptServer::start(rig.ctx, 0).unwrap();

        relay(
            server.local_addr(),
            "4999",
            "/app",
            "/tc/usr/bin/swift-frontend",
            &["-frontend", "-c", "-primary-file", "/app/Stale.swift"],
        );
        relay(
            server.local_addr(),
            protocol::INTERCEPT_VERSION,
            "/app",
            "/tc/usr/bin/swift-frontend",
            &["-frontend", "-c", "-primary-file", "/app/Good.swift"],
        );

        wait_until("the valid relay to be cached", || {
            rig.engine.status().cached_records == 1
        });
        thread::sleep(Duration::from_millis(150));
        let status = rig.engine.status();
        assert_eq!(status.cached_records, 1);
        assert_eq!(
            status.last_source, None,
            "a store alone must not trigger an injection"
        );
    }

    #[test]
    fn test_project_root_offered_once() {
        let dir = TempDir::new().unwrap();
        let (offers, offered) = unbounded();
        let rig = rig(&dir, Some(offers));
        let server = InterceptServer::start(rig.ctx, 0).unwrap();

        for source in ["-primary-file /a/A.swift", "-primary-file /a/B.swift"] {
            let mut args = vec!["-frontend", "-c"];
            args.extend(source.split(' '));
            relay(
                server.local_addr(),
                protocol::INTERCEPT_VERSION,
                "/app",
                "/tc/usr/bin/swift-frontend",
                &args,
            );
        }

        assert_eq!(
            offered.recv_timeout(Duration::from_secs(5)).unwrap(),
            PathBuf::from("/app")
        );
        wait_until("both compiles to be cached", || {
            rig.engine.status().cached_records == 2
        });
        assert!(offered.try_recv().is_err());
    }
}
