//! Per-client connection state and the accept loop.

use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::queue::SerialQueue;
use crate::server::protocol::{self, Command, ProtocolError, Response};
use crate::server::ClientRegistry;
use crate::status::{InjectionState, UiDelegate};
use crate::unhide::Unhider;
use crate::{DEFAULT_PLATFORM, LOG_PREFIX};

/// Everything a connection needs to do its job, cloned into each thread.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<DaemonConfig>,
    pub registry: Arc<ClientRegistry>,
    /// All outbound writes are funnelled through this queue.
    pub delivery: Arc<SerialQueue>,
    pub unhider: Arc<Unhider>,
    pub ui: Arc<dyn UiDelegate>,
    /// Directories clients report as project roots, offered for watching.
    pub watch_offer: Option<Sender<PathBuf>>,
}

/// Outcome of the most recent injection on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Injected,
    Failed,
}

/// Point-in-time copy of the mutable per-client state the compile side needs.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub platform: String,
    pub arch: String,
    pub tmp_path: Option<PathBuf>,
    pub attached: bool,
    pub local_filesystem: bool,
}

struct ClientState {
    platform: String,
    arch: String,
    tmp_path: Option<PathBuf>,
    /// False for preview-host sandboxes, which must not receive modules.
    attached: bool,
    /// True when the client's sandbox is reachable through this filesystem.
    local_filesystem: bool,
    injection_number: u32,
    /// Exported symbol names per source path, from the previous injection.
    exports: FxHashMap<String, Vec<String>>,
    status: ConnectionStatus,
    project_root: Option<PathBuf>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            platform: DEFAULT_PLATFORM.to_string(),
            arch: default_arch().to_string(),
            tmp_path: None,
            attached: false,
            local_filesystem: false,
            injection_number: 0,
            exports: FxHashMap::default(),
            status: ConnectionStatus::Idle,
            project_root: None,
        }
    }
}

pub(crate) fn default_arch() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        "x86_64"
    }
}

/// Xcode preview hosts connect like ordinary clients but reload through
/// their own mechanism; pushing modules at them crashes the preview.
fn is_preview_sandbox(tmp_path: &str) -> bool {
    tmp_path.contains("/Xcode/UserData/Previews/")
}

/// One connected client process.
pub struct ClientHandle {
    id: u64,
    /// Shared with in-flight delivery tasks, which write outside any lock
    /// held by the serve loop.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    state: Mutex<ClientState>,
}

impl ClientHandle {
    pub fn new(id: u64, writer: impl Write + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            id,
            writer: Arc::new(Mutex::new(Box::new(writer))),
            state: Mutex::new(ClientState::default()),
        })
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests(id: u64) -> Arc<Self> {
        Self::new(id, io::sink())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().unwrap().attached
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        let state = self.state.lock().unwrap();
        ClientSnapshot {
            platform: state.platform.clone(),
            arch: state.arch.clone(),
            tmp_path: state.tmp_path.clone(),
            attached: state.attached,
            local_filesystem: state.local_filesystem,
        }
    }

    pub fn set_platform(&self, platform: String, arch: String) {
        let mut state = self.state.lock().unwrap();
        state.platform = platform;
        state.arch = arch;
    }

    pub fn set_tmp_path(&self, tmp_path: String) {
        let preview = is_preview_sandbox(&tmp_path);
        let mut state = self.state.lock().unwrap();
        state.local_filesystem = Path::new(&tmp_path).is_dir();
        state.attached = !preview;
        state.tmp_path = Some(PathBuf::from(tmp_path));
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().unwrap().status
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().unwrap().status = status;
    }

    pub fn project_root(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().project_root.clone()
    }

    pub fn set_project_root(&self, root: PathBuf) {
        self.state.lock().unwrap().project_root = Some(root);
    }

    /// Increments and returns the per-connection injection counter, used to
    /// give each patch module a fresh, never-reloaded name.
    pub fn next_injection_number(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.injection_number += 1;
        state.injection_number
    }

    pub fn exports_for(&self, source: &str) -> Option<Vec<String>> {
        self.state.lock().unwrap().exports.get(source).cloned()
    }

    pub fn set_exports(&self, source: String, symbols: Vec<String>) {
        self.state.lock().unwrap().exports.insert(source, symbols);
    }

    /// Writes a command frame on the delivery queue, blocking until it is on
    /// the wire. Returns false if the connection is no longer writable.
    pub fn send_command(
        &self,
        delivery: &SerialQueue,
        command: Command,
        payload: Option<&str>,
    ) -> bool {
        let writer = Arc::clone(&self.writer);
        let payload = payload.map(str::to_owned);
        let result: io::Result<()> = delivery.dispatch_sync(move || {
            let mut writer = writer.lock().unwrap();
            protocol::write_i32(&mut *writer, command.tag())?;
            if let Some(text) = payload {
                protocol::write_string(&mut *writer, &text)?;
            }
            writer.flush()
        });
        if let Err(err) = result {
            debug!(client = self.id, %err, "Dropping command, client unreachable");
            return false;
        }
        true
    }

    /// Forwards a log line to the client's console.
    pub fn send_log(&self, delivery: &SerialQueue, message: &str) {
        let line = format!("{LOG_PREFIX}{message}");
        self.send_command(delivery, Command::Log, Some(&line));
    }

    /// Asks the client to `dlopen` a module it can reach by path.
    pub fn send_load(&self, delivery: &SerialQueue, dylib_path: &str) -> bool {
        self.send_command(delivery, Command::Load, Some(dylib_path))
    }

    /// Ships module bytes to a client without filesystem access. The name
    /// and payload travel in one queue task so they cannot be split by a
    /// concurrent log message.
    pub fn send_inject(&self, delivery: &SerialQueue, dylib_name: &str, contents: Vec<u8>) -> bool {
        let writer = Arc::clone(&self.writer);
        let id = self.id;
        let name = dylib_name.to_owned();
        let result: io::Result<()> = delivery.dispatch_sync(move || {
            let mut writer = writer.lock().unwrap();
            protocol::write_i32(&mut *writer, Command::Inject.tag())?;
            protocol::write_string(&mut *writer, &name)?;
            protocol::write_bytes(&mut *writer, &contents)?;
            writer.flush()
        });
        if let Err(err) = result {
            debug!(client = id, %err, "Dropping module, client unreachable");
            return false;
        }
        true
    }

    pub fn send_metrics(&self, delivery: &SerialQueue, json: &str) -> bool {
        self.send_command(delivery, Command::Metrics, Some(json))
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("platform", &state.platform)
            .field("arch", &state.arch)
            .field("attached", &state.attached)
            .finish()
    }
}

/// Accepts client connections and runs one serve loop per connection.
pub struct ConnectionServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ConnectionServer {
    /// Binds `port` on the configured host and starts accepting. Pass port
    /// zero to let the OS choose; see [`ConnectionServer::local_addr`].
    pub fn start(ctx: ServerContext, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((ctx.config.bind_host.as_str(), port))?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name(format!("accept-{}", local_addr.port()))
            .spawn(move || accept_loop(ctx, listener, flag))?;
        info!(%local_addr, "Listening for clients");
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

impl Drop for ConnectionServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(ctx: ServerContext, listener: TcpListener, shutdown: Arc<AtomicBool>) {
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
        let spawned = thread::Builder::new()
            .name(format!("client-{id}"))
            .spawn(move || {
                if let Err(err) = serve_connection(&ctx, stream, id) {
                    warn!(client = id, %err, "Connection closed with error");
                }
            });
        if let Err(err) = spawned {
            error!(%err, "Failed to spawn client thread");
        }
    }
}

fn serve_connection(ctx: &ServerContext, stream: TcpStream, id: u64) -> protocol::Result<()> {
    stream.set_nodelay(true).ok();
    let peer = stream.peer_addr().ok();
    let writer = stream.try_clone().map_err(ProtocolError::Io)?;
    let mut reader = BufReader::new(stream);
    let client = ClientHandle::new(id, writer);

    // A client announces itself with its protocol version and a path under
    // the user's home directory, which proves it runs for the same user.
    let version = protocol::read_i32(&mut reader)?;
    let key = protocol::read_string(&mut reader)?;
    let home = ctx.config.home_dir.to_string_lossy();
    if version != protocol::INJECTION_VERSION || !key.starts_with(home.as_ref()) {
        client.send_command(&ctx.delivery, Command::Invalid, None);
        error!(client = id, version, key, "Connection did not validate.");
        return Ok(());
    }
    info!(client = id, peer = ?peer, "New connection");

    // Tell the client which developer tools the daemon compiles with, so it
    // can locate matching runtime support.
    client.send_command(
        &ctx.delivery,
        Command::XcodePath,
        Some(&ctx.config.xcode_path.display().to_string()),
    );

    ctx.registry.register(Arc::clone(&client));
    ctx.ui.set_state(InjectionState::Ready);
    let result = client_loop(ctx, &client, &mut reader);
    ctx.registry.unregister(id);
    if ctx.registry.is_empty() {
        ctx.ui.set_state(InjectionState::Idle);
    }
    info!(client = id, "Client disconnected");
    result
}

fn client_loop(
    ctx: &ServerContext,
    client: &Arc<ClientHandle>,
    reader: &mut impl Read,
) -> protocol::Result<()> {
    loop {
        let tag = match protocol::read_i32(reader) {
            Ok(tag) => tag,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(err) => return Err(ProtocolError::Io(err)),
        };
        let Ok(response) = Response::from_tag(tag) else {
            warn!(client = client.id(), tag, "Unknown response, closing");
            return Ok(());
        };
        match response {
            Response::Platform => {
                let platform = protocol::read_string(reader)?;
                let arch = protocol::read_string(reader)?;
                info!(client = client.id(), %platform, %arch, "Platform connected");
                client.set_platform(platform, arch);
            }
            Response::TmpPath => {
                let tmp_path = protocol::read_string(reader)?;
                debug!(client = client.id(), tmp_path, "Client sandbox");
                client.set_tmp_path(tmp_path);
            }
            Response::Injected => {
                client.set_status(ConnectionStatus::Injected);
                ctx.ui.set_state(InjectionState::Ok);
            }
            Response::Failed => {
                client.set_status(ConnectionStatus::Failed);
                ctx.ui.set_state(InjectionState::Error);
            }
            Response::Unhide => handle_unhide(ctx, client),
            Response::ProjectRoot => {
                let root = PathBuf::from(protocol::read_string(reader)?);
                info!(client = client.id(), root = %root.display(), "Client project root");
                client.set_project_root(root.clone());
                if let Some(offer) = &ctx.watch_offer {
                    if ctx.ui.offer_watch(&root) {
                        let _ = offer.send(root);
                    }
                }
            }
            Response::Exit => return Ok(()),
        }
    }
}

/// A module failed to `dlopen`, most often because a default-argument
/// symbol is still hidden. Re-patch anything patched before; failing that,
/// run a full scan if the build intermediates are known.
fn handle_unhide(ctx: &ServerContext, client: &Arc<ClientHandle>) {
    if ctx.unhider.reunhide() {
        return;
    }
    if ctx.unhider.has_intermediates() {
        ctx.unhider.start_scan();
        client.send_log(
            &ctx.delivery,
            "Unhiding default argument symbols, save the file again to retry.",
        );
    } else {
        client.send_log(
            &ctx.delivery,
            "Module failed to load. If this was due to a default argument, \
             build the project once with interception active so hidden \
             symbols can be located, then retry.",
        );
    }
}
