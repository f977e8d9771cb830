//! Filesystem fallback for editors that expose no compiler stream.
//!
//! A watched project root turns saves into injection requests: events pass
//! the ignore rules and a source-extension filter, join a pending queue and
//! are handed to the engine one at a time. A version-control interlock
//! guards against branch switches — `.git/index.lock` activity followed by
//! source changes means a merge or checkout is rewriting the tree, and
//! injecting against a half-switched tree would load stale code into the
//! app. Once locked, watching stays suspended until it is explicitly
//! relaunched.

pub mod buildlog;

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ignore::IgnoreStack;

pub type Result<T> = std::result::Result<T, WatchError>;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Extensions whose saves can trigger an injection.
const SOURCE_EXTENSIONS: &[&str] = &["swift", "m", "mm", "h", "c", "cpp", "cc"];

/// Editors produce clusters of events per save; repeats for one path inside
/// this window collapse into a single dispatch.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Called with each accepted save. Dispatch is serial: the next save waits
/// until the handler returns.
pub type ChangeHandler = Box<dyn FnMut(PathBuf) + Send + 'static>;

/// One watched project root.
pub struct DirectoryWatcher {
    root: PathBuf,
    shared: Arc<WatchShared>,
    drain: Option<thread::JoinHandle<()>>,
    /// Dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
}

struct WatchShared {
    state: Mutex<WatchState>,
    wake: Condvar,
}

/// Mutable watch state, updated from the notify callback thread.
struct WatchState {
    ignores: IgnoreStack,
    git_dir: Option<PathBuf>,
    /// A version-control lock file was touched; the next source event
    /// decides whether a branch switch is in progress.
    lock_seen: bool,
    /// Everything is dropped while set; cleared only by
    /// [`DirectoryWatcher::relaunch`].
    is_locked: bool,
    pending: VecDeque<PathBuf>,
    recent: FxHashMap<PathBuf, Instant>,
    shutdown: bool,
}

impl DirectoryWatcher {
    /// Watches `root` recursively and feeds accepted saves to `handler` on
    /// a dedicated thread.
    pub fn start(root: &Path, handler: ChangeHandler) -> Result<Self> {
        let root = root.canonicalize()?;
        let shared = Arc::new(WatchShared {
            state: Mutex::new(WatchState {
                ignores: IgnoreStack::discover(&root),
                git_dir: resolve_git_dir(&root),
                lock_seen: false,
                is_locked: false,
                pending: VecDeque::new(),
                recent: FxHashMap::default(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let events = Arc::clone(&shared);
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            if let Ok(event) = result {
                handle_event(&events, event);
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let queue = Arc::clone(&shared);
        let drain = thread::Builder::new()
            .name("watch-drain".to_string())
            .spawn(move || drain_loop(queue, handler))?;

        info!(root = %root.display(), "Watching for saves");
        Ok(Self {
            root,
            shared,
            drain: Some(drain),
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_locked(&self) -> bool {
        self.shared.state.lock().unwrap().is_locked
    }

    /// Clears the lock interlock and queued saves and re-reads the ignore
    /// files. The only way out of the locked state.
    pub fn relaunch(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.ignores = IgnoreStack::discover(&self.root);
            state.git_dir = resolve_git_dir(&self.root);
            state.lock_seen = false;
            state.is_locked = false;
            state.pending.clear();
            state.recent.clear();
        }
        self.shared.wake.notify_all();
        info!(root = %self.root.display(), "File watching relaunched");
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(drain) = self.drain.take() {
            let _ = drain.join();
        }
    }
}

fn handle_event(shared: &WatchShared, event: Event) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    let mut state = shared.state.lock().unwrap();
    let mut accepted = false;
    for path in event.paths {
        accepted |= state.consider(path);
    }
    if accepted {
        shared.wake.notify_one();
    }
}

impl WatchState {
    /// Returns true when `path` was queued for dispatch.
    fn consider(&mut self, path: PathBuf) -> bool {
        if let Some(git_dir) = &self.git_dir {
            if path.starts_with(git_dir) {
                if !self.lock_seen && path.file_name() == Some(OsStr::new("index.lock")) {
                    debug!(path = %path.display(), "Version control lock observed");
                    self.lock_seen = true;
                }
                return false;
            }
        }
        if self.is_locked {
            debug!(path = %path.display(), "Dropping save, repository is locked");
            return false;
        }
        let is_dir = path.is_dir();
        if self.ignores.should_ignore(&path, is_dir) || is_dir || !is_source(&path) {
            return false;
        }
        if self.lock_seen {
            // A lock followed by source changes is a branch switch or a
            // merge rewriting the tree, not an editor save.
            self.is_locked = true;
            self.pending.clear();
            warn!(
                path = %path.display(),
                "Version control operation detected, file watching suspended until relaunch"
            );
            return false;
        }
        let now = Instant::now();
        if let Some(last) = self.recent.get(&path) {
            if now.duration_since(*last) < DEBOUNCE {
                return false;
            }
        }
        self.recent.insert(path.clone(), now);
        self.pending.push_back(path);
        true
    }
}

fn drain_loop(shared: Arc<WatchShared>, mut handler: ChangeHandler) {
    loop {
        let next = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    return;
                }
                if !state.is_locked {
                    if let Some(path) = state.pending.pop_front() {
                        break path;
                    }
                }
                state = shared.wake.wait(state).unwrap();
            }
        };
        // The lock is not held while the handler runs a compile.
        handler(next);
    }
}

/// The repository metadata directory for `root`: `.git` itself, or for a
/// worktree the directory its `.git` pointer file names.
fn resolve_git_dir(root: &Path) -> Option<PathBuf> {
    let dotgit = root.join(".git");
    let meta = fs::metadata(&dotgit).ok()?;
    if meta.is_dir() {
        return Some(dotgit);
    }
    let pointer = fs::read_to_string(&dotgit).ok()?;
    let target = Path::new(pointer.strip_prefix("gitdir:")?.trim());
    let resolved = if target.is_absolute() {
        target.to_path_buf()
    } else {
        root.join(target)
    };
    Some(resolved.canonicalize().unwrap_or(resolved))
}

fn is_source(path: &Path) -> bool {
    path.extension().and_then(OsStr::to_str).is_some_and(|ext| {
        let ext = ext.to_ascii_lowercase();
        SOURCE_EXTENSIONS.contains(&ext.as_str())
    })
}
