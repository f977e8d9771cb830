//! Default-argument symbol export.
//!
//! Swift emits "default argument generators" with private-external linkage:
//! a statically linked caller resolves them fine, but a freshly compiled
//! module loaded with `dlopen` cannot. When a patch fails to load for that
//! reason the object files under the project's build intermediates have to
//! be rewritten so those generators become ordinary global symbols, then the
//! app relinked. [`Unhider`] runs that rewrite on its own serial queue and
//! keeps a ledger of patched objects so incremental rebuilds can be
//! re-patched without walking the whole build directory again.

pub mod macho;

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::queue::SerialQueue;
use crate::server::ClientRegistry;

pub struct Unhider {
    inner: Arc<UnhiderInner>,
}

struct UnhiderInner {
    registry: Arc<ClientRegistry>,
    delivery: Arc<SerialQueue>,
    /// Scans and re-patches run here, one at a time.
    queue: SerialQueue,
    /// Last `-F .../PackageFrameworks` argument seen in a logged compile;
    /// anchor for locating the build intermediates.
    package_frameworks: Mutex<Option<PathBuf>>,
    /// Object files rewritten by a scan, with their modification time as of
    /// the rewrite. A later rebuild shows up as a changed mtime.
    patched: Mutex<FxHashMap<PathBuf, SystemTime>>,
}

impl Unhider {
    pub fn new(registry: Arc<ClientRegistry>, delivery: Arc<SerialQueue>) -> Self {
        Self {
            inner: Arc::new(UnhiderInner {
                registry,
                delivery,
                queue: SerialQueue::new("unhide"),
                package_frameworks: Mutex::new(None),
                patched: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Records the `PackageFrameworks` directory a compile was given.
    pub fn set_package_frameworks(&self, dir: PathBuf) {
        debug!(dir = %dir.display(), "Package frameworks directory");
        *self.inner.package_frameworks.lock().unwrap() = Some(dir);
    }

    /// The `Build/Intermediates.noindex` directory implied by the recorded
    /// `PackageFrameworks` path, five levels up from it.
    pub fn intermediates_dir(&self) -> Option<PathBuf> {
        self.inner.intermediates_dir()
    }

    pub fn has_intermediates(&self) -> bool {
        self.inner.package_frameworks.lock().unwrap().is_some()
    }

    /// Walks every object file under the build intermediates and exports
    /// hidden default-argument generators. Runs in the background; progress
    /// is reported to the current client.
    pub fn start_scan(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.dispatch(move || inner.scan());
    }

    /// Re-patches ledger entries whose object file changed since the last
    /// scan, which is enough after an incremental rebuild. Returns false
    /// when no scan has run yet.
    pub fn reunhide(&self) -> bool {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.dispatch_sync(move || inner.reunhide())
    }

    /// Forgets every patched object, so the next scan starts from scratch.
    pub fn reset(&self) {
        self.inner.patched.lock().unwrap().clear();
    }

    /// Blocks until previously queued scans have finished.
    #[cfg(test)]
    pub(crate) fn barrier(&self) {
        self.inner.queue.dispatch_sync(|| ());
    }
}

impl UnhiderInner {
    fn log(&self, msg: &str) {
        info!("{msg}");
        if let Some(client) = self.registry.current() {
            client.send_log(&self.delivery, msg);
        }
    }

    fn intermediates_dir(&self) -> Option<PathBuf> {
        let mut dir = self.package_frameworks.lock().unwrap().clone()?;
        for _ in 0..5 {
            dir.pop();
        }
        Some(dir.join("Build/Intermediates.noindex"))
    }

    fn scan(&self) {
        let Some(intermediates) = self.intermediates_dir() else {
            return;
        };
        self.log(&format!(
            "Starting \"unhide\" for {}",
            intermediates.display()
        ));
        let mut unhidden = FxHashSet::default();
        let mut files = 0;
        for entry in WalkDir::new(&intermediates)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(OsStr::to_str) != Some("o")
            {
                continue;
            }
            self.unhide_object(entry.path(), &mut unhidden);
            files += 1;
        }
        self.log(&format!(
            "Exported {} symbols in {files} files, restart app.",
            unhidden.len()
        ));
    }

    fn unhide_object(&self, path: &Path, unhidden: &mut FxHashSet<String>) {
        let mut contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(_) => {
                self.log(&format!("⚠️ Could not load {}", path.display()));
                return;
            }
        };
        let patched = match macho::unhide_default_arguments(&mut contents, unhidden) {
            Ok(patched) => patched,
            Err(_) => {
                self.log(&format!("⚠️ Could not load {}", path.display()));
                return;
            }
        };
        if patched == 0 {
            return;
        }
        if fs::write(path, &contents).is_err() {
            self.log(&format!("⚠️ Could not save {}", path.display()));
            return;
        }
        // Record the post-rewrite mtime; a rebuild resets the hidden flags
        // and moves the mtime, which is how reunhide finds stale entries.
        if let Ok(modified) = fs::metadata(path).and_then(|meta| meta.modified()) {
            self.patched.lock().unwrap().insert(path.to_path_buf(), modified);
        }
    }

    fn reunhide(&self) -> bool {
        let entries: Vec<(PathBuf, SystemTime)> = {
            let ledger = self.patched.lock().unwrap();
            if ledger.is_empty() {
                return false;
            }
            ledger.iter().map(|(path, at)| (path.clone(), *at)).collect()
        };
        let mut unhidden = FxHashSet::default();
        let mut files = 0;
        for (path, recorded) in entries {
            let Ok(modified) = fs::metadata(&path).and_then(|meta| meta.modified()) else {
                // The object was cleaned away; forget it.
                self.patched.lock().unwrap().remove(&path);
                continue;
            };
            if modified == recorded {
                continue;
            }
            self.unhide_object(&path, &mut unhidden);
            files += 1;
        }
        if files != 0 {
            self.log(&format!("Re-exported symbols in {files} files."));
        }
        true
    }
}
