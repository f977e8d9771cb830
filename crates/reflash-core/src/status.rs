//! Daemon state reporting.
//!
//! The daemon itself is headless. Anything that wants to surface state to a
//! person (a menu bar extra, an editor plugin, plain logs) implements
//! [`UiDelegate`] and gets told about connection and injection transitions.

use std::path::Path;
use tracing::info;

/// Coarse daemon state, in the order a session moves through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionState {
    /// No client connected.
    Idle,
    /// At least one client connected, nothing in flight.
    Ready,
    /// A recompile or link is in flight.
    Busy,
    /// The last module loaded successfully.
    Ok,
    /// The last injection failed.
    Error,
}

/// Hooks raised for an interactive front end.
pub trait UiDelegate: Send + Sync {
    fn set_state(&self, state: InjectionState);

    /// A client reported `root` as its project directory. Return true to
    /// start watching it for saves.
    fn offer_watch(&self, root: &Path) -> bool;
}

/// Headless delegate: transitions go to the log and watch offers follow a
/// single accept-or-ignore flag.
pub struct LogUi {
    auto_watch: bool,
}

impl LogUi {
    pub fn new(auto_watch: bool) -> Self {
        Self { auto_watch }
    }
}

impl UiDelegate for LogUi {
    fn set_state(&self, state: InjectionState) {
        info!(?state, "Injection state");
    }

    fn offer_watch(&self, root: &Path) -> bool {
        if self.auto_watch {
            info!(root = %root.display(), "Watching client project root");
        } else {
            info!(root = %root.display(), "Ignoring client project root, auto-watch is disabled");
        }
        self.auto_watch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_ui_follows_auto_watch_flag() {
        assert!(LogUi::new(true).offer_watch(Path::new("/projects/app")));
        assert!(!LogUi::new(false).offer_watch(Path::new("/projects/app")));
    }
}
