pub mod cache;
pub mod capture;
pub mod config;
pub mod engine;
pub mod ignore;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod server;
pub mod status;
pub mod unhide;
pub mod watch;

pub use cache::{CacheError, CompilationCache};
pub use config::DaemonConfig;
pub use engine::{Engine, EngineHandle, EngineStatus};
pub use ignore::IgnoreFilter;
pub use pipeline::{InjectionOutcome, PipelineError};
pub use queue::SerialQueue;
pub use record::CompilationRecord;
pub use server::{ClientRegistry, ConnectionServer, ServerContext};
pub use status::{InjectionState, LogUi, UiDelegate};
pub use unhide::Unhider;
pub use watch::DirectoryWatcher;

/// Name the daemon announces itself under in forwarded log lines.
pub const APP_NAME: &str = "reflash";

/// Prefix for log lines forwarded to attached client processes.
pub const LOG_PREFIX: &str = "🔥 ";

/// File-name prefix of generated dynamic modules. The in-process loader keys
/// off this prefix to tell injection modules apart from ordinary images.
pub const DYLIB_PREFIX: &str = "eval_injection_";

/// Platform assumed for clients that have not yet reported one.
pub const DEFAULT_PLATFORM: &str = "iPhoneSimulator";
