//! Compiler-invocation capture front ends.
//!
//! Two independent sources feed the compilation caches: a line parse of the
//! monitored IDE's diagnostic stream (`stream`) and interception of the
//! compiler front end itself (`intercept`). Both funnel into the same
//! argument post-processing in `args`.

pub mod args;
pub mod intercept;
pub mod stream;

pub use args::ExtractedInvocation;
pub use intercept::{InterceptContext, InterceptServer};
pub use stream::{CaptureEvent, IdeMonitor, StreamParser};
