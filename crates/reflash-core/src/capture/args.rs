//! Post-processing of captured compiler arguments.
//!
//! Raw front-end invocations carry a lot of per-build bookkeeping (dependency
//! files, index stores, diagnostics serialization) that must not be replayed
//! when a single file is recompiled: the paths would collide with the running
//! build or point into output maps that no longer exist. The helpers here
//! classify those arguments; [`extract_intercepted`] applies them to a full
//! relayed invocation.

use crate::record::CompilationRecord;
use crate::DEFAULT_PLATFORM;
use std::io;
use std::path::PathBuf;

/// Flags whose following value is an output or bookkeeping path. Both the
/// flag and its value are dropped. Each also occurs with a `-path` suffix.
const DROPPED_WITH_VALUE: &[&str] = &[
    "-pch-output-dir",
    "-supplementary-output-file-map",
    "-emit-dependencies",
    "-emit-reference-dependencies",
    "-serialize-diagnostics",
    "-index-store",
    "-index-unit-output",
];

/// Flags dropped on their own.
const DROPPED_FLAGS: &[&str] = &["-validate-clang-modules-once", "-frontend-parseable-output"];

/// Whether `arg` is dropped together with its following value.
pub fn drops_value(arg: &str) -> bool {
    let base = arg.strip_suffix("-path").unwrap_or(arg);
    DROPPED_WITH_VALUE.contains(&base) || arg == "-clang-build-session-file"
}

/// Whether `arg` is dropped on its own.
pub fn drops_flag(arg: &str) -> bool {
    DROPPED_FLAGS.contains(&arg)
}

/// Target platform recovered from an SDK path argument such as
/// `.../iPhoneSimulator17.4.sdk`. Requires a version number; an unversioned
/// SDK name gives no hint.
pub fn platform_from_sdk_path(arg: &str) -> Option<String> {
    let stem = arg.strip_suffix(".sdk")?;
    let name = &stem[stem.rfind('/')? + 1..];
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
    if trimmed.is_empty() || trimmed.len() == name.len() {
        return None;
    }
    if !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some(trimmed.to_string())
}

/// Undo a common mis-transcoding of non-ASCII paths: UTF-8 bytes read back
/// as Latin-1 produce a string whose chars are all <= U+00FF. Reinterpreting
/// those code points as bytes recovers the original UTF-8. Returns `None`
/// when the string cannot have been mangled that way; callers must still
/// check the repaired path actually exists before trusting it.
pub fn repair_mistranscoded_path(path: &str) -> Option<String> {
    if path.is_ascii() {
        return None;
    }
    let bytes: Option<Vec<u8>> = path
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect();
    let fixed = String::from_utf8(bytes?).ok()?;
    if fixed == path {
        return None;
    }
    Some(fixed)
}

/// One relayed front-end invocation reduced to its replayable core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedInvocation {
    /// Replayable arguments, starting with `-frontend`.
    pub arguments: Vec<String>,
    /// Newline-joined members of the compilation unit.
    pub member_files: String,
    /// Sources this invocation was the primary compile for.
    pub primary_files: Vec<String>,
    /// Platform recovered from the SDK argument.
    pub platform: String,
    pub working_dir: PathBuf,
}

impl ExtractedInvocation {
    /// The cacheable record shared by all primary files of this invocation.
    pub fn to_record(&self) -> CompilationRecord {
        CompilationRecord::new(
            self.arguments.clone(),
            self.member_files.clone(),
            self.working_dir.clone(),
        )
    }
}

/// Reduce a relayed front-end argument list to a replayable invocation.
///
/// `read_filelist` resolves `-filelist` arguments to their contents (the
/// file exists only for the duration of the build). Returns `Ok(None)` for
/// invocations that are not per-file compiles (module emission).
pub fn extract_intercepted<F>(
    raw: &[String],
    mut read_filelist: F,
) -> io::Result<Option<ExtractedInvocation>>
where
    F: FnMut(&str) -> io::Result<String>,
{
    let mut out = ExtractedInvocation {
        // Replay goes through the real front end, which expects `-frontend`
        // as its first argument.
        arguments: vec!["-frontend".to_string()],
        member_files: String::new(),
        primary_files: Vec::new(),
        platform: DEFAULT_PLATFORM.to_string(),
        working_dir: PathBuf::from("/tmp"),
    };

    let mut i = 0;
    while i < raw.len() {
        let arg = &raw[i];
        i += 1;
        match arg.as_str() {
            // Already seeded above; the relay may still include it.
            "-frontend" => {}
            "-filelist" => {
                let Some(path) = raw.get(i) else { break };
                i += 1;
                out.member_files.push_str(&read_filelist(path)?);
            }
            "-primary-file" => {
                let Some(source) = raw.get(i) else { break };
                i += 1;
                out.primary_files.push(source.clone());
                if !out.member_files.contains(source.as_str()) {
                    out.member_files.push_str(source);
                    out.member_files.push('\n');
                }
            }
            // Module emission is not a per-file compile.
            "-emit-module" => return Ok(None),
            "-o" => i += 1,
            // Stat-cache runs are per-build: drop the whole
            // `-Xcc -ivfsstatcache -Xcc <path>` run.
            "-Xcc" if raw.get(i).map(String::as_str) == Some("-ivfsstatcache") => i += 3,
            _ => {
                if let Some(platform) = platform_from_sdk_path(arg) {
                    out.platform = platform;
                }
                if arg.ends_with(".swift") {
                    out.member_files.push_str(arg);
                    out.member_files.push('\n');
                } else if drops_value(arg) {
                    i += 1;
                } else if !drops_flag(arg) {
                    out.arguments.push(arg.clone());
                }
            }
        }
    }
    Ok(Some(out))
}
