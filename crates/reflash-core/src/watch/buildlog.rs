//! Compile-command recovery from build logs.
//!
//! When a save arrives for a source nobody intercepted — interception was
//! never applied, or the daemon started after the last build — the IDE's
//! most recent activity log usually still contains the full compiler
//! invocation for that file. The log is a gzip-compressed transcript whose
//! entries are separated by carriage returns; scanning it backwards finds
//! the latest compile naming the saved file, which is then reduced to a
//! replayable [`CompilationRecord`] the same way a live interception
//! would be.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::debug;

use crate::capture::args::extract_intercepted;
use crate::record::CompilationRecord;

pub type Result<T> = std::result::Result<T, BuildLogError>;

#[derive(Debug, Error)]
pub enum BuildLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No build logs under {}", .0.display())]
    NoLogs(PathBuf),

    #[error("No compile entry for the saved file in {}", .0.display())]
    NoEntry(PathBuf),
}

/// The most recently written `.xcactivitylog` under `logs_dir`.
pub fn latest_build_log(logs_dir: &Path) -> Result<PathBuf> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(logs_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(OsStr::to_str) != Some("xcactivitylog") {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().map_or(true, |(when, _)| modified > *when) {
            newest = Some((modified, path));
        }
    }
    newest
        .map(|(_, path)| path)
        .ok_or_else(|| BuildLogError::NoLogs(logs_dir.to_path_buf()))
}

/// Recovers the latest logged compile of `source` as a replayable record.
///
/// The log no longer exists by the time it is replayed against, so
/// transient build artifacts it mentions (filelists in particular) may be
/// gone; those resolve to empty rather than failing the recovery.
pub fn record_for_source(
    logs_dir: &Path,
    source: &str,
    working_dir: &Path,
) -> Result<CompilationRecord> {
    let log = latest_build_log(logs_dir)?;
    let text = decompress(&log)?;
    let is_swift = source.ends_with(".swift");
    let needles = entry_needles(source, is_swift);

    // Entries are appended in build order; the last match is the freshest.
    for entry in text.split('\r').rev() {
        if !needles.iter().any(|needle| entry.contains(needle.as_str())) {
            continue;
        }
        let tokens = split_command(entry);
        let Some(at) = tokens.iter().position(|token| is_compiler_token(token)) else {
            continue;
        };
        let parsed = extract_intercepted(&tokens[at + 1..], |filelist| {
            match fs::read_to_string(filelist) {
                Ok(contents) => Ok(contents),
                Err(err) => {
                    debug!(filelist, "Logged filelist is gone: {err}");
                    Ok(String::new())
                }
            }
        })?;
        let Some(mut invocation) = parsed else { continue };
        invocation.working_dir = working_dir.to_path_buf();
        let mut record = invocation.to_record();
        if !is_swift {
            // The replay appends `-c` and the source itself.
            record
                .arguments
                .retain(|arg| arg != "-frontend" && arg != "-c" && arg != source);
        }
        return Ok(record);
    }
    Err(BuildLogError::NoEntry(log))
}

fn decompress(log: &Path) -> Result<String> {
    let mut bytes = Vec::new();
    GzDecoder::new(File::open(log)?).read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Forms the saved file takes inside a logged command line: shell-escaped
/// spaces or a double-quoted path.
fn entry_needles(source: &str, is_swift: bool) -> [String; 2] {
    let flag = if is_swift { "-primary-file" } else { "-c" };
    let escaped = source.replace(' ', "\\ ");
    [
        format!("{flag} {escaped}"),
        format!("{flag} \"{source}\""),
    ]
}

fn is_compiler_token(token: &str) -> bool {
    let name = token.rsplit('/').next().unwrap_or(token);
    matches!(name, "swift-frontend" | "swiftc" | "swift" | "clang" | "clang++")
}

/// Splits a logged command line into tokens, honoring double and single
/// quotes and backslash escapes outside single quotes.
pub(crate) fn split_command(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else if c == '\\' && q == '"' {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                } else {
                    current.push(c);
                }
            }
            None => match c {
                ' ' | '\t' => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                    in_token = true;
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_log(path: &Path, entries: &[&str]) {
        let file = File::create(path).unwrap();
        let mut gz = GzEncoder::new(file, Compression::default());
        gz.write_all(entries.join("\r").as_bytes()).unwrap();
        gz.finish().unwrap();
    }

    #[test]
    fn test_split_command_honors_quotes_and_escapes() {
        assert_eq!(
            split_command(r#"swiftc -c "a b.swift" c\ d.swift 'e f'"#),
            vec!["swiftc", "-c", "a b.swift", "c d.swift", "e f"]
        );
        assert_eq!(split_command("  spaced \t out  "), vec!["spaced", "out"]);
        assert_eq!(split_command(r#"-DNAME=\"App\""#), vec![r#"-DNAME="App""#]);
        assert!(split_command("").is_empty());
    }

    #[test]
    fn test_latest_build_log_prefers_newest() {
        let dir = TempDir::new().unwrap();
        write_log(&dir.path().join("older.xcactivitylog"), &["first"]);
        thread::sleep(Duration::from_millis(25));
        write_log(&dir.path().join("newer.xcactivitylog"), &["second"]);
        fs::write(dir.path().join("report.txt"), "not a log").unwrap();

        let latest = latest_build_log(dir.path()).unwrap();
        assert_eq!(latest, dir.path().join("newer.xcactivitylog"));
    }

    #[test]
    fn test_no_logs_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("report.txt"), "not a log").unwrap();
        let err = latest_build_log(dir.path()).unwrap_err();
        assert!(matches!(err, BuildLogError::NoLogs(_)));
    }

    #[test]
    fn test_record_recovered_from_last_matching_entry() {
        let dir = TempDir::new().unwrap();
        write_log(
            &dir.path().join("build.xcactivitylog"),
            &[
                "Build description signature: abc123",
                "    /tc/usr/bin/swift-frontend -frontend -c /app/A.swift \
                 -primary-file /app/B.swift -module-name App -o /build/B.o",
                "    /tc/usr/bin/swift-frontend -frontend -c /app/A.swift \
                 -primary-file /app/B.swift -module-name AppV2 -o /build/B2.o",
            ],
        );

        let record = record_for_source(dir.path(), "/app/B.swift", Path::new("/work")).unwrap();
        // Two builds compiled B.swift; the later one wins.
        assert!(record.arguments.contains(&"AppV2".to_string()));
        assert!(!record.arguments.contains(&"App".to_string()));
        assert_eq!(record.arguments[0], "-frontend");
        assert_eq!(record.member_files, "/app/A.swift\n/app/B.swift\n");
        assert_eq!(record.working_dir, Path::new("/work"));
    }

    #[test]
    fn test_quoted_source_path_is_found() {
        let dir = TempDir::new().unwrap();
        write_log(
            &dir.path().join("build.xcactivitylog"),
            &[
                "    /tc/usr/bin/swift-frontend -frontend -c \
                 -primary-file \"/app/has space.swift\" -module-name App -o /build/h.o",
            ],
        );

        let record =
            record_for_source(dir.path(), "/app/has space.swift", Path::new("/work")).unwrap();
        assert!(record.member_files.contains("/app/has space.swift"));
    }

    #[test]
    fn test_c_family_record_strips_replayed_arguments() {
        let dir = TempDir::new().unwrap();
        write_log(
            &dir.path().join("build.xcactivitylog"),
            &[
                "    /tc/usr/bin/clang -x objective-c -arch arm64 \
                 -isysroot /sdks/iPhoneSimulator17.4.sdk -c /app/View.m -o /build/View.o",
            ],
        );

        let record = record_for_source(dir.path(), "/app/View.m", Path::new("/work")).unwrap();
        // `-c` and the source are appended again at replay time.
        assert_eq!(
            record.arguments,
            vec![
                "-x",
                "objective-c",
                "-arch",
                "arm64",
                "-isysroot",
                "/sdks/iPhoneSimulator17.4.sdk"
            ]
        );
    }

    #[test]
    fn test_missing_entry_is_reported() {
        let dir = TempDir::new().unwrap();
        write_log(
            &dir.path().join("build.xcactivitylog"),
            &["    /tc/usr/bin/swift-frontend -frontend -c -primary-file /app/Other.swift"],
        );
        let err = record_for_source(dir.path(), "/app/B.swift", Path::new("/work")).unwrap_err();
        assert!(matches!(err, BuildLogError::NoEntry(_)));
    }
}
