//! Capture of compiler arguments from a monitored IDE's diagnostic stream.
//!
//! With `SOURCEKIT_LOGGING=1` the IDE prints every semantic request it makes,
//! including the full compiler argument list for the file being edited. The
//! [`StreamParser`] is a line-driven state machine over that output; the
//! [`IdeMonitor`] owns the IDE child process and pumps its combined output
//! through a parser for the life of the process.

use crate::capture::args::repair_mistranscoded_path;
use crate::record::CompilationRecord;
use std::io::{BufRead, BufReader};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Request lines that precede an argument block.
const REQUEST_MARKERS: &[&str] = &[
    "  key.request: source.request.editor.open,",
    "  key.request: source.request.diagnostics,",
    "  key.request: source.request.activeregions,",
    "  key.request: source.request.relatedidents,",
];

/// Opening line of an argument block.
const ARGS_HEADER: &str = "  key.compilerargs: [";

/// Line announcing that the editor wrote a file out.
const SAVE_MARKER: &str = "  key.request: source.request.indexer.editor-did-save-file,";

/// Something the parser recognized in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A complete argument block, keyed by its primary file.
    Record {
        source: String,
        record: CompilationRecord,
        /// `-F` search path ending in `/PackageFrameworks`, when present.
        /// Locates the build's derived-data tree for the symbol patcher.
        package_frameworks: Option<String>,
    },
    /// The editor saved a file; injection should be attempted directly.
    FileSaved { path: String },
}

/// Accumulated state of the block currently being read.
#[derive(Debug, Default)]
struct Block {
    files: String,
    file_count: usize,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    package_frameworks: Option<String>,
}

enum State {
    /// Looking for a request marker or block header.
    Scanning,
    /// Saw a request marker; the block header must be the next line.
    ExpectArgsHeader,
    /// Reading quoted argument strings.
    InBlock(Block),
    /// Inside a block, discarding one value line (`-fsyntax-only` / `-o`).
    SkippingValue(Block),
    /// `-working-directory` without an inline value; next quoted string is it.
    ExpectWorkingDir(Block),
    /// Block closed; the primary file should appear within two lines.
    AwaitPrimary { block: Block, attempts_left: u8 },
    /// Saw the save marker; one bookkeeping line precedes the path.
    AwaitSavePath { line_skipped: bool },
}

/// Line-driven parser for the diagnostic stream.
pub struct StreamParser {
    state: State,
    /// Existence probe for captured paths, replaceable in tests.
    probe: Box<dyn Fn(&str) -> bool + Send>,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            state: State::Scanning,
            probe: Box::new(|path| Path::new(path).exists()),
        }
    }

    /// Replace the path-existence probe (tests run on fabricated paths).
    pub fn with_path_probe<F>(probe: F) -> Self
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        Self {
            state: State::Scanning,
            probe: Box::new(probe),
        }
    }

    /// Feed one line of stream output; at most one event per line.
    pub fn feed_line(&mut self, line: &str) -> Option<CaptureEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        match std::mem::replace(&mut self.state, State::Scanning) {
            State::Scanning => self.scan(line),
            State::ExpectArgsHeader => {
                if line == ARGS_HEADER {
                    self.state = State::InBlock(Block::default());
                    None
                } else {
                    // The marker was not followed by arguments; the line may
                    // itself start something new.
                    self.scan(line)
                }
            }
            State::InBlock(block) => match extract_quoted(line) {
                Some(arg) => {
                    self.consume_arg(block, arg);
                    None
                }
                None if block.args.is_empty() => {
                    // Argument-less block: skip silently.
                    None
                }
                None => {
                    self.state = State::AwaitPrimary { block, attempts_left: 2 };
                    None
                }
            },
            State::SkippingValue(block) => {
                self.state = State::InBlock(block);
                None
            }
            State::ExpectWorkingDir(mut block) => {
                if let Some(dir) = extract_quoted(line) {
                    block.working_dir = Some(PathBuf::from(dir));
                }
                self.state = State::InBlock(block);
                None
            }
            State::AwaitPrimary { block, attempts_left } => {
                if let Some(source) = extract_quoted(line) {
                    self.finish_block(block, source)
                } else if attempts_left > 1 {
                    self.state = State::AwaitPrimary { block, attempts_left: attempts_left - 1 };
                    None
                } else {
                    debug!("argument block had no primary file, dropped");
                    None
                }
            }
            State::AwaitSavePath { line_skipped: false } => {
                self.state = State::AwaitSavePath { line_skipped: true };
                None
            }
            State::AwaitSavePath { line_skipped: true } => {
                extract_quoted(line).map(|path| CaptureEvent::FileSaved {
                    path: self.repair_path(path),
                })
            }
        }
    }

    fn scan(&mut self, line: &str) -> Option<CaptureEvent> {
        if REQUEST_MARKERS.contains(&line) {
            self.state = State::ExpectArgsHeader;
        } else if line == ARGS_HEADER {
            self.state = State::InBlock(Block::default());
        } else if line == SAVE_MARKER {
            self.state = State::AwaitSavePath { line_skipped: false };
        }
        None
    }

    fn consume_arg(&mut self, mut block: Block, arg: String) {
        if arg.ends_with(".swift") {
            block.files.push_str(&arg);
            block.files.push('\n');
            block.file_count += 1;
            self.state = State::InBlock(block);
        } else if arg == "-fsyntax-only" || arg == "-o" {
            self.state = State::SkippingValue(block);
        } else if let Some(rest) = arg.strip_prefix("-working-directory") {
            match rest.strip_prefix('=') {
                Some(value) => {
                    block.working_dir = Some(PathBuf::from(value));
                    self.state = State::InBlock(block);
                }
                None if rest.is_empty() => self.state = State::ExpectWorkingDir(block),
                None => {
                    block.args.push(arg);
                    self.state = State::InBlock(block);
                }
            }
        } else if arg == "-Xfrontend" || arg == "-experimental-allow-module-with-compiler-errors" {
            // Driver-level wrappers that a direct front-end replay rejects.
            self.state = State::InBlock(block);
        } else if block.args.last().map(String::as_str) == Some("-F")
            && arg.ends_with("/PackageFrameworks")
        {
            // Noted in passing; the search path stays in the replay arguments.
            block.package_frameworks = Some(arg.clone());
            block.args.push(arg);
            self.state = State::InBlock(block);
        } else {
            block.args.push(arg);
            self.state = State::InBlock(block);
        }
    }

    fn finish_block(&mut self, block: Block, source: String) -> Option<CaptureEvent> {
        let source = self.repair_path(source);
        debug!(
            args = block.args.len(),
            files = block.file_count,
            source = %source,
            "captured argument block"
        );
        let record = CompilationRecord::new(
            block.args,
            block.files,
            block.working_dir.unwrap_or_else(|| PathBuf::from("/tmp")),
        );
        Some(CaptureEvent::Record {
            source,
            record,
            package_frameworks: block.package_frameworks,
        })
    }

    /// Paths arrive through a logging layer that occasionally mangles
    /// non-ASCII; accept a repaired path only if it exists where the
    /// reported one does not.
    fn repair_path(&self, path: String) -> String {
        if (self.probe)(&path) {
            return path;
        }
        if let Some(fixed) = repair_mistranscoded_path(&path) {
            if (self.probe)(&fixed) {
                debug!(from = %path, to = %fixed, "repaired mis-transcoded path");
                return fixed;
            }
        }
        path
    }
}

/// The text between the first and last double quote on the line, with
/// escaped quotes unescaped. `None` when the line holds no quoted string.
fn extract_quoted(line: &str) -> Option<String> {
    let start = line.find('"')?;
    let end = line.rfind('"')?;
    if end <= start {
        return None;
    }
    let raw = &line[start + 1..end];
    Some(if raw.contains("\\\"") {
        raw.replace("\\\"", "\"")
    } else {
        raw.to_string()
    })
}

/// Handle to the monitored IDE process and its reader thread.
pub struct IdeMonitor {
    child: Arc<Mutex<Option<Child>>>,
    reader: Option<JoinHandle<()>>,
}

impl IdeMonitor {
    /// Launch `command` with diagnostic logging enabled and parse its
    /// combined output until EOF. Events go to `sink`; when `auto_relaunch`
    /// is set the process is started again after it exits.
    pub fn launch<F>(command: &Path, auto_relaunch: bool, sink: F) -> std::io::Result<Self>
    where
        F: Fn(CaptureEvent) + Send + 'static,
    {
        let child = Arc::new(Mutex::new(None));
        let child_slot = Arc::clone(&child);
        let command = command.to_path_buf();

        let reader = std::thread::spawn(move || loop {
            let spawned = spawn_with_logging(&command);
            let mut spawned = match spawned {
                Ok(child) => child,
                Err(err) => {
                    error!(command = %command.display(), "could not launch IDE: {err}");
                    return;
                }
            };
            // stdout was piped by spawn_with_logging
            let stdout = match spawned.stdout.take() {
                Some(stdout) => stdout,
                None => return,
            };
            info!(command = %command.display(), "monitoring IDE output");
            *child_slot.lock().unwrap() = Some(spawned);

            let mut parser = StreamParser::new();
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                // One bad line must not end the capture session.
                let outcome = catch_unwind(AssertUnwindSafe(|| parser.feed_line(&line)));
                match outcome {
                    Ok(Some(event)) => sink(event),
                    Ok(None) => {}
                    Err(_) => {
                        warn!("stream parse error, resynchronizing");
                        parser = StreamParser::new();
                    }
                }
            }

            let finished = child_slot.lock().unwrap().take();
            if let Some(mut finished) = finished {
                let _ = finished.wait();
            }
            if !auto_relaunch {
                info!("IDE exited, capture stream closed");
                return;
            }
            info!("IDE exited, relaunching");
        });

        Ok(Self { child, reader: Some(reader) })
    }

    /// Kill the monitored process and wait for the reader to finish.
    pub fn stop(mut self) {
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Spawn the IDE with `SOURCEKIT_LOGGING=1`, stderr folded into stdout.
fn spawn_with_logging(command: &Path) -> std::io::Result<Child> {
    Command::new("/bin/sh")
        .arg("-c")
        .arg(format!(
            "SOURCEKIT_LOGGING=1 exec \"{}\" 2>&1",
            command.display()
        ))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
}
