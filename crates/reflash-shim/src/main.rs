//! Stand-in for the toolchain's `swift-frontend`.
//!
//! Interception moves the real front end aside as `swift-frontend.save`
//! and links this binary in its place. Each invocation is relayed to the
//! daemon's commands port, then control transfers to the real front end
//! with the original arguments. The relay is strictly best effort: a
//! missing or unresponsive daemon must never affect the build.

use std::env;
use std::io::{self, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use reflash_core::server::protocol::{self, ARGUMENTS_END, COMMANDS_PORT, INTERCEPT_VERSION};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let frontend = original_frontend();

    // The driver prefixes every front-end invocation with `-frontend`;
    // anything else is the binary being probed directly.
    if args.first().map(String::as_str) == Some("-frontend") {
        let _ = relay(&frontend, &args);
    }

    let err = Command::new(&frontend).args(&args).exec();
    eprintln!(
        "reflash-frontend: could not run {}: {err}",
        frontend.display()
    );
    std::process::exit(1);
}

/// The front end this shim displaced.
fn original_frontend() -> PathBuf {
    if let Some(path) = env::var_os("REFLASH_ORIGINAL_FRONTEND") {
        return PathBuf::from(path);
    }
    // argv[0] rather than current_exe: the shim is reached through a link
    // in the toolchain, and the saved front end sits next to the link, not
    // next to this binary.
    let invoked = env::args_os().next().map(PathBuf::from);
    let invoked = match invoked {
        Some(path) if path.parent().is_some_and(|dir| !dir.as_os_str().is_empty()) => path,
        _ => env::current_exe().unwrap_or_else(|_| PathBuf::from("swift-frontend")),
    };
    invoked.with_file_name("swift-frontend.save")
}

/// Sends the whole invocation to the daemon. Any failure is the caller's
/// to ignore.
fn relay(frontend: &Path, args: &[String]) -> io::Result<()> {
    let host = env::var("REFLASH_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env::var("REFLASH_PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(COMMANDS_PORT);
    let address = (host.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "daemon address"))?;
    let stream = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)?;
    stream.set_write_timeout(Some(Duration::from_secs(2)))?;

    let mut writer = BufWriter::new(stream);
    protocol::write_string(&mut writer, INTERCEPT_VERSION)?;
    protocol::write_string(&mut writer, &project_root().to_string_lossy())?;
    protocol::write_string(&mut writer, &frontend.to_string_lossy())?;
    for arg in args {
        protocol::write_string(&mut writer, arg)?;
    }
    protocol::write_string(&mut writer, ARGUMENTS_END)?;
    writer.flush()
}

/// Root directory reported with the invocation, so the daemon can offer it
/// for watching.
fn project_root() -> PathBuf {
    if let Some(root) = env::var_os("REFLASH_PROJECT_ROOT") {
        return PathBuf::from(root);
    }
    // Set by build-tool plugin sandboxes; the compiler's working directory
    // is the package root otherwise.
    if let Some(root) = env::var_os("BUILD_WORKSPACE_DIRECTORY") {
        return PathBuf::from(root);
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}
