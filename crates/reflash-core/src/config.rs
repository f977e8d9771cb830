//! Daemon configuration and developer-tool path derivation.

use std::fs;
use std::path::{Path, PathBuf};

use crate::server::protocol::{COMMANDS_PORT, INJECTION_PORT};

/// Linker flags adding test-runner support libraries to a patch module.
pub const DEVICE_LIBRARIES: &str = "-framework XCTest -lXCTestSwiftSupport";

/// Everything tunable about a daemon run. Built once at startup and shared
/// immutably; anything that changes per client or per recompile lives with
/// the connection or the compile record instead.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Developer tools to compile and link with, e.g. `/Applications/Xcode.app`.
    pub xcode_path: PathBuf,
    /// Code-signing identity for patches loaded on a physical device. The
    /// ad-hoc identity `-` is used everywhere else.
    pub signing_identity: Option<String>,
    /// Extra linker flags when [`DaemonConfig::testing_support`] is set.
    pub device_libraries: String,
    /// Link test-runner support libraries into every patch.
    pub testing_support: bool,
    /// Restart the monitored IDE process when it exits.
    pub auto_relaunch: bool,
    /// Where per-platform command snapshots persist across runs.
    pub cache_dir: PathBuf,
    /// Scratch directory for filelists, objects and patch modules.
    pub tmp_base: PathBuf,
    /// Override for the IDE build-log directory searched when a file was
    /// never opened in the editor.
    pub derived_logs_dir: Option<PathBuf>,
    /// Directory of support frameworks patches may link against.
    pub support_frameworks_dir: Option<PathBuf>,
    pub bind_host: String,
    /// Port instrumented apps connect to.
    pub client_port: u16,
    /// Port the compiler shim reports intercepted invocations to.
    pub intercept_port: u16,
    /// Clients must identify with a path under this directory.
    pub home_dir: PathBuf,
    /// Tool overrides, primarily so tests can substitute scripted stand-ins.
    pub compiler_override: Option<PathBuf>,
    pub linker_override: Option<PathBuf>,
    pub codesign_override: Option<PathBuf>,
}

impl DaemonConfig {
    /// Standard locations derived from the environment.
    pub fn from_env() -> Self {
        let home_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        let tmp_base = std::env::temp_dir();
        Self {
            xcode_path: PathBuf::from("/Applications/Xcode.app"),
            signing_identity: None,
            device_libraries: DEVICE_LIBRARIES.to_string(),
            testing_support: false,
            auto_relaunch: false,
            cache_dir: tmp_base.clone(),
            tmp_base,
            derived_logs_dir: None,
            support_frameworks_dir: None,
            // Devices connect over the local network, so listen on all
            // interfaces by default.
            bind_host: "0.0.0.0".to_string(),
            client_port: INJECTION_PORT,
            intercept_port: COMMANDS_PORT,
            home_dir,
            compiler_override: None,
            linker_override: None,
            codesign_override: None,
        }
    }

    /// Compact configuration rooted under `base`, with OS-assigned ports.
    /// Used by tests.
    pub fn for_tests(base: &Path) -> Self {
        let cache_dir = base.join("cache");
        let tmp_base = base.join("tmp");
        let _ = fs::create_dir_all(&cache_dir);
        let _ = fs::create_dir_all(&tmp_base);
        Self {
            xcode_path: base.join("Xcode.app"),
            signing_identity: None,
            device_libraries: DEVICE_LIBRARIES.to_string(),
            testing_support: false,
            auto_relaunch: false,
            cache_dir,
            tmp_base,
            derived_logs_dir: None,
            support_frameworks_dir: None,
            bind_host: "127.0.0.1".to_string(),
            client_port: 0,
            intercept_port: 0,
            home_dir: base.to_path_buf(),
            compiler_override: None,
            linker_override: None,
            codesign_override: None,
        }
    }

    pub fn developer_dir(&self) -> PathBuf {
        self.xcode_path.join("Contents/Developer")
    }

    pub fn toolchain_dir(&self) -> PathBuf {
        self.developer_dir()
            .join("Toolchains/XcodeDefault.xctoolchain")
    }

    pub fn platform_dev_dir(&self, platform: &str) -> PathBuf {
        self.developer_dir()
            .join(format!("Platforms/{platform}.platform/Developer"))
    }

    /// Compiler plugins ship in the device platform directory even for
    /// simulator builds.
    pub fn platform_usr_dir(&self, platform: &str) -> PathBuf {
        let device = platform.replace("Simulator", "OS");
        self.platform_dev_dir(&device).join("usr")
    }

    /// Where built products are staged for linking test patches.
    pub fn products_dir(&self) -> PathBuf {
        self.tmp_base.join(format!("{}.products", crate::APP_NAME))
    }

    pub fn sdk_path(&self, platform: &str) -> PathBuf {
        self.platform_dev_dir(platform)
            .join(format!("SDKs/{platform}.sdk"))
    }

    /// The Swift frontend used to replay compilations of Swift sources.
    pub fn swift_frontend_path(&self) -> PathBuf {
        match &self.compiler_override {
            Some(path) => path.clone(),
            None => self.toolchain_dir().join("usr/bin/swift-frontend"),
        }
    }

    /// The clang used both to compile C-family sources and to link patches.
    pub fn clang_path(&self) -> PathBuf {
        match &self.linker_override {
            Some(path) => path.clone(),
            None => self.toolchain_dir().join("usr/bin/clang"),
        }
    }

    pub fn codesign_path(&self) -> PathBuf {
        match &self.codesign_override {
            Some(path) => path.clone(),
            None => PathBuf::from("/usr/bin/codesign"),
        }
    }

    /// `codesign` picks the allocate tool up from the environment; point it
    /// into the configured toolchain.
    pub fn codesign_allocate_path(&self) -> PathBuf {
        self.toolchain_dir().join("usr/bin/codesign_allocate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_paths_follow_xcode_path() {
        let mut config = DaemonConfig::from_env();
        config.xcode_path = PathBuf::from("/Applications/Xcode-16.app");

        assert_eq!(
            config.sdk_path("iPhoneSimulator"),
            PathBuf::from(
                "/Applications/Xcode-16.app/Contents/Developer/Platforms/\
                 iPhoneSimulator.platform/Developer/SDKs/iPhoneSimulator.sdk"
            )
        );
        assert_eq!(
            config.swift_frontend_path(),
            PathBuf::from(
                "/Applications/Xcode-16.app/Contents/Developer/Toolchains/\
                 XcodeDefault.xctoolchain/usr/bin/swift-frontend"
            )
        );
        // Plugins always come from the device platform, even for simulators.
        assert_eq!(
            config.platform_usr_dir("iPhoneSimulator"),
            PathBuf::from(
                "/Applications/Xcode-16.app/Contents/Developer/Platforms/\
                 iPhoneOS.platform/Developer/usr"
            )
        );
    }

    #[test]
    fn test_overrides_replace_toolchain_binaries() {
        let mut config = DaemonConfig::from_env();
        config.compiler_override = Some(PathBuf::from("/fake/swiftc"));
        config.linker_override = Some(PathBuf::from("/fake/clang"));
        config.codesign_override = Some(PathBuf::from("/fake/codesign"));

        assert_eq!(config.swift_frontend_path(), PathBuf::from("/fake/swiftc"));
        assert_eq!(config.clang_path(), PathBuf::from("/fake/clang"));
        assert_eq!(config.codesign_path(), PathBuf::from("/fake/codesign"));
    }

    #[test]
    fn test_for_tests_roots_everything_under_base() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DaemonConfig::for_tests(dir.path());

        assert!(config.cache_dir.starts_with(dir.path()));
        assert!(config.tmp_base.is_dir());
        assert_eq!(config.home_dir, dir.path());
        assert_eq!(config.client_port, 0);
    }
}
