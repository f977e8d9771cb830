//! Captured compiler invocations.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything required to re-run the compiler for one source file.
///
/// Records are captured once per compilation unit (from the build feed or the
/// intercepted front end) and replayed whenever a member file is saved. The
/// serialized field names are shared with the on-disk cache snapshots and must
/// not change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilationRecord {
    /// Compiler arguments in their original order, minus per-build
    /// bookkeeping outputs (dependency files, index stores and the like).
    pub arguments: Vec<String>,
    /// Newline-joined paths of every source in the compilation unit, in the
    /// exact form the compiler was given. Written out as a `-filelist` when
    /// the record is replayed.
    #[serde(rename = "swiftFiles")]
    pub member_files: String,
    /// Directory the compiler ran in; relative argument paths resolve
    /// against this.
    #[serde(rename = "workingDir")]
    pub working_dir: PathBuf,
}

impl CompilationRecord {
    pub fn new(
        arguments: Vec<String>,
        member_files: String,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            arguments,
            member_files,
            working_dir: working_dir.into(),
        }
    }

    /// Iterates the member source paths (one per line, blanks skipped).
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.member_files.lines().filter(|line| !line.is_empty())
    }

    /// Whether `source` is part of this compilation unit.
    pub fn contains_member(&self, source: &Path) -> bool {
        self.members().any(|member| Path::new(member) == source)
    }
}
