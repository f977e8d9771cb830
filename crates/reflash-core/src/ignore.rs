//! `.gitignore`-style filtering for the file watcher.
//!
//! Saves inside ignored paths (build output, vendored code) must never
//! trigger an injection. Rules follow the familiar gitignore shape: comments,
//! negation with `!`, directory-only rules with a trailing `/`, anchoring
//! with a leading `/`, and the `*` / `?` / `**` wildcards. Matching is
//! case-insensitive and the last matching rule wins.

use std::path::{Path, PathBuf};

/// One parsed rule line.
#[derive(Debug, Clone)]
struct IgnoreRule {
    /// Lowercased pattern with markers stripped.
    pattern: Vec<char>,
    /// Rule re-includes matches instead of excluding them (`!`).
    negated: bool,
    /// Rule only applies to directories themselves (trailing `/`); their
    /// contents are still covered through the prefix-directory match.
    dir_only: bool,
    /// Rule must match from the start of the path (leading `/`).
    anchored: bool,
}

impl IgnoreRule {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (negated, line) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (dir_only, line) = match line.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (anchored, line) = match line.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        if line.is_empty() {
            return None;
        }

        Some(Self {
            pattern: line.to_lowercase().chars().collect(),
            negated,
            dir_only,
            anchored,
        })
    }

    /// Whether this rule matches `path` (lowercased, `/`-separated, no
    /// leading slash).
    fn matches(&self, path: &[char], is_dir: bool) -> bool {
        // Candidate start offsets: the beginning of every path component,
        // or only the path start for anchored rules.
        let mut starts = vec![0];
        if !self.anchored {
            for (i, &c) in path.iter().enumerate() {
                if c == '/' {
                    starts.push(i + 1);
                }
            }
        }

        for &start in &starts {
            let tail = &path[start..];
            // Candidate end offsets: every component boundary in the tail,
            // plus the end of the path.
            let mut ends: Vec<usize> = tail
                .iter()
                .enumerate()
                .filter_map(|(i, &c)| (c == '/').then_some(i))
                .collect();
            ends.push(tail.len());

            for &end in &ends {
                if !glob_match(&self.pattern, &tail[..end]) {
                    continue;
                }
                if start + end < path.len() {
                    // The rule matched a leading directory of the path, so
                    // everything below that directory is covered.
                    return true;
                }
                if !self.dir_only || is_dir {
                    return true;
                }
            }
        }
        false
    }
}

/// Glob match over a full candidate string. `*` and `?` stop at `/`,
/// `**` crosses component boundaries, `**/` may also match zero components.
fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') if pattern.get(1) == Some(&'*') => {
            let rest = &pattern[2..];
            if rest.first() == Some(&'/') && glob_match(&rest[1..], text) {
                return true;
            }
            (0..=text.len()).any(|i| glob_match(rest, &text[i..]))
        }
        Some('*') => {
            let rest = &pattern[1..];
            for i in 0..=text.len() {
                if i > 0 && text[i - 1] == '/' {
                    break;
                }
                if glob_match(rest, &text[i..]) {
                    return true;
                }
            }
            false
        }
        Some('?') => match text.first() {
            Some(&c) if c != '/' => glob_match(&pattern[1..], &text[1..]),
            _ => false,
        },
        Some(&expected) => match text.first() {
            Some(&c) if c == expected => glob_match(&pattern[1..], &text[1..]),
            _ => false,
        },
    }
}

/// The parsed contents of one ignore file.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFilter {
    rules: Vec<IgnoreRule>,
}

impl IgnoreFilter {
    /// Parse rules from ignore-file text.
    pub fn from_content(content: &str) -> Self {
        Self {
            rules: content.lines().filter_map(IgnoreRule::parse).collect(),
        }
    }

    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_content(&std::fs::read_to_string(path)?))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `path` (relative to the ignore file's directory) is ignored.
    pub fn should_ignore(&self, path: &str, is_dir: bool) -> bool {
        let normalized: Vec<char> = path
            .trim_start_matches('/')
            .to_lowercase()
            .chars()
            .collect();

        let mut ignored = false;
        for rule in &self.rules {
            if rule.matches(&normalized, is_dir) {
                ignored = !rule.negated;
            }
        }
        ignored
    }
}

/// Ignore files discovered walking up from a directory, nearest first.
#[derive(Debug, Default)]
pub struct IgnoreStack {
    filters: Vec<(PathBuf, IgnoreFilter)>,
}

impl IgnoreStack {
    /// Collect `.gitignore` files from `start` up to the filesystem root.
    pub fn discover(start: &Path) -> Self {
        let mut filters = Vec::new();
        let mut dir = Some(start);
        while let Some(current) = dir {
            let candidate = current.join(".gitignore");
            if candidate.is_file() {
                if let Ok(filter) = IgnoreFilter::from_file(&candidate) {
                    if !filter.is_empty() {
                        filters.push((current.to_path_buf(), filter));
                    }
                }
            }
            dir = current.parent();
        }
        Self { filters }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Whether any discovered ignore file covers `path`.
    pub fn should_ignore(&self, path: &Path, is_dir: bool) -> bool {
        for (dir, filter) in &self.filters {
            let Ok(rel) = path.strip_prefix(dir) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if filter.should_ignore(&rel, is_dir) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use tempfile::TempDir;

    fn filter() -> IgnoreFilter {
        IgnoreFilter::from_content(indoc! {"
            # build artifacts
            *.log
            !important.log
            node_modules/
            build/
            !build/keep.txt
            temp/*.tmp
            /anchored.txt
            file?.txt
            docs/**/*.md
        "})
    }

    #[test]
    fn test_comments_and_blanks_are_skipped() {
        let f = IgnoreFilter::from_content("# just a comment\n\n   \n");
        assert!(f.is_empty());
    }

    #[test]
    fn test_simple_wildcard() {
        let f = filter();
        assert!(f.should_ignore("error.log", false));
        assert!(f.should_ignore("logs/debug.log", false));
        assert!(!f.should_ignore("readme.txt", false));
    }

    #[test]
    fn test_negation_reincludes() {
        let f = filter();
        assert!(!f.should_ignore("important.log", false));
        assert!(!f.should_ignore("build/keep.txt", false));
    }

    #[test]
    fn test_directory_rule_covers_contents() {
        let f = filter();
        assert!(f.should_ignore("node_modules/package.json", false));
        assert!(f.should_ignore("build/output.bin", false));
        assert!(f.should_ignore("app/node_modules/lib/index.js", false));
    }

    #[test]
    fn test_directory_rule_needs_directory_for_exact_match() {
        let f = filter();
        assert!(f.should_ignore("build", true));
        assert!(!f.should_ignore("build", false));
    }

    #[test]
    fn test_path_scoped_wildcard() {
        let f = filter();
        assert!(f.should_ignore("temp/cache.tmp", false));
        assert!(!f.should_ignore("temp/data.json", false));
    }

    #[test]
    fn test_anchored_rule_only_matches_at_root() {
        let f = filter();
        assert!(f.should_ignore("anchored.txt", false));
        assert!(!f.should_ignore("sub/anchored.txt", false));
    }

    #[test]
    fn test_question_mark_matches_single_character() {
        let f = filter();
        assert!(f.should_ignore("file1.txt", false));
        assert!(!f.should_ignore("file10.txt", false));
        assert!(!f.should_ignore("file.txt", false));
    }

    #[test]
    fn test_double_star_spans_components() {
        let f = filter();
        assert!(f.should_ignore("docs/readme.md", false));
        assert!(f.should_ignore("docs/a/b/readme.md", false));
        assert!(!f.should_ignore("docs/readme.txt", false));
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let f = filter();
        assert!(f.should_ignore("ERROR.LOG", false));
        assert!(f.should_ignore("Build/Output.bin", false));
    }

    #[test]
    fn test_last_match_wins() {
        let f = IgnoreFilter::from_content("!a.txt\na.txt");
        assert!(f.should_ignore("a.txt", false));

        let f = IgnoreFilter::from_content("a.txt\n!a.txt");
        assert!(!f.should_ignore("a.txt", false));
    }

    #[test]
    fn test_stack_discovers_upward_and_scopes_paths() {
        let root = TempDir::new().unwrap();
        let project = root.path().join("project");
        std::fs::create_dir_all(project.join("src")).unwrap();
        std::fs::write(root.path().join(".gitignore"), "*.tmp\n").unwrap();
        std::fs::write(project.join(".gitignore"), "generated/\n").unwrap();

        let stack = IgnoreStack::discover(&project);
        assert!(stack.len() >= 2);
        assert!(stack.should_ignore(&project.join("scratch.tmp"), false));
        assert!(stack.should_ignore(&project.join("generated/out.swift"), false));
        assert!(!stack.should_ignore(&project.join("src/main.swift"), false));
    }
}
