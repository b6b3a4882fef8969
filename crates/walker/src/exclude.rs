//! Layered exclusion rules.
//!
//! Three layers stack per directory: global patterns from the command line,
//! recursive exclude files (picked up in a directory, pushed down into its
//! subtree), and local exclude files (applying only to the directory that
//! declares them). Patterns without a leading `/` match anywhere below the
//! root, like `**/name`.

use std::path::Path;
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

/// Patterns excluded by default with `--cvs-exclude`.
pub const CVS_DEFAULTS: &[&str] = &[
    "RCS", "SCCS", "CVS", "CVS.adm", ".svn", ".git", ".hg", ".bzr", "*.o", "*.a", "*.so",
    "*.orig", "*.rej", "*.bak", "*~", "#*#", ".#*", "*.swp", "core", ".DS_Store",
];

/// A compiled, immutable set of exclusion patterns. Extension produces a
/// new set; unextended sets are shared down the recursion for free.
#[derive(Clone)]
pub struct ExcludeSet {
    patterns: Arc<Vec<String>>,
    set: Arc<GlobSet>,
}

impl ExcludeSet {
    pub fn new(patterns: &[String]) -> Self {
        let normalized: Vec<String> = patterns.iter().map(|p| normalize(p)).collect();
        let set = compile(&normalized);
        Self { patterns: Arc::new(normalized), set: Arc::new(set) }
    }

    pub fn empty() -> Self {
        Self::new(&[])
    }

    /// This set plus more patterns; returns self unchanged when `more` is
    /// empty.
    pub fn extended(&self, more: &[String]) -> Self {
        if more.is_empty() {
            return self.clone();
        }
        let mut all: Vec<String> = self.patterns.as_ref().clone();
        all.extend(more.iter().map(|p| normalize(p)));
        let set = compile(&all);
        Self { patterns: Arc::new(all), set: Arc::new(set) }
    }

    /// Match a path relative to the backup root (leading `/`).
    pub fn is_excluded(&self, rel_path: &str) -> bool {
        self.set.is_match(rel_path)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn normalize(pattern: &str) -> String {
    if pattern.starts_with('/') {
        pattern.to_string()
    } else {
        format!("/**/{pattern}")
    }
}

fn compile(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        match Glob::new(p) {
            Ok(g) => {
                builder.add(g);
            }
            Err(e) => warn!(pattern = %p, error = %e, "ignoring bad exclude pattern"),
        }
    }
    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "exclude set failed to compile; excluding nothing");
        GlobSet::empty()
    })
}

/// Load one exclude file (one pattern per line, `#` comments allowed).
/// A missing file is an empty list.
pub fn load_exclude_file(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let patterns: Vec<String> = text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect();
            if !patterns.is_empty() {
                debug!(file = %path.display(), count = patterns.len(), "loaded exclude file");
            }
            patterns
        }
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchored_and_floating_patterns() {
        let ex = ExcludeSet::new(&["/top/secret".to_string(), "*.tmp".to_string()]);
        assert!(ex.is_excluded("/top/secret"));
        assert!(!ex.is_excluded("/other/top/secret"));
        assert!(ex.is_excluded("/a/b/c/junk.tmp"));
        assert!(ex.is_excluded("/junk.tmp"));
        assert!(!ex.is_excluded("/a/file.txt"));
    }

    #[test]
    fn extension_layers_without_mutating_parent() {
        let base = ExcludeSet::new(&["*.log".to_string()]);
        let child = base.extended(&["build".to_string()]);
        assert!(child.is_excluded("/x/build"));
        assert!(!base.is_excluded("/x/build"));
        assert!(child.is_excluded("/x/y.log"));
    }

    #[test]
    fn empty_extension_is_shared() {
        let base = ExcludeSet::new(&["*.log".to_string()]);
        let same = base.extended(&[]);
        assert!(Arc::ptr_eq(&base.set, &same.set));
    }

    #[test]
    fn exclude_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("excl");
        std::fs::write(&f, "# comment\n\n*.iso\n/abs/path\n").unwrap();
        let pats = load_exclude_file(&f);
        assert_eq!(pats, vec!["*.iso".to_string(), "/abs/path".to_string()]);
        assert!(load_exclude_file(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn cvs_defaults_cover_common_noise() {
        let ex = ExcludeSet::new(
            &CVS_DEFAULTS.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        );
        assert!(ex.is_excluded("/src/.git"));
        assert!(ex.is_excluded("/src/main.o"));
        assert!(!ex.is_excluded("/src/main.rs"));
    }
}
