//! Include/exclude rules applied during walking and diffing.
//!
//! Rules are ordered and first-match-wins: `Include`/`Exclude` globs are
//! consulted in the order given, with `*` stopping at path separators and
//! `**` crossing them. When at least one include rule exists, files matched
//! by no rule are excluded; otherwise the default is include. Size and age
//! bounds and an explicit `files_from` allowlist stack on top.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobMatcher};

use crate::error::{FsError, FsResult};

/// One ordered filter rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterRule {
    Include(String),
    Exclude(String),
}

/// Filter configuration before compilation.
#[derive(Debug, Clone, Default)]
pub struct FilterOpts {
    pub rules: Vec<FilterRule>,
    /// Exclude files smaller than this.
    pub min_size: Option<u64>,
    /// Exclude files larger than this.
    pub max_size: Option<u64>,
    /// Exclude files older than this.
    pub max_age: Option<Duration>,
    /// When set, only these exact paths are eligible.
    pub files_from: Option<Vec<String>>,
}

struct CompiledRule {
    include: bool,
    matcher: GlobMatcher,
    /// For an exclude pattern ending in `/**`, matches the directory itself
    /// so recursion can be pruned at the top.
    dir_matcher: Option<GlobMatcher>,
}

/// A compiled filter.
pub struct Filter {
    rules: Vec<CompiledRule>,
    has_includes: bool,
    min_size: Option<u64>,
    max_size: Option<u64>,
    max_age: Option<Duration>,
    files_from: Option<BTreeSet<String>>,
}

impl Filter {
    /// Compile `opts`; glob syntax errors surface as
    /// [`FsError::Validation`].
    pub fn new(opts: FilterOpts) -> FsResult<Self> {
        let mut rules = Vec::with_capacity(opts.rules.len());
        let mut has_includes = false;
        for rule in &opts.rules {
            let (include, pattern) = match rule {
                FilterRule::Include(p) => (true, p),
                FilterRule::Exclude(p) => (false, p),
            };
            has_includes |= include;
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| FsError::Validation(format!("bad filter glob {pattern:?}: {e}")))?;
            let dir_matcher = match (include, pattern.strip_suffix("/**")) {
                (false, Some(prefix)) if !prefix.is_empty() => Some(
                    GlobBuilder::new(prefix)
                        .literal_separator(true)
                        .build()
                        .map_err(|e| {
                            FsError::Validation(format!("bad filter glob {pattern:?}: {e}"))
                        })?
                        .compile_matcher(),
                ),
                _ => None,
            };
            rules.push(CompiledRule {
                include,
                matcher: glob.compile_matcher(),
                dir_matcher,
            });
        }
        Ok(Filter {
            rules,
            has_includes,
            min_size: opts.min_size,
            max_size: opts.max_size,
            max_age: opts.max_age,
            files_from: opts.files_from.map(|v| v.into_iter().collect()),
        })
    }

    /// A filter that includes everything.
    pub fn include_all() -> Self {
        Filter::new(FilterOpts::default()).expect("empty filter compiles")
    }

    /// Whether this filter can exclude nothing.
    pub fn is_default(&self) -> bool {
        self.rules.is_empty()
            && self.min_size.is_none()
            && self.max_size.is_none()
            && self.max_age.is_none()
            && self.files_from.is_none()
    }

    /// Whether a file at `remote` with the given attributes passes.
    pub fn include_file(&self, remote: &str, size: u64, mod_time: DateTime<Utc>) -> bool {
        if let Some(files) = &self.files_from {
            return files.contains(remote);
        }
        if let Some(min) = self.min_size {
            if size < min {
                return false;
            }
        }
        if let Some(max) = self.max_size {
            if size > max {
                return false;
            }
        }
        if let Some(max_age) = self.max_age {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
            if mod_time < cutoff {
                return false;
            }
        }
        for rule in &self.rules {
            if rule.matcher.is_match(remote) {
                return rule.include;
            }
        }
        !self.has_includes
    }

    /// Whether recursion into `remote` could yield included entries.
    ///
    /// Include rules never prune a directory (a match may sit anywhere
    /// beneath it); only an exclude rule matching the directory itself or
    /// everything under it does.
    pub fn include_directory(&self, remote: &str) -> bool {
        if let Some(files) = &self.files_from {
            let prefix = format!("{remote}/");
            return files.iter().any(|f| f.starts_with(&prefix));
        }
        for rule in &self.rules {
            if rule.include {
                continue;
            }
            if rule.matcher.is_match(remote) {
                return false;
            }
            if let Some(dm) = &rule.dir_matcher {
                if dm.is_match(remote) {
                    return false;
                }
            }
        }
        true
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("rules", &self.rules.len())
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("max_age", &self.max_age)
            .field("files_from", &self.files_from.as_ref().map(|f| f.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_default_includes_everything() {
        let f = Filter::include_all();
        assert!(f.is_default());
        assert!(f.include_file("any/path.bin", 123, now()));
        assert!(f.include_directory("any"));
    }

    #[test]
    fn test_exclude_glob() {
        let f = Filter::new(FilterOpts {
            rules: vec![FilterRule::Exclude("*.tmp".into())],
            ..Default::default()
        })
        .unwrap();
        assert!(!f.include_file("scratch.tmp", 1, now()));
        assert!(f.include_file("scratch.txt", 1, now()));
        // `*` does not cross separators.
        assert!(f.include_file("dir/scratch.tmp", 1, now()));
    }

    #[test]
    fn test_double_star_crosses_directories() {
        let f = Filter::new(FilterOpts {
            rules: vec![FilterRule::Exclude("**/*.tmp".into())],
            ..Default::default()
        })
        .unwrap();
        assert!(!f.include_file("a/b/c/scratch.tmp", 1, now()));
        assert!(f.include_file("a/b/c/keep.txt", 1, now()));
    }

    #[test]
    fn test_include_rules_exclude_rest() {
        let f = Filter::new(FilterOpts {
            rules: vec![FilterRule::Include("*.rs".into())],
            ..Default::default()
        })
        .unwrap();
        assert!(f.include_file("main.rs", 1, now()));
        assert!(!f.include_file("main.go", 1, now()));
    }

    #[test]
    fn test_first_match_wins() {
        let f = Filter::new(FilterOpts {
            rules: vec![
                FilterRule::Include("important.log".into()),
                FilterRule::Exclude("*.log".into()),
            ],
            ..Default::default()
        })
        .unwrap();
        assert!(f.include_file("important.log", 1, now()));
        assert!(!f.include_file("noise.log", 1, now()));
    }

    #[test]
    fn test_size_bounds() {
        let f = Filter::new(FilterOpts {
            min_size: Some(10),
            max_size: Some(100),
            ..Default::default()
        })
        .unwrap();
        assert!(!f.include_file("small", 9, now()));
        assert!(f.include_file("fits", 10, now()));
        assert!(f.include_file("fits", 100, now()));
        assert!(!f.include_file("big", 101, now()));
    }

    #[test]
    fn test_max_age() {
        let f = Filter::new(FilterOpts {
            max_age: Some(Duration::from_secs(3600)),
            ..Default::default()
        })
        .unwrap();
        assert!(f.include_file("fresh", 1, now()));
        assert!(!f.include_file("stale", 1, now() - chrono::Duration::hours(2)));
    }

    #[test]
    fn test_files_from() {
        let f = Filter::new(FilterOpts {
            files_from: Some(vec!["keep/a.txt".into(), "keep/b.txt".into()]),
            ..Default::default()
        })
        .unwrap();
        assert!(f.include_file("keep/a.txt", 1, now()));
        assert!(!f.include_file("keep/c.txt", 1, now()));
        assert!(f.include_directory("keep"));
        assert!(!f.include_directory("other"));
    }

    #[test]
    fn test_directory_pruning() {
        let f = Filter::new(FilterOpts {
            rules: vec![FilterRule::Exclude("node_modules/**".into())],
            ..Default::default()
        })
        .unwrap();
        assert!(!f.include_directory("node_modules"));
        assert!(f.include_directory("src"));

        // Include rules never prune recursion.
        let f = Filter::new(FilterOpts {
            rules: vec![FilterRule::Include("**/*.rs".into())],
            ..Default::default()
        })
        .unwrap();
        assert!(f.include_directory("deep/nested"));
    }

    #[test]
    fn test_bad_glob_is_validation_error() {
        let err = Filter::new(FilterOpts {
            rules: vec![FilterRule::Exclude("a[".into())],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, FsError::Validation(_)));
    }
}
