//! Path pattern matching for synced directories.
//!
//! Patterns are globs over slash-separated relative paths. `*` stays within
//! one path component and `**` crosses components. A pattern that matches a
//! directory also matches everything below it.

use a3s_build_core::error::{BuildError, Result};
use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Normalize a relative path or pattern: no leading `./` or `/`, no trailing `/`.
pub fn clean_path(path: &str) -> &str {
    let mut path = path;
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest;
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest;
        } else {
            break;
        }
    }
    path.trim_end_matches('/')
}

/// Ancestors of a relative path, nearest first (`a/b/c` yields `a/b`, `a`).
pub fn parents(path: &str) -> impl Iterator<Item = &str> {
    let mut current = path;
    std::iter::from_fn(move || {
        let idx = current.rfind('/')?;
        current = &current[..idx];
        Some(current)
    })
}

/// A compiled set of path patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    patterns: Vec<Pattern>,
    /// Literal leading directories of each pattern, used to keep the
    /// directories that lead to a possible match.
    prefixes: Vec<String>,
}

impl PatternMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        let mut prefixes = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let cleaned = clean_path(raw.as_ref());
            if cleaned.is_empty() {
                continue;
            }
            let pattern = Pattern::new(cleaned)
                .map_err(|e| BuildError::InvalidPattern(format!("{}: {}", raw.as_ref(), e)))?;
            compiled.push(pattern);
            prefixes.push(literal_prefix(cleaned));
        }
        Ok(Self {
            patterns: compiled,
            prefixes,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `path` itself matches a pattern.
    pub fn matches_exact(&self, path: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(path, MATCH_OPTIONS))
    }

    /// Whether `path` or any of its parents matches a pattern.
    pub fn matches(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.matches_exact(path) || parents(path).any(|parent| self.matches_exact(parent))
    }

    /// Whether some pattern could match an entry below directory `dir`.
    pub fn may_match_below(&self, dir: &str) -> bool {
        let dir = clean_path(dir);
        self.prefixes.iter().any(|prefix| {
            prefix == dir
                || prefix.starts_with(&format!("{}/", dir))
                || dir.starts_with(&format!("{}/", prefix))
                || prefix.is_empty()
        })
    }
}

/// Leading path components of a pattern that contain no glob syntax.
fn literal_prefix(pattern: &str) -> String {
    let mut components = Vec::new();
    let mut parts = pattern.split('/').peekable();
    while let Some(part) = parts.next() {
        // The final component is the match itself, not a directory to keep.
        if parts.peek().is_none() || part.contains(['*', '?', '[']) {
            break;
        }
        components.push(part);
    }
    components.join("/")
}
