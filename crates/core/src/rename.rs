//! Content-similarity rename matching.
//!
//! Pairs deleted paths with added paths before they are staged, so a rename
//! with light edits is recorded as a rename even when git's own post-hoc
//! detection would miss it.
//!
//! Similarity is `2 * unchanged / (old_lines + new_lines)`, where the
//! unchanged line count comes from a line diff. Candidates must share a
//! broad category (source with source, other text with other text); binary
//! content and Background paths never pair. Each deleted path takes its
//! best candidate at or above the threshold, ties going to the smallest path
//! edit distance, and each added path pairs at most once.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::Classifier;

/// Extensions treated as source code.
const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "c", "h", "cc", "cpp", "hpp", "java", "kt", "rb",
    "php", "cs", "swift", "scala", "sh", "lua", "pl", "m", "mm", "sql",
];

const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Source,
    Text,
}

impl FileCategory {
    pub fn of(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if SOURCE_EXTENSIONS.contains(&ext.as_str()) {
            Self::Source
        } else {
            Self::Text
        }
    }
}

/// A path and its text content, `None` when binary or unreadable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameCandidate {
    pub path: String,
    pub content: Option<String>,
}

impl RenameCandidate {
    pub fn new(path: impl Into<String>, content: Option<String>) -> Self {
        Self {
            path: path.into(),
            content,
        }
    }

    /// From raw bytes: binary or non-UTF-8 content is not a candidate.
    pub fn from_bytes(path: impl Into<String>, bytes: Option<Vec<u8>>) -> Self {
        let content = bytes
            .filter(|b| !crate::git::looks_binary(b))
            .and_then(|b| String::from_utf8(b).ok());
        Self::new(path, content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenamePair {
    pub deleted: String,
    pub added: String,
    pub similarity: f64,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Normalized line similarity in `[0, 1]`. Empty content never matches.
pub fn similarity(old: &str, new: &str) -> f64 {
    let old_lines = old.lines().count();
    let new_lines = new.lines().count();
    if old_lines == 0 || new_lines == 0 {
        return 0.0;
    }
    let patch = diffy::create_patch(old, new);
    let deleted: usize = patch
        .hunks()
        .iter()
        .map(|h| {
            h.lines()
                .iter()
                .filter(|l| matches!(l, diffy::Line::Delete(_)))
                .count()
        })
        .sum();
    let unchanged = old_lines.saturating_sub(deleted);
    (2 * unchanged) as f64 / (old_lines + new_lines) as f64
}

/// Levenshtein distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

pub struct RenameMatcher<'a> {
    classifier: &'a Classifier,
    threshold: f64,
}

impl<'a> RenameMatcher<'a> {
    pub fn new(classifier: &'a Classifier, threshold: f64) -> Self {
        Self {
            classifier,
            threshold,
        }
    }

    fn eligible(&self, c: &RenameCandidate) -> bool {
        c.content.is_some() && !self.classifier.is_background(&c.path)
    }

    /// Pair deleted with added paths, in `deleted` order.
    pub fn match_renames(
        &self,
        deleted: &[RenameCandidate],
        added: &[RenameCandidate],
    ) -> Vec<RenamePair> {
        let mut taken = vec![false; added.len()];
        let mut pairs = Vec::new();

        for old in deleted.iter().filter(|c| self.eligible(c)) {
            let Some(old_text) = old.content.as_deref() else {
                continue;
            };
            let category = FileCategory::of(&old.path);
            let mut best: Option<(usize, f64, usize)> = None;

            for (i, new) in added.iter().enumerate() {
                if taken[i] || !self.eligible(new) || FileCategory::of(&new.path) != category {
                    continue;
                }
                let Some(new_text) = new.content.as_deref() else {
                    continue;
                };
                let score = similarity(old_text, new_text);
                if score < self.threshold {
                    continue;
                }
                let distance = edit_distance(&old.path, &new.path);
                let better = match best {
                    None => true,
                    Some((_, best_score, best_distance)) => {
                        score > best_score + TIE_EPSILON
                            || ((score - best_score).abs() <= TIE_EPSILON && distance < best_distance)
                    }
                };
                if better {
                    best = Some((i, score, distance));
                }
            }

            if let Some((i, score, _)) = best {
                taken[i] = true;
                debug!(deleted = %old.path, added = %added[i].path, similarity = score, "rename matched");
                pairs.push(RenamePair {
                    deleted: old.path.clone(),
                    added: added[i].path.clone(),
                    similarity: score,
                });
            }
        }
        pairs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::default_rules;

    fn body(n: usize, tag: &str) -> String {
        (0..n).map(|i| format!("{tag} line {i}\n")).collect()
    }

    fn candidate(path: &str, text: &str) -> RenameCandidate {
        RenameCandidate::new(path, Some(text.to_string()))
    }

    #[test]
    fn test_header_change_is_similar() {
        let shared = body(98, "code");
        let old = format!("# header one\n# header two\n{shared}");
        let new = format!("# other one\n# other two\n{shared}");
        assert_eq!(old.lines().count(), 100);
        let s = similarity(&old, &new);
        assert!(s >= 0.6, "similarity {s}");
        assert!((s - 0.98).abs() < 1e-9);
    }

    #[test]
    fn test_shared_license_is_not_a_rename() {
        let license = "# Copyright Example\n# Licensed under MIT\n# See LICENSE\n";
        let a = format!("{license}{}", body(40, "alpha"));
        let b = format!("{license}{}", body(40, "beta"));
        assert!(similarity(&a, &b) < 0.6);

        let classifier = Classifier::new(vec![]);
        let m = RenameMatcher::new(&classifier, 0.6);
        assert!(m
            .match_renames(&[candidate("a.py", &a)], &[candidate("b.py", &b)])
            .is_empty());
    }

    #[test]
    fn test_match_foo_to_bar() {
        let shared = body(98, "code");
        let foo = format!("# foo\n# v1\n{shared}");
        let bar = format!("# bar\n# v2\n{shared}");
        let classifier = Classifier::new(vec![]);
        let m = RenameMatcher::new(&classifier, 0.6);
        let pairs = m.match_renames(&[candidate("foo.py", &foo)], &[candidate("bar.py", &bar)]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].deleted, "foo.py");
        assert_eq!(pairs[0].added, "bar.py");
        assert!(pairs[0].similarity >= 0.6);
    }

    #[test]
    fn test_tie_broken_by_path_distance() {
        let text = body(20, "same");
        let classifier = Classifier::new(vec![]);
        let m = RenameMatcher::new(&classifier, 0.6);
        let pairs = m.match_renames(
            &[candidate("src/util.rs", &text)],
            &[candidate("lib/other/zzz.rs", &text), candidate("src/utils.rs", &text)],
        );
        assert_eq!(pairs[0].added, "src/utils.rs");
    }

    #[test]
    fn test_category_binary_and_background_excluded() {
        let text = body(20, "same");
        let classifier = Classifier::new(default_rules());
        let m = RenameMatcher::new(&classifier, 0.6);

        // Source never pairs with plain text.
        assert!(m
            .match_renames(&[candidate("a.rs", &text)], &[candidate("a.txt", &text)])
            .is_empty());
        // Background paths are not candidates.
        assert!(m
            .match_renames(&[candidate("de.po", &text)], &[candidate("fr.po", &text)])
            .is_empty());
        // Binary content is not a candidate.
        let binary = RenameCandidate::from_bytes("b.txt", Some(vec![0, 1, 2, b'\n']));
        assert!(binary.content.is_none());
        assert!(m.match_renames(&[candidate("a.txt", &text)], &[binary]).is_empty());
    }

    #[test]
    fn test_added_path_pairs_once() {
        let text = body(20, "same");
        let classifier = Classifier::new(vec![]);
        let m = RenameMatcher::new(&classifier, 0.6);
        let pairs = m.match_renames(
            &[candidate("a.md", &text), candidate("b.md", &text)],
            &[candidate("c.md", &text)],
        );
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].deleted, "a.md");
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }
}
