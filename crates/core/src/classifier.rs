//! Foreground/Background classification of working-tree paths.
//!
//! Background changes are generated or otherwise ignorable (compiled
//! translations, build output, lock files). They are shelved around every
//! wrapped operation and excluded from rename matching. Everything else is
//! Foreground: operator-authored work that must stay visible.
//!
//! # Decision model
//!
//! | Condition | Class |
//! |-----------|-------|
//! | First rule whose glob matches the full path or the file name | that rule's class |
//! | No rule matches | `Foreground` |

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeClass {
    Foreground,
    Background,
}

impl fmt::Display for ChangeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Foreground => write!(f, "foreground"),
            Self::Background => write!(f, "background"),
        }
    }
}

/// One ordered classification rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Glob, matched against the repo-relative path and the file name.
    pub pattern: String,
    pub class: ChangeClass,
    #[serde(default)]
    pub rationale: String,
}

impl ClassificationRule {
    pub fn background(pattern: &str, rationale: &str) -> Self {
        Self {
            pattern: pattern.into(),
            class: ChangeClass::Background,
            rationale: rationale.into(),
        }
    }

    pub fn foreground(pattern: &str, rationale: &str) -> Self {
        Self {
            pattern: pattern.into(),
            class: ChangeClass::Foreground,
            rationale: rationale.into(),
        }
    }

    /// Whether this rule's glob matches `rel_path`.
    pub fn matches(&self, rel_path: &str) -> bool {
        let normalized = rel_path.replace('\\', "/");
        if glob_match::glob_match(&self.pattern, &normalized) {
            return true;
        }
        let name = Path::new(&normalized)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        !name.is_empty() && glob_match::glob_match(&self.pattern, &name)
    }
}

/// Rules used when nothing is configured.
pub fn default_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule::background("*.po", "generated translation catalogs"),
        ClassificationRule::background("*.mo", "compiled translation catalogs"),
    ]
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Ordered, first-match-wins rule set. Pure: no I/O.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<ClassificationRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl Classifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classify one repo-relative path.
    pub fn classify(&self, rel_path: &str) -> ChangeClass {
        self.classify_with_rule(rel_path)
            .map(|r| r.class)
            .unwrap_or(ChangeClass::Foreground)
    }

    /// The rule that decides `rel_path`, if any.
    pub fn classify_with_rule(&self, rel_path: &str) -> Option<&ClassificationRule> {
        let rule = self.rules.iter().find(|r| r.matches(rel_path));
        if let Some(r) = rule {
            debug!(
                path = rel_path,
                pattern = r.pattern.as_str(),
                class = %r.class,
                "path matched classification rule"
            );
        }
        rule
    }

    pub fn is_background(&self, rel_path: &str) -> bool {
        self.classify(rel_path) == ChangeClass::Background
    }

    /// Split paths into `(foreground, background)`, preserving order.
    pub fn partition<S: AsRef<str>>(&self, paths: &[S]) -> (Vec<String>, Vec<String>) {
        let mut foreground = Vec::new();
        let mut background = Vec::new();
        for p in paths {
            let p = p.as_ref();
            match self.classify(p) {
                ChangeClass::Foreground => foreground.push(p.to_string()),
                ChangeClass::Background => background.push(p.to_string()),
            }
        }
        (foreground, background)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
