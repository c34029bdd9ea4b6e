//! TOML-based configuration for gitward.
//!
//! The file lives at `<config_dir>/gitward/config.toml` unless overridden.
//! A missing file is not an error: built-in defaults apply, including the
//! default Background rules for translation catalogs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classifier::{default_rules, ClassificationRule, Classifier};
use crate::errors::ConfigError;
use crate::state::atomic_write;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitwardConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Global classification rules, in priority order.
    #[serde(default = "default_rules")]
    pub rules: Vec<ClassificationRule>,

    /// Per-repository settings keyed by absolute repository root.
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl Default for GitwardConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            rules: default_rules(),
            projects: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Minimum similarity for a rename pair, in `(0, 1]`.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Lines of context captured before each conflict hunk.
    #[serde(default = "default_diff_context")]
    pub diff_context: usize,

    /// Base directory for per-repository state. Platform default if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// The git executable to invoke.
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            similarity_threshold: default_similarity_threshold(),
            diff_context: default_diff_context(),
            state_dir: None,
            git_binary: default_git_binary(),
        }
    }
}

fn default_log_level() -> String {
    "warn".into()
}

fn default_similarity_threshold() -> f64 {
    0.6
}

fn default_diff_context() -> usize {
    3
}

fn default_git_binary() -> String {
    "git".into()
}

// ---------------------------------------------------------------------------
// Per-project
// ---------------------------------------------------------------------------

/// Rules that apply to one repository, ahead of the global list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub rules: Vec<ClassificationRule>,
}

// ---------------------------------------------------------------------------
// Loading, saving & rule management
// ---------------------------------------------------------------------------

impl GitwardConfig {
    /// `<config_dir>/gitward/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|d| d.join("gitward").join("config.toml"))
            .ok_or(ConfigError::NoPlatformDir("config"))
    }

    /// Load a [`GitwardConfig`] from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: GitwardConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(rules = config.rules.len(), projects = config.projects.len(), "configuration parsed");
        Ok(config)
    }

    /// Like [`load_from_file`](Self::load_from_file), but a missing file
    /// yields the defaults. The result is validated.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = match Self::load_from_file(path) {
            Ok(c) => c,
            Err(ConfigError::FileNotFound(p)) => {
                debug!(path = %p, "no configuration file, using defaults");
                Self::default()
            }
            Err(e) => return Err(e),
        };
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration back atomically.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(path, text.as_bytes())?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Validate that all fields are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.engine.similarity_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "engine.similarity_threshold".into(),
                detail: format!("must be in (0, 1], got {t}"),
            });
        }
        if self.engine.git_binary.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "engine.git_binary".into(),
                detail: "git binary must not be empty".into(),
            });
        }
        let project_rules = self
            .projects
            .iter()
            .flat_map(|(k, p)| p.rules.iter().map(move |r| (format!("projects.\"{k}\".rules"), r)));
        let global_rules = self.rules.iter().map(|r| ("rules".to_string(), r));
        for (field, rule) in global_rules.chain(project_rules) {
            if rule.pattern.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field,
                    detail: "rule pattern must not be empty".into(),
                });
            }
        }
        Ok(())
    }

    /// Effective rules for `repo_root`: project rules first, then global.
    pub fn rules_for(&self, repo_root: &Path) -> Vec<ClassificationRule> {
        let mut rules = self
            .projects
            .get(&project_key(repo_root))
            .map(|p| p.rules.clone())
            .unwrap_or_default();
        rules.extend(self.rules.iter().cloned());
        rules
    }

    pub fn classifier_for(&self, repo_root: &Path) -> Classifier {
        Classifier::new(self.rules_for(repo_root))
    }

    /// Append a rule to the global list, or to `project`'s list.
    ///
    /// Returns `false` if a rule with the same pattern already exists there.
    pub fn add_rule(&mut self, project: Option<&Path>, rule: ClassificationRule) -> bool {
        let list = self.rule_list_mut(project);
        if list.iter().any(|r| r.pattern == rule.pattern) {
            return false;
        }
        info!(pattern = rule.pattern.as_str(), class = %rule.class, "classification rule added");
        list.push(rule);
        true
    }

    /// Remove the rule with `pattern`. Returns `false` if none matched.
    pub fn remove_rule(&mut self, project: Option<&Path>, pattern: &str) -> bool {
        let list = self.rule_list_mut(project);
        let before = list.len();
        list.retain(|r| r.pattern != pattern);
        let removed = list.len() != before;
        if let Some(p) = project {
            let key = project_key(p);
            if self.projects.get(&key).is_some_and(|c| c.rules.is_empty()) {
                self.projects.remove(&key);
            }
        }
        removed
    }

    fn rule_list_mut(&mut self, project: Option<&Path>) -> &mut Vec<ClassificationRule> {
        match project {
            Some(p) => &mut self.projects.entry(project_key(p)).or_default().rules,
            None => &mut self.rules,
        }
    }

    /// Generate a commented default TOML template.
    pub fn default_template() -> &'static str {
        r#"# gitward configuration

[engine]
log_level = "warn"
similarity_threshold = 0.6
diff_context = 3
git_binary = "git"
# state_dir = "/path/to/state"   # defaults to the platform data dir

# Ordered classification rules; the first match wins, unmatched paths are
# foreground. Patterns match the repo-relative path or the file name.
[[rules]]
pattern = "*.po"
class = "background"
rationale = "generated translation catalogs"

[[rules]]
pattern = "*.mo"
class = "background"
rationale = "compiled translation catalogs"

# Per-repository rules are checked before the global list.
# [projects."/home/me/src/app"]
# rules = [
#   { pattern = "dist/**", class = "background", rationale = "build output" },
# ]
"#
    }
}

/// Key used in `[projects]`: the canonical repository root.
pub fn project_key(repo_root: &Path) -> String {
    repo_root
        .canonicalize()
        .unwrap_or_else(|_| repo_root.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
