//! `stagegate.toml` configuration.
//!
//! ```toml
//! [reviews]
//! max_concurrent_reviews = 100
//! timeout_secs = 86400
//! max_content_length = 100000
//! valid_pipeline_stages = ["Analysis", "Planning", "Stories", "Prompts"]
//! sweep_interval_secs = 300
//!
//! [context]
//! budget = "40%"
//! model_window_chars = 22500
//! related_top_k = 3
//! max_excerpt_chars = 800
//!
//! [generator]
//! command = "claude"
//! args = []
//! timeout_secs = 600
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::context::{ContextBudget, ContextConfig};
use crate::generate::GeneratorConfig;
use crate::review::ReviewConfig;

pub const CONFIG_DIR: &str = ".stagegate";
pub const CONFIG_FILE: &str = "stagegate.toml";

pub const ENV_GENERATOR_CMD: &str = "STAGEGATE_GENERATOR_CMD";
pub const ENV_REVIEW_TIMEOUT_SECS: &str = "STAGEGATE_REVIEW_TIMEOUT_SECS";

/// The `.stagegate` directory for a project.
pub fn config_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewsSection {
    #[serde(default = "default_max_concurrent_reviews")]
    pub max_concurrent_reviews: usize,
    /// Seconds before a pending review expires
    #[serde(default = "default_review_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
    #[serde(default = "default_valid_pipeline_stages")]
    pub valid_pipeline_stages: Vec<String>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_concurrent_reviews() -> usize {
    100
}

fn default_review_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_content_length() -> usize {
    100_000
}

fn default_valid_pipeline_stages() -> Vec<String> {
    ["Analysis", "Planning", "Stories", "Prompts"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for ReviewsSection {
    fn default() -> Self {
        Self {
            max_concurrent_reviews: default_max_concurrent_reviews(),
            timeout_secs: default_review_timeout_secs(),
            max_content_length: default_max_content_length(),
            valid_pipeline_stages: default_valid_pipeline_stages(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    /// Percentage of the model window ("40%") or a character count ("9000")
    #[serde(default = "default_budget")]
    pub budget: String,
    #[serde(default = "default_model_window_chars")]
    pub model_window_chars: usize,
    #[serde(default = "default_related_top_k")]
    pub related_top_k: usize,
    #[serde(default = "default_max_excerpt_chars")]
    pub max_excerpt_chars: usize,
}

fn default_budget() -> String {
    "40%".to_string()
}

fn default_model_window_chars() -> usize {
    22_500
}

fn default_related_top_k() -> usize {
    3
}

fn default_max_excerpt_chars() -> usize {
    800
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            budget: default_budget(),
            model_window_chars: default_model_window_chars(),
            related_top_k: default_related_top_k(),
            max_excerpt_chars: default_max_excerpt_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSection {
    #[serde(default = "default_generator_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_generator_command() -> String {
    "claude".to_string()
}

fn default_generator_timeout_secs() -> u64 {
    crate::generate::DEFAULT_GENERATION_TIMEOUT_SECS
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            command: default_generator_command(),
            args: Vec::new(),
            timeout_secs: default_generator_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// The complete stagegate.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StagegateToml {
    #[serde(default)]
    pub reviews: ReviewsSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(default)]
    pub server: ServerSection,
}

impl StagegateToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stagegate.toml")
    }

    /// Load `stagegate.toml` from `config_dir`, or defaults if it is absent.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize stagegate.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides on top of the file settings.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Values that do not parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cmd) = lookup(ENV_GENERATOR_CMD).filter(|c| !c.trim().is_empty()) {
            self.generator.command = cmd;
        }
        if let Some(secs) = lookup(ENV_REVIEW_TIMEOUT_SECS).and_then(|v| v.trim().parse().ok()) {
            self.reviews.timeout_secs = secs;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.reviews.max_concurrent_reviews == 0 {
            warnings.push("reviews.max_concurrent_reviews is 0: every submission will be refused".into());
        }
        if self.reviews.timeout_secs == 0 {
            warnings.push("reviews.timeout_secs is 0: reviews expire on the next sweep".into());
        }
        if self.reviews.sweep_interval_secs == 0 {
            warnings.push("reviews.sweep_interval_secs must be greater than 0".into());
        }
        if self.reviews.max_content_length == 0 {
            warnings.push("reviews.max_content_length is 0: every submission will be refused".into());
        }
        if self.reviews.valid_pipeline_stages.is_empty() {
            warnings.push("reviews.valid_pipeline_stages is empty: every submission will be refused".into());
        }

        if let Err(e) = ContextBudget::parse(&self.context.budget) {
            warnings.push(format!(
                "Invalid context.budget '{}': {}",
                self.context.budget, e
            ));
        }
        if self.context.related_top_k == 0 {
            warnings.push("context.related_top_k is 0: no related stories will be included".into());
        }

        if self.generator.command.trim().is_empty() {
            warnings.push("generator.command is empty".into());
        }
        if self.generator.timeout_secs == 0 {
            warnings.push("generator.timeout_secs must be greater than 0".into());
        }

        warnings
    }

    pub fn to_review_config(&self) -> ReviewConfig {
        ReviewConfig {
            max_concurrent_reviews: self.reviews.max_concurrent_reviews,
            timeout: Duration::from_secs(self.reviews.timeout_secs),
            max_content_length: self.reviews.max_content_length,
            valid_pipeline_stages: self.reviews.valid_pipeline_stages.clone(),
            // A zero interval would panic the sweeper's ticker.
            sweep_interval: Duration::from_secs(self.reviews.sweep_interval_secs.max(1)),
        }
    }

    /// Context settings. An invalid budget falls back to the default.
    pub fn to_context_config(&self) -> ContextConfig {
        ContextConfig {
            budget: ContextBudget::parse(&self.context.budget).unwrap_or_default(),
            model_window_chars: self.context.model_window_chars,
            related_top_k: self.context.related_top_k,
            max_excerpt_chars: self.context.max_excerpt_chars,
        }
    }

    pub fn to_generator_config(&self, working_dir: &Path) -> GeneratorConfig {
        GeneratorConfig {
            command: self.generator.command.clone(),
            args: self.generator.args.clone(),
            timeout: Duration::from_secs(self.generator.timeout_secs),
            working_dir: Some(working_dir.to_path_buf()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = StagegateToml::parse("").unwrap();
        assert_eq!(config.reviews.max_concurrent_reviews, 100);
        assert_eq!(config.reviews.timeout_secs, 86_400);
        assert_eq!(config.reviews.valid_pipeline_stages.len(), 4);
        assert_eq!(config.context.budget, "40%");
        assert_eq!(config.generator.command, "claude");
        assert_eq!(config.server.port, 3141);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = StagegateToml::parse(
            r#"
[reviews]
timeout_secs = 60

[context]
budget = "8000"
"#,
        )
        .unwrap();
        assert_eq!(config.reviews.timeout_secs, 60);
        assert_eq!(config.reviews.max_content_length, 100_000);
        assert_eq!(config.to_context_config().budget_chars(), 8000);
        assert_eq!(config.to_review_config().timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let config = StagegateToml::parse(
            r#"
[reviews]
timeout_secs = 0
valid_pipeline_stages = []

[context]
budget = "lots"
"#,
        )
        .unwrap();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("timeout_secs")));
        assert!(warnings.iter().any(|w| w.contains("valid_pipeline_stages")));
        assert!(warnings.iter().any(|w| w.contains("context.budget")));
        assert_eq!(config.to_context_config().budget, ContextBudget::default());
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(StagegateToml::parse("[reviews\n").is_err());
    }

    #[test]
    fn test_overrides_layer_over_file() {
        let mut config = StagegateToml::default();
        let env = HashMap::from([
            (ENV_GENERATOR_CMD, "my-model".to_string()),
            (ENV_REVIEW_TIMEOUT_SECS, "120".to_string()),
        ]);
        config.apply_overrides(|key| env.get(key).cloned());
        assert_eq!(config.generator.command, "my-model");
        assert_eq!(config.reviews.timeout_secs, 120);

        let mut untouched = StagegateToml::default();
        untouched.apply_overrides(|key| {
            (key == ENV_REVIEW_TIMEOUT_SECS).then(|| "soon".to_string())
        });
        assert_eq!(untouched.reviews.timeout_secs, 86_400);
    }

    #[test]
    fn test_save_and_load_or_default() {
        let dir = tempdir().unwrap();
        assert_eq!(
            StagegateToml::load_or_default(dir.path()).unwrap().server.port,
            3141
        );

        let mut config = StagegateToml::default();
        config.server.port = 8080;
        config.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = StagegateToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.server.port, 8080);
    }

    #[test]
    fn test_zero_sweep_interval_is_clamped() {
        let mut config = StagegateToml::default();
        config.reviews.sweep_interval_secs = 0;
        assert_eq!(config.to_review_config().sweep_interval, Duration::from_secs(1));
        assert!(!config.validate().is_empty());
    }
}
