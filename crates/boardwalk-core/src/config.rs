use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BoardwalkError, Result};

/// Top-level Boardwalk configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub harness: HarnessConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Which lifecycle events nested graphs report.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Diagnostics {
    /// Every frame reports every event.
    #[default]
    All,
    /// Nested frames only report input, secret, output, pause, resume, and error.
    Top,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub diagnostics: Diagnostics,
    /// End the run after the top-level graph produces its first output.
    #[serde(default)]
    pub stop_on_output: bool,
    /// Maximum traversal steps per run (0 = unlimited).
    #[serde(default)]
    pub max_steps: usize,
    /// Capacity of the broadcast channel used for observers.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            diagnostics: Diagnostics::default(),
            stop_on_output: false,
            max_steps: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Directory relative board paths resolve against. Default: current directory.
    #[serde(default)]
    pub base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory for JSONL run logs.
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// 1 = graph boundaries, outputs, and errors; 2 = per node; 3 = every event.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_level() -> u8 {
    1
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| BoardwalkError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| BoardwalkError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.harness.event_capacity == 0 {
            return Err(BoardwalkError::Config(
                "harness.event_capacity must be greater than zero".into(),
            ));
        }
        if let Some(log) = &self.log {
            if !(1..=3).contains(&log.level) {
                return Err(BoardwalkError::Config(format!(
                    "log.level must be 1, 2, or 3 (got {})",
                    log.level
                )));
            }
        }
        Ok(())
    }

    /// Resolve the loader base directory (expand ~).
    pub fn loader_base(&self) -> Option<PathBuf> {
        let base = self.loader.base.as_deref()?;
        if let Some(rest) = base.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return Some(home.join(rest));
            }
        }
        Some(PathBuf::from(base))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
