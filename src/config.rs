//! Runner configuration.
//!
//! Loaded from YAML or TOML, chosen by file extension. Every field has a
//! default so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Build argument that disables testing when set to a true value.
pub const SKIP_TESTS_BUILD_ARG: &str = "build-arg:PKGCHECK_SKIP_TESTS";

/// Default name of the source that provides the dispatcher executable.
pub const DEFAULT_DISPATCHER_SOURCE: &str = "pkgcheck-frontend";

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported file format: {0} (expected .yaml, .yml, or .toml)")]
    UnsupportedFormat(String),
    #[error("invalid value {value:?} for {key}: expected a boolean")]
    BuildArg { key: String, value: String },
}

/// What to do when the artifact under test cannot be built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokenArtifactPolicy {
    /// Report the build failure and run nothing.
    #[default]
    Fail,
    /// Hand the artifact back untested.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Build target the tests belong to; prefixes progress groups.
    pub target: String,
    pub skip_tests: bool,
    pub on_broken_artifact: BrokenArtifactPolicy,
    /// Name of the source holding the dispatcher executable.
    pub dispatcher_source: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            skip_tests: false,
            on_broken_artifact: BrokenArtifactPolicy::default(),
            dispatcher_source: DEFAULT_DISPATCHER_SOURCE.to_string(),
        }
    }
}

impl RunnerConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let contents = std::fs::read_to_string(path)?;

        match ext {
            "yaml" | "yml" => {
                // serde_yaml reads an empty document as null
                if contents.trim().is_empty() {
                    return Ok(Self::default());
                }
                Ok(serde_yaml::from_str(&contents)?)
            }
            "toml" => Ok(toml::from_str(&contents)?),
            other => Err(LoadError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Apply overrides passed as build arguments.
    ///
    /// An empty value counts as unset.
    pub fn apply_build_args(&mut self, args: &BTreeMap<String, String>) -> Result<(), LoadError> {
        if let Some(value) = args.get(SKIP_TESTS_BUILD_ARG).filter(|v| !v.is_empty()) {
            self.skip_tests = parse_bool(value).ok_or_else(|| LoadError::BuildArg {
                key: SKIP_TESTS_BUILD_ARG.to_string(),
                value: value.clone(),
            })?;
        }
        Ok(())
    }

    /// Label for the progress group of a test.
    pub fn group_for(&self, test: &str) -> String {
        if self.target.is_empty() {
            format!("Test: {test}")
        } else {
            format!("Test: {}/{test}", self.target)
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
