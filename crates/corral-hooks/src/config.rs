//! Pipeline configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings shared by the built-in hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seconds to wait for the working-copy lock.
    pub lock_timeout_secs: u64,

    /// Author name on pipeline commits.
    pub commit_author_name: String,

    /// Author email on pipeline commits.
    pub commit_author_email: String,

    /// Names of built-in hooks left out of [`crate::Pipeline::standard`].
    pub disabled: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 15,
            commit_author_name: "corral".to_owned(),
            commit_author_email: "corral@example.invalid".to_owned(),
            disabled: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Lock wait as a [`Duration`].
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Check if a specific hook is enabled
    #[must_use]
    pub fn is_hook_enabled(&self, hook_name: &str) -> bool {
        !self.disabled.iter().any(|name| name == hook_name)
    }
}
