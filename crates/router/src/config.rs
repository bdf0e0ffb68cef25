//! Router configuration.

use protocol::TransportError;
use serde::{Deserialize, Serialize};

/// Message fragment treated as a benign exit-stream failure by default.
pub const DEFAULT_BENIGN_EXIT_ERROR: &str = "not found";

/// Tunables for a [`SessionRouter`](crate::SessionRouter).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouterConfig {
    /// Case-insensitive message fragments that mark an exit-stream error as
    /// expected (the host already cleaned the session up). Matching errors
    /// are logged at debug level instead of as warnings.
    pub benign_exit_errors: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            benign_exit_errors: vec![DEFAULT_BENIGN_EXIT_ERROR.to_string()],
        }
    }
}

impl RouterConfig {
    /// Returns whether an exit-stream error should be tolerated silently.
    pub fn is_benign_exit_error(&self, error: &TransportError) -> bool {
        if error.is_not_found() {
            return true;
        }
        let message = error.to_string().to_lowercase();
        self.benign_exit_errors
            .iter()
            .filter(|pattern| !pattern.is_empty())
            .any(|pattern| message.contains(&pattern.to_lowercase()))
    }
}
