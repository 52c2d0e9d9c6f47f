use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// Settings for a [`Runtime`](crate::Runtime).
///
/// ```rust
/// use nagare::Config;
///
/// let config = Config::from_json(r#"{ "max_tasks": 1000 }"#).unwrap();
/// assert!(config.verify_lineage);
/// assert_eq!(config.max_tasks, Some(1000));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Check that every new use continues the lineage of the one it derives
    /// from.
    pub verify_lineage: bool,
    /// Merge repeated captures of one handle by the same task instead of
    /// failing.
    pub allow_aliasing: bool,
    /// Abort once this many tasks have run.
    pub max_tasks: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verify_lineage: true,
            allow_aliasing: false,
            max_tasks: None,
        }
    }
}

impl Config {
    pub fn from_json(source: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn max_tasks(mut self, limit: usize) -> Self {
        self.max_tasks = Some(limit);
        self
    }

    pub fn allow_aliasing(mut self, allow: bool) -> Self {
        self.allow_aliasing = allow;
        self
    }
}
