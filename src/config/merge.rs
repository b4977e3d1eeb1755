use super::defaults::default_templates;
use super::schema::{AppConfig, PartialConfig};
use std::path::PathBuf;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For templates: REPLACE semantics (if self has Some, use it entirely).
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            model: self.model.or(fallback.model),
            workspace: self.workspace.or(fallback.workspace),
            max_master_iterations: self.max_master_iterations.or(fallback.max_master_iterations),
            max_worker_iterations: self.max_worker_iterations.or(fallback.max_worker_iterations),
            max_chain_depth: self.max_chain_depth.or(fallback.max_chain_depth),
            worker_timeout_secs: self.worker_timeout_secs.or(fallback.worker_timeout_secs),
            turn_timeout_secs: self.turn_timeout_secs.or(fallback.turn_timeout_secs),
            event_feed_capacity: self.event_feed_capacity.or(fallback.event_feed_capacity),
            templates: self.templates.or(fallback.templates),
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        AppConfig {
            model: self
                .model
                .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
            workspace: self
                .workspace
                .unwrap_or_else(|| PathBuf::from("./workspace")),
            max_master_iterations: self.max_master_iterations.unwrap_or(25).max(1),
            max_worker_iterations: self.max_worker_iterations.unwrap_or(20).max(1),
            max_chain_depth: self.max_chain_depth.unwrap_or(8).max(1),
            worker_timeout_secs: self.worker_timeout_secs.unwrap_or(600),
            turn_timeout_secs: self.turn_timeout_secs.unwrap_or(0),
            event_feed_capacity: self.event_feed_capacity.unwrap_or(500).max(1),
            templates: self.templates.unwrap_or_else(default_templates),
        }
    }
}
