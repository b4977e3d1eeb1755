use serde::Deserialize;
use std::path::PathBuf;

use crate::orchestration::types::WorkerConfig;

/// The TOML file structure for federation.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub general: Option<GeneralConfig>,
    pub limits: Option<LimitsConfig>,
    /// If specified, fully replaces the built-in worker templates.
    pub templates: Option<Vec<TemplateEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub model: Option<String>,
    pub workspace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    pub max_master_iterations: Option<usize>,
    pub max_worker_iterations: Option<usize>,
    pub max_chain_depth: Option<usize>,
    /// 0 disables the per-run timeout.
    pub worker_timeout_secs: Option<u64>,
    /// 0 disables the per-turn timeout.
    pub turn_timeout_secs: Option<u64>,
    pub event_feed_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateEntry {
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl TemplateEntry {
    pub fn into_worker_config(self) -> WorkerConfig {
        WorkerConfig {
            description: self
                .description
                .unwrap_or_else(|| format!("{} worker", self.name)),
            name: self.name,
            system_prompt: self.system_prompt,
            tools: self.tools,
        }
    }
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub workspace: PathBuf,
    pub max_master_iterations: usize,
    pub max_worker_iterations: usize,
    pub max_chain_depth: usize,
    pub worker_timeout_secs: u64,
    pub turn_timeout_secs: u64,
    pub event_feed_capacity: usize,
    pub templates: Vec<WorkerConfig>,
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub model: Option<String>,
    pub workspace: Option<PathBuf>,
    pub max_master_iterations: Option<usize>,
    pub max_worker_iterations: Option<usize>,
    pub max_chain_depth: Option<usize>,
    pub worker_timeout_secs: Option<u64>,
    pub turn_timeout_secs: Option<u64>,
    pub event_feed_capacity: Option<usize>,
    pub templates: Option<Vec<WorkerConfig>>,
}

impl ConfigFile {
    /// Flatten the file's sections into a mergeable layer.
    pub fn to_partial(self) -> PartialConfig {
        let general = self.general;
        let limits = self.limits;
        PartialConfig {
            model: general.as_ref().and_then(|g| g.model.clone()),
            workspace: general
                .as_ref()
                .and_then(|g| g.workspace.as_ref().map(PathBuf::from)),
            max_master_iterations: limits.as_ref().and_then(|l| l.max_master_iterations),
            max_worker_iterations: limits.as_ref().and_then(|l| l.max_worker_iterations),
            max_chain_depth: limits.as_ref().and_then(|l| l.max_chain_depth),
            worker_timeout_secs: limits.as_ref().and_then(|l| l.worker_timeout_secs),
            turn_timeout_secs: limits.as_ref().and_then(|l| l.turn_timeout_secs),
            event_feed_capacity: limits.as_ref().and_then(|l| l.event_feed_capacity),
            templates: self.templates.map(|entries| {
                entries
                    .into_iter()
                    .map(TemplateEntry::into_worker_config)
                    .collect()
            }),
        }
    }
}
