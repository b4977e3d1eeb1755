pub mod defaults;
pub mod merge;
pub mod schema;

pub use schema::*;

use crate::cli::Cli;
use crate::error::ConfigError;
use crate::worker::capabilities::CAPABILITY_NAMES;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Load configuration by merging global, workspace, explicit-file and CLI sources.
/// Precedence: CLI > `--config` file > workspace config > global config > defaults.
///
/// Missing or malformed auto-discovered files are logged and skipped; a file
/// named with `--config` must exist and parse.
pub fn load_config(cli: &Cli) -> Result<AppConfig, ConfigError> {
    // Layer 1: Global config (~/.config/federation/federation.toml or platform equivalent)
    let global = load_global_config();

    // Layer 2: Explicit config file from --config
    let explicit = match &cli.config {
        Some(path) => load_explicit_config(path)?,
        None => PartialConfig::default(),
    };

    // Determine the workspace path to find the workspace config.
    let workspace_path = cli
        .workspace
        .clone()
        .or_else(|| explicit.workspace.clone())
        .or_else(|| global.workspace.clone())
        .unwrap_or_else(|| PathBuf::from("./workspace"));

    // Layer 3: Workspace config (workspace/federation.toml)
    let workspace = load_workspace_config(&workspace_path);

    // Layer 4: CLI args
    let cli_partial = cli_to_partial(cli);

    let config = cli_partial
        .with_fallback(explicit)
        .with_fallback(workspace)
        .with_fallback(global)
        .finalize();

    validate_templates(&config)?;
    Ok(config)
}

/// Load global config from the platform-specific config directory.
fn load_global_config() -> PartialConfig {
    match global_config_path() {
        Some(p) => load_toml_file(&p).unwrap_or_default(),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    }
}

/// Load workspace config from workspace/federation.toml.
fn load_workspace_config(workspace_path: &Path) -> PartialConfig {
    load_toml_file(&workspace_path.join("federation.toml")).unwrap_or_default()
}

fn load_explicit_config(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let partial = parse_config(&contents, path)?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(partial)
}

/// Parse TOML config text into a mergeable layer.
pub fn parse_config(contents: &str, path: &Path) -> Result<PartialConfig, ConfigError> {
    toml::from_str::<ConfigFile>(contents)
        .map(ConfigFile::to_partial)
        .map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Load and parse an auto-discovered TOML config file.
/// Returns `None` on file-not-found; other problems are logged.
fn load_toml_file(path: &Path) -> Option<PartialConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match parse_config(&contents, path) {
            Ok(partial) => {
                tracing::info!("Loaded config from {}", path.display());
                Some(partial)
            }
            Err(e) => {
                tracing::warn!("Config parse error: {}", e);
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("Failed to read config at {}: {}", path.display(), e);
            None
        }
    }
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/federation/federation.toml
/// macOS: ~/Library/Application Support/federation/federation.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "federation")
        .map(|dirs| dirs.config_dir().join("federation.toml"))
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    PartialConfig {
        model: cli.model.clone(),
        workspace: cli.workspace.clone(),
        max_master_iterations: cli.max_iterations,
        ..Default::default()
    }
}

/// Template names must be unique and non-empty, and only known
/// capabilities may be listed.
pub fn validate_templates(config: &AppConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for template in &config.templates {
        if template.name.trim().is_empty() {
            return Err(ConfigError::InvalidTemplate {
                name: template.name.clone(),
                message: "name must not be empty".to_string(),
            });
        }
        if !seen.insert(template.name.as_str()) {
            return Err(ConfigError::InvalidTemplate {
                name: template.name.clone(),
                message: "defined more than once".to_string(),
            });
        }
        if let Some(unknown) = template
            .tools
            .iter()
            .find(|t| !CAPABILITY_NAMES.contains(&t.as_str()))
        {
            return Err(ConfigError::InvalidTemplate {
                name: template.name.clone(),
                message: format!("unknown tool '{unknown}'"),
            });
        }
    }
    Ok(())
}
