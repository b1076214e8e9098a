use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::schema::LivewireConfig;

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["livewire.toml", "livewire.json"];

/// Load config from the given path (TOML or JSON, picked by extension).
pub fn load_config(path: &Path) -> anyhow::Result<LivewireConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./livewire.{toml,json}`
/// 2. `~/.config/livewire/livewire.{toml,json}`
///
/// Falls back to `LivewireConfig::default()` when nothing is found or the
/// file fails to parse.
pub fn discover_and_load() -> LivewireConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    LivewireConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let config_dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| config_dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/livewire/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "livewire").map(|d| d.config_dir().to_path_buf())
}

/// Render a config as pretty TOML.
pub fn to_toml(config: &LivewireConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<LivewireConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
