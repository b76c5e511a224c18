//! Configuration resolution for chanmux.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/chanmux/settings.json)
//! 3. Explicit config file supplied by the caller
//! 4. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::map::Entry;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete chanmux configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub muxer: MuxerSettings,
    #[serde(default)]
    pub demuxer: DemuxerSettings,
    #[serde(default)]
    pub log: LogSettings,
}

/// Muxer actor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MuxerSettings {
    /// Capacity of the actor's command channel.
    pub command_capacity: usize,
}

impl Default for MuxerSettings {
    fn default() -> Self {
        Self {
            command_capacity: 16,
        }
    }
}

/// Demuxer actor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DemuxerSettings {
    /// Capacity of the actor's command channel.
    pub command_capacity: usize,
    /// Capacity of outputs the demuxer creates itself.
    pub output_capacity: usize,
    /// What to do with bundles whose identifier has no registered output.
    pub unregistered: UnregisteredPolicy,
}

impl Default for DemuxerSettings {
    fn default() -> Self {
        Self {
            command_capacity: 16,
            output_capacity: 1,
            unregistered: UnregisteredPolicy::Drop,
        }
    }
}

/// Handling of bundles that arrive before (or without) a demux registration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UnregisteredPolicy {
    /// Discard the bundle and log it.
    #[default]
    Drop,
    /// Keep up to `per_stream` bundles for each of at most `max_streams`
    /// unregistered identifiers, replaying them when a registration arrives.
    ///
    /// Bundles past `per_stream` are dropped. A bundle for a new identifier
    /// when `max_streams` backlogs are already held evicts the oldest backlog,
    /// whose bundles count as dropped.
    Hold {
        per_stream: usize,
        max_streams: usize,
    },
}

/// Logging settings consumed by binaries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Identifier cap used when `CHANMUX_HOLD_UNREGISTERED` enables holding.
const DEFAULT_HOLD_MAX_STREAMS: usize = 64;

/// Keys whose values replace the layer below instead of merging into it.
const REPLACED_WHOLE: &[&str] = &["unregistered"];

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let global = global_config_path().filter(|path| path.exists());
    let mut config = load_layered(global.as_deref(), explicit)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Merge the `global` file and then the `explicit` file over the defaults.
///
/// Each file only overrides the keys it sets. Both paths must exist.
pub fn load_layered(global: Option<&Path>, explicit: Option<&Path>) -> Result<Config> {
    let mut merged = Value::Object(serde_json::Map::new());
    for path in global.into_iter().chain(explicit) {
        let layer = load_config_file(path)?;
        merge_config(&mut merged, layer);
    }

    let config: Config = serde_json::from_value(merged)?;
    validate(&config)?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".chanmux").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/chanmux/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("chanmux").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    let layer: Value = serde_json::from_str(&content)?;
    if !layer.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must hold a JSON object",
            path.display()
        )));
    }
    Ok(layer)
}

fn validate(config: &Config) -> Result<()> {
    if config.muxer.command_capacity == 0 || config.demuxer.command_capacity == 0 {
        return Err(Error::Config("command_capacity must be at least 1".into()));
    }
    if config.demuxer.output_capacity == 0 {
        return Err(Error::Config("output_capacity must be at least 1".into()));
    }
    Ok(())
}

fn merge_config(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                if REPLACED_WHOLE.contains(&key.as_str()) {
                    base.insert(key, value);
                    continue;
                }
                match base.entry(key) {
                    Entry::Occupied(mut slot) => merge_config(slot.get_mut(), value),
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `CHANMUX_*` overrides read through `lookup`.
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("CHANMUX_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(val) = lookup("CHANMUX_LOG_JSON")
        && let Ok(json) = val.parse()
    {
        config.log.json = json;
    }
    if let Some(val) = lookup("CHANMUX_OUTPUT_CAPACITY")
        && let Ok(n) = val.parse::<usize>()
        && n > 0
    {
        config.demuxer.output_capacity = n;
    }
    if let Some(val) = lookup("CHANMUX_HOLD_UNREGISTERED")
        && let Ok(per_stream) = val.parse::<usize>()
    {
        config.demuxer.unregistered = if per_stream == 0 {
            UnregisteredPolicy::Drop
        } else {
            UnregisteredPolicy::Hold {
                per_stream,
                max_streams: DEFAULT_HOLD_MAX_STREAMS,
            }
        };
    }
}
