use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::HeraldConfig};

const CONFIG_STEM: &str = "herald";

/// Supported config formats, in discovery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Yaml,
    Yml,
    Json,
}

impl Format {
    const ALL: [Self; 4] = [Self::Toml, Self::Yaml, Self::Yml, Self::Json];

    fn extension(self) -> &'static str {
        match self {
            Self::Toml => "toml",
            Self::Yaml => "yaml",
            Self::Yml => "yml",
            Self::Json => "json",
        }
    }

    fn of(path: &Path) -> anyhow::Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        Self::ALL
            .into_iter()
            .find(|f| f.extension() == ext)
            .ok_or_else(|| anyhow::anyhow!("unsupported config format: .{ext}"))
    }

    fn parse(self, raw: &str) -> anyhow::Result<HeraldConfig> {
        Ok(match self {
            Self::Toml => toml::from_str(raw)?,
            Self::Yaml | Self::Yml => serde_yaml::from_str(raw)?,
            Self::Json => serde_json::from_str(raw)?,
        })
    }
}

static DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

fn dir_override() -> MutexGuard<'static, Option<PathBuf>> {
    DIR_OVERRIDE.lock().unwrap_or_else(|p| p.into_inner())
}

/// Pin discovery (and default writes) to `path`. Used by tests.
pub fn set_config_dir(path: PathBuf) {
    *dir_override() = Some(path);
}

pub fn clear_config_dir() {
    *dir_override() = None;
}

/// Read, substitute and parse one config file, then apply environment overrides.
pub fn load_config(path: &Path) -> anyhow::Result<HeraldConfig> {
    let format = Format::of(path)?;
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let mut config = format.parse(&substitute_env(&raw))?;
    config.whatsapp.apply_env_overrides();
    Ok(config)
}

/// Load the first config found in the working directory, then in
/// `~/.config/herald/`. With an override set only that directory is searched.
///
/// Missing or unreadable files fall back to defaults; a missing file also
/// gets the defaults written to the user config directory.
pub fn discover_and_load() -> HeraldConfig {
    let found = search_dirs().iter().find_map(|dir| find_in(dir));
    let Some(path) = found else {
        let mut config = HeraldConfig::default();
        if let Err(e) = write_defaults(&config) {
            warn!(error = %e, "could not write default config");
        }
        config.whatsapp.apply_env_overrides();
        return config;
    };

    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "invalid config, using defaults");
        let mut config = HeraldConfig::default();
        config.whatsapp.apply_env_overrides();
        config
    })
}

fn search_dirs() -> Vec<PathBuf> {
    if let Some(dir) = dir_override().clone() {
        return vec![dir];
    }
    let mut dirs = vec![PathBuf::from(".")];
    dirs.extend(user_config_dir());
    dirs
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    Format::ALL
        .into_iter()
        .map(|f| dir.join(format!("{CONFIG_STEM}.{}", f.extension())))
        .find(|p| p.is_file())
}

fn user_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join(CONFIG_STEM))
}

/// The directory defaults are written to: the override, else `~/.config/herald/`.
pub fn config_dir() -> Option<PathBuf> {
    dir_override().clone().or_else(user_config_dir)
}

/// Default credential store location, `~/.herald/`.
pub fn data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".herald"))
        .unwrap_or_else(|| PathBuf::from(".herald"))
}

fn write_defaults(config: &HeraldConfig) -> anyhow::Result<()> {
    let dir = config_dir().unwrap_or_else(|| PathBuf::from("."));
    let path = dir.join(format!("{CONFIG_STEM}.toml"));
    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(&dir)?;
    std::fs::write(&path, toml::to_string_pretty(config)?)?;
    debug!(path = %path.display(), "wrote default config");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn loads_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("herald.toml");
        std::fs::write(&toml_path, "[bridge]\nurl = \"ws://a\"\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().bridge.url, "ws://a");

        let yaml_path = dir.path().join("herald.yaml");
        std::fs::write(&yaml_path, "conversation:\n  idle_timeout_secs: 9\n").unwrap();
        assert_eq!(
            load_config(&yaml_path).unwrap().conversation.idle_timeout_secs,
            9
        );

        let json_path = dir.path().join("herald.json");
        std::fs::write(&json_path, r#"{"whatsapp":{"pairing_timeout_secs":5}}"#).unwrap();
        assert_eq!(
            load_config(&json_path).unwrap().whatsapp.pairing_timeout_secs,
            5
        );
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herald.ini");
        std::fs::write(&path, "").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn override_dir_writes_defaults_then_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        set_config_dir(dir.path().to_path_buf());

        let first = discover_and_load();
        assert_eq!(first.whatsapp.event_queue_capacity, 256);
        assert!(dir.path().join("herald.toml").exists());

        std::fs::write(
            dir.path().join("herald.toml"),
            "[conversation]\nauto_reply = \"thanks\"\n",
        )
        .unwrap();
        assert_eq!(discover_and_load().conversation.auto_reply, "thanks");

        clear_config_dir();
    }
}
