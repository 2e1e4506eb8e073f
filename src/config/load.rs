//! Config file loading and initialization.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("backchannel")
        .join("config.toml")
}

/// Load the user config, or defaults when none exists.
pub fn load() -> Result<Config, ConfigError> {
    let path = config_path();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
}

/// Load the user config, writing the defaults on first run.
pub fn load_or_init() -> Config {
    let path = config_path();
    let had_config = path.exists();

    let config = match load() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("config load failed, using defaults: {err}");
            Config::default()
        }
    };

    if !had_config
        && let Err(err) = write_config(&path, &config)
    {
        tracing::warn!("failed to write default config: {err}");
    }

    config
}

pub fn write_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let write_error = |reason: String| ConfigError::Write {
        path: path.to_path_buf(),
        reason,
    };

    let dir = path
        .parent()
        .ok_or_else(|| write_error("config path has no parent directory".to_string()))?;
    fs::create_dir_all(dir).map_err(|err| write_error(err.to_string()))?;

    let contents =
        toml::to_string_pretty(config).map_err(|err| write_error(err.to_string()))?;

    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|err| write_error(err.to_string()))?;
    fs::write(temp.path(), contents.as_bytes()).map_err(|err| write_error(err.to_string()))?;
    temp.persist(path).map_err(|err| write_error(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.broker.port = 9200;
        write_config(&path, &config).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let parsed: Config = toml::from_str(&contents).unwrap();
        assert_eq!(parsed.broker.port, 9200);
    }
}
