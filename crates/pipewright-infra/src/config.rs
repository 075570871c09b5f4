//! Engine configuration loader.
//!
//! Reads `pipewright.toml` from the data directory (`~/.pipewright/` in
//! production) into [`EngineConfig`]. `load_config` is lenient and falls back
//! to defaults; `read_config` is strict and is what `pwr config validate`
//! uses.

use std::path::{Path, PathBuf};

use pipewright_types::config::{ConfigError, EngineConfig};

pub const CONFIG_FILE: &str = "pipewright.toml";

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Load and validate `{data_dir}/pipewright.toml`.
///
/// A missing file yields the defaults. An unreadable, malformed or invalid
/// file is an error.
pub async fn read_config(data_dir: &Path) -> Result<EngineConfig, ConfigError> {
    let path = config_path(data_dir);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", path.display());
            return Ok(EngineConfig::default());
        }
        Err(err) => return Err(ConfigError::Io(format!("{}: {err}", path.display()))),
    };

    let config: EngineConfig =
        toml::from_str(&content).map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Like [`read_config`], but logs a warning and returns the defaults instead
/// of failing.
pub async fn load_config(data_dir: &Path) -> EngineConfig {
    match read_config(data_dir).await {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            EngineConfig::default()
        }
    }
}

/// Directory holding graph files. Relative `graphs_dir` values are resolved
/// against the data directory.
pub fn graphs_dir(data_dir: &Path, config: &EngineConfig) -> PathBuf {
    let dir = Path::new(&config.engine.graphs_dir);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        data_dir.join(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = read_config(tmp.path()).await.unwrap();
        assert_eq!(config.defaults.max_iterations, 3);
        assert!(config.tenants.is_empty());
    }

    #[tokio::test]
    async fn valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            config_path(tmp.path()),
            r#"
[engine]
default_unit_cost = 0.5

[tenants.acme]
max_iterations = 4
resource_budget = 20.0

[[units]]
name = "echo"
kind = "echo"
"#,
        )
        .await
        .unwrap();

        let config = read_config(tmp.path()).await.unwrap();
        assert_eq!(config.engine.default_unit_cost, 0.5);
        assert_eq!(config.tenant_config("acme").max_iterations, 4);
        assert_eq!(config.tenant_config("acme").resource_budget, 20.0);
        assert_eq!(config.units.len(), 1);
    }

    #[tokio::test]
    async fn malformed_toml_is_strict_error_but_lenient_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(config_path(tmp.path()), "this is not { valid toml !!!")
            .await
            .unwrap();

        assert!(matches!(read_config(tmp.path()).await, Err(ConfigError::Parse(_))));
        let config = load_config(tmp.path()).await;
        assert_eq!(config.defaults.max_iterations, 3);
    }

    #[tokio::test]
    async fn out_of_bounds_values_are_rejected() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(config_path(tmp.path()), "[tenants.acme]\nquality_threshold = 150.0\n")
            .await
            .unwrap();

        let err = read_config(tmp.path()).await.unwrap_err();
        assert!(err.to_string().contains("quality_threshold"));
        assert!(err.to_string().contains("acme"));
    }

    #[test]
    fn relative_graphs_dir_is_under_data_dir() {
        let mut config = EngineConfig::default();
        assert_eq!(graphs_dir(Path::new("/data"), &config), PathBuf::from("/data/graphs"));
        config.engine.graphs_dir = "/etc/pipewright/graphs".to_string();
        assert_eq!(
            graphs_dir(Path::new("/data"), &config),
            PathBuf::from("/etc/pipewright/graphs")
        );
    }
}
