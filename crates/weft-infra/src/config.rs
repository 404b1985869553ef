//! Engine configuration loader for weft.
//!
//! Reads `config.toml` from the data directory (`~/.weft/` unless
//! `WEFT_DATA_DIR` is set) and deserializes it into [`EngineConfig`]. Falls
//! back to defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use weft_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "WEFT_DATA_DIR";

/// Data directory: `WEFT_DATA_DIR`, else `~/.weft`, else `./.weft`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".weft"),
    }
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config, with `max_parallelism` and
///   `event_capacity` raised to at least 1.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(mut config) => {
            if config.max_parallelism == 0 {
                tracing::warn!("max_parallelism = 0 in {}, using 1", config_path.display());
                config.max_parallelism = 1;
            }
            config.event_capacity = config.event_capacity.max(1);
            config
        }
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use weft_types::workflow::SkipPolicy;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
max_parallelism = 16
fail_fast = false
skip_policy = "propagate"
default_task_timeout_ms = 600000
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_parallelism, 16);
        assert!(!config.fail_fast);
        assert_eq!(config.skip_policy, SkipPolicy::Propagate);
        assert_eq!(config.default_task_timeout_ms, Some(600_000));
        assert_eq!(config.event_capacity, 1024);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_clamps_zero_parallelism() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "max_parallelism = 0\nevent_capacity = 0\n")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_parallelism, 1);
        assert_eq!(config.event_capacity, 1);
    }

    #[test]
    fn default_data_dir_ends_with_weft() {
        if std::env::var_os(DATA_DIR_ENV).is_none() {
            assert!(default_data_dir().ends_with(".weft"));
        }
    }
}
