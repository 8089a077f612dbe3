//! Configuration and path resolution for the CLI.
//!
//! Settings come from an optional TOML file:
//! - `--config <file>` when given (must exist)
//! - otherwise `tessera.toml` in the data directory, if present
//! - otherwise built-in defaults
//!
//! ```toml
//! [engine]
//! workers = 8
//!
//! [vector]
//! dimension = 384
//! distance = "cosine"
//! ```

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tessera_core::{EngineConfig, TextIndexConfig, VectorIndexConfig};

/// Config file looked up in the data directory.
const CONFIG_FILENAME: &str = "tessera.toml";

/// SQLite database holding the text index.
const TEXT_DB_FILENAME: &str = "text.db";

/// redb database holding the vector graph.
const VECTOR_DB_FILENAME: &str = "vectors.redb";

/// Everything needed to open an engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub engine: EngineConfig,
    pub text: TextIndexConfig,
    pub vector: VectorIndexConfig,
}

impl CliConfig {
    /// Loads `explicit` if given, else `tessera.toml` under `data_dir`, else
    /// defaults.
    pub fn load(explicit: Option<&Path>, data_dir: &Path) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = data_dir.join(CONFIG_FILENAME);
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.engine.validate()?;
        config.text.validate()?;
        config.vector.validate()?;
        Ok(config)
    }
}

/// Returns the data directory.
///
/// - Linux: `~/.local/share/tessera/`
/// - macOS: `~/Library/Application Support/dev.tessera.Tessera/`
/// - Windows: `%APPDATA%\tessera\Tessera\data\`
pub fn get_data_dir(custom_dir: Option<&PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = custom_dir {
        return Ok(dir.clone());
    }

    ProjectDirs::from("dev", "tessera", "Tessera")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| anyhow!("Could not determine data directory"))
}

pub fn text_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(TEXT_DB_FILENAME)
}

pub fn vector_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(VECTOR_DB_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tessera_core::DistanceType;

    #[test]
    fn test_custom_data_dir() {
        let custom = PathBuf::from("/tmp/custom-data");
        let dir = get_data_dir(Some(&custom)).unwrap();
        assert_eq!(dir, custom);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::load(None, dir.path()).unwrap();
        assert_eq!(config, CliConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = CliConfig::parse(
            r#"
            [engine]
            workers = 2

            [vector]
            dimension = 3
            distance = "l2"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.engine.queue_size, EngineConfig::default().queue_size);
        assert_eq!(config.vector.dimension, 3);
        assert_eq!(config.vector.distance, DistanceType::L2);
        assert_eq!(config.text, TextIndexConfig::default());
    }

    #[test]
    fn test_data_dir_file_is_picked_up() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            "[text]\ntable_prefix = \"docs\"\n",
        )
        .unwrap();
        let config = CliConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.text.table_prefix, "docs");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(CliConfig::parse("[engine]\nworkers = 0\n").is_err());
        assert!(CliConfig::parse("[text]\ntable_prefix = \"x; DROP\"\n").is_err());
        assert!(CliConfig::parse("[vector]\ndistance = \"manhattan\"\n").is_err());
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(CliConfig::load(Some(&missing), dir.path()).is_err());
    }
}
