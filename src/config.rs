use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::pipeline::{NotFoundPolicy, PersistConfig};
use crate::strategy::PersistStrategy;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EavConfig {
    pub database: Option<String>,
    /// Type descriptor file used for on-demand structure synchronization
    pub types: Option<String>,
    pub strategy: Option<String>,
    pub not_found: Option<String>,
    pub bulk_timeout_secs: Option<u64>,
    pub max_depth: Option<usize>,
    pub permission_ttl_secs: Option<u64>,
}

impl EavConfig {
    /// Typed pipeline settings; unknown strategy or policy names are errors
    pub fn persist_config(&self) -> crate::Result<PersistConfig> {
        let defaults = PersistConfig::default();
        let strategy = match &self.strategy {
            Some(s) => s.parse::<PersistStrategy>()?,
            None => defaults.strategy,
        };
        let not_found = match &self.not_found {
            Some(s) => s.parse::<NotFoundPolicy>()?,
            None => defaults.not_found,
        };
        let max_depth = self.max_depth.unwrap_or(defaults.max_depth);
        if max_depth == 0 {
            return Err(crate::Error::Configuration("max_depth must be at least 1".to_string()));
        }

        Ok(PersistConfig {
            strategy,
            not_found,
            bulk_timeout: self.bulk_timeout_secs.map(Duration::from_secs).unwrap_or(defaults.bulk_timeout),
            max_depth,
            permission_ttl: self
                .permission_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.permission_ttl),
        })
    }

    /// Config written by `init`
    pub fn starter(database: &str) -> Self {
        let defaults = PersistConfig::default();
        Self {
            database: Some(database.to_string()),
            types: Some("types.json".to_string()),
            strategy: Some(defaults.strategy.to_string()),
            not_found: Some(defaults.not_found.to_string()),
            bulk_timeout_secs: Some(defaults.bulk_timeout.as_secs()),
            max_depth: Some(defaults.max_depth),
            permission_ttl_secs: Some(defaults.permission_ttl.as_secs()),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("eavstore.toml")
}

pub fn default_database_path_in(base: &Path) -> PathBuf {
    base.join("eavstore.db")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<EavConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: EavConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &EavConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
