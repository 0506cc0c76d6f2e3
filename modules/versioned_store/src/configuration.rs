use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use config::Config;

use crate::stores::{fjall::FjallDurableStore, memory::MemoryDurableStore, DurableStore};

#[derive(Clone, Copy, Debug, Default, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    #[default]
    Fjall,
    Memory,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_path: PathBuf,
    pub clear_on_start: bool,
}

impl StoreConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    /// Open the configured durable floor
    pub fn open(&self) -> Result<Arc<dyn DurableStore>> {
        Ok(match self.backend {
            StoreBackend::Fjall => {
                Arc::new(FjallDurableStore::new(&self.database_path, self.clear_on_start)?)
            }
            StoreBackend::Memory => Arc::new(MemoryDurableStore::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_fjall() {
        let config = StoreConfig::try_load(&Config::default()).unwrap();
        assert_eq!(config.backend, StoreBackend::Fjall);
        assert!(config.clear_on_start);
    }

    #[test]
    fn caller_overrides_defaults() {
        let overrides = Config::builder()
            .set_override("backend", "memory")
            .unwrap()
            .set_override("clear-on-start", false)
            .unwrap()
            .build()
            .unwrap();
        let config = StoreConfig::try_load(&overrides).unwrap();
        assert_eq!(config.backend, StoreBackend::Memory);
        assert!(!config.clear_on_start);
    }
}
