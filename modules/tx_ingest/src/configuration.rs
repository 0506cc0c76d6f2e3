use std::time::Duration;

use anyhow::Result;
use config::Config;

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TxIngestConfig {
    pub contract_queue_capacity: usize,
    pub contract_drain_interval: u64,
    pub contract_drain_batch: usize,
    pub validation_workers: usize,
    pub validation_queue_capacity: usize,
    pub recent_cache_capacity: usize,
    pub recent_cache_expiry: u64,
}

impl TxIngestConfig {
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

    pub fn contract_drain_interval(&self) -> Duration {
        Duration::from_millis(self.contract_drain_interval)
    }

    pub fn recent_cache_expiry(&self) -> Duration {
        Duration::from_secs(self.recent_cache_expiry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load() {
        let config = TxIngestConfig::try_load(&Config::default()).unwrap();
        assert_eq!(config.contract_queue_capacity, 1000);
        assert_eq!(config.contract_drain_interval(), Duration::from_millis(100));
        assert_eq!(config.validation_workers, 4);
        assert_eq!(config.validation_queue_capacity, 1000);
    }

    #[test]
    fn overrides_apply() {
        let overrides = Config::builder()
            .set_override("contract-queue-capacity", 2)
            .unwrap()
            .build()
            .unwrap();
        let config = TxIngestConfig::try_load(&overrides).unwrap();
        assert_eq!(config.contract_queue_capacity, 2);
        assert_eq!(config.contract_drain_batch, 10);
    }
}
