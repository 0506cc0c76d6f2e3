use std::time::Duration;

use anyhow::Result;
use config::Config;

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    pub batch_size: usize,
    pub backlog_threshold: usize,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FetchConfig {
    pub timeout: u64,
    pub latency_window: usize,
    pub initial_estimate: u64,
    pub percentile: u8,
    pub preemption_factor: u32,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn initial_estimate(&self) -> Duration {
        Duration::from_millis(self.initial_estimate)
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceConfig {
    pub tick_interval: u64,
    pub event_queue_capacity: usize,
    pub outbound_buffer: usize,
    pub sync: SyncConfig,
    pub fetch: FetchConfig,
}

impl InterfaceConfig {
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

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load() {
        let config = InterfaceConfig::try_load(&Config::default()).unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
        assert_eq!(config.sync.batch_size, 2000);
        assert_eq!(config.fetch.timeout(), Duration::from_millis(500));
        assert_eq!(config.fetch.percentile, 75);
    }

    #[test]
    fn nested_sections_can_be_overridden() {
        let overrides = Config::builder()
            .set_override("sync.batch-size", 16)
            .unwrap()
            .set_override("fetch.preemption-factor", 3)
            .unwrap()
            .build()
            .unwrap();
        let config = InterfaceConfig::try_load(&overrides).unwrap();
        assert_eq!(config.sync.batch_size, 16);
        assert_eq!(config.sync.backlog_threshold, 1000);
        assert_eq!(config.fetch.preemption_factor, 3);
    }
}
