use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Result};
use config::Config;

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimulatorConfig {
    pub nodes: usize,
    pub producers: usize,
    pub block_interval: u64,
    pub blocks: u64,
    pub transactions_per_block: usize,
    pub finality_interval: u64,
    pub settle_time: u64,
    pub data_dir: PathBuf,
    pub seed: u64,
}

impl SimulatorConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        let config: Self = full_config.try_deserialize()?;
        ensure!(config.nodes > 0, "at least one node is needed");
        ensure!(
            (1..=config.nodes.min(255)).contains(&config.producers),
            "producers must be between 1 and the node count (at most 255)"
        );
        Ok(config)
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_time)
    }
}
