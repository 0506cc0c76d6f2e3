use anyhow::Result;
use config::Config;

use agora_module_versioned_store::configuration::StoreConfig;

use crate::stores::BlockStoreConfig;

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CoordinatorConfig {
    pub max_branch_length: u64,
    pub max_clock_drift: u64,
    pub pending_pool_capacity: usize,
    pub block_store: BlockStoreConfig,
    pub state: StoreConfig,
}

impl CoordinatorConfig {
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
}
