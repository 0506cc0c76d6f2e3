use std::time::Duration;

use anyhow::Result;
use config::Config;

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PropagationConfig {
    pub fast_forward_count: usize,
    pub inventory_expiry: u64,
    pub inventory_capacity: usize,
    pub recent_item_capacity: usize,
}

impl PropagationConfig {
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

    pub fn inventory_expiry(&self) -> Duration {
        Duration::from_secs(self.inventory_expiry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load() {
        let config = PropagationConfig::try_load(&Config::default()).unwrap();
        assert_eq!(config.fast_forward_count, 4);
        assert_eq!(config.inventory_expiry(), Duration::from_secs(60));
    }
}
