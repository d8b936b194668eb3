use super::BrokerConfig;
use crate::Result;
use config::{Config, Environment};

impl BrokerConfig {
    /// Build a configuration from `RELAYMQ_`-prefixed environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = serde_json::to_value(BrokerConfig::default())?;

        let settings = Config::builder()
            .add_source(config::File::from_str(
                &defaults.to_string(),
                config::FileFormat::Json,
            ))
            .add_source(Environment::with_prefix("RELAYMQ"))
            .build()
            .map_err(|e| crate::RelayError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<BrokerConfig>()
            .map_err(|e| crate::RelayError::Config(e.to_string()))?;

        Ok(config)
    }
}
