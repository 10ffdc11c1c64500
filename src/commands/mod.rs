pub mod check_config;
pub mod replay;

use bsl_engine::{ConfigError, EngineConfig};

/// Load the configuration file if given, otherwise defaults, with `BSL_*`
/// environment overrides applied in both cases
pub fn load_config(path: Option<&str>) -> Result<EngineConfig, ConfigError> {
    match path {
        Some(path) => EngineConfig::from_json_file(path),
        None => {
            let mut config = EngineConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }
}
