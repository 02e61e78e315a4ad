use anyhow::{Context, Result};
use save_vtr_lib::device::EngineConfig;
use save_vtr_lib::register_map::RegisterMap;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

/// Contents of the `--config` file. Every section is optional.
///
/// ```yaml
/// engine:
///   command_timeout: 1s
///   settle_delay: 100ms
///   fast_interval: 30s
///   slow_interval: 5m
/// registers:
///   airflow_factor: 3.0
///   registers:
///     - name: setpoint
///       address: 2000
///       class: holding
///       encoding: { kind: signed_tenths }
///       field: setpoint
///       cadence: fast
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub registers: Option<RegisterMap>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {path:?}");
        let file =
            File::open(path).with_context(|| format!("Cannot open config file {path:?}"))?;
        serde_yaml::from_reader(file).with_context(|| format!("Cannot parse config file {path:?}"))
    }

    /// The configured register map, or the built-in one.
    pub fn register_map(&self) -> RegisterMap {
        self.registers.clone().unwrap_or_else(RegisterMap::save_vtr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use save_vtr_lib::register_map::Field;
    use std::time::Duration;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.register_map(), RegisterMap::save_vtr());
    }

    #[test]
    fn engine_durations_are_human_readable() {
        let config: Config = serde_yaml::from_str(
            "engine:\n  settle_delay: 250ms\n  slow_interval: 10m\n",
        )
        .unwrap();
        assert_eq!(config.engine.settle_delay, Duration::from_millis(250));
        assert_eq!(config.engine.slow_interval, Duration::from_secs(600));
        assert_eq!(
            config.engine.fast_interval,
            EngineConfig::default().fast_interval
        );
    }

    #[test]
    fn custom_register_map_replaces_the_built_in_one() {
        let yaml = "
registers:
  registers:
    - name: setpoint
      address: 1001
      class: holding
      encoding: { kind: signed_tenths }
      field: setpoint
      cadence: fast
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let map = config.register_map();
        assert_eq!(map.registers().len(), 1);
        assert_eq!(map.find(Field::Setpoint).map(|r| r.address), Some(1001));
    }

    #[test]
    fn invalid_register_map_is_rejected() {
        let yaml = "
registers:
  registers:
    - { name: a, address: 1, class: holding, encoding: { kind: raw_u16 }, field: setpoint }
    - { name: b, address: 2, class: holding, encoding: { kind: raw_u16 }, field: setpoint }
";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
