//! Runtime settings, layered from an optional TOML file and `FLOWRUN__*`
//! environment variables (e.g. `FLOWRUN__ENGINE__MAX_ATTEMPTS=3`).

use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use db::PoolSettings;
use engine::EngineSettings;
use queue::QueueConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub engine: EngineSettings,
    pub queue: QueueConfig,
    #[serde(default)]
    pub database: PoolSettings,
}

impl Settings {
    /// Load from `path` if given, else from `./flowrun.toml` when present,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_builder(Config::builder().add_source(config_file(path)))
    }

    /// Only the `database` section, for commands that never execute a flow.
    pub fn load_database(path: Option<&Path>) -> Result<PoolSettings, ConfigError> {
        #[derive(Deserialize)]
        struct DatabaseOnly {
            #[serde(default)]
            database: PoolSettings,
        }

        let config = Config::builder()
            .add_source(config_file(path))
            .add_source(environment())
            .build()?;
        Ok(config.try_deserialize::<DatabaseOnly>()?.database)
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self, ConfigError> {
        builder
            .add_source(environment())
            .build()?
            .try_deserialize()
    }
}

fn config_file(path: Option<&Path>) -> impl config::Source + Send + Sync + 'static {
    match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name("flowrun").required(false),
    }
}

fn environment() -> Environment {
    Environment::with_prefix("FLOWRUN").separator("__").try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    const TOML: &str = r#"
        [engine]
        max_attempts = 3
        retry_base_delay_ms = 200
        retry_max_delay_ms = 5000
        run_timeout_secs = 300
        node_timeout_secs = 30
        credential_timeout_secs = 10

        [queue]
        workers = 4
        capacity = 64
    "#;

    #[test]
    fn loads_engine_and_queue_sections() {
        let settings =
            Settings::from_builder(Config::builder().add_source(File::from_str(TOML, FileFormat::Toml))).unwrap();
        assert_eq!(settings.engine.max_attempts, 3);
        assert_eq!(settings.queue.workers, 4);
        assert_eq!(settings.database.url, None);
        assert_eq!(settings.database.max_connections, 5);
        assert!(engine::SchedulerConfig::try_from(settings.engine).is_ok());
    }

    #[test]
    fn explicit_settings_file_must_exist() {
        let database = Settings::load_database(Some(Path::new("/nonexistent/flowrun.toml")));
        assert!(database.is_err());
    }

    #[test]
    fn missing_engine_section_is_an_error() {
        let toml = "[queue]\nworkers = 1\ncapacity = 1\n";
        assert!(Settings::from_builder(Config::builder().add_source(File::from_str(toml, FileFormat::Toml))).is_err());
    }
}
