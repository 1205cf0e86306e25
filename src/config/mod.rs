mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{LogSettings, MalformedPolicy, ServerSettings, SessionSettings, Settings};

/// Default location of the optional configuration file, without extension.
pub const DEFAULT_CONFIG_PATH: &str = "config/default";

/// Prefix of environment variables read as configuration, e.g.
/// `ECHOMARK_SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "ECHOMARK";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

/// Same as [`load_config`] but reads the file at `path` instead. The file
/// is optional; its format is detected from the extension.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
