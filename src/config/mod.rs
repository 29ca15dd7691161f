//! Layered settings: built-in defaults, then `config/default.*` (optional),
//! then `COURIER__SECTION__KEY` environment variables.

mod settings;

use config::{Config, Environment, File};

use crate::utils::error::Result;

pub use settings::{
    BrokerSettings, LoggingSettings, PartialBrokerSettings, PartialLoggingSettings,
    PartialRouterSettings, PartialSettings, RouterSettings, Settings,
};

/// Environment variable prefix, e.g. `COURIER__BROKER__PERSISTENT=true`.
pub const ENV_PREFIX: &str = "COURIER";

/// Loads the settings from the default file and the environment and merges
/// them over [`Settings::default`].
pub fn load_config() -> Result<Settings> {
    let config = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}
