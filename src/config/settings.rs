use std::time::Duration;

use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::router::RouterConfig;

/// Top-level settings of a `courier` process.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub router: RouterSettings,
    pub logging: LoggingSettings,
}

/// In-memory broker settings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub output_buffer: usize,
    pub persistent: bool,
    pub block_publish_until_ack: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RouterSettings {
    pub close_timeout_secs: u64,
    pub idle_shutdown_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Settings as found in files and environment; every value is optional and
/// missing ones fall back to [`Settings::default`].
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub router: Option<PartialRouterSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub output_buffer: Option<usize>,
    pub persistent: Option<bool>,
    pub block_publish_until_ack: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRouterSettings {
    pub close_timeout_secs: Option<u64>,
    pub idle_shutdown_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let broker = BrokerConfig::default();
        let router = RouterConfig::default();
        Self {
            broker: BrokerSettings {
                output_buffer: broker.output_buffer,
                persistent: broker.persistent,
                block_publish_until_ack: broker.block_publish_until_ack,
            },
            router: RouterSettings {
                close_timeout_secs: router.close_timeout.as_secs(),
                idle_shutdown_ms: router.idle_shutdown.as_millis() as u64,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let broker = self.broker.unwrap_or_default();
        let router = self.router.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            broker: BrokerSettings {
                output_buffer: broker
                    .output_buffer
                    .unwrap_or(defaults.broker.output_buffer),
                persistent: broker.persistent.unwrap_or(defaults.broker.persistent),
                block_publish_until_ack: broker
                    .block_publish_until_ack
                    .unwrap_or(defaults.broker.block_publish_until_ack),
            },
            router: RouterSettings {
                close_timeout_secs: router
                    .close_timeout_secs
                    .unwrap_or(defaults.router.close_timeout_secs),
                idle_shutdown_ms: router
                    .idle_shutdown_ms
                    .unwrap_or(defaults.router.idle_shutdown_ms),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(defaults.logging.level),
            },
        }
    }
}

impl From<&BrokerSettings> for BrokerConfig {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            output_buffer: settings.output_buffer,
            persistent: settings.persistent,
            block_publish_until_ack: settings.block_publish_until_ack,
        }
    }
}

impl From<&RouterSettings> for RouterConfig {
    fn from(settings: &RouterSettings) -> Self {
        Self {
            close_timeout: Duration::from_secs(settings.close_timeout_secs),
            idle_shutdown: Duration::from_millis(settings.idle_shutdown_ms),
        }
    }
}
