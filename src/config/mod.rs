mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, LogSettings, PartialSettings, ServerSettings, Settings,
};

/// Environment variables consulted, in order, for the broker URL. The last
/// two are the names older deployments export.
pub const BROKER_URL_VARS: [&str; 4] =
    ["BOLSA_BROKER_URL", "BROKER_URL", "AMQP_URL", "CLOUDAMQP_URL"];

/// Used when neither `--url` nor the environment name a broker.
pub const DEFAULT_BROKER_URL: &str = "ws://guest:guest@localhost:8080/";

/// Loads the configuration from `config/default` and `BOLSA_*` environment
/// variables (`BOLSA_SERVER__PORT=9000`), merged over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("BOLSA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}

/// The broker URL to use: `explicit` if given, else the first non-empty
/// variable of `BROKER_URL_VARS`, else `DEFAULT_BROKER_URL`.
pub fn resolve_broker_url(explicit: Option<&str>) -> String {
    if let Some(url) = explicit.filter(|url| !url.trim().is_empty()) {
        return url.to_string();
    }
    BROKER_URL_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|url| !url.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BROKER_URL.to_string())
}
