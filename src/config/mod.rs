mod settings;

use std::path::Path;

use config::{Config, ConfigBuilder, ConfigError, Environment, File, builder::DefaultState};

use crate::config::settings::PartialSettings;

pub use settings::{
    ConnectionSettings, DeliverySettings, DispatchSettings, MAX_CLIENT_ID_LEN, ReconnectSettings,
    Settings,
};

/// Prefix of every environment override, e.g.
/// `MQTT_ENGINE_CONNECTION__CLIENT_ID=sensor-7`.
pub const ENV_PREFIX: &str = "MQTT_ENGINE";

/// Loads the configuration from `config/default` (any format the `config`
/// crate understands, optional) and `MQTT_ENGINE_*` environment variables,
/// merged over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder().add_source(File::with_name("config/default").required(false));
    build(builder)
}

/// Same layering as `load_config`, but with an explicit, required file.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let builder = Config::builder().add_source(File::from(path.as_ref()).required(true));
    build(builder)
}

fn build(builder: ConfigBuilder<DefaultState>) -> Result<Settings, ConfigError> {
    let config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("connection.server_uris")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_into(Settings::default()))
}

#[cfg(test)]
mod tests;
