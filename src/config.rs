use crate::{bus::Phase, solarman::TransportParams};
use lazy_static::lazy_static;
use serde::{de::Error, Deserialize, Deserializer};
use std::{fs::File, path::Path, time::Duration};

lazy_static! {
    static ref IDENTIFIER_REGEX: regex::Regex = regex::Regex::new("^[a-zA-Z0-9_]+$").unwrap();
}

const fn default_mqtt_port() -> u16 {
    1883
}
const fn default_solarman_port() -> u16 {
    8899
}
const fn default_slave_id() -> u8 {
    1
}
const fn default_sign_of_life_interval_mins() -> u64 {
    5
}
const fn default_request_timeout_secs() -> u64 {
    10
}
fn default_client_id() -> Identifier {
    Identifier("deye2mqtt_bridge".to_owned())
}
fn default_custom_name() -> String {
    "Deye Sun G3".to_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("failed to open config file {path:?}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default = "default_client_id")]
    pub client_id: Identifier,

    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,

    pub inverter: InverterConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier(pub String);

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let id = String::deserialize(de)?;

        if IDENTIFIER_REGEX.is_match(&id) {
            Ok(Identifier(id))
        } else {
            Err(Error::custom("identifier must match [a-zA-Z0-9_]+"))
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct InverterConfig {
    pub address: String,

    #[serde(default = "default_solarman_port")]
    pub port: u16,

    /// Serial number of the Solarman data logger stick, not of the inverter.
    pub serial: u32,

    #[serde(default = "default_slave_id")]
    pub slave_id: u8,

    pub phase: Phase,

    pub update_interval_secs: u64,

    /// 0 disables the sign of life log.
    #[serde(default = "default_sign_of_life_interval_mins")]
    pub sign_of_life_interval_mins: u64,

    pub device_instance: u32,

    #[serde(default)]
    pub position: u8,

    #[serde(default = "default_custom_name")]
    pub custom_name: String,

    pub firmware_version: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl InverterConfig {
    pub fn transport_params(&self) -> TransportParams {
        TransportParams {
            address: self.address.clone(),
            port: self.port,
            serial: self.serial,
            slave_id: self.slave_id,
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn sign_of_life_interval(&self) -> Option<Duration> {
        (self.sign_of_life_interval_mins > 0).then(|| Duration::from_secs(self.sign_of_life_interval_mins * 60))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigurationError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let config: Config = serde_yaml::from_reader(file).map_err(|source| ConfigurationError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |key, reason: &str| Err(ConfigurationError::Invalid { key, reason: reason.to_owned() });

        if self.broker.trim().is_empty() {
            return invalid("broker", "must not be empty");
        }
        if self.inverter.address.trim().is_empty() {
            return invalid("inverter.address", "must not be empty");
        }
        if self.inverter.update_interval_secs == 0 {
            return invalid("inverter.update_interval_secs", "must be at least 1");
        }
        if self.inverter.request_timeout_secs == 0 {
            return invalid("inverter.request_timeout_secs", "must be at least 1");
        }
        if self.inverter.slave_id == 0 || self.inverter.slave_id > 247 {
            return invalid("inverter.slave_id", "must be within 1..=247");
        }

        Ok(())
    }
}
