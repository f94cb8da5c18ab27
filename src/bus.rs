//! In-process telemetry bus: a fixed set of paths with values, display formatting and change tracking.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONNECTED: &str = "/Connected";
pub const UPDATE_INDEX: &str = "/UpdateIndex";
pub const FIRMWARE_VERSION: &str = "/FirmwareVersion";

const PRODUCT_ID: i64 = 0xFFFF;
const PRODUCT_NAME: &str = "Deye Sun G3";
const CONNECTION: &str = "SolarmanV5 Modbus RTU";
const SERVICE_NAME: &str = "com.victronenergy.pvinverter";

#[derive(Debug, Error)]
pub enum PublicationError {
    #[error("path {0} is not registered")]
    UnknownPath(String),
    #[error("path {0} is not writeable")]
    NotWriteable(String),
    #[error("MQTT publish of {path} failed: {source}")]
    Mqtt {
        path: String,
        #[source]
        source: paho_mqtt::Error,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Invalid,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Invalid => f.write_str("invalid"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    KiloWattHours,
    Watts,
    Amps,
    Volts,
}

impl TextFormat {
    pub fn format(self, value: &Value) -> String {
        let Some(v) = value.as_f64() else {
            return match value {
                Value::Text(s) => s.clone(),
                _ => String::new(),
            };
        };

        match self {
            TextFormat::Plain => value.to_string(),
            TextFormat::KiloWattHours => format!("{v:.2}kWh"),
            TextFormat::Watts => format!("{v:.1}W"),
            TextFormat::Amps => format!("{v:.1}A"),
            TextFormat::Volts => format!("{v:.1}V"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::L1 => "L1",
            Phase::L2 => "L2",
            Phase::L3 => "L3",
        })
    }
}

/// The four AC quantities carried per phase and as totals.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum AcField {
    Voltage,
    Current,
    Power,
    EnergyForward,
}

impl AcField {
    pub const ALL: [AcField; 4] = [AcField::Voltage, AcField::Current, AcField::Power, AcField::EnergyForward];

    fn suffix(self) -> &'static str {
        match self {
            AcField::Voltage => "Voltage",
            AcField::Current => "Current",
            AcField::Power => "Power",
            AcField::EnergyForward => "Energy/Forward",
        }
    }

    pub fn text_format(self) -> TextFormat {
        match self {
            AcField::Voltage => TextFormat::Volts,
            AcField::Current => TextFormat::Amps,
            AcField::Power => TextFormat::Watts,
            AcField::EnergyForward => TextFormat::KiloWattHours,
        }
    }

    /// Energy counters start out invalid, instantaneous values at zero.
    fn initial(self) -> Value {
        match self {
            AcField::EnergyForward => Value::Invalid,
            _ => Value::Int(0),
        }
    }

    pub fn total_path(self) -> String {
        format!("/Ac/{}", self.suffix())
    }

    pub fn phase_path(self, phase: Phase) -> String {
        format!("/Ac/{phase}/{}", self.suffix())
    }
}

pub trait TelemetryBus {
    fn get(&self, path: &str) -> Option<Value>;

    fn set(&mut self, path: &str, value: Value) -> Result<(), PublicationError>;
}

/// Static identity published alongside the measurements.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_instance: u32,
    pub position: u8,
    pub custom_name: String,
    pub serial: String,
    pub firmware_version: String,
}

#[derive(Debug, Clone)]
struct Item {
    value: Value,
    format: TextFormat,
    writeable: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PathState {
    #[serde(skip)]
    pub path: String,
    pub value: Value,
    pub text: String,
}

pub struct BusService {
    service_name: String,
    items: BTreeMap<String, Item>,
    changed: BTreeSet<String>,
}

impl BusService {
    pub fn new(service_name: String) -> Self {
        Self { service_name, items: BTreeMap::new(), changed: BTreeSet::new() }
    }

    /// Registers the single-phase PV inverter schema.
    pub fn pvinverter(identity: &DeviceIdentity) -> Self {
        let mut bus = Self::new(format!("{SERVICE_NAME}.tcp_{:02}", identity.device_instance));

        bus.add_path("/Mgmt/ProcessName", env!("CARGO_PKG_NAME"), TextFormat::Plain, false);
        bus.add_path("/Mgmt/ProcessVersion", env!("CARGO_PKG_VERSION"), TextFormat::Plain, false);
        bus.add_path("/Mgmt/Connection", CONNECTION, TextFormat::Plain, false);

        bus.add_path("/DeviceInstance", i64::from(identity.device_instance), TextFormat::Plain, false);
        bus.add_path("/ProductId", PRODUCT_ID, TextFormat::Plain, false);
        bus.add_path("/ProductName", PRODUCT_NAME, TextFormat::Plain, false);
        bus.add_path("/CustomName", identity.custom_name.as_str(), TextFormat::Plain, false);
        bus.add_path(CONNECTED, 1i64, TextFormat::Plain, false);

        bus.add_path("/Latency", Value::Invalid, TextFormat::Plain, false);
        bus.add_path(FIRMWARE_VERSION, identity.firmware_version.as_str(), TextFormat::Plain, false);
        bus.add_path("/HardwareVersion", 1.0f64, TextFormat::Plain, false);
        bus.add_path("/Position", i64::from(identity.position), TextFormat::Plain, false);
        bus.add_path("/Serial", identity.serial.as_str(), TextFormat::Plain, false);
        bus.add_path(UPDATE_INDEX, 0i64, TextFormat::Plain, false);
        // PV inverters are recognized by the presence of this path
        bus.add_path("/StatusCode", 0i64, TextFormat::Plain, false);

        for field in AcField::ALL {
            bus.add_path(&field.total_path(), field.initial(), field.text_format(), true);
        }

        for phase in Phase::ALL {
            for field in AcField::ALL {
                bus.add_path(&field.phase_path(phase), field.initial(), field.text_format(), true);
            }
        }

        bus
    }

    pub fn add_path(&mut self, path: &str, initial: impl Into<Value>, format: TextFormat, writeable: bool) {
        self.items
            .insert(path.to_owned(), Item { value: initial.into(), format, writeable });
        self.changed.insert(path.to_owned());
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn state(&self, path: &str, item: &Item) -> PathState {
        PathState { path: path.to_owned(), value: item.value.clone(), text: item.format.format(&item.value) }
    }

    /// Drains the set of paths whose value changed since the last call.
    pub fn take_changed(&mut self) -> Vec<PathState> {
        let changed = std::mem::take(&mut self.changed);

        changed
            .iter()
            .filter_map(|path| self.items.get(path).map(|item| self.state(path, item)))
            .collect()
    }

    /// Queues `path` for the next `take_changed` even though its value did not change.
    pub fn mark_changed(&mut self, path: &str) {
        if self.items.contains_key(path) {
            self.changed.insert(path.to_owned());
        }
    }

    /// A write coming from another bus participant. Writeable paths accept any value.
    pub fn handle_external_write(&mut self, path: &str, value: Value) -> Result<(), PublicationError> {
        let item = self
            .items
            .get(path)
            .ok_or_else(|| PublicationError::UnknownPath(path.to_owned()))?;

        if !item.writeable {
            warn!("Rejected external update of read-only {path} to {value}");
            return Err(PublicationError::NotWriteable(path.to_owned()));
        }

        info!("Someone else updated {path} to {value}");
        self.set(path, value)
    }
}

impl TelemetryBus for BusService {
    fn get(&self, path: &str) -> Option<Value> {
        self.items.get(path).map(|item| item.value.clone())
    }

    fn set(&mut self, path: &str, value: Value) -> Result<(), PublicationError> {
        let item = self
            .items
            .get_mut(path)
            .ok_or_else(|| PublicationError::UnknownPath(path.to_owned()))?;

        if item.value != value {
            debug!("{path} = {value}");
            item.value = value;
            self.changed.insert(path.to_owned());
        }

        Ok(())
    }
}
