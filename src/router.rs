//! Maps a single-phase snapshot onto the three-phase bus schema and tracks link health.

use crate::{
    bus::{self, AcField, Phase, PublicationError, TelemetryBus, Value},
    deye::{PassResult, Snapshot},
};
use chrono::{DateTime, Local};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Without a successful pass for this long the device is reported disconnected.
pub const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Copy, Clone)]
struct LastUpdate {
    at: Instant,
    wall: DateTime<Local>,
}

pub struct PublicationRouter {
    phase: Phase,
    last_update: Option<LastUpdate>,
}

fn field_value(snapshot: &Snapshot, field: AcField) -> f64 {
    match field {
        AcField::Voltage => snapshot.ac_voltage,
        AcField::Current => snapshot.ac_current,
        AcField::Power => snapshot.ac_power,
        AcField::EnergyForward => snapshot.daily_energy,
    }
}

impl PublicationRouter {
    pub fn new(phase: Phase) -> Self {
        Self { phase, last_update: None }
    }

    pub fn apply<B: TelemetryBus>(&mut self, bus: &mut B, pass: &PassResult, now: Instant) {
        match pass {
            Ok(snapshot) => match self.publish_snapshot(bus, snapshot) {
                Ok(()) => {
                    if let Err(e) = bus.set(bus::CONNECTED, Value::Int(1)) {
                        error!("Error setting {}: {e}", bus::CONNECTED);
                    }

                    self.last_update = Some(LastUpdate { at: now, wall: Local::now() });

                    debug!("House consumption (/Ac/Power): {:?}", bus.get("/Ac/Power"));
                    debug!("House forward (/Ac/Energy/Forward): {:?}", bus.get("/Ac/Energy/Forward"));
                },
                Err(e) => {
                    error!("Error publishing snapshot: {e}");
                    self.check_staleness(bus, now);
                },
            },
            Err(e) => {
                error!("Polling pass failed: {e}");
                self.check_staleness(bus, now);
            },
        }

        if let Err(e) = increment_update_index(bus) {
            error!("Error incrementing {}: {e}", bus::UPDATE_INDEX);
        }
    }

    /// Writes every path of the phase step even if some fail; the first failure is returned.
    fn publish_snapshot<B: TelemetryBus>(&self, bus: &mut B, snapshot: &Snapshot) -> Result<(), PublicationError> {
        let mut result = Ok(());
        let mut record = |r: Result<(), PublicationError>| {
            if let Err(e) = r {
                error!("{e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        };

        for phase in Phase::ALL {
            for field in AcField::ALL {
                let value = if phase == self.phase {
                    Value::Float(field_value(snapshot, field))
                } else {
                    Value::Int(0)
                };

                record(bus.set(&field.phase_path(phase), value));
            }
        }

        for field in AcField::ALL {
            let phase_path = field.phase_path(self.phase);
            match bus.get(&phase_path) {
                Some(value) => record(bus.set(&field.total_path(), value)),
                None => record(Err(PublicationError::UnknownPath(phase_path))),
            }
        }

        record(bus.set(bus::FIRMWARE_VERSION, Value::Text(snapshot.firmware_version.clone())));

        result
    }

    fn check_staleness<B: TelemetryBus>(&self, bus: &mut B, now: Instant) {
        let stale = match self.last_update {
            Some(last) => now.duration_since(last.at) > STALE_AFTER,
            None => true,
        };

        if stale {
            if let Err(e) = bus.set(bus::CONNECTED, Value::Int(0)) {
                error!("Error clearing {}: {e}", bus::CONNECTED);
            }
        }
    }

    pub fn sign_of_life<B: TelemetryBus>(&self, bus: &B, now: Instant) -> SignOfLife {
        SignOfLife {
            last_update: self.last_update.map(|last| last.wall),
            since_last_update: self.last_update.map(|last| now.duration_since(last.at)),
            last_power: bus.get("/Ac/Power").unwrap_or(Value::Invalid),
        }
    }
}

/// Periodic diagnostic summary, independent of the publishing cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SignOfLife {
    pub last_update: Option<DateTime<Local>>,
    pub since_last_update: Option<Duration>,
    pub last_power: Value,
}

impl SignOfLife {
    pub fn log(&self) {
        info!("--- Start: sign of life ---");
        match (self.last_update, self.since_last_update) {
            (Some(wall), Some(since)) => info!(
                "Last successful update: {} ({}s ago)",
                wall.format("%Y-%m-%d %H:%M:%S"),
                since.as_secs()
            ),
            _ => info!("Last successful update: never"),
        }
        info!("Last '/Ac/Power': {}", self.last_power);
        info!("--- End: sign of life ---");
    }
}

/// Signals that a cycle ran, whether or not it produced data.
fn increment_update_index<B: TelemetryBus>(bus: &mut B) -> Result<(), PublicationError> {
    let current = bus
        .get(bus::UPDATE_INDEX)
        .ok_or_else(|| PublicationError::UnknownPath(bus::UPDATE_INDEX.to_owned()))?;

    let mut index = current.as_i64().unwrap_or_default() + 1;
    if index > 255 {
        index = 0;
    }

    bus.set(bus::UPDATE_INDEX, Value::Int(index))
}
