pub mod clock;
pub mod codec;
pub mod registers;

#[cfg(test)]
pub mod fake;

use crate::solarman::{Connector, RegisterTransport, TransportError, TransportParams};
use chrono::{Local, NaiveDateTime};
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub type KiloWattHours = f64;
pub type Watts = f64;
pub type Amps = f64;
pub type Volts = f64;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub daily_energy: KiloWattHours,
    pub ac_power: Watts,
    pub ac_current: Amps,
    pub ac_voltage: Volts,
    pub firmware_version: String,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Step {
    Open,
    ClockSync,
    DailyProduction,
    AcPower,
    GridCurrent,
    AcVoltage,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Open => "open",
            Step::ClockSync => "clock sync",
            Step::DailyProduction => "daily production",
            Step::AcPower => "ac power",
            Step::GridCurrent => "grid current",
            Step::AcVoltage => "ac voltage",
        })
    }
}

#[derive(Debug, Error)]
#[error("{step} failed: {source}")]
pub struct PassError {
    pub step: Step,
    #[source]
    pub source: TransportError,
}

pub type PassResult = Result<Snapshot, PassError>;

fn at(step: Step) -> impl FnOnce(TransportError) -> PassError {
    move |source| PassError { step, source }
}

async fn read_scaled<T: RegisterTransport>(
    transport: &mut T,
    reg: registers::Register,
    scale: f64,
) -> Result<f64, TransportError> {
    transport
        .read_holding_register_formatted(reg.start, registers::quantity(&reg), scale)
        .await
}

pub async fn read_daily_production<T: RegisterTransport>(transport: &mut T) -> Result<KiloWattHours, TransportError> {
    read_scaled(transport, registers::DAILY_PRODUCTION, registers::DAILY_PRODUCTION_SCALE).await
}

pub async fn read_ac_voltage<T: RegisterTransport>(transport: &mut T) -> Result<Volts, TransportError> {
    read_scaled(transport, registers::AC_VOLTAGE, registers::AC_VOLTAGE_SCALE).await
}

pub async fn read_grid_current<T: RegisterTransport>(transport: &mut T) -> Result<Amps, TransportError> {
    read_scaled(transport, registers::GRID_CURRENT, registers::GRID_CURRENT_SCALE).await
}

pub async fn read_total_ac_output_power<T: RegisterTransport>(transport: &mut T) -> Result<Watts, TransportError> {
    let reg = registers::TOTAL_AC_OUTPUT_POWER;
    let words = transport.read_holding_registers(reg.start, registers::quantity(&reg)).await?;
    Ok(codec::decode_reversed_words(&words, registers::TOTAL_AC_OUTPUT_POWER_SCALE))
}

/// Runs one polling pass against the inverter: one session, clock sync, then every measurement.
pub struct SnapshotBuilder<C> {
    connector: C,
    params: TransportParams,
    firmware_version: String,
    host_time: fn() -> NaiveDateTime,
}

fn local_time() -> NaiveDateTime {
    Local::now().naive_local()
}

impl<C: Connector> SnapshotBuilder<C> {
    pub fn new(connector: C, params: TransportParams, firmware_version: String) -> Self {
        Self { connector, params, firmware_version, host_time: local_time }
    }

    #[cfg(test)]
    pub fn with_host_time(mut self, host_time: fn() -> NaiveDateTime) -> Self {
        self.host_time = host_time;
        self
    }

    pub async fn build(&self) -> PassResult {
        let mut transport = self.connector.open(&self.params).await.map_err(at(Step::Open))?;

        let result = self.read_snapshot(&mut transport).await;
        transport.disconnect().await;

        result
    }

    async fn read_snapshot(&self, transport: &mut C::Transport) -> PassResult {
        let outcome = clock::sync(transport, self.host_time).await.map_err(at(Step::ClockSync))?;
        debug!("Clock sync: {outcome:?}");

        let daily_energy = read_daily_production(transport).await.map_err(at(Step::DailyProduction))?;
        let ac_power = read_total_ac_output_power(transport).await.map_err(at(Step::AcPower))?;
        let ac_current = read_grid_current(transport).await.map_err(at(Step::GridCurrent))?;
        let ac_voltage = read_ac_voltage(transport).await.map_err(at(Step::AcVoltage))?;

        Ok(Snapshot {
            daily_energy,
            ac_power,
            ac_current,
            ac_voltage,
            firmware_version: self.firmware_version.clone(),
        })
    }
}
