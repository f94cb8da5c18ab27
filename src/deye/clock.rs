//! Keeps the inverter clock on the host's calendar day so its daily production counter resets at midnight.

use super::{read_daily_production, registers};
use crate::solarman::{RegisterTransport, TransportError};
use chrono::{Datelike, NaiveDateTime, Timelike};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

pub const RESET_CONFIRMATION_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const RESET_CONFIRMATION_PERIOD: Duration = Duration::from_secs(5);

/// (year % 100, month), (day, hour), (minute, second)
pub type DeviceClock = [u16; 3];

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResetOutcome {
    InSync,
    Confirmed,
    TimedOut,
}

fn pack(high: u32, low: u32) -> u16 {
    (256 * high + low) as u16
}

pub fn encode(now: NaiveDateTime) -> DeviceClock {
    [
        pack(now.year().rem_euclid(100) as u32, now.month()),
        pack(now.day(), now.hour()),
        pack(now.minute(), now.second()),
    ]
}

/// Only year/month and the day byte count; hour, minute and second drift is tolerated.
pub fn is_stale(device: &DeviceClock, host: &DeviceClock) -> bool {
    device[0] != host[0] || device[1] / 256 != host[1] / 256
}

/// `host_time` is sampled right after the device clock arrives, so both sides of the comparison
/// are taken at the same moment.
pub async fn sync<T, F>(transport: &mut T, host_time: F) -> Result<ResetOutcome, TransportError>
where
    T: RegisterTransport,
    F: Fn() -> NaiveDateTime,
{
    let words = transport
        .read_holding_registers(registers::SYSTEM_TIME.start, registers::quantity(&registers::SYSTEM_TIME))
        .await?;

    let device: DeviceClock = words
        .try_into()
        .map_err(|words: Vec<u16>| TransportError::Mismatch(format!("{} system time words", words.len())))?;
    let host = encode(host_time());

    debug!("Inverter system time: {device:?}");
    debug!("New system time: {host:?}");

    if !is_stale(&device, &host) {
        return Ok(ResetOutcome::InSync);
    }

    info!("Updating inverter system time");
    transport
        .write_multiple_holding_registers(registers::SYSTEM_TIME.start, &host)
        .await?;

    Ok(confirm_reset(transport).await)
}

async fn confirm_reset<T: RegisterTransport>(transport: &mut T) -> ResetOutcome {
    let deadline = Instant::now() + RESET_CONFIRMATION_WINDOW;

    loop {
        match read_daily_production(transport).await {
            Ok(energy) if energy <= 0.0 => {
                info!("Successful reset of daily production");
                return ResetOutcome::Confirmed;
            },
            Ok(energy) => debug!("Daily production still at {energy} kWh, waiting for reset"),
            Err(e) => error!("Error reading daily production while waiting for reset: {e}"),
        }

        if Instant::now() + RESET_CONFIRMATION_PERIOD > deadline {
            break;
        }
        time::sleep(RESET_CONFIRMATION_PERIOD).await;
    }

    warn!("Timeout on reset of daily production");
    ResetOutcome::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deye::fake::FakeInverter;
    use chrono::NaiveDate;
    use std::cell::Cell;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 1, day)
            .unwrap()
            .and_hms_opt(hour, minute, 30)
            .unwrap()
    }

    fn inverter_clock(clock: DeviceClock) -> FakeInverter {
        FakeInverter::with_registers(&[(0x0016, clock[0]), (0x0017, clock[1]), (0x0018, clock[2])])
    }

    #[test]
    fn encodes_host_time() {
        assert_eq!(encode(at(5, 10, 42)), [23 * 256 + 1, 5 * 256 + 10, 42 * 256 + 30]);
    }

    #[test]
    fn same_day_different_hour_is_not_stale() {
        assert!(!is_stale(&[2301, 5 * 256 + 10, 0], &[2301, 5 * 256 + 23, 0]));
    }

    #[test]
    fn different_day_is_stale() {
        assert!(is_stale(&[2301, 5 * 256 + 10, 0], &[2301, 6 * 256 + 10, 0]));
    }

    #[test]
    fn different_month_is_stale() {
        assert!(is_stale(&[2301, 5 * 256 + 10, 0], &[2302, 5 * 256 + 10, 0]));
    }

    #[test]
    fn minute_and_second_are_ignored() {
        assert!(!is_stale(&[2301, 1290, 0], &[2301, 1290, 59 * 256 + 59]));
    }

    #[tokio::test(start_paused = true)]
    async fn in_sync_clock_is_left_alone() {
        let now = at(5, 10, 0);
        let mut fake = inverter_clock(encode(at(5, 3, 17)));

        assert_eq!(sync(&mut fake, || now).await.unwrap(), ResetOutcome::InSync);
        assert!(fake.state().writes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_clock_is_written_and_reset_confirmed() {
        let now = at(6, 0, 1);
        let mut fake = inverter_clock(encode(at(5, 23, 59)));
        fake.state()
            .scripted
            .insert(0x003C, [125, 125, 0].into_iter().collect());

        let started = Instant::now();
        assert_eq!(sync(&mut fake, || now).await.unwrap(), ResetOutcome::Confirmed);

        assert_eq!(fake.state().writes, vec![(0x0016, encode(now).to_vec())]);
        assert_eq!(started.elapsed(), RESET_CONFIRMATION_PERIOD * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_gives_up_after_window() {
        let mut fake = inverter_clock(encode(at(5, 23, 59)));
        fake.state().registers.insert(0x003C, 183);

        let started = Instant::now();
        assert_eq!(sync(&mut fake, || at(6, 0, 1)).await.unwrap(), ResetOutcome::TimedOut);

        assert_eq!(started.elapsed(), RESET_CONFIRMATION_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_during_confirmation_keep_waiting() {
        let mut fake = inverter_clock(encode(at(5, 23, 59)));
        fake.state().failing_reads.insert(0x003C);

        assert_eq!(sync(&mut fake, || at(6, 0, 1)).await.unwrap(), ResetOutcome::TimedOut);
        // one read at 0s, then every 5s up to and including 300s
        let attempts = fake.state().reads.iter().filter(|&&a| a == 0x003C).count();
        assert_eq!(attempts, 61);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_clock_write_fails_the_sync() {
        let mut fake = inverter_clock(encode(at(5, 23, 59)));
        fake.state().fail_writes = true;

        assert!(sync(&mut fake, || at(6, 0, 1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn host_time_is_taken_after_device_clock_is_read() {
        let now = at(6, 0, 1);
        let mut fake = inverter_clock(encode(at(5, 23, 59)));
        let observer = fake.clone();
        let reads_when_sampled = Cell::new(None);

        let host_time = || {
            reads_when_sampled.set(Some(observer.state().reads.len()));
            now
        };
        sync(&mut fake, host_time).await.unwrap();

        assert_eq!(reads_when_sampled.get(), Some(1));
        assert_eq!(fake.state().writes, vec![(0x0016, encode(now).to_vec())]);
    }
}
