//! Scripted inverter standing in for the data logger in tests.

use crate::solarman::{Connector, RegisterTransport, TransportError, TransportParams};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Default)]
pub struct State {
    pub registers: HashMap<u16, u16>,
    /// Values served for consecutive single-word reads of an address before falling back to `registers`.
    pub scripted: HashMap<u16, VecDeque<u16>>,
    pub failing_reads: HashSet<u16>,
    pub fail_open: bool,
    /// How long `open` takes before it succeeds or fails.
    pub open_delay: Duration,
    pub fail_writes: bool,
    pub reads: Vec<u16>,
    pub writes: Vec<(u16, Vec<u16>)>,
    pub opened: usize,
    pub disconnected: usize,
}

#[derive(Clone, Default)]
pub struct FakeInverter(pub Arc<Mutex<State>>);

impl FakeInverter {
    pub fn with_registers(registers: &[(u16, u16)]) -> Self {
        let fake = Self::default();
        fake.state().registers.extend(registers.iter().copied());
        fake
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.0.lock().unwrap()
    }
}

#[async_trait]
impl RegisterTransport for FakeInverter {
    async fn read_holding_registers(&mut self, addr: u16, quantity: u16) -> Result<Vec<u16>, TransportError> {
        let mut state = self.state();
        state.reads.push(addr);

        if state.failing_reads.contains(&addr) {
            return Err(TransportError::Timeout(Duration::from_secs(10)));
        }

        if let Some(value) = state.scripted.get_mut(&addr).and_then(VecDeque::pop_front) {
            return Ok(vec![value]);
        }

        Ok((addr..addr + quantity)
            .map(|a| state.registers.get(&a).copied().unwrap_or_default())
            .collect())
    }

    async fn write_multiple_holding_registers(&mut self, addr: u16, values: &[u16]) -> Result<(), TransportError> {
        let mut state = self.state();

        if state.fail_writes {
            return Err(TransportError::Exception { function: 0x10, code: 0x04 });
        }

        state.writes.push((addr, values.to_vec()));
        for (a, value) in (addr..).zip(values) {
            state.registers.insert(a, *value);
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state().disconnected += 1;
    }
}

#[async_trait]
impl Connector for FakeInverter {
    type Transport = FakeInverter;

    async fn open(&self, _params: &TransportParams) -> Result<Self::Transport, TransportError> {
        let delay = self.state().open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_open {
            return Err(TransportError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        }
        state.opened += 1;
        Ok(self.clone())
    }
}
