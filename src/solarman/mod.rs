pub mod frame;
pub mod rtu;

use crate::deye::codec;
use async_trait::async_trait;
use frame::{V5Codec, V5Request, CONTROL_HEARTBEAT, CONTROL_RESPONSE};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::{self, Duration},
};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("connection closed by data logger")]
    Closed,
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("V5 checksum mismatch: expected {expected:#04x}, received {received:#04x}")]
    Checksum { expected: u8, received: u8 },
    #[error("modbus CRC mismatch: expected {expected:#06x}, received {received:#06x}")]
    Crc { expected: u16, received: u16 },
    #[error("modbus exception {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },
    #[error("unexpected response: {0}")]
    Mismatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    pub address: String,
    pub port: u16,
    pub serial: u32,
    pub slave_id: u8,
}

/// Holding-register access to one device over an open session.
#[async_trait]
pub trait RegisterTransport: Send {
    async fn read_holding_registers(&mut self, addr: u16, quantity: u16) -> Result<Vec<u16>, TransportError>;

    /// Reads `quantity` words as one unsigned big-endian integer and applies `scale`.
    async fn read_holding_register_formatted(
        &mut self,
        addr: u16,
        quantity: u16,
        scale: f64,
    ) -> Result<f64, TransportError> {
        let words = self.read_holding_registers(addr, quantity).await?;

        match words[..] {
            [] => Err(TransportError::Mismatch(format!("no data for register {addr:#06x}"))),
            [word] => Ok(codec::decode_scaled(word, scale)),
            _ => Ok(codec::compose_unsigned(&words) as f64 * scale),
        }
    }

    async fn write_multiple_holding_registers(&mut self, addr: u16, values: &[u16]) -> Result<(), TransportError>;

    async fn disconnect(&mut self);
}

/// Opens one transport session per call.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: RegisterTransport;

    async fn open(&self, params: &TransportParams) -> Result<Self::Transport, TransportError>;
}

pub struct SolarmanConnector {
    timeout: Duration,
}

impl SolarmanConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for SolarmanConnector {
    type Transport = SolarmanV5<TcpStream>;

    async fn open(&self, params: &TransportParams) -> Result<Self::Transport, TransportError> {
        debug!("Connecting to data logger {}:{} (serial {})", params.address, params.port, params.serial);

        let stream = time::timeout(self.timeout, TcpStream::connect((params.address.as_str(), params.port)))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        Ok(SolarmanV5::new(stream, params.serial, params.slave_id, self.timeout))
    }
}

pub struct SolarmanV5<S> {
    framed: Framed<S, V5Codec>,
    logger_serial: u32,
    slave_id: u8,
    sequence: u8,
    timeout: Duration,
}

impl<S> SolarmanV5<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, logger_serial: u32, slave_id: u8, timeout: Duration) -> Self {
        Self {
            framed: Framed::new(stream, V5Codec),
            logger_serial,
            slave_id,
            sequence: rand::random(),
            timeout,
        }
    }

    fn next_sequence(&mut self) -> u8 {
        self.sequence = match self.sequence.wrapping_add(1) {
            0 => 1,
            seq => seq,
        };
        self.sequence
    }

    async fn exchange(&mut self, modbus: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let sequence = self.next_sequence();

        self.framed
            .send(V5Request { sequence, logger_serial: self.logger_serial, modbus })
            .await?;

        let timeout = self.timeout;
        time::timeout(timeout, self.receive(sequence))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn receive(&mut self, sequence: u8) -> Result<Vec<u8>, TransportError> {
        loop {
            let frame = self.framed.next().await.ok_or(TransportError::Closed)??;

            match frame.control {
                CONTROL_RESPONSE => {},
                CONTROL_HEARTBEAT => {
                    trace!("Skipping data logger heartbeat");
                    continue;
                },
                control => {
                    trace!("Skipping unsolicited V5 frame with control code {control:#06x}");
                    continue;
                },
            }

            if frame.sequence != sequence {
                debug!("Skipping stale V5 response {} while waiting for {sequence}", frame.sequence);
                continue;
            }

            if frame.logger_serial != self.logger_serial {
                return Err(TransportError::Mismatch(format!(
                    "logger serial {} in response, expected {}",
                    frame.logger_serial, self.logger_serial
                )));
            }

            return Ok(frame.modbus_frame()?.to_vec());
        }
    }
}

#[async_trait]
impl<S> RegisterTransport for SolarmanV5<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_holding_registers(&mut self, addr: u16, quantity: u16) -> Result<Vec<u16>, TransportError> {
        if quantity == 0 || quantity > rtu::MAX_READ_QUANTITY {
            return Err(TransportError::Frame(format!("cannot read {quantity} registers in one request")));
        }

        let response = self
            .exchange(rtu::read_holding_registers_request(self.slave_id, addr, quantity))
            .await?;
        let words = rtu::parse_read_holding_registers(self.slave_id, quantity, &response)?;

        trace!("Read {quantity} registers at {addr:#06x}: {words:?}");
        Ok(words)
    }

    async fn write_multiple_holding_registers(&mut self, addr: u16, values: &[u16]) -> Result<(), TransportError> {
        let quantity = values.len() as u16;
        if quantity == 0 || quantity > rtu::MAX_WRITE_QUANTITY {
            return Err(TransportError::Frame(format!("cannot write {quantity} registers in one request")));
        }

        let response = self
            .exchange(rtu::write_multiple_registers_request(self.slave_id, addr, values))
            .await?;
        rtu::parse_write_multiple_registers(self.slave_id, addr, quantity, &response)?;

        trace!("Wrote {values:?} at {addr:#06x}");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.framed.get_mut().shutdown().await {
            debug!("Error closing data logger connection: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    const SERIAL: u32 = 2_712_345_678;

    fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
        let crc = rtu::crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Reads one request off the logger side and returns its sequence number and modbus frame.
    async fn read_request(logger: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 11];
        logger.read_exact(&mut header).await.unwrap();
        let length = u16::from_le_bytes([header[1], header[2]]) as usize;
        let mut rest = vec![0u8; length + 2];
        logger.read_exact(&mut rest).await.unwrap();
        (header[5], rest[15..length].to_vec())
    }

    #[tokio::test]
    async fn reads_registers_through_logger() {
        let (client, mut logger) = duplex(1024);
        let mut transport = SolarmanV5::new(client, SERIAL, 1, Duration::from_secs(1));

        let logger_task = tokio::spawn(async move {
            let (sequence, request) = read_request(&mut logger).await;
            assert_eq!(request, rtu::read_holding_registers_request(1, 0x0056, 2));

            // heartbeat noise before the real answer
            let mut heartbeat = frame::response_frame(sequence, SERIAL, &[0; 4]);
            heartbeat[3..5].copy_from_slice(&frame::CONTROL_HEARTBEAT.to_le_bytes());
            let sum = heartbeat[1..heartbeat.len() - 2].iter().fold(0u8, |s, b| s.wrapping_add(*b));
            let at = heartbeat.len() - 2;
            heartbeat[at] = sum;
            logger.write_all(&heartbeat).await.unwrap();

            let modbus = with_crc(vec![0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]);
            logger
                .write_all(&frame::response_frame(sequence, SERIAL, &modbus))
                .await
                .unwrap();
        });

        let words = transport.read_holding_registers(0x0056, 2).await.unwrap();
        assert_eq!(words, vec![0x0001, 0x0002]);
        logger_task.await.unwrap();
    }

    #[tokio::test]
    async fn formatted_read_scales_value() {
        let (client, mut logger) = duplex(1024);
        let mut transport = SolarmanV5::new(client, SERIAL, 1, Duration::from_secs(1));

        tokio::spawn(async move {
            let (sequence, _) = read_request(&mut logger).await;
            let modbus = with_crc(vec![0x01, 0x03, 0x02, 0x09, 0x1D]);
            logger
                .write_all(&frame::response_frame(sequence, SERIAL, &modbus))
                .await
                .unwrap();
        });

        let voltage = transport.read_holding_register_formatted(0x0049, 1, 0.1).await.unwrap();
        assert!((voltage - 233.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn writes_registers_and_checks_echo() {
        let (client, mut logger) = duplex(1024);
        let mut transport = SolarmanV5::new(client, SERIAL, 1, Duration::from_secs(1));

        tokio::spawn(async move {
            let (sequence, request) = read_request(&mut logger).await;
            assert_eq!(request[1], rtu::WRITE_MULTIPLE_REGISTERS);
            let modbus = with_crc(vec![0x01, 0x10, 0x00, 0x16, 0x00, 0x03]);
            logger
                .write_all(&frame::response_frame(sequence, SERIAL, &modbus))
                .await
                .unwrap();
        });

        transport
            .write_multiple_holding_registers(0x0016, &[0x1A0A, 0x110E, 0x0000])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_foreign_logger_serial() {
        let (client, mut logger) = duplex(1024);
        let mut transport = SolarmanV5::new(client, SERIAL, 1, Duration::from_secs(1));

        tokio::spawn(async move {
            let (sequence, _) = read_request(&mut logger).await;
            let modbus = with_crc(vec![0x01, 0x03, 0x02, 0x00, 0x00]);
            logger
                .write_all(&frame::response_frame(sequence, SERIAL + 1, &modbus))
                .await
                .unwrap();
        });

        assert!(matches!(
            transport.read_holding_registers(0x003C, 1).await,
            Err(TransportError::Mismatch(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_logger_stays_silent() {
        let (client, _logger) = duplex(1024);
        let mut transport = SolarmanV5::new(client, SERIAL, 1, Duration::from_secs(10));

        assert!(matches!(
            transport.read_holding_registers(0x003C, 1).await,
            Err(TransportError::Timeout(_))
        ));
    }
}
