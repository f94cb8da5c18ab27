//! Solarman V5 envelope: the data logger wraps every Modbus RTU frame in this header/trailer.

use super::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

const START: u8 = 0xA5;
const END: u8 = 0x15;

pub const CONTROL_REQUEST: u16 = 0x4510;
pub const CONTROL_RESPONSE: u16 = 0x1510;
pub const CONTROL_HEARTBEAT: u16 = 0x4710;

const FRAME_TYPE_SOLAR_INVERTER: u8 = 0x02;

/// start + length + control + sequence (2) + logger serial
const HEADER_LEN: usize = 11;
/// checksum + end
const TRAILER_LEN: usize = 2;
/// frame type + sensor type (2) + delivery time + power-on time + offset time
const REQUEST_PAYLOAD_PREFIX: usize = 15;
/// frame type + status + total working time + power-on time + offset time
const RESPONSE_PAYLOAD_PREFIX: usize = 14;

#[derive(Debug, Clone)]
pub struct V5Request {
    pub sequence: u8,
    pub logger_serial: u32,
    pub modbus: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct V5Frame {
    pub control: u16,
    pub sequence: u8,
    pub logger_serial: u32,
    pub payload: Bytes,
}

impl V5Frame {
    /// Extracts the Modbus RTU frame from a response payload.
    pub fn modbus_frame(&self) -> Result<&[u8], TransportError> {
        if self.payload.len() <= RESPONSE_PAYLOAD_PREFIX {
            return Err(TransportError::Frame(format!(
                "response payload of {} bytes carries no modbus frame",
                self.payload.len()
            )));
        }

        if self.payload[0] != FRAME_TYPE_SOLAR_INVERTER {
            return Err(TransportError::Frame(format!("unexpected frame type {:#04x}", self.payload[0])));
        }

        Ok(&self.payload[RESPONSE_PAYLOAD_PREFIX..])
    }
}

fn checksum(frame: &[u8]) -> u8 {
    frame.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

#[derive(Debug, Default)]
pub struct V5Codec;

impl Encoder<V5Request> for V5Codec {
    type Error = TransportError;

    fn encode(&mut self, item: V5Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = REQUEST_PAYLOAD_PREFIX + item.modbus.len();
        let length = u16::try_from(length)
            .map_err(|_| TransportError::Frame(format!("request payload of {length} bytes does not fit")))?;

        let start = dst.len();
        dst.reserve(HEADER_LEN + length as usize + TRAILER_LEN);

        dst.put_u8(START);
        dst.put_u16_le(length);
        dst.put_u16_le(CONTROL_REQUEST);
        dst.put_u8(item.sequence);
        dst.put_u8(0x00);
        dst.put_u32_le(item.logger_serial);

        dst.put_u8(FRAME_TYPE_SOLAR_INVERTER);
        dst.put_u16_le(0x0000);
        dst.put_u32_le(0);
        dst.put_u32_le(0);
        dst.put_u32_le(0);
        dst.put_slice(&item.modbus);

        let sum = checksum(&dst[start + 1..]);
        dst.put_u8(sum);
        dst.put_u8(END);

        trace!("V5 request: {:02X?}", &dst[start..]);
        Ok(())
    }
}

impl Decoder for V5Codec {
    type Item = V5Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|&b| b == START) {
            Some(0) => {},
            Some(garbage) => src.advance(garbage),
            None => {
                src.clear();
                return Ok(None);
            },
        }

        if src.len() < 3 {
            return Ok(None);
        }

        let length = u16::from_le_bytes([src[1], src[2]]) as usize;
        let total = HEADER_LEN + length + TRAILER_LEN;

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total).freeze();
        trace!("V5 frame: {:02X?}", &frame[..]);

        if frame[total - 1] != END {
            return Err(TransportError::Frame(format!("bad end byte {:#04x}", frame[total - 1])));
        }

        let expected = checksum(&frame[1..total - 2]);
        let received = frame[total - 2];
        if expected != received {
            return Err(TransportError::Checksum { expected, received });
        }

        Ok(Some(V5Frame {
            control: u16::from_le_bytes([frame[3], frame[4]]),
            sequence: frame[5],
            logger_serial: u32::from_le_bytes([frame[7], frame[8], frame[9], frame[10]]),
            payload: frame.slice(HEADER_LEN..total - TRAILER_LEN),
        }))
    }
}

/// Builds a logger response frame around `modbus`; used by tests standing in for the logger.
#[cfg(test)]
pub fn response_frame(sequence: u8, logger_serial: u32, modbus: &[u8]) -> Vec<u8> {
    let length = (RESPONSE_PAYLOAD_PREFIX + modbus.len()) as u16;

    let mut frame = vec![START];
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&CONTROL_RESPONSE.to_le_bytes());
    frame.push(sequence);
    frame.push(0x01);
    frame.extend_from_slice(&logger_serial.to_le_bytes());
    frame.push(FRAME_TYPE_SOLAR_INVERTER);
    frame.push(0x01);
    frame.extend_from_slice(&[0; 12]);
    frame.extend_from_slice(modbus);
    frame.push(checksum(&frame[1..]));
    frame.push(END);
    frame
}
