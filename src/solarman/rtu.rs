//! Modbus RTU request/response frames as carried inside a Solarman V5 payload.

use super::TransportError;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

const EXCEPTION_BIT: u8 = 0x80;

/// Modbus protocol limits for a single request.
pub const MAX_READ_QUANTITY: u16 = 125;
pub const MAX_WRITE_QUANTITY: u16 = 123;

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

fn finish(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

pub fn read_holding_registers_request(slave_id: u8, addr: u16, quantity: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave_id);
    frame.push(READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&addr.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    finish(frame)
}

pub fn write_multiple_registers_request(slave_id: u8, addr: u16, values: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9 + values.len() * 2);
    frame.push(slave_id);
    frame.push(WRITE_MULTIPLE_REGISTERS);
    frame.extend_from_slice(&addr.to_be_bytes());
    frame.extend_from_slice(&(values.len() as u16).to_be_bytes());
    frame.push((values.len() * 2) as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    finish(frame)
}

/// Checks framing, CRC, slave id and function code, returning the bytes after the function code.
fn validate(slave_id: u8, function: u8, frame: &[u8]) -> Result<&[u8], TransportError> {
    if frame.len() < 5 {
        return Err(TransportError::Frame(format!("RTU frame too short: {} bytes", frame.len())));
    }

    let (body, crc) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc[0], crc[1]]);
    let calculated = crc16(body);
    if received != calculated {
        return Err(TransportError::Crc { expected: calculated, received });
    }

    if body[0] != slave_id {
        return Err(TransportError::Mismatch(format!(
            "slave id {} in response, expected {slave_id}",
            body[0]
        )));
    }

    if body[1] == function | EXCEPTION_BIT {
        return Err(TransportError::Exception { function, code: body[2] });
    }

    if body[1] != function {
        return Err(TransportError::Mismatch(format!(
            "function code {:#04x} in response, expected {function:#04x}",
            body[1]
        )));
    }

    Ok(&body[2..])
}

pub fn parse_read_holding_registers(slave_id: u8, quantity: u16, frame: &[u8]) -> Result<Vec<u16>, TransportError> {
    let data = validate(slave_id, READ_HOLDING_REGISTERS, frame)?;

    let byte_count = data[0] as usize;
    let registers = &data[1..];

    if byte_count != registers.len() || byte_count != quantity as usize * 2 {
        return Err(TransportError::Mismatch(format!(
            "byte count {byte_count} with {} data bytes for {quantity} registers",
            registers.len()
        )));
    }

    Ok(registers
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn parse_write_multiple_registers(
    slave_id: u8,
    addr: u16,
    quantity: u16,
    frame: &[u8],
) -> Result<(), TransportError> {
    let data = validate(slave_id, WRITE_MULTIPLE_REGISTERS, frame)?;

    if data.len() != 4 {
        return Err(TransportError::Frame(format!("write response of {} bytes", data.len())));
    }

    let echoed_addr = u16::from_be_bytes([data[0], data[1]]);
    let echoed_quantity = u16::from_be_bytes([data[2], data[3]]);

    if echoed_addr != addr || echoed_quantity != quantity {
        return Err(TransportError::Mismatch(format!(
            "write echoed {echoed_quantity} registers at {echoed_addr:#06x}, sent {quantity} at {addr:#06x}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_of_known_read_request() {
        // 01 03 00 00 00 0A -> C5 CD
        let frame = read_holding_registers_request(1, 0x0000, 10);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
    }

    #[test]
    fn write_request_layout() {
        let frame = write_multiple_registers_request(1, 0x0016, &[0x1701, 0x050A, 0x1E00]);
        assert_eq!(
            &frame[..13],
            &[0x01, 0x10, 0x00, 0x16, 0x00, 0x03, 0x06, 0x17, 0x01, 0x05, 0x0A, 0x1E, 0x00]
        );
        assert_eq!(frame.len(), 15);
        assert_eq!(crc16(&frame[..13]).to_le_bytes(), [frame[13], frame[14]]);
    }

    #[test]
    fn parses_read_response() {
        let frame = finish(vec![0x01, 0x03, 0x04, 0x00, 0x2A, 0x12, 0x34]);
        assert_eq!(parse_read_holding_registers(1, 2, &frame).unwrap(), vec![0x002A, 0x1234]);
    }

    #[test]
    fn rejects_bad_crc() {
        let mut frame = finish(vec![0x01, 0x03, 0x02, 0x00, 0x2A]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            parse_read_holding_registers(1, 1, &frame),
            Err(TransportError::Crc { .. })
        ));
    }

    #[test]
    fn reports_exception_response() {
        let frame = finish(vec![0x01, 0x83, 0x02]);
        assert!(matches!(
            parse_read_holding_registers(1, 1, &frame),
            Err(TransportError::Exception { function: 0x03, code: 0x02 })
        ));
    }

    #[test]
    fn rejects_short_read_payload() {
        let frame = finish(vec![0x01, 0x03, 0x02, 0x00, 0x2A]);
        assert!(matches!(
            parse_read_holding_registers(1, 2, &frame),
            Err(TransportError::Mismatch(_))
        ));
    }

    #[test]
    fn checks_write_echo() {
        let ok = finish(vec![0x01, 0x10, 0x00, 0x16, 0x00, 0x03]);
        assert!(parse_write_multiple_registers(1, 0x0016, 3, &ok).is_ok());

        let wrong = finish(vec![0x01, 0x10, 0x00, 0x17, 0x00, 0x03]);
        assert!(parse_write_multiple_registers(1, 0x0016, 3, &wrong).is_err());
    }
}
