//! Solarman V5 data-logger transport
//!
//! Solarman Wi-Fi sticks tunnel Modbus RTU frames inside a proprietary V5
//! envelope over TCP (default port 8899):
//!
//! ```text
//! A5 | len(2, LE) | control(2) | seq | 00 | logger serial(4, LE) | payload | checksum | 15
//! ```
//!
//! The request payload is a 15 byte prefix followed by the RTU frame; the
//! response payload has a 14 byte prefix. The checksum is the byte sum of
//! everything between the start byte and the checksum.

use super::{Request, Transport};
use crate::error::{HeliosError, Result};
use crate::logging::{StructuredLogger, get_logger};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const DEFAULT_PORT: u16 = 8899;

const START: u8 = 0xA5;
const END: u8 = 0x15;
const HEADER_LEN: usize = 11;
const REQUEST_CONTROL: [u8; 2] = [0x10, 0x45];
const RESPONSE_CONTROL: [u8; 2] = [0x10, 0x15];
const REQUEST_PREFIX_LEN: usize = 15;
const RESPONSE_PREFIX_LEN: usize = 14;
// heartbeats and other unsolicited frames skipped while waiting
const MAX_SKIPPED_FRAMES: usize = 4;

/// Modbus CRC16 (polynomial 0xA001, initial 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn function_code(request: &Request) -> u8 {
    match request {
        Request::ReadCoils { .. } => 0x01,
        Request::ReadHoldingRegisters { .. } => 0x03,
        Request::ReadInputRegisters { .. } => 0x04,
        Request::WriteSingleCoil { .. } => 0x05,
        Request::WriteSingleRegister { .. } => 0x06,
        Request::WriteMultipleRegisters { .. } => 0x10,
    }
}

/// RTU frame for `request`, CRC appended low byte first
pub fn rtu_request(slave: u8, request: &Request) -> Vec<u8> {
    let mut pdu = vec![slave, function_code(request)];
    match request {
        Request::ReadCoils { address, count }
        | Request::ReadHoldingRegisters { address, count }
        | Request::ReadInputRegisters { address, count } => {
            pdu.extend_from_slice(&address.to_be_bytes());
            pdu.extend_from_slice(&count.to_be_bytes());
        }
        Request::WriteSingleCoil { address, on } => {
            pdu.extend_from_slice(&address.to_be_bytes());
            let value: u16 = if *on { 0xFF00 } else { 0x0000 };
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        Request::WriteSingleRegister { address, value } => {
            pdu.extend_from_slice(&address.to_be_bytes());
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        Request::WriteMultipleRegisters { address, values } => {
            pdu.extend_from_slice(&address.to_be_bytes());
            pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
            pdu.push((values.len() * 2) as u8);
            for value in values {
                pdu.extend_from_slice(&value.to_be_bytes());
            }
        }
    }
    let crc = crc16(&pdu);
    pdu.extend_from_slice(&crc.to_le_bytes());
    pdu
}

/// Wrap an RTU frame in a V5 request envelope
pub fn encode_frame(sequence: u8, logger_serial: u32, rtu: &[u8]) -> Vec<u8> {
    let payload_len = (REQUEST_PREFIX_LEN + rtu.len()) as u16;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload_len as usize + 2);
    frame.push(START);
    frame.extend_from_slice(&payload_len.to_le_bytes());
    frame.extend_from_slice(&REQUEST_CONTROL);
    frame.push(sequence);
    frame.push(0x00);
    frame.extend_from_slice(&logger_serial.to_le_bytes());

    // frame type 2, then sensor type, total working, power on and offset time
    frame.push(0x02);
    frame.extend_from_slice(&[0u8; REQUEST_PREFIX_LEN - 1]);
    frame.extend_from_slice(rtu);

    frame.push(checksum(&frame[1..]));
    frame.push(END);
    frame
}

/// Control code of a complete V5 frame
fn control(frame: &[u8]) -> [u8; 2] {
    [frame[3], frame[4]]
}

/// Validate a V5 response envelope and return the embedded RTU frame
pub fn decode_frame(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < HEADER_LEN + 2 {
        return Err(HeliosError::modbus(format!(
            "solarman frame too short: {} bytes",
            frame.len()
        )));
    }
    if frame[0] != START || frame[frame.len() - 1] != END {
        return Err(HeliosError::modbus("invalid solarman frame delimiters"));
    }

    let payload_len = usize::from(u16::from_le_bytes([frame[1], frame[2]]));
    if payload_len != frame.len() - HEADER_LEN - 2 {
        return Err(HeliosError::modbus(format!(
            "solarman frame length mismatch: header {}, actual {}",
            payload_len,
            frame.len() - HEADER_LEN - 2
        )));
    }

    let expected = checksum(&frame[1..frame.len() - 2]);
    if frame[frame.len() - 2] != expected {
        return Err(HeliosError::modbus("invalid solarman checksum"));
    }
    if control(frame) != RESPONSE_CONTROL {
        return Err(HeliosError::modbus(format!(
            "unexpected solarman control code {:02x}{:02x}",
            frame[4], frame[3]
        )));
    }

    let payload = &frame[HEADER_LEN..frame.len() - 2];
    if payload.len() < RESPONSE_PREFIX_LEN {
        return Err(HeliosError::modbus("solarman payload too short"));
    }
    Ok(&payload[RESPONSE_PREFIX_LEN..])
}

/// Validate an RTU response and return its data bytes; writes return an
/// empty vector
pub fn parse_rtu_response(slave: u8, request: &Request, rtu: &[u8]) -> Result<Vec<u8>> {
    if rtu.len() < 5 {
        return Err(HeliosError::modbus(format!(
            "rtu response too short: {}",
            hex::encode(rtu)
        )));
    }

    let (body, crc) = rtu.split_at(rtu.len() - 2);
    if crc16(body).to_le_bytes() != [crc[0], crc[1]] {
        return Err(HeliosError::modbus("invalid rtu crc"));
    }
    if body[0] != slave {
        return Err(HeliosError::modbus(format!(
            "unexpected slave id {} (want {})",
            body[0], slave
        )));
    }

    let expected = function_code(request);
    if body[1] == expected | 0x80 {
        return Err(HeliosError::modbus(format!(
            "exception code {} for function {:#04x}",
            body[2], expected
        )));
    }
    if body[1] != expected {
        return Err(HeliosError::modbus(format!(
            "unexpected function code {:#04x} (want {:#04x})",
            body[1], expected
        )));
    }

    match request {
        Request::ReadCoils { .. }
        | Request::ReadHoldingRegisters { .. }
        | Request::ReadInputRegisters { .. } => {
            let count = usize::from(body[2]);
            body.get(3..3 + count).map(<[u8]>::to_vec).ok_or_else(|| {
                HeliosError::modbus(format!("truncated rtu response: {}", hex::encode(rtu)))
            })
        }
        _ => Ok(Vec::new()),
    }
}

/// Modbus access through a Solarman data logger
pub struct SolarmanTransport {
    address: String,
    logger_serial: u32,
    sequence: u8,
    stream: Option<TcpStream>,
    logger: StructuredLogger,
}

impl SolarmanTransport {
    pub fn new(address: &str, logger_serial: u32) -> Self {
        Self {
            address: address.to_string(),
            logger_serial,
            sequence: 0,
            stream: None,
            logger: get_logger("solarman"),
        }
    }

    async fn stream(&mut self) -> Result<&mut TcpStream> {
        if self.stream.is_none() {
            self.logger
                .debug(&format!("connecting to {}", self.address));
            let stream = TcpStream::connect(&self.address).await?;
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| HeliosError::modbus("solarman not connected"))
    }

    async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; HEADER_LEN];
        stream.read_exact(&mut frame).await?;
        if frame[0] != START {
            return Err(HeliosError::modbus("invalid solarman start byte"));
        }
        let payload_len = usize::from(u16::from_le_bytes([frame[1], frame[2]]));
        frame.resize(HEADER_LEN + payload_len + 2, 0);
        stream.read_exact(&mut frame[HEADER_LEN..]).await?;
        Ok(frame)
    }

    async fn exchange(&mut self, slave: u8, request: &Request) -> Result<Vec<u8>> {
        self.sequence = self.sequence.wrapping_add(1);
        let frame = encode_frame(self.sequence, self.logger_serial, &rtu_request(slave, request));
        let logger = self.logger.clone();
        let stream = self.stream().await?;

        logger.trace(&format!("send {}", hex::encode(&frame)));
        stream.write_all(&frame).await?;

        for _ in 0..=MAX_SKIPPED_FRAMES {
            let response = Self::read_frame(stream).await?;
            logger.trace(&format!("recv {}", hex::encode(&response)));
            if control(&response) != RESPONSE_CONTROL {
                continue;
            }
            let rtu = decode_frame(&response)?;
            return parse_rtu_response(slave, request, rtu);
        }
        Err(HeliosError::modbus("no solarman response frame"))
    }
}

#[async_trait]
impl Transport for SolarmanTransport {
    async fn connect(&mut self) -> Result<bool> {
        if self.stream.is_some() {
            return Ok(false);
        }
        self.stream().await?;
        Ok(true)
    }

    async fn call(&mut self, slave: u8, request: &Request) -> Result<Vec<u8>> {
        let result = self.exchange(slave, request).await;
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn reset(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_frame(rtu: &[u8]) -> Vec<u8> {
        let payload_len = (RESPONSE_PREFIX_LEN + rtu.len()) as u16;
        let mut frame = vec![START];
        frame.extend_from_slice(&payload_len.to_le_bytes());
        frame.extend_from_slice(&RESPONSE_CONTROL);
        frame.extend_from_slice(&[0x01, 0x00, 0x78, 0x56, 0x34, 0x12]);
        frame.push(0x02);
        frame.extend_from_slice(&[0u8; RESPONSE_PREFIX_LEN - 1]);
        frame.extend_from_slice(rtu);
        frame.push(checksum(&frame[1..]));
        frame.push(END);
        frame
    }

    #[test]
    fn test_crc16_known_value() {
        // read holding 0x0000 x 10 from slave 1
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(crc16(&frame).to_le_bytes(), [0xC5, 0xCD]);
    }

    #[test]
    fn test_request_frame_layout() {
        let rtu = rtu_request(
            1,
            &Request::ReadHoldingRegisters {
                address: 0x0000,
                count: 10,
            },
        );
        assert_eq!(rtu, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);

        let frame = encode_frame(7, 0x1234_5678, &rtu);
        assert_eq!(frame.len(), HEADER_LEN + REQUEST_PREFIX_LEN + rtu.len() + 2);
        assert_eq!(frame[0], START);
        assert_eq!(u16::from_le_bytes([frame[1], frame[2]]), 23);
        assert_eq!(&frame[3..5], &REQUEST_CONTROL);
        assert_eq!(frame[5], 7);
        assert_eq!(&frame[7..11], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(frame[11], 0x02);
        assert_eq!(frame[frame.len() - 2], checksum(&frame[1..frame.len() - 2]));
        assert_eq!(frame[frame.len() - 1], END);
    }

    #[test]
    fn test_decode_response() {
        let request = Request::ReadHoldingRegisters {
            address: 0x10,
            count: 1,
        };
        let mut rtu = vec![0x01, 0x03, 0x02, 0x01, 0x2C];
        let crc = crc16(&rtu);
        rtu.extend_from_slice(&crc.to_le_bytes());

        let frame = response_frame(&rtu);
        let inner = decode_frame(&frame).unwrap();
        assert_eq!(parse_rtu_response(1, &request, inner).unwrap(), vec![0x01, 0x2C]);

        let mut corrupted = frame.clone();
        let n = corrupted.len();
        corrupted[n - 2] = corrupted[n - 2].wrapping_add(1);
        assert!(decode_frame(&corrupted).is_err());
    }

    #[test]
    fn test_exception_response() {
        let request = Request::ReadInputRegisters {
            address: 0,
            count: 1,
        };
        let mut rtu = vec![0x01, 0x84, 0x02];
        let crc = crc16(&rtu);
        rtu.extend_from_slice(&crc.to_le_bytes());
        let err = parse_rtu_response(1, &request, &rtu).unwrap_err();
        assert!(err.to_string().contains("exception code 2"));
    }
}
