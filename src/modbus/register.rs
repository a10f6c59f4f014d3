//! Register descriptors
//!
//! A register resolves to a function code, start address and register count
//! plus the numeric encoding used to decode reads and encode writes.

use super::Request;
use crate::error::{HeliosError, Result};
use crate::pipeline::decode::{Encoding, bytes_to_registers};
use serde::Deserialize;

/// Modbus function codes used by register operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }
}

/// Register configuration as written by users
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Register {
    pub address: u16,
    #[serde(rename = "type")]
    pub kind: String,
    pub encoding: Option<String>,
    /// older spelling of `encoding`
    pub decode: Option<String>,
    pub bitmask: Option<String>,
}

impl Register {
    fn encoding_name(&self) -> Result<&str> {
        match (self.encoding.as_deref(), self.decode.as_deref()) {
            (Some(_), Some(_)) => Err(HeliosError::config(
                "register must not have both decode and encoding",
            )),
            (Some(e), None) | (None, Some(e)) if !e.trim().is_empty() => Ok(e),
            _ => Err(HeliosError::config("register encoding is required")),
        }
    }

    /// Resolve the descriptor into an executable operation
    pub fn operation(&self) -> Result<Operation> {
        if self.kind.trim().is_empty() {
            return Err(HeliosError::config("register type is required"));
        }
        let encoding = Encoding::parse(self.encoding_name()?, self.bitmask.as_deref())?;

        let function = match self.kind.trim().to_lowercase().as_str() {
            "holding" => FunctionCode::ReadHoldingRegisters,
            "input" => FunctionCode::ReadInputRegisters,
            "coil" => FunctionCode::ReadCoils,
            "writesingle" | "writeholding" => FunctionCode::WriteSingleRegister,
            "writemultiple" | "writeholdings" => FunctionCode::WriteMultipleRegisters,
            "writecoil" => FunctionCode::WriteSingleCoil,
            other => {
                return Err(HeliosError::config(format!("invalid register type: {}", other)));
            }
        };

        Ok(Operation {
            function,
            address: self.address,
            length: encoding.registers(),
            encoding,
        })
    }
}

/// Executable register access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub function: FunctionCode,
    pub address: u16,
    pub length: u16,
    pub encoding: Encoding,
}

impl Operation {
    pub fn is_read(&self) -> bool {
        self.function.is_read()
    }

    pub fn read_request(&self) -> Result<Request> {
        let (address, count) = (self.address, self.length);
        match self.function {
            FunctionCode::ReadHoldingRegisters => Ok(Request::ReadHoldingRegisters { address, count }),
            FunctionCode::ReadInputRegisters => Ok(Request::ReadInputRegisters { address, count }),
            FunctionCode::ReadCoils => Ok(Request::ReadCoils { address, count }),
            other => Err(HeliosError::config(format!(
                "register is not readable: {:?}",
                other
            ))),
        }
    }

    /// Decode a read response; non-finite results become zero
    pub fn decode(&self, bytes: &[u8]) -> Result<f64> {
        self.encoding.decode(bytes)
    }

    /// Build the write request for an already scaled value
    pub fn write_request(&self, value: f64) -> Result<Request> {
        let address = self.address;
        match self.function {
            FunctionCode::WriteSingleRegister => {
                let registers = bytes_to_registers(&self.encoding.encode(value));
                match registers.as_slice() {
                    [word] => Ok(Request::WriteSingleRegister {
                        address,
                        value: *word,
                    }),
                    _ => Err(HeliosError::config(format!(
                        "invalid write length: {}",
                        registers.len()
                    ))),
                }
            }
            FunctionCode::WriteMultipleRegisters => Ok(Request::WriteMultipleRegisters {
                address,
                values: bytes_to_registers(&self.encoding.encode(value)),
            }),
            FunctionCode::WriteSingleCoil => Ok(Request::WriteSingleCoil {
                address,
                on: value != 0.0,
            }),
            other => Err(HeliosError::config(format!(
                "register is not writable: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(kind: &str, encoding: &str) -> Register {
        Register {
            address: 100,
            kind: kind.to_string(),
            encoding: Some(encoding.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_operation_lengths() {
        let op = register("holding", "float32").operation().unwrap();
        assert_eq!(op.function, FunctionCode::ReadHoldingRegisters);
        assert_eq!(op.length, 2);
        assert_eq!(register("input", "uint64").operation().unwrap().length, 4);
        assert_eq!(register("coil", "bool8").operation().unwrap().length, 1);
        assert!(register("writeholdings", "int32").operation().unwrap().function
            == FunctionCode::WriteMultipleRegisters);
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!(register("bogus", "int16").operation().is_err());
        assert!(register("holding", "int24").operation().is_err());
        assert!(register("", "int16").operation().is_err());

        let mut both = register("holding", "int16");
        both.decode = Some("int16".to_string());
        assert!(both.operation().is_err());

        let bool16 = register("holding", "bool16");
        assert!(bool16.operation().is_err());
    }

    #[test]
    fn test_write_requests() {
        let op = register("writecoil", "bool8").operation().unwrap();
        assert_eq!(
            op.write_request(1.0).unwrap(),
            Request::WriteSingleCoil {
                address: 100,
                on: true
            }
        );

        let op = register("writesingle", "int16").operation().unwrap();
        assert_eq!(
            op.write_request(-2.0).unwrap(),
            Request::WriteSingleRegister {
                address: 100,
                value: 0xFFFE
            }
        );
        assert!(register("writesingle", "int32").operation().unwrap().write_request(1.0).is_err());

        let op = register("writemultiple", "uint32s").operation().unwrap();
        assert_eq!(
            op.write_request(65536.0).unwrap(),
            Request::WriteMultipleRegisters {
                address: 100,
                values: vec![0x0000, 0x0001]
            }
        );
        assert!(op.read_request().is_err());
    }
}
