//! Fixed binary numeric encodings shared by the HTTP decode stage and the
//! Modbus register operations. Multi-register values are big-endian; the
//! `s` variants carry the least significant 16-bit word first.

use crate::error::{HeliosError, Result};

/// Binary numeric encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Bool8,
    Bool16 { mask: u16 },
    Int16,
    Int16Nan,
    Uint16,
    Uint16Nan,
    Int32,
    Int32s,
    Int32Nan,
    Uint32,
    Uint32s,
    Uint32Nan,
    Float32,
    Float32s,
    Uint64,
    Uint64Nan,
    Float64,
}

impl Encoding {
    /// Parse an encoding name; `bitmask` is only used by `bool16`
    pub fn parse(name: &str, bitmask: Option<&str>) -> Result<Self> {
        let enc = match name.trim().to_lowercase().as_str() {
            "bool8" => Encoding::Bool8,
            "bool16" => Encoding::Bool16 {
                mask: parse_mask(bitmask)?,
            },
            "int16" => Encoding::Int16,
            "int16nan" => Encoding::Int16Nan,
            "uint16" => Encoding::Uint16,
            "uint16nan" => Encoding::Uint16Nan,
            "int32" => Encoding::Int32,
            "int32s" => Encoding::Int32s,
            "int32nan" => Encoding::Int32Nan,
            "uint32" => Encoding::Uint32,
            "uint32s" => Encoding::Uint32s,
            "uint32nan" => Encoding::Uint32Nan,
            "float32" | "ieee754" => Encoding::Float32,
            "float32s" | "ieee754s" => Encoding::Float32s,
            "uint64" => Encoding::Uint64,
            "uint64nan" => Encoding::Uint64Nan,
            "float64" => Encoding::Float64,
            other => {
                return Err(HeliosError::config(format!("invalid encoding: {}", other)));
            }
        };
        Ok(enc)
    }

    /// Number of bytes consumed by the encoding
    pub fn byte_len(self) -> usize {
        match self {
            Encoding::Bool8 => 1,
            Encoding::Bool16 { .. }
            | Encoding::Int16
            | Encoding::Int16Nan
            | Encoding::Uint16
            | Encoding::Uint16Nan => 2,
            Encoding::Int32
            | Encoding::Int32s
            | Encoding::Int32Nan
            | Encoding::Uint32
            | Encoding::Uint32s
            | Encoding::Uint32Nan
            | Encoding::Float32
            | Encoding::Float32s => 4,
            Encoding::Uint64 | Encoding::Uint64Nan | Encoding::Float64 => 8,
        }
    }

    /// Number of 16-bit registers covering the encoding
    pub fn registers(self) -> u16 {
        (self.byte_len() as u16).div_ceil(2)
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            Encoding::Float32 | Encoding::Float32s | Encoding::Float64
        )
    }

    /// Decode the leading bytes of `b` into a float.
    /// Non-finite results and NaN marker values read as zero.
    pub fn decode(self, b: &[u8]) -> Result<f64> {
        let n = self.byte_len();
        if b.len() < n {
            return Err(HeliosError::transform(format!(
                "{:?} needs {} bytes, got {}",
                self, n, b.len()
            )));
        }

        let u16_at = |i: usize| u16::from_be_bytes([b[i], b[i + 1]]);
        let u32_be = || u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let u32_swapped = || u32::from_be_bytes([b[2], b[3], b[0], b[1]]);
        let u64_be = || u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);

        let value = match self {
            Encoding::Bool8 => f64::from(u8::from(b[0] != 0)),
            Encoding::Bool16 { mask } => f64::from(u8::from(u16_at(0) & mask != 0)),
            Encoding::Int16 => f64::from(u16_at(0) as i16),
            Encoding::Int16Nan => match u16_at(0) {
                0x8000 | 0x7FFF => f64::NAN,
                u => f64::from(u as i16),
            },
            Encoding::Uint16 => f64::from(u16_at(0)),
            Encoding::Uint16Nan => match u16_at(0) {
                0xFFFF => f64::NAN,
                u => f64::from(u),
            },
            Encoding::Int32 => f64::from(u32_be() as i32),
            Encoding::Int32s => f64::from(u32_swapped() as i32),
            Encoding::Int32Nan => match u32_be() {
                0x8000_0000 | 0x7FFF_FFFF => f64::NAN,
                u => f64::from(u as i32),
            },
            Encoding::Uint32 => f64::from(u32_be()),
            Encoding::Uint32s => f64::from(u32_swapped()),
            Encoding::Uint32Nan => match u32_be() {
                0xFFFF_FFFF => f64::NAN,
                u => f64::from(u),
            },
            Encoding::Float32 => f64::from(f32::from_bits(u32_be())),
            Encoding::Float32s => f64::from(f32::from_bits(u32_swapped())),
            Encoding::Uint64 => u64_be() as f64,
            Encoding::Uint64Nan => match u64_be() {
                u64::MAX => f64::NAN,
                u => u as f64,
            },
            Encoding::Float64 => f64::from_bits(u64_be()),
        };

        Ok(if value.is_finite() { value } else { 0.0 })
    }

    /// Encode a value into the byte layout of this encoding
    pub fn encode(self, value: f64) -> Vec<u8> {
        let swap = |b: [u8; 4]| vec![b[2], b[3], b[0], b[1]];
        let int = value.round();

        match self {
            Encoding::Bool8 => vec![u8::from(value != 0.0)],
            Encoding::Bool16 { mask } => {
                let v = if value != 0.0 { mask } else { 0 };
                v.to_be_bytes().to_vec()
            }
            Encoding::Int16 | Encoding::Int16Nan => (int as i16).to_be_bytes().to_vec(),
            Encoding::Uint16 | Encoding::Uint16Nan => (int as u16).to_be_bytes().to_vec(),
            Encoding::Int32 | Encoding::Int32Nan => (int as i32).to_be_bytes().to_vec(),
            Encoding::Int32s => swap((int as i32).to_be_bytes()),
            Encoding::Uint32 | Encoding::Uint32Nan => (int as u32).to_be_bytes().to_vec(),
            Encoding::Uint32s => swap((int as u32).to_be_bytes()),
            Encoding::Float32 => (value as f32).to_be_bytes().to_vec(),
            Encoding::Float32s => swap((value as f32).to_be_bytes()),
            Encoding::Uint64 | Encoding::Uint64Nan => (int as u64).to_be_bytes().to_vec(),
            Encoding::Float64 => value.to_be_bytes().to_vec(),
        }
    }
}

fn parse_mask(bitmask: Option<&str>) -> Result<u16> {
    let raw = bitmask
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HeliosError::config("bool16 requires a bitmask"))?;
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => raw.parse::<u16>(),
    };
    parsed.map_err(|_| HeliosError::config(format!("invalid bitmask: {}", raw)))
}

/// Pack 16-bit registers into big-endian bytes
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Split big-endian bytes into 16-bit registers, padding an odd tail
pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|c| match c {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [lo] => u16::from(*lo),
            _ => 0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_values() {
        assert!((Encoding::Float32.decode(&[0x3F, 0x80, 0, 0]).unwrap() - 1.0).abs() < f64::EPSILON);
        assert!((Encoding::Float32s.decode(&[0, 0, 0x3F, 0x80]).unwrap() - 1.0).abs() < f64::EPSILON);
        assert_eq!(Encoding::Int16.decode(&[0xFF, 0xFE]).unwrap(), -2.0);
        assert_eq!(Encoding::Uint32s.decode(&[0x00, 0x01, 0x00, 0x00]).unwrap(), 1.0);
        assert_eq!(Encoding::Int32.decode(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap(), -1.0);
    }

    #[test]
    fn test_decode_nan_markers_and_short_input() {
        assert_eq!(Encoding::Uint16Nan.decode(&[0xFF, 0xFF]).unwrap(), 0.0);
        assert_eq!(Encoding::Int32Nan.decode(&[0x80, 0, 0, 0]).unwrap(), 0.0);
        assert_eq!(Encoding::Float32.decode(&[0x7F, 0xC0, 0, 0]).unwrap(), 0.0);
        assert!(Encoding::Uint32.decode(&[0, 1]).is_err());
    }

    #[test]
    fn test_bool16_mask() {
        let enc = Encoding::parse("bool16", Some("0x0004")).unwrap();
        assert_eq!(enc.decode(&[0x00, 0x04]).unwrap(), 1.0);
        assert_eq!(enc.decode(&[0x00, 0x03]).unwrap(), 0.0);
        assert!(Encoding::parse("bool16", None).is_err());
    }

    #[test]
    fn test_round_trip_recovers_magnitude() {
        let cases = [
            ("int16", -1234.0, 0.0),
            ("uint16", 54321.0, 0.0),
            ("int32", -7_654_321.0, 0.0),
            ("int32s", 7_654_321.0, 0.0),
            ("uint32", 4_000_000_000.0, 0.0),
            ("uint32s", 123_456.0, 0.0),
            ("uint64", 9_007_199_254_740_000.0, 0.0),
            ("float32", 230.45, 1e-4),
            ("ieee754s", -0.125, 0.0),
            ("float64", 12_345.678_9, 0.0),
        ];
        for (name, value, tolerance) in cases {
            let enc = Encoding::parse(name, None).unwrap();
            let bytes = enc.encode(value);
            assert_eq!(bytes.len(), enc.byte_len(), "{name}");
            let decoded = enc.decode(&bytes).unwrap();
            assert!((decoded - value).abs() <= tolerance, "{name}: {decoded} != {value}");
        }
    }

    #[test]
    fn test_register_packing() {
        let regs = [0x3F80u16, 0x0000];
        let bytes = registers_to_bytes(&regs);
        assert_eq!(bytes, vec![0x3F, 0x80, 0x00, 0x00]);
        assert_eq!(bytes_to_registers(&bytes), regs.to_vec());
        assert_eq!(Encoding::Float64.registers(), 4);
        assert_eq!(Encoding::Bool8.registers(), 1);
    }
}
