//! Storage-manager configuration and row codecs.
//!
//! A table binds every column to exactly one named storage manager. Two
//! manager types exist: `StandardStMan` stores raw little-endian f32
//! components and is always registered; `QuantStMan` is the
//! compression-capable manager configured with per-value bit-widths, a
//! statistical distribution and a normalization mode. A manager's
//! configuration is fixed once registered — columns attached later inherit
//! it and cannot override it.
//!
//! The quantization codec here is intentionally plain (per-row scaled
//! uniform quantization with a reserved not-a-number code); the migration
//! engine treats it as an opaque collaborator.

use std::io;

use crate::cell::{CellKind, CellShape};
use crate::TabError;

/// Manager type name of the raw float storage manager
pub const STANDARD_MANAGER: &str = "StandardStMan";
/// Manager type name of the quantizing storage manager
pub const QUANT_MANAGER: &str = "QuantStMan";

#[inline]
fn err_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

const DIST_UNIFORM: u8 = 0;
const DIST_GAUSSIAN: u8 = 1;
const DIST_TRUNC_GAUSSIAN: u8 = 2;
const DIST_STUDENTS_T: u8 = 3;

const NORM_ROW: u8 = 0;
const NORM_AF: u8 = 1;
const NORM_RF: u8 = 2;

/// Statistical distribution assumed for quantization. Selecting a
/// distribution replaces any prior choice; exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    Uniform,
    Gaussian,
    TruncatedGaussian { truncation: f64 },
    StudentsT { dof: f64 },
}

impl std::fmt::Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Distribution::Uniform => write!(f, "Uniform"),
            Distribution::Gaussian => write!(f, "Gaussian"),
            Distribution::TruncatedGaussian { truncation } => {
                write!(f, "Truncated Gaussian with sigma={}", truncation)
            }
            Distribution::StudentsT { dof } => write!(f, "Student's t with nu={}", dof),
        }
    }
}

/// Rescaling strategy applied before quantization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Per-row normalization (can be unstable at low bit rates)
    Row,
    /// Artifact-free normalization
    Af,
    /// Reference-field normalization (recommended for high bit rates)
    Rf,
}

impl std::fmt::Display for Normalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Normalization::Row => write!(f, "Row"),
            Normalization::Af => write!(f, "AF"),
            Normalization::Rf => write!(f, "RF"),
        }
    }
}

/// Validated configuration of a quantizing storage manager.
///
/// Construction is the only validation point: a config that exists is a
/// config that can be registered. Once registered on a table the numeric
/// parameters never change.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub data_bits: u32,
    pub weight_bits: u32,
    pub distribution: Distribution,
    pub normalization: Normalization,
}

impl ManagerConfig {
    pub fn new(
        data_bits: u32,
        weight_bits: u32,
        distribution: Distribution,
        normalization: Normalization,
    ) -> crate::Result<Self> {
        if !(2..=32).contains(&data_bits) {
            return Err(TabError::InvalidConfig(format!(
                "data bit-width must be between 2 and 32, got {}",
                data_bits
            )));
        }
        if !(2..=32).contains(&weight_bits) {
            return Err(TabError::InvalidConfig(format!(
                "weight bit-width must be between 2 and 32, got {}",
                weight_bits
            )));
        }
        match distribution {
            Distribution::TruncatedGaussian { truncation } => {
                if !(truncation > 0.0) || !truncation.is_finite() {
                    return Err(TabError::InvalidConfig(format!(
                        "truncation must be > 0, got {}",
                        truncation
                    )));
                }
            }
            Distribution::StudentsT { dof } => {
                if !(dof > 0.0) || !dof.is_finite() {
                    return Err(TabError::InvalidConfig(format!(
                        "degrees of freedom must be > 0, got {}",
                        dof
                    )));
                }
            }
            Distribution::Uniform | Distribution::Gaussian => {}
        }
        Ok(Self {
            data_bits,
            weight_bits,
            distribution,
            normalization,
        })
    }

    /// Serialize for the table footer: [data_bits:u8][weight_bits:u8]
    /// [dist_tag:u8][norm_tag:u8][dist_param:f64]
    pub fn to_bytes(&self) -> Vec<u8> {
        let (dist_tag, param) = match self.distribution {
            Distribution::Uniform => (DIST_UNIFORM, 0.0),
            Distribution::Gaussian => (DIST_GAUSSIAN, 0.0),
            Distribution::TruncatedGaussian { truncation } => (DIST_TRUNC_GAUSSIAN, truncation),
            Distribution::StudentsT { dof } => (DIST_STUDENTS_T, dof),
        };
        let norm_tag = match self.normalization {
            Normalization::Row => NORM_ROW,
            Normalization::Af => NORM_AF,
            Normalization::Rf => NORM_RF,
        };
        let mut buf = Vec::with_capacity(12);
        buf.push(self.data_bits as u8);
        buf.push(self.weight_bits as u8);
        buf.push(dist_tag);
        buf.push(norm_tag);
        buf.extend_from_slice(&param.to_le_bytes());
        buf
    }

    /// Deserialize from footer bytes; returns the config and bytes consumed
    pub fn from_bytes(bytes: &[u8]) -> io::Result<(Self, usize)> {
        if bytes.len() < 12 {
            return Err(err_data("manager config truncated"));
        }
        let data_bits = bytes[0] as u32;
        let weight_bits = bytes[1] as u32;
        let param = f64::from_le_bytes(bytes[4..12].try_into().unwrap());
        let distribution = match bytes[2] {
            DIST_UNIFORM => Distribution::Uniform,
            DIST_GAUSSIAN => Distribution::Gaussian,
            DIST_TRUNC_GAUSSIAN => Distribution::TruncatedGaussian { truncation: param },
            DIST_STUDENTS_T => Distribution::StudentsT { dof: param },
            t => return Err(err_data(format!("unknown distribution tag {}", t))),
        };
        let normalization = match bytes[3] {
            NORM_ROW => Normalization::Row,
            NORM_AF => Normalization::Af,
            NORM_RF => Normalization::Rf,
            t => return Err(err_data(format!("unknown normalization tag {}", t))),
        };
        let config = ManagerConfig::new(data_bits, weight_bits, distribution, normalization)
            .map_err(|e| err_data(e.to_string()))?;
        Ok((config, 12))
    }
}

/// A registered storage manager instance: a name plus, for the quantizing
/// manager, its write-once configuration. Shared between all columns bound
/// to it via `Arc`.
#[derive(Debug)]
pub struct ManagerHandle {
    pub name: String,
    /// None for the raw float manager
    pub config: Option<ManagerConfig>,
}

impl ManagerHandle {
    pub fn standard() -> Self {
        Self {
            name: STANDARD_MANAGER.to_string(),
            config: None,
        }
    }

    pub fn quantizing(name: &str, config: ManagerConfig) -> Self {
        Self {
            name: name.to_string(),
            config: Some(config),
        }
    }

    fn bits_for(&self, kind: CellKind) -> io::Result<u32> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| err_data("raw manager has no bit-width"))?;
        match kind {
            CellKind::Complex => Ok(config.data_bits),
            CellKind::Float => Ok(config.weight_bits),
            CellKind::Bool => Err(err_data("boolean cells have no quantized form")),
        }
    }

    /// Encoded size of one row, fixed per column (fixed shape, fixed codec)
    pub fn row_size(&self, kind: CellKind, shape: &CellShape) -> usize {
        let components = shape.cell_count() * kind.components();
        match (kind, &self.config) {
            // flag columns are a byte per cell on any manager
            (CellKind::Bool, _) => shape.cell_count(),
            (_, None) => components * 4,
            (_, Some(config)) => {
                let bits = match kind {
                    CellKind::Complex => config.data_bits,
                    _ => config.weight_bits,
                } as usize;
                // per-row scale followed by bit-packed codes
                4 + (components * bits + 7) / 8
            }
        }
    }

    /// Encode one row of f32 components into this manager's representation.
    /// Quantization is lossy; non-finite values map to a reserved code and
    /// decode back as NaN.
    pub fn encode_row(&self, kind: CellKind, values: &[f32]) -> io::Result<Vec<u8>> {
        match &self.config {
            None => {
                let mut buf = Vec::with_capacity(values.len() * 4);
                for v in values {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                Ok(buf)
            }
            Some(_) => {
                let bits = self.bits_for(kind)?;
                let sentinel: u64 = (1u64 << bits) - 1;
                let span = (sentinel - 1) as f64;

                let mut scale = 0f32;
                for &v in values {
                    if v.is_finite() {
                        scale = scale.max(v.abs());
                    }
                }

                let mut codes = Vec::with_capacity(values.len());
                for &v in values {
                    let code = if !v.is_finite() {
                        sentinel
                    } else if scale == 0.0 {
                        0
                    } else {
                        let t = (v as f64 / scale as f64).clamp(-1.0, 1.0);
                        (((t + 1.0) * 0.5 * span).round() as u64).min(sentinel - 1)
                    };
                    codes.push(code);
                }

                let mut buf = Vec::with_capacity(4 + (values.len() * bits as usize + 7) / 8);
                buf.extend_from_slice(&scale.to_le_bytes());
                pack_codes(&codes, bits, &mut buf);
                Ok(buf)
            }
        }
    }

    /// Decode one encoded row back into f32 components
    pub fn decode_row(
        &self,
        kind: CellKind,
        shape: &CellShape,
        bytes: &[u8],
    ) -> io::Result<Vec<f32>> {
        let components = shape.cell_count() * kind.components();
        match &self.config {
            None => {
                if bytes.len() < components * 4 {
                    return Err(err_data("raw row truncated"));
                }
                let mut out = Vec::with_capacity(components);
                for i in 0..components {
                    out.push(f32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap()));
                }
                Ok(out)
            }
            Some(_) => {
                let bits = self.bits_for(kind)?;
                if bytes.len() < 4 {
                    return Err(err_data("quantized row truncated"));
                }
                let scale = f32::from_le_bytes(bytes[0..4].try_into().unwrap());
                let sentinel: u64 = (1u64 << bits) - 1;
                let span = (sentinel - 1) as f64;
                let codes = unpack_codes(&bytes[4..], bits, components)?;
                let mut out = Vec::with_capacity(components);
                for code in codes {
                    let v = if code == sentinel {
                        f32::NAN
                    } else if scale == 0.0 {
                        0.0
                    } else {
                        ((code as f64 / span * 2.0 - 1.0) * scale as f64) as f32
                    };
                    out.push(v);
                }
                Ok(out)
            }
        }
    }
}

// ============================================================================
// Bit packing
// ============================================================================

fn pack_codes(codes: &[u64], bits: u32, out: &mut Vec<u8>) {
    let mask: u64 = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let mut acc: u64 = 0;
    let mut nbits: u32 = 0;
    for &code in codes {
        acc |= (code & mask) << nbits;
        nbits += bits;
        while nbits >= 8 {
            out.push((acc & 0xFF) as u8);
            acc >>= 8;
            nbits -= 8;
        }
    }
    if nbits > 0 {
        out.push((acc & 0xFF) as u8);
    }
}

fn unpack_codes(bytes: &[u8], bits: u32, count: usize) -> io::Result<Vec<u64>> {
    let needed = (count * bits as usize + 7) / 8;
    if bytes.len() < needed {
        return Err(err_data(format!(
            "packed codes truncated: need {} bytes, have {}",
            needed,
            bytes.len()
        )));
    }
    let mask: u64 = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let mut out = Vec::with_capacity(count);
    let mut acc: u64 = 0;
    let mut nbits: u32 = 0;
    let mut pos = 0usize;
    for _ in 0..count {
        while nbits < bits {
            acc |= (bytes[pos] as u64) << nbits;
            pos += 1;
            nbits += 8;
        }
        out.push(acc & mask);
        acc >>= bits;
        nbits -= bits;
    }
    Ok(out)
}
