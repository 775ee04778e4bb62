//! On-disk format of a visibility table.
//!
//! File layout:
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (64 bytes)                                        │
//! │   - Magic: "VISTAB\0\0" (8 bytes)                        │
//! │   - Version: u32                                         │
//! │   - Row count: u64                                       │
//! │   - Column count: u32                                    │
//! │   - Footer offset: u64                                   │
//! │   - Created / modified timestamps: i64 each              │
//! │   - Checksum: u32 (crc32 of the preceding bytes)         │
//! ├──────────────────────────────────────────────────────────┤
//! │ Column data blocks (fixed row size per column)           │
//! │   Superseded blocks stay behind as dead bytes until      │
//! │   the table is compacted.                                │
//! ├──────────────────────────────────────────────────────────┤
//! │ Footer                                                   │
//! │   - Manager configs                                      │
//! │   - Column directory (name, kind, shape, manager,        │
//! │     data offset/length)                                  │
//! │   - Dead-byte count                                      │
//! │   - Footer size: u64                                     │
//! │   - Magic: "VTABEND\0"                                   │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::io;

use crate::cell::{CellKind, CellShape};
use crate::manager::ManagerConfig;

pub const MAGIC: &[u8; 8] = b"VISTAB\0\0";
pub const FOOTER_MAGIC: &[u8; 8] = b"VTABEND\0";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 64;

#[inline]
fn err_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

// ============================================================================
// Header
// ============================================================================

#[derive(Debug, Clone)]
pub struct TableHeader {
    pub version: u32,
    pub row_count: u64,
    pub column_count: u32,
    pub footer_offset: u64,
    pub created_at: i64,
    pub modified_at: i64,
}

impl TableHeader {
    pub fn new(row_count: u64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            version: FORMAT_VERSION,
            row_count,
            column_count: 0,
            footer_offset: HEADER_SIZE as u64,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let mut pos = 0;

        buf[pos..pos + 8].copy_from_slice(MAGIC);
        pos += 8;
        buf[pos..pos + 4].copy_from_slice(&self.version.to_le_bytes());
        pos += 4;
        buf[pos..pos + 8].copy_from_slice(&self.row_count.to_le_bytes());
        pos += 8;
        buf[pos..pos + 4].copy_from_slice(&self.column_count.to_le_bytes());
        pos += 4;
        buf[pos..pos + 8].copy_from_slice(&self.footer_offset.to_le_bytes());
        pos += 8;
        buf[pos..pos + 8].copy_from_slice(&self.created_at.to_le_bytes());
        pos += 8;
        buf[pos..pos + 8].copy_from_slice(&self.modified_at.to_le_bytes());
        pos += 8;

        let checksum = crc32fast::hash(&buf[0..pos]);
        buf[pos..pos + 4].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> io::Result<Self> {
        let mut pos = 0;

        if &bytes[pos..pos + 8] != MAGIC {
            return Err(err_data("not a vistab table: bad magic"));
        }
        pos += 8;

        let version = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        pos += 4;
        if version != FORMAT_VERSION {
            return Err(err_data(format!("unsupported table version {}", version)));
        }
        let row_count = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let column_count = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let footer_offset = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let created_at = i64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let modified_at = i64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        pos += 8;

        let checksum = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        let computed = crc32fast::hash(&bytes[0..pos]);
        if computed != checksum {
            return Err(err_data("header checksum mismatch"));
        }

        Ok(Self {
            version,
            row_count,
            column_count,
            footer_offset,
            created_at,
            modified_at,
        })
    }
}

// ============================================================================
// Footer: manager configs + column directory
// ============================================================================

/// Directory entry for one live column
#[derive(Debug, Clone)]
pub struct ColumnRecord {
    pub name: String,
    pub kind: CellKind,
    pub shape: CellShape,
    pub manager: String,
    pub data_offset: u64,
    pub data_length: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TableFooter {
    /// Quantizing manager instances registered on the table (the raw
    /// manager is implicit and always present)
    pub managers: Vec<(String, ManagerConfig)>,
    pub columns: Vec<ColumnRecord>,
    /// Bytes occupied by superseded column blocks, reclaimable by compaction
    pub dead_bytes: u64,
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn read_str(bytes: &[u8], pos: &mut usize) -> io::Result<String> {
    if *pos + 2 > bytes.len() {
        return Err(err_data("footer string length truncated"));
    }
    let len = u16::from_le_bytes(bytes[*pos..*pos + 2].try_into().unwrap()) as usize;
    *pos += 2;
    if *pos + len > bytes.len() {
        return Err(err_data("footer string truncated"));
    }
    let s = std::str::from_utf8(&bytes[*pos..*pos + len])
        .map_err(|e| err_data(e.to_string()))?
        .to_string();
    *pos += len;
    Ok(s)
}

impl TableFooter {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);

        buf.extend_from_slice(&(self.managers.len() as u32).to_le_bytes());
        for (name, config) in &self.managers {
            push_str(&mut buf, name);
            buf.extend_from_slice(&config.to_bytes());
        }

        buf.extend_from_slice(&(self.columns.len() as u32).to_le_bytes());
        for col in &self.columns {
            push_str(&mut buf, &col.name);
            buf.push(col.kind as u8);
            buf.extend_from_slice(&col.shape.polarizations.to_le_bytes());
            buf.extend_from_slice(&col.shape.channels.to_le_bytes());
            push_str(&mut buf, &col.manager);
            buf.extend_from_slice(&col.data_offset.to_le_bytes());
            buf.extend_from_slice(&col.data_length.to_le_bytes());
        }

        buf.extend_from_slice(&self.dead_bytes.to_le_bytes());

        let footer_size = buf.len() as u64 + 8 + 8;
        buf.extend_from_slice(&footer_size.to_le_bytes());
        buf.extend_from_slice(FOOTER_MAGIC);

        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < 16 || &bytes[bytes.len() - 8..] != FOOTER_MAGIC {
            return Err(err_data("footer magic missing"));
        }
        let footer_size =
            u64::from_le_bytes(bytes[bytes.len() - 16..bytes.len() - 8].try_into().unwrap());
        if footer_size != bytes.len() as u64 {
            return Err(err_data("footer size mismatch"));
        }

        let mut pos = 0usize;

        if pos + 4 > bytes.len() {
            return Err(err_data("footer truncated"));
        }
        let manager_count = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        // bound against the remaining bytes before allocating: a corrupt
        // footer must come back as an error, not an absurd reservation.
        // A manager entry is at least a name length prefix plus the config.
        if manager_count > (bytes.len() - pos) / 14 {
            return Err(err_data("footer manager count exceeds remaining bytes"));
        }

        let mut managers = Vec::with_capacity(manager_count);
        for _ in 0..manager_count {
            let name = read_str(bytes, &mut pos)?;
            let (config, consumed) = ManagerConfig::from_bytes(&bytes[pos..])?;
            pos += consumed;
            managers.push((name, config));
        }

        if pos + 4 > bytes.len() {
            return Err(err_data("footer truncated"));
        }
        let column_count = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        // smallest possible column record: two empty names, kind, shape,
        // offset and length
        if column_count > (bytes.len() - pos) / 29 {
            return Err(err_data("footer column count exceeds remaining bytes"));
        }

        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let name = read_str(bytes, &mut pos)?;
            if pos + 9 > bytes.len() {
                return Err(err_data("column record truncated"));
            }
            let kind = CellKind::from_u8(bytes[pos])
                .ok_or_else(|| err_data(format!("unknown cell kind tag {}", bytes[pos])))?;
            pos += 1;
            let polarizations = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let channels = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let manager = read_str(bytes, &mut pos)?;
            if pos + 16 > bytes.len() {
                return Err(err_data("column record truncated"));
            }
            let data_offset = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let data_length = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
            pos += 8;
            columns.push(ColumnRecord {
                name,
                kind,
                shape: CellShape::new(polarizations, channels),
                manager,
                data_offset,
                data_length,
            });
        }

        if pos + 8 > bytes.len() {
            return Err(err_data("footer truncated"));
        }
        let dead_bytes = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());

        Ok(Self {
            managers,
            columns,
            dead_bytes,
        })
    }
}
