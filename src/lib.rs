//! vistab — column compression migration for visibility tables
//!
//! Replaces raw float columns of a radio-astronomy visibility table with
//! columns bound to a quantizing, compression-capable storage manager,
//! preserving per-cell validity flags along the way.

pub mod cell;
pub mod compact;
pub mod flagging;
pub mod manager;
pub mod migrate;
pub mod table;

pub use cell::{CellKind, CellShape};
pub use manager::{Distribution, ManagerConfig, Normalization, QUANT_MANAGER, STANDARD_MANAGER};
pub use migrate::{ensure_manager, migrate, MigrationReport, MigrationRequest};
pub use table::VisTable;

/// Engine error type
#[derive(Debug, thiserror::Error)]
pub enum TabError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Column already exists: {0}")]
    ColumnExists(String),

    #[error("Storage manager not found: {0}")]
    ManagerNotFound(String),

    #[error("Invalid storage manager configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
}

pub type Result<T> = std::result::Result<T, TabError>;
