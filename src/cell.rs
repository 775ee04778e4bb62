//! Cell element kinds and per-row shapes.
//!
//! A cell is one value at a row/polarization/channel position. Data columns
//! hold complex visibility samples (two f32 components per cell), weight
//! columns hold scalar floats, and flag columns hold one boolean per cell.

const KIND_COMPLEX: u8 = 1;
const KIND_FLOAT: u8 = 2;
const KIND_BOOL: u8 = 3;

/// Element kind of a column's cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellKind {
    /// Complex visibility sample (re, im) — two f32 components
    Complex = KIND_COMPLEX,
    /// Scalar float (weights)
    Float = KIND_FLOAT,
    /// Per-cell boolean (flag columns)
    Bool = KIND_BOOL,
}

impl CellKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            KIND_COMPLEX => Some(CellKind::Complex),
            KIND_FLOAT => Some(CellKind::Float),
            KIND_BOOL => Some(CellKind::Bool),
            _ => None,
        }
    }

    /// Number of f32 components per cell (1 for Bool, which is stored as bytes)
    pub fn components(&self) -> usize {
        match self {
            CellKind::Complex => 2,
            CellKind::Float => 1,
            CellKind::Bool => 1,
        }
    }
}

/// Fixed per-row shape of a column: polarizations × channels.
///
/// All cells of a row form one vector of `cell_count()` cells; the shape is
/// fixed for the lifetime of the column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellShape {
    pub polarizations: u32,
    pub channels: u32,
}

impl CellShape {
    pub fn new(polarizations: u32, channels: u32) -> Self {
        Self {
            polarizations,
            channels,
        }
    }

    /// Cells per row
    pub fn cell_count(&self) -> usize {
        self.polarizations as usize * self.channels as usize
    }

    /// A degenerate shape has no cells and cannot configure a manager
    pub fn is_degenerate(&self) -> bool {
        self.polarizations == 0 || self.channels == 0
    }
}

impl std::fmt::Display for CellShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.polarizations, self.channels)
    }
}
