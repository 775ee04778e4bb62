//! Flag-to-sentinel preprocessing.
//!
//! The quantizing codec has no side channel for per-cell validity, so before
//! a data column is transcoded every flagged cell is overwritten with NaN in
//! place. The codec encodes NaN as a reserved sentinel code and reproduces it
//! on decode, which carries the flag semantics through compression.
//!
//! The rewrite is destructive and idempotent: a cell that is already NaN is
//! not written again, so a re-run over a preprocessed column performs zero
//! row writes.

use log::debug;

use crate::cell::CellKind;
use crate::table::VisTable;
use crate::{Result, TabError};

/// Overwrite every flagged cell of `data_column` with NaN, using the parallel
/// boolean `flag_column`. Returns the number of rows actually rewritten.
pub fn apply_flag_sentinels(
    table: &mut VisTable,
    data_column: &str,
    flag_column: &str,
) -> Result<usize> {
    let (components, row_count) = {
        let data = table
            .column(data_column)
            .map_err(|_| TabError::ColumnNotFound(data_column.to_string()))?;
        let flags = table
            .column(flag_column)
            .map_err(|_| TabError::ColumnNotFound(flag_column.to_string()))?;
        if flags.kind != CellKind::Bool {
            return Err(TabError::InvalidConfig(format!(
                "column '{}' is not a flag column",
                flag_column
            )));
        }
        if data.kind == CellKind::Bool {
            return Err(TabError::InvalidConfig(format!(
                "column '{}' is a flag column, not data",
                data_column
            )));
        }
        if data.shape != flags.shape {
            return Err(TabError::ShapeMismatch(format!(
                "column '{}' has shape {} but flag column '{}' has shape {}",
                data_column, data.shape, flag_column, flags.shape
            )));
        }
        (data.kind.components(), table.nrow())
    };

    let mut rewritten = 0usize;
    for row in 0..row_count {
        let flags = table.get_flag_row(flag_column, row)?;
        if !flags.iter().any(|&f| f) {
            continue;
        }
        let mut values = table.get_row(data_column, row)?;
        let mut changed = false;
        for (cell, &flagged) in flags.iter().enumerate() {
            if !flagged {
                continue;
            }
            for component in &mut values[cell * components..(cell + 1) * components] {
                if !component.is_nan() {
                    *component = f32::NAN;
                    changed = true;
                }
            }
        }
        if changed {
            table.put_row(data_column, row, &values)?;
            rewritten += 1;
        }
    }

    debug!(
        "flag preprocessing of '{}': {} of {} rows rewritten",
        data_column, rewritten, row_count
    );
    Ok(rewritten)
}
