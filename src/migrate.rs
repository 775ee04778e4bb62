//! Column migration orchestrator.
//!
//! Drives one migration request end to end: validate and register the target
//! manager, push flags into the data as NaN sentinels, replace each requested
//! column under its own name, move the rows across one at a time, then
//! persist and optionally compact.
//!
//! The request moves through `Idle -> Prepared -> ColumnsCreated -> DataMoved
//! -> [Reordered] -> Done`. When prepare finds nothing to replace the request
//! short-circuits straight to Done, which makes a re-run of an identical
//! request a no-op. A failure mid-move aborts the request; columns already
//! fully migrated stay migrated and there is no rollback.

use log::{info, warn};

use crate::cell::{CellKind, CellShape};
use crate::compact;
use crate::flagging::apply_flag_sentinels;
use crate::manager::ManagerConfig;
use crate::table::VisTable;
use crate::{Result, TabError};

/// Flag column consulted by the sentinel preprocessor
pub const FLAG_COLUMN: &str = "FLAG";
/// Weight column name; weights skip flag preprocessing
pub const WEIGHT_COLUMN: &str = "WEIGHT_SPECTRUM";

/// One migration request: which columns to rebind, to which manager, how
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    /// Columns to replace, in order
    pub columns: Vec<String>,
    /// Manager-type name the columns are rebound to
    pub manager_name: String,
    /// Target configuration; ignored if the manager already exists
    pub config: ManagerConfig,
    /// Compact the table after a successful move
    pub reorder: bool,
}

/// What a migration run actually did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub replaced: Vec<String>,
    pub skipped: Vec<String>,
    pub manager_created: bool,
    pub rows_moved: u64,
    pub flagged_rows_rewritten: u64,
    pub reordered: bool,
}

/// Register the manager `name` if absent. Returns whether it was created;
/// an existing manager keeps its configuration and `config` is ignored.
pub fn ensure_manager(table: &VisTable, name: &str, config: &ManagerConfig) -> Result<bool> {
    let (_, created) = table.get_or_create_manager(name, config.clone());
    Ok(created)
}

/// Run one migration request against an open table. Owning, because a
/// reorder replaces the handle with one reopened from the rewritten file.
pub fn migrate(
    mut table: VisTable,
    request: &MigrationRequest,
) -> Result<(VisTable, MigrationReport)> {
    let mut report = MigrationReport::default();

    if request.reorder {
        warn!("reordering re-encodes every quantized row; quantization error compounds");
    }

    // Prepare: resolve each requested column, partition into pending and
    // already-migrated, and require one identical shape across the batch
    let mut pending: Vec<(String, CellKind)> = Vec::new();
    let mut shape: Option<CellShape> = None;
    for name in &request.columns {
        let column = table
            .column(name)
            .map_err(|_| TabError::ColumnNotFound(name.clone()))?;
        if column.kind == CellKind::Bool {
            return Err(TabError::InvalidConfig(format!(
                "column '{}' holds flags and cannot be rebound",
                name
            )));
        }
        if column.manager_name() == request.manager_name {
            report.skipped.push(name.clone());
            continue;
        }
        if column.shape.is_degenerate() {
            return Err(TabError::ShapeMismatch(format!(
                "column '{}' has degenerate shape {}",
                name, column.shape
            )));
        }
        match shape {
            None => shape = Some(column.shape),
            Some(s) if s != column.shape => {
                return Err(TabError::ShapeMismatch(format!(
                    "column '{}' has shape {} but the batch is {}",
                    name, column.shape, s
                )));
            }
            Some(_) => {}
        }
        pending.push((name.clone(), column.kind));
    }

    // Prepared -> Done short-circuit: nothing to replace, nothing to touch
    let shape = match shape {
        Some(shape) => shape,
        None => {
            info!(
                "all requested columns already bound to '{}', nothing to do",
                request.manager_name
            );
            return Ok((table, report));
        }
    };

    report.manager_created = ensure_manager(&table, &request.manager_name, &request.config)?;
    if !report.manager_created {
        info!(
            "manager '{}' already registered, keeping its configuration",
            request.manager_name
        );
    }

    let has_flags = table.has_column(FLAG_COLUMN);
    for (name, kind) in &pending {
        // weights carry no flags; their codec path does not bridge them
        if *kind != CellKind::Float && has_flags {
            report.flagged_rows_rewritten +=
                apply_flag_sentinels(&mut table, name, FLAG_COLUMN)? as u64;
        }

        let superseded = table.replace_column(name, *kind, shape, &request.manager_name)?;
        // commit the redefinition before moving rows: the new data block
        // overwrites the old footer location, so the on-disk directory must
        // be rewritten before any abort point inside the move
        table.save()?;
        for row in 0..table.nrow() {
            let values = table.get_row(&superseded, row)?;
            table.put_row(name, row, &values)?;
            report.rows_moved += 1;
        }
        table.drop_column(&superseded)?;
        // commit per column: an abort on a later column keeps this one migrated
        table.save()?;
        report.replaced.push(name.clone());
        info!(
            "column '{}' rebound to '{}' ({} rows)",
            name,
            request.manager_name,
            table.nrow()
        );
    }

    if request.reorder {
        table = compact::reorder(table)?;
        report.reordered = true;
    }

    Ok((table, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{Distribution, Normalization, QUANT_MANAGER, STANDARD_MANAGER};
    use tempfile::tempdir;

    const SHAPE: CellShape = CellShape {
        polarizations: 2,
        channels: 2,
    };

    fn default_config() -> ManagerConfig {
        ManagerConfig::new(
            8,
            12,
            Distribution::TruncatedGaussian { truncation: 2.5 },
            Normalization::Af,
        )
        .unwrap()
    }

    fn request(columns: &[&str], reorder: bool) -> MigrationRequest {
        MigrationRequest {
            columns: columns.iter().map(|s| s.to_string()).collect(),
            manager_name: QUANT_MANAGER.to_string(),
            config: default_config(),
            reorder,
        }
    }

    /// DATA + FLAG + WEIGHT_SPECTRUM, 4 rows, no flags set
    fn sample_table(path: &std::path::Path) -> VisTable {
        let mut table = VisTable::create(path, 4).unwrap();
        table
            .add_column("DATA", CellKind::Complex, SHAPE, STANDARD_MANAGER)
            .unwrap();
        table
            .add_column(FLAG_COLUMN, CellKind::Bool, SHAPE, STANDARD_MANAGER)
            .unwrap();
        table
            .add_column(WEIGHT_COLUMN, CellKind::Float, SHAPE, STANDARD_MANAGER)
            .unwrap();
        for row in 0..4u64 {
            let values: Vec<f32> = (0..8).map(|i| (row * 8 + i) as f32 * 0.125).collect();
            table.put_row("DATA", row, &values).unwrap();
            let weights: Vec<f32> = (0..4).map(|i| (row + i) as f32 + 1.0).collect();
            table.put_row(WEIGHT_COLUMN, row, &weights).unwrap();
        }
        table
    }

    fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!(
                (a - e).abs() <= tolerance,
                "{} not within {} of {}",
                a,
                tolerance,
                e
            );
        }
    }

    #[test]
    fn test_clean_table_single_column() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vtab");
        let table = sample_table(&path);
        let expected: Vec<Vec<f32>> = (0..4)
            .map(|row| table.get_row("DATA", row).unwrap())
            .collect();

        let (table, report) = migrate(table, &request(&["DATA"], false)).unwrap();

        assert_eq!(report.replaced, vec!["DATA"]);
        assert!(report.skipped.is_empty());
        assert!(report.manager_created);
        assert_eq!(report.rows_moved, 4);
        assert_eq!(report.flagged_rows_rewritten, 0);
        assert!(!report.reordered);

        assert_eq!(table.nrow(), 4);
        let column = table.column("DATA").unwrap();
        assert_eq!(column.manager_name(), QUANT_MANAGER);
        assert_eq!(column.shape, SHAPE);
        for (row, expected) in expected.iter().enumerate() {
            let scale = expected.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            assert_close(
                &table.get_row("DATA", row as u64).unwrap(),
                expected,
                scale * 0.01,
            );
        }
    }

    #[test]
    fn test_rerun_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (table, _) =
            migrate(sample_table(&dir.path().join("t.vtab")), &request(&["DATA"], false)).unwrap();
        let after_first: Vec<Vec<f32>> = (0..4)
            .map(|row| table.get_row("DATA", row).unwrap())
            .collect();

        let (table, report) = migrate(table, &request(&["DATA"], false)).unwrap();

        assert!(report.replaced.is_empty());
        assert_eq!(report.skipped, vec!["DATA"]);
        assert!(!report.manager_created);
        assert_eq!(report.rows_moved, 0);
        assert_eq!(report.flagged_rows_rewritten, 0);
        for (row, expected) in after_first.iter().enumerate() {
            // untouched, so bit-exact
            assert_eq!(&table.get_row("DATA", row as u64).unwrap(), expected);
        }
    }

    #[test]
    fn test_data_and_weights_share_one_manager() {
        let dir = tempdir().unwrap();
        let table = sample_table(&dir.path().join("t.vtab"));

        let (table, report) =
            migrate(table, &request(&["DATA", WEIGHT_COLUMN], false)).unwrap();

        assert_eq!(report.replaced, vec!["DATA", WEIGHT_COLUMN]);
        assert!(report.manager_created);
        assert_eq!(report.rows_moved, 8);

        let data = table.column("DATA").unwrap();
        let weights = table.column(WEIGHT_COLUMN).unwrap();
        assert_eq!(data.kind, CellKind::Complex);
        assert_eq!(weights.kind, CellKind::Float);
        assert_eq!(data.manager_name(), QUANT_MANAGER);
        assert_eq!(weights.manager_name(), QUANT_MANAGER);
        // one shared handle, configured by the request
        assert!(std::sync::Arc::ptr_eq(&data.manager, &weights.manager));
        assert_eq!(
            table.manager_config(QUANT_MANAGER),
            Some(default_config())
        );
    }

    #[test]
    fn test_flags_survive_as_nan() {
        let dir = tempdir().unwrap();
        let table = sample_table(&dir.path().join("t.vtab"));
        table
            .put_flag_row(FLAG_COLUMN, 2, &[true, true, false, false])
            .unwrap();

        let (table, report) = migrate(table, &request(&["DATA"], false)).unwrap();
        assert_eq!(report.flagged_rows_rewritten, 1);

        let row = table.get_row("DATA", 2).unwrap();
        assert!(row[..4].iter().all(|v| v.is_nan()));
        assert!(row[4..].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_shape_mismatch_aborts_before_mutation() {
        let dir = tempdir().unwrap();
        let mut table = sample_table(&dir.path().join("t.vtab"));
        table
            .add_column("MODEL_DATA", CellKind::Complex, CellShape::new(2, 3), STANDARD_MANAGER)
            .unwrap();
        table.save().unwrap();

        let err = migrate(table, &request(&["DATA", "MODEL_DATA"], false)).unwrap_err();
        assert!(matches!(err, TabError::ShapeMismatch(_)));

        // prepare failed, so nothing was rebound
        let table = VisTable::open(dir.path().join("t.vtab")).unwrap();
        assert_eq!(table.column("DATA").unwrap().manager_name(), STANDARD_MANAGER);
    }

    #[test]
    fn test_abort_mid_move_keeps_table_openable_and_prior_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vtab");
        let (table, _) = migrate(sample_table(&path), &request(&["DATA"], false)).unwrap();
        let data_after: Vec<Vec<f32>> = (0..4)
            .map(|row| table.get_row("DATA", row).unwrap())
            .collect();
        let weights: Vec<Vec<f32>> = (0..4)
            .map(|row| table.get_row(WEIGHT_COLUMN, row).unwrap())
            .collect();

        // drive a second replacement to its mid-move abort point: the
        // redefinition is committed, one row is moved, then the handle is
        // dropped without another save
        let mut table = table;
        let superseded = table
            .replace_column(WEIGHT_COLUMN, CellKind::Float, SHAPE, QUANT_MANAGER)
            .unwrap();
        table.save().unwrap();
        let row0 = table.get_row(&superseded, 0).unwrap();
        table.put_row(WEIGHT_COLUMN, 0, &row0).unwrap();
        drop(table);

        // the table reopens and the column migrated before the abort is
        // still migrated, bit-exact
        let table = VisTable::open(&path).unwrap();
        assert_eq!(table.column("DATA").unwrap().manager_name(), QUANT_MANAGER);
        for (row, expected) in data_after.iter().enumerate() {
            assert_eq!(&table.get_row("DATA", row as u64).unwrap(), expected);
        }
        // the original weights survive under the superseded name
        for (row, expected) in weights.iter().enumerate() {
            assert_eq!(&table.get_row(&superseded, row as u64).unwrap(), expected);
        }
    }

    #[test]
    fn test_missing_column_rejected() {
        let dir = tempdir().unwrap();
        let table = sample_table(&dir.path().join("t.vtab"));
        let err = migrate(table, &request(&["CORRECTED_DATA"], false)).unwrap_err();
        assert!(matches!(err, TabError::ColumnNotFound(_)));
    }

    #[test]
    fn test_existing_manager_config_wins() {
        let dir = tempdir().unwrap();
        let table = sample_table(&dir.path().join("t.vtab"));
        let first = ManagerConfig::new(4, 6, Distribution::Uniform, Normalization::Row).unwrap();
        table.get_or_create_manager(QUANT_MANAGER, first.clone());

        let (table, report) = migrate(table, &request(&["DATA"], false)).unwrap();

        assert!(!report.manager_created);
        assert_eq!(report.replaced, vec!["DATA"]);
        assert_eq!(table.manager_config(QUANT_MANAGER), Some(first));
    }

    #[test]
    fn test_reorder_runs_after_replacement() {
        let dir = tempdir().unwrap();
        let table = sample_table(&dir.path().join("t.vtab"));

        let (table, report) = migrate(table, &request(&["DATA"], true)).unwrap();

        assert!(report.reordered);
        assert_eq!(table.dead_bytes(), 0);
        assert_eq!(table.nrow(), 4);
        assert_eq!(table.column("DATA").unwrap().manager_name(), QUANT_MANAGER);
    }

    #[test]
    fn test_reorder_skipped_when_nothing_replaced() {
        let dir = tempdir().unwrap();
        let (table, _) =
            migrate(sample_table(&dir.path().join("t.vtab")), &request(&["DATA"], false)).unwrap();
        let dead_before = table.dead_bytes();
        assert!(dead_before > 0);

        let (table, report) = migrate(table, &request(&["DATA"], true)).unwrap();

        // short-circuit to Done: no compaction even though it was requested
        assert!(!report.reordered);
        assert_eq!(table.dead_bytes(), dead_before);
    }
}
