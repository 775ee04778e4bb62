//! Table compaction.
//!
//! Replacing a column leaves its old data block in the file as dead bytes.
//! `reorder` rewrites the whole table into a sibling file without them and
//! renames it over the original.
//!
//! Every live row is read back through its current manager and re-encoded on
//! the way out. For quantized columns that means a second lossy pass, so the
//! rewritten values can differ from the single-pass result; callers are
//! expected to warn before asking for it.

use std::fs;
use std::io;

use log::info;

use crate::cell::CellKind;
use crate::table::VisTable;

/// Rewrite `table` without dead bytes and reopen it from the same path.
/// Consumes the handle; the returned table is the reopened rewrite.
pub fn reorder(table: VisTable) -> io::Result<VisTable> {
    let path = table.path().to_path_buf();
    let mut tmp_path = path.clone().into_os_string();
    tmp_path.push(".reorder");
    let tmp_path = std::path::PathBuf::from(tmp_path);

    let dead = table.dead_bytes();
    if let Err(e) = rewrite_live_rows(&table, &tmp_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    // close the source before the rename
    drop(table);
    if let Err(e) = fs::rename(&tmp_path, &path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    let reopened = VisTable::open(&path)?;
    info!(
        "compacted '{}': reclaimed {} dead bytes",
        path.display(),
        dead
    );
    Ok(reopened)
}

fn rewrite_live_rows(table: &VisTable, tmp_path: &std::path::Path) -> io::Result<()> {
    let mut rewrite = VisTable::create(tmp_path, table.nrow())?;

    // carry over every quantizing manager before binding columns to it
    for name in table.column_names() {
        let column = table.column(&name)?;
        if let Some(config) = table.manager_config(column.manager_name()) {
            rewrite.get_or_create_manager(column.manager_name(), config);
        }
    }

    for name in table.column_names() {
        let column = table.column(&name)?;
        let (kind, shape, manager) = (column.kind, column.shape, column.manager_name().to_string());
        rewrite.add_column(&name, kind, shape, &manager)?;
        for row in 0..table.nrow() {
            if kind == CellKind::Bool {
                let flags = table.get_flag_row(&name, row)?;
                rewrite.put_flag_row(&name, row, &flags)?;
            } else {
                let values = table.get_row(&name, row)?;
                rewrite.put_row(&name, row, &values)?;
            }
        }
    }
    rewrite.save()
}
