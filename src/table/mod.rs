//! Host table format: a self-describing columnar store for visibility data.
//!
//! `VisTable` exposes what the migration engine needs from the table format:
//! open-for-update by path, per-column kind/shape queries, add/drop/replace
//! of columns bound to a named storage manager, an atomic get-or-create
//! manager registry, and blocking row-level get/put of data and flag cells.
//!
//! Every column's rows have a fixed encoded size, so a cell row lives at
//! `data_offset + row * row_size` and can be rewritten in place. Replacing a
//! column appends a fresh block at the end of the data region and leaves the
//! superseded block behind as dead bytes; only compaction reclaims them.

pub mod format;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::RwLock;

use crate::cell::{CellKind, CellShape};
use crate::manager::{ManagerConfig, ManagerHandle, STANDARD_MANAGER};
use format::{ColumnRecord, TableFooter, TableHeader, HEADER_SIZE};

#[inline]
fn err_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
#[inline]
fn err_not_found(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, msg.into())
}
#[inline]
fn err_input(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}
#[inline]
fn err_exists(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, msg.into())
}

/// A live column: metadata plus the shared handle of its storage manager
#[derive(Debug)]
pub struct Column {
    pub name: String,
    pub kind: CellKind,
    pub shape: CellShape,
    pub manager: Arc<ManagerHandle>,
    data_offset: u64,
    data_length: u64,
    row_size: usize,
}

impl Column {
    pub fn manager_name(&self) -> &str {
        &self.manager.name
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }
}

/// A visibility table opened for update
#[derive(Debug)]
pub struct VisTable {
    path: PathBuf,
    file: File,
    header: TableHeader,
    columns: Vec<Column>,
    /// Registry of storage managers, keyed by manager-type name.
    /// Get-or-create happens under one write lock.
    managers: RwLock<HashMap<String, Arc<ManagerHandle>>>,
    /// End of the column data region; the footer is written here on save
    data_end: u64,
    dead_bytes: u64,
}

impl VisTable {
    /// Create an empty table with a fixed row count
    pub fn create(path: impl AsRef<Path>, row_count: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut table = Self {
            path,
            file,
            header: TableHeader::new(row_count),
            columns: Vec::new(),
            managers: RwLock::new(standard_registry()),
            data_end: HEADER_SIZE as u64,
            dead_bytes: 0,
        };
        table.save()?;
        Ok(table)
    }

    /// Open an existing table for update
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        // Parse header and footer through one mapping of the file
        let (header, footer) = {
            let mmap = unsafe { Mmap::map(&file)? };
            if mmap.len() < HEADER_SIZE {
                return Err(err_data("file too small for table header"));
            }
            let header_bytes: [u8; HEADER_SIZE] = mmap[..HEADER_SIZE].try_into().unwrap();
            let header = TableHeader::from_bytes(&header_bytes)?;
            if header.footer_offset as usize > mmap.len() {
                return Err(err_data("footer offset beyond end of file"));
            }
            let footer = TableFooter::from_bytes(&mmap[header.footer_offset as usize..])?;
            (header, footer)
        };

        let mut managers = standard_registry();
        for (name, config) in &footer.managers {
            managers.insert(
                name.clone(),
                Arc::new(ManagerHandle::quantizing(name, config.clone())),
            );
        }

        let mut columns = Vec::with_capacity(footer.columns.len());
        for record in &footer.columns {
            let handle = managers
                .get(&record.manager)
                .cloned()
                .ok_or_else(|| {
                    err_data(format!(
                        "column '{}' bound to unknown manager '{}'",
                        record.name, record.manager
                    ))
                })?;
            let row_size = handle.row_size(record.kind, &record.shape);
            columns.push(Column {
                name: record.name.clone(),
                kind: record.kind,
                shape: record.shape,
                manager: handle,
                data_offset: record.data_offset,
                data_length: record.data_length,
                row_size,
            });
        }

        Ok(Self {
            path,
            file,
            data_end: header.footer_offset,
            dead_bytes: footer.dead_bytes,
            header,
            columns,
            managers: RwLock::new(managers),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn nrow(&self) -> u64 {
        self.header.row_count
    }

    pub fn dead_bytes(&self) -> u64 {
        self.dead_bytes
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> io::Result<&Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| err_not_found(format!("column '{}' not found", name)))
    }

    fn column_index(&self, name: &str) -> io::Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| err_not_found(format!("column '{}' not found", name)))
    }

    // ========================================================================
    // Manager registry
    // ========================================================================

    /// Look up a registered storage manager; fails if absent
    pub fn find_manager(&self, name: &str) -> io::Result<Arc<ManagerHandle>> {
        self.managers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| err_not_found(format!("no storage manager named '{}'", name)))
    }

    /// Get or create a quantizing manager as one atomic step. Returns the
    /// handle and whether it was created; an existing manager keeps its
    /// configuration and the supplied one is ignored.
    pub fn get_or_create_manager(
        &self,
        name: &str,
        config: ManagerConfig,
    ) -> (Arc<ManagerHandle>, bool) {
        let mut managers = self.managers.write();
        if let Some(handle) = managers.get(name) {
            return (handle.clone(), false);
        }
        let handle = Arc::new(ManagerHandle::quantizing(name, config));
        managers.insert(name.to_string(), handle.clone());
        (handle, true)
    }

    /// Configuration of a registered quantizing manager, if any
    pub fn manager_config(&self, name: &str) -> Option<ManagerConfig> {
        self.managers
            .read()
            .get(name)
            .and_then(|h| h.config.clone())
    }

    // ========================================================================
    // Column definition
    // ========================================================================

    /// Define a new column bound to a registered manager. The data block is
    /// appended zero-filled; rows are written afterwards with `put_row`.
    pub fn add_column(
        &mut self,
        name: &str,
        kind: CellKind,
        shape: CellShape,
        manager_name: &str,
    ) -> io::Result<()> {
        if self.has_column(name) {
            return Err(err_exists(format!("column '{}' already exists", name)));
        }
        if shape.is_degenerate() {
            return Err(err_input(format!(
                "column '{}' has degenerate shape {}",
                name, shape
            )));
        }
        let handle = self.find_manager(manager_name)?;
        let row_size = handle.row_size(kind, &shape);
        let data_length = row_size as u64 * self.header.row_count;

        // zero-fill the block; this overwrites the stale footer region,
        // which save() rewrites at the new data end
        self.file.seek(SeekFrom::Start(self.data_end))?;
        let zeros = vec![0u8; 64 * 1024];
        let mut remaining = data_length;
        while remaining > 0 {
            let chunk = remaining.min(zeros.len() as u64) as usize;
            self.file.write_all(&zeros[..chunk])?;
            remaining -= chunk as u64;
        }

        self.columns.push(Column {
            name: name.to_string(),
            kind,
            shape,
            manager: handle,
            data_offset: self.data_end,
            data_length,
            row_size,
        });
        self.data_end += data_length;
        Ok(())
    }

    /// Drop a column; its data block becomes dead bytes
    pub fn drop_column(&mut self, name: &str) -> io::Result<()> {
        let idx = self.column_index(name)?;
        let column = self.columns.remove(idx);
        self.dead_bytes += column.data_length;
        Ok(())
    }

    /// Redefine a column under the same name, bound to a (usually different)
    /// manager. The existing column is renamed out of the way and stays
    /// readable under the returned name until it is dropped, so its rows can
    /// be transcoded into the replacement.
    pub fn replace_column(
        &mut self,
        name: &str,
        kind: CellKind,
        shape: CellShape,
        manager_name: &str,
    ) -> io::Result<String> {
        let idx = self.column_index(name)?;
        let superseded = format!("{}#superseded", name);
        if self.has_column(&superseded) {
            return Err(err_exists(format!(
                "column '{}' is already being replaced",
                name
            )));
        }
        self.columns[idx].name = superseded.clone();
        self.add_column(name, kind, shape, manager_name)?;
        Ok(superseded)
    }

    // ========================================================================
    // Row access
    // ========================================================================

    fn row_offset(&self, column: &Column, row: u64) -> io::Result<u64> {
        if row >= self.header.row_count {
            return Err(err_input(format!(
                "row {} out of range (table has {} rows)",
                row, self.header.row_count
            )));
        }
        Ok(column.data_offset + row * column.row_size as u64)
    }

    fn read_row_bytes(&self, column: &Column, row: u64) -> io::Result<Vec<u8>> {
        let offset = self.row_offset(column, row)?;
        let mut buf = vec![0u8; column.row_size];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_row_bytes(&self, column: &Column, row: u64, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() != column.row_size {
            return Err(err_data(format!(
                "encoded row is {} bytes, column '{}' stores {}",
                bytes.len(),
                column.name,
                column.row_size
            )));
        }
        let offset = self.row_offset(column, row)?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)
    }

    /// Read one row of a data or weight column as f32 components
    pub fn get_row(&self, name: &str, row: u64) -> io::Result<Vec<f32>> {
        let column = self.column(name)?;
        if column.kind == CellKind::Bool {
            return Err(err_input(format!(
                "column '{}' holds flags; use get_flag_row",
                name
            )));
        }
        let bytes = self.read_row_bytes(column, row)?;
        column.manager.decode_row(column.kind, &column.shape, &bytes)
    }

    /// Write one row of a data or weight column; the bound manager encodes it
    pub fn put_row(&self, name: &str, row: u64, values: &[f32]) -> io::Result<()> {
        let column = self.column(name)?;
        if column.kind == CellKind::Bool {
            return Err(err_input(format!(
                "column '{}' holds flags; use put_flag_row",
                name
            )));
        }
        let expected = column.shape.cell_count() * column.kind.components();
        if values.len() != expected {
            return Err(err_input(format!(
                "row has {} components, column '{}' expects {}",
                values.len(),
                name,
                expected
            )));
        }
        let bytes = column.manager.encode_row(column.kind, values)?;
        self.write_row_bytes(column, row, &bytes)
    }

    /// Read one row of a flag column
    pub fn get_flag_row(&self, name: &str, row: u64) -> io::Result<Vec<bool>> {
        let column = self.column(name)?;
        if column.kind != CellKind::Bool {
            return Err(err_input(format!("column '{}' is not a flag column", name)));
        }
        let bytes = self.read_row_bytes(column, row)?;
        Ok(bytes.iter().map(|&b| b != 0).collect())
    }

    /// Write one row of a flag column
    pub fn put_flag_row(&self, name: &str, row: u64, flags: &[bool]) -> io::Result<()> {
        let column = self.column(name)?;
        if column.kind != CellKind::Bool {
            return Err(err_input(format!("column '{}' is not a flag column", name)));
        }
        if flags.len() != column.shape.cell_count() {
            return Err(err_input(format!(
                "row has {} flags, column '{}' expects {}",
                flags.len(),
                name,
                column.shape.cell_count()
            )));
        }
        let bytes: Vec<u8> = flags.iter().map(|&f| f as u8).collect();
        self.write_row_bytes(column, row, &bytes)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Write the footer and header; the file is reopenable afterwards
    pub fn save(&mut self) -> io::Result<()> {
        let mut managers: Vec<(String, ManagerConfig)> = self
            .managers
            .read()
            .values()
            .filter_map(|h| h.config.clone().map(|c| (h.name.clone(), c)))
            .collect();
        managers.sort_by(|a, b| a.0.cmp(&b.0));

        let footer = TableFooter {
            managers,
            columns: self
                .columns
                .iter()
                .map(|c| ColumnRecord {
                    name: c.name.clone(),
                    kind: c.kind,
                    shape: c.shape,
                    manager: c.manager.name.clone(),
                    data_offset: c.data_offset,
                    data_length: c.data_length,
                })
                .collect(),
            dead_bytes: self.dead_bytes,
        };
        let footer_bytes = footer.to_bytes();

        self.file.seek(SeekFrom::Start(self.data_end))?;
        self.file.write_all(&footer_bytes)?;
        self.file.set_len(self.data_end + footer_bytes.len() as u64)?;

        self.header.footer_offset = self.data_end;
        self.header.column_count = self.columns.len() as u32;
        self.header.modified_at = chrono::Utc::now().timestamp();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        self.file.sync_all()
    }
}

fn standard_registry() -> HashMap<String, Arc<ManagerHandle>> {
    let mut managers = HashMap::new();
    managers.insert(
        STANDARD_MANAGER.to_string(),
        Arc::new(ManagerHandle::standard()),
    );
    managers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{Distribution, Normalization, QUANT_MANAGER};
    use tempfile::tempdir;

    fn quant_config() -> ManagerConfig {
        ManagerConfig::new(
            8,
            12,
            Distribution::TruncatedGaussian { truncation: 2.5 },
            Normalization::Af,
        )
        .unwrap()
    }

    #[test]
    fn test_create_fill_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vis.vtab");
        let shape = CellShape::new(2, 4);

        {
            let mut table = VisTable::create(&path, 3).unwrap();
            table
                .add_column("DATA", CellKind::Complex, shape, STANDARD_MANAGER)
                .unwrap();
            table
                .add_column("FLAG", CellKind::Bool, shape, STANDARD_MANAGER)
                .unwrap();

            for row in 0..3u64 {
                let values: Vec<f32> = (0..16).map(|i| (row * 16 + i) as f32).collect();
                table.put_row("DATA", row, &values).unwrap();
                let flags = vec![row == 1; 8];
                table.put_flag_row("FLAG", row, &flags).unwrap();
            }
            table.save().unwrap();
        }

        let table = VisTable::open(&path).unwrap();
        assert_eq!(table.nrow(), 3);
        assert_eq!(table.column_names(), vec!["DATA", "FLAG"]);
        assert_eq!(table.column("DATA").unwrap().kind, CellKind::Complex);
        assert_eq!(table.column("DATA").unwrap().manager_name(), STANDARD_MANAGER);

        let row1 = table.get_row("DATA", 1).unwrap();
        let expected: Vec<f32> = (16..32).map(|i| i as f32).collect();
        assert_eq!(row1, expected);
        assert_eq!(table.get_flag_row("FLAG", 1).unwrap(), vec![true; 8]);
        assert_eq!(table.get_flag_row("FLAG", 2).unwrap(), vec![false; 8]);
    }

    #[test]
    fn test_manager_get_or_create_is_write_once() {
        let dir = tempdir().unwrap();
        let table = VisTable::create(dir.path().join("t.vtab"), 1).unwrap();

        let (_, created) = table.get_or_create_manager(QUANT_MANAGER, quant_config());
        assert!(created);

        let other = ManagerConfig::new(4, 4, Distribution::Uniform, Normalization::Row).unwrap();
        let (handle, created) = table.get_or_create_manager(QUANT_MANAGER, other);
        assert!(!created);
        assert_eq!(handle.config.as_ref().unwrap(), &quant_config());
    }

    #[test]
    fn test_manager_config_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vtab");
        {
            let mut table = VisTable::create(&path, 2).unwrap();
            table.get_or_create_manager(QUANT_MANAGER, quant_config());
            table
                .add_column("DATA", CellKind::Complex, CellShape::new(1, 2), QUANT_MANAGER)
                .unwrap();
            table.save().unwrap();
        }
        let table = VisTable::open(&path).unwrap();
        assert_eq!(table.manager_config(QUANT_MANAGER), Some(quant_config()));
        assert_eq!(table.column("DATA").unwrap().manager_name(), QUANT_MANAGER);
    }

    #[test]
    fn test_replace_column_keeps_superseded_readable() {
        let dir = tempdir().unwrap();
        let mut table = VisTable::create(dir.path().join("t.vtab"), 2).unwrap();
        let shape = CellShape::new(1, 2);
        table
            .add_column("DATA", CellKind::Complex, shape, STANDARD_MANAGER)
            .unwrap();
        table.put_row("DATA", 0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        table.put_row("DATA", 1, &[5.0, 6.0, 7.0, 8.0]).unwrap();

        table.get_or_create_manager(QUANT_MANAGER, quant_config());
        let old = table
            .replace_column("DATA", CellKind::Complex, shape, QUANT_MANAGER)
            .unwrap();

        // old data still readable under the superseded name
        assert_eq!(table.get_row(&old, 0).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        // new column is bound to the quantizing manager
        assert_eq!(table.column("DATA").unwrap().manager_name(), QUANT_MANAGER);

        let before = table.dead_bytes();
        table.drop_column(&old).unwrap();
        assert!(table.dead_bytes() > before);
    }

    #[test]
    fn test_unknown_manager_and_duplicate_column_rejected() {
        let dir = tempdir().unwrap();
        let mut table = VisTable::create(dir.path().join("t.vtab"), 1).unwrap();
        let shape = CellShape::new(1, 1);

        let err = table
            .add_column("DATA", CellKind::Complex, shape, "NoSuchStMan")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        table
            .add_column("DATA", CellKind::Complex, shape, STANDARD_MANAGER)
            .unwrap();
        let err = table
            .add_column("DATA", CellKind::Complex, shape, STANDARD_MANAGER)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        let err = table
            .add_column("BAD", CellKind::Complex, CellShape::new(0, 4), STANDARD_MANAGER)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_row_count_is_fixed() {
        let dir = tempdir().unwrap();
        let mut table = VisTable::create(dir.path().join("t.vtab"), 4).unwrap();
        table
            .add_column("DATA", CellKind::Complex, CellShape::new(1, 1), STANDARD_MANAGER)
            .unwrap();
        let err = table.put_row("DATA", 4, &[0.0, 0.0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(table.nrow(), 4);
    }
}
