use std::fs;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use equilibra_common::{ModelError, Table};

#[derive(Debug, Error)]
pub enum TableError {
    #[error("unknown file symbol `{0}`")]
    MissingFile(String),
    #[error("could not find sheet `{sheet}` in file `{file}`")]
    MissingSheet { file: String, sheet: String },
    #[error("i/o error reading `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed table file `{path}`: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<TableError> for ModelError {
    fn from(err: TableError) -> Self {
        ModelError::io(err.to_string())
    }
}

/// One "file" of named tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SheetSet {
    sheets: FxHashMap<String, Table>,
    #[serde(default)]
    order: Vec<String>,
}

impl SheetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, table: Table) {
        let name = name.into();
        if !self.sheets.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.sheets.insert(name, table);
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.sheets.get(name)
    }

    /// Sheet names in insertion order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }
}

/// The in-memory store: file symbol → sheet name → table.
#[derive(Debug, Default)]
pub struct TableStore {
    files: FxHashMap<String, SheetSet>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_file(&self, symbol: &str) -> bool {
        self.files.contains_key(symbol)
    }

    pub fn insert_file<S: Into<String>>(&mut self, symbol: S, sheets: SheetSet) {
        self.files.insert(symbol.into(), sheets);
    }

    /// Insert a single table, creating the file entry when needed.
    pub fn insert_table<F, T>(&mut self, file: F, sheet: T, table: Table)
    where
        F: Into<String>,
        T: Into<String>,
    {
        self.files
            .entry(file.into())
            .or_default()
            .insert(sheet, table);
    }

    pub fn table(&self, file: &str, sheet: &str) -> Result<&Table, TableError> {
        let sheets = self
            .files
            .get(file)
            .ok_or_else(|| TableError::MissingFile(file.to_string()))?;
        sheets.get(sheet).ok_or_else(|| TableError::MissingSheet {
            file: file.to_string(),
            sheet: sheet.to_string(),
        })
    }

    /// Load a JSON sheet-set from disk and register it under `symbol`.
    pub fn load_json_file<P: AsRef<Path>>(
        &mut self,
        symbol: &str,
        path: P,
    ) -> Result<(), TableError> {
        let sheets = load_json(path)?;
        self.insert_file(symbol, sheets);
        Ok(())
    }
}

/// Read one sheet-set from a JSON file.
pub fn load_json<P: AsRef<Path>>(path: P) -> Result<SheetSet, TableError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| TableError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| TableError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Write one sheet-set to a JSON file.
pub fn save_json<P: AsRef<Path>>(path: P, sheets: &SheetSet) -> Result<(), TableError> {
    let path = path.as_ref();
    let text = serde_json::to_string_pretty(sheets).map_err(|source| TableError::Json {
        path: path.display().to_string(),
        source,
    })?;
    fs::write(path, text).map_err(|source| TableError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use equilibra_common::Table;

    fn sample() -> SheetSet {
        let mut sheets = SheetSet::new();
        sheets.insert(
            "costs",
            Table::with_value_rows(
                vec!["REG", "Value"],
                vec![(vec!["aus"], 1.0), (vec!["nzl"], 2.0)],
            ),
        );
        sheets
    }

    #[test]
    fn store_lookups_and_misses() {
        let mut store = TableStore::new();
        store.insert_file("data", sample());
        assert!(store.table("data", "costs").is_ok());
        assert!(matches!(
            store.table("data", "prices"),
            Err(TableError::MissingSheet { .. })
        ));
        assert!(matches!(
            store.table("other", "costs"),
            Err(TableError::MissingFile(_))
        ));
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        save_json(&path, &sample()).unwrap();
        let loaded = load_json(&path).unwrap();
        assert_eq!(loaded.get("costs"), sample().get("costs"));
        assert_eq!(loaded.names(), ["costs"]);
    }
}
