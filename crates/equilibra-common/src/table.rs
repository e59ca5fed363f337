//! The tabular key/value contract shared with external stores.
//!
//! A table is a named block of rows; each row carries one element label per
//! set dimension followed by one or more floating-point values. Input tables
//! always have a single `Value` column; report tables may carry one value
//! column per simulation step.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// One table row: element labels, then values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

impl Row {
    pub fn new(labels: Vec<String>, values: Vec<f64>) -> Self {
        Self { labels, values }
    }
}

/// A named table of (index-tuple → float) pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new<S: Into<String>>(headers: Vec<S>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Convenience constructor for the common single-`Value` input shape.
    pub fn with_value_rows<S: Into<String>>(
        headers: Vec<S>,
        rows: Vec<(Vec<&str>, f64)>,
    ) -> Self {
        let mut table = Self::new(headers);
        for (labels, value) in rows {
            table.push(Row::new(
                labels.into_iter().map(str::to_string).collect(),
                vec![value],
            ));
        }
        table
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index the rows by their label tuple, keeping the first value of each
    /// row. Later duplicates of the same label tuple win, matching a
    /// last-write re-keyed read.
    pub fn index_by_labels(&self) -> FxHashMap<Vec<String>, f64> {
        let mut map = FxHashMap::default();
        for row in &self.rows {
            if let Some(&v) = row.values.first() {
                map.insert(row.labels.clone(), v);
            }
        }
        map
    }

    /// The first value of the first row; the scalar-table read.
    pub fn scalar_value(&self) -> Option<f64> {
        self.rows.first().and_then(|r| r.values.first()).copied()
    }

    /// The first label of every row, in order. Used when a table carries set
    /// elements rather than numeric data.
    pub fn first_labels(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|r| r.labels.first().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_index_keeps_first_value_column() {
        let table = Table::with_value_rows(
            vec!["REG", "Value"],
            vec![(vec!["aus"], 1.5), (vec!["nzl"], 2.5)],
        );
        let map = table.index_by_labels();
        assert_eq!(map.get(&vec!["aus".to_string()]), Some(&1.5));
        assert_eq!(map.get(&vec!["nzl".to_string()]), Some(&2.5));
    }

    #[test]
    fn scalar_value_reads_first_cell() {
        let table = Table::with_value_rows(vec!["Value"], vec![(vec![], 7.25)]);
        assert_eq!(table.scalar_value(), Some(7.25));
        assert_eq!(Table::new(vec!["Value"]).scalar_value(), None);
    }
}
