//! Tabular key/value stores.
//!
//! The solver's contract with external data is a named table of
//! (index-tuple → float) pairs, grouped into "files" of named sheets. The
//! in-memory [`TableStore`] holds them; the JSON backend loads and saves a
//! file of sheets with the same shape.

mod store;

pub use store::{SheetSet, TableError, TableStore, load_json, save_json};
