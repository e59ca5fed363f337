//! Variable catalogs.
//!
//! Indexed declarations are flattened into one dense offset space per
//! catalog: each variable owns a contiguous region whose length is the
//! product of its set cardinalities, laid out row-major in declaration
//! order with the rightmost set advancing fastest.
//!
//! The central operation is [`VarTable::indices`]: resolve a query over
//! (possibly subset) sets into concrete offsets, going through the set
//! catalog's recorded mappings where the query set is not the variable's
//! own.

use rustc_hash::FxHashMap;

use equilibra_common::ModelError;
use equilibra_tables::TableStore;

use crate::sets::SetCatalog;

/// Enumerate every index tuple over the given sizes, rightmost fastest.
pub fn index_tuples(sizes: &[usize]) -> Vec<Vec<usize>> {
    let mut tuples = vec![Vec::new()];
    for &size in sizes {
        let mut next = Vec::with_capacity(tuples.len() * size);
        for tuple in &tuples {
            for i in 0..size {
                let mut extended = tuple.clone();
                extended.push(i);
                next.push(extended);
            }
        }
        tuples = next;
    }
    tuples
}

#[derive(Debug, Clone)]
struct VarEntry {
    sets: Vec<String>,
    offset: usize,
    size: usize,
}

/// The catalog core shared by data and solution variables.
#[derive(Debug, Default)]
pub struct VarTable {
    names: Vec<String>,
    entries: FxHashMap<String, VarEntry>,
    fullnames: Vec<String>,
    fullnames_by_column: Vec<Vec<String>>,
    total: usize,
}

impl VarTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The expanded per-offset names, e.g. `X_AG_EMIRATI`.
    pub fn fullnames(&self) -> &[String] {
        &self.fullnames
    }

    /// The expanded per-offset labels, e.g. `["X", "AG", "EMIRATI"]`.
    pub fn fullnames_by_column(&self) -> &[Vec<String>] {
        &self.fullnames_by_column
    }

    /// The length of the catalog's dense value vector.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn entry(&self, name: &str) -> Result<&VarEntry, ModelError> {
        self.entries
            .get(name)
            .ok_or_else(|| ModelError::consistency(format!("could not find variable `{name}`")))
    }

    pub fn offset(&self, name: &str) -> Result<usize, ModelError> {
        Ok(self.entry(name)?.offset)
    }

    pub fn size(&self, name: &str) -> Result<usize, ModelError> {
        Ok(self.entry(name)?.size)
    }

    pub fn sets_of(&self, name: &str) -> Result<&[String], ModelError> {
        Ok(&self.entry(name)?.sets)
    }

    pub fn add_var(
        &mut self,
        catalog: &SetCatalog,
        name: &str,
        sets: &[String],
    ) -> Result<(), ModelError> {
        if self.entries.contains_key(name) {
            return Err(ModelError::consistency(format!(
                "attempt to insert duplicate variable name `{name}`"
            )));
        }

        let mut size = 1usize;
        let mut element_lists = Vec::with_capacity(sets.len());
        for set in sets {
            let index_set = catalog.get(set).map_err(|e| {
                e.with_message(format!(
                    "variable `{name}` is declared over undefined set `{set}`"
                ))
            })?;
            size *= index_set.len();
            element_lists.push(index_set.elements.clone());
        }

        let sizes: Vec<usize> = element_lists.iter().map(Vec::len).collect();
        for tuple in index_tuples(&sizes) {
            let mut fullname = name.to_string();
            let mut by_column = vec![name.to_string()];
            for (dim, &pos) in tuple.iter().enumerate() {
                fullname.push('_');
                fullname.push_str(&element_lists[dim][pos]);
                by_column.push(element_lists[dim][pos].clone());
            }
            self.fullnames.push(fullname);
            self.fullnames_by_column.push(by_column);
        }

        self.names.push(name.to_string());
        self.entries.insert(
            name.to_string(),
            VarEntry {
                sets: sets.to_vec(),
                offset: self.total,
                size,
            },
        );
        self.total += size;
        Ok(())
    }

    /// Resolve a query over `query_sets` into concrete offsets, one per
    /// tuple. Each query set is either the variable's own set at that
    /// position (identity) or a recorded subset of it.
    pub fn indices(
        &self,
        catalog: &SetCatalog,
        name: &str,
        query_sets: &[String],
        tuples: &[Vec<usize>],
    ) -> Result<Vec<usize>, ModelError> {
        let entry = self.entry(name)?;
        if query_sets.len() != entry.sets.len() {
            return Err(ModelError::consistency(format!(
                "variable `{name}` ranging over sets {query_sets:?} is inconsistent with \
                 its declared sets {:?}",
                entry.sets
            )));
        }

        if entry.sets.is_empty() {
            return Ok(vec![entry.offset; tuples.len()]);
        }

        let dims = entry.sets.len();
        let mut mappings = Vec::with_capacity(dims);
        let mut sizes = Vec::with_capacity(dims);
        for (dim, query_set) in query_sets.iter().enumerate() {
            let own_set = &entry.sets[dim];
            let mapping = catalog.mapping(own_set, query_set).ok_or_else(|| {
                ModelError::consistency(format!(
                    "error resolving mapping from set `{query_set}` to `{own_set}` for \
                     variable `{name}`"
                ))
            })?;
            mappings.push(mapping);
            sizes.push(catalog.size(own_set)?);
        }

        // Strides behave like positional notation: the rightmost index
        // moves by one, each position to the left by the product of the
        // sizes to its right.
        let mut strides = vec![1usize; dims];
        for dim in (0..dims.saturating_sub(1)).rev() {
            strides[dim] = strides[dim + 1] * sizes[dim + 1];
        }

        let mut offsets = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            if tuple.len() != dims {
                return Err(ModelError::internal(format!(
                    "index tuple {tuple:?} does not match the {dims} dimensions of \
                     variable `{name}`"
                )));
            }
            let mut offset = entry.offset;
            for dim in 0..dims {
                let mapped = *mappings[dim].get(tuple[dim]).ok_or_else(|| {
                    ModelError::internal(format!(
                        "index {} out of range for dimension {dim} of variable `{name}`",
                        tuple[dim]
                    ))
                })?;
                offset += mapped * strides[dim];
            }
            offsets.push(offset);
        }
        Ok(offsets)
    }
}

/// Data variables: calibrated values, optionally loaded from a named
/// external table, optionally fixed.
#[derive(Debug, Default)]
pub struct DataVars {
    pub table: VarTable,
    sources: FxHashMap<String, (String, String)>,
    fixed: FxHashMap<String, bool>,
}

impl DataVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_var(
        &mut self,
        catalog: &SetCatalog,
        name: &str,
        sets: &[String],
        source: Option<(String, String)>,
        fixed: bool,
    ) -> Result<(), ModelError> {
        self.table.add_var(catalog, name, sets)?;
        if let Some(source) = source {
            self.sources.insert(name.to_string(), source);
        }
        self.fixed.insert(name.to_string(), fixed);
        Ok(())
    }

    pub fn is_fixed(&self, name: &str) -> bool {
        self.fixed.get(name).copied().unwrap_or(false)
    }

    /// Build the dense data vector: for each variable with a table source,
    /// fetch the table and re-key its rows against the cartesian product of
    /// the variable's own set elements (declaration order, rightmost
    /// fastest). Unreferenced variables are zero-filled.
    pub fn read_values(
        &self,
        catalog: &SetCatalog,
        store: &TableStore,
    ) -> Result<Vec<f64>, ModelError> {
        let mut values = Vec::with_capacity(self.table.len());
        for name in self.table.names() {
            let size = self.table.size(name)?;
            let Some((file, sheet)) = self.sources.get(name) else {
                values.extend(std::iter::repeat_n(0.0, size));
                continue;
            };
            let table = store.table(file, sheet).map_err(|e| {
                ModelError::io(format!("reading data for `{name}`: {e}"))
            })?;

            let sets = self.table.sets_of(name)?;
            if sets.is_empty() {
                let value = table.scalar_value().ok_or_else(|| {
                    ModelError::io(format!(
                        "no value found for scalar variable `{name}` in `{file}.{sheet}`"
                    ))
                })?;
                values.push(value);
                continue;
            }

            let by_labels = table.index_by_labels();
            let element_lists: Vec<&Vec<String>> = sets
                .iter()
                .map(|s| catalog.get(s).map(|set| &set.elements))
                .collect::<Result<_, _>>()?;
            let sizes: Vec<usize> = element_lists.iter().map(|e| e.len()).collect();

            let start = values.len();
            for tuple in index_tuples(&sizes) {
                let key: Vec<String> = tuple
                    .iter()
                    .enumerate()
                    .map(|(dim, &pos)| element_lists[dim][pos].clone())
                    .collect();
                let value = by_labels.get(&key).ok_or_else(|| {
                    ModelError::io(format!(
                        "missing value for `{name}` at {key:?} in `{file}.{sheet}`"
                    ))
                })?;
                values.push(*value);
            }

            if values.len() - start != size {
                return Err(ModelError::internal(format!(
                    "read vector length does not match the predetermined length for \
                     variable `{name}`"
                )));
            }
        }
        Ok(values)
    }
}

/// Solution variables: the per-substep perturbations, tagged *change*
/// (additively composed across substeps) or *percent-change*
/// (multiplicatively composed), and independently tagged *linear*.
#[derive(Debug, Default)]
pub struct SolVars {
    pub table: VarTable,
    change: FxHashMap<String, bool>,
    linear: FxHashMap<String, bool>,
}

impl SolVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_var(
        &mut self,
        catalog: &SetCatalog,
        name: &str,
        sets: &[String],
        change: bool,
        linear: bool,
    ) -> Result<(), ModelError> {
        self.table.add_var(catalog, name, sets)?;
        self.change.insert(name.to_string(), change);
        self.linear.insert(name.to_string(), linear);
        Ok(())
    }

    pub fn is_change(&self, name: &str) -> bool {
        self.change.get(name).copied().unwrap_or(false)
    }

    pub fn is_linear(&self, name: &str) -> bool {
        self.linear.get(name).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use equilibra_common::Table;
    use proptest::prelude::*;

    fn catalog() -> SetCatalog {
        let mut c = SetCatalog::new();
        c.new_set("I", vec!["i1".into(), "i2".into(), "i3".into()])
            .unwrap();
        c.new_set("J", vec!["j1".into(), "j2".into()]).unwrap();
        c.new_set("B", vec!["i2".into()]).unwrap();
        c.subset_of("B", "I").unwrap();
        c
    }

    #[test]
    fn offsets_are_contiguous_and_dense() {
        let c = catalog();
        let mut t = VarTable::new();
        t.add_var(&c, "a", &[]).unwrap();
        t.add_var(&c, "x", &["I".into(), "J".into()]).unwrap();
        t.add_var(&c, "y", &["J".into()]).unwrap();
        assert_eq!(t.offset("a").unwrap(), 0);
        assert_eq!(t.offset("x").unwrap(), 1);
        assert_eq!(t.size("x").unwrap(), 6);
        assert_eq!(t.offset("y").unwrap(), 7);
        assert_eq!(t.len(), 9);
        assert_eq!(t.fullnames().len(), 9);
        assert_eq!(t.fullnames()[1], "x_i1_j1");
        assert_eq!(t.fullnames()[2], "x_i1_j2");
        assert_eq!(t.fullnames()[6], "x_i3_j2");
    }

    #[test]
    fn rightmost_index_advances_fastest() {
        let c = catalog();
        let mut t = VarTable::new();
        t.add_var(&c, "x", &["I".into(), "J".into()]).unwrap();
        let offsets = t
            .indices(
                &c,
                "x",
                &["I".into(), "J".into()],
                &[vec![0, 0], vec![0, 1], vec![1, 0], vec![2, 1]],
            )
            .unwrap();
        assert_eq!(offsets, vec![0, 1, 2, 5]);
    }

    #[test]
    fn scalar_query_repeats_the_offset() {
        let c = catalog();
        let mut t = VarTable::new();
        t.add_var(&c, "a", &[]).unwrap();
        let offsets = t
            .indices(&c, "a", &[], &[vec![], vec![], vec![]])
            .unwrap();
        assert_eq!(offsets, vec![0, 0, 0]);
    }

    #[test]
    fn subset_query_goes_through_the_mapping() {
        let c = catalog();
        let mut t = VarTable::new();
        t.add_var(&c, "x", &["I".into()]).unwrap();
        let offsets = t.indices(&c, "x", &["B".into()], &[vec![0]]).unwrap();
        assert_eq!(offsets, vec![1], "B's only element is i2, at position 1");
    }

    #[test]
    fn unmapped_query_set_is_fatal() {
        let c = catalog();
        let mut t = VarTable::new();
        t.add_var(&c, "x", &["I".into()]).unwrap();
        let err = t.indices(&c, "x", &["J".into()], &[vec![0]]).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("x") && text.contains("J") && text.contains("I"));
    }

    #[test]
    fn arity_mismatch_is_fatal() {
        let c = catalog();
        let mut t = VarTable::new();
        t.add_var(&c, "x", &["I".into()]).unwrap();
        assert!(t.indices(&c, "x", &[], &[vec![]]).is_err());
    }

    #[test]
    fn read_values_rekeys_rows_and_zero_fills() {
        let c = catalog();
        let mut d = DataVars::new();
        d.add_var(
            &c,
            "w",
            &["I".into()],
            Some(("data".into(), "w".into())),
            false,
        )
        .unwrap();
        d.add_var(&c, "z", &["J".into()], None, false).unwrap();

        let mut store = TableStore::new();
        // Rows arrive out of order; the read must re-key them.
        store.insert_table(
            "data",
            "w",
            Table::with_value_rows(
                vec!["I", "Value"],
                vec![(vec!["i3"], 3.0), (vec!["i1"], 1.0), (vec!["i2"], 2.0)],
            ),
        );

        let values = d.read_values(&c, &store).unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn missing_row_names_the_variable() {
        let c = catalog();
        let mut d = DataVars::new();
        d.add_var(
            &c,
            "w",
            &["I".into()],
            Some(("data".into(), "w".into())),
            false,
        )
        .unwrap();
        let mut store = TableStore::new();
        store.insert_table(
            "data",
            "w",
            Table::with_value_rows(vec!["I", "Value"], vec![(vec!["i1"], 1.0)]),
        );
        let err = d.read_values(&c, &store).unwrap_err();
        assert!(err.to_string().contains("w"));
    }

    proptest! {
        /// Offsets round-trip: every in-range tuple resolves to a unique
        /// offset below the flat length, and walking the sets rightmost
        /// fastest recovers the tuple.
        #[test]
        fn offset_round_trip(sizes in prop::collection::vec(1usize..4, 1..4)) {
            let mut c = SetCatalog::new();
            let mut set_names = Vec::new();
            for (dim, &size) in sizes.iter().enumerate() {
                let name = format!("S{dim}");
                let elements = (0..size).map(|e| format!("e{dim}x{e}")).collect();
                c.new_set(&name, elements).unwrap();
                set_names.push(name);
            }
            let mut t = VarTable::new();
            t.add_var(&c, "v", &set_names).unwrap();

            let tuples = index_tuples(&sizes);
            let flat = t.size("v").unwrap();
            for (expected, tuple) in tuples.iter().enumerate() {
                let offsets = t.indices(&c, "v", &set_names, &[tuple.clone()]).unwrap();
                prop_assert_eq!(offsets.len(), 1);
                prop_assert!(offsets[0] < flat);
                // Enumeration order is rightmost fastest, so the position in
                // the tuple walk is the offset itself.
                prop_assert_eq!(offsets[0], expected);

                // Invert the offset back into the tuple.
                let mut rest = offsets[0];
                let mut recovered = vec![0usize; sizes.len()];
                for dim in (0..sizes.len()).rev() {
                    recovered[dim] = rest % sizes[dim];
                    rest /= sizes[dim];
                }
                prop_assert_eq!(&recovered, tuple);
            }
        }
    }
}
