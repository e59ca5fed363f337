//! The four ordered statement collections: assertions, formulas, updates
//! and equations.
//!
//! All four share the same add/lookup shape — a unique name, the
//! `(index → set)` bindings the statement ranges over, and an expression
//! tree. Formulas and updates add a left-hand-side variable reference;
//! equations own a contiguous block of row offsets sized by their index
//! product.

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use equilibra_common::ModelError;
use equilibra_parse::{Arg, ExprKind, ExprNode, Origin, VarRef};

use crate::diff::{Contribution, Differ};
use crate::eval::Evaluator;
use crate::sets::SetCatalog;
use crate::vars::{DataVars, SolVars, index_tuples};

/// The shared core of every manager.
#[derive(Debug, Default)]
struct StatementCore {
    names: Vec<String>,
    sets: FxHashMap<String, Vec<String>>,
    indices: FxHashMap<String, Vec<String>>,
    roots: FxHashMap<String, ExprNode>,
    lines: FxHashMap<String, u32>,
}

impl StatementCore {
    fn add(
        &mut self,
        name: &str,
        body: &str,
        sets: Vec<String>,
        indices: Vec<String>,
        line: u32,
    ) -> Result<(), ModelError> {
        if self.roots.contains_key(name) {
            return Err(ModelError::consistency(format!(
                "`{name}` is already an existing statement name"
            ))
            .with_line(line));
        }
        let origin = Origin::new(name, line);
        let root = ExprNode::parse(body, &sets, &indices, &origin)?;
        self.insert(name, root, sets, indices, line);
        Ok(())
    }

    fn insert(
        &mut self,
        name: &str,
        root: ExprNode,
        sets: Vec<String>,
        indices: Vec<String>,
        line: u32,
    ) {
        self.names.push(name.to_string());
        self.sets.insert(name.to_string(), sets);
        self.indices.insert(name.to_string(), indices);
        self.roots.insert(name.to_string(), root);
        self.lines.insert(name.to_string(), line);
    }

    fn contains(&self, name: &str) -> bool {
        self.roots.contains_key(name)
    }

    fn parts(&self, name: &str) -> Result<(&ExprNode, &[String], &[String]), ModelError> {
        let root = self
            .roots
            .get(name)
            .ok_or_else(|| ModelError::internal(format!("unknown statement `{name}`")))?;
        Ok((root, &self.sets[name], &self.indices[name]))
    }

    /// The statement's full site list: one tuple per element combination.
    fn site_tuples(
        &self,
        name: &str,
        catalog: &SetCatalog,
    ) -> Result<Vec<Vec<usize>>, ModelError> {
        let sizes = self.sets[name]
            .iter()
            .map(|s| catalog.size(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(index_tuples(&sizes))
    }
}

/* ──────────────────────────── assertions ──────────────────────────── */

/// Assertions are comparisons checked across their whole index domain.
/// Failures are reported and counted but never abort the run.
#[derive(Debug, Default)]
pub struct AssertManager {
    core: StatementCore,
}

impl AssertManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        name: &str,
        condition: &str,
        sets: Vec<String>,
        indices: Vec<String>,
        line: u32,
    ) -> Result<(), ModelError> {
        self.core.add(name, condition, sets, indices, line)?;
        if !matches!(self.core.roots[name].kind, ExprKind::Compare { .. }) {
            return Err(ModelError::parse(format!(
                "could not interpret `{condition}` as a condition in assertion `{name}`"
            ))
            .at(name, line));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.core.names.is_empty()
    }

    /// Check one assertion; returns how many sites failed.
    pub fn check(&self, name: &str, evaluator: &Evaluator) -> Result<usize, ModelError> {
        let (root, sets, indices) = self.core.parts(name)?;
        let ExprKind::Compare { lhs, op, rhs } = &root.kind else {
            return Err(ModelError::internal(format!(
                "assertion `{name}` lost its comparison root"
            )));
        };
        let tuples = self.core.site_tuples(name, evaluator.catalog)?;
        let held = evaluator.eval_predicate(lhs, *op, rhs, sets, indices, &tuples, None)?;

        let mut failures = 0usize;
        for (holds, tuple) in held.iter().zip(&tuples) {
            if *holds {
                continue;
            }
            failures += 1;
            let mut bindings = String::new();
            for (dim, &pos) in tuple.iter().enumerate() {
                if dim > 0 {
                    bindings.push_str(", ");
                }
                let element = &evaluator.catalog.get(&sets[dim])?.elements[pos];
                bindings.push_str(&format!("{} = {element}", indices[dim]));
            }
            warn!("assertion {name} failed, for index combination {bindings}");
        }
        Ok(failures)
    }

    /// Check every assertion; returns the total failure count.
    pub fn check_all(&self, evaluator: &Evaluator) -> Result<usize, ModelError> {
        let mut failures = 0usize;
        for name in &self.core.names {
            failures += self.check(name, evaluator)?;
        }
        Ok(failures)
    }
}

/* ──────────────────────── formulas and updates ────────────────────── */

/// Formulas scatter a computed right-hand side into the data vector; the
/// update manager is the same machinery run post-solve with the solution
/// vector in scope.
#[derive(Debug, Default)]
pub struct FormulaManager {
    core: StatementCore,
    lhs: FxHashMap<String, VarRef>,
    initial: FxHashMap<String, bool>,
}

impl FormulaManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.core.contains(name)
    }

    pub fn names(&self) -> &[String] {
        &self.core.names
    }

    pub fn add(
        &mut self,
        name: &str,
        lhs_text: &str,
        rhs_text: &str,
        sets: Vec<String>,
        indices: Vec<String>,
        line: u32,
        initial: bool,
    ) -> Result<(), ModelError> {
        let origin = Origin::new(name, line);
        let lhs = VarRef::parse(lhs_text.trim(), &origin)?;

        // The LHS index symbols must be exactly the declared binding
        // symbols — duplicates admitted (diagonal writes), literal
        // elements excluded from the check.
        let mut lhs_symbols: Vec<&str> = lhs
            .args
            .iter()
            .filter_map(|arg| match arg {
                Arg::Symbol(s) => Some(s.as_str()),
                Arg::Literal(_) => None,
            })
            .collect();
        lhs_symbols.sort_unstable();
        lhs_symbols.dedup();
        let mut declared: Vec<&str> = indices.iter().map(String::as_str).collect();
        declared.sort_unstable();
        if lhs_symbols != declared {
            return Err(ModelError::consistency(format!(
                "indexes of the left hand side and the statement bindings are not \
                 consistent in `{name}`"
            ))
            .at(name, line));
        }

        self.core.add(name, rhs_text, sets, indices, line)?;
        self.lhs.insert(name.to_string(), lhs);
        self.initial.insert(name.to_string(), initial);
        Ok(())
    }

    /// Re-append already-defined formula names so they re-execute on every
    /// later pass over the manager.
    pub fn add_loop(&mut self, iterations: usize, formulas: &[String]) {
        for _ in 1..iterations {
            self.core.names.extend(formulas.iter().cloned());
        }
    }

    /// Evaluate one statement and scatter the result into `data_values`.
    pub fn evaluate(
        &self,
        name: &str,
        catalog: &SetCatalog,
        data: &DataVars,
        data_values: &mut [f64],
        solution: Option<(&SolVars, &[f64])>,
    ) -> Result<(), ModelError> {
        let (root, sets, indices) = self.core.parts(name)?;
        let lhs = &self.lhs[name];
        let line = self.core.lines[name];
        let tuples = self.core.site_tuples(name, catalog)?;

        // Build the scatter offsets: permute each site tuple into the LHS
        // argument order, lifting literal elements into fixed positions.
        let declared_sets = data.table.sets_of(&lhs.name).map_err(|e| {
            e.with_message(format!(
                "left hand side `{}` of `{name}` is not a data variable",
                lhs.name
            ))
            .at(name, line)
        })?;
        if lhs.args.len() != declared_sets.len() {
            return Err(ModelError::consistency(format!(
                "left hand side `{}` is referenced with {} indices but declared over \
                 {} sets",
                lhs.name,
                lhs.args.len(),
                declared_sets.len()
            ))
            .at(name, line));
        }

        let mut lhs_sets = Vec::with_capacity(lhs.args.len());
        let mut lhs_tuples = vec![Vec::with_capacity(lhs.args.len()); tuples.len()];
        for (dim, arg) in lhs.args.iter().enumerate() {
            match arg {
                Arg::Symbol(symbol) => {
                    let pos = indices
                        .iter()
                        .position(|i| i == symbol)
                        .ok_or_else(|| {
                            ModelError::internal(format!(
                                "LHS index `{symbol}` missing from bindings of `{name}`"
                            ))
                        })?;
                    lhs_sets.push(sets[pos].clone());
                    for (site, tuple) in tuples.iter().enumerate() {
                        lhs_tuples[site].push(tuple[pos]);
                    }
                }
                Arg::Literal(element) => {
                    let set_name = &declared_sets[dim];
                    let pos = catalog
                        .get(set_name)
                        .map_err(|e| e.at(name, line))?
                        .position(element)
                        .ok_or_else(|| {
                            ModelError::consistency(format!(
                                "couldn't get index for element `{element}` in set \
                                 `{set_name}`"
                            ))
                            .at(name, line)
                        })?;
                    lhs_sets.push(set_name.clone());
                    for lhs_tuple in &mut lhs_tuples {
                        lhs_tuple.push(pos);
                    }
                }
            }
        }
        let scatter = data
            .table
            .indices(catalog, &lhs.name, &lhs_sets, &lhs_tuples)
            .map_err(|e| e.at(name, line))?;

        let evaluator = match solution {
            Some((solution, solution_values)) => Evaluator::with_solution(
                catalog,
                data,
                data_values,
                solution,
                solution_values,
            ),
            None => Evaluator::over_data(catalog, data, data_values),
        };
        let values = evaluator.eval(root, sets, indices, &tuples)?;

        for (offset, value) in scatter.into_iter().zip(values) {
            data_values[offset] = value;
        }
        Ok(())
    }

    /// Run the formula pass in declaration order (loop-formulas appear as
    /// many times as they were re-appended). At substeps after the first,
    /// `initial`-modified formulas are excluded.
    pub fn evaluate_all_formulas(
        &self,
        catalog: &SetCatalog,
        data: &DataVars,
        data_values: &mut [f64],
        include_initial: bool,
    ) -> Result<(), ModelError> {
        for name in &self.core.names {
            if !include_initial && self.initial.get(name).copied().unwrap_or(false) {
                continue;
            }
            self.evaluate(name, catalog, data, data_values, None)?;
        }
        Ok(())
    }

    /// Run the update pass post-solve: the freshly computed solution vector
    /// is in scope, and fixed data variables are never written.
    pub fn evaluate_all_updates(
        &self,
        catalog: &SetCatalog,
        data: &DataVars,
        data_values: &mut [f64],
        solution: &SolVars,
        solution_values: &[f64],
    ) -> Result<(), ModelError> {
        for name in &self.core.names {
            let target = &self.lhs[name];
            if data.is_fixed(&target.name) {
                debug!(
                    "skipping update {name}: data variable {} is fixed",
                    target.name
                );
                continue;
            }
            self.evaluate(
                name,
                catalog,
                data,
                data_values,
                Some((solution, solution_values)),
            )?;
        }
        Ok(())
    }
}

/* ───────────────────────────── equations ──────────────────────────── */

/// Equations own contiguous row blocks; `diff_all` pre-differentiates each
/// concrete row into its contribution list.
#[derive(Debug, Default)]
pub struct EquationManager {
    core: StatementCore,
    offsets: FxHashMap<String, usize>,
    sizes: FxHashMap<String, usize>,
    fullnames: Vec<String>,
    row_names: Vec<String>,
    row_tuples: Vec<Vec<usize>>,
    total: usize,
    derivatives: Vec<Vec<Contribution>>,
}

impl EquationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        catalog: &SetCatalog,
        name: &str,
        lhs_text: &str,
        rhs_text: &str,
        sets: Vec<String>,
        indices: Vec<String>,
        line: u32,
    ) -> Result<(), ModelError> {
        if self.core.contains(name) {
            return Err(ModelError::consistency(format!(
                "`{name}` is already an existing statement name"
            ))
            .with_line(line));
        }

        // The stored tree is the rewritten `lhs − rhs`.
        let origin = Origin::new(name, line);
        let lhs = ExprNode::parse(lhs_text, &sets, &indices, &origin)?;
        let rhs = ExprNode::parse(rhs_text, &sets, &indices, &origin)?;
        let root = lhs.minus(rhs)?;

        let element_lists = sets
            .iter()
            .map(|s| catalog.get(s).map(|set| set.elements.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.at(name, line))?;
        let sizes: Vec<usize> = element_lists.iter().map(Vec::len).collect();
        let width: usize = sizes.iter().product();

        for tuple in index_tuples(&sizes) {
            let mut fullname = name.to_string();
            for (dim, &pos) in tuple.iter().enumerate() {
                fullname.push('_');
                fullname.push_str(&element_lists[dim][pos]);
            }
            self.fullnames.push(fullname);
            self.row_names.push(name.to_string());
            self.row_tuples.push(tuple);
        }

        self.offsets.insert(name.to_string(), self.total);
        self.sizes.insert(name.to_string(), width);
        self.total += width;
        self.core.insert(name, root, sets, indices, line);
        Ok(())
    }

    /// Total equation rows.
    pub fn rows(&self) -> usize {
        self.total
    }

    /// The contiguous row range assigned to one equation.
    pub fn row_block(&self, name: &str) -> Result<std::ops::Range<usize>, ModelError> {
        let offset = *self.offsets.get(name).ok_or_else(|| {
            ModelError::internal(format!("unknown equation `{name}`"))
        })?;
        Ok(offset..offset + self.sizes[name])
    }

    /// Expanded per-row labels, e.g. `e_price_AG_EMIRATI`.
    pub fn row_labels(&self) -> &[String] {
        &self.fullnames
    }

    /// Differentiate every concrete row against the solution catalog at
    /// the current data.
    pub fn diff_all(&mut self, differ: &Differ) -> Result<(), ModelError> {
        self.derivatives.clear();
        self.derivatives.reserve(self.row_names.len());
        for (name, tuple) in self.row_names.iter().zip(&self.row_tuples) {
            let (root, sets, indices) = self.core.parts(name)?;
            let contributions =
                differ.differentiate(root, sets, indices, &[tuple.clone()])?;
            self.derivatives.push(contributions);
        }
        Ok(())
    }

    /// The pre-differentiated contribution list, one entry per row.
    pub fn derivatives(&self) -> &[Vec<Contribution>] {
        &self.derivatives
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::VarTable;

    fn catalog() -> SetCatalog {
        let mut c = SetCatalog::new();
        c.new_set("I", vec!["i1".into(), "i2".into(), "i3".into()])
            .unwrap();
        c.new_set("B", vec!["i2".into(), "i3".into()]).unwrap();
        c.subset_of("B", "I").unwrap();
        c
    }

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn assertion_root_must_be_a_comparison() {
        let mut asserts = AssertManager::new();
        let err = asserts.add("bad", "p_i + 1", strings(&["I"]), strings(&["i"]), 3);
        assert!(err.is_err());
        asserts
            .add("nonneg", "p_i >= 0", strings(&["I"]), strings(&["i"]), 4)
            .unwrap();
    }

    #[test]
    fn assertion_failures_are_counted_not_fatal() {
        let c = catalog();
        let mut data = DataVars::new();
        data.add_var(&c, "p", &["I".into()], None, false).unwrap();
        let values = vec![1.0, -1.0, 2.0];

        let mut asserts = AssertManager::new();
        asserts
            .add("nonneg", "p_i >= 0", strings(&["I"]), strings(&["i"]), 1)
            .unwrap();

        let evaluator = Evaluator::over_data(&c, &data, &values);
        assert_eq!(asserts.check_all(&evaluator).unwrap(), 1);
    }

    #[test]
    fn formula_scatters_into_the_data_vector() {
        let c = catalog();
        let mut data = DataVars::new();
        data.add_var(&c, "x", &["I".into()], None, false).unwrap();
        data.add_var(&c, "y", &["I".into()], None, false).unwrap();
        let mut values = vec![10.0, 20.0, 30.0, 0.0, 0.0, 0.0];

        let mut formulas = FormulaManager::new();
        formulas
            .add(
                "f1",
                "y_i",
                "x_i * 2",
                strings(&["I"]),
                strings(&["i"]),
                1,
                false,
            )
            .unwrap();
        formulas
            .evaluate_all_formulas(&c, &data, &mut values, true)
            .unwrap();
        assert_eq!(values[3..6], [20.0, 40.0, 60.0]);
    }

    #[test]
    fn formula_over_a_subset_writes_only_mapped_slots() {
        let c = catalog();
        let mut data = DataVars::new();
        data.add_var(&c, "x", &["I".into()], None, false).unwrap();
        data.add_var(&c, "y", &["I".into()], None, false).unwrap();
        let mut values = vec![10.0, 20.0, 30.0, 0.0, 0.0, 0.0];

        let mut formulas = FormulaManager::new();
        formulas
            .add(
                "f1",
                "y_b",
                "x_b",
                strings(&["B"]),
                strings(&["b"]),
                1,
                false,
            )
            .unwrap();
        formulas
            .evaluate_all_formulas(&c, &data, &mut values, true)
            .unwrap();
        assert_eq!(values[3..6], [0.0, 20.0, 30.0]);
    }

    #[test]
    fn duplicated_lhs_index_writes_the_diagonal() {
        let c = catalog();
        let mut data = DataVars::new();
        data.add_var(&c, "w", &["I".into()], None, false).unwrap();
        data.add_var(&c, "m", &["I".into(), "I".into()], None, false)
            .unwrap();
        let mut values = vec![0.0; 12];
        values[0] = 5.0;
        values[1] = 6.0;
        values[2] = 7.0;

        let mut formulas = FormulaManager::new();
        formulas
            .add(
                "diag",
                "m_i_i",
                "w_i",
                strings(&["I"]),
                strings(&["i"]),
                1,
                false,
            )
            .unwrap();
        formulas
            .evaluate_all_formulas(&c, &data, &mut values, true)
            .unwrap();
        // m starts at offset 3; the diagonal is 0, 4, 8 within m.
        assert_eq!(values[3], 5.0);
        assert_eq!(values[7], 6.0);
        assert_eq!(values[11], 7.0);
        assert_eq!(values[4], 0.0);
    }

    #[test]
    fn lhs_indices_must_match_the_bindings() {
        let mut formulas = FormulaManager::new();
        let err = formulas.add(
            "f1",
            "y_j",
            "1",
            strings(&["I"]),
            strings(&["i"]),
            9,
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn initial_formulas_are_excluded_after_substep_zero() {
        let c = catalog();
        let mut data = DataVars::new();
        data.add_var(&c, "y", &[], None, false).unwrap();
        let mut values = vec![0.0];

        let mut formulas = FormulaManager::new();
        formulas
            .add("seed", "y", "7", Vec::new(), Vec::new(), 1, true)
            .unwrap();

        formulas
            .evaluate_all_formulas(&c, &data, &mut values, false)
            .unwrap();
        assert_eq!(values[0], 0.0, "initial formula must not run");

        formulas
            .evaluate_all_formulas(&c, &data, &mut values, true)
            .unwrap();
        assert_eq!(values[0], 7.0);
    }

    #[test]
    fn loop_formulas_reappend_names_in_order() {
        let mut formulas = FormulaManager::new();
        formulas
            .add("f1", "y", "1", Vec::new(), Vec::new(), 1, false)
            .unwrap();
        formulas
            .add("f2", "y", "2", Vec::new(), Vec::new(), 2, false)
            .unwrap();
        formulas.add_loop(3, &["f1".into(), "f2".into()]);
        assert_eq!(
            formulas.names(),
            &["f1", "f2", "f1", "f2", "f1", "f2"]
        );
    }

    #[test]
    fn equation_rows_are_contiguous_per_declaration() {
        let c = catalog();
        let mut data = DataVars::new();
        data.add_var(&c, "a", &[], None, false).unwrap();
        let mut solution = SolVars::new();
        solution
            .add_var(&c, "x", &["I".into()], false, false)
            .unwrap();

        let mut equations = EquationManager::new();
        equations
            .add(
                &c,
                "e1",
                "x_i",
                "a",
                strings(&["I"]),
                strings(&["i"]),
                1,
            )
            .unwrap();
        equations
            .add(&c, "e2", "x_\"i1\"", "0", Vec::new(), Vec::new(), 2)
            .unwrap();

        assert_eq!(equations.rows(), 4);
        assert_eq!(equations.row_block("e1").unwrap(), 0..3);
        assert_eq!(equations.row_block("e2").unwrap(), 3..4);
        assert_eq!(
            equations.row_labels(),
            &["e1_i1", "e1_i2", "e1_i3", "e2"]
        );

        let data_values = vec![2.0];
        let differ = Differ {
            catalog: &c,
            data: &data,
            solution: &solution,
            data_values: &data_values,
        };
        equations.diff_all(&differ).unwrap();
        assert_eq!(equations.derivatives().len(), 4);
        // Row e1_i2 differentiates to exactly one unit entry at x_i2.
        assert_eq!(equations.derivatives()[1].len(), 1);
        assert_eq!(equations.derivatives()[1][0].target, Some(1));
        // The scalar row e2 hits x_i1 through its literal argument.
        assert_eq!(equations.derivatives()[3][0].target, Some(0));
    }

    #[test]
    fn duplicate_equation_name_is_fatal() {
        let c = catalog();
        let mut equations = EquationManager::new();
        equations
            .add(&c, "e1", "1", "1", Vec::new(), Vec::new(), 1)
            .unwrap();
        assert!(
            equations
                .add(&c, "e1", "1", "1", Vec::new(), Vec::new(), 2)
                .is_err()
        );
    }

    #[test]
    fn equation_width_matches_variable_width() {
        let c = catalog();
        let mut t = VarTable::new();
        t.add_var(&c, "x", &["I".into()]).unwrap();
        let mut equations = EquationManager::new();
        equations
            .add(
                &c,
                "e1",
                "1",
                "1",
                strings(&["I"]),
                strings(&["i"]),
                1,
            )
            .unwrap();
        assert_eq!(equations.rows(), t.len());
    }
}
