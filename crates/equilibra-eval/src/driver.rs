//! The model root context and the Newton-style driver.
//!
//! [`Model`] bundles the four process-wide catalogs (sets, data variables,
//! solution variables, statement managers) with the table store, the live
//! value vectors and the per-pass histories; every operation goes through
//! it explicitly.
//!
//! The driver runs two passes — base and policy — over `steps × substeps`
//! substeps. Each substep evaluates formulas, snapshots the data vector,
//! evaluates the pre-differentiated Jacobian fragments at the current
//! data, appends the closure identity rows, solves the sparse system, and
//! applies the updates. At the end of the base pass the histories are
//! archived and the data vector is re-read so the policy pass starts from
//! the same calibrated point.

use std::mem;
use std::path::Path;

use tracing::{info, warn};

use equilibra_common::ModelError;
use equilibra_parse::{ParsedStatement, SetExpr, SetOperand, parse_statement, split_statements};
use equilibra_tables::{SheetSet, TableStore};

use crate::closure::Closure;
use crate::config::RunConfig;
use crate::diff::Differ;
use crate::eval::Evaluator;
use crate::report::Reporter;
use crate::sets::SetCatalog;
use crate::sparse::{CsrMatrix, SolveOptions, Triplets, residual_norm, solve};
use crate::statements::{AssertManager, EquationManager, FormulaManager};
use crate::vars::{DataVars, SolVars};

/// Which simulation pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Base,
    Policy,
}

impl Pass {
    fn label(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Policy => "policy",
        }
    }
}

/// Data and solution snapshots, indexed `[step][substep][offset]`. Data
/// snapshots are taken before each solve, solution snapshots after.
#[derive(Debug, Default, Clone)]
pub struct PassHistory {
    pub data: Vec<Vec<Vec<f64>>>,
    pub solution: Vec<Vec<Vec<f64>>>,
}

/// A `write VAR to SYMBOL.SHEET` registration.
#[derive(Debug, Clone)]
pub struct WriteSpec {
    pub var: String,
    pub file: String,
    pub sheet: String,
}

/// The reports produced by a run: one sheet-set per simulation pass plus
/// one per declared output file.
#[derive(Debug, Default)]
pub struct RunOutput {
    pub reports: Vec<(String, SheetSet)>,
    pub write_files: Vec<(String, SheetSet)>,
}

pub struct Model {
    pub config: RunConfig,
    pub sets: SetCatalog,
    pub data: DataVars,
    pub solution: SolVars,
    pub asserts: AssertManager,
    pub formulas: FormulaManager,
    pub updates: FormulaManager,
    pub equations: EquationManager,
    tables: TableStore,
    pub(crate) writes: Vec<WriteSpec>,
    pub(crate) output_files: Vec<String>,
    pub(crate) data_values: Vec<f64>,
    pub(crate) solution_values: Vec<f64>,
    pub(crate) history: PassHistory,
    pub(crate) base_history: Option<PassHistory>,
    temp_sets: usize,
}

impl Model {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            sets: SetCatalog::new(),
            data: DataVars::new(),
            solution: SolVars::new(),
            asserts: AssertManager::new(),
            formulas: FormulaManager::new(),
            updates: FormulaManager::new(),
            equations: EquationManager::new(),
            tables: TableStore::new(),
            writes: Vec::new(),
            output_files: Vec::new(),
            data_values: Vec::new(),
            solution_values: Vec::new(),
            history: PassHistory::default(),
            base_history: None,
            temp_sets: 0,
        }
    }

    /// The table store, e.g. for seeding input tables without touching
    /// disk.
    pub fn tables_mut(&mut self) -> &mut TableStore {
        &mut self.tables
    }

    pub fn data_values(&self) -> &[f64] {
        &self.data_values
    }

    pub fn solution_values(&self) -> &[f64] {
        &self.solution_values
    }

    pub fn base_history(&self) -> Option<&PassHistory> {
        self.base_history.as_ref()
    }

    pub fn policy_history(&self) -> &PassHistory {
        &self.history
    }

    /* ───────────────────────── model loading ──────────────────────── */

    pub fn load_model_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ModelError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            ModelError::io(format!("the file `{}` was not found: {e}", path.display()))
        })?;
        self.load_model_source(&source, &path.display().to_string())
    }

    /// Split, parse and dispatch every statement of a model source.
    pub fn load_model_source(&mut self, source: &str, origin: &str) -> Result<(), ModelError> {
        for raw in split_statements(source, origin)? {
            let parsed = parse_statement(&raw)?;
            self.dispatch(parsed, raw.line)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, statement: ParsedStatement, line: u32) -> Result<(), ModelError> {
        match statement {
            ParsedStatement::File { symbol, new } => {
                if new {
                    self.output_files.push(symbol);
                } else if !self.tables.contains_file(&symbol) {
                    let path = self.config.files.get(&symbol).ok_or_else(|| {
                        ModelError::io(format!(
                            "no path configured for file symbol `{symbol}`"
                        ))
                        .with_line(line)
                    })?;
                    self.tables
                        .load_json_file(&symbol, path)
                        .map_err(|e| ModelError::from(e).with_line(line))?;
                }
                Ok(())
            }

            ParsedStatement::DataVar {
                name,
                sets,
                table,
                fixed,
            } => {
                if self.solution.table.contains(&name) {
                    return Err(ModelError::consistency(format!(
                        "data variable `{name}` is already defined in solution variables"
                    ))
                    .with_line(line));
                }
                self.data
                    .add_var(&self.sets, &name, &sets, table, fixed)
                    .map_err(|e| e.with_line(line))
            }

            ParsedStatement::SolVar {
                name,
                sets,
                change,
                linear,
            } => {
                if self.data.table.contains(&name) {
                    return Err(ModelError::consistency(format!(
                        "solution variable `{name}` is already defined in data variables"
                    ))
                    .with_line(line));
                }
                self.solution
                    .add_var(&self.sets, &name, &sets, change, linear)
                    .map_err(|e| e.with_line(line))
            }

            ParsedStatement::SetDecl { name, expr } => {
                self.declare_set(&name, expr).map_err(|e| e.with_line(line))
            }

            ParsedStatement::Subset { child, parent } => self
                .sets
                .subset_of(&child, &parent)
                .map_err(|e| e.with_line(line)),

            ParsedStatement::Assert {
                name,
                indices,
                sets,
                condition,
            } => self.asserts.add(&name, &condition, sets, indices, line),

            ParsedStatement::Formula {
                name,
                indices,
                sets,
                lhs,
                rhs,
                initial,
            } => self
                .formulas
                .add(&name, &lhs, &rhs, sets, indices, line, initial),

            ParsedStatement::Update {
                name,
                indices,
                sets,
                lhs,
                rhs,
            } => self.updates.add(&name, &lhs, &rhs, sets, indices, line, false),

            ParsedStatement::Equation {
                name,
                indices,
                sets,
                lhs,
                rhs,
            } => self
                .equations
                .add(&self.sets, &name, &lhs, &rhs, sets, indices, line),

            ParsedStatement::LoopFormulas {
                name,
                iterations,
                formulas,
            } => {
                for formula in &formulas {
                    if !self.formulas.contains(formula) {
                        return Err(ModelError::parse(format!(
                            "formula `{formula}` named in `{name}` is not an already \
                             defined formula"
                        ))
                        .with_line(line));
                    }
                }
                self.formulas.add_loop(iterations, &formulas);
                Ok(())
            }

            ParsedStatement::Write { var, file, sheet } => {
                self.writes.push(WriteSpec { var, file, sheet });
                Ok(())
            }
        }
    }

    fn declare_set(&mut self, name: &str, expr: SetExpr) -> Result<(), ModelError> {
        match expr {
            SetExpr::Explicit(elements) => self.sets.new_set(name, elements),
            SetExpr::Union(operands) => {
                // Inline element lists become temporary sets for the
                // union, deleted again afterwards.
                let mut names = Vec::with_capacity(operands.len());
                let mut temporaries = Vec::new();
                for operand in operands {
                    match operand {
                        SetOperand::Named(set) => names.push(set),
                        SetOperand::Explicit(elements) => {
                            let temp = format!("tempset{}", self.temp_sets);
                            self.temp_sets += 1;
                            self.sets.new_set(&temp, elements)?;
                            names.push(temp.clone());
                            temporaries.push(temp);
                        }
                    }
                }
                self.sets.union(&names, name)?;
                for temp in temporaries {
                    self.sets.delete(&temp)?;
                }
                Ok(())
            }
            SetExpr::Difference(superset, subset) => {
                self.sets.difference(&superset, &subset, name)
            }
            SetExpr::Cross(left, right) => self.sets.cross(&left, &right, name),
            SetExpr::FromTable { file, sheet } => {
                let table = self.tables.table(&file, &sheet)?;
                let elements = table.first_labels();
                self.sets.new_set(name, elements)
            }
        }
    }

    /* ────────────────────────── the solve loop ────────────────────── */

    /// Fill the data vector from the loaded tables.
    pub fn read_data(&mut self) -> Result<(), ModelError> {
        self.data_values = self.data.read_values(&self.sets, &self.tables)?;
        Ok(())
    }

    fn check_assertions(&self) -> Result<(), ModelError> {
        let evaluator = Evaluator::over_data(&self.sets, &self.data, &self.data_values);
        self.asserts.check_all(&evaluator)?;
        Ok(())
    }

    /// Read the per-step closure files named in the configuration.
    pub fn read_closures(&self) -> Result<(Vec<Closure>, Vec<Closure>), ModelError> {
        let read_all = |paths: &[std::path::PathBuf]| -> Result<Vec<Closure>, ModelError> {
            paths
                .iter()
                .map(|path| {
                    let text = std::fs::read_to_string(path).map_err(|e| {
                        ModelError::io(format!(
                            "could not read closure file `{}`: {e}",
                            path.display()
                        ))
                    })?;
                    crate::closure::read_closure(
                        &text,
                        &path.display().to_string(),
                        &self.sets,
                        &self.solution,
                    )
                })
                .collect()
        };
        Ok((read_all(&self.config.basefiles)?, read_all(&self.config.polfiles)?))
    }

    /// The full lifecycle: read data, differentiate, read closures, run
    /// both passes, report.
    pub fn run(&mut self) -> Result<RunOutput, ModelError> {
        self.config.validate()?;
        self.read_data()?;

        info!(
            equations = self.equations.rows(),
            solution_variables = self.solution.table.len(),
            "model loaded"
        );

        if !self.config.solve {
            self.formulas.evaluate_all_formulas(
                &self.sets,
                &self.data,
                &mut self.data_values,
                true,
            )?;
            self.check_assertions()?;
            return Reporter::new(self).nosim();
        }

        info!("taking differentials");
        let differ = Differ {
            catalog: &self.sets,
            data: &self.data,
            solution: &self.solution,
            data_values: &self.data_values,
        };
        self.equations.diff_all(&differ)?;

        let (base_closures, policy_closures) = self.read_closures()?;
        self.run_passes(&base_closures, &policy_closures)?;
        Reporter::new(self).report()
    }

    /// Run the base and policy passes against already-read closures.
    pub fn run_passes(
        &mut self,
        base_closures: &[Closure],
        policy_closures: &[Closure],
    ) -> Result<(), ModelError> {
        self.history = PassHistory::default();
        self.base_history = None;
        self.solution_values = vec![0.0; self.solution.table.len()];

        for pass in [Pass::Base, Pass::Policy] {
            let closures = match pass {
                Pass::Base => base_closures,
                Pass::Policy => policy_closures,
            };
            for step in 0..self.config.steps {
                info!(pass = pass.label(), step, "starting step");
                for substep in 0..self.config.substeps {
                    self.substep(pass, step, substep, &closures[step])?;
                }
            }
            if pass == Pass::Base {
                self.base_history = Some(mem::take(&mut self.history));
                self.solution_values = vec![0.0; self.solution.table.len()];
                self.read_data()?;
            }
        }
        Ok(())
    }

    fn substep(
        &mut self,
        pass: Pass,
        step: usize,
        substep: usize,
        closure: &Closure,
    ) -> Result<(), ModelError> {
        // 1. Formulas, then assertions. `initial` formulas only at the
        //    first substep of each step.
        self.formulas.evaluate_all_formulas(
            &self.sets,
            &self.data,
            &mut self.data_values,
            substep == 0,
        )?;
        self.check_assertions()?;

        // 2. Snapshot the pre-solve data vector.
        if self.history.data.len() == step {
            self.history.data.push(Vec::new());
        }
        self.history.data[step].push(self.data_values.clone());

        // 3. Evaluate the pre-differentiated coefficient fragments at the
        //    current data and accumulate sparse entries.
        let eqn_rows = self.equations.rows();
        let unknowns = self.solution.table.len();
        let mut triplets = Triplets::new(eqn_rows + closure.len(), unknowns);
        {
            let evaluator = Evaluator::over_data(&self.sets, &self.data, &self.data_values);
            for (row, contributions) in self.equations.derivatives().iter().enumerate() {
                for contribution in contributions {
                    let Some(col) = contribution.target else {
                        continue;
                    };
                    let mut value = 0.0;
                    for twig in &contribution.twigs {
                        value += evaluator.eval(
                            &twig.node,
                            &twig.sets,
                            &twig.indices,
                            std::slice::from_ref(&twig.tuple),
                        )?[0];
                    }
                    triplets.push(row, col, value);
                }
            }
        }

        // 4. Closure rows: identity entries after the equation rows, with
        //    the shock spread across substeps. The policy pass swaps in
        //    the archived base value for each exogenous offset.
        let substeps = self.config.substeps as f64;
        let mut b = vec![0.0f64; eqn_rows + closure.len()];
        for (k, (offset, entry)) in closure.entries().iter().enumerate() {
            triplets.push(eqn_rows + k, *offset, 1.0);
            let base_value = match pass {
                Pass::Base => 0.0,
                Pass::Policy => {
                    let archived = self.base_history.as_ref().ok_or_else(|| {
                        ModelError::internal("policy pass started without a base archive")
                    })?;
                    archived.solution[step][substep][*offset]
                }
            };
            b[eqn_rows + k] = if entry.is_change {
                base_value + entry.shock / substeps
            } else {
                ((1.0 + base_value / 100.0) * (1.0 + entry.shock / 100.0).powf(1.0 / substeps))
                    * 100.0
                    - 100.0
            };
        }

        // 5. Solve, with empty row/column diagnostics up front.
        let matrix = CsrMatrix::from_triplets(&triplets);
        let mut row_labels: Vec<String> = self.equations.row_labels().to_vec();
        for (offset, _) in closure.entries() {
            row_labels.push(self.solution.table.fullnames()[*offset].clone());
        }
        for row in matrix.empty_rows() {
            warn!("equation row {} has no non-zero derivatives", row_labels[row]);
        }
        for col in matrix.empty_cols() {
            warn!(
                "solution variable {} appears in no equation",
                self.solution.table.fullnames()[col]
            );
        }

        let x = solve(
            &matrix,
            &b,
            &row_labels,
            SolveOptions {
                iterative: self.config.doiterative,
                condense: self.config.docondense,
            },
        )?;

        // 6. Residual.
        let residual = residual_norm(&matrix, &x, &b);
        info!(
            pass = pass.label(),
            step,
            substep,
            residual,
            "substep solved"
        );

        // 7. Archive the solution.
        self.solution_values = x;
        if self.history.solution.len() == step {
            self.history.solution.push(Vec::new());
        }
        self.history.solution[step].push(self.solution_values.clone());

        // 8. Updates rewrite the data vector for the next substep, then
        //    assertions run against the updated data.
        self.updates.evaluate_all_updates(
            &self.sets,
            &self.data,
            &mut self.data_values,
            &self.solution,
            &self.solution_values,
        )?;
        self.check_assertions()
    }
}
