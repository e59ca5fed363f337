//! Report assembly.
//!
//! Substep solutions are aggregated into one per-step delta per solution
//! variable — *change* variables compose by addition, *percent-change*
//! variables multiplicatively through `(1+x/100)` factors — while data
//! variables report their per-step snapshot. Output is either long format
//! (`svars`/`dvars` sheets with one `S{n}` column per step) or wide format
//! (one sheet per variable, columns = its sets plus the step values).
//! `write` statements additionally emit named tables into the declared
//! output files.

use tracing::warn;

use equilibra_common::{ModelError, Row, Table};
use equilibra_tables::SheetSet;

use crate::driver::{Model, PassHistory, RunOutput};

pub struct Reporter<'a> {
    model: &'a Model,
}

impl<'a> Reporter<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self { model }
    }

    /// Reports for a solved run: one sheet-set per pass, plus the
    /// `write`-statement files.
    pub fn report(&self) -> Result<RunOutput, ModelError> {
        let base = self.model.base_history.as_ref().ok_or_else(|| {
            ModelError::internal("reporting a solved run without a base archive")
        })?;

        let (svar_offsets, dvar_offsets) = self.filtered_offsets();
        let mut output = RunOutput::default();
        for (name, history) in [("base", base), ("policy", &self.model.history)] {
            let sheets = if self.model.config.longformat {
                self.long_sheets(history, &svar_offsets, &dvar_offsets)?
            } else {
                self.wide_sheets(history, &svar_offsets, &dvar_offsets)?
            };
            output.reports.push((name.to_string(), sheets));
        }
        output.write_files = self.write_outputs()?;
        Ok(output)
    }

    /// Report for a formulas-and-assertions-only run: the data vector as a
    /// single step.
    pub fn nosim(&self) -> Result<RunOutput, ModelError> {
        let (_, dvar_offsets) = self.filtered_offsets();
        let mut sheets = SheetSet::new();
        if self.model.config.longformat {
            let mut table = Table::new(vec!["DVAR", "S0"]);
            for &offset in &dvar_offsets {
                table.push(Row::new(
                    vec![self.model.data.table.fullnames()[offset].clone()],
                    vec![self.model.data_values[offset]],
                ));
            }
            sheets.insert("dvars", table);
        } else {
            for name in self.report_names(&self.model.data.table, &dvar_offsets) {
                let table = self.wide_table(
                    &self.model.data.table,
                    &name,
                    &["Value".to_string()],
                    &|offset| vec![self.model.data_values[offset]],
                )?;
                sheets.insert(name, table);
            }
        }

        let mut output = RunOutput::default();
        output.reports.push(("nosim".to_string(), sheets));
        output.write_files = self.write_outputs()?;
        Ok(output)
    }

    /* ───────────────────────── aggregation ────────────────────────── */

    /// Offsets to report, honouring the reporting-variables whitelist.
    /// Names in the whitelist that match neither catalog warn and are
    /// dropped.
    fn filtered_offsets(&self) -> (Vec<usize>, Vec<usize>) {
        let solution = &self.model.solution.table;
        let data = &self.model.data.table;
        match &self.model.config.reportingvars {
            Some(wanted) => {
                for name in wanted {
                    if !solution.contains(name) && !data.contains(name) {
                        warn!(
                            "`{name}` is listed in the reporting variables but is \
                             neither a data nor a solution variable"
                        );
                    }
                }
                let filter = |by_column: &[Vec<String>]| {
                    by_column
                        .iter()
                        .enumerate()
                        .filter_map(|(offset, labels)| {
                            wanted.contains(&labels[0]).then_some(offset)
                        })
                        .collect::<Vec<usize>>()
                };
                (
                    filter(solution.fullnames_by_column()),
                    filter(data.fullnames_by_column()),
                )
            }
            None => (
                (0..solution.len()).collect(),
                (0..data.len()).collect(),
            ),
        }
    }

    /// The per-step composed value of one solution offset.
    fn compose_steps(&self, history: &PassHistory, offset: usize) -> Vec<f64> {
        let name = &self.model.solution.table.fullnames_by_column()[offset][0];
        let is_change = self.model.solution.is_change(name);
        history
            .solution
            .iter()
            .map(|substeps| {
                let mut acc = 0.0f64;
                for snapshot in substeps {
                    let value = snapshot[offset];
                    if is_change {
                        acc += value;
                    } else {
                        acc = ((1.0 + acc / 100.0) * (1.0 + value / 100.0)) * 100.0 - 100.0;
                    }
                }
                acc
            })
            .collect()
    }

    /// The per-step reported value of one data offset: the first snapshot
    /// of each step.
    fn data_steps(&self, history: &PassHistory, offset: usize) -> Vec<f64> {
        history
            .data
            .iter()
            .map(|substeps| substeps[0][offset])
            .collect()
    }

    fn step_headers<S: Into<String>>(&self, first: S) -> Vec<String> {
        let mut headers = vec![first.into()];
        for step in 0..self.model.config.steps {
            headers.push(format!("S{step}"));
        }
        headers
    }

    fn long_sheets(
        &self,
        history: &PassHistory,
        svar_offsets: &[usize],
        dvar_offsets: &[usize],
    ) -> Result<SheetSet, ModelError> {
        let mut sheets = SheetSet::new();

        let mut svars = Table::new(self.step_headers("SVAR"));
        for &offset in svar_offsets {
            svars.push(Row::new(
                vec![self.model.solution.table.fullnames()[offset].clone()],
                self.compose_steps(history, offset),
            ));
        }
        sheets.insert("svars", svars);

        let mut dvars = Table::new(self.step_headers("DVAR"));
        for &offset in dvar_offsets {
            dvars.push(Row::new(
                vec![self.model.data.table.fullnames()[offset].clone()],
                self.data_steps(history, offset),
            ));
        }
        sheets.insert("dvars", dvars);
        Ok(sheets)
    }

    fn wide_sheets(
        &self,
        history: &PassHistory,
        svar_offsets: &[usize],
        dvar_offsets: &[usize],
    ) -> Result<SheetSet, ModelError> {
        let mut sheets = SheetSet::new();
        let steps: Vec<String> = (0..self.model.config.steps)
            .map(|step| format!("S{step}"))
            .collect();
        for name in self.report_names(&self.model.solution.table, svar_offsets) {
            let table =
                self.wide_table(&self.model.solution.table, &name, &steps, &|offset| {
                    self.compose_steps(history, offset)
                })?;
            sheets.insert(name, table);
        }
        for name in self.report_names(&self.model.data.table, dvar_offsets) {
            let table = self.wide_table(&self.model.data.table, &name, &steps, &|offset| {
                self.data_steps(history, offset)
            })?;
            sheets.insert(name, table);
        }
        Ok(sheets)
    }

    /// Variable names covered by the filtered offsets, in catalog order.
    fn report_names(
        &self,
        table: &crate::vars::VarTable,
        offsets: &[usize],
    ) -> Vec<String> {
        table
            .names()
            .iter()
            .filter(|name| {
                offsets
                    .iter()
                    .any(|&o| &table.fullnames_by_column()[o][0] == *name)
            })
            .cloned()
            .collect()
    }

    /// One wide-format sheet: columns are the variable's sets followed by
    /// the value columns.
    fn wide_table(
        &self,
        table: &crate::vars::VarTable,
        name: &str,
        value_headers: &[String],
        values_of: &dyn Fn(usize) -> Vec<f64>,
    ) -> Result<Table, ModelError> {
        let mut headers: Vec<String> = table.sets_of(name)?.to_vec();
        headers.extend(value_headers.iter().cloned());
        let mut out = Table::new(headers);
        for (offset, labels) in table.fullnames_by_column().iter().enumerate() {
            if labels[0] != name {
                continue;
            }
            out.push(Row::new(labels[1..].to_vec(), values_of(offset)));
        }
        Ok(out)
    }

    /* ─────────────────────── write statements ─────────────────────── */

    /// Resolve every `write` statement into its declared output file.
    fn write_outputs(&self) -> Result<Vec<(String, SheetSet)>, ModelError> {
        let mut outputs: Vec<(String, SheetSet)> = self
            .model
            .output_files
            .iter()
            .map(|file| (file.clone(), SheetSet::new()))
            .collect();

        for spec in &self.model.writes {
            let table = if self.model.data.table.contains(&spec.var) {
                let mut headers: Vec<String> =
                    self.model.data.table.sets_of(&spec.var)?.to_vec();
                headers.push("Value".to_string());
                let mut out = Table::new(headers);
                for (offset, labels) in self
                    .model
                    .data
                    .table
                    .fullnames_by_column()
                    .iter()
                    .enumerate()
                {
                    if labels[0] == spec.var {
                        out.push(Row::new(
                            labels[1..].to_vec(),
                            vec![self.model.data_values[offset]],
                        ));
                    }
                }
                out
            } else if self.model.sets.contains(&spec.var) {
                let mut out = Table::new(vec![spec.var.clone()]);
                for element in &self.model.sets.get(&spec.var)?.elements {
                    out.push(Row::new(vec![element.clone()], Vec::new()));
                }
                out
            } else {
                return Err(ModelError::consistency(format!(
                    "cannot find variable name `{}` in write statement",
                    spec.var
                )));
            };

            let slot = outputs
                .iter_mut()
                .find(|(file, _)| file == &spec.file)
                .ok_or_else(|| {
                    ModelError::io(format!(
                        "write statement targets `{}` which was not declared with \
                         `file [new]`",
                        spec.file
                    ))
                })?;
            slot.1.insert(spec.sheet.clone(), table);
        }
        Ok(outputs)
    }
}
