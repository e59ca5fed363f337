//! Broadcast evaluation of expression trees.
//!
//! The caller passes the ambient `(indices, sets)` bindings and a list of
//! index tuples, one per evaluation site; every node returns a vector of
//! the same length. Variable references are late-bound by name against the
//! data catalog first and the solution catalog second — either solution
//! side may be absent (coefficient evaluation and plain formula passes
//! never see one).
//!
//! A conditional builds a boolean mask from its guard and evaluates the
//! body only where the mask holds, filling elsewhere; masks compose with
//! any enclosing mask by logical AND.

use equilibra_common::ModelError;
use equilibra_parse::{Arg, CmpOp, ExprKind, ExprNode, Factor, Sign, VarRef};

use crate::sets::SetCatalog;
use crate::vars::{DataVars, SolVars};

/// Which catalog a variable reference resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarTarget {
    Data,
    Solution,
}

pub struct Evaluator<'a> {
    pub catalog: &'a SetCatalog,
    pub data: &'a DataVars,
    pub data_values: &'a [f64],
    pub solution: Option<&'a SolVars>,
    pub solution_values: Option<&'a [f64]>,
}

impl<'a> Evaluator<'a> {
    /// An evaluator over data values only.
    pub fn over_data(
        catalog: &'a SetCatalog,
        data: &'a DataVars,
        data_values: &'a [f64],
    ) -> Self {
        Self {
            catalog,
            data,
            data_values,
            solution: None,
            solution_values: None,
        }
    }

    /// An evaluator that can also read the solution vector (updates).
    pub fn with_solution(
        catalog: &'a SetCatalog,
        data: &'a DataVars,
        data_values: &'a [f64],
        solution: &'a SolVars,
        solution_values: &'a [f64],
    ) -> Self {
        Self {
            catalog,
            data,
            data_values,
            solution: Some(solution),
            solution_values: Some(solution_values),
        }
    }

    /// Evaluate `node` at every site.
    pub fn eval(
        &self,
        node: &ExprNode,
        sets: &[String],
        indices: &[String],
        tuples: &[Vec<usize>],
    ) -> Result<Vec<f64>, ModelError> {
        self.eval_masked(node, sets, indices, tuples, None, 0.0)
    }

    /// Evaluate a comparison guard at every site. Masked-out sites are
    /// false.
    pub fn eval_predicate(
        &self,
        lhs: &ExprNode,
        op: CmpOp,
        rhs: &ExprNode,
        sets: &[String],
        indices: &[String],
        tuples: &[Vec<usize>],
        mask: Option<&[bool]>,
    ) -> Result<Vec<bool>, ModelError> {
        let left = self.eval_masked(lhs, sets, indices, tuples, mask, 0.0)?;
        let right = self.eval_masked(rhs, sets, indices, tuples, mask, 0.0)?;
        Ok((0..tuples.len())
            .map(|i| active(mask, i) && op.holds(left[i], right[i]))
            .collect())
    }

    fn eval_masked(
        &self,
        node: &ExprNode,
        sets: &[String],
        indices: &[String],
        tuples: &[Vec<usize>],
        mask: Option<&[bool]>,
        fill: f64,
    ) -> Result<Vec<f64>, ModelError> {
        match &node.kind {
            ExprKind::Number(value) => Ok((0..tuples.len())
                .map(|i| if active(mask, i) { *value } else { fill })
                .collect()),

            ExprKind::Var(vref) => self.eval_var(node, vref, sets, indices, tuples, mask, fill),

            ExprKind::Additive { signs, branches } => {
                let mut acc = vec![0.0f64; tuples.len()];
                for (sign, branch) in signs.iter().zip(branches) {
                    let vals = self.eval_masked(branch, sets, indices, tuples, mask, 0.0)?;
                    for i in 0..tuples.len() {
                        if active(mask, i) {
                            match sign {
                                Sign::Plus => acc[i] += vals[i],
                                Sign::Minus => acc[i] -= vals[i],
                            }
                        }
                    }
                }
                fill_inactive(&mut acc, mask, fill);
                Ok(acc)
            }

            ExprKind::Multiplicative { ops, branches } => {
                let mut acc = vec![1.0f64; tuples.len()];
                for (op, branch) in ops.iter().zip(branches) {
                    let vals = self.eval_masked(branch, sets, indices, tuples, mask, 1.0)?;
                    for i in 0..tuples.len() {
                        if active(mask, i) {
                            match op {
                                Factor::Mul => acc[i] *= vals[i],
                                Factor::Div => {
                                    if vals[i] == 0.0 {
                                        return Err(ModelError::eval(format!(
                                            "division by zero in `{branch}`"
                                        ))
                                        .at(&node.origin.statement, node.origin.line));
                                    }
                                    acc[i] /= vals[i];
                                }
                            }
                        }
                    }
                }
                fill_inactive(&mut acc, mask, fill);
                Ok(acc)
            }

            ExprKind::Power { base, exponent } => {
                let bases = self.eval_masked(base, sets, indices, tuples, mask, 1.0)?;
                let exponents = self.eval_masked(exponent, sets, indices, tuples, mask, 1.0)?;
                let mut out = vec![fill; tuples.len()];
                for i in 0..tuples.len() {
                    if active(mask, i) {
                        let value = bases[i].powf(exponents[i]);
                        if !value.is_finite() {
                            return Err(ModelError::eval(format!(
                                "power produced a non-finite value ({} ^ {})",
                                bases[i], exponents[i]
                            ))
                            .at(&node.origin.statement, node.origin.line));
                        }
                        out[i] = value;
                    }
                }
                Ok(out)
            }

            ExprKind::SumOver { index, set, body } => {
                let set_len = self
                    .catalog
                    .size(set)
                    .map_err(|e| e.at(&node.origin.statement, node.origin.line))?;

                let mut inner_sets = sets.to_vec();
                let mut inner_indices = indices.to_vec();
                inner_sets.push(set.clone());
                inner_indices.push(index.clone());

                let mut acc = vec![0.0f64; tuples.len()];
                for element in 0..set_len {
                    let extended: Vec<Vec<usize>> = tuples
                        .iter()
                        .map(|tuple| {
                            let mut t = tuple.clone();
                            t.push(element);
                            t
                        })
                        .collect();
                    let vals = self.eval_masked(
                        body,
                        &inner_sets,
                        &inner_indices,
                        &extended,
                        mask,
                        0.0,
                    )?;
                    for i in 0..tuples.len() {
                        if active(mask, i) {
                            acc[i] += vals[i];
                        }
                    }
                }
                fill_inactive(&mut acc, mask, fill);
                Ok(acc)
            }

            ExprKind::Conditional { lhs, op, rhs, body } => {
                let guard =
                    self.eval_predicate(lhs, *op, rhs, sets, indices, tuples, mask)?;
                self.eval_masked(body, sets, indices, tuples, Some(&guard), fill)
            }

            ExprKind::LogE(body) => {
                let vals = self.eval_masked(body, sets, indices, tuples, mask, 1.0)?;
                let mut out = vec![fill; tuples.len()];
                for i in 0..tuples.len() {
                    if active(mask, i) {
                        if vals[i] <= 0.0 {
                            return Err(ModelError::eval(format!(
                                "log of a non-positive value ({})",
                                vals[i]
                            ))
                            .at(&node.origin.statement, node.origin.line));
                        }
                        out[i] = vals[i].ln();
                    }
                }
                Ok(out)
            }

            ExprKind::Compare { .. } => Err(ModelError::eval(
                "comparison encountered in a value context",
            )
            .at(&node.origin.statement, node.origin.line)),
        }
    }

    fn eval_var(
        &self,
        node: &ExprNode,
        vref: &VarRef,
        sets: &[String],
        indices: &[String],
        tuples: &[Vec<usize>],
        mask: Option<&[bool]>,
        fill: f64,
    ) -> Result<Vec<f64>, ModelError> {
        let (target, offsets) = self.var_offsets(node, vref, sets, indices, tuples)?;
        let values = match target {
            VarTarget::Data => self.data_values,
            VarTarget::Solution => self.solution_values.ok_or_else(|| {
                ModelError::internal(format!(
                    "no solution values available for variable `{}`",
                    vref.name
                ))
                .at(&node.origin.statement, node.origin.line)
            })?,
        };
        Ok((0..tuples.len())
            .map(|i| if active(mask, i) { values[offsets[i]] } else { fill })
            .collect())
    }

    /// Resolve a variable reference into its target catalog and the offset
    /// per site, permuting the ambient tuple into the variable's declared
    /// argument order and lifting literal elements into fixed positions.
    pub fn var_offsets(
        &self,
        node: &ExprNode,
        vref: &VarRef,
        sets: &[String],
        indices: &[String],
        tuples: &[Vec<usize>],
    ) -> Result<(VarTarget, Vec<usize>), ModelError> {
        let (target, table) = if self.data.table.contains(&vref.name) {
            (VarTarget::Data, &self.data.table)
        } else if let Some(solution) = self
            .solution
            .filter(|s| s.table.contains(&vref.name))
        {
            (VarTarget::Solution, &solution.table)
        } else {
            return Err(ModelError::eval(format!(
                "could not find variable `{}` as either a data nor a solution variable",
                vref.name
            ))
            .at(&node.origin.statement, node.origin.line));
        };
        let offsets = resolve_offsets(
            self.catalog,
            table,
            node,
            vref,
            sets,
            indices,
            tuples,
        )?;
        Ok((target, offsets))
    }
}

/// Shared argument-permutation logic, also used by the differentiator.
pub(crate) fn resolve_offsets(
    catalog: &SetCatalog,
    table: &crate::vars::VarTable,
    node: &ExprNode,
    vref: &VarRef,
    sets: &[String],
    indices: &[String],
    tuples: &[Vec<usize>],
) -> Result<Vec<usize>, ModelError> {
    let declared_sets = table
        .sets_of(&vref.name)
        .map_err(|e| e.at(&node.origin.statement, node.origin.line))?;
    if vref.args.len() != declared_sets.len() {
        return Err(ModelError::consistency(format!(
            "variable `{}` is referenced with {} indices but declared over {} sets",
            vref.name,
            vref.args.len(),
            declared_sets.len()
        ))
        .at(&node.origin.statement, node.origin.line));
    }

    // Per argument: the set to fetch through and how to pick the index
    // element from the ambient tuple.
    enum Pick {
        Ambient(usize),
        Fixed(usize),
    }
    let mut fetch_sets = Vec::with_capacity(vref.args.len());
    let mut picks = Vec::with_capacity(vref.args.len());
    for (dim, arg) in vref.args.iter().enumerate() {
        match arg {
            Arg::Symbol(symbol) => {
                let pos = indices.iter().position(|i| i == symbol).ok_or_else(|| {
                    ModelError::consistency(format!(
                        "index `{symbol}` of variable `{}` is not among the ambient \
                         indices {indices:?}",
                        vref.name
                    ))
                    .at(&node.origin.statement, node.origin.line)
                })?;
                fetch_sets.push(sets[pos].clone());
                picks.push(Pick::Ambient(pos));
            }
            Arg::Literal(element) => {
                let set_name = &declared_sets[dim];
                let set = catalog
                    .get(set_name)
                    .map_err(|e| e.at(&node.origin.statement, node.origin.line))?;
                let pos = set.position(element).ok_or_else(|| {
                    ModelError::consistency(format!(
                        "couldn't get index for element `{element}` in set `{set_name}`"
                    ))
                    .at(&node.origin.statement, node.origin.line)
                })?;
                fetch_sets.push(set_name.clone());
                picks.push(Pick::Fixed(pos));
            }
        }
    }

    let reordered: Vec<Vec<usize>> = tuples
        .iter()
        .map(|tuple| {
            picks
                .iter()
                .map(|pick| match pick {
                    Pick::Ambient(pos) => tuple[*pos],
                    Pick::Fixed(element) => *element,
                })
                .collect()
        })
        .collect();

    table
        .indices(catalog, &vref.name, &fetch_sets, &reordered)
        .map_err(|e| e.at(&node.origin.statement, node.origin.line))
}

fn active(mask: Option<&[bool]>, i: usize) -> bool {
    mask.map_or(true, |m| m[i])
}

fn fill_inactive(values: &mut [f64], mask: Option<&[bool]>, fill: f64) {
    if let Some(mask) = mask {
        for (value, &keep) in values.iter_mut().zip(mask) {
            if !keep {
                *value = fill;
            }
        }
    }
}
