//! Symbolic differentiation of expression trees against the solution
//! catalog.
//!
//! Differentiating a node at a set of evaluation sites produces a list of
//! [`Contribution`]s: for each solution-variable offset touched, a list of
//! twigs — `(sets, indices, tuple, fragment)` — whose fragments evaluate to
//! the coefficient of that offset at that site. Constant sub-results travel
//! as contributions with no target so parents can multiply them in; they
//! are dropped at the top level.
//!
//! The product and quotient rules are deliberately not implemented: a
//! multiplicative node may contain at most one branch with solution
//! variables, and divisor branches may contain none. Violations abort,
//! named by statement and line, and the modeller pre-shapes the equation.

use equilibra_common::ModelError;
use equilibra_parse::{ExprKind, ExprNode, Factor, Sign, VarRef, merge_bindings};

use crate::eval::{Evaluator, resolve_offsets};
use crate::sets::SetCatalog;
use crate::vars::{DataVars, SolVars};

/// One piece of a differential: a fragment tree plus the ambient bindings
/// and concrete tuple it must be evaluated under.
#[derive(Debug, Clone)]
pub struct Twig {
    pub sets: Vec<String>,
    pub indices: Vec<String>,
    pub tuple: Vec<usize>,
    pub node: ExprNode,
}

/// All twigs contributed towards one solution offset (or towards a
/// constant, when `target` is `None`).
#[derive(Debug, Clone)]
pub struct Contribution {
    pub target: Option<usize>,
    pub twigs: Vec<Twig>,
}

pub struct Differ<'a> {
    pub catalog: &'a SetCatalog,
    pub data: &'a DataVars,
    pub solution: &'a SolVars,
    pub data_values: &'a [f64],
}

impl Differ<'_> {
    /// Differentiate `node` at the given sites, returning one merged
    /// contribution list. Constant-only contributions are dropped here —
    /// they are not partials with respect to any solution variable.
    pub fn differentiate(
        &self,
        node: &ExprNode,
        sets: &[String],
        indices: &[String],
        tuples: &[Vec<usize>],
    ) -> Result<Vec<Contribution>, ModelError> {
        let mut contributions = self.diff_node(node, sets, indices, tuples)?;
        contributions.retain(|c| c.target.is_some());
        Ok(contributions)
    }

    fn diff_node(
        &self,
        node: &ExprNode,
        sets: &[String],
        indices: &[String],
        tuples: &[Vec<usize>],
    ) -> Result<Vec<Contribution>, ModelError> {
        let contributions = match &node.kind {
            ExprKind::Additive { signs, branches } => {
                let mut out = Vec::new();
                for (sign, branch) in signs.iter().zip(branches) {
                    let mut contribs = self.diff_node(branch, sets, indices, tuples)?;
                    if *sign == Sign::Minus {
                        for contribution in &mut contribs {
                            for twig in &mut contribution.twigs {
                                let zero = ExprNode::zero(
                                    twig.sets.clone(),
                                    twig.indices.clone(),
                                    node.origin.clone(),
                                );
                                let old = twig.node.clone();
                                twig.node = zero.minus(old)?;
                            }
                        }
                    }
                    out.extend(contribs);
                }
                out
            }

            ExprKind::Multiplicative { ops, branches } => {
                self.diff_multiplicative(node, ops, branches, sets, indices, tuples)?
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

                let mut out = Vec::new();
                for tuple in tuples {
                    for element in 0..set_len {
                        let mut extended = tuple.clone();
                        extended.push(element);
                        out.extend(self.diff_node(
                            body,
                            &inner_sets,
                            &inner_indices,
                            &[extended],
                        )?);
                    }
                }
                out
            }

            ExprKind::Conditional { lhs, op, rhs, body } => {
                let evaluator =
                    Evaluator::over_data(self.catalog, self.data, self.data_values);
                let guard =
                    evaluator.eval_predicate(lhs, *op, rhs, sets, indices, tuples, None)?;

                let mut out = Vec::new();
                for (holds, tuple) in guard.iter().zip(tuples) {
                    if *holds {
                        out.extend(self.diff_node(
                            body,
                            sets,
                            indices,
                            &[tuple.clone()],
                        )?);
                    } else {
                        out.push(Contribution {
                            target: None,
                            twigs: vec![Twig {
                                sets: sets.to_vec(),
                                indices: indices.to_vec(),
                                tuple: tuple.clone(),
                                node: ExprNode::zero(
                                    sets.to_vec(),
                                    indices.to_vec(),
                                    node.origin.clone(),
                                ),
                            }],
                        });
                    }
                }
                out
            }

            ExprKind::Number(value) => tuples
                .iter()
                .map(|tuple| Contribution {
                    target: None,
                    twigs: vec![Twig {
                        sets: sets.to_vec(),
                        indices: indices.to_vec(),
                        tuple: tuple.clone(),
                        node: ExprNode::number(
                            *value,
                            sets.to_vec(),
                            indices.to_vec(),
                            node.origin.clone(),
                        ),
                    }],
                })
                .collect(),

            ExprKind::Var(vref) => self.diff_var(node, vref, sets, indices, tuples)?,

            // Logs are only taken of data, so a log-e subtree is a constant
            // for differentiation purposes.
            ExprKind::LogE(_) => constant_contributions(node, sets, indices, tuples),

            ExprKind::Power { .. } => {
                if self.contains_solution_var(node) {
                    return Err(ModelError::differentiation(format!(
                        "cannot differentiate a power involving a solution variable in \
                         `{node}`; pre-linearise the equation"
                    ))
                    .at(&node.origin.statement, node.origin.line));
                }
                constant_contributions(node, sets, indices, tuples)
            }

            ExprKind::Compare { .. } => {
                return Err(ModelError::differentiation(format!(
                    "comparison encountered while differentiating `{node}`"
                ))
                .at(&node.origin.statement, node.origin.line));
            }
        };

        merge_contributions(contributions)
    }

    fn diff_var(
        &self,
        node: &ExprNode,
        vref: &VarRef,
        sets: &[String],
        indices: &[String],
        tuples: &[Vec<usize>],
    ) -> Result<Vec<Contribution>, ModelError> {
        if self.solution.table.contains(&vref.name) {
            // The tuple recorded on each twig is the node's ambient tuple;
            // the argument permutation lives in the resolved offset.
            let offsets = resolve_offsets(
                self.catalog,
                &self.solution.table,
                node,
                vref,
                sets,
                indices,
                tuples,
            )?;
            Ok(offsets
                .into_iter()
                .zip(tuples)
                .map(|(offset, tuple)| Contribution {
                    target: Some(offset),
                    twigs: vec![Twig {
                        sets: sets.to_vec(),
                        indices: indices.to_vec(),
                        tuple: tuple.clone(),
                        node: ExprNode::one(
                            sets.to_vec(),
                            indices.to_vec(),
                            node.origin.clone(),
                        ),
                    }],
                })
                .collect())
        } else if self.data.table.contains(&vref.name) {
            // Data references are coefficients: carry the reference itself
            // so literal element arguments survive intact.
            Ok(constant_contributions(node, sets, indices, tuples))
        } else {
            Err(ModelError::consistency(format!(
                "cannot find `{}` as either a solution nor a data variable",
                vref.name
            ))
            .at(&node.origin.statement, node.origin.line))
        }
    }

    fn diff_multiplicative(
        &self,
        node: &ExprNode,
        ops: &[Factor],
        branches: &[ExprNode],
        sets: &[String],
        indices: &[String],
        tuples: &[Vec<usize>],
    ) -> Result<Vec<Contribution>, ModelError> {
        // Break every branch differential into single-twig units, then take
        // the cartesian product across branches: each product term then has
        // exactly one (sets, indices, tuple) twig per branch.
        let mut branch_units: Vec<Vec<(Option<usize>, Twig)>> = Vec::with_capacity(ops.len());
        for branch in branches {
            let contribs = self.diff_node(branch, sets, indices, tuples)?;
            let mut units = Vec::new();
            for contribution in contribs {
                for twig in contribution.twigs {
                    units.push((contribution.target, twig));
                }
            }
            branch_units.push(units);
        }

        // A branch with no contributions (a sum over an empty set) zeroes
        // the whole product.
        if branch_units.iter().any(Vec::is_empty) {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut odometer = vec![0usize; branch_units.len()];
        'product: loop {
            let mut product = ExprNode::one(
                node.sets.clone(),
                node.indices.clone(),
                node.origin.clone(),
            );
            let mut target: Option<usize> = None;
            let mut solution_count = 0usize;
            let mut final_sets: Vec<String> = Vec::new();
            let mut final_indices: Vec<String> = Vec::new();
            let mut final_tuple: Vec<usize> = Vec::new();

            for (branch_idx, &unit_idx) in odometer.iter().enumerate() {
                let (unit_target, twig) = &branch_units[branch_idx][unit_idx];

                match ops[branch_idx] {
                    Factor::Mul => {
                        product = product.times(twig.node.clone())?;
                    }
                    Factor::Div => {
                        if unit_target.is_some() {
                            return Err(ModelError::differentiation(format!(
                                "quotient rule encountered while differentiating `{node}`"
                            ))
                            .at(&node.origin.statement, node.origin.line));
                        }
                        product = product.divide(twig.node.clone())?;
                    }
                }

                if unit_target.is_some() {
                    solution_count += 1;
                    if solution_count > 1 {
                        return Err(ModelError::differentiation(format!(
                            "product rule encountered while differentiating `{node}`"
                        ))
                        .at(&node.origin.statement, node.origin.line));
                    }
                    target = *unit_target;
                }

                // Track the supremum bindings and the widest tuple seen.
                let (merged_indices, merged_sets) = merge_bindings(
                    &final_indices,
                    &final_sets,
                    &twig.indices,
                    &twig.sets,
                )
                .map_err(|e| e.at(&node.origin.statement, node.origin.line))?;
                if merged_indices != final_indices {
                    final_indices = merged_indices;
                    final_sets = merged_sets;
                    if twig.tuple.len() > final_tuple.len() {
                        final_tuple = twig.tuple.clone();
                    }
                }
            }

            out.push(Contribution {
                target,
                twigs: vec![Twig {
                    sets: final_sets,
                    indices: final_indices,
                    tuple: final_tuple,
                    node: product,
                }],
            });

            // Advance the odometer, rightmost fastest.
            for pos in (0..odometer.len()).rev() {
                odometer[pos] += 1;
                if odometer[pos] < branch_units[pos].len() {
                    continue 'product;
                }
                odometer[pos] = 0;
            }
            break;
        }
        Ok(out)
    }

    /// True if any variable reference below `node` names a solution
    /// variable.
    fn contains_solution_var(&self, node: &ExprNode) -> bool {
        match &node.kind {
            ExprKind::Number(_) => false,
            ExprKind::Var(vref) => self.solution.table.contains(&vref.name),
            ExprKind::Additive { branches, .. }
            | ExprKind::Multiplicative { branches, .. } => {
                branches.iter().any(|b| self.contains_solution_var(b))
            }
            ExprKind::Power { base, exponent } => {
                self.contains_solution_var(base) || self.contains_solution_var(exponent)
            }
            ExprKind::SumOver { body, .. } | ExprKind::LogE(body) => {
                self.contains_solution_var(body)
            }
            ExprKind::Conditional { lhs, rhs, body, .. } => {
                self.contains_solution_var(lhs)
                    || self.contains_solution_var(rhs)
                    || self.contains_solution_var(body)
            }
            ExprKind::Compare { lhs, rhs, .. } => {
                self.contains_solution_var(lhs) || self.contains_solution_var(rhs)
            }
        }
    }
}

fn constant_contributions(
    node: &ExprNode,
    sets: &[String],
    indices: &[String],
    tuples: &[Vec<usize>],
) -> Vec<Contribution> {
    tuples
        .iter()
        .map(|tuple| Contribution {
            target: None,
            twigs: vec![Twig {
                sets: sets.to_vec(),
                indices: indices.to_vec(),
                tuple: tuple.clone(),
                node: node.clone(),
            }],
        })
        .collect()
}

/// Merge contributions by target, and twigs by `(sets, indices, tuple)`,
/// adding coincident fragments with the tree's own `+`.
fn merge_contributions(
    contributions: Vec<Contribution>,
) -> Result<Vec<Contribution>, ModelError> {
    let mut merged: Vec<Contribution> = Vec::new();
    for contribution in contributions {
        match merged
            .iter_mut()
            .find(|c| c.target == contribution.target)
        {
            Some(existing) => {
                for twig in contribution.twigs {
                    match existing.twigs.iter_mut().find(|t| {
                        t.sets == twig.sets && t.indices == twig.indices && t.tuple == twig.tuple
                    }) {
                        Some(slot) => {
                            let old = slot.node.clone();
                            slot.node = old.plus(twig.node)?;
                        }
                        None => existing.twigs.push(twig),
                    }
                }
            }
            None => merged.push(contribution),
        }
    }
    Ok(merged)
}
