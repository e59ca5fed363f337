//! Sparse assembly and the linear solve.
//!
//! The Jacobian is accumulated as `(row, col, value)` triplets, converted
//! to compressed sparse row form, optionally condensed (every row with a
//! single nonzero directly determines one solution entry and can be
//! eliminated before the main solve), and handed to a sparse direct LU.
//! An iterative BiCGSTAB path is available when configured. Solver
//! failures are escalated to errors enriched with duplicate-row
//! diagnostics.

use equilibra_common::ModelError;

/// Triplet accumulation during assembly.
#[derive(Debug, Clone)]
pub struct Triplets {
    pub nrows: usize,
    pub ncols: usize,
    entries: Vec<(usize, usize, f64)>,
}

impl Triplets {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, row: usize, col: usize, value: f64) {
        self.entries.push((row, col, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compressed sparse row form with sorted column indices and summed
/// duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    pub nrows: usize,
    pub ncols: usize,
    pub indptr: Vec<usize>,
    pub indices: Vec<usize>,
    pub data: Vec<f64>,
}

impl CsrMatrix {
    pub fn from_triplets(triplets: &Triplets) -> Self {
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); triplets.nrows];
        for &(row, col, value) in &triplets.entries {
            rows[row].push((col, value));
        }

        let mut indptr = Vec::with_capacity(triplets.nrows + 1);
        let mut indices = Vec::with_capacity(triplets.entries.len());
        let mut data = Vec::with_capacity(triplets.entries.len());
        indptr.push(0);
        for row in &mut rows {
            row.sort_by_key(|&(col, _)| col);
            let mut iter = row.iter().peekable();
            while let Some(&(col, value)) = iter.next() {
                let mut sum = value;
                while let Some(&&(next_col, next_value)) = iter.peek() {
                    if next_col != col {
                        break;
                    }
                    sum += next_value;
                    iter.next();
                }
                indices.push(col);
                data.push(sum);
            }
            indptr.push(indices.len());
        }

        Self {
            nrows: triplets.nrows,
            ncols: triplets.ncols,
            indptr,
            indices,
            data,
        }
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn row(&self, i: usize) -> (&[usize], &[f64]) {
        let span = self.indptr[i]..self.indptr[i + 1];
        (&self.indices[span.clone()], &self.data[span])
    }

    pub fn mul_vec(&self, x: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.nrows];
        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            out[i] = cols.iter().zip(vals).map(|(&c, &v)| v * x[c]).sum();
        }
        out
    }

    /// Rows with no nonzero entry.
    pub fn empty_rows(&self) -> Vec<usize> {
        (0..self.nrows)
            .filter(|&i| self.indptr[i] == self.indptr[i + 1])
            .collect()
    }

    /// Columns with no nonzero entry.
    pub fn empty_cols(&self) -> Vec<usize> {
        let mut seen = vec![false; self.ncols];
        for &col in &self.indices {
            seen[col] = true;
        }
        seen.iter()
            .enumerate()
            .filter_map(|(col, &hit)| (!hit).then_some(col))
            .collect()
    }

    /// Maximum absolute column sum.
    pub fn one_norm(&self) -> f64 {
        let mut sums = vec![0.0f64; self.ncols];
        for (&col, &value) in self.indices.iter().zip(&self.data) {
            sums[col] += value.abs();
        }
        sums.into_iter().fold(0.0, f64::max)
    }
}

/// `‖Ax − b‖₂`.
pub fn residual_norm(a: &CsrMatrix, x: &[f64], b: &[f64]) -> f64 {
    a.mul_vec(x)
        .iter()
        .zip(b)
        .map(|(ax, bi)| (ax - bi) * (ax - bi))
        .sum::<f64>()
        .sqrt()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SolveOptions {
    pub iterative: bool,
    pub condense: bool,
}

/// Solve `Ax = b`. The matrix must be square; otherwise the signed
/// difference is reported as too many / too few exogenous variables.
pub fn solve(
    a: &CsrMatrix,
    b: &[f64],
    row_labels: &[String],
    opts: SolveOptions,
) -> Result<Vec<f64>, ModelError> {
    if a.nrows != a.ncols {
        return Err(if a.nrows > a.ncols {
            ModelError::shape(format!(
                "cannot solve the proposed system - there are {} too many exogenous \
                 variables",
                a.nrows - a.ncols
            ))
        } else {
            ModelError::shape(format!(
                "cannot solve the proposed system - there are {} too few exogenous \
                 variables",
                a.ncols - a.nrows
            ))
        });
    }

    let solved = if opts.condense {
        solve_condensed(a, b, opts.iterative)
    } else {
        solve_core(a, b, opts.iterative)
    };

    solved.map_err(|message| escalate(a, row_labels, &message))
}

fn solve_core(a: &CsrMatrix, b: &[f64], iterative: bool) -> Result<Vec<f64>, String> {
    let x = if iterative {
        bicgstab(a, b, 1e-12, 20 * a.nrows.max(50))?
    } else {
        direct_lu(a, b)?
    };
    if x.iter().any(|v| !v.is_finite()) {
        return Err("the solution contains non-finite entries".to_string());
    }
    Ok(x)
}

/// Eliminate every row with exactly one nonzero, solve the reduced system,
/// and stitch the eliminated entries back.
fn solve_condensed(a: &CsrMatrix, b: &[f64], iterative: bool) -> Result<Vec<f64>, String> {
    let mut determined: Vec<Option<f64>> = vec![None; a.ncols];
    let mut trivial_rows = vec![false; a.nrows];
    for i in 0..a.nrows {
        let (cols, vals) = a.row(i);
        if cols.len() != 1 || determined[cols[0]].is_some() {
            continue;
        }
        trivial_rows[i] = true;
        determined[cols[0]] = Some(b[i] / vals[0]);
    }

    if trivial_rows.iter().all(|&t| !t) {
        return solve_core(a, b, iterative);
    }

    let keep_cols: Vec<usize> = (0..a.ncols).filter(|&c| determined[c].is_none()).collect();
    let mut col_map: Vec<Option<usize>> = vec![None; a.ncols];
    for (new, &old) in keep_cols.iter().enumerate() {
        col_map[old] = Some(new);
    }
    let keep_rows: Vec<usize> = (0..a.nrows).filter(|&r| !trivial_rows[r]).collect();

    let mut reduced = Triplets::new(keep_rows.len(), keep_cols.len());
    let mut reduced_b = Vec::with_capacity(keep_rows.len());
    for (new_row, &row) in keep_rows.iter().enumerate() {
        let (cols, vals) = a.row(row);
        let mut rhs = b[row];
        for (&col, &value) in cols.iter().zip(vals) {
            match (col_map[col], determined[col]) {
                (Some(new_col), _) => reduced.push(new_row, new_col, value),
                (None, Some(known)) => rhs -= value * known,
                (None, None) => {}
            }
        }
        reduced_b.push(rhs);
    }

    let reduced_a = CsrMatrix::from_triplets(&reduced);
    let reduced_x = solve_core(&reduced_a, &reduced_b, iterative)?;

    let mut x = vec![0.0f64; a.ncols];
    for (col, value) in determined.iter().enumerate() {
        if let Some(value) = value {
            x[col] = *value;
        }
    }
    for (new_col, &old_col) in keep_cols.iter().enumerate() {
        x[old_col] = reduced_x[new_col];
    }
    Ok(x)
}

/// Direct sparse LU through faer.
fn direct_lu(a: &CsrMatrix, b: &[f64]) -> Result<Vec<f64>, String> {
    use faer::prelude::*;
    use faer::sparse::SparseColMat;

    let mut triplets = Vec::with_capacity(a.nnz());
    for row in 0..a.nrows {
        let (cols, vals) = a.row(row);
        for (&col, &value) in cols.iter().zip(vals) {
            triplets.push((row, col, value));
        }
    }

    let mat = SparseColMat::<usize, f64>::try_new_from_triplets(a.nrows, a.ncols, &triplets)
        .map_err(|e| format!("building the sparse matrix failed: {e:?}"))?;
    let lu = mat
        .sp_lu()
        .map_err(|e| format!("sparse LU factorisation failed: {e:?}"))?;

    let rhs = faer::Mat::<f64>::from_fn(b.len(), 1, |i, _| b[i]);
    let solved = lu.solve(&rhs);
    Ok((0..a.ncols).map(|i| solved.read(i, 0)).collect())
}

/// Stabilised bi-conjugate gradients on the CSR form.
fn bicgstab(
    a: &CsrMatrix,
    b: &[f64],
    tolerance: f64,
    max_iterations: usize,
) -> Result<Vec<f64>, String> {
    let n = b.len();
    let norm_b = dot(b, b).sqrt();
    if norm_b == 0.0 {
        return Ok(vec![0.0; n]);
    }
    let threshold = tolerance * norm_b;

    let mut x = vec![0.0f64; n];
    let mut r = b.to_vec();
    let r_hat = r.clone();
    let mut rho = 1.0f64;
    let mut alpha = 1.0f64;
    let mut omega = 1.0f64;
    let mut v = vec![0.0f64; n];
    let mut p = vec![0.0f64; n];

    for _ in 0..max_iterations {
        let rho_next = dot(&r_hat, &r);
        if rho_next.abs() < f64::MIN_POSITIVE {
            return Err("iterative solver breakdown (rho vanished)".to_string());
        }
        let beta = (rho_next / rho) * (alpha / omega);
        rho = rho_next;
        for i in 0..n {
            p[i] = r[i] + beta * (p[i] - omega * v[i]);
        }
        v = a.mul_vec(&p);
        let denom = dot(&r_hat, &v);
        if denom.abs() < f64::MIN_POSITIVE {
            return Err("iterative solver breakdown (search direction vanished)".to_string());
        }
        alpha = rho / denom;
        let s: Vec<f64> = (0..n).map(|i| r[i] - alpha * v[i]).collect();
        if dot(&s, &s).sqrt() <= threshold {
            for i in 0..n {
                x[i] += alpha * p[i];
            }
            return Ok(x);
        }
        let t = a.mul_vec(&s);
        let tt = dot(&t, &t);
        if tt.abs() < f64::MIN_POSITIVE {
            return Err("iterative solver breakdown (t vanished)".to_string());
        }
        omega = dot(&t, &s) / tt;
        for i in 0..n {
            x[i] += alpha * p[i] + omega * s[i];
            r[i] = s[i] - omega * t[i];
        }
        if dot(&r, &r).sqrt() <= threshold {
            return Ok(x);
        }
    }
    Err(format!(
        "iterative solver did not converge within {max_iterations} iterations"
    ))
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Escalate a solver failure, enriched with any duplicate rows detected by
/// value tuple.
fn escalate(a: &CsrMatrix, row_labels: &[String], message: &str) -> ModelError {
    let mut text = format!("error inverting. {message}");
    let groups = duplicate_row_groups(a);
    if !groups.is_empty() {
        text.push_str("\nin addition, the following identical rows were detected:\n");
        for group in groups {
            for row in group {
                if let Some(label) = row_labels.get(row) {
                    text.push_str(label);
                } else {
                    text.push_str(&format!("row {row}"));
                }
                text.push(' ');
            }
            text.push('\n');
        }
    }
    ModelError::solver(text)
}

/// Groups of rows whose (column, value) patterns are identical.
fn duplicate_row_groups(a: &CsrMatrix) -> Vec<Vec<usize>> {
    use rustc_hash::FxHashMap;
    let mut seen: FxHashMap<(Vec<usize>, Vec<u64>), Vec<usize>> = FxHashMap::default();
    for row in 0..a.nrows {
        let (cols, vals) = a.row(row);
        let key = (
            cols.to_vec(),
            vals.iter().map(|v| v.to_bits()).collect::<Vec<u64>>(),
        );
        seen.entry(key).or_default().push(row);
    }
    let mut groups: Vec<Vec<usize>> = seen
        .into_values()
        .filter(|rows| rows.len() > 1)
        .collect();
    groups.sort();
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("r{i}")).collect()
    }

    fn small_system() -> (CsrMatrix, Vec<f64>) {
        // [2 1; 1 3] x = [5; 10] -> x = [1; 3]
        let mut t = Triplets::new(2, 2);
        t.push(0, 0, 2.0);
        t.push(0, 1, 1.0);
        t.push(1, 0, 1.0);
        t.push(1, 1, 3.0);
        (CsrMatrix::from_triplets(&t), vec![5.0, 10.0])
    }

    #[test]
    fn csr_conversion_sorts_and_sums_duplicates() {
        let mut t = Triplets::new(2, 3);
        t.push(0, 2, 1.0);
        t.push(0, 0, 4.0);
        t.push(0, 2, 2.5);
        t.push(1, 1, -1.0);
        let a = CsrMatrix::from_triplets(&t);
        assert_eq!(a.indptr, vec![0, 2, 3]);
        assert_eq!(a.indices, vec![0, 2, 1]);
        assert_eq!(a.data, vec![4.0, 3.5, -1.0]);
        assert_eq!(a.nnz(), 3);
    }

    #[test]
    fn direct_solve_and_residual() {
        let (a, b) = small_system();
        let x = solve(&a, &b, &labels(2), SolveOptions::default()).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 3.0).abs() < 1e-12);

        let eps = 1e-12;
        let x_norm = dot(&x, &x).sqrt();
        let b_norm = dot(&b, &b).sqrt();
        assert!(residual_norm(&a, &x, &b) <= eps * (a.one_norm() * x_norm + b_norm));
    }

    #[test]
    fn iterative_solve_matches_direct() {
        let (a, b) = small_system();
        let direct = solve(&a, &b, &labels(2), SolveOptions::default()).unwrap();
        let iterative = solve(
            &a,
            &b,
            &labels(2),
            SolveOptions {
                iterative: true,
                condense: false,
            },
        )
        .unwrap();
        for (d, i) in direct.iter().zip(&iterative) {
            assert!((d - i).abs() < 1e-8);
        }
    }

    #[test]
    fn condensation_eliminates_trivial_rows() {
        // Row 2 pins x2 = 4; rows 0/1 couple x0, x1 to x2.
        let mut t = Triplets::new(3, 3);
        t.push(0, 0, 1.0);
        t.push(0, 2, 1.0);
        t.push(1, 1, 2.0);
        t.push(1, 2, -1.0);
        t.push(2, 2, 2.0);
        let a = CsrMatrix::from_triplets(&t);
        let b = vec![5.0, 0.0, 8.0];

        let plain = solve(&a, &b, &labels(3), SolveOptions::default()).unwrap();
        let condensed = solve(
            &a,
            &b,
            &labels(3),
            SolveOptions {
                iterative: false,
                condense: true,
            },
        )
        .unwrap();
        for (p, c) in plain.iter().zip(&condensed) {
            assert!((p - c).abs() < 1e-12);
        }
        assert!((condensed[2] - 4.0).abs() < 1e-12);
        assert!((condensed[0] - 1.0).abs() < 1e-12);
        assert!((condensed[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rectangular_systems_report_signed_difference() {
        let mut t = Triplets::new(4, 2);
        t.push(0, 0, 1.0);
        let a = CsrMatrix::from_triplets(&t);
        let err = solve(&a, &[0.0; 4], &labels(4), SolveOptions::default()).unwrap_err();
        assert_eq!(err.kind, equilibra_common::ModelErrorKind::Shape);
        assert!(err.to_string().contains("2 too many exogenous"));

        let mut t = Triplets::new(2, 4);
        t.push(0, 0, 1.0);
        let a = CsrMatrix::from_triplets(&t);
        let err = solve(&a, &[0.0; 2], &labels(2), SolveOptions::default()).unwrap_err();
        assert!(err.to_string().contains("2 too few exogenous"));
    }

    #[test]
    fn duplicate_rows_are_grouped_by_value_tuple() {
        let mut t = Triplets::new(3, 2);
        t.push(0, 0, 1.0);
        t.push(0, 1, 2.0);
        t.push(1, 0, 1.0);
        t.push(1, 1, 2.0);
        t.push(2, 0, 3.0);
        let a = CsrMatrix::from_triplets(&t);
        let groups = duplicate_row_groups(&a);
        assert_eq!(groups, vec![vec![0, 1]]);
    }

    #[test]
    fn empty_rows_and_cols_are_reported() {
        let mut t = Triplets::new(3, 3);
        t.push(0, 0, 1.0);
        t.push(2, 0, 1.0);
        let a = CsrMatrix::from_triplets(&t);
        assert_eq!(a.empty_rows(), vec![1]);
        assert_eq!(a.empty_cols(), vec![1, 2]);
    }
}
