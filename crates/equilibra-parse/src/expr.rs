//! Indexed expression trees.
//!
//! Statement bodies are lifted into an [`ExprNode`] tree: a tagged variant
//! per node kind, with every node remembering the `(index → set)` bindings
//! visible at its point of construction plus the originating statement name
//! and line for diagnostics.
//!
//! Shaping scans at bracket depth zero for the weakest operator class
//! present (comparison, then additive, then multiplicative, then power) and
//! splits n-ary, so `a + b - c` becomes one additive node with three signed
//! branches. Square brackets enclose the three special forms
//! `[sum : i=SET : body]`, `[if : lhs op rhs : body]` and `[loge : body]`.
//!
//! Combining trees with [`ExprNode::plus`] and friends performs the
//! constructive simplifications the differentiator relies on: number
//! folding, `x*0 → 0`, `x*1 → x`, merging adjacent n-ary nodes and
//! sign-flipping subtracted branches.

use std::fmt;

use equilibra_common::ModelError;

/// Comparison operators admitted in assertions and conditional guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CmpOp {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            ">" => Some(Self::Gt),
            "<=" => Some(Self::Le),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
        }
    }

    pub fn holds(&self, left: f64, right: f64) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Lt => left < right,
            Self::Gt => left > right,
            Self::Le => left <= right,
            Self::Ge => left >= right,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-branch sign of an n-ary additive node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Plus,
    Minus,
}

impl Sign {
    fn flipped(self) -> Self {
        match self {
            Self::Plus => Self::Minus,
            Self::Minus => Self::Plus,
        }
    }
}

/// Per-branch operator of an n-ary multiplicative node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factor {
    Mul,
    Div,
}

/// One argument position of a variable reference: either a free or bound
/// index symbol, or a quoted literal set element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arg {
    Symbol(String),
    Literal(String),
}

/// A reference to a data or solution variable by name, with its ordered
/// argument positions. Which catalog the name resolves against is decided
/// late, at evaluation or differentiation time.
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub args: Vec<Arg>,
}

impl VarRef {
    /// Split a `NAME_idx1_idx2` token into a reference. A chunk wrapped in
    /// double quotes is a literal set element.
    pub fn parse(token: &str, origin: &Origin) -> Result<Self, ModelError> {
        let mut chunks = token.split('_');
        let name = chunks
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                ModelError::parse(format!("empty variable reference `{token}`"))
                    .at(&origin.statement, origin.line)
            })?
            .to_string();

        let mut args = Vec::new();
        for chunk in chunks {
            if let Some(stripped) = chunk.strip_prefix('"') {
                let element = stripped.strip_suffix('"').ok_or_else(|| {
                    ModelError::parse(format!(
                        "expecting closing quote in index `{chunk}` of variable `{name}`"
                    ))
                    .at(&origin.statement, origin.line)
                })?;
                args.push(Arg::Literal(element.to_string()));
            } else {
                args.push(Arg::Symbol(chunk.to_string()));
            }
        }
        Ok(Self { name, args })
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            match arg {
                Arg::Symbol(s) => write!(f, "_{s}")?,
                Arg::Literal(e) => write!(f, "_\"{e}\"")?,
            }
        }
        Ok(())
    }
}

/// Where a node came from, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub statement: String,
    pub line: u32,
}

impl Origin {
    pub fn new<S: Into<String>>(statement: S, line: u32) -> Self {
        Self {
            statement: statement.into(),
            line,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Number(f64),
    Var(VarRef),
    /// N-ary sum/difference; `signs` and `branches` are parallel.
    Additive {
        signs: Vec<Sign>,
        branches: Vec<ExprNode>,
    },
    /// N-ary product/quotient; `ops` and `branches` are parallel.
    Multiplicative {
        ops: Vec<Factor>,
        branches: Vec<ExprNode>,
    },
    Power {
        base: Box<ExprNode>,
        exponent: Box<ExprNode>,
    },
    /// `[sum : index=SET : body]` — binds `index` over `set` inside `body`.
    SumOver {
        index: String,
        set: String,
        body: Box<ExprNode>,
    },
    /// `[if : lhs op rhs : body]` — the body is evaluated only where the
    /// guard holds.
    Conditional {
        lhs: Box<ExprNode>,
        op: CmpOp,
        rhs: Box<ExprNode>,
        body: Box<ExprNode>,
    },
    LogE(Box<ExprNode>),
    Compare {
        lhs: Box<ExprNode>,
        op: CmpOp,
        rhs: Box<ExprNode>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    pub kind: ExprKind,
    /// Set names visible at this node, parallel to `indices`.
    pub sets: Vec<String>,
    /// Index symbols visible at this node.
    pub indices: Vec<String>,
    pub origin: Origin,
}

/* ─────────────────────────── construction ─────────────────────────── */

impl ExprNode {
    pub fn number(value: f64, sets: Vec<String>, indices: Vec<String>, origin: Origin) -> Self {
        Self {
            kind: ExprKind::Number(value),
            sets,
            indices,
            origin,
        }
    }

    pub fn zero(sets: Vec<String>, indices: Vec<String>, origin: Origin) -> Self {
        Self::number(0.0, sets, indices, origin)
    }

    pub fn one(sets: Vec<String>, indices: Vec<String>, origin: Origin) -> Self {
        Self::number(1.0, sets, indices, origin)
    }

    pub fn is_number(&self, value: f64) -> bool {
        matches!(self.kind, ExprKind::Number(v) if v == value)
    }

    /// Parse an expression body against the ambient `(indices, sets)`
    /// bindings of its statement.
    pub fn parse(
        text: &str,
        sets: &[String],
        indices: &[String],
        origin: &Origin,
    ) -> Result<Self, ModelError> {
        let normalised = normalise(text);
        let stripped = strip_outer_parens(&normalised);
        Self::parse_stripped(&stripped, sets, indices, origin)
    }

    fn parse_stripped(
        text: &str,
        sets: &[String],
        indices: &[String],
        origin: &Origin,
    ) -> Result<Self, ModelError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ModelError::parse("empty expression")
                .at(&origin.statement, origin.line));
        }

        // A bare numeric literal.
        if let Ok(value) = text.parse::<f64>() {
            return Ok(Self::number(
                value,
                sets.to_vec(),
                indices.to_vec(),
                origin.clone(),
            ));
        }

        // After normalisation every operator carries surrounding spaces, so
        // a token without spaces can only be a variable reference.
        if !text.contains(' ') {
            let vref = VarRef::parse(text, origin)?;
            for arg in &vref.args {
                if let Arg::Symbol(symbol) = arg {
                    if !indices.iter().any(|i| i == symbol) {
                        return Err(ModelError::consistency(format!(
                            "index `{symbol}` of variable `{}` is not covered by the \
                             statement bindings",
                            vref.name
                        ))
                        .at(&origin.statement, origin.line));
                    }
                }
            }
            return Ok(Self {
                kind: ExprKind::Var(vref),
                sets: sets.to_vec(),
                indices: indices.to_vec(),
                origin: origin.clone(),
            });
        }

        // A wholly enclosed square-bracket block is one of the special forms.
        if is_square_block(text) {
            return Self::parse_square_block(text, sets, indices, origin);
        }

        let split = scan_weakest(text, origin)?;
        match split {
            OperatorSplit::Compare { pos, op } => {
                let lhs = &text[..pos];
                let rhs = &text[pos + op.as_str().len()..];
                let lhs = Self::parse(lhs, sets, indices, origin)?;
                let rhs = Self::parse(rhs, sets, indices, origin)?;
                Ok(Self {
                    kind: ExprKind::Compare {
                        lhs: Box::new(lhs),
                        op,
                        rhs: Box::new(rhs),
                    },
                    sets: sets.to_vec(),
                    indices: indices.to_vec(),
                    origin: origin.clone(),
                })
            }
            OperatorSplit::Additive(positions) => {
                Self::combine_additive(text, &positions, sets, indices, origin)
            }
            OperatorSplit::Multiplicative(positions) => {
                Self::combine_multiplicative(text, &positions, sets, indices, origin)
            }
            OperatorSplit::Power(positions) => {
                if positions.len() != 1 {
                    return Err(ModelError::parse(format!(
                        "unexpected number of `^` operators in `{}`",
                        text.trim()
                    ))
                    .at(&origin.statement, origin.line));
                }
                let base = Self::parse(&text[..positions[0]], sets, indices, origin)?;
                let exponent = Self::parse(&text[positions[0] + 1..], sets, indices, origin)?;
                Ok(Self {
                    kind: ExprKind::Power {
                        base: Box::new(base),
                        exponent: Box::new(exponent),
                    },
                    sets: sets.to_vec(),
                    indices: indices.to_vec(),
                    origin: origin.clone(),
                })
            }
            OperatorSplit::None => Err(ModelError::parse(format!(
                "could not interpret `{}` as an expression",
                text.trim()
            ))
            .at(&origin.statement, origin.line)),
        }
    }

    fn parse_square_block(
        text: &str,
        sets: &[String],
        indices: &[String],
        origin: &Origin,
    ) -> Result<Self, ModelError> {
        let inner = text.trim();
        let inner = &inner[1..inner.len() - 1];
        let parts = split_colons(inner, 3);

        let form = parts
            .first()
            .map(|p| p.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match form.as_str() {
            "sum" => {
                if parts.len() != 3 {
                    return Err(ModelError::parse(format!(
                        "expected `[sum : index=SET : body]`, got `[{inner}]`"
                    ))
                    .at(&origin.statement, origin.line));
                }
                let binding: String =
                    parts[1].chars().filter(|c| !c.is_whitespace()).collect();
                let (index, set) = binding.split_once('=').ok_or_else(|| {
                    ModelError::parse(format!(
                        "expected `index=SET` in sum binding, got `{}`",
                        parts[1].trim()
                    ))
                    .at(&origin.statement, origin.line)
                })?;

                let mut body_sets = sets.to_vec();
                let mut body_indices = indices.to_vec();
                body_sets.push(set.to_string());
                body_indices.push(index.to_string());
                let body = Self::parse(parts[2], &body_sets, &body_indices, origin)?;
                Ok(Self {
                    kind: ExprKind::SumOver {
                        index: index.to_string(),
                        set: set.to_string(),
                        body: Box::new(body),
                    },
                    sets: sets.to_vec(),
                    indices: indices.to_vec(),
                    origin: origin.clone(),
                })
            }
            "if" => {
                if parts.len() != 3 {
                    return Err(ModelError::parse(format!(
                        "expected `[if : lhs op rhs : body]`, got `[{inner}]`"
                    ))
                    .at(&origin.statement, origin.line));
                }
                let guard: Vec<&str> = parts[1].split_whitespace().collect();
                if guard.len() != 3 {
                    return Err(ModelError::parse(format!(
                        "expected a three-part condition in `[if : ... ]`, got `{}`",
                        parts[1].trim()
                    ))
                    .at(&origin.statement, origin.line));
                }
                let op = CmpOp::parse(guard[1]).ok_or_else(|| {
                    ModelError::parse(format!(
                        "unknown comparison operator `{}` in conditional guard",
                        guard[1]
                    ))
                    .at(&origin.statement, origin.line)
                })?;
                let lhs = Self::parse(guard[0], sets, indices, origin)?;
                let rhs = Self::parse(guard[2], sets, indices, origin)?;
                let body = Self::parse(parts[2], sets, indices, origin)?;
                Ok(Self {
                    kind: ExprKind::Conditional {
                        lhs: Box::new(lhs),
                        op,
                        rhs: Box::new(rhs),
                        body: Box::new(body),
                    },
                    sets: sets.to_vec(),
                    indices: indices.to_vec(),
                    origin: origin.clone(),
                })
            }
            "loge" => {
                if parts.len() != 2 {
                    return Err(ModelError::parse(format!(
                        "expected `[loge : body]`, got `[{inner}]`"
                    ))
                    .at(&origin.statement, origin.line));
                }
                let body = Self::parse(parts[1], sets, indices, origin)?;
                Ok(Self {
                    kind: ExprKind::LogE(Box::new(body)),
                    sets: sets.to_vec(),
                    indices: indices.to_vec(),
                    origin: origin.clone(),
                })
            }
            other => Err(ModelError::parse(format!(
                "unhandled bracket form `[{other} : ...]`"
            ))
            .at(&origin.statement, origin.line)),
        }
    }

    fn combine_additive(
        text: &str,
        positions: &[usize],
        sets: &[String],
        indices: &[String],
        origin: &Origin,
    ) -> Result<Self, ModelError> {
        let bytes = text.as_bytes();
        let mut positions = positions.to_vec();

        // A leading `-` attaches to the first branch.
        let mut first_sign = Sign::Plus;
        let mut start = 0usize;
        if positions.first() == Some(&0) {
            if bytes[0] != b'-' {
                return Err(ModelError::parse(format!(
                    "unexpected operator `{}` at the start of `{}`",
                    text.chars().next().unwrap_or(' '),
                    text.trim()
                ))
                .at(&origin.statement, origin.line));
            }
            first_sign = Sign::Minus;
            start = 1;
            positions.remove(0);
        }

        let mut acc: Option<Self> = None;
        let mut sign = first_sign;
        let mut from = start;
        positions.push(text.len());
        for pos in positions {
            let piece = &text[from..pos.min(text.len())];
            let branch = Self::parse(piece, sets, indices, origin)?;
            acc = Some(match acc {
                None => {
                    if sign == Sign::Minus {
                        Self::zero(sets.to_vec(), indices.to_vec(), origin.clone())
                            .minus(branch)?
                    } else {
                        branch
                    }
                }
                Some(a) => match sign {
                    Sign::Plus => a.plus(branch)?,
                    Sign::Minus => a.minus(branch)?,
                },
            });
            if pos < text.len() {
                sign = if bytes[pos] == b'-' {
                    Sign::Minus
                } else {
                    Sign::Plus
                };
                from = pos + 1;
            }
        }
        acc.ok_or_else(|| {
            ModelError::parse("empty additive expression").at(&origin.statement, origin.line)
        })
    }

    fn combine_multiplicative(
        text: &str,
        positions: &[usize],
        sets: &[String],
        indices: &[String],
        origin: &Origin,
    ) -> Result<Self, ModelError> {
        let bytes = text.as_bytes();
        let mut acc: Option<Self> = None;
        let mut op = Factor::Mul;
        let mut from = 0usize;
        let mut positions = positions.to_vec();
        positions.push(text.len());
        for pos in positions {
            let piece = &text[from..pos.min(text.len())];
            let branch = Self::parse(piece, sets, indices, origin)?;
            acc = Some(match acc {
                None => branch,
                Some(a) => match op {
                    Factor::Mul => a.times(branch)?,
                    Factor::Div => a.divide(branch)?,
                },
            });
            if pos < text.len() {
                op = if bytes[pos] == b'/' {
                    Factor::Div
                } else {
                    Factor::Mul
                };
                from = pos + 1;
            }
        }
        acc.ok_or_else(|| {
            ModelError::parse("empty multiplicative expression")
                .at(&origin.statement, origin.line)
        })
    }
}

/* ─────────────────── constructive combination ─────────────────────── */

impl ExprNode {
    /// `self + other`, folding numbers, dropping zero branches and merging
    /// adjacent n-ary sums.
    pub fn plus(self, other: Self) -> Result<Self, ModelError> {
        let (indices, sets) = merge_index_sets(&self, &other)?;
        let out = match (&self.kind, &other.kind) {
            (ExprKind::Number(a), ExprKind::Number(b)) => {
                Self::number(a + b, sets, indices, self.origin.clone())
            }
            _ if other.is_number(0.0) => self.rebound(sets, indices),
            _ if self.is_number(0.0) => other.rebound(sets, indices),
            (ExprKind::Additive { .. }, ExprKind::Additive { .. }) => {
                let (sa, ba) = self.into_additive_parts();
                let (sb, bb) = other.into_additive_parts();
                merge_additive(sa, ba, sb, bb, sets, indices)
            }
            (ExprKind::Additive { .. }, _) => {
                let (mut signs, mut branches) = self.into_additive_parts();
                signs.push(Sign::Plus);
                branches.push(other);
                rebuild_additive(signs, branches, sets, indices)
            }
            (_, ExprKind::Additive { .. }) => {
                let (mut signs, mut branches) = other.into_additive_parts();
                signs.insert(0, Sign::Plus);
                branches.insert(0, self);
                rebuild_additive(signs, branches, sets, indices)
            }
            _ => {
                let origin = self.origin.clone();
                Self {
                    kind: ExprKind::Additive {
                        signs: vec![Sign::Plus, Sign::Plus],
                        branches: vec![self, other],
                    },
                    sets,
                    indices,
                    origin,
                }
            }
        };
        Ok(out)
    }

    /// `self - other`, flipping the signs of a subtracted n-ary sum.
    pub fn minus(self, other: Self) -> Result<Self, ModelError> {
        let (indices, sets) = merge_index_sets(&self, &other)?;
        let out = match (&self.kind, &other.kind) {
            (ExprKind::Number(a), ExprKind::Number(b)) => {
                Self::number(a - b, sets, indices, self.origin.clone())
            }
            _ if other.is_number(0.0) => self.rebound(sets, indices),
            (ExprKind::Additive { .. }, ExprKind::Additive { .. }) => {
                let (sa, ba) = self.into_additive_parts();
                let (sb, bb) = other.into_additive_parts();
                let flipped = sb.into_iter().map(Sign::flipped).collect();
                merge_additive(sa, ba, flipped, bb, sets, indices)
            }
            (ExprKind::Additive { .. }, _) => {
                let (mut signs, mut branches) = self.into_additive_parts();
                signs.push(Sign::Minus);
                branches.push(other);
                rebuild_additive(signs, branches, sets, indices)
            }
            (_, ExprKind::Additive { .. }) => {
                let (signs, mut branches) = other.into_additive_parts();
                let mut flipped: Vec<Sign> =
                    signs.into_iter().map(Sign::flipped).collect();
                flipped.insert(0, Sign::Plus);
                branches.insert(0, self);
                rebuild_additive(flipped, branches, sets, indices)
            }
            _ => {
                let origin = self.origin.clone();
                Self {
                    kind: ExprKind::Additive {
                        signs: vec![Sign::Plus, Sign::Minus],
                        branches: vec![self, other],
                    },
                    sets,
                    indices,
                    origin,
                }
            }
        };
        Ok(out)
    }

    /// `self * other`, with `x*0 → 0`, `x*1 → x` and n-ary merging.
    pub fn times(self, other: Self) -> Result<Self, ModelError> {
        let (indices, sets) = merge_index_sets(&self, &other)?;
        let out = match (&self.kind, &other.kind) {
            (ExprKind::Number(a), ExprKind::Number(b)) => {
                Self::number(a * b, sets, indices, self.origin.clone())
            }
            _ if self.is_number(0.0) || other.is_number(0.0) => {
                Self::zero(sets, indices, self.origin.clone())
            }
            _ if self.is_number(1.0) => other.rebound(sets, indices),
            _ if other.is_number(1.0) => self.rebound(sets, indices),
            (ExprKind::Multiplicative { .. }, ExprKind::Multiplicative { .. }) => {
                let (oa, ba) = self.into_multiplicative_parts();
                let (ob, bb) = other.into_multiplicative_parts();
                merge_multiplicative(oa, ba, ob, bb, sets, indices)
            }
            (ExprKind::Multiplicative { .. }, _) => {
                let (mut ops, mut branches) = self.into_multiplicative_parts();
                ops.push(Factor::Mul);
                branches.push(other);
                rebuild_multiplicative(ops, branches, sets, indices)
            }
            (_, ExprKind::Multiplicative { .. }) => {
                let (mut ops, mut branches) = other.into_multiplicative_parts();
                ops.insert(0, Factor::Mul);
                branches.insert(0, self);
                rebuild_multiplicative(ops, branches, sets, indices)
            }
            _ => {
                let origin = self.origin.clone();
                Self {
                    kind: ExprKind::Multiplicative {
                        ops: vec![Factor::Mul, Factor::Mul],
                        branches: vec![self, other],
                    },
                    sets,
                    indices,
                    origin,
                }
            }
        };
        Ok(out)
    }

    /// `self / other`.
    pub fn divide(self, other: Self) -> Result<Self, ModelError> {
        let (indices, sets) = merge_index_sets(&self, &other)?;
        let out = match (&self.kind, &other.kind) {
            _ if other.is_number(1.0) => self.rebound(sets, indices),
            (ExprKind::Multiplicative { .. }, _) => {
                let (mut ops, mut branches) = self.into_multiplicative_parts();
                ops.push(Factor::Div);
                branches.push(other);
                rebuild_multiplicative(ops, branches, sets, indices)
            }
            _ => {
                let origin = self.origin.clone();
                Self {
                    kind: ExprKind::Multiplicative {
                        ops: vec![Factor::Mul, Factor::Div],
                        branches: vec![self, other],
                    },
                    sets,
                    indices,
                    origin,
                }
            }
        };
        Ok(out)
    }

    fn rebound(mut self, sets: Vec<String>, indices: Vec<String>) -> Self {
        self.sets = sets;
        self.indices = indices;
        self
    }

    fn into_additive_parts(self) -> (Vec<Sign>, Vec<ExprNode>) {
        match self.kind {
            ExprKind::Additive { signs, branches } => (signs, branches),
            _ => (vec![Sign::Plus], vec![self]),
        }
    }

    fn into_multiplicative_parts(self) -> (Vec<Factor>, Vec<ExprNode>) {
        match self.kind {
            ExprKind::Multiplicative { ops, branches } => (ops, branches),
            _ => (vec![Factor::Mul], vec![self]),
        }
    }
}

fn merge_additive(
    mut signs: Vec<Sign>,
    mut branches: Vec<ExprNode>,
    other_signs: Vec<Sign>,
    other_branches: Vec<ExprNode>,
    sets: Vec<String>,
    indices: Vec<String>,
) -> ExprNode {
    signs.extend(other_signs);
    branches.extend(other_branches);
    rebuild_additive(signs, branches, sets, indices)
}

/// Rebuild an additive node, dropping zero branches.
fn rebuild_additive(
    signs: Vec<Sign>,
    branches: Vec<ExprNode>,
    sets: Vec<String>,
    indices: Vec<String>,
) -> ExprNode {
    let origin = branches[0].origin.clone();
    let mut kept_signs = Vec::with_capacity(signs.len());
    let mut kept = Vec::with_capacity(branches.len());
    for (sign, branch) in signs.into_iter().zip(branches) {
        if !branch.is_number(0.0) {
            kept_signs.push(sign);
            kept.push(branch);
        }
    }
    if kept.is_empty() {
        return ExprNode::zero(sets, indices, origin);
    }
    ExprNode {
        kind: ExprKind::Additive {
            signs: kept_signs,
            branches: kept,
        },
        sets,
        indices,
        origin,
    }
}

fn merge_multiplicative(
    mut ops: Vec<Factor>,
    mut branches: Vec<ExprNode>,
    other_ops: Vec<Factor>,
    other_branches: Vec<ExprNode>,
    sets: Vec<String>,
    indices: Vec<String>,
) -> ExprNode {
    ops.extend(other_ops);
    branches.extend(other_branches);
    rebuild_multiplicative(ops, branches, sets, indices)
}

/// Rebuild a multiplicative node, dropping multiply-by-one branches.
fn rebuild_multiplicative(
    ops: Vec<Factor>,
    branches: Vec<ExprNode>,
    sets: Vec<String>,
    indices: Vec<String>,
) -> ExprNode {
    let origin = branches[0].origin.clone();
    let mut kept_ops = Vec::with_capacity(ops.len());
    let mut kept = Vec::with_capacity(branches.len());
    for (op, branch) in ops.into_iter().zip(branches) {
        if !(op == Factor::Mul && branch.is_number(1.0)) {
            kept_ops.push(op);
            kept.push(branch);
        }
    }
    if kept.is_empty() {
        return ExprNode::one(sets, indices, origin);
    }
    ExprNode {
        kind: ExprKind::Multiplicative {
            ops: kept_ops,
            branches: kept,
        },
        sets,
        indices,
        origin,
    }
}

/// Determine the supremum of two ambient bindings: one must contain the
/// other, and the shared indices must bind the same sets.
fn merge_index_sets(
    a: &ExprNode,
    b: &ExprNode,
) -> Result<(Vec<String>, Vec<String>), ModelError> {
    merge_bindings(&a.indices, &a.sets, &b.indices, &b.sets)
        .map_err(|e| e.at(&a.origin.statement, a.origin.line))
}

/// Merge two `(indices, sets)` binding pairs by picking the one that
/// contains the other. The shared indices must bind the same sets.
pub fn merge_bindings(
    indices_a: &[String],
    sets_a: &[String],
    indices_b: &[String],
    sets_b: &[String],
) -> Result<(Vec<String>, Vec<String>), ModelError> {
    let (sup_indices, sup_sets, sub_indices, sub_sets) =
        if indices_a.iter().all(|i| indices_b.contains(i)) {
            (indices_b, sets_b, indices_a, sets_a)
        } else if indices_b.iter().all(|i| indices_a.contains(i)) {
            (indices_a, sets_a, indices_b, sets_b)
        } else {
            return Err(ModelError::internal(format!(
                "could not find a supremum of index bindings {indices_a:?} and \
                 {indices_b:?}"
            )));
        };

    for (i, index) in sub_indices.iter().enumerate() {
        let pos = sup_indices
            .iter()
            .position(|s| s == index)
            .ok_or_else(|| {
                ModelError::internal(format!(
                    "index `{index}` vanished while merging bindings"
                ))
            })?;
        if sub_sets[i] != sup_sets[pos] {
            return Err(ModelError::internal(format!(
                "index `{index}` binds set `{}` on one side and `{}` on the other",
                sub_sets[i], sup_sets[pos]
            )));
        }
    }
    Ok((sup_indices.to_vec(), sup_sets.to_vec()))
}

/* ─────────────────────────── text shaping ─────────────────────────── */

/// Pad operators with spaces and squeeze repeated whitespace so that the
/// depth-zero scan can work on stable character positions.
fn normalise(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    let chars: Vec<char> = text.trim().chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let two: Option<&str> = if i + 1 < chars.len() {
            match (c, chars[i + 1]) {
                ('=', '=') => Some("=="),
                ('!', '=') => Some("!="),
                ('>', '=') => Some(">="),
                ('<', '=') => Some("<="),
                _ => None,
            }
        } else {
            None
        };
        if let Some(op) = two {
            out.push(' ');
            out.push_str(op);
            out.push(' ');
            i += 2;
            continue;
        }
        match c {
            ':' | '+' | '-' | '/' | '*' | '^' | '(' | ')' | '>' | '<' => {
                out.push(' ');
                out.push(c);
                out.push(' ');
            }
            _ => out.push(c),
        }
        i += 1;
    }

    let squeezed: Vec<&str> = out.split_whitespace().collect();
    squeezed.join(" ")
}

/// Strip single enclosing parenthesis pairs, repeatedly, as long as they
/// wrap the whole string — `(a+b)` but not `(a)+(b)`.
fn strip_outer_parens(text: &str) -> String {
    let mut current = text.trim().to_string();
    loop {
        let stripped = strip_outer_parens_once(&current);
        if stripped == current {
            return current;
        }
        current = stripped;
    }
}

fn strip_outer_parens_once(text: &str) -> String {
    let trimmed = text.trim();
    if !(trimmed.starts_with('(') && trimmed.ends_with(')')) {
        return trimmed.to_string();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    let mut depth = 0i32;
    for &c in &chars[..chars.len() - 1] {
        if c == '(' {
            depth += 1;
        } else if c == ')' {
            depth -= 1;
        }
        if depth == 0 {
            // The opening paren closed before the end; not a single wrap.
            return trimmed.to_string();
        }
    }
    trimmed[1..trimmed.len() - 1].trim().to_string()
}

/// True if the string is one wholly enclosed square-bracket block.
fn is_square_block(text: &str) -> bool {
    let trimmed = text.trim();
    if !(trimmed.starts_with('[') && trimmed.ends_with(']')) {
        return false;
    }
    let chars: Vec<char> = trimmed.chars().collect();
    let mut depth = 0i32;
    for &c in &chars[..chars.len() - 1] {
        if c == '[' {
            depth += 1;
        } else if c == ']' {
            depth -= 1;
        }
        if depth == 0 {
            return false;
        }
    }
    true
}

/// Split at `:` at bracket depth zero, into at most `max_parts` pieces.
fn split_colons(text: &str, max_parts: usize) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut from = 0usize;
    for (pos, c) in text.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ':' if depth == 0 && parts.len() + 1 < max_parts => {
                parts.push(&text[from..pos]);
                from = pos + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[from..]);
    parts
}

enum OperatorSplit {
    Compare { pos: usize, op: CmpOp },
    Additive(Vec<usize>),
    Multiplicative(Vec<usize>),
    Power(Vec<usize>),
    None,
}

/// Scan at depth zero for the weakest operator class present and collect
/// the split positions. Comparison binds outermost, then additive, then
/// multiplicative, then power.
fn scan_weakest(text: &str, origin: &Origin) -> Result<OperatorSplit, ModelError> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut compare: Option<(usize, CmpOp)> = None;
    let mut compare_count = 0usize;
    let mut additive = Vec::new();
    let mut multiplicative = Vec::new();
    let mut power = Vec::new();

    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            _ if depth > 0 => {}
            b'+' | b'-' => additive.push(i),
            b'*' | b'/' => multiplicative.push(i),
            b'^' => power.push(i),
            b'=' | b'!' | b'<' | b'>' => {
                let mut op_text = &text[i..i + 1];
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    op_text = &text[i..i + 2];
                }
                if let Some(op) = CmpOp::parse(op_text) {
                    compare_count += 1;
                    if compare.is_none() {
                        compare = Some((i, op));
                    }
                    i += op_text.len();
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }

    if compare_count > 1 {
        return Err(ModelError::parse(format!(
            "more than one comparison operator in `{}`",
            text.trim()
        ))
        .at(&origin.statement, origin.line));
    }
    if let Some((pos, op)) = compare {
        return Ok(OperatorSplit::Compare { pos, op });
    }
    if !additive.is_empty() {
        return Ok(OperatorSplit::Additive(additive));
    }
    if !multiplicative.is_empty() {
        return Ok(OperatorSplit::Multiplicative(multiplicative));
    }
    if !power.is_empty() {
        return Ok(OperatorSplit::Power(power));
    }
    Ok(OperatorSplit::None)
}

/* ────────────────────────────── display ───────────────────────────── */

impl fmt::Display for ExprNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Number(v) => write!(f, "{v}"),
            ExprKind::Var(vref) => write!(f, "{vref}"),
            ExprKind::Additive { signs, branches } => {
                for (i, (sign, branch)) in signs.iter().zip(branches).enumerate() {
                    match (i, sign) {
                        (0, Sign::Plus) => {}
                        (0, Sign::Minus) => write!(f, "-")?,
                        (_, Sign::Plus) => write!(f, " + ")?,
                        (_, Sign::Minus) => write!(f, " - ")?,
                    }
                    write!(f, "({branch})")?;
                }
                Ok(())
            }
            ExprKind::Multiplicative { ops, branches } => {
                for (i, (op, branch)) in ops.iter().zip(branches).enumerate() {
                    match (i, op) {
                        (0, Factor::Mul) => {}
                        (0, Factor::Div) => write!(f, "1 / ")?,
                        (_, Factor::Mul) => write!(f, " * ")?,
                        (_, Factor::Div) => write!(f, " / ")?,
                    }
                    write!(f, "({branch})")?;
                }
                Ok(())
            }
            ExprKind::Power { base, exponent } => write!(f, "({base}) ^ ({exponent})"),
            ExprKind::SumOver { index, set, body } => {
                write!(f, "[sum : {index}={set} : {body}]")
            }
            ExprKind::Conditional { lhs, op, rhs, body } => {
                write!(f, "[if : {lhs} {op} {rhs} : {body}]")
            }
            ExprKind::LogE(body) => write!(f, "[loge : {body}]"),
            ExprKind::Compare { lhs, op, rhs } => write!(f, "({lhs}) {op} ({rhs})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::new("test", 1)
    }

    fn parse(text: &str, sets: &[&str], indices: &[&str]) -> ExprNode {
        let sets: Vec<String> = sets.iter().map(|s| s.to_string()).collect();
        let indices: Vec<String> = indices.iter().map(|s| s.to_string()).collect();
        ExprNode::parse(text, &sets, &indices, &origin()).unwrap()
    }

    #[test]
    fn parses_number() {
        let node = parse("2.5", &[], &[]);
        assert!(node.is_number(2.5));
    }

    #[test]
    fn parses_variable_with_indices() {
        let node = parse("X_i_j", &["I", "J"], &["i", "j"]);
        match node.kind {
            ExprKind::Var(vref) => {
                assert_eq!(vref.name, "X");
                assert_eq!(
                    vref.args,
                    vec![Arg::Symbol("i".into()), Arg::Symbol("j".into())]
                );
            }
            other => panic!("expected a variable reference, got {other:?}"),
        }
    }

    #[test]
    fn parses_literal_element_argument() {
        let node = parse("X_\"aus\"", &["I"], &["i"]);
        match node.kind {
            ExprKind::Var(vref) => {
                assert_eq!(vref.args, vec![Arg::Literal("aus".into())]);
            }
            other => panic!("expected a variable reference, got {other:?}"),
        }
    }

    #[test]
    fn uncovered_index_is_a_consistency_error() {
        let err = ExprNode::parse("X_k", &["I".into()], &["i".into()], &origin()).unwrap_err();
        assert_eq!(err.kind, equilibra_common::ModelErrorKind::Consistency);
    }

    #[test]
    fn nary_additive_keeps_signs() {
        let node = parse("a + b - c", &[], &[]);
        match node.kind {
            ExprKind::Additive { signs, branches } => {
                assert_eq!(signs, vec![Sign::Plus, Sign::Plus, Sign::Minus]);
                assert_eq!(branches.len(), 3);
            }
            other => panic!("expected an additive node, got {other:?}"),
        }
    }

    #[test]
    fn leading_minus_attaches_to_first_branch() {
        let node = parse("-a + b", &[], &[]);
        match node.kind {
            ExprKind::Additive { signs, .. } => {
                assert_eq!(signs, vec![Sign::Minus, Sign::Plus]);
            }
            other => panic!("expected an additive node, got {other:?}"),
        }
    }

    #[test]
    fn multiplicative_binds_tighter_than_additive() {
        let node = parse("a + b * c", &[], &[]);
        match node.kind {
            ExprKind::Additive { branches, .. } => {
                assert!(matches!(
                    branches[1].kind,
                    ExprKind::Multiplicative { .. }
                ));
            }
            other => panic!("expected an additive node, got {other:?}"),
        }
    }

    #[test]
    fn comparison_binds_outermost() {
        let node = parse("a + b >= c", &[], &[]);
        match node.kind {
            ExprKind::Compare { op, lhs, .. } => {
                assert_eq!(op, CmpOp::Ge);
                assert!(matches!(lhs.kind, ExprKind::Additive { .. }));
            }
            other => panic!("expected a comparison, got {other:?}"),
        }
    }

    #[test]
    fn constant_folding_collapses_one_times_x_plus_zero() {
        let node = parse("1 * x + 0", &[], &[]);
        let plain = parse("x", &[], &[]);
        assert_eq!(node.kind, plain.kind);
    }

    #[test]
    fn outer_parens_are_stripped_repeatedly() {
        let node = parse("((a + b))", &[], &[]);
        assert!(matches!(node.kind, ExprKind::Additive { .. }));
        let wrapped = parse("(a) + (b)", &[], &[]);
        assert!(matches!(wrapped.kind, ExprKind::Additive { .. }));
    }

    #[test]
    fn sum_over_extends_the_ambient_bindings() {
        let node = parse("[sum : i=I : w_i]", &[], &[]);
        match node.kind {
            ExprKind::SumOver { index, set, body } => {
                assert_eq!(index, "i");
                assert_eq!(set, "I");
                assert_eq!(body.indices, vec!["i".to_string()]);
                assert_eq!(body.sets, vec!["I".to_string()]);
            }
            other => panic!("expected a sum, got {other:?}"),
        }
    }

    #[test]
    fn conditional_form_parses() {
        let node = parse("[if : x > 0 : y]", &[], &[]);
        match node.kind {
            ExprKind::Conditional { op, .. } => assert_eq!(op, CmpOp::Gt),
            other => panic!("expected a conditional, got {other:?}"),
        }
    }

    #[test]
    fn loge_form_parses_with_nested_colons() {
        let node = parse("[loge : [sum : i=I : w_i]]", &[], &[]);
        match node.kind {
            ExprKind::LogE(body) => {
                assert!(matches!(body.kind, ExprKind::SumOver { .. }));
            }
            other => panic!("expected loge, got {other:?}"),
        }
    }

    #[test]
    fn unknown_bracket_form_is_rejected() {
        let err =
            ExprNode::parse("[min : a : b]", &[], &[], &origin()).unwrap_err();
        assert_eq!(err.kind, equilibra_common::ModelErrorKind::Parse);
    }

    #[test]
    fn power_splits_exactly_binary() {
        let node = parse("a ^ 2", &[], &[]);
        assert!(matches!(node.kind, ExprKind::Power { .. }));
        assert!(ExprNode::parse("a ^ b ^ c", &[], &[], &origin()).is_err());
    }

    #[test]
    fn subtracting_an_additive_flips_its_signs() {
        let a = parse("x", &[], &[]);
        let b = parse("p + q", &[], &[]);
        let out = a.minus(b).unwrap();
        match out.kind {
            ExprKind::Additive { signs, .. } => {
                assert_eq!(signs, vec![Sign::Plus, Sign::Minus, Sign::Minus]);
            }
            other => panic!("expected an additive node, got {other:?}"),
        }
    }

    #[test]
    fn merging_products_drops_unit_branches() {
        let a = parse("x * 1", &[], &[]);
        let b = parse("y", &[], &[]);
        let out = a.times(b).unwrap();
        match out.kind {
            ExprKind::Multiplicative { branches, .. } => assert_eq!(branches.len(), 2),
            ExprKind::Var(_) => panic!("product should keep both non-unit branches"),
            other => panic!("unexpected node {other:?}"),
        }
    }
}
