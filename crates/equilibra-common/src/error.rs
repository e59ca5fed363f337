//! The single error type the solver surfaces: a *model error*.
//!
//! - **`ModelErrorKind`** : the phase the error belongs to
//! - **`StatementContext`**: statement name + source line, when known
//! - **`ModelError`**      : one struct that glues the two together
//!
//! Internally errors are classified by the phase that raised them; to the
//! outside everything is one kind, printed with the originating statement
//! and line where applicable.

use std::{error::Error, fmt};

/// The phase a model error was raised in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ModelErrorKind {
    /// Malformed statement, unknown keyword, unterminated statement,
    /// unknown set/variable reference at declaration time.
    Parse,
    /// Duplicate name, disjoint-union violation, mapping collision,
    /// LHS/index mismatch, uncovered free index.
    Consistency,
    /// Product rule or quotient rule involving solution variables, or a
    /// power of a solution variable.
    Differentiation,
    /// Equation-plus-closure row count not equal to the solution length.
    Shape,
    /// Linear-solve failure, escalated from a solver warning.
    Solver,
    /// Arithmetic domain error while evaluating a tree (division by zero,
    /// log of a non-positive value, comparison in a value context).
    Eval,
    /// Missing file, sheet, row or value.
    Io,
    /// A state the code should never reach.
    Internal,
}

impl fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parse => "parse error",
            Self::Consistency => "consistency error",
            Self::Differentiation => "differentiation error",
            Self::Shape => "shape error",
            Self::Solver => "solver error",
            Self::Eval => "evaluation error",
            Self::Io => "i/o error",
            Self::Internal => "internal error",
        })
    }
}

/// Where an error came from, in model-source terms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StatementContext {
    pub statement: Option<String>,
    pub line: Option<u32>,
}

/// The single struct the API passes around.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: Option<String>,
    pub context: StatementContext,
}

/* ───────────────────── Constructors & helpers ─────────────────────── */

impl From<ModelErrorKind> for ModelError {
    fn from(kind: ModelErrorKind) -> Self {
        Self {
            kind,
            message: None,
            context: StatementContext::default(),
        }
    }
}

impl ModelError {
    pub fn new(kind: ModelErrorKind) -> Self {
        kind.into()
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::new(ModelErrorKind::Parse).with_message(msg)
    }

    pub fn consistency<S: Into<String>>(msg: S) -> Self {
        Self::new(ModelErrorKind::Consistency).with_message(msg)
    }

    pub fn differentiation<S: Into<String>>(msg: S) -> Self {
        Self::new(ModelErrorKind::Differentiation).with_message(msg)
    }

    pub fn shape<S: Into<String>>(msg: S) -> Self {
        Self::new(ModelErrorKind::Shape).with_message(msg)
    }

    pub fn solver<S: Into<String>>(msg: S) -> Self {
        Self::new(ModelErrorKind::Solver).with_message(msg)
    }

    pub fn eval<S: Into<String>>(msg: S) -> Self {
        Self::new(ModelErrorKind::Eval).with_message(msg)
    }

    pub fn io<S: Into<String>>(msg: S) -> Self {
        Self::new(ModelErrorKind::Io).with_message(msg)
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::new(ModelErrorKind::Internal).with_message(msg)
    }

    pub fn with_message<S: Into<String>>(mut self, msg: S) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Attach the originating statement name, unless one is already set.
    /// Errors keep the innermost statement they were raised for.
    pub fn with_statement<S: Into<String>>(mut self, statement: S) -> Self {
        if self.context.statement.is_none() {
            self.context.statement = Some(statement.into());
        }
        self
    }

    /// Attach the originating source line, unless one is already set.
    pub fn with_line(mut self, line: u32) -> Self {
        if self.context.line.is_none() {
            self.context.line = Some(line);
        }
        self
    }

    pub fn at<S: Into<String>>(self, statement: S, line: u32) -> Self {
        self.with_statement(statement).with_line(line)
    }
}

/* ───────────────────────── Display / Error ────────────────────────── */

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model error ({})", self.kind)?;

        if let Some(ref msg) = self.message {
            write!(f, ": {msg}")?;
        }

        match (&self.context.statement, self.context.line) {
            (Some(stmt), Some(line)) => write!(f, " (statement `{stmt}`, line {line})"),
            (Some(stmt), None) => write!(f, " (statement `{stmt}`)"),
            (None, Some(line)) => write!(f, " (line {line})"),
            (None, None) => Ok(()),
        }
    }
}

impl Error for ModelError {}

impl From<ModelError> for String {
    fn from(error: ModelError) -> Self {
        format!("{error}")
    }
}
