pub mod expr;
pub mod splitter;
pub mod statement;

pub use expr::{Arg, CmpOp, ExprKind, ExprNode, Factor, Origin, Sign, VarRef, merge_bindings};
pub use splitter::{Keyword, RawStatement, split_statements};
pub use statement::{ParsedStatement, SetExpr, SetOperand, parse_bindings, parse_statement};
