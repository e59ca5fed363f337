//! Per-keyword statement grammars.
//!
//! [`parse_statement`] turns a [`RawStatement`] into a typed
//! [`ParsedStatement`]. Expression bodies stay as raw text here — they are
//! lifted into trees by the statement managers, which know the ambient
//! bindings the trees are constructed under.

use equilibra_common::ModelError;

use crate::splitter::{Keyword, RawStatement};

/// The right-hand side of a `set` statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SetExpr {
    /// `set NAME = (e1, e2, …)`
    Explicit(Vec<String>),
    /// `set NAME = A + B + (x, y)` — disjoint union of named sets and
    /// inline element lists.
    Union(Vec<SetOperand>),
    /// `set NAME = A - B`
    Difference(String, String),
    /// `set NAME = A x B`
    Cross(String, String),
    /// `set NAME from SYMBOL.SHEET`
    FromTable { file: String, sheet: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetOperand {
    Named(String),
    Explicit(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedStatement {
    File {
        symbol: String,
        new: bool,
    },
    DataVar {
        name: String,
        sets: Vec<String>,
        table: Option<(String, String)>,
        fixed: bool,
    },
    SolVar {
        name: String,
        sets: Vec<String>,
        change: bool,
        linear: bool,
    },
    SetDecl {
        name: String,
        expr: SetExpr,
    },
    Subset {
        child: String,
        parent: String,
    },
    Assert {
        name: String,
        indices: Vec<String>,
        sets: Vec<String>,
        condition: String,
    },
    Formula {
        name: String,
        indices: Vec<String>,
        sets: Vec<String>,
        lhs: String,
        rhs: String,
        initial: bool,
    },
    Update {
        name: String,
        indices: Vec<String>,
        sets: Vec<String>,
        lhs: String,
        rhs: String,
    },
    Equation {
        name: String,
        indices: Vec<String>,
        sets: Vec<String>,
        lhs: String,
        rhs: String,
    },
    LoopFormulas {
        name: String,
        iterations: usize,
        formulas: Vec<String>,
    },
    Write {
        var: String,
        file: String,
        sheet: String,
    },
}

/// Parse `idx1=SET1, idx2=SET2, …` into parallel index and set lists.
pub fn parse_bindings(text: &str, line: u32) -> Result<(Vec<String>, Vec<String>), ModelError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let mut indices = Vec::new();
    let mut sets = Vec::new();
    for pair in trimmed.split(',') {
        let (index, set) = pair.trim().split_once('=').ok_or_else(|| {
            ModelError::parse(format!("expected `index=SET` binding, got `{}`", pair.trim()))
                .with_line(line)
        })?;
        indices.push(index.trim().to_string());
        sets.push(set.trim().to_string());
    }
    Ok((indices, sets))
}

pub fn parse_statement(raw: &RawStatement) -> Result<ParsedStatement, ModelError> {
    let text = squeeze(&raw.text);
    let line = raw.line;
    match raw.keyword {
        Keyword::File => parse_file(&text, line),
        Keyword::DataVar => parse_datavar(&text, line),
        Keyword::SolVar => parse_solvar(&text, line),
        Keyword::Set => parse_set(&text, line),
        Keyword::Subset => parse_subset(&text, line),
        Keyword::Assert => parse_assert(&text, line),
        Keyword::Formula => parse_formula(&text, line),
        Keyword::Update => parse_update(&text, line),
        Keyword::Equation => parse_equation(&text, line),
        Keyword::LoopFormulas => parse_loopformulas(&text, line),
        Keyword::Write => parse_write(&text, line),
    }
}

fn squeeze(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    words.join(" ")
}

fn parse_file(text: &str, line: u32) -> Result<ParsedStatement, ModelError> {
    let mut words = text.split_whitespace();
    let first = words
        .next()
        .ok_or_else(|| ModelError::parse("file statement names no symbol").with_line(line))?;
    if first.eq_ignore_ascii_case("[new]") {
        let symbol = words.next().ok_or_else(|| {
            ModelError::parse("file [new] statement names no symbol").with_line(line)
        })?;
        Ok(ParsedStatement::File {
            symbol: symbol.to_string(),
            new: true,
        })
    } else {
        Ok(ParsedStatement::File {
            symbol: first.to_string(),
            new: false,
        })
    }
}

/// Split a `NAME[_SET]*` declaration token into name and set list.
fn split_decl(token: &str, line: u32) -> Result<(String, Vec<String>), ModelError> {
    let mut chunks = token.split('_');
    let name = chunks
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            ModelError::parse(format!("empty variable name in `{token}`")).with_line(line)
        })?
        .to_string();
    Ok((name, chunks.map(str::to_string).collect()))
}

fn parse_datavar(text: &str, line: u32) -> Result<ParsedStatement, ModelError> {
    let mut rest = text.trim();
    let mut fixed = false;
    if rest.to_ascii_lowercase().starts_with("[fixed]") {
        fixed = true;
        rest = rest["[fixed]".len()..].trim_start();
    }

    let (var_text, table) = match rest.to_ascii_lowercase().find(" from ") {
        Some(pos) => {
            let source = rest[pos + " from ".len()..].trim();
            let (file, sheet) = source.split_once('.').ok_or_else(|| {
                ModelError::parse(format!(
                    "expected `SYMBOL.SHEET` after `from`, got `{source}`"
                ))
                .with_line(line)
            })?;
            (
                rest[..pos].trim(),
                Some((file.to_string(), sheet.to_string())),
            )
        }
        None => (rest, None),
    };

    let (name, sets) = split_decl(var_text, line)?;
    Ok(ParsedStatement::DataVar {
        name,
        sets,
        table,
        fixed,
    })
}

fn parse_solvar(text: &str, line: u32) -> Result<ParsedStatement, ModelError> {
    let mut rest = text.trim();
    let mut change = false;
    let mut linear = false;
    if rest.starts_with('[') {
        let close = rest.find(']').ok_or_else(|| {
            ModelError::parse(format!("unterminated directive block in `{rest}`"))
                .with_line(line)
        })?;
        for directive in rest[1..close].split(',') {
            match directive.trim().to_ascii_lowercase().as_str() {
                "change" => change = true,
                "linear" => linear = true,
                other => {
                    return Err(ModelError::parse(format!(
                        "unknown solvar directive `{other}`"
                    ))
                    .with_line(line));
                }
            }
        }
        rest = rest[close + 1..].trim_start();
    }

    let (name, sets) = split_decl(rest, line)?;
    Ok(ParsedStatement::SolVar {
        name,
        sets,
        change,
        linear,
    })
}

fn explicit_elements(text: &str) -> Vec<String> {
    text.replace(['(', ')'], " ")
        .replace(',', " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn parse_set(text: &str, line: u32) -> Result<ParsedStatement, ModelError> {
    // Table reads come from already executed file statements.
    if let Some(pos) = text.to_ascii_lowercase().find(" from ") {
        let name = text[..pos].trim().to_string();
        let source = text[pos + " from ".len()..].trim();
        let (file, sheet) = source.split_once('.').ok_or_else(|| {
            ModelError::parse(format!(
                "expected `SYMBOL.SHEET` after `from`, got `{source}`"
            ))
            .with_line(line)
        })?;
        return Ok(ParsedStatement::SetDecl {
            name,
            expr: SetExpr::FromTable {
                file: file.to_string(),
                sheet: sheet.to_string(),
            },
        });
    }

    let (name, right) = text.split_once('=').ok_or_else(|| {
        ModelError::parse(format!("expected `NAME = …` in set statement `{text}`"))
            .with_line(line)
    })?;
    let name = name.trim().to_string();
    let right = right.trim();

    // At most one of the three set operators may appear.
    let has_plus = right.contains('+');
    let has_minus = right.contains('-');
    let has_cross = right.contains(" x ");
    if [has_plus, has_minus, has_cross].iter().filter(|b| **b).count() > 1 {
        return Err(ModelError::parse(format!(
            "multiple incompatible operators in set operation `{text}`"
        ))
        .with_line(line));
    }

    let expr = if has_plus {
        let operands = right
            .split('+')
            .map(|chunk| {
                let chunk = chunk.trim();
                if chunk.starts_with('(') {
                    SetOperand::Explicit(explicit_elements(chunk))
                } else {
                    SetOperand::Named(chunk.to_string())
                }
            })
            .collect();
        SetExpr::Union(operands)
    } else if has_minus {
        let chunks: Vec<&str> = right.split('-').map(str::trim).collect();
        if chunks.len() != 2 {
            return Err(ModelError::parse(format!(
                "expected exactly two sets in set difference `{text}`"
            ))
            .with_line(line));
        }
        SetExpr::Difference(chunks[0].to_string(), chunks[1].to_string())
    } else if has_cross {
        let chunks: Vec<&str> = right.split(" x ").map(str::trim).collect();
        if chunks.len() != 2 {
            return Err(ModelError::parse(format!(
                "expected exactly two sets in set cross product `{text}`"
            ))
            .with_line(line));
        }
        SetExpr::Cross(chunks[0].to_string(), chunks[1].to_string())
    } else {
        SetExpr::Explicit(explicit_elements(right))
    };

    Ok(ParsedStatement::SetDecl { name, expr })
}

fn parse_subset(text: &str, line: u32) -> Result<ParsedStatement, ModelError> {
    let (child, parent) = text.split_once(" of ").ok_or_else(|| {
        ModelError::parse(format!("expected `CHILD of PARENT`, got `{text}`")).with_line(line)
    })?;
    Ok(ParsedStatement::Subset {
        child: child.trim().to_string(),
        parent: parent.trim().to_string(),
    })
}

/// Split a `name : binds : body` header. The body keeps any colons of its
/// own (they can only occur inside square-bracket forms).
fn split_header(text: &str, line: u32) -> Result<(String, String, String), ModelError> {
    let mut parts = text.splitn(3, ':');
    let name = parts.next().map(str::trim).unwrap_or("");
    let binds = parts.next().map(str::trim);
    let body = parts.next().map(str::trim);
    match (binds, body) {
        (Some(binds), Some(body)) if !name.is_empty() => {
            Ok((name.to_string(), binds.to_string(), body.to_string()))
        }
        _ => Err(ModelError::parse(format!(
            "expected `name : bindings : body`, got `{text}`"
        ))
        .with_line(line)),
    }
}

/// Split `lhs = rhs` at the first assignment `=` at bracket depth zero,
/// skipping the comparison operators `==`, `!=`, `<=`, `>=`.
fn split_assignment(text: &str, line: u32) -> Result<(&str, &str), ModelError> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            b'=' if depth == 0 => {
                let part_of_cmp = (i > 0 && matches!(bytes[i - 1], b'=' | b'!' | b'<' | b'>'))
                    || (i + 1 < bytes.len() && bytes[i + 1] == b'=');
                if part_of_cmp {
                    if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                        i += 1;
                    }
                } else {
                    return Ok((&text[..i], &text[i + 1..]));
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(ModelError::parse(format!("expected `lhs = rhs`, got `{text}`")).with_line(line))
}

fn parse_assert(text: &str, line: u32) -> Result<ParsedStatement, ModelError> {
    let (name, binds, condition) = split_header(text, line)?;
    let (indices, sets) = parse_bindings(&binds, line)?;
    Ok(ParsedStatement::Assert {
        name,
        indices,
        sets,
        condition,
    })
}

fn parse_formula(text: &str, line: u32) -> Result<ParsedStatement, ModelError> {
    let mut rest = text.trim();
    let mut initial = false;
    if rest.starts_with('[') {
        let close = rest.find(']').ok_or_else(|| {
            ModelError::parse(format!("unterminated modifier block in `{rest}`"))
                .with_line(line)
        })?;
        for modifier in rest[1..close].split(',') {
            match modifier.trim().to_ascii_lowercase().as_str() {
                "initial" => initial = true,
                "" => {}
                other => {
                    return Err(ModelError::parse(format!(
                        "unexpected formula modifier `{other}`"
                    ))
                    .with_line(line));
                }
            }
        }
        rest = rest[close + 1..].trim_start();
    }

    let (name, binds, body) = split_header(rest, line)?;
    let (indices, sets) = parse_bindings(&binds, line)?;
    let (lhs, rhs) = split_assignment(&body, line)?;
    Ok(ParsedStatement::Formula {
        name,
        indices,
        sets,
        lhs: lhs.trim().to_string(),
        rhs: rhs.trim().to_string(),
        initial,
    })
}

fn parse_update(text: &str, line: u32) -> Result<ParsedStatement, ModelError> {
    let mut parts = text.splitn(4, ':');
    let name = parts.next().map(str::trim).unwrap_or("");
    let binds = parts.next().map(str::trim);
    let lhs = parts.next().map(str::trim);
    let rhs = parts.next().map(str::trim);
    match (binds, lhs, rhs) {
        (Some(binds), Some(lhs), Some(rhs)) if !name.is_empty() => {
            let (indices, sets) = parse_bindings(binds, line)?;
            Ok(ParsedStatement::Update {
                name: name.to_string(),
                indices,
                sets,
                lhs: lhs.to_string(),
                rhs: rhs.to_string(),
            })
        }
        _ => Err(ModelError::parse(format!(
            "expected `name : bindings : lhs : rhs`, got `{text}`"
        ))
        .with_line(line)),
    }
}

fn parse_equation(text: &str, line: u32) -> Result<ParsedStatement, ModelError> {
    let (name, binds, body) = split_header(text, line)?;
    let (indices, sets) = parse_bindings(&binds, line)?;
    let (lhs, rhs) = split_assignment(&body, line)?;
    Ok(ParsedStatement::Equation {
        name,
        indices,
        sets,
        lhs: lhs.trim().to_string(),
        rhs: rhs.trim().to_string(),
    })
}

fn parse_loopformulas(text: &str, line: u32) -> Result<ParsedStatement, ModelError> {
    let (name, iterations_text, list) = split_header(text, line)?;
    let iterations = iterations_text.trim().parse::<usize>().map_err(|_| {
        ModelError::parse(format!(
            "could not interpret `{}` as an iteration count in statement `{name}`",
            iterations_text.trim()
        ))
        .with_line(line)
    })?;
    let formulas = list
        .split(',')
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();
    Ok(ParsedStatement::LoopFormulas {
        name,
        iterations,
        formulas,
    })
}

fn parse_write(text: &str, line: u32) -> Result<ParsedStatement, ModelError> {
    let chunks: Vec<&str> = text.split_whitespace().collect();
    match chunks.as_slice() {
        [var, to, target] if to.eq_ignore_ascii_case("to") => {
            let (file, sheet) = target.split_once('.').ok_or_else(|| {
                ModelError::parse(format!(
                    "expected `SYMBOL.SHEET` in write target, got `{target}`"
                ))
                .with_line(line)
            })?;
            Ok(ParsedStatement::Write {
                var: var.to_string(),
                file: file.to_string(),
                sheet: sheet.to_string(),
            })
        }
        _ => Err(ModelError::parse(format!(
            "expected `write VAR to SYMBOL.SHEET`, got `{text}`"
        ))
        .with_line(line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(keyword: Keyword, text: &str) -> RawStatement {
        RawStatement {
            keyword,
            text: text.to_string(),
            line: 7,
        }
    }

    #[test]
    fn datavar_with_source_and_fixed() {
        let parsed =
            parse_statement(&raw(Keyword::DataVar, "[fixed] V_COM_REG from data.costs")).unwrap();
        assert_eq!(
            parsed,
            ParsedStatement::DataVar {
                name: "V".into(),
                sets: vec!["COM".into(), "REG".into()],
                table: Some(("data".into(), "costs".into())),
                fixed: true,
            }
        );
    }

    #[test]
    fn solvar_directives() {
        let parsed = parse_statement(&raw(Keyword::SolVar, "[change,linear] c_REG")).unwrap();
        assert_eq!(
            parsed,
            ParsedStatement::SolVar {
                name: "c".into(),
                sets: vec!["REG".into()],
                change: true,
                linear: true,
            }
        );
    }

    #[test]
    fn solvar_rejects_unknown_directive() {
        assert!(parse_statement(&raw(Keyword::SolVar, "[levels] c")).is_err());
    }

    #[test]
    fn set_forms() {
        let explicit = parse_statement(&raw(Keyword::Set, "I = (i1, i2, i3)")).unwrap();
        assert_eq!(
            explicit,
            ParsedStatement::SetDecl {
                name: "I".into(),
                expr: SetExpr::Explicit(vec!["i1".into(), "i2".into(), "i3".into()]),
            }
        );

        let union = parse_statement(&raw(Keyword::Set, "AB = A + B + (extra)")).unwrap();
        match union {
            ParsedStatement::SetDecl {
                expr: SetExpr::Union(operands),
                ..
            } => {
                assert_eq!(operands.len(), 3);
                assert_eq!(operands[2], SetOperand::Explicit(vec!["extra".into()]));
            }
            other => panic!("expected a union, got {other:?}"),
        }

        let diff = parse_statement(&raw(Keyword::Set, "C = A - B")).unwrap();
        assert_eq!(
            diff,
            ParsedStatement::SetDecl {
                name: "C".into(),
                expr: SetExpr::Difference("A".into(), "B".into()),
            }
        );

        let cross = parse_statement(&raw(Keyword::Set, "D = A x B")).unwrap();
        assert_eq!(
            cross,
            ParsedStatement::SetDecl {
                name: "D".into(),
                expr: SetExpr::Cross("A".into(), "B".into()),
            }
        );

        let from = parse_statement(&raw(Keyword::Set, "REG from data.regions")).unwrap();
        assert_eq!(
            from,
            ParsedStatement::SetDecl {
                name: "REG".into(),
                expr: SetExpr::FromTable {
                    file: "data".into(),
                    sheet: "regions".into()
                },
            }
        );
    }

    #[test]
    fn mixed_set_operators_are_rejected() {
        assert!(parse_statement(&raw(Keyword::Set, "E = A + B - C")).is_err());
    }

    #[test]
    fn equation_splits_at_the_assignment() {
        let parsed = parse_statement(&raw(
            Keyword::Equation,
            "e1 : i=I : [if : a_i == 0 : x_i] = y_i",
        ))
        .unwrap();
        match parsed {
            ParsedStatement::Equation { lhs, rhs, .. } => {
                assert_eq!(lhs, "[if : a_i == 0 : x_i]");
                assert_eq!(rhs, "y_i");
            }
            other => panic!("expected an equation, got {other:?}"),
        }
    }

    #[test]
    fn formula_modifier_and_bindings() {
        let parsed = parse_statement(&raw(
            Keyword::Formula,
            "[initial] f1 : i=I, j=J : X_i_j = W_i_j",
        ))
        .unwrap();
        match parsed {
            ParsedStatement::Formula {
                indices,
                sets,
                initial,
                ..
            } => {
                assert_eq!(indices, vec!["i".to_string(), "j".to_string()]);
                assert_eq!(sets, vec!["I".to_string(), "J".to_string()]);
                assert!(initial);
            }
            other => panic!("expected a formula, got {other:?}"),
        }
    }

    #[test]
    fn update_uses_colon_separated_lhs() {
        let parsed =
            parse_statement(&raw(Keyword::Update, "u1 : i=I : V_i : V_i * p_i")).unwrap();
        match parsed {
            ParsedStatement::Update { lhs, rhs, .. } => {
                assert_eq!(lhs, "V_i");
                assert_eq!(rhs, "V_i * p_i");
            }
            other => panic!("expected an update, got {other:?}"),
        }
    }

    #[test]
    fn loopformulas_and_write() {
        let looped =
            parse_statement(&raw(Keyword::LoopFormulas, "lp : 3 : f1, f2")).unwrap();
        assert_eq!(
            looped,
            ParsedStatement::LoopFormulas {
                name: "lp".into(),
                iterations: 3,
                formulas: vec!["f1".into(), "f2".into()],
            }
        );

        let write = parse_statement(&raw(Keyword::Write, "V to out.costs")).unwrap();
        assert_eq!(
            write,
            ParsedStatement::Write {
                var: "V".into(),
                file: "out".into(),
                sheet: "costs".into(),
            }
        );
    }
}
