//! Statement stream over a model file.
//!
//! The model file is a line stream: `#` starts a comment that runs to end
//! of line, statements begin with a reserved word and terminate with `;`.
//! A statement may span several lines, and several statements may share a
//! line. Each collected statement remembers the line it started on.

use equilibra_common::ModelError;

/// The reserved words a statement may begin with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    File,
    DataVar,
    SolVar,
    Set,
    Subset,
    Assert,
    Update,
    Equation,
    Formula,
    LoopFormulas,
    Write,
}

impl Keyword {
    pub fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "file" => Some(Self::File),
            "datavar" => Some(Self::DataVar),
            "solvar" => Some(Self::SolVar),
            "set" => Some(Self::Set),
            "subset" => Some(Self::Subset),
            "assert" => Some(Self::Assert),
            "update" => Some(Self::Update),
            "equation" => Some(Self::Equation),
            "formula" => Some(Self::Formula),
            "loopformulas" => Some(Self::LoopFormulas),
            "write" => Some(Self::Write),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::DataVar => "datavar",
            Self::SolVar => "solvar",
            Self::Set => "set",
            Self::Subset => "subset",
            Self::Assert => "assert",
            Self::Update => "update",
            Self::Equation => "equation",
            Self::Formula => "formula",
            Self::LoopFormulas => "loopformulas",
            Self::Write => "write",
        }
    }
}

/// One fully terminated statement: the leading keyword, the remaining text
/// (terminator stripped), and the line the statement started on.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStatement {
    pub keyword: Keyword,
    pub text: String,
    pub line: u32,
}

/// Split a model source into its statement sequence. `origin` names the
/// source in diagnostics (usually the file name).
pub fn split_statements(source: &str, origin: &str) -> Result<Vec<RawStatement>, ModelError> {
    let mut statements = Vec::new();
    let mut aggregated = String::new();
    let mut start_line = 0u32;
    let mut in_statement = false;

    for (number, raw_line) in source.lines().enumerate() {
        let line_number = number as u32 + 1;

        // Comments run from `#` to end of line.
        let mut working = match raw_line.find('#') {
            Some(pos) => raw_line[..pos].trim(),
            None => raw_line.trim(),
        };

        while !working.is_empty() {
            if !in_statement {
                let first_word = working.split_whitespace().next().unwrap_or("");
                if Keyword::parse(first_word).is_none() {
                    return Err(ModelError::parse(format!(
                        "{origin}: expected a statement keyword, instead encountered \
                         `{working}`"
                    ))
                    .with_line(line_number));
                }
                start_line = line_number;
                in_statement = true;
            }

            match working.find(';') {
                Some(pos) => {
                    aggregated.push_str(&working[..pos]);
                    statements.push(finish_statement(&aggregated, start_line, origin)?);
                    aggregated.clear();
                    in_statement = false;
                    working = working[pos + 1..].trim();
                }
                None => {
                    aggregated.push_str(working);
                    aggregated.push(' ');
                    working = "";
                }
            }
        }
    }

    if in_statement {
        return Err(ModelError::parse(format!(
            "{origin}: statement commencing on line {start_line} was not terminated \
             with a semicolon"
        ))
        .with_line(start_line));
    }

    Ok(statements)
}

fn finish_statement(
    aggregated: &str,
    start_line: u32,
    origin: &str,
) -> Result<RawStatement, ModelError> {
    let trimmed = aggregated.trim();
    let (word, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (trimmed, ""),
    };
    let keyword = Keyword::parse(word).ok_or_else(|| {
        ModelError::internal(format!(
            "{origin}: statement on line {start_line} lost its keyword `{word}`"
        ))
        .with_line(start_line)
    })?;
    Ok(RawStatement {
        keyword,
        text: rest.to_string(),
        line: start_line,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_statements() {
        let source = "set I = (i1, i2);\ndatavar x_I;\n";
        let stmts = split_statements(source, "test.model").unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].keyword, Keyword::Set);
        assert_eq!(stmts[0].text, "I = (i1, i2)");
        assert_eq!(stmts[1].keyword, Keyword::DataVar);
        assert_eq!(stmts[1].line, 2);
    }

    #[test]
    fn statement_spans_multiple_lines() {
        let source = "equation e1 : i=I :\n  x_i = a_i\n  + b_i;\n";
        let stmts = split_statements(source, "test.model").unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].line, 1);
        assert!(stmts[0].text.contains("+ b_i"));
    }

    #[test]
    fn several_statements_share_a_line() {
        let source = "set I = (i1); set J = (j1);\n";
        let stmts = split_statements(source, "test.model").unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1].line, 1);
    }

    #[test]
    fn comments_are_stripped() {
        let source = "# a header comment\nset I = (i1); # trailing\n";
        let stmts = split_statements(source, "test.model").unwrap();
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn unknown_keyword_names_the_line() {
        let source = "set I = (i1);\nbogus thing;\n";
        let err = split_statements(source, "test.model").unwrap_err();
        assert_eq!(err.context.line, Some(2));
    }

    #[test]
    fn unterminated_statement_names_its_start() {
        let source = "set I = (i1)\n";
        let err = split_statements(source, "test.model").unwrap_err();
        assert_eq!(err.context.line, Some(1));
    }
}
