//! Closure and shock files.
//!
//! One file per simulation step: lines of `add VAR`, `remove VAR` or
//! `shock VAR VALUE`, where `VAR` may qualify its set positions by subset
//! name or by quoted element. The resulting closure is an ordered map from
//! solution offset to `(shock, is-change)` — order matters because closure
//! rows follow equation rows in file order.

use tracing::warn;

use equilibra_common::ModelError;

use crate::sets::SetCatalog;
use crate::vars::{SolVars, index_tuples};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosureEntry {
    pub shock: f64,
    pub is_change: bool,
}

/// The exogenous partition for one step, in file order.
#[derive(Debug, Clone, Default)]
pub struct Closure {
    entries: Vec<(usize, ClosureEntry)>,
}

impl Closure {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(usize, ClosureEntry)] {
        &self.entries
    }

    fn contains(&self, offset: usize) -> bool {
        self.entries.iter().any(|(o, _)| *o == offset)
    }

    fn add(&mut self, offset: usize, is_change: bool) {
        let entry = ClosureEntry {
            shock: 0.0,
            is_change,
        };
        match self.entries.iter_mut().find(|(o, _)| *o == offset) {
            Some((_, existing)) => *existing = entry,
            None => self.entries.push((offset, entry)),
        }
    }

    fn remove(&mut self, offset: usize) {
        self.entries.retain(|(o, _)| *o != offset);
    }

    fn shock(&mut self, offset: usize, value: f64) {
        if let Some((_, entry)) = self.entries.iter_mut().find(|(o, _)| *o == offset) {
            entry.shock = value;
        }
    }
}

/// Interpret one step's closure text. `origin` names the file for
/// diagnostics.
pub fn read_closure(
    text: &str,
    origin: &str,
    catalog: &SetCatalog,
    solution: &SolVars,
) -> Result<Closure, ModelError> {
    let mut closure = Closure::default();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let words: Vec<&str> = trimmed.split_whitespace().collect();
        if words.len() < 2 {
            return Err(ModelError::parse(format!(
                "was expecting at least two words on line `{trimmed}` in {origin}"
            )));
        }

        let (var, offsets) = resolve_var(words[1], trimmed, origin, catalog, solution)?;

        match words[0].to_ascii_lowercase().as_str() {
            "add" => {
                if offsets.iter().any(|o| closure.contains(*o)) {
                    warn!(
                        "some elements of closure line `{trimmed}` in {origin} are \
                         already in the closure"
                    );
                }
                let is_change = solution.is_change(&var);
                for offset in offsets {
                    closure.add(offset, is_change);
                }
            }
            "remove" => {
                if let Some(missing) = offsets.iter().find(|o| !closure.contains(**o)) {
                    return Err(ModelError::consistency(format!(
                        "trying to remove offset {missing} that is not in the closure, \
                         line `{trimmed}` in {origin}"
                    )));
                }
                for offset in offsets {
                    closure.remove(offset);
                }
            }
            "shock" => {
                if let Some(missing) = offsets.iter().find(|o| !closure.contains(**o)) {
                    return Err(ModelError::consistency(format!(
                        "trying to shock offset {missing} that is not in the closure, \
                         line `{trimmed}` in {origin}"
                    )));
                }
                let value_text = words.get(2).ok_or_else(|| {
                    ModelError::parse(format!(
                        "shock line `{trimmed}` in {origin} names no value"
                    ))
                })?;
                let value: f64 = value_text.parse().map_err(|_| {
                    ModelError::parse(format!(
                        "could not interpret `{value_text}` as a shock value in {origin}"
                    ))
                })?;
                for offset in offsets {
                    closure.shock(offset, value);
                }
            }
            other => {
                return Err(ModelError::parse(format!(
                    "unknown closure keyword `{other}` on line `{trimmed}` in {origin}"
                )));
            }
        }
    }

    Ok(closure)
}

/// Resolve a `NAME[_Q]*` closure reference into the variable name and the
/// solution offsets it covers. Each `Q` is a set name, a subset name, or a
/// quoted element of the corresponding declared set.
fn resolve_var(
    token: &str,
    line: &str,
    origin: &str,
    catalog: &SetCatalog,
    solution: &SolVars,
) -> Result<(String, Vec<usize>), ModelError> {
    if !token.contains('_') {
        let offset = solution.table.offset(token).map_err(|_| {
            ModelError::consistency(format!(
                "unknown solution variable `{token}` on line `{line}` in {origin}"
            ))
        })?;
        let size = solution.table.size(token)?;
        return Ok((token.to_string(), (offset..offset + size).collect()));
    }

    let mut chunks = token.split('_');
    let name = chunks.next().unwrap_or_default().to_string();
    let quals: Vec<&str> = chunks.collect();

    let declared_sets = solution.table.sets_of(&name).map_err(|_| {
        ModelError::consistency(format!(
            "unknown solution variable `{name}` on line `{line}` in {origin}"
        ))
    })?;
    if quals.len() != declared_sets.len() {
        return Err(ModelError::consistency(format!(
            "`{token}` qualifies {} positions but `{name}` is declared over {} sets, \
             line `{line}` in {origin}",
            quals.len(),
            declared_sets.len()
        )));
    }

    // Per position: the candidate element positions in the variable's own
    // set coordinates.
    let mut position_lists = Vec::with_capacity(quals.len());
    for (dim, qual) in quals.iter().enumerate() {
        let own_set = &declared_sets[dim];
        if let Some(stripped) = qual.strip_prefix('"') {
            let element = stripped.strip_suffix('"').ok_or_else(|| {
                ModelError::parse(format!(
                    "expecting closing quote in `{qual}` on line `{line}` in {origin}"
                ))
            })?;
            let pos = catalog.get(own_set)?.position(element).ok_or_else(|| {
                ModelError::consistency(format!(
                    "element `{element}` is not in set `{own_set}`, line `{line}` in \
                     {origin}"
                ))
            })?;
            position_lists.push(vec![pos]);
        } else {
            let mapping = catalog.mapping(own_set, qual).ok_or_else(|| {
                ModelError::consistency(format!(
                    "unknown set `{qual}` on line `{line}` in {origin} - did you \
                     forget quotes?"
                ))
            })?;
            position_lists.push(mapping);
        }
    }

    // Cartesian product of the qualified position lists, rightmost fastest.
    let sizes: Vec<usize> = position_lists.iter().map(Vec::len).collect();
    let tuples: Vec<Vec<usize>> = index_tuples(&sizes)
        .into_iter()
        .map(|choice| {
            choice
                .iter()
                .enumerate()
                .map(|(dim, &pick)| position_lists[dim][pick])
                .collect()
        })
        .collect();

    let declared: Vec<String> = declared_sets.to_vec();
    let offsets = solution.table.indices(catalog, &name, &declared, &tuples)?;
    Ok((name, offsets))
}
