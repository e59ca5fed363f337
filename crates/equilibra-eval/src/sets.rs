//! Ordered named index sets and the catalog of subset relations.
//!
//! Element position is semantically meaningful: dense variable offsets are
//! computed from it. Subset relations are recorded as `(super, sub,
//! mapping)` triples where the mapping holds the ordered positions of the
//! subset's elements inside the superset, and the relation list is kept
//! transitively closed on every assertion.

use rustc_hash::FxHashMap;

use equilibra_common::ModelError;

/// A named, ordered sequence of string elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSet {
    pub name: String,
    pub elements: Vec<String>,
}

impl IndexSet {
    pub fn new<S: Into<String>>(name: S, elements: Vec<String>) -> Self {
        Self {
            name: name.into(),
            elements,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn position(&self, element: &str) -> Option<usize> {
        self.elements.iter().position(|e| e == element)
    }

    /// True if every element of `self` appears in `other`.
    pub fn is_contained_in(&self, other: &IndexSet) -> bool {
        self.elements
            .iter()
            .all(|e| other.elements.contains(e))
    }

    /// The ordered positions of `self`'s elements inside `other`. Fails
    /// unless `self` is element-wise contained in `other`.
    pub fn map_into(&self, other: &IndexSet) -> Result<Vec<usize>, ModelError> {
        let mut mapping = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            let pos = other.position(element).ok_or_else(|| {
                ModelError::consistency(format!(
                    "cannot map set `{}` into `{}`: element `{element}` is missing \
                     from `{}`",
                    self.name, other.name, other.name
                ))
            })?;
            mapping.push(pos);
        }
        Ok(mapping)
    }
}

/// A recorded subset relation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Relation {
    superset: String,
    subset: String,
    positions: Vec<usize>,
}

/// The catalog of every set the model declares, plus the transitively
/// closed list of subset relations between them.
#[derive(Debug, Default)]
pub struct SetCatalog {
    sets: FxHashMap<String, IndexSet>,
    order: Vec<String>,
    relations: Vec<Relation>,
}

impl SetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sets.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&IndexSet, ModelError> {
        self.sets
            .get(name)
            .ok_or_else(|| ModelError::consistency(format!("unknown set `{name}`")))
    }

    pub fn size(&self, name: &str) -> Result<usize, ModelError> {
        Ok(self.get(name)?.len())
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn new_set<S: Into<String>>(
        &mut self,
        name: S,
        elements: Vec<String>,
    ) -> Result<(), ModelError> {
        let name = name.into();
        if self.sets.contains_key(&name) {
            return Err(ModelError::consistency(format!(
                "attempting to add a duplicate set name `{name}`"
            )));
        }
        self.order.push(name.clone());
        self.sets.insert(name.clone(), IndexSet::new(name, elements));
        Ok(())
    }

    /// Remove a set and every relation that refers to it.
    pub fn delete(&mut self, name: &str) -> Result<(), ModelError> {
        if self.sets.remove(name).is_none() {
            return Err(ModelError::consistency(format!(
                "error deleting set: `{name}` is not a known set"
            )));
        }
        self.order.retain(|n| n != name);
        self.relations
            .retain(|r| r.superset != name && r.subset != name);
        Ok(())
    }

    /// Record `child ⊆ parent` and recompute all transitive consequences.
    pub fn subset_of(&mut self, child: &str, parent: &str) -> Result<(), ModelError> {
        let child_set = self.get(child)?.clone();
        let parent_set = self.get(parent)?.clone();
        let positions = child_set.map_into(&parent_set)?;
        self.insert_relation(Relation {
            superset: parent.to_string(),
            subset: child.to_string(),
            positions,
        })?;
        self.close()
    }

    fn insert_relation(&mut self, relation: Relation) -> Result<(), ModelError> {
        if let Some(existing) = self
            .relations
            .iter()
            .find(|r| r.superset == relation.superset && r.subset == relation.subset)
        {
            if existing.positions == relation.positions {
                return Ok(());
            }
            return Err(ModelError::consistency(format!(
                "mapping collision: ({}, {}, {:?}) is inconsistent with the recorded \
                 entry ({}, {}, {:?})",
                relation.superset,
                relation.subset,
                relation.positions,
                existing.superset,
                existing.subset,
                existing.positions,
            )));
        }
        self.relations.push(relation);
        Ok(())
    }

    /// Saturate the relation list: for every pair `(A ⊇ B, B ⊇ C)` ensure
    /// `(A ⊇ C)` with the composed mapping, until a fixpoint is reached.
    fn close(&mut self) -> Result<(), ModelError> {
        loop {
            let mut synthesised = Vec::new();
            for upper in &self.relations {
                for lower in &self.relations {
                    if upper.subset != lower.superset {
                        continue;
                    }
                    if self
                        .relations
                        .iter()
                        .any(|r| r.superset == upper.superset && r.subset == lower.subset)
                    {
                        continue;
                    }
                    let composed = lower
                        .positions
                        .iter()
                        .map(|&j| upper.positions[j])
                        .collect();
                    synthesised.push(Relation {
                        superset: upper.superset.clone(),
                        subset: lower.subset.clone(),
                        positions: composed,
                    });
                }
            }
            if synthesised.is_empty() {
                return Ok(());
            }
            for relation in synthesised {
                self.insert_relation(relation)?;
            }
        }
    }

    /// The positions of `subset`'s elements inside `superset`, if the pair
    /// is equal or recorded. Callers decide whether `None` is fatal.
    pub fn mapping(&self, superset: &str, subset: &str) -> Option<Vec<usize>> {
        if superset == subset {
            let set = self.sets.get(superset)?;
            return Some((0..set.len()).collect());
        }
        self.relations
            .iter()
            .find(|r| r.superset == superset && r.subset == subset)
            .map(|r| r.positions.clone())
    }

    /// Disjoint union. Duplicate elements across the operands are a hard
    /// error; each operand is recorded as a subset of the result.
    pub fn union(&mut self, operands: &[String], new_name: &str) -> Result<(), ModelError> {
        let mut elements: Vec<String> = Vec::new();
        for operand in operands {
            let set = self.get(operand)?;
            for element in &set.elements {
                if elements.contains(element) {
                    return Err(ModelError::consistency(format!(
                        "duplicate element `{element}` in set union `{new_name}`: \
                         a sum of sets must be disjoint"
                    )));
                }
                elements.push(element.clone());
            }
        }
        self.new_set(new_name, elements)?;
        for operand in operands.to_vec() {
            self.subset_of(&operand, new_name)?;
        }
        Ok(())
    }

    /// Set difference; the right operand must be contained in the left.
    /// The result is recorded as a subset of the left operand.
    pub fn difference(
        &mut self,
        superset: &str,
        subset: &str,
        new_name: &str,
    ) -> Result<(), ModelError> {
        let sup = self.get(superset)?.clone();
        let sub = self.get(subset)?;
        if !sub.is_contained_in(&sup) {
            return Err(ModelError::consistency(format!(
                "difference of sets impossible: `{subset}` is not a subset of `{superset}`"
            )));
        }
        let elements = sup
            .elements
            .iter()
            .filter(|e| !sub.elements.contains(e))
            .cloned()
            .collect();
        self.new_set(new_name, elements)?;
        self.subset_of(new_name, superset)
    }

    /// Cross product by element concatenation; duplicate concatenated
    /// pairs are a hard error.
    pub fn cross(&mut self, left: &str, right: &str, new_name: &str) -> Result<(), ModelError> {
        let a = self.get(left)?;
        let b = self.get(right)?;
        let mut elements = Vec::with_capacity(a.len() * b.len());
        for i in &a.elements {
            for j in &b.elements {
                let pair = format!("{i}{j}");
                if elements.contains(&pair) {
                    return Err(ModelError::consistency(format!(
                        "cross product of `{left}` and `{right}` produces the duplicate \
                         element `{pair}`"
                    )));
                }
                elements.push(pair);
            }
        }
        self.new_set(new_name, elements)
    }

    /// Sizes of every set, keyed by name.
    pub fn sizes(&self) -> FxHashMap<String, usize> {
        self.sets
            .iter()
            .map(|(name, set)| (name.clone(), set.len()))
            .collect()
    }
}
