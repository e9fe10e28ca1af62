pub mod expression;
pub mod nodes;
pub mod reference;


use expression::{Evaluated, Value};
use itertools::Itertools;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Parameters {} form a dependency cycle", .names.join(", "))]
    Cycle { names: Vec<String> },
}

/// Ordered mapping of parameter name -> raw expression text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterTable {
    entries: Vec<(String, String)>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// insert a parameter, redefinitions keep the original position
    pub fn insert(&mut self, name: impl Into<String>, raw: impl Into<String>) {
        let (name, raw) = (name.into(), raw.into());

        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = raw,
            None => self.entries.push((name, raw)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, raw)| raw.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, raw)| (name.as_str(), raw.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, R: Into<String>> FromIterator<(N, R)> for ParameterTable {
    fn from_iter<T: IntoIterator<Item = (N, R)>>(iter: T) -> Self {
        let mut table = Self::new();
        iter.into_iter()
            .for_each(|(name, raw)| table.insert(name, raw));

        table
    }
}

/// Constants known to one benchmark configuration.
///
/// Resolution calls on the same context accumulate: resolving the benchmark
/// and afterwards the platform lets platform expressions use benchmark values.
/// A context belongs to exactly one benchmark, it is never shared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterContext {
    constants: BTreeMap<String, Value>,
}

impl ParameterContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constants.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.constants.insert(name.into(), value);
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.constants.iter()
    }

    fn remove(&mut self, name: &str) -> Option<Value> {
        self.constants.remove(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// no references, known right away
    Constant,
    /// only references parameters that can be resolved here
    Variable,
    /// (transitively) references something neither the table nor the context defines
    External,
}

/// Classify every parameter of `table`, in table order.
///
/// A reference is internal if the table or the context defines the name.
/// Parameters referencing an external parameter become external as well.
pub fn classify<'a>(
    table: &'a ParameterTable,
    context: &ParameterContext,
) -> Vec<(&'a str, Classification)> {
    let references = table
        .iter()
        .map(|(name, raw)| (name, reference::references(raw)))
        .collect_vec();

    let mut external: BTreeMap<&str, bool> = references
        .iter()
        .map(|(name, refs)| {
            let is_external = refs
                .iter()
                .any(|target| !table.contains(target) && !context.contains(target));

            (*name, is_external)
        })
        .collect();

    // propagate until nothing changes
    let mut changed = true;
    while changed {
        changed = false;

        for (name, refs) in references.iter() {
            if external[name] {
                continue;
            }

            if refs
                .iter()
                .any(|target| external.get(target).copied().unwrap_or(false))
            {
                external.insert(*name, true);
                changed = true;
            }
        }
    }

    references
        .iter()
        .map(|(name, refs)| {
            let class = if external[name] {
                Classification::External
            } else if refs.is_empty() {
                Classification::Constant
            } else {
                Classification::Variable
            };

            (*name, class)
        })
        .collect()
}

/// Result of running one expression against the known constants
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// every reference was substituted and evaluation was attempted
    Complete(Evaluated),
    /// some references are still unknown, the rest are substituted
    Partial(String),
}

pub fn resolve_expression(raw: &str, context: &ParameterContext) -> Resolved {
    let substituted =
        reference::substitute(raw, |name| context.get(name).map(ToString::to_string));

    if reference::has_references(&substituted) {
        Resolved::Partial(substituted)
    } else {
        Resolved::Complete(expression::evaluate_or_verbatim(&reference::unescape(
            &substituted,
        )))
    }
}

/// Resolve `table` into ordered (name, value) pairs, extending `context`.
///
/// Constants come first in table order, followed by variables in the order
/// they become resolvable. External parameters are left out entirely. Names
/// defined by `table` shadow older context entries.
pub fn resolve_parameters(
    table: &ParameterTable,
    context: &mut ParameterContext,
) -> Result<Vec<(String, String)>, ResolveError> {
    let classes = classify(table, context);

    for name in table.names() {
        if context.remove(name).is_some() {
            trace!(parameter = name, "Shadowing previously resolved constant");
        }
    }

    let mut resolved = Vec::with_capacity(table.len());
    let mut pending = Vec::new();

    for ((name, raw), (_, class)) in table.iter().zip(classes) {
        match class {
            Classification::External => {
                debug!(parameter = name, "Dropping parameter with external reference");
            }
            Classification::Constant => {
                let value = reference::unescape(raw);

                context.insert(name, Value::Str(value.clone()));
                resolved.push((name.to_owned(), value));
            }
            Classification::Variable => pending.push((name, raw)),
        }
    }

    while !pending.is_empty() {
        let before = pending.len();

        pending.retain(|(name, raw)| match resolve_expression(raw, context) {
            Resolved::Complete(evaluated) => {
                if let Evaluated::Verbatim(text) = &evaluated {
                    trace!(parameter = name, text = %text, "Keeping substituted text verbatim");
                }

                let value = evaluated.into_value();
                resolved.push((name.to_string(), value.to_string()));
                context.insert(*name, value);

                false
            }
            Resolved::Partial(_) => true,
        });

        if pending.len() == before {
            return Err(ResolveError::Cycle {
                names: pending.iter().map(|(name, _)| name.to_string()).collect(),
            });
        }
    }

    Ok(resolved)
}

/// merge resolved pairs, later definitions replace earlier ones in place
pub fn merge_resolved(into: &mut Vec<(String, String)>, from: Vec<(String, String)>) {
    for (name, value) in from {
        match into.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => into.push((name, value)),
        }
    }
}
