//! Conditional topology
//!
//! Three ways a graph's shape depends on build-time facts:
//!
//! - `ExclusiveBranches`: ordered alternatives, exactly one gets built
//! - `AdditiveBranches`: independent optional pieces, each feeding its own
//!   optional output
//! - `replicate`: one instance of a sub-structure per row of parallel lists
//!
//! Every decision is recorded in the graph so it can be inspected later.

use std::collections::BTreeMap;

use crate::builder::GraphBuilder;
use crate::error::{RegflowError, Result};
use crate::graph::{BranchKind, BranchRecord};
use crate::node::{Merge, NodeHandle};
use crate::types::{Artifact, PortRef};

type BuildFn<'a, T> = Box<dyn FnOnce(&mut GraphBuilder) -> Result<T> + 'a>;

/// Ordered alternatives; the first arm whose guard holds is built
///
/// ```ignore
/// let selected = ExclusiveBranches::new("mask_source")
///     .when("t1w_mask", flags.t1w_mask, |b| build_t1w_mask(b))
///     .when("probmap", flags.probmap, |b| build_probmap(b))
///     .otherwise(&mut builder, "precomputed", |b| build_precomputed(b))?;
/// ```
pub struct ExclusiveBranches<'a, T> {
    group: String,
    arms: Vec<(String, bool, BuildFn<'a, T>)>,
}

/// The arm that was built and what its build function returned
#[derive(Debug, Clone, PartialEq)]
pub struct Selected<T> {
    pub name: String,
    pub value: T,
}

impl<'a, T> ExclusiveBranches<'a, T> {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            arms: Vec::new(),
        }
    }

    /// Add a guarded alternative
    pub fn when(
        mut self,
        name: impl Into<String>,
        guard: bool,
        build: impl FnOnce(&mut GraphBuilder) -> Result<T> + 'a,
    ) -> Self {
        self.arms.push((name.into(), guard, Box::new(build)));
        self
    }

    /// Add the mandatory fallback and build the selected arm
    pub fn otherwise(
        self,
        builder: &mut GraphBuilder,
        name: impl Into<String>,
        build: impl FnOnce(&mut GraphBuilder) -> Result<T> + 'a,
    ) -> Result<Selected<T>> {
        let mut arms = self.arms;
        arms.push((name.into(), true, Box::new(build)));

        let chosen = arms.iter().position(|(_, guard, _)| *guard).unwrap_or(arms.len() - 1);
        let skipped = arms
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != chosen)
            .map(|(_, (name, _, _))| name.clone())
            .collect();

        let (name, _, build) = arms.swap_remove(chosen);
        let value = build(builder)?;
        builder.record_branch(BranchRecord {
            group: self.group,
            kind: BranchKind::Exclusive,
            taken: vec![name.clone()],
            skipped,
        });
        Ok(Selected { name, value })
    }
}

/// Outcome of an optional branch
#[derive(Debug, Clone, PartialEq)]
pub enum Branch<T> {
    Taken(T),
    NotTaken,
}

impl<T> Branch<T> {
    pub fn is_taken(&self) -> bool {
        matches!(self, Self::Taken(_))
    }

    pub fn taken(self) -> Option<T> {
        match self {
            Self::Taken(value) => Some(value),
            Self::NotTaken => None,
        }
    }
}

/// Independent optional pieces, each bound to its own optional output
pub struct AdditiveBranches {
    group: String,
    taken: Vec<String>,
    skipped: Vec<String>,
}

impl AdditiveBranches {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            taken: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Build the branch if `flag` holds
    ///
    /// An instantiated branch must connect the optional graph output
    /// `output`; a skipped one leaves it `NotTaken`.
    pub fn optional<T>(
        &mut self,
        builder: &mut GraphBuilder,
        name: impl Into<String>,
        flag: bool,
        output: &str,
        build: impl FnOnce(&mut GraphBuilder) -> Result<T>,
    ) -> Result<Branch<T>> {
        let name = name.into();
        if !flag {
            self.skipped.push(name);
            return Ok(Branch::NotTaken);
        }

        let value = build(builder)?;
        if !builder.is_connected(&builder.output(output)) {
            return Err(RegflowError::UnconnectedOutput {
                graph: builder.name().to_string(),
                output: output.to_string(),
            });
        }
        self.taken.push(name);
        Ok(Branch::Taken(value))
    }

    /// Record the decisions in the graph
    pub fn finish(self, builder: &mut GraphBuilder) {
        builder.record_branch(BranchRecord {
            group: self.group,
            kind: BranchKind::Additive,
            taken: self.taken,
            skipped: self.skipped,
        });
    }
}

/// Named columns of equal length
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParallelLists {
    columns: Vec<(String, Vec<Artifact>)>,
}

/// One row of `ParallelLists`
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub index: usize,
    values: BTreeMap<String, Artifact>,
}

impl Row {
    /// Value of a column in this row
    pub fn get(&self, column: &str) -> Option<&Artifact> {
        self.values.get(column)
    }

    /// String value of a column in this row
    pub fn text(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_str())
    }
}

impl ParallelLists {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column
    pub fn column(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = Artifact>,
    ) -> Self {
        self.columns.push((name.into(), values.into_iter().collect()));
        self
    }

    /// Number of rows; `ArityMismatch` when columns disagree
    pub fn len(&self) -> Result<usize> {
        let Some((_, first)) = self.columns.first() else {
            return Ok(0);
        };
        for (name, values) in &self.columns[1..] {
            if values.len() != first.len() {
                return Err(RegflowError::arity(
                    format!("parallel list '{name}'"),
                    first.len(),
                    values.len(),
                ));
            }
        }
        Ok(first.len())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.len(), Ok(0))
    }

    /// All rows in order
    pub fn rows(&self) -> Result<Vec<Row>> {
        let len = self.len()?;
        Ok((0..len)
            .map(|index| Row {
                index,
                values: self
                    .columns
                    .iter()
                    .map(|(name, values)| (name.clone(), values[index].clone()))
                    .collect(),
            })
            .collect())
    }
}

/// Instantiate a sub-structure once per row
///
/// Results come back in row order. Nothing is added when the lists
/// disagree in length.
pub fn replicate<T>(
    builder: &mut GraphBuilder,
    lists: &ParallelLists,
    mut build: impl FnMut(&mut GraphBuilder, &Row) -> Result<T>,
) -> Result<Vec<T>> {
    let rows = lists.rows()?;
    log::debug!("Graph '{}': replicating over {} rows", builder.name(), rows.len());
    rows.iter().map(|row| build(builder, row)).collect()
}

/// Gather ports into one list-valued port, in the given order
pub fn gather(builder: &mut GraphBuilder, name: &str, sources: &[PortRef]) -> Result<NodeHandle> {
    let merge = builder.add_node(Merge::node(name, sources.len()))?;
    for (i, source) in sources.iter().enumerate() {
        builder.connect(source.clone(), merge.input(&format!("in{}", i + 1)))?;
    }
    Ok(merge)
}
