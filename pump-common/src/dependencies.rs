//! # Dependencies
//!
//! Module providing `DependencyGraph`, which orders configuration sections into validation levels.
use std::collections::{BTreeMap, BTreeSet};

use crate::error::DependencyError;

/// A set of sections that can be validated concurrently.
pub type Level = BTreeSet<String>;

/// Mapping from a section name to the names of the sections it depends on.
///
/// The graph is checked for unknown dependencies and cycles on construction, and its leveling is
/// computed once: it is immutable for the lifetime of a pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    dependencies: BTreeMap<String, BTreeSet<String>>,
    levels: Vec<Level>,
}

impl DependencyGraph {
    /// Build a graph from `(section, dependencies)` pairs.
    ///
    /// A section listing itself as a dependency is not a cycle: the self edge is dropped.
    pub fn new<I, S, D, T>(sections: I) -> Result<Self, DependencyError>
    where
        I: IntoIterator<Item = (S, D)>,
        S: Into<String>,
        D: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut dependencies = BTreeMap::new();
        for (section, deps) in sections {
            let section = section.into();
            let deps: BTreeSet<String> = deps
                .into_iter()
                .map(Into::into)
                .filter(|dep| *dep != section)
                .collect();
            dependencies
                .entry(section)
                .or_insert_with(BTreeSet::new)
                .extend(deps);
        }

        for (section, deps) in &dependencies {
            if let Some(unknown) = deps.iter().find(|dep| !dependencies.contains_key(*dep)) {
                return Err(DependencyError::UnknownDependency {
                    section: section.clone(),
                    dependency: unknown.clone(),
                });
            }
        }

        let levels = compute_levels(&dependencies)?;

        Ok(Self {
            dependencies,
            levels,
        })
    }

    /// All levels in dependency order. Every section appears in exactly one level and only depends on
    /// sections from earlier levels.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// The minimal sequence of levels to revalidate after `section` changes: `section` alone, followed
    /// by the subset of each later level that depends on something already marked for rerun.
    /// An unknown section yields no levels.
    pub fn level_subset(&self, section: &str) -> Vec<Level> {
        let mut to_recalculate: BTreeSet<&str> = BTreeSet::new();
        let mut subsets = Vec::new();
        let mut found = false;

        for level in &self.levels {
            if level.contains(section) {
                found = true;
                subsets = vec![Level::from([section.to_owned()])];
                to_recalculate.insert(section);
            } else if found {
                let recalc: Vec<&String> = level
                    .iter()
                    .filter(|candidate| {
                        self.dependencies[candidate.as_str()]
                            .iter()
                            .any(|dep| to_recalculate.contains(dep.as_str()))
                    })
                    .collect();

                if !recalc.is_empty() {
                    to_recalculate.extend(recalc.iter().map(|s| s.as_str()));
                    subsets.push(recalc.into_iter().cloned().collect());
                }
            }
        }

        subsets
    }

    /// The sections that `section` directly depends on.
    pub fn dependencies_of(&self, section: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(section)
    }

    /// Reverse mapping: for every section, the sections that list it as a direct dependency.
    pub fn dependents(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut dependents: BTreeMap<String, BTreeSet<String>> = self
            .dependencies
            .keys()
            .map(|section| (section.clone(), BTreeSet::new()))
            .collect();

        for (section, deps) in &self.dependencies {
            for dep in deps {
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(section.clone());
                }
            }
        }

        dependents
    }

    pub fn contains(&self, section: &str) -> bool {
        self.dependencies.contains_key(section)
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }
}

/// Kahn's algorithm, emitting every section whose remaining dependencies are satisfied as one level.
fn compute_levels(
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<Level>, DependencyError> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = dependencies
        .iter()
        .map(|(section, deps)| {
            (
                section.as_str(),
                deps.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let ready: Level = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(section, _)| (*section).to_owned())
            .collect();

        if ready.is_empty() {
            let stuck = remaining.keys().map(|s| (*s).to_owned()).collect();
            return Err(DependencyError::Cycle(stuck));
        }

        remaining.retain(|section, _| !ready.contains(*section));
        for deps in remaining.values_mut() {
            deps.retain(|dep| !ready.contains(*dep));
        }
        levels.push(ready);
    }

    Ok(levels)
}
