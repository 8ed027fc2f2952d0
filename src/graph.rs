//! Dependency graph across all process descriptors.
//!
//! The graph is validated once, when the descriptor set is loaded: duplicate names, self
//! references, unknown dependencies and cycles are all rejected before any runtime state is
//! built. Afterwards it only answers ordering questions.
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::descriptor::ProcessDescriptor;
use crate::error::SupervisorError;

/// Validated, acyclic dependency relation keyed by process name.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    order: Vec<String>,
    dependencies: BTreeMap<String, Vec<String>>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Builds the graph, failing fast on any invalid reference or cycle.
    pub fn build(descriptors: &[ProcessDescriptor]) -> Result<Self, SupervisorError> {
        let mut dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for descriptor in descriptors {
            if dependencies
                .insert(descriptor.name.clone(), descriptor.depends_on.clone())
                .is_some()
            {
                return Err(SupervisorError::DuplicateProcess {
                    name: descriptor.name.clone(),
                });
            }
        }

        for (name, deps) in &dependencies {
            for dep in deps {
                if dep == name {
                    return Err(SupervisorError::SelfDependency {
                        process: name.clone(),
                    });
                }
                if !dependencies.contains_key(dep) {
                    return Err(SupervisorError::UnknownDependency {
                        process: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            return Err(SupervisorError::CyclicDependency {
                cycle: cycle.join(" -> "),
            });
        }

        let mut dependents: BTreeMap<String, Vec<String>> = dependencies
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        for (name, deps) in &dependencies {
            for dep in deps {
                if let Some(children) = dependents.get_mut(dep)
                    && !children.contains(name)
                {
                    children.push(name.clone());
                }
            }
        }

        let order = topological_order(&dependencies, &dependents);

        Ok(Self {
            order,
            dependencies,
            dependents,
        })
    }

    /// Process names ordered so that every process follows all of its dependencies.
    pub fn start_order(&self) -> &[String] {
        &self.order
    }

    /// Reverse of [`Self::start_order`]: dependents before their dependencies.
    pub fn stop_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    /// Direct dependencies of `name`.
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.dependencies.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Processes that directly depend on `name`.
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All direct and transitive dependents of `name`, in start order.
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);

        while let Some(current) = queue.pop_front() {
            for child in self.dependents(current) {
                if seen.insert(child.clone()) {
                    queue.push_back(child);
                }
            }
        }

        self.order
            .iter()
            .filter(|candidate| seen.contains(*candidate))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Kahn's algorithm; among simultaneously ready processes the alphabetical order wins so the
/// result is deterministic.
fn topological_order(
    dependencies: &BTreeMap<String, Vec<String>>,
    dependents: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    let mut remaining: HashMap<&str, usize> = dependencies
        .iter()
        .map(|(name, deps)| (name.as_str(), deps.len()))
        .collect();
    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        for child in dependents.get(name).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(child.as_str()) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(child.as_str());
                }
            }
        }
    }

    order
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search returning the first cycle found as `a -> b -> ... -> a`, where each
/// arrow points from a process to one of its dependencies.
fn find_cycle(dependencies: &BTreeMap<String, Vec<String>>) -> Option<Vec<String>> {
    fn visit<'a>(
        node: &'a str,
        dependencies: &'a BTreeMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|entry| *entry == node)?;
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|entry| entry.to_string()).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(node, Mark::Visiting);
        path.push(node);

        for dep in dependencies.get(node).into_iter().flatten() {
            if let Some(cycle) = visit(dep, dependencies, marks, path) {
                return Some(cycle);
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut path = Vec::new();
    for name in dependencies.keys() {
        if let Some(cycle) = visit(name, dependencies, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}
