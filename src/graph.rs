// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The graph contains a cycle. The path lists the participating
    /// nodes in visit order, ending where it started.
    #[error("dependency cycle detected: {path}")]
    Cycle { path: String },

    /// The node map and the dependency map were constructed over
    /// different key sets.
    #[error("graph keys mismatch: nodes without dependency entries {missing:?}, dependency entries without nodes {unknown:?}")]
    KeyMismatch {
        missing: Vec<String>,
        unknown: Vec<String>,
    },

    /// A dependency set names a node that does not exist.
    #[error("`{node}` depends on undeclared node `{dependency}`")]
    UnknownDependency { node: String, dependency: String },

    /// The queue still holds nodes but none of them is unblocked. This
    /// means a cycle survived graph construction.
    #[error("unable to make progress; remaining nodes are blocked: {path}")]
    Stuck { path: String },
}

/// A directed graph over named nodes, where an edge `a -> b` means
/// "a depends on b". Nodes keep their insertion order, which makes
/// traversals deterministic and lets unconstrained nodes come out in
/// declaration order.
#[derive(Debug, Clone)]
pub struct DepGraph<T> {
    nodes: IndexMap<Rc<str>, T>,
    deps: BTreeMap<Rc<str>, BTreeSet<Rc<str>>>,
}

impl<T> DepGraph<T> {
    /// Build a graph from a node map and a dependency map. The two key
    /// sets must be identical and every dependency must name a node.
    pub fn new(
        nodes: IndexMap<Rc<str>, T>,
        deps: BTreeMap<Rc<str>, BTreeSet<Rc<str>>>,
    ) -> Result<Self, GraphError> {
        let missing: Vec<String> = nodes
            .keys()
            .filter(|k| !deps.contains_key(*k))
            .map(|k| k.to_string())
            .collect();
        let unknown: Vec<String> = deps
            .keys()
            .filter(|k| !nodes.contains_key(*k))
            .map(|k| k.to_string())
            .collect();
        if !missing.is_empty() || !unknown.is_empty() {
            return Err(GraphError::KeyMismatch { missing, unknown });
        }
        for (node, dset) in deps.iter() {
            for dep in dset.iter() {
                if !nodes.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        node: node.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }
        Ok(Self { nodes, deps })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&T> {
        self.nodes.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.nodes.keys()
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, name: &str) -> Option<&BTreeSet<Rc<str>>> {
        self.deps.get(name)
    }

    /// Structure-preserving transform of node values.
    pub fn map<U>(&self, mut f: impl FnMut(&Rc<str>, &T) -> U) -> DepGraph<U> {
        DepGraph {
            nodes: self
                .nodes
                .iter()
                .map(|(k, v)| (k.clone(), f(k, v)))
                .collect(),
            deps: self.deps.clone(),
        }
    }

    /// Like [`DepGraph::map`], also handing each node its direct
    /// dependency names.
    pub fn map_with_edges<U>(
        &self,
        mut f: impl FnMut(&Rc<str>, &T, &BTreeSet<Rc<str>>) -> U,
    ) -> DepGraph<U> {
        let empty = BTreeSet::new();
        DepGraph {
            nodes: self
                .nodes
                .iter()
                .map(|(k, v)| {
                    let edges = self.deps.get(k).unwrap_or(&empty);
                    (k.clone(), f(k, v, edges))
                })
                .collect(),
            deps: self.deps.clone(),
        }
    }

    /// Transform each node given its already-transformed dependencies.
    /// Nodes are visited in topological order, so a node's dependencies
    /// have been transformed by the time it is. Fails on cycles.
    pub fn map_with_deps<U>(
        &self,
        mut f: impl FnMut(&Rc<str>, &T, &[(&Rc<str>, &U)]) -> U,
    ) -> Result<DepGraph<U>, GraphError> {
        let order = self.sorted()?;
        let mut mapped: BTreeMap<Rc<str>, U> = BTreeMap::new();
        for name in order.iter() {
            let mut given = vec![];
            if let (Some(dset), Some(node)) = (self.deps.get(name), self.nodes.get(name)) {
                for dep in dset.iter() {
                    if let Some(u) = mapped.get(dep) {
                        given.push((dep, u));
                    }
                }
                let u = f(name, node, &given);
                mapped.insert(name.clone(), u);
            }
        }
        let mut nodes = IndexMap::with_capacity(self.nodes.len());
        for name in self.nodes.keys() {
            if let Some(u) = mapped.remove(name) {
                nodes.insert(name.clone(), u);
            }
        }
        Ok(DepGraph {
            nodes,
            deps: self.deps.clone(),
        })
    }

    /// Induced subgraph over the given names. Dependencies on nodes
    /// outside the subgraph are dropped.
    pub fn restrict(&self, names: &BTreeSet<Rc<str>>) -> DepGraph<T>
    where
        T: Clone,
    {
        let nodes: IndexMap<Rc<str>, T> = self
            .nodes
            .iter()
            .filter(|(k, _)| names.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let deps = self
            .deps
            .iter()
            .filter(|(k, _)| names.contains(*k))
            .map(|(k, dset)| {
                let dset = dset
                    .iter()
                    .filter(|d| names.contains(*d))
                    .cloned()
                    .collect();
                (k.clone(), dset)
            })
            .collect();
        DepGraph { nodes, deps }
    }

    /// All nodes this node transitively depends on (not including
    /// itself, unless it participates in a cycle).
    pub fn upstream(&self, name: &str) -> BTreeSet<Rc<str>> {
        let mut out = BTreeSet::new();
        let mut pending: Vec<Rc<str>> = match self.deps.get(name) {
            Some(dset) => dset.iter().cloned().collect(),
            None => vec![],
        };
        while let Some(next) = pending.pop() {
            if out.insert(next.clone()) {
                if let Some(dset) = self.deps.get(&next) {
                    pending.extend(dset.iter().cloned());
                }
            }
        }
        out
    }

    /// All nodes that transitively depend on this node.
    pub fn downstream(&self, name: &str) -> BTreeSet<Rc<str>> {
        let mut out = BTreeSet::new();
        let mut pending = vec![Rc::from(name)];
        while let Some(next) = pending.pop() {
            for (node, dset) in self.deps.iter() {
                if dset.contains(&next) && out.insert(node.clone()) {
                    pending.push(node.clone());
                }
            }
        }
        out
    }

    /// Union of two graphs. Nodes present in both keep the value from
    /// `self`; dependency sets are unioned, never overwritten.
    pub fn merge(mut self, other: DepGraph<T>) -> DepGraph<T> {
        for (name, node) in other.nodes {
            self.nodes.entry(name).or_insert(node);
        }
        for (name, dset) in other.deps {
            self.deps.entry(name).or_default().extend(dset);
        }
        self
    }

    /// Remove a node and every edge pointing at it.
    pub fn remove_node(&mut self, name: &str) {
        self.nodes.shift_remove(name);
        self.deps.remove(name);
        for dset in self.deps.values_mut() {
            dset.remove(name);
        }
    }

    /// Topological order: every node appears after all of its
    /// dependencies. Depth-first, seeded in insertion order, so the
    /// result is deterministic. Fails with the ordered cycle path if
    /// the graph is cyclic.
    pub fn sorted(&self) -> Result<Vec<Rc<str>>, GraphError> {
        let mut done = BTreeSet::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut path = vec![];
        for name in self.nodes.keys() {
            self.visit(name, &mut done, &mut path, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        name: &Rc<str>,
        done: &mut BTreeSet<Rc<str>>,
        path: &mut Vec<Rc<str>>,
        order: &mut Vec<Rc<str>>,
    ) -> Result<(), GraphError> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(at) = path.iter().position(|p| p == name) {
            let mut cycle: Vec<String> = path[at..].iter().map(|p| p.to_string()).collect();
            cycle.push(name.to_string());
            return Err(GraphError::Cycle {
                path: cycle.join(" -> "),
            });
        }
        path.push(name.clone());
        if let Some(dset) = self.deps.get(name) {
            for dep in dset.iter() {
                self.visit(dep, done, path, order)?;
            }
        }
        path.pop();
        done.insert(name.clone());
        order.push(name.clone());
        Ok(())
    }

    // Find a cycle among the given nodes, ignoring edges that leave the
    // set. Used to reconstruct a useful error when the queue stalls.
    fn cycle_among(&self, allowed: &BTreeSet<Rc<str>>) -> Option<String> {
        let restricted = DepGraph {
            nodes: self
                .nodes
                .keys()
                .filter(|k| allowed.contains(*k))
                .map(|k| (k.clone(), ()))
                .collect(),
            deps: self
                .deps
                .iter()
                .filter(|(k, _)| allowed.contains(*k))
                .map(|(k, dset)| {
                    let dset = dset
                        .iter()
                        .filter(|d| allowed.contains(*d))
                        .cloned()
                        .collect();
                    (k.clone(), dset)
                })
                .collect(),
        };
        match restricted.sorted() {
            Err(GraphError::Cycle { path }) => Some(path),
            _ => None,
        }
    }

    /// Consume the graph as a topologically ordered queue.
    pub fn queue(self) -> TopoQueue<T> {
        TopoQueue {
            graph: self,
            taken: BTreeSet::new(),
        }
    }
}

/// Drains a [`DepGraph`] in dependency order. A node becomes available
/// exactly when every one of its dependencies has been completed;
/// callers must call [`TopoQueue::complete`] after processing a node to
/// unblock its dependents.
#[derive(Debug)]
pub struct TopoQueue<T> {
    graph: DepGraph<T>,
    taken: BTreeSet<Rc<str>>,
}

impl<T> TopoQueue<T> {
    /// True when every node has been taken.
    pub fn is_empty(&self) -> bool {
        self.graph.len() == self.taken.len()
    }

    pub fn node(&self, name: &str) -> Option<&T> {
        self.graph.node(name)
    }

    /// The next unblocked node, or `None` when the queue is drained. A
    /// non-empty queue with nothing unblocked means a cycle survived
    /// graph construction; that is a fatal error carrying the cycle.
    pub fn take(&mut self) -> Result<Option<Rc<str>>, GraphError> {
        if self.is_empty() {
            return Ok(None);
        }
        let next = self
            .graph
            .names()
            .find(|name| {
                !self.taken.contains(*name)
                    && self
                        .graph
                        .dependencies(name)
                        .is_some_and(|dset| dset.is_empty())
            })
            .cloned();
        match next {
            Some(name) => {
                self.taken.insert(name.clone());
                Ok(Some(name))
            }
            None => {
                let remaining: BTreeSet<Rc<str>> = self
                    .graph
                    .names()
                    .filter(|n| !self.taken.contains(*n))
                    .cloned()
                    .collect();
                let path = match self.graph.cycle_among(&remaining) {
                    Some(path) => path,
                    None => remaining
                        .iter()
                        .map(|n| n.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                };
                Err(GraphError::Stuck { path })
            }
        }
    }

    /// Mark a taken node as processed, unblocking its dependents.
    pub fn complete(&mut self, name: &str) {
        self.graph.remove_node(name);
        self.taken.remove(name);
    }

    /// Every node that is unblocked right now, in declaration order.
    pub fn peek(&self) -> Vec<Rc<str>> {
        self.graph
            .names()
            .filter(|name| {
                !self.taken.contains(*name)
                    && self
                        .graph
                        .dependencies(name)
                        .is_some_and(|dset| dset.is_empty())
            })
            .cloned()
            .collect()
    }

    /// Advance past a batch of nodes without processing them
    /// individually. Used when a consumer decides a whole batch is
    /// already materialized.
    pub fn skip(&mut self, names: &[Rc<str>]) {
        for name in names {
            self.taken.insert(name.clone());
            self.complete(name);
        }
    }
}
