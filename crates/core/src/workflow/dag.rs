use crate::error::{PipelineError, PipelineResult};
use crate::types::StepSpec;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Dependency graph of step specifications, built incrementally
#[derive(Default)]
pub struct PipelineDag {
    graph: DiGraph<StepSpec, ()>,
    step_indices: HashMap<String, NodeIndex>,
}

impl PipelineDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. Parents must already be registered; the graph is
    /// left untouched when the step is rejected.
    pub fn add_step(&mut self, mut spec: StepSpec) -> PipelineResult<()> {
        if spec.parents.iter().any(|p| p == &spec.name) {
            return Err(PipelineError::PipelineCycle { step: spec.name });
        }
        if self.step_indices.contains_key(&spec.name) {
            return Err(PipelineError::DuplicateStep(spec.name));
        }

        let mut parents = Vec::with_capacity(spec.parents.len());
        for parent in &spec.parents {
            let idx = self
                .step_indices
                .get(parent)
                .ok_or_else(|| PipelineError::UnknownParent {
                    step: spec.name.clone(),
                    parent: parent.clone(),
                })?;
            if !parents.contains(idx) {
                parents.push(*idx);
            }
        }

        // Keep the first occurrence of repeated parent names
        let mut seen = Vec::with_capacity(spec.parents.len());
        spec.parents.retain(|p| {
            let first = !seen.contains(p);
            seen.push(p.clone());
            first
        });

        let name = spec.name.clone();
        let node = self.graph.add_node(spec);
        for parent in parents {
            // Edge from dependency to dependent (parent -> step)
            self.graph.add_edge(parent, node, ());
        }

        if petgraph::algo::is_cyclic_directed(&self.graph) {
            // Last node added, so removal does not shift other indices
            self.graph.remove_node(node);
            return Err(PipelineError::PipelineCycle { step: name });
        }

        self.step_indices.insert(name, node);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.step_indices.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&StepSpec> {
        self.step_indices.get(name).map(|idx| &self.graph[*idx])
    }

    pub fn len(&self) -> usize {
        self.step_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_indices.is_empty()
    }

    /// Steps in topological order; ties are broken by insertion order
    pub fn topological_order(&self) -> Vec<StepSpec> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                let degree = self
                    .graph
                    .neighbors_directed(n, petgraph::Direction::Incoming)
                    .count();
                (n, degree)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(n, _)| Reverse(*n))
            .collect();

        let mut steps = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(node)) = ready.pop() {
            steps.push(self.graph[node].clone());
            for child in self
                .graph
                .neighbors_directed(node, petgraph::Direction::Outgoing)
            {
                if let Some(degree) = in_degree.get_mut(&child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(child));
                    }
                }
            }
        }

        steps
    }

    /// All steps reachable from `name`, excluding itself
    pub fn descendants(&self, name: &str) -> PipelineResult<Vec<String>> {
        let start = self.index_of(name)?;
        let mut dfs = Dfs::new(&self.graph, start);
        let mut names = Vec::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                names.push(self.graph[node].name.clone());
            }
        }
        Ok(names)
    }

    /// Get steps that depend directly on the given step
    pub fn dependents(&self, name: &str) -> PipelineResult<Vec<String>> {
        let node = self.index_of(name)?;
        Ok(self
            .graph
            .neighbors_directed(node, petgraph::Direction::Outgoing)
            .map(|n| self.graph[n].name.clone())
            .collect())
    }

    /// Get all steps with no parents
    pub fn entry_steps(&self) -> Vec<StepSpec> {
        self.topological_order()
            .into_iter()
            .filter(|spec| spec.parents.is_empty())
            .collect()
    }

    fn index_of(&self, name: &str) -> PipelineResult<NodeIndex> {
        self.step_indices
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::Config(format!("Step {} not found", name)))
    }
}
