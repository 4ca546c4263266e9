use super::StageRegistry;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle detected among stages: {}", names.join(", "))]
    DependencyCycle { names: Vec<String> },
}

/// Validated execution plan: a topological order over all registered
/// stages (parents strictly first, ties broken by registration order)
/// plus direct parent and child adjacency. Built once at setup, then
/// only read by the scheduler.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    order: Vec<String>,
    parents: BTreeMap<String, Vec<String>>,
    children: BTreeMap<String, Vec<String>>,
}

impl ExecutionPlan {
    pub fn build(registry: &StageRegistry) -> Result<Self, GraphError> {
        let stages = registry.stages();
        let position: BTreeMap<&str, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut parents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut in_degree: Vec<usize> = vec![0; stages.len()];

        for stage in stages {
            parents.entry(stage.name.clone()).or_default();
            children.entry(stage.name.clone()).or_default();
        }
        for (i, stage) in stages.iter().enumerate() {
            // Parent pointers are validated at registration; a forest
            // cannot cycle, but the check below still guards a future
            // multi-parent extension.
            if let Some(parent) = &stage.parent {
                if let Some(list) = parents.get_mut(&stage.name) {
                    list.push(parent.clone());
                }
                if let Some(list) = children.get_mut(parent.as_str()) {
                    list.push(stage.name.clone());
                }
                in_degree[i] += 1;
            }
        }

        let mut order = Vec::with_capacity(stages.len());
        let mut remaining = in_degree;
        let mut placed = vec![false; stages.len()];

        while order.len() < stages.len() {
            // Lowest registration index among ready stages keeps the
            // order deterministic for the same registration sequence.
            let next = remaining
                .iter()
                .enumerate()
                .find(|(i, degree)| !placed[*i] && **degree == 0)
                .map(|(i, _)| i);
            let Some(next) = next else {
                let names = stages
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !placed[*i])
                    .map(|(_, s)| s.name.clone())
                    .collect();
                return Err(GraphError::DependencyCycle { names });
            };

            placed[next] = true;
            order.push(stages[next].name.clone());
            for child in &children[&stages[next].name] {
                remaining[position[child.as_str()]] -= 1;
            }
        }

        Ok(Self {
            order,
            parents,
            children,
        })
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn parents_of(&self, name: &str) -> &[String] {
        self.parents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn children_of(&self, name: &str) -> &[String] {
        self.children.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All transitive children, used for abort propagation.
    pub fn descendants_of(&self, name: &str) -> Vec<String> {
        let mut queue: Vec<&str> = self.children_of(name).iter().map(String::as_str).collect();
        let mut seen: Vec<String> = Vec::new();
        while let Some(current) = queue.pop() {
            if seen.iter().any(|s| s == current) {
                continue;
            }
            seen.push(current.to_string());
            queue.extend(self.children_of(current).iter().map(String::as_str));
        }
        // Keep deterministic topological presentation.
        let mut ordered: Vec<String> = self
            .order
            .iter()
            .filter(|stage| seen.iter().any(|s| s == *stage))
            .cloned()
            .collect();
        ordered.dedup();
        ordered
    }
}
