use std::collections::{HashMap, VecDeque};

use maestro_core::{EngineError, ResourceRequirements, StageId, StageSpec};

/// Validated dependency graph over a workflow's stages.
///
/// Stages are addressed by their declaration index; every adjacency list is
/// sorted so iteration follows declaration order.
#[derive(Clone, Debug)]
pub struct StageGraph {
    ids: Vec<StageId>,
    index: HashMap<StageId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    levels: Vec<Vec<usize>>,
}

impl StageGraph {
    /// Build the graph, rejecting empty workflows, duplicate stage ids,
    /// dangling dependencies and cycles.
    pub fn build(stages: &[StageSpec]) -> Result<Self, EngineError> {
        if stages.is_empty() {
            return Err(EngineError::validation("workflow has no stages"));
        }

        let mut index = HashMap::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            if index.insert(stage.id.clone(), i).is_some() {
                return Err(EngineError::validation(format!("duplicate stage id {}", stage.id)));
            }
        }

        let mut dependencies = vec![Vec::new(); stages.len()];
        let mut dependents = vec![Vec::new(); stages.len()];
        for (i, stage) in stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(EngineError::validation(format!(
                        "stage {} depends on unknown stage {dep}",
                        stage.id
                    )));
                };
                if d == i {
                    return Err(EngineError::validation(format!(
                        "stage {} depends on itself",
                        stage.id
                    )));
                }
                if !dependencies[i].contains(&d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }
        for list in dependencies.iter_mut().chain(dependents.iter_mut()) {
            list.sort_unstable();
        }

        let levels = layer(&dependencies, &dependents).map_err(|stuck| {
            let names: Vec<String> = stuck.iter().map(|&i| stages[i].id.to_string()).collect();
            EngineError::validation(format!(
                "dependency cycle among stages: {}",
                names.join(", ")
            ))
        })?;

        Ok(Self {
            ids: stages.iter().map(|s| s.id.clone()).collect(),
            index,
            dependencies,
            dependents,
            levels,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn index_of(&self, id: &StageId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Topological layers: every stage sits one level below its deepest
    /// dependency.
    pub fn levels(&self) -> Vec<Vec<StageId>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|&i| self.ids[i].clone()).collect())
            .collect()
    }

    /// Every stage reachable through dependents, in declaration order.
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut queue: VecDeque<usize> = self.dependents[index].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if !std::mem::replace(&mut seen[next], true) {
                queue.extend(self.dependents[next].iter().copied());
            }
        }
        (0..self.len()).filter(|&i| seen[i]).collect()
    }

    /// Combined requirement of each level, shallowest first.
    pub fn level_requirements(&self, stages: &[StageSpec]) -> Vec<ResourceRequirements> {
        self.levels
            .iter()
            .map(|level| {
                level
                    .iter()
                    .fold(ResourceRequirements::ZERO, |acc, &i| acc.saturating_add(stages[i].resources))
            })
            .collect()
    }
}

/// Kahn's algorithm by levels. On a cycle, returns the stages that never
/// became ready.
fn layer(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Result<Vec<Vec<usize>>, Vec<usize>> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut current: Vec<usize> = (0..in_degree.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut levels = Vec::new();
    let mut placed = 0;

    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &i in &current {
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    next.push(d);
                }
            }
        }
        next.sort_unstable();
        levels.push(std::mem::replace(&mut current, next));
    }

    if placed == in_degree.len() {
        Ok(levels)
    } else {
        Err((0..in_degree.len()).filter(|&i| in_degree[i] > 0).collect())
    }
}
