//! The plan a planner worker produces: a DAG of tasks plus execution
//! ordering, validated before anything is spawned.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Error types for plan validation
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(String),

    #[error("Task '{0}' depends on unknown task '{1}'")]
    UnknownDependency(String, String),

    #[error("Dependency cycle involving tasks: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("Plan contains no tasks")]
    Empty,
}

/// Rough task size, as estimated by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Default for Complexity {
    fn default() -> Self {
        Complexity::Medium
    }
}

/// One planned unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub estimated_complexity: Complexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_url: Option<String>,
}

/// The planner's full output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub summary: String,
    pub tasks: Vec<PlannedTask>,

    /// Topological groups of task ids. Optional in the planner's file; a
    /// missing or invalid ordering is recomputed from the dependency graph.
    #[serde(default)]
    pub execution_order: Vec<Vec<String>>,

    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl PlanSpec {
    /// Rejects duplicate ids, dangling dependencies, and cycles.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.tasks.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(PlanError::DuplicateTaskId(task.id.clone()));
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency(task.id.clone(), dep.clone()));
                }
            }
        }

        self.layers()?;
        Ok(())
    }

    pub fn task(&self, task_id: &str) -> Option<&PlannedTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Topological layers via Kahn's algorithm: every task in layer `k`
    /// depends only on tasks in layers `< k`. Within a layer, tasks keep
    /// plan order.
    pub fn layers(&self) -> Result<Vec<Vec<String>>, PlanError> {
        let ids: Vec<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut in_degree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let Some(&j) = index.get(dep.as_str()) else {
                    return Err(PlanError::UnknownDependency(task.id.clone(), dep.clone()));
                };
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }

        let mut frontier: VecDeque<usize> = (0..self.tasks.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();

        let mut layers = Vec::new();
        let mut placed = 0usize;
        while !frontier.is_empty() {
            let layer: Vec<usize> = frontier.drain(..).collect();
            let mut next = Vec::new();
            for &i in &layer {
                placed += 1;
                for &dependent in &dependents[i] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            layers.push(layer.into_iter().map(|i| ids[i].to_string()).collect());
            next.sort_unstable();
            frontier.extend(next);
        }

        if placed != self.tasks.len() {
            let cycle: Vec<String> = (0..self.tasks.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| ids[i].to_string())
                .collect();
            return Err(PlanError::DependencyCycle(cycle));
        }

        Ok(layers)
    }

    /// The planner-provided execution order when it covers every task
    /// exactly once, otherwise the recomputed layering.
    pub fn execution_layers(&self) -> Result<Vec<Vec<String>>, PlanError> {
        let computed = self.layers()?;

        let provided: Vec<&String> = self.execution_order.iter().flatten().collect();
        let all: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        let provided_set: HashSet<&str> = provided.iter().map(|s| s.as_str()).collect();

        if provided.len() == all.len() && provided_set == all {
            Ok(self.execution_order.clone())
        } else {
            Ok(computed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn task(id: &str, deps: &[&str]) -> PlannedTask {
        PlannedTask {
            id: id.to_string(),
            title: format!("task {}", id),
            description: String::new(),
            files: Vec::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            priority: 0,
            estimated_complexity: Complexity::Medium,
            issue_url: None,
        }
    }

    fn plan(tasks: Vec<PlannedTask>) -> PlanSpec {
        PlanSpec {
            id: "plan-1".to_string(),
            summary: "test plan".to_string(),
            tasks,
            execution_order: Vec::new(),
            insights: Vec::new(),
            constraints: Vec::new(),
        }
    }

    #[test]
    fn test_layers_linear_chain() {
        let p = plan(vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])]);
        assert_eq!(
            p.layers().unwrap(),
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
    }

    #[test]
    fn test_layers_diamond() {
        let p = plan(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ]);
        let layers = p.layers().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec!["a"]);
        assert_eq!(layers[1], vec!["b", "c"]);
        assert_eq!(layers[2], vec!["d"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let p = plan(vec![task("a", &["b"]), task("b", &["a"])]);
        assert!(matches!(p.validate(), Err(PlanError::DependencyCycle(_))));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let p = plan(vec![task("a", &["ghost"])]);
        assert!(matches!(
            p.validate(),
            Err(PlanError::UnknownDependency(_, _))
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let p = plan(vec![task("a", &[]), task("a", &[])]);
        assert!(matches!(p.validate(), Err(PlanError::DuplicateTaskId(_))));
    }

    #[test]
    fn test_empty_plan_rejected() {
        let p = plan(vec![]);
        assert!(matches!(p.validate(), Err(PlanError::Empty)));
    }

    #[test]
    fn test_execution_layers_prefers_valid_planner_order() {
        let mut p = plan(vec![task("a", &[]), task("b", &[])]);
        p.execution_order = vec![vec!["b".to_string()], vec!["a".to_string()]];
        assert_eq!(
            p.execution_layers().unwrap(),
            vec![vec!["b".to_string()], vec!["a".to_string()]]
        );
    }

    #[test]
    fn test_execution_layers_recomputes_incomplete_order() {
        let mut p = plan(vec![task("a", &[]), task("b", &["a"])]);
        p.execution_order = vec![vec!["a".to_string()]];
        assert_eq!(
            p.execution_layers().unwrap(),
            vec![vec!["a".to_string()], vec!["b".to_string()]]
        );
    }

    #[test]
    fn test_plan_parses_from_planner_json() {
        let raw = r#"{
            "id": "plan-x",
            "summary": "rename foo to bar",
            "tasks": [
                {"id": "A", "title": "rename in core"},
                {"id": "B", "title": "rename in docs", "depends_on": ["A"],
                 "estimated_complexity": "low", "files": ["README.md"]}
            ],
            "unknown_field": true
        }"#;
        let p: PlanSpec = serde_json::from_str(raw).unwrap();
        p.validate().unwrap();
        assert_eq!(p.tasks[1].estimated_complexity, Complexity::Low);
        assert_eq!(p.layers().unwrap().len(), 2);
    }
}
