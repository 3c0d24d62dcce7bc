//! 任务依赖图
//!
//! arena + index：任务存放在 Vec 中，依赖关系为下标集合。
//! 构建时校验 id、依赖与无环（Kahn 入度算法），执行时按拓扑批次推进。

use std::collections::{BTreeMap, BTreeSet};

use crate::workflow::types::{PlanningError, Task, TaskId};

/// 一轮规划的任务 DAG
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    /// 本图内的依赖下标
    deps: Vec<BTreeSet<usize>>,
    /// 依赖该任务的下游下标
    dependents: Vec<BTreeSet<usize>>,
    batches: Vec<Vec<usize>>,
}

impl TaskGraph {
    /// 校验并构建；prior_ids 为更早轮次已执行的任务，视为已满足的依赖
    pub fn new(tasks: Vec<Task>, prior_ids: &BTreeSet<TaskId>) -> Result<Self, PlanningError> {
        let mut index = BTreeMap::new();
        for (i, task) in tasks.iter().enumerate() {
            if task.id.trim().is_empty() {
                return Err(PlanningError::EmptyTaskId);
            }
            if index.insert(task.id.clone(), i).is_some() || prior_ids.contains(&task.id) {
                return Err(PlanningError::DuplicateTask(task.id.clone()));
            }
        }

        let mut deps = vec![BTreeSet::new(); tasks.len()];
        let mut dependents = vec![BTreeSet::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.depends_on {
                if dep == &task.id {
                    return Err(PlanningError::SelfDependency(task.id.clone()));
                }
                match index.get(dep) {
                    Some(&j) => {
                        deps[i].insert(j);
                        dependents[j].insert(i);
                    }
                    None if prior_ids.contains(dep) => {}
                    None => {
                        return Err(PlanningError::UnknownDependency {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                        })
                    }
                }
            }
        }

        let batches = topological_batches(&deps, &dependents).map_err(|remaining| {
            PlanningError::CyclicDependency(remaining.into_iter().map(|i| tasks[i].id.clone()).collect())
        })?;

        Ok(Self {
            tasks,
            deps,
            dependents,
            batches,
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, idx: usize) -> &Task {
        &self.tasks[idx]
    }

    /// 本图内的直接依赖
    pub fn dependencies_of(&self, idx: usize) -> &BTreeSet<usize> {
        &self.deps[idx]
    }

    pub fn dependents_of(&self, idx: usize) -> &BTreeSet<usize> {
        &self.dependents[idx]
    }

    /// 拓扑批次：同一批次内的任务互不依赖，批内按计划顺序
    pub fn batches(&self) -> &[Vec<usize>] {
        &self.batches
    }
}

/// Kahn 算法按层输出；存在环时返回未能排序的下标
fn topological_batches(
    deps: &[BTreeSet<usize>],
    dependents: &[BTreeSet<usize>],
) -> Result<Vec<Vec<usize>>, Vec<usize>> {
    let mut in_degree: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    let mut ready: Vec<usize> = (0..deps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut batches = Vec::new();
    let mut placed = 0;

    while !ready.is_empty() {
        let mut next = Vec::new();
        for &i in &ready {
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    next.push(d);
                }
            }
        }
        placed += ready.len();
        next.sort_unstable();
        batches.push(std::mem::replace(&mut ready, next));
    }

    if placed == deps.len() {
        Ok(batches)
    } else {
        Err((0..deps.len()).filter(|&i| in_degree[i] > 0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::TaskKind;

    fn t(id: &str, deps: &[&str]) -> Task {
        deps.iter()
            .fold(Task::new(id, TaskKind::ToolUse, id), |task, d| task.depends_on(*d))
    }

    #[test]
    fn test_batches_follow_dependencies() {
        let graph = TaskGraph::new(
            vec![t("aapl", &[]), t("msft", &[]), t("compare", &["aapl", "msft"])],
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(graph.batches(), &[vec![0, 1], vec![2]]);
        assert_eq!(graph.dependencies_of(2).len(), 2);
        assert_eq!(graph.dependents_of(0).iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_cycle_rejected_with_members() {
        let err = TaskGraph::new(
            vec![t("a", &["c"]), t("b", &["a"]), t("c", &["b"]), t("d", &[])],
            &BTreeSet::new(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlanningError::CyclicDependency(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn test_structural_errors() {
        let none = BTreeSet::new();
        assert_eq!(
            TaskGraph::new(vec![t("a", &["a"])], &none).unwrap_err(),
            PlanningError::SelfDependency("a".into())
        );
        assert_eq!(
            TaskGraph::new(vec![t("a", &[]), t("a", &[])], &none).unwrap_err(),
            PlanningError::DuplicateTask("a".into())
        );
        assert!(matches!(
            TaskGraph::new(vec![t("a", &["ghost"])], &none).unwrap_err(),
            PlanningError::UnknownDependency { .. }
        ));
        assert_eq!(
            TaskGraph::new(vec![t(" ", &[])], &none).unwrap_err(),
            PlanningError::EmptyTaskId
        );
    }

    #[test]
    fn test_prior_pass_dependencies_are_satisfied() {
        let prior: BTreeSet<TaskId> = ["i0.a".to_string()].into_iter().collect();
        let graph = TaskGraph::new(vec![t("i1.b", &["i0.a"])], &prior).unwrap();
        assert_eq!(graph.batches(), &[vec![0]]);
        assert!(graph.dependencies_of(0).is_empty());

        assert_eq!(
            TaskGraph::new(vec![t("i0.a", &[])], &prior).unwrap_err(),
            PlanningError::DuplicateTask("i0.a".into())
        );
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::new(Vec::new(), &BTreeSet::new()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.batches().is_empty());
    }
}
