// ABOUTME: Task graph scheduling: dependency-gated promotion and completion reports.
// ABOUTME: Pure operations on a Workflow; the store runs them under the repository lock.

use crate::error::BrainError;
use crate::protocol::{TaskStatus, Workflow, WorkflowTask};
use std::collections::HashMap;
use uuid::Uuid;

impl Workflow {
    /// Build a graph with a fresh id from caller-supplied tasks.
    pub fn define(tasks: Vec<WorkflowTask>) -> Self {
        Self {
            id: format!("wf-{}", Uuid::new_v4().simple()),
            tasks,
        }
    }

    /// Promote every pending task whose dependencies are all done to running.
    ///
    /// Returns only the ids promoted by this call, in graph order. A dependency
    /// that failed or does not exist keeps its dependents pending.
    pub fn evaluate(&mut self) -> Vec<String> {
        let statuses: HashMap<String, TaskStatus> = self
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.status))
            .collect();

        let mut triggered = Vec::new();
        for task in self.tasks.iter_mut() {
            if task.status != TaskStatus::Pending {
                continue;
            }
            let ready = task
                .depends_on
                .iter()
                .all(|dep| statuses.get(dep) == Some(&TaskStatus::Done));
            if ready {
                task.status = TaskStatus::Running;
                triggered.push(task.id.clone());
            }
        }
        triggered
    }

    /// Record a completion report for `task_id`.
    ///
    /// Returns `Ok(false)` when the task already carries the same terminal
    /// status, so a repeated report changes nothing.
    pub fn complete(&mut self, task_id: &str, status: TaskStatus, error: &str) -> Result<bool, BrainError> {
        if !matches!(status, TaskStatus::Done | TaskStatus::Failed) {
            return Err(BrainError::InvalidStatus(status.as_str().to_string()));
        }

        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| BrainError::TaskNotFound(task_id.to_string()))?;

        match task.status {
            TaskStatus::Done | TaskStatus::Failed if task.status == status => Ok(false),
            TaskStatus::Done | TaskStatus::Failed => Err(BrainError::TaskFinished {
                task_id: task_id.to_string(),
                status: task.status.as_str(),
            }),
            TaskStatus::Pending | TaskStatus::Running => {
                task.status = status;
                task.error = error.to_string();
                Ok(true)
            }
        }
    }
}
