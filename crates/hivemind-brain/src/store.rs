// ABOUTME: In-memory per-repository coordination state: agents, messages, task graph.
// ABOUTME: Each repository is its own lock partition, created lazily on first reference.

use crate::error::BrainError;
use crate::events::{Event, EventBus, EventType};
use crate::protocol::{
    AgentStatus, Message, RepoState, TaskStatus, UpdateStatusResult, Workflow, WorkflowResult,
    WorkflowTask,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Messages kept per repository before the oldest are evicted.
pub const DEFAULT_MAX_MESSAGES: usize = 50;

/// Agents that have not updated their status for this long are dropped.
pub const DEFAULT_STALE_AGENT_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Default)]
struct Repo {
    agents: HashMap<String, AgentStatus>,
    messages: VecDeque<Message>,
    workflow: Option<Workflow>,
}

impl Repo {
    fn prune_stale(&mut self, max_age: Duration) {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return;
        };
        let cutoff = Utc::now() - max_age;
        self.agents.retain(|_, agent| agent.updated_at >= cutoff);
    }

    /// Other agents claiming each file, keyed by file.
    fn claims_excluding(&self, agent_id: &str) -> HashMap<&str, Vec<&str>> {
        let mut claims: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, agent) in &self.agents {
            if id == agent_id {
                continue;
            }
            for file in &agent.files {
                claims.entry(file.as_str()).or_default().push(id.as_str());
            }
        }
        claims
    }
}

/// Coordination state for every repository the hub has seen.
///
/// All access is funneled through here. Operations on one repository are
/// serialized by that repository's lock; different repositories proceed
/// independently.
pub struct Manager {
    repos: RwLock<HashMap<String, Arc<RwLock<Repo>>>>,
    events: Option<Arc<EventBus>>,
    max_messages: usize,
    stale_agent_age: Duration,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            repos: RwLock::new(HashMap::new()),
            events: None,
            max_messages: DEFAULT_MAX_MESSAGES,
            stale_agent_age: DEFAULT_STALE_AGENT_AGE,
        }
    }

    /// Publish state changes to `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn with_limits(mut self, max_messages: usize, stale_agent_age: Duration) -> Self {
        self.max_messages = max_messages.max(1);
        self.stale_agent_age = stale_agent_age;
        self
    }

    async fn repo(&self, repo_path: &str) -> Arc<RwLock<Repo>> {
        if let Some(repo) = self.repos.read().await.get(repo_path) {
            return repo.clone();
        }

        // Another caller may have created it between the two locks.
        self.repos
            .write()
            .await
            .entry(repo_path.to_string())
            .or_default()
            .clone()
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.emit(event).await;
        }
    }

    /// Agents and the messages visible to `instance_id`. Prunes stale agents.
    pub async fn get_state(&self, repo_path: &str, instance_id: &str) -> RepoState {
        let repo = self.repo(repo_path).await;
        let mut repo = repo.write().await;
        repo.prune_stale(self.stale_agent_age);

        RepoState {
            agents: repo
                .agents
                .iter()
                .map(|(id, status)| (id.clone(), status.clone()))
                .collect::<BTreeMap<_, _>>(),
            messages: repo
                .messages
                .iter()
                .filter(|m| m.is_visible_to(instance_id))
                .cloned()
                .collect(),
        }
    }

    /// Replace the agent's entry and report files other agents also claim.
    pub async fn update_status(
        &self,
        repo_path: &str,
        instance_id: &str,
        feature: &str,
        files: Vec<String>,
        role: Option<String>,
    ) -> UpdateStatusResult {
        let mut claimed: Vec<String> = Vec::with_capacity(files.len());
        for file in files {
            if !claimed.contains(&file) {
                claimed.push(file);
            }
        }
        let role = role.filter(|r| !r.is_empty());

        let conflicts = {
            let repo = self.repo(repo_path).await;
            let mut repo = repo.write().await;
            repo.prune_stale(self.stale_agent_age);
            repo.agents.insert(
                instance_id.to_string(),
                AgentStatus {
                    feature: feature.to_string(),
                    files: claimed.clone(),
                    role: role.clone(),
                    updated_at: Utc::now(),
                },
            );

            let claims = repo.claims_excluding(instance_id);
            claimed
                .iter()
                .filter_map(|file| {
                    let mut others = claims.get(file.as_str())?.clone();
                    others.sort_unstable();
                    Some(format!(
                        "{file} is also being worked on by: {}",
                        others.join(", ")
                    ))
                })
                .collect::<Vec<_>>()
        };

        if !conflicts.is_empty() {
            debug!(repo = %repo_path, agent = %instance_id, count = conflicts.len(), "File conflicts");
        }

        let mut event = Event::new(EventType::StatusChanged, repo_path, instance_id)
            .with("feature", feature)
            .with("files", claimed);
        if let Some(role) = role {
            event = event.with("role", role);
        }
        self.emit(event).await;

        UpdateStatusResult { conflicts }
    }

    /// Append a message, evicting the oldest beyond the cap.
    pub async fn send_message(&self, repo_path: &str, from: &str, to: &str, content: &str) {
        {
            let repo = self.repo(repo_path).await;
            let mut repo = repo.write().await;
            repo.messages.push_back(Message {
                from: from.to_string(),
                to: to.to_string(),
                content: content.to_string(),
                timestamp: Utc::now(),
            });
            while repo.messages.len() > self.max_messages {
                repo.messages.pop_front();
            }
        }

        self.emit(
            Event::new(EventType::MessageReceived, repo_path, from)
                .with("to", to)
                .with("content", content),
        )
        .await;
    }

    /// Forget an agent. Removing an absent agent is not an error.
    pub async fn remove_agent(&self, repo_path: &str, instance_id: &str) {
        {
            let repo = self.repo(repo_path).await;
            repo.write().await.agents.remove(instance_id);
        }
        self.emit(Event::new(EventType::AgentRemoved, repo_path, instance_id))
            .await;
    }

    /// Replace the repository's task graph. Returns the new graph id.
    pub async fn define_workflow(&self, repo_path: &str, tasks: Vec<WorkflowTask>) -> WorkflowResult {
        let task_count = tasks.len();
        let workflow = Workflow::define(tasks);
        let workflow_id = workflow.id.clone();
        {
            let repo = self.repo(repo_path).await;
            repo.write().await.workflow = Some(workflow);
        }

        self.emit(
            Event::new(EventType::WorkflowDefined, repo_path, "")
                .with("workflow_id", workflow_id.as_str())
                .with("task_count", task_count),
        )
        .await;

        WorkflowResult {
            workflow_id,
            triggered: Vec::new(),
        }
    }

    /// Mark a task done or failed.
    pub async fn complete_task(
        &self,
        repo_path: &str,
        task_id: &str,
        status: TaskStatus,
        error: &str,
    ) -> Result<(), BrainError> {
        let changed = {
            let repo = self.repo(repo_path).await;
            let mut repo = repo.write().await;
            repo.workflow
                .as_mut()
                .ok_or(BrainError::NoWorkflow)?
                .complete(task_id, status, error)?
        };

        if changed {
            self.emit(
                Event::new(EventType::TaskCompleted, repo_path, task_id)
                    .with("task_id", task_id)
                    .with("status", status.as_str()),
            )
            .await;
        }
        Ok(())
    }

    /// Promote pending tasks whose dependencies are all done. Returns only
    /// the ids promoted by this call.
    pub async fn evaluate_workflow(&self, repo_path: &str) -> Vec<String> {
        let triggered = {
            let repo = self.repo(repo_path).await;
            let mut repo = repo.write().await;
            match repo.workflow.as_mut() {
                Some(workflow) => workflow.evaluate(),
                None => return Vec::new(),
            }
        };

        for task_id in &triggered {
            self.emit(
                Event::new(EventType::TaskTriggered, repo_path, task_id)
                    .with("task_id", task_id.as_str()),
            )
            .await;
        }
        triggered
    }

    pub async fn get_workflow(&self, repo_path: &str) -> Option<Workflow> {
        let repo = self.repo(repo_path).await;
        let repo = repo.read().await;
        repo.workflow.clone()
    }

    pub async fn get_workflow_task(&self, repo_path: &str, task_id: &str) -> Option<WorkflowTask> {
        let repo = self.repo(repo_path).await;
        let repo = repo.read().await;
        repo.workflow.as_ref()?.task(task_id).cloned()
    }

    /// Number of repository partitions created so far.
    pub async fn repo_count(&self) -> usize {
        self.repos.read().await.len()
    }
}
