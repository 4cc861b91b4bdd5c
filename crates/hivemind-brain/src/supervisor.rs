// ABOUTME: Supervising-process side of the action relay: the Executor seam and its drain loop.
// ABOUTME: HeadlessExecutor tracks instances in memory when no UI owns the agents.

use crate::events::{Event, EventBus, EventType, TOPIC_KEY};
use crate::protocol::{
    ActionKind, CreateInstanceParams, CreateInstanceResult, InjectMessageParams, Params,
    TargetParams,
};
use crate::relay::{ActionReceiver, ActionRequest, ActionResponse, FROM_WORKFLOW_KEY};
use crate::store::Manager;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Instances a headless supervisor will run at once.
pub const DEFAULT_INSTANCE_LIMIT: usize = 10;

/// Performs privileged actions on behalf of the hub.
///
/// Each method receives the relayed params untouched and returns the reply
/// payload, or an error string that is passed back to the calling agent.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn create_instance(&self, params: Params) -> Result<Option<Params>, String>;
    async fn inject_message(&self, params: Params) -> Result<Option<Params>, String>;
    async fn pause_instance(&self, params: Params) -> Result<Option<Params>, String>;
    async fn resume_instance(&self, params: Params) -> Result<Option<Params>, String>;
    async fn kill_instance(&self, params: Params) -> Result<Option<Params>, String>;
}

/// Drain the action queue until the relay closes or `cancel` fires.
pub async fn run_supervisor<E: Executor + ?Sized>(
    mut actions: ActionReceiver,
    executor: Arc<E>,
    cancel: CancellationToken,
) {
    loop {
        let action = tokio::select! {
            _ = cancel.cancelled() => break,
            next = actions.recv() => match next {
                Some(action) => action,
                None => break,
            },
        };
        execute(executor.as_ref(), action).await;
    }
    debug!("Supervisor stopped");
}

async fn execute<E: Executor + ?Sized>(executor: &E, action: ActionRequest) {
    let kind = action.kind;
    let params = action.params.clone();
    let outcome = match kind {
        ActionKind::CreateInstance => executor.create_instance(params).await,
        ActionKind::InjectMessage => executor.inject_message(params).await,
        ActionKind::PauseInstance => executor.pause_instance(params).await,
        ActionKind::ResumeInstance => executor.resume_instance(params).await,
        ActionKind::KillInstance => executor.kill_instance(params).await,
    };

    let response = match outcome {
        Ok(data) => ActionResponse::success(data),
        Err(e) => {
            debug!(action = %kind, error = %e, "Action rejected");
            ActionResponse::failure(e)
        }
    };
    if !action.reply(response) {
        warn!(action = %kind, "Requester gave up before the reply");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Paused,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
        }
    }
}

/// What the headless supervisor knows about one spawned agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub title: String,
    pub program: String,
    pub role: String,
    pub topic: String,
    pub parent_title: String,
    pub status: InstanceStatus,
    pub skip_permissions: bool,
    pub from_workflow: bool,
    /// Text written into this agent's terminal, in delivery order.
    pub delivered: Vec<String>,
}

/// Executor that keeps instances in memory and reports their lifecycle on the bus.
pub struct HeadlessExecutor {
    instances: Mutex<HashMap<String, Instance>>,
    events: Arc<EventBus>,
    manager: Option<Arc<Manager>>,
    repo_path: String,
    program: String,
    limit: usize,
}

impl HeadlessExecutor {
    pub fn new(events: Arc<EventBus>, repo_path: impl Into<String>) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            events,
            manager: None,
            repo_path: repo_path.into(),
            program: "claude".to_string(),
            limit: DEFAULT_INSTANCE_LIMIT,
        }
    }

    /// Drop an agent's coordination entry when it is paused or killed.
    pub fn with_manager(mut self, manager: Arc<Manager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Program used when a spawn does not name one.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub async fn instance(&self, title: &str) -> Option<Instance> {
        self.instances.lock().await.get(title).cloned()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    async fn forget_agent(&self, title: &str) {
        if let Some(manager) = &self.manager {
            manager.remove_agent(&self.repo_path, title).await;
        }
    }

    async fn set_status(&self, target: &str, want: InstanceStatus) -> Result<Option<Params>, String> {
        let parent_title = {
            let mut instances = self.instances.lock().await;
            let instance = instances
                .get_mut(target)
                .ok_or_else(|| format!("instance {target:?} not found"))?;
            match (instance.status, want) {
                (InstanceStatus::Paused, InstanceStatus::Paused) => {
                    return Err(format!("instance {target:?} is already paused"))
                }
                (InstanceStatus::Running, InstanceStatus::Running) => {
                    return Err(format!("instance {target:?} is not paused"))
                }
                _ => {}
            }
            instance.status = want;
            instance.parent_title.clone()
        };

        if want == InstanceStatus::Paused {
            self.forget_agent(target).await;
        }
        self.events
            .emit(
                Event::new(EventType::InstanceStatusChanged, &self.repo_path, target)
                    .with("status", want.as_str())
                    .with(TOPIC_KEY, parent_title),
            )
            .await;
        info!(instance = %target, status = want.as_str(), "Instance status changed");
        Ok(None)
    }
}

#[async_trait]
impl Executor for HeadlessExecutor {
    async fn create_instance(&self, params: Params) -> Result<Option<Params>, String> {
        let source_instance = params
            .get("source_instance")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let from_workflow = params
            .get(FROM_WORKFLOW_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let wanted: CreateInstanceParams = decode(params)?;

        if wanted.title.is_empty() {
            return Err("title is required".to_string());
        }

        let instance = {
            let mut instances = self.instances.lock().await;
            if instances.len() >= self.limit {
                return Err(format!("instance limit reached ({})", self.limit));
            }
            if instances.contains_key(&wanted.title) {
                return Err(format!("instance {:?} already exists", wanted.title));
            }

            let mut topic = wanted.topic;
            if topic.is_empty() && !source_instance.is_empty() {
                match instances.get(&source_instance) {
                    Some(parent) => topic = parent.topic.clone(),
                    None => warn!(parent = %source_instance, "Parent instance unknown, cannot inherit topic"),
                }
            }

            let mut instance = Instance {
                title: wanted.title.clone(),
                program: if wanted.program.is_empty() {
                    self.program.clone()
                } else {
                    wanted.program
                },
                role: wanted.role,
                topic,
                parent_title: source_instance,
                status: InstanceStatus::Running,
                skip_permissions: wanted.skip_permissions.unwrap_or(true),
                from_workflow,
                delivered: Vec::new(),
            };
            if !wanted.prompt.is_empty() {
                instance.delivered.push(wanted.prompt);
            }
            instances.insert(instance.title.clone(), instance.clone());
            instance
        };

        info!(
            instance = %instance.title,
            program = %instance.program,
            topic = %instance.topic,
            from_workflow = instance.from_workflow,
            "Instance created"
        );
        self.events
            .emit(
                Event::new(EventType::InstanceCreated, &self.repo_path, &instance.title)
                    .with(TOPIC_KEY, instance.parent_title.as_str())
                    .with("role", instance.role.as_str()),
            )
            .await;

        let result = CreateInstanceResult {
            title: instance.title,
            status: "created".to_string(),
            error: String::new(),
        };
        match serde_json::to_value(result) {
            Ok(Value::Object(data)) => Ok(Some(data)),
            Ok(_) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn inject_message(&self, params: Params) -> Result<Option<Params>, String> {
        let from = params
            .get("from")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message: InjectMessageParams = decode(params)?;
        if message.to.is_empty() || message.content.is_empty() {
            return Err("to and content are required".to_string());
        }

        let mut instances = self.instances.lock().await;
        let target = instances
            .get_mut(&message.to)
            .ok_or_else(|| format!("instance {:?} not found", message.to))?;
        if target.status != InstanceStatus::Running {
            return Err(format!("instance {:?} is not running", message.to));
        }

        let text = match message.format.as_str() {
            "plain" => message.content,
            _ => format!("[HIVEMIND] {from} says: {}", message.content),
        };
        target.delivered.push(text);
        info!(from = %from, to = %message.to, "Message injected");
        Ok(None)
    }

    async fn pause_instance(&self, params: Params) -> Result<Option<Params>, String> {
        let target = required_target(params)?;
        self.set_status(&target, InstanceStatus::Paused).await
    }

    async fn resume_instance(&self, params: Params) -> Result<Option<Params>, String> {
        let target = required_target(params)?;
        self.set_status(&target, InstanceStatus::Running).await
    }

    async fn kill_instance(&self, params: Params) -> Result<Option<Params>, String> {
        let target = required_target(params)?;
        let instance = self
            .instances
            .lock()
            .await
            .remove(&target)
            .ok_or_else(|| format!("instance {target:?} not found"))?;

        self.forget_agent(&target).await;
        self.events
            .emit(
                Event::new(EventType::InstanceKilled, &self.repo_path, &target)
                    .with(TOPIC_KEY, instance.parent_title),
            )
            .await;
        info!(instance = %target, "Instance killed");
        Ok(None)
    }
}

fn decode<T: DeserializeOwned>(params: Params) -> Result<T, String> {
    serde_json::from_value(Value::Object(params)).map_err(|e| format!("invalid params: {e}"))
}

fn required_target(params: Params) -> Result<String, String> {
    let TargetParams { target } = decode(params).map_err(|_| "target is required".to_string())?;
    if target.is_empty() {
        return Err("target is required".to_string());
    }
    Ok(target)
}
