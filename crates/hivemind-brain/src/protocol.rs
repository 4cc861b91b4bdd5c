// ABOUTME: Wire types shared by the brain server, client, and supervising process.
// ABOUTME: Map-shaped JSON envelopes on the socket, decoded into a typed Call right after dispatch.

use crate::error::BrainError;
use crate::events::{Event, EventFilter, EventType};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

pub const METHOD_PING: &str = "ping";
pub const METHOD_GET_STATE: &str = "get_state";
pub const METHOD_UPDATE_STATUS: &str = "update_status";
pub const METHOD_SEND_MESSAGE: &str = "send_message";
pub const METHOD_REMOVE_AGENT: &str = "remove_agent";

// Privileged methods, always relayed to the supervising process.
pub const METHOD_CREATE_INSTANCE: &str = "create_instance";
pub const METHOD_INJECT_MESSAGE: &str = "inject_message";
pub const METHOD_PAUSE_INSTANCE: &str = "pause_instance";
pub const METHOD_RESUME_INSTANCE: &str = "resume_instance";
pub const METHOD_KILL_INSTANCE: &str = "kill_instance";

pub const METHOD_DEFINE_WORKFLOW: &str = "define_workflow";
pub const METHOD_COMPLETE_TASK: &str = "complete_task";
pub const METHOD_GET_WORKFLOW: &str = "get_workflow";

pub const METHOD_SUBSCRIBE: &str = "subscribe";
pub const METHOD_POLL_EVENTS: &str = "poll_events";
pub const METHOD_UNSUBSCRIBE: &str = "unsubscribe";

/// Largest request or response line accepted on the socket.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Default long-poll wait when the caller does not name one.
pub const DEFAULT_POLL_SECS: u64 = 15;
pub const MIN_POLL_SECS: u64 = 1;
pub const MAX_POLL_SECS: u64 = 25;

/// Opaque parameter map carried by every request.
pub type Params = Map<String, Value>;

/// Envelope sent from client to server, one JSON document per line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub repo_path: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Params,
}

impl Request {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            ..Default::default()
        }
    }

    pub fn caller(mut self, repo_path: &str, instance_id: &str) -> Self {
        self.repo_path = repo_path.to_string();
        self.instance_id = instance_id.to_string();
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Envelope sent from server to client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.to_string()),
        }
    }

    /// Serialize a handler result, turning failures into an error response.
    pub fn from_result<T: Serialize>(result: Result<T, BrainError>) -> Self {
        match result.and_then(|value| serde_json::to_value(value).map_err(BrainError::from)) {
            Ok(data) => Self::with_data(data),
            Err(e) => Self::error(e),
        }
    }
}

/// What one agent is currently working on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub feature: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A directed (or broadcast, when `to` is empty) note between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn is_visible_to(&self, instance_id: &str) -> bool {
        self.to.is_empty() || self.to == instance_id
    }
}

/// Coordination state of one repository as seen by one requester.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoState {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentStatus>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatusResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parse a completion report. An empty status means done.
    pub fn parse_completion(status: &str) -> Result<Self, BrainError> {
        match status {
            "" | "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(BrainError::InvalidStatus(other.to_string())),
        }
    }
}

/// One node of a task graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assigned_to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl WorkflowTask {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn prompt(mut self, prompt: &str) -> Self {
        self.prompt = prompt.to_string();
        self
    }
}

/// A repository's task graph. An empty id means no graph is defined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub tasks: Vec<WorkflowTask>,
}

impl Workflow {
    pub fn task(&self, task_id: &str) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResult {
    pub subscriber_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollEventsResult {
    pub subscriber_id: String,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Parameters for spawning a new agent instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateInstanceParams {
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub program: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub prompt: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub role: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub topic: String,
    /// Spawned agents skip permission prompts unless this is explicitly false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_permissions: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateInstanceResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub error: String,
}

/// Parameters for writing text straight into another agent's terminal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InjectMessageParams {
    #[serde(default, deserialize_with = "null_as_default")]
    pub to: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    /// "plain" or "hivemind" (the default, applied by the supervising process).
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub format: String,
}

/// Parameters naming the instance a pause/resume/kill applies to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetParams {
    #[serde(default, deserialize_with = "null_as_default")]
    pub target: String,
}

/// Privileged operations only the supervising process may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateInstance,
    InjectMessage,
    PauseInstance,
    ResumeInstance,
    KillInstance,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateInstance => METHOD_CREATE_INSTANCE,
            ActionKind::InjectMessage => METHOD_INJECT_MESSAGE,
            ActionKind::PauseInstance => METHOD_PAUSE_INSTANCE,
            ActionKind::ResumeInstance => METHOD_RESUME_INSTANCE,
            ActionKind::KillInstance => METHOD_KILL_INSTANCE,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpdateStatusParams {
    #[serde(default, deserialize_with = "null_as_default")]
    pub feature: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SendMessageParams {
    #[serde(default, deserialize_with = "null_as_default")]
    pub to: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompleteTaskParams {
    #[serde(default, deserialize_with = "null_as_default")]
    pub task_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct SubscriberParams {
    #[serde(default, deserialize_with = "null_as_default")]
    subscriber_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    timeout: Option<f64>,
}

/// Subset of a task definition accepted from callers.
#[derive(Debug, Deserialize)]
struct TaskInput {
    #[serde(default, deserialize_with = "null_as_default")]
    id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    depends_on: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    prompt: String,
    #[serde(default, deserialize_with = "null_as_default")]
    role: String,
}

/// A request decoded into the operation it names.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Ping,
    GetState,
    UpdateStatus(UpdateStatusParams),
    SendMessage(SendMessageParams),
    RemoveAgent,
    Relay(ActionKind, Params),
    DefineWorkflow(Vec<WorkflowTask>),
    CompleteTask {
        task_id: String,
        status: TaskStatus,
        error: String,
    },
    GetWorkflow,
    Subscribe(EventFilter),
    PollEvents {
        subscriber_id: String,
        wait: Duration,
    },
    Unsubscribe(String),
}

impl Call {
    /// Decode `(method, params)` into a typed call.
    pub fn decode(method: &str, params: &Params) -> Result<Self, BrainError> {
        let call = match method {
            METHOD_PING => Call::Ping,
            METHOD_GET_STATE => Call::GetState,
            METHOD_UPDATE_STATUS => Call::UpdateStatus(typed(params, "params")?),
            METHOD_SEND_MESSAGE => Call::SendMessage(typed(params, "params")?),
            METHOD_REMOVE_AGENT => Call::RemoveAgent,
            METHOD_CREATE_INSTANCE => Call::Relay(ActionKind::CreateInstance, params.clone()),
            METHOD_INJECT_MESSAGE => Call::Relay(ActionKind::InjectMessage, params.clone()),
            METHOD_PAUSE_INSTANCE => Call::Relay(ActionKind::PauseInstance, params.clone()),
            METHOD_RESUME_INSTANCE => Call::Relay(ActionKind::ResumeInstance, params.clone()),
            METHOD_KILL_INSTANCE => Call::Relay(ActionKind::KillInstance, params.clone()),
            METHOD_DEFINE_WORKFLOW => Call::DefineWorkflow(decode_tasks(params)?),
            METHOD_COMPLETE_TASK => {
                let p: CompleteTaskParams = typed(params, "params")?;
                if p.task_id.is_empty() {
                    return Err(BrainError::MissingParam("task_id"));
                }
                Call::CompleteTask {
                    status: TaskStatus::parse_completion(&p.status)?,
                    task_id: p.task_id,
                    error: p.error,
                }
            }
            METHOD_GET_WORKFLOW => Call::GetWorkflow,
            METHOD_SUBSCRIBE => Call::Subscribe(decode_filter(params)?),
            METHOD_POLL_EVENTS => {
                let p: SubscriberParams = typed(params, "params")?;
                if p.subscriber_id.is_empty() {
                    return Err(BrainError::MissingParam("subscriber_id"));
                }
                Call::PollEvents {
                    subscriber_id: p.subscriber_id,
                    wait: clamp_poll_wait(p.timeout),
                }
            }
            METHOD_UNSUBSCRIBE => {
                let p: SubscriberParams = typed(params, "params")?;
                if p.subscriber_id.is_empty() {
                    return Err(BrainError::MissingParam("subscriber_id"));
                }
                Call::Unsubscribe(p.subscriber_id)
            }
            other => return Err(BrainError::UnknownMethod(other.to_string())),
        };
        Ok(call)
    }
}

/// Clamp a requested long-poll wait (seconds) into the supported range.
pub fn clamp_poll_wait(requested: Option<f64>) -> Duration {
    let secs = match requested {
        Some(v) if v.is_finite() => (v as i64).clamp(MIN_POLL_SECS as i64, MAX_POLL_SECS as i64) as u64,
        _ => DEFAULT_POLL_SECS,
    };
    Duration::from_secs(secs)
}

/// Treat an explicit JSON `null` the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn typed<T: DeserializeOwned>(params: &Params, name: &'static str) -> Result<T, BrainError> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| BrainError::InvalidParam {
        name,
        reason: e.to_string(),
    })
}

fn decode_tasks(params: &Params) -> Result<Vec<WorkflowTask>, BrainError> {
    let raw = match params.get("tasks") {
        Some(Value::Array(items)) => items,
        _ => {
            return Err(BrainError::InvalidParam {
                name: "tasks",
                reason: "missing or not an array".to_string(),
            })
        }
    };

    let tasks: Vec<WorkflowTask> = raw
        .iter()
        .filter(|item| item.is_object())
        .filter_map(|item| serde_json::from_value::<TaskInput>(item.clone()).ok())
        .map(|input| WorkflowTask {
            id: input.id,
            title: input.title,
            status: TaskStatus::Pending,
            depends_on: input.depends_on,
            prompt: input.prompt,
            role: input.role,
            ..Default::default()
        })
        .collect();

    if tasks.is_empty() {
        return Err(BrainError::NoTasks);
    }
    Ok(tasks)
}

fn decode_filter(params: &Params) -> Result<EventFilter, BrainError> {
    #[derive(Deserialize)]
    struct Raw {
        #[serde(default, deserialize_with = "null_as_default")]
        types: Vec<String>,
        #[serde(default, deserialize_with = "null_as_default")]
        instances: Vec<String>,
        #[serde(default, deserialize_with = "null_as_default")]
        parent_title: String,
    }

    let raw: Raw = typed(params, "filter")?;
    Ok(EventFilter {
        types: raw.types.iter().map(|t| EventType::from_wire(t)).collect(),
        instances: raw.instances,
        parent_title: raw.parent_title,
    })
}
