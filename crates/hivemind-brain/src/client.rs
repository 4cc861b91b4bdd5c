// ABOUTME: Client for the brain socket: one connection per call, typed wrappers per method.
// ABOUTME: Transport failures surface as ClientError variants distinct from server-reported errors.

use crate::error::ClientError;
use crate::events::{Event, EventFilter};
use crate::protocol::{
    self, clamp_poll_wait, CreateInstanceParams, CreateInstanceResult, InjectMessageParams,
    Params, PollEventsResult, RepoState, Request, Response, SubscribeResult, TaskStatus,
    UpdateStatusResult, Workflow, WorkflowResult, WorkflowTask, MAX_LINE_BYTES,
};
use crate::server::POLL_DEADLINE_SLACK;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Deadline for ordinary calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for calls that wait on the supervising process.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(35);

#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
    timeout: Duration,
    relay_timeout: Duration,
}

impl Client {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one request and return the response's data payload.
    pub async fn call(&self, request: &Request, deadline: Duration) -> Result<Option<Value>, ClientError> {
        let response = tokio::time::timeout(deadline, self.round_trip(request))
            .await
            .map_err(|_| ClientError::Timeout(deadline))??;

        if response.ok {
            Ok(response.data)
        } else {
            Err(ClientError::Server(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    async fn round_trip(&self, request: &Request) -> Result<Response, ClientError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(ClientError::Connect)?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_vec(request).map_err(ClientError::Encode)?;
        line.push(b'\n');
        writer.write_all(&line).await?;

        let mut reader = BufReader::new(reader.take(MAX_LINE_BYTES as u64 + 1));
        let mut buf = String::new();
        if reader.read_line(&mut buf).await? == 0 {
            return Err(ClientError::Closed);
        }
        serde_json::from_str(buf.trim_end()).map_err(ClientError::Decode)
    }

    async fn typed<T: DeserializeOwned>(&self, request: Request, deadline: Duration) -> Result<T, ClientError> {
        let data = self.call(&request, deadline).await?;
        serde_json::from_value(data.unwrap_or_else(|| json!({}))).map_err(ClientError::Decode)
    }

    async fn unit(&self, request: Request, deadline: Duration) -> Result<(), ClientError> {
        self.call(&request, deadline).await.map(|_| ())
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.unit(Request::new(protocol::METHOD_PING), self.timeout)
            .await
    }

    pub async fn get_state(&self, repo_path: &str, instance_id: &str) -> Result<RepoState, ClientError> {
        let request = Request::new(protocol::METHOD_GET_STATE).caller(repo_path, instance_id);
        self.typed(request, self.timeout).await
    }

    pub async fn update_status(
        &self,
        repo_path: &str,
        instance_id: &str,
        feature: &str,
        files: &[String],
        role: Option<&str>,
    ) -> Result<UpdateStatusResult, ClientError> {
        let mut request = Request::new(protocol::METHOD_UPDATE_STATUS)
            .caller(repo_path, instance_id)
            .param("feature", feature)
            .param("files", files.to_vec());
        if let Some(role) = role.filter(|r| !r.is_empty()) {
            request = request.param("role", role);
        }
        self.typed(request, self.timeout).await
    }

    /// Send a message; an empty `to` broadcasts to the repository.
    pub async fn send_message(
        &self,
        repo_path: &str,
        instance_id: &str,
        to: &str,
        content: &str,
    ) -> Result<(), ClientError> {
        let request = Request::new(protocol::METHOD_SEND_MESSAGE)
            .caller(repo_path, instance_id)
            .param("to", to)
            .param("content", content);
        self.unit(request, self.timeout).await
    }

    pub async fn remove_agent(&self, repo_path: &str, instance_id: &str) -> Result<(), ClientError> {
        let request = Request::new(protocol::METHOD_REMOVE_AGENT).caller(repo_path, instance_id);
        self.unit(request, self.timeout).await
    }

    pub async fn create_instance(
        &self,
        repo_path: &str,
        instance_id: &str,
        params: &CreateInstanceParams,
    ) -> Result<CreateInstanceResult, ClientError> {
        let mut request = Request::new(protocol::METHOD_CREATE_INSTANCE).caller(repo_path, instance_id);
        request.params = to_params(params)?;
        self.typed(request, self.relay_timeout).await
    }

    pub async fn inject_message(
        &self,
        repo_path: &str,
        instance_id: &str,
        params: &InjectMessageParams,
    ) -> Result<(), ClientError> {
        let mut request = Request::new(protocol::METHOD_INJECT_MESSAGE).caller(repo_path, instance_id);
        request.params = to_params(params)?;
        self.unit(request, self.relay_timeout).await
    }

    pub async fn pause_instance(&self, repo_path: &str, instance_id: &str, target: &str) -> Result<(), ClientError> {
        self.target_call(protocol::METHOD_PAUSE_INSTANCE, repo_path, instance_id, target)
            .await
    }

    pub async fn resume_instance(&self, repo_path: &str, instance_id: &str, target: &str) -> Result<(), ClientError> {
        self.target_call(protocol::METHOD_RESUME_INSTANCE, repo_path, instance_id, target)
            .await
    }

    pub async fn kill_instance(&self, repo_path: &str, instance_id: &str, target: &str) -> Result<(), ClientError> {
        self.target_call(protocol::METHOD_KILL_INSTANCE, repo_path, instance_id, target)
            .await
    }

    async fn target_call(
        &self,
        method: &str,
        repo_path: &str,
        instance_id: &str,
        target: &str,
    ) -> Result<(), ClientError> {
        let request = Request::new(method)
            .caller(repo_path, instance_id)
            .param("target", target);
        self.unit(request, self.relay_timeout).await
    }

    /// Replace the repository's task graph. Triggered tasks are spawned before this returns.
    pub async fn define_workflow(
        &self,
        repo_path: &str,
        instance_id: &str,
        tasks: &[WorkflowTask],
    ) -> Result<WorkflowResult, ClientError> {
        let tasks = serde_json::to_value(tasks).map_err(ClientError::Encode)?;
        let request = Request::new(protocol::METHOD_DEFINE_WORKFLOW)
            .caller(repo_path, instance_id)
            .param("tasks", tasks);
        self.typed(request, self.relay_timeout).await
    }

    pub async fn complete_task(
        &self,
        repo_path: &str,
        instance_id: &str,
        task_id: &str,
        status: TaskStatus,
        error: &str,
    ) -> Result<WorkflowResult, ClientError> {
        let mut request = Request::new(protocol::METHOD_COMPLETE_TASK)
            .caller(repo_path, instance_id)
            .param("task_id", task_id)
            .param("status", status.as_str());
        if !error.is_empty() {
            request = request.param("error", error);
        }
        self.typed(request, self.relay_timeout).await
    }

    pub async fn get_workflow(&self, repo_path: &str, instance_id: &str) -> Result<Workflow, ClientError> {
        let request = Request::new(protocol::METHOD_GET_WORKFLOW).caller(repo_path, instance_id);
        self.typed(request, self.timeout).await
    }

    /// Register for events matching `filter`. Returns the subscriber id.
    pub async fn subscribe(&self, filter: &EventFilter) -> Result<String, ClientError> {
        let mut request = Request::new(protocol::METHOD_SUBSCRIBE);
        request.params = to_params(filter)?;
        let result: SubscribeResult = self.typed(request, self.timeout).await?;
        Ok(result.subscriber_id)
    }

    /// Long-poll for events. The wait is clamped the same way the server clamps it.
    pub async fn poll_events(&self, subscriber_id: &str, wait: Duration) -> Result<Vec<Event>, ClientError> {
        let wait = clamp_poll_wait(Some(wait.as_secs_f64()));
        let request = Request::new(protocol::METHOD_POLL_EVENTS)
            .param("subscriber_id", subscriber_id)
            .param("timeout", wait.as_secs());
        let result: PollEventsResult = self.typed(request, wait + POLL_DEADLINE_SLACK).await?;
        Ok(result.events)
    }

    pub async fn unsubscribe(&self, subscriber_id: &str) -> Result<(), ClientError> {
        let request = Request::new(protocol::METHOD_UNSUBSCRIBE).param("subscriber_id", subscriber_id);
        self.unit(request, self.timeout).await
    }
}

fn to_params<T: Serialize>(value: &T) -> Result<Params, ClientError> {
    match serde_json::to_value(value).map_err(ClientError::Encode)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Params::new()),
    }
}
