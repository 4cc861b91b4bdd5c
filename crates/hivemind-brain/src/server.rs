// ABOUTME: Unix socket server: one request line in, one response line out, per connection.
// ABOUTME: Routes calls to the state store, the event bus, or the action relay.

use crate::config::BrainConfig;
use crate::error::{BrainError, RelayError};
use crate::events::{Event, EventBus};
use crate::protocol::{
    ActionKind, Call, Params, PollEventsResult, Request, Response, SubscribeResult, WorkflowResult,
    MAX_LINE_BYTES,
};
use crate::relay::{self, ActionReceiver, ActionRelay, FROM_WORKFLOW_KEY};
use crate::store::Manager;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Slack added to a long-poll wait so the socket deadline never fires first.
pub const POLL_DEADLINE_SLACK: Duration = Duration::from_secs(5);

/// Timeouts and limits for one hub instance.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub action_timeout: Duration,
    pub action_queue_capacity: usize,
    pub event_buffer_capacity: usize,
    pub subscriber_max_age: Duration,
    pub prune_interval: Duration,
    pub stale_agent_age: Duration,
    pub max_messages: usize,
    pub connection_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from(&BrainConfig::default())
    }
}

impl From<&BrainConfig> for ServerSettings {
    fn from(config: &BrainConfig) -> Self {
        Self {
            action_timeout: config.action_timeout(),
            action_queue_capacity: config.action_queue_capacity,
            event_buffer_capacity: config.event_buffer_capacity,
            subscriber_max_age: config.subscriber_max_age(),
            prune_interval: config.prune_interval(),
            stale_agent_age: config.stale_agent_age(),
            max_messages: config.max_messages,
            connection_timeout: config.connection_timeout(),
        }
    }
}

/// Executes decoded calls against the hub's shared state.
///
/// Cloned into every connection task; usable in-process without a socket.
pub struct Dispatcher {
    manager: Arc<Manager>,
    events: Arc<EventBus>,
    relay: ActionRelay,
}

impl Dispatcher {
    /// Decode and execute one request.
    pub async fn handle(&self, request: &Request) -> Response {
        match Call::decode(&request.method, &request.params) {
            Ok(call) => self.dispatch(request, call).await,
            Err(e) => Response::error(e),
        }
    }

    async fn dispatch(&self, req: &Request, call: Call) -> Response {
        let repo = req.repo_path.as_str();
        let caller = req.instance_id.as_str();

        match call {
            Call::Ping => Response::ok(),

            Call::GetState => Response::from_result(Ok(self.manager.get_state(repo, caller).await)),

            Call::UpdateStatus(p) => Response::from_result(Ok(self
                .manager
                .update_status(repo, caller, &p.feature, p.files, p.role)
                .await)),

            Call::SendMessage(p) => {
                self.manager
                    .send_message(repo, caller, &p.to, &p.content)
                    .await;
                Response::ok()
            }

            Call::RemoveAgent => {
                self.manager.remove_agent(repo, caller).await;
                Response::ok()
            }

            Call::Relay(kind, params) => self.relay_privileged(req, kind, params).await,

            Call::DefineWorkflow(tasks) => {
                let mut result = self.manager.define_workflow(repo, tasks).await;
                result.triggered = self.actuate(repo).await;
                Response::from_result(Ok(result))
            }

            Call::CompleteTask {
                task_id,
                status,
                error,
            } => {
                if let Err(e) = self
                    .manager
                    .complete_task(repo, &task_id, status, &error)
                    .await
                {
                    return Response::error(e);
                }
                let triggered = self.actuate(repo).await;
                Response::from_result(Ok(WorkflowResult {
                    workflow_id: String::new(),
                    triggered,
                }))
            }

            Call::GetWorkflow => match self.manager.get_workflow(repo).await {
                Some(workflow) => Response::from_result(Ok(workflow)),
                None => Response::with_data(json!({ "tasks": [] })),
            },

            Call::Subscribe(filter) => {
                let subscriber_id = self.events.subscribe(filter).await;
                Response::from_result(Ok(SubscribeResult { subscriber_id }))
            }

            Call::PollEvents {
                subscriber_id,
                wait,
            } => {
                let result = self
                    .events
                    .poll(&subscriber_id, wait)
                    .await
                    .map(|events| PollEventsResult {
                        subscriber_id,
                        events,
                    });
                Response::from_result(result)
            }

            Call::Unsubscribe(subscriber_id) => {
                self.events.unsubscribe(&subscriber_id).await;
                Response::ok()
            }
        }
    }

    async fn relay_privileged(&self, req: &Request, kind: ActionKind, mut params: Params) -> Response {
        match kind {
            // Lets the supervising process inherit the caller's topic.
            ActionKind::CreateInstance => {
                params.insert("source_instance".into(), Value::from(req.instance_id.as_str()));
            }
            ActionKind::InjectMessage => {
                let to = params.get("to").and_then(Value::as_str).unwrap_or_default();
                let content = params
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !content.is_empty() {
                    self.manager
                        .send_message(&req.repo_path, &req.instance_id, to, content)
                        .await;
                }
                params.insert("from".into(), Value::from(req.instance_id.as_str()));
            }
            ActionKind::PauseInstance | ActionKind::ResumeInstance | ActionKind::KillInstance => {}
        }

        match self.relay.send(kind, params).await {
            Ok(Some(data)) => Response::with_data(Value::Object(data)),
            Ok(None) => Response::ok(),
            Err(e) => Response::error(BrainError::Relay(e)),
        }
    }

    /// Promote unblocked tasks and ask the supervising process to spawn an
    /// agent for each, before the caller gets its response.
    ///
    /// Spawns are queued in task order and their replies awaited together,
    /// so the whole batch waits at most one action timeout.
    async fn actuate(&self, repo: &str) -> Vec<String> {
        let triggered = self.manager.evaluate_workflow(repo).await;

        let mut pending = JoinSet::new();
        for task_id in &triggered {
            let Some(task) = self.manager.get_workflow_task(repo, task_id).await else {
                continue;
            };

            let mut params = Params::new();
            params.insert("title".into(), Value::from(task.id.as_str()));
            params.insert("prompt".into(), Value::from(task.prompt));
            params.insert("role".into(), Value::from(task.role));
            params.insert(FROM_WORKFLOW_KEY.into(), Value::Bool(true));

            match self.relay.enqueue(ActionKind::CreateInstance, params) {
                Ok(action) => {
                    let task_id = task_id.clone();
                    pending.spawn(async move { (task_id, action.wait().await) });
                }
                Err(e) => {
                    warn!(repo = %repo, task_id = %task_id, error = %e, "Workflow task spawn failed")
                }
            }
        }

        while let Some(joined) = pending.join_next().await {
            if let Ok((task_id, Err(e))) = joined {
                warn!(repo = %repo, task_id = %task_id, error = %e, "Workflow task spawn failed");
            }
        }

        triggered
    }
}

/// The brain hub: owns the shared state and serves it on a Unix socket.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    actions: Option<ActionReceiver>,
    socket_path: PathBuf,
    settings: ServerSettings,
    closed: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    /// Create a hub for `socket_path`. Call [`Server::start`] to begin listening.
    pub fn new(socket_path: impl Into<PathBuf>, settings: ServerSettings) -> Self {
        let closed = CancellationToken::new();
        let events = Arc::new(EventBus::new(settings.event_buffer_capacity));
        let manager = Arc::new(
            Manager::new()
                .with_events(events.clone())
                .with_limits(settings.max_messages, settings.stale_agent_age),
        );
        let (relay, actions) = relay::channel(
            settings.action_queue_capacity,
            settings.action_timeout,
            closed.clone(),
        );

        Self {
            dispatcher: Arc::new(Dispatcher {
                manager,
                events,
                relay,
            }),
            actions: Some(actions),
            socket_path: socket_path.into(),
            settings,
            closed,
            tracker: TaskTracker::new(),
        }
    }

    pub fn from_config(config: &BrainConfig) -> Self {
        Self::new(config.socket_path_expanded(), ServerSettings::from(config))
    }

    /// Bind the socket and spawn the accept loop and subscriber pruning.
    pub async fn start(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating socket directory {}", parent.display()))?;
        }
        // A previous run may have left its socket behind.
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("binding {}", self.socket_path.display()))?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting {}", self.socket_path.display()))?;
        info!(path = %self.socket_path.display(), "Brain server listening");

        self.tracker.spawn(accept_loop(
            listener,
            self.dispatcher.clone(),
            self.settings.connection_timeout,
            self.closed.clone(),
            self.tracker.clone(),
        ));

        let events = self.dispatcher.events.clone();
        let interval = self.settings.prune_interval;
        let max_age = self.settings.subscriber_max_age;
        let closed = self.closed.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = ticker.tick() => {
                        events.prune_stale(max_age).await;
                    }
                }
            }
        });

        Ok(())
    }

    /// Signal shutdown, wait for in-flight connections, and remove the socket file.
    pub async fn stop(&self) {
        self.closed.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        let _ = std::fs::remove_file(&self.socket_path);
        info!(path = %self.socket_path.display(), "Brain server stopped");
    }

    /// Hand out the action queue. The supervising process is its only reader.
    pub fn take_actions(&mut self) -> Option<ActionReceiver> {
        self.actions.take()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Direct in-process access to coordination state.
    pub fn manager(&self) -> Arc<Manager> {
        self.dispatcher.manager.clone()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.dispatcher.events.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Token cancelled when the server stops.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Inject an externally observed event, such as an instance lifecycle change.
    pub async fn push_event(&self, event: Event) -> u64 {
        self.dispatcher.events.emit(event).await
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn accept_loop(
    listener: UnixListener,
    dispatcher: Arc<Dispatcher>,
    connection_timeout: Duration,
    closed: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let stream = tokio::select! {
            _ = closed.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        let dispatcher = dispatcher.clone();
        let closed = closed.clone();
        tracker.spawn(async move {
            if let Err(e) = handle_connection(stream, dispatcher, connection_timeout, closed).await {
                warn!(error = %e, "Socket connection error");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    dispatcher: Arc<Dispatcher>,
    connection_timeout: Duration,
    closed: CancellationToken,
) -> Result<()> {
    let mut deadline = Instant::now() + connection_timeout;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader.take(MAX_LINE_BYTES as u64 + 1));
    let mut line = String::new();

    let read = tokio::select! {
        _ = closed.cancelled() => return Ok(()),
        read = tokio::time::timeout_at(deadline, reader.read_line(&mut line)) => match read {
            Ok(read) => read,
            Err(_) => {
                debug!("Connection timed out before sending a request");
                return Ok(());
            }
        },
    };

    let response = match read {
        Ok(0) => return Ok(()),
        Ok(_) if line.len() > MAX_LINE_BYTES => Response::error(BrainError::InvalidRequest(
            format!("request exceeds {MAX_LINE_BYTES} bytes"),
        )),
        Ok(_) => match serde_json::from_str::<Request>(line.trim_end()) {
            Ok(request) => {
                debug!(method = %request.method, repo = %request.repo_path, instance = %request.instance_id, "Request");
                match Call::decode(&request.method, &request.params) {
                    Ok(call) => {
                        if let Call::PollEvents { wait, .. } = &call {
                            deadline = deadline.max(Instant::now() + *wait + POLL_DEADLINE_SLACK);
                        }
                        tokio::select! {
                            response = dispatcher.dispatch(&request, call) => response,
                            _ = closed.cancelled() => Response::error(BrainError::Relay(RelayError::ShuttingDown)),
                        }
                    }
                    Err(e) => Response::error(e),
                }
            }
            Err(e) => Response::error(BrainError::InvalidRequest(e.to_string())),
        },
        Err(e) => Response::error(BrainError::InvalidRequest(e.to_string())),
    };

    let mut out = serde_json::to_vec(&response)?;
    out.push(b'\n');
    tokio::time::timeout_at(deadline, writer.write_all(&out))
        .await
        .context("writing response timed out")??;
    Ok(())
}
