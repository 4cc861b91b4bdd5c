// ABOUTME: Coordination hub shared by concurrently running coding agents.
// ABOUTME: State store, event bus, action relay, Unix socket server and client.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod store;
pub mod supervisor;
mod workflow;

pub use client::Client;
pub use config::BrainConfig;
pub use error::{BrainError, ClientError, RelayError};
pub use events::{Event, EventBus, EventFilter, EventType};
pub use protocol::{
    ActionKind, AgentStatus, Message, RepoState, Request, Response, TaskStatus, Workflow,
    WorkflowResult, WorkflowTask,
};
pub use relay::{ActionReceiver, ActionRelay, ActionRequest, ActionResponse, PendingAction};
pub use server::{Dispatcher, Server, ServerSettings};
pub use store::Manager;
pub use supervisor::{run_supervisor, Executor, HeadlessExecutor};
