// ABOUTME: Error types for the hivemind-brain crate.
// ABOUTME: Domain errors travel in Response.error; transport errors stay on the client side.

use thiserror::Error;

/// Domain errors produced while dispatching a request.
///
/// These never terminate the server: they are rendered into the `error` field
/// of the response sent to the caller that triggered them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrainError {
    /// The request line was not a valid request document.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The method name is not in the catalogue.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// A required parameter was absent or empty.
    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),

    /// A parameter was present but had the wrong shape.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParam { name: &'static str, reason: String },

    /// `define_workflow` carried no usable task entries.
    #[error("no valid tasks provided")]
    NoTasks,

    /// The repository has no task graph.
    #[error("no workflow defined for repo")]
    NoWorkflow,

    /// The task id is not part of the repository's graph.
    #[error("task {0:?} not found in workflow")]
    TaskNotFound(String),

    /// The task already reached a different terminal status.
    #[error("task {task_id:?} already {status}")]
    TaskFinished {
        task_id: String,
        status: &'static str,
    },

    /// `complete_task` was given a status other than done/failed.
    #[error("invalid status: {0} (must be 'done' or 'failed')")]
    InvalidStatus(String),

    /// The subscriber id is unknown, unsubscribed, or was pruned.
    #[error("subscriber not found")]
    SubscriberNotFound,

    /// A privileged call could not be completed by the supervising process.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Result serialization failed.
    #[error("marshal error: {0}")]
    Marshal(String),
}

/// Outcomes of an action relay round-trip other than success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The bounded action queue is at capacity.
    #[error("relay full, supervising process not draining")]
    Full,

    /// No reply arrived before the action timeout.
    #[error("supervising process did not respond in time")]
    Timeout,

    /// The hub is shutting down or the queue receiver is gone.
    #[error("server shutting down")]
    ShuttingDown,

    /// The reply slot was dropped without a reply.
    #[error("supervising process dropped the action without replying")]
    Dropped,

    /// The supervising process executed the action and reported a failure.
    #[error("{0}")]
    Rejected(String),
}

impl From<serde_json::Error> for BrainError {
    fn from(err: serde_json::Error) -> Self {
        BrainError::Marshal(err.to_string())
    }
}

/// Errors seen by [`crate::Client`] callers.
///
/// Everything except [`ClientError::Server`] is a connectivity failure; the
/// server variant carries a domain error string reported by the hub.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Dialing the socket failed.
    #[error("connect to brain server: {0}")]
    Connect(#[source] std::io::Error),

    /// Reading or writing the connection failed.
    #[error("socket I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The call did not complete before its deadline.
    #[error("brain server did not answer within {0:?}")]
    Timeout(std::time::Duration),

    /// The request could not be serialized.
    #[error("marshal request: {0}")]
    Encode(#[source] serde_json::Error),

    /// The response (or its payload) could not be decoded.
    #[error("unmarshal response: {0}")]
    Decode(#[source] serde_json::Error),

    /// The server closed the connection without answering.
    #[error("no response from brain server")]
    Closed,

    /// The server processed the request and reported a domain error.
    #[error("brain server error: {0}")]
    Server(String),
}

impl ClientError {
    /// True for failures to reach the hub, as opposed to errors it reported.
    pub fn is_transport(&self) -> bool {
        !matches!(self, ClientError::Server(_))
    }
}
