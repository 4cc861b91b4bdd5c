// ABOUTME: Action relay: hands privileged requests to the supervising process and awaits its reply.
// ABOUTME: Bounded mpsc queue of requests, each carrying a one-shot reply slot and a deadline.

use crate::error::RelayError;
use crate::protocol::{ActionKind, Params};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outstanding actions the queue holds before callers are turned away.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// How long a caller waits for the supervising process to reply.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Param key marking create-instance actions issued by workflow actuation.
pub const FROM_WORKFLOW_KEY: &str = "_from_workflow";

/// Reply posted by the supervising process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn success(data: Option<Params>) -> Self {
        Self {
            ok: true,
            data,
            error: None,
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

/// A privileged operation waiting for the supervising process.
#[derive(Debug)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub params: Params,
    reply: oneshot::Sender<ActionResponse>,
}

impl ActionRequest {
    pub fn str_param(&self, key: &str) -> &str {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }

    /// Whether this spawn was issued by workflow actuation rather than an agent.
    pub fn from_workflow(&self) -> bool {
        self.bool_param(FROM_WORKFLOW_KEY).unwrap_or(false)
    }

    /// Post the single reply. Returns false if the requester already gave up.
    pub fn reply(self, response: ActionResponse) -> bool {
        self.reply.send(response).is_ok()
    }
}

/// Sending half, held by the server.
#[derive(Clone)]
pub struct ActionRelay {
    tx: mpsc::Sender<ActionRequest>,
    timeout: Duration,
    closed: CancellationToken,
}

/// Receiving half, drained by the supervising process.
pub struct ActionReceiver {
    rx: mpsc::Receiver<ActionRequest>,
}

impl ActionReceiver {
    /// Next queued action, or `None` once every relay handle is gone.
    pub async fn recv(&mut self) -> Option<ActionRequest> {
        self.rx.recv().await
    }
}

/// Build a relay whose waits are cut short when `closed` is cancelled.
pub fn channel(
    capacity: usize,
    timeout: Duration,
    closed: CancellationToken,
) -> (ActionRelay, ActionReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ActionRelay {
            tx,
            timeout,
            closed,
        },
        ActionReceiver { rx },
    )
}

/// A queued action whose reply has not been collected yet.
pub struct PendingAction {
    kind: ActionKind,
    reply: oneshot::Receiver<ActionResponse>,
    timeout: Duration,
    closed: CancellationToken,
}

impl PendingAction {
    /// Wait for the supervising process's reply. Success carries the
    /// reply's data payload, if any.
    pub async fn wait(self) -> Result<Option<Params>, RelayError> {
        let kind = self.kind;
        tokio::select! {
            _ = self.closed.cancelled() => Err(RelayError::ShuttingDown),
            outcome = tokio::time::timeout(self.timeout, self.reply) => match outcome {
                Err(_) => {
                    warn!(action = %kind, timeout = ?self.timeout, "Action timed out");
                    Err(RelayError::Timeout)
                }
                Ok(Err(_)) => Err(RelayError::Dropped),
                Ok(Ok(response)) if response.ok => Ok(response.data),
                Ok(Ok(response)) => Err(RelayError::Rejected(
                    response.error.unwrap_or_else(|| format!("{kind} failed")),
                )),
            },
        }
    }
}

impl ActionRelay {
    /// Put an action on the queue without waiting for its reply.
    ///
    /// Fails fast when the queue is full. The reply deadline starts when
    /// [`PendingAction::wait`] is first polled.
    pub fn enqueue(&self, kind: ActionKind, params: Params) -> Result<PendingAction, RelayError> {
        if self.closed.is_cancelled() {
            return Err(RelayError::ShuttingDown);
        }

        let (reply, reply_rx) = oneshot::channel();
        let request = ActionRequest {
            kind,
            params,
            reply,
        };

        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(action = %kind, "Action queue full");
                return Err(RelayError::Full);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(RelayError::ShuttingDown),
        }
        debug!(action = %kind, "Action queued");

        Ok(PendingAction {
            kind,
            reply: reply_rx,
            timeout: self.timeout,
            closed: self.closed.clone(),
        })
    }

    /// Queue an action and wait for the supervising process's reply.
    pub async fn send(&self, kind: ActionKind, params: Params) -> Result<Option<Params>, RelayError> {
        self.enqueue(kind, params)?.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn params(value: serde_json::Value) -> Params {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    #[tokio::test]
    async fn test_reply_with_data() {
        let (relay, mut actions) = channel(4, Duration::from_secs(5), CancellationToken::new());

        tokio::spawn(async move {
            let action = actions.recv().await.unwrap();
            assert_eq!(action.kind, ActionKind::CreateInstance);
            let title = action.str_param("title").to_string();
            action.reply(ActionResponse::success(Some(params(
                json!({"title": title, "status": "created"}),
            ))));
        });

        let data = relay
            .send(ActionKind::CreateInstance, params(json!({"title": "w1"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data["title"], "w1");
        assert_eq!(data["status"], "created");
    }

    #[tokio::test]
    async fn test_domain_error_is_rejected() {
        let (relay, mut actions) = channel(4, Duration::from_secs(5), CancellationToken::new());

        tokio::spawn(async move {
            let action = actions.recv().await.unwrap();
            action.reply(ActionResponse::failure("instance limit reached (10)"));
        });

        let err = relay
            .send(ActionKind::CreateInstance, Params::new())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Rejected("instance limit reached (10)".into()));
    }

    #[tokio::test]
    async fn test_timeout_when_nobody_drains() {
        let (relay, _actions) = channel(4, Duration::from_millis(100), CancellationToken::new());

        let start = Instant::now();
        let err = relay
            .send(ActionKind::PauseInstance, Params::new())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let (relay, _actions) = channel(1, Duration::from_secs(5), CancellationToken::new());

        let first = relay.clone();
        tokio::spawn(async move {
            let _ = first.send(ActionKind::KillInstance, Params::new()).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        let err = relay
            .send(ActionKind::KillInstance, Params::new())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Full);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_waiters() {
        let closed = CancellationToken::new();
        let (relay, _actions) = channel(4, Duration::from_secs(30), closed.clone());

        let waiter = tokio::spawn(async move { relay.send(ActionKind::ResumeInstance, Params::new()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        closed.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err, RelayError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_dropped_reply_slot() {
        let (relay, mut actions) = channel(4, Duration::from_secs(5), CancellationToken::new());
        tokio::spawn(async move {
            drop(actions.recv().await);
        });

        let err = relay
            .send(ActionKind::InjectMessage, Params::new())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Dropped);
    }

    #[tokio::test]
    async fn test_queued_actions_share_one_timeout_window() {
        let (relay, mut actions) = channel(4, Duration::from_millis(150), CancellationToken::new());

        let first = relay
            .enqueue(ActionKind::CreateInstance, params(json!({"title": "t1"})))
            .unwrap();
        let second = relay
            .enqueue(ActionKind::CreateInstance, params(json!({"title": "t2"})))
            .unwrap();

        // Hold both requests unanswered; queue order is preserved.
        let held = (actions.recv().await.unwrap(), actions.recv().await.unwrap());
        assert_eq!(held.0.str_param("title"), "t1");
        assert_eq!(held.1.str_param("title"), "t2");

        let start = Instant::now();
        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a.unwrap_err(), RelayError::Timeout);
        assert_eq!(b.unwrap_err(), RelayError::Timeout);
        assert!(start.elapsed() < Duration::from_millis(280));
    }

    #[test]
    fn test_from_workflow_tag() {
        let (reply, _rx) = oneshot::channel();
        let request = ActionRequest {
            kind: ActionKind::CreateInstance,
            params: params(json!({FROM_WORKFLOW_KEY: true, "title": "t1"})),
            reply,
        };
        assert!(request.from_workflow());
        assert_eq!(request.str_param("title"), "t1");
        assert_eq!(request.str_param("missing"), "");
    }
}
