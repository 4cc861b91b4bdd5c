// ABOUTME: End-to-end tests for the brain server over a real Unix socket.
// ABOUTME: Each test binds its own socket in a temp dir and talks to it through Client.

use hivemind_brain::protocol::{CreateInstanceParams, InjectMessageParams};
use hivemind_brain::{
    run_supervisor, Client, ClientError, EventFilter, EventType, HeadlessExecutor, Request,
    Response, Server, ServerSettings, TaskStatus, WorkflowTask,
};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

const REPO: &str = "/work/repo";

async fn start(settings: ServerSettings) -> (TempDir, Server, Client) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brain.sock");
    let server = Server::new(&path, settings);
    server.start().await.unwrap();
    let client = Client::new(&path).with_relay_timeout(Duration::from_secs(5));
    (dir, server, client)
}

/// Server with a headless supervisor draining its action queue.
async fn start_supervised() -> (TempDir, Server, Client, Arc<HeadlessExecutor>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brain.sock");
    let mut server = Server::new(&path, ServerSettings::default());
    let actions = server.take_actions().unwrap();
    server.start().await.unwrap();

    let executor = Arc::new(HeadlessExecutor::new(server.events(), REPO).with_manager(server.manager()));
    tokio::spawn(run_supervisor(actions, executor.clone(), server.closed()));

    let client = Client::new(&path).with_relay_timeout(Duration::from_secs(5));
    (dir, server, client, executor)
}

async fn raw_exchange(server: &Server, line: &[u8]) -> Response {
    let mut stream = UnixStream::connect(server.socket_path()).await.unwrap();
    stream.write_all(line).await.unwrap();
    let mut reader = BufReader::new(stream);
    let mut reply = String::new();
    reader.read_line(&mut reply).await.unwrap();
    serde_json::from_str(reply.trim_end()).unwrap()
}

#[tokio::test]
async fn test_ping_and_socket_permissions() {
    let (_dir, server, client) = start(ServerSettings::default()).await;

    client.ping().await.unwrap();

    let mode = std::fs::metadata(server.socket_path()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    server.stop().await;
}

#[tokio::test]
async fn test_stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brain.sock");
    std::fs::write(&path, b"left over").unwrap();

    let server = Server::new(&path, ServerSettings::default());
    server.start().await.unwrap();
    Client::new(&path).ping().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_method_is_a_server_error() {
    let (_dir, server, client) = start(ServerSettings::default()).await;

    let err = client
        .call(&Request::new("frobnicate"), Duration::from_secs(2))
        .await
        .unwrap_err();
    match err {
        ClientError::Server(msg) => assert_eq!(msg, "unknown method: frobnicate"),
        other => panic!("expected server error, got {other:?}"),
    }
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_request_gets_error_response() {
    let (_dir, server, client) = start(ServerSettings::default()).await;

    let response = raw_exchange(&server, b"this is not json\n").await;
    assert!(!response.ok);
    assert!(response.error.unwrap().starts_with("invalid request"));

    // The server keeps serving after a bad request.
    client.ping().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_file_conflicts_are_reported() {
    let (_dir, server, client) = start(ServerSettings::default()).await;

    let first = client
        .update_status(REPO, "a", "auth", &["src/auth.rs".into()], Some("coder"))
        .await
        .unwrap();
    assert!(first.conflicts.is_empty());

    let second = client
        .update_status(REPO, "b", "login", &["src/auth.rs".into(), "src/ui.rs".into()], None)
        .await
        .unwrap();
    assert_eq!(
        second.conflicts,
        vec!["src/auth.rs is also being worked on by: a".to_string()]
    );

    // Other repositories are independent.
    let elsewhere = client
        .update_status("/other", "c", "auth", &["src/auth.rs".into()], None)
        .await
        .unwrap();
    assert!(elsewhere.conflicts.is_empty());

    let state = client.get_state(REPO, "a").await.unwrap();
    assert_eq!(state.agents.len(), 2);
    assert_eq!(state.agents["a"].role.as_deref(), Some("coder"));
    server.stop().await;
}

#[tokio::test]
async fn test_message_cap_and_visibility() {
    let (_dir, server, client) = start(ServerSettings::default()).await;

    for i in 0..55 {
        client
            .send_message(REPO, "a", "", &format!("msg-{i}"))
            .await
            .unwrap();
    }
    client
        .send_message(REPO, "a", "b", "just for b")
        .await
        .unwrap();

    let for_c = client.get_state(REPO, "c").await.unwrap();
    assert_eq!(for_c.messages.len(), 49);
    assert_eq!(for_c.messages[0].content, "msg-6");
    assert!(for_c.messages.iter().all(|m| m.to.is_empty()));

    let for_b = client.get_state(REPO, "b").await.unwrap();
    assert_eq!(for_b.messages.len(), 50);
    assert_eq!(for_b.messages.last().unwrap().content, "just for b");
    server.stop().await;
}

#[tokio::test]
async fn test_workflow_unlocks_dependents() {
    let (_dir, server, client, executor) = start_supervised().await;

    let tasks = vec![
        WorkflowTask::new("t1", "schema").prompt("design the schema"),
        WorkflowTask::new("t2", "fixtures"),
        WorkflowTask::new("t3", "api").depends_on(&["t1", "t2"]),
    ];
    let defined = client.define_workflow(REPO, "architect", &tasks).await.unwrap();
    assert!(defined.workflow_id.starts_with("wf-"));
    assert_eq!(defined.triggered, vec!["t1".to_string(), "t2".to_string()]);

    let spawned = executor.instance("t1").await.unwrap();
    assert!(spawned.from_workflow);
    assert_eq!(spawned.delivered, vec!["design the schema".to_string()]);

    let after_t1 = client
        .complete_task(REPO, "t1", "t1", TaskStatus::Done, "")
        .await
        .unwrap();
    assert!(after_t1.triggered.is_empty());

    let after_t2 = client
        .complete_task(REPO, "t2", "t2", TaskStatus::Done, "")
        .await
        .unwrap();
    assert_eq!(after_t2.triggered, vec!["t3".to_string()]);
    assert!(executor.instance("t3").await.is_some());

    let workflow = client.get_workflow(REPO, "architect").await.unwrap();
    let statuses: Vec<_> = workflow.tasks.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Done, TaskStatus::Done, TaskStatus::Running]
    );
    server.stop().await;
}

#[tokio::test]
async fn test_failed_dependency_blocks_dependents() {
    let (_dir, server, client, _executor) = start_supervised().await;

    let tasks = vec![
        WorkflowTask::new("t1", "build"),
        WorkflowTask::new("t2", "ship").depends_on(&["t1"]),
    ];
    client.define_workflow(REPO, "lead", &tasks).await.unwrap();

    let result = client
        .complete_task(REPO, "t1", "t1", TaskStatus::Failed, "compile error")
        .await
        .unwrap();
    assert!(result.triggered.is_empty());

    let workflow = client.get_workflow(REPO, "lead").await.unwrap();
    assert_eq!(workflow.tasks[0].error, "compile error");
    assert_eq!(workflow.tasks[1].status, TaskStatus::Pending);
    server.stop().await;
}

#[tokio::test]
async fn test_workflow_errors() {
    let (_dir, server, client) = start(ServerSettings::default()).await;

    let empty = client.get_workflow(REPO, "a").await.unwrap();
    assert!(empty.tasks.is_empty());

    let err = client
        .complete_task(REPO, "a", "t1", TaskStatus::Done, "")
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Server(ref m) if m == "no workflow defined for repo"));

    let err = client
        .call(
            &Request::new("define_workflow")
                .caller(REPO, "a")
                .param("tasks", serde_json::json!(["junk"])),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Server(ref m) if m == "no valid tasks provided"));
    server.stop().await;
}

#[tokio::test]
async fn test_inject_message_is_stored_and_delivered() {
    let (_dir, server, client, executor) = start_supervised().await;

    let created = client
        .create_instance(
            REPO,
            "lead",
            &CreateInstanceParams {
                title: "w1".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(created.status, "created");
    assert_eq!(executor.instance("w1").await.unwrap().parent_title, "lead");

    client
        .inject_message(
            REPO,
            "lead",
            &InjectMessageParams {
                to: "w1".into(),
                content: "rebase on main".into(),
                format: String::new(),
            },
        )
        .await
        .unwrap();

    let state = client.get_state(REPO, "w1").await.unwrap();
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].from, "lead");
    assert_eq!(
        executor.instance("w1").await.unwrap().delivered,
        vec!["[HIVEMIND] lead says: rebase on main".to_string()]
    );

    let err = client.kill_instance(REPO, "lead", "ghost").await.unwrap_err();
    assert!(matches!(err, ClientError::Server(ref m) if m == "instance \"ghost\" not found"));
    server.stop().await;
}

#[tokio::test]
async fn test_relay_times_out_without_supervisor() {
    let (_dir, server, client) = start(ServerSettings {
        action_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .await;

    let start = Instant::now();
    let err = client.pause_instance(REPO, "a", "w1").await.unwrap_err();
    assert!(matches!(err, ClientError::Server(ref m) if m == "supervising process did not respond in time"));
    assert!(start.elapsed() >= Duration::from_millis(150));
    server.stop().await;
}

#[tokio::test]
async fn test_subscribe_and_poll_events() {
    let (_dir, server, client) = start(ServerSettings::default()).await;

    let subscriber = client
        .subscribe(&EventFilter {
            types: vec![EventType::StatusChanged],
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(subscriber.starts_with("sub_"));

    client.send_message(REPO, "a", "", "ignored").await.unwrap();
    client
        .update_status(REPO, "a", "auth", &["x.rs".into()], None)
        .await
        .unwrap();

    let events = client
        .poll_events(&subscriber, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::StatusChanged);
    assert_eq!(events[0].source, "a");
    assert!(events[0].sequence > 0);

    client.unsubscribe(&subscriber).await.unwrap();
    let err = client
        .poll_events(&subscriber, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Server(ref m) if m == "subscriber not found"));
    server.stop().await;
}

#[tokio::test]
async fn test_long_poll_wakes_on_emit() {
    let (_dir, server, client) = start(ServerSettings::default()).await;
    let subscriber = client.subscribe(&EventFilter::default()).await.unwrap();

    let poller = client.clone();
    let id = subscriber.clone();
    let waiting = tokio::spawn(async move {
        let start = Instant::now();
        let events = poller.poll_events(&id, Duration::from_secs(10)).await.unwrap();
        (events, start.elapsed())
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    client.remove_agent(REPO, "a").await.unwrap();

    let (events, elapsed) = waiting.await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::AgentRemoved);
    assert!(elapsed < Duration::from_secs(5));
    server.stop().await;
}

#[tokio::test]
async fn test_stop_removes_socket_and_refuses_clients() {
    let (_dir, server, client) = start(ServerSettings::default()).await;
    client.ping().await.unwrap();

    server.stop().await;
    assert!(!server.socket_path().exists());

    let err = client.ping().await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_stop_unblocks_pending_relay() {
    let (_dir, server, client) = start(ServerSettings::default()).await;

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.kill_instance(REPO, "a", "w1").await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let start = Instant::now();
    server.stop().await;
    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Server(ref m) if m == "server shutting down"));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_stop_does_not_wait_for_idle_connection() {
    let (_dir, server, _client) = start(ServerSettings {
        connection_timeout: Duration::from_secs(8),
        ..Default::default()
    })
    .await;

    let _idle = UnixStream::connect(server.socket_path()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    server.stop().await;
    assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());
    assert!(!server.socket_path().exists());
}

#[tokio::test]
async fn test_slow_supervisor_does_not_stack_spawn_timeouts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brain.sock");
    let mut server = Server::new(
        &path,
        ServerSettings {
            action_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    );
    let mut actions = server.take_actions().unwrap();
    server.start().await.unwrap();

    // Accepts spawn requests but never answers them.
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(action) = actions.recv().await {
            held.push(action);
        }
    });

    let client = Client::new(&path).with_relay_timeout(Duration::from_millis(700));
    let result = client
        .define_workflow(
            REPO,
            "architect",
            &[
                WorkflowTask::new("t1", "schema"),
                WorkflowTask::new("t2", "api"),
                WorkflowTask::new("t3", "docs"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(result.triggered, vec!["t1", "t2", "t3"]);

    let workflow = client.get_workflow(REPO, "architect").await.unwrap();
    assert!(workflow.tasks.iter().all(|t| t.status == TaskStatus::Running));

    holder.abort();
    server.stop().await;
}

#[tokio::test]
async fn test_long_poll_outlasts_connection_timeout() {
    let (_dir, server, client) = start(ServerSettings {
        connection_timeout: Duration::from_secs(1),
        ..Default::default()
    })
    .await;
    let subscriber = client.subscribe(&EventFilter::default()).await.unwrap();

    let start = Instant::now();
    let events = client
        .poll_events(&subscriber, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(events.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(1900), "{:?}", start.elapsed());
    server.stop().await;
}

#[tokio::test]
async fn test_idle_subscribers_are_pruned_periodically() {
    let (_dir, server, client) = start(ServerSettings {
        prune_interval: Duration::from_millis(100),
        subscriber_max_age: Duration::from_millis(200),
        ..Default::default()
    })
    .await;
    let subscriber = client.subscribe(&EventFilter::default()).await.unwrap();
    assert_eq!(server.events().subscriber_count().await, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(server.events().subscriber_count().await, 0);
    let err = client
        .poll_events(&subscriber, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Server(ref m) if m == "subscriber not found"));
    server.stop().await;
}
