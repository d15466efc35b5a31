use std::time::Duration;

use lxd_ops::error::ErrorKind;
use lxd_ops::mock::{MockDaemon, MockScript};
use lxd_ops::types::{OperationState, StatusCode};
use lxd_ops::{CallOptions, CancelToken, Client, Error, Method, Operation, Scope};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn running(id: &str) -> OperationState {
    OperationState::new(id, StatusCode::Running)
}

fn daemon_with(id: &str) -> MockDaemon {
    MockDaemon::new(MockScript::new().reply_operation(Method::Post, "/instances", running(id)))
}

async fn start(client: &Client) -> lxd_ops::Result<Operation> {
    let (op, _) = client
        .query_operation(Method::Post, "/instances", None, "")
        .await?;
    Ok(op)
}

#[tokio::test]
async fn operation_completes_through_events() -> lxd_ops::Result<()> {
    let daemon = daemon_with("op1");
    let client = Client::new(daemon.clone());
    let op = start(&client).await?;
    assert!(op.is_event_driven());
    assert_eq!(op.id(), "op1");

    let waiter = tokio::spawn({
        let op = op.clone();
        async move { op.wait().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    daemon.complete_operation("op1");

    timeout(WAIT, waiter).await.expect("wait").expect("join")?;
    assert_eq!(op.current_state().status_code, StatusCode::Success);

    // Waiting again returns the same outcome without touching the daemon.
    op.wait().await?;
    Ok(())
}

#[tokio::test]
async fn failed_operation_reports_daemon_error_text() -> lxd_ops::Result<()> {
    let daemon = daemon_with("op1");
    let client = Client::new(daemon.clone());
    let op = start(&client).await?;

    daemon.fail_operation("op1", "disk full");

    let err = timeout(WAIT, op.wait()).await.expect("wait").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert_eq!(err.to_string(), "disk full");
    assert_eq!(op.current_state().err, "disk full");
    Ok(())
}

#[tokio::test]
async fn terminal_event_during_setup_refresh_is_not_lost() -> lxd_ops::Result<()> {
    let daemon = daemon_with("op1");
    let client = Client::new(daemon.clone());
    let op = start(&client).await?;

    daemon.hold_refreshes();
    let waiter = tokio::spawn({
        let op = op.clone();
        async move { op.wait().await }
    });

    // The refresh is in flight and will answer "Running"; the final event
    // lands while it is held.
    daemon.refresh_held().await;
    daemon.complete_operation("op1");
    daemon.release_refreshes();

    timeout(WAIT, waiter).await.expect("wait").expect("join")?;
    assert_eq!(op.current_state().status_code, StatusCode::Success);
    Ok(())
}

#[tokio::test]
async fn already_final_operation_needs_no_listener() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon.clone());

    let mut state = OperationState::new("done", StatusCode::Failure);
    state.err = "boom".to_string();
    let op = client.operation(state);

    let err = op.wait().await.unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert!(op.add_handler(|_| {}).await?.is_none());
    assert_eq!(daemon.event_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn long_poll_mode_never_opens_event_streams() -> lxd_ops::Result<()> {
    let daemon = daemon_with("op1");
    let client = Client::builder(daemon.clone())
        .skip_event_listener(true)
        .build();
    let op = start(&client).await?;
    assert!(!op.is_event_driven());

    let err = op.add_handler(|_| {}).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let other = Client::new(MockDaemon::default()).get_events().await?;
    let target = other.add_handler(["operation"], |_| {});
    let err = op.remove_handler(&target).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    other.disconnect();

    let waiter = tokio::spawn({
        let op = op.clone();
        async move { op.wait().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    daemon.complete_operation("op1");

    timeout(WAIT, waiter).await.expect("wait").expect("join")?;
    assert_eq!(daemon.event_connections(), 0);
    assert!(daemon
        .requests()
        .iter()
        .any(|r| r == "GET /operations/op1/wait?timeout=-1"));
    Ok(())
}

#[tokio::test]
async fn long_poll_that_expires_is_a_timeout() -> lxd_ops::Result<()> {
    let daemon = daemon_with("op1");
    let client = Client::builder(daemon.clone())
        .skip_event_listener(true)
        .build();
    let op = start(&client).await?;

    let err = op
        .wait_with(CallOptions::timeout(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert!(daemon
        .requests()
        .iter()
        .any(|r| r == "GET /operations/op1/wait?timeout=1"));
    Ok(())
}

#[tokio::test]
async fn cancel_asks_the_daemon() -> lxd_ops::Result<()> {
    let daemon = daemon_with("op1");
    let client = Client::new(daemon.clone());
    let op = start(&client).await?;

    op.cancel().await?;

    let err = timeout(WAIT, op.wait()).await.expect("wait").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert_eq!(op.current_state().status_code, StatusCode::Cancelled);
    assert!(daemon.requests().iter().any(|r| r == "DELETE /operations/op1"));
    Ok(())
}

#[tokio::test]
async fn broken_listener_fails_the_operation() -> lxd_ops::Result<()> {
    let daemon = daemon_with("op1");
    let client = Client::new(daemon.clone());
    let op = start(&client).await?;

    // Binds the listener and starts tracking.
    op.add_handler(|_| {}).await?;
    daemon.fail_event_streams("event stream went away");

    let err = timeout(WAIT, op.wait()).await.expect("wait").unwrap_err();
    assert!(err.is_connection());
    assert!(err.to_string().contains("event stream went away"));
    assert!(op.current_state().err.contains("event stream went away"));
    Ok(())
}

#[tokio::test]
async fn handlers_see_updates_for_their_operation_only() -> lxd_ops::Result<()> {
    let daemon = daemon_with("op1");
    let client = Client::new(daemon.clone());
    let op = start(&client).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let target = op
        .add_handler(move |state| {
            let _ = tx.send(state);
        })
        .await?
        .expect("operation is still running");
    assert!(target.matches("operation"));

    daemon.update_operation(running("someone-else"));
    daemon.complete_operation("op1");

    let state = timeout(WAIT, rx.recv()).await.expect("recv").expect("state");
    assert_eq!(state.id, "op1");
    assert_eq!(state.status_code, StatusCode::Success);

    timeout(WAIT, op.wait()).await.expect("wait")?;
    assert!(op.add_handler(|_| {}).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn wait_honours_timeout_and_cancellation() -> lxd_ops::Result<()> {
    let daemon = daemon_with("op1");
    let client = Client::new(daemon.clone());
    let op = start(&client).await?;

    let err = op
        .wait_with(CallOptions::timeout(Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    let token = CancelToken::new();
    let waiter = tokio::spawn({
        let op = op.clone();
        let token = token.clone();
        async move { op.wait_with(CallOptions::cancel(token)).await }
    });
    token.cancel();
    let err = timeout(WAIT, waiter).await.expect("wait").expect("join").unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // The operation itself keeps being tracked.
    daemon.complete_operation("op1");
    timeout(WAIT, op.wait()).await.expect("wait")?;
    Ok(())
}

#[tokio::test]
async fn failed_request_releases_the_early_listener() {
    let daemon = MockDaemon::new(MockScript::new().reply_error(
        Method::Post,
        "/instances",
        409,
        "Instance already exists",
    ));
    let client = Client::new(daemon);

    let err = client
        .query_operation(Method::Post, "/instances", None, "")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Server { status_code: 409, .. }));
    assert_eq!(err.to_string(), "Instance already exists");

    let scope = Scope::Project("default".to_string());
    assert_eq!(client.events_manager().listener_count(&scope), 0);
}

#[tokio::test]
async fn refresh_of_unknown_operation_fails() {
    let client = Client::new(MockDaemon::default());
    let op = client.operation(running("ghost"));

    let err = op.refresh().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Server);
}

#[tokio::test]
async fn completed_operation_is_a_no_op() -> lxd_ops::Result<()> {
    let client = Client::new(MockDaemon::default());
    let op = client.completed_operation();

    op.wait().await?;
    op.cancel().await?;
    op.refresh().await?;
    Ok(())
}

#[tokio::test]
async fn wait_deadline_covers_the_initial_refresh() -> lxd_ops::Result<()> {
    let daemon = daemon_with("op1");
    let client = Client::new(daemon.clone());
    let op = start(&client).await?;

    daemon.hold_refreshes();
    let err = timeout(WAIT, op.wait_with(CallOptions::timeout(Duration::from_millis(50))))
        .await
        .expect("deadline ignored")
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = timeout(WAIT, op.wait_with(CallOptions::cancel(cancel)))
        .await
        .expect("cancel ignored")
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // Setup is retried by the next wait.
    daemon.release_refreshes();
    let waiter = tokio::spawn({
        let op = op.clone();
        async move { op.wait().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    daemon.complete_operation("op1");
    timeout(WAIT, waiter).await.expect("wait").expect("join")?;
    Ok(())
}

#[tokio::test]
async fn dropped_operation_releases_its_event_connection() -> lxd_ops::Result<()> {
    let daemon = daemon_with("op1");
    let client = Client::builder(daemon.clone())
        .event_idle_timeout(Duration::from_millis(20))
        .build();
    let op = start(&client).await?;
    assert_eq!(daemon.open_event_streams(), 1);

    drop(op);
    assert_eq!(client.events_manager().listener_count(&Scope::Project("default".to_string())), 0);

    let mut closed = false;
    for _ in 0..100 {
        if daemon.open_event_streams() == 0 {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed);
    assert_eq!(client.events_manager().connection_count(), 0);
    Ok(())
}
