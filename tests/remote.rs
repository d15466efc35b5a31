use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lxd_ops::error::ErrorKind;
use lxd_ops::mock::{MockDaemon, MockScript};
use lxd_ops::types::{OperationState, StatusCode};
use lxd_ops::{Client, Error, Method, Operation, RemoteOperation};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn refused() -> Error {
    Error::Connection {
        message: "connection refused".to_string(),
    }
}

fn urls(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| format!("https://{n}:8443")).collect()
}

type Attempts = Arc<Mutex<Vec<String>>>;
type Created = Pin<Box<dyn Future<Output = lxd_ops::Result<Operation>> + Send>>;

/// Create closure failing with `fail(url)` when it returns `Some`, and
/// otherwise starting the scripted `/instances` operation.
fn creator(
    client: &Client,
    attempts: &Attempts,
    fail: fn(&str) -> Option<Error>,
) -> impl FnMut(String) -> Created + Send + 'static {
    let client = client.clone();
    let attempts = Arc::clone(attempts);
    move |url: String| -> Created {
        let client = client.clone();
        attempts.lock().expect("attempts").push(url.clone());
        Box::pin(async move {
            if let Some(err) = fail(&url) {
                return Err(err);
            }
            let (op, _) = client
                .query_operation(Method::Post, "/instances", None, "")
                .await?;
            Ok(op)
        })
    }
}

fn daemon_with(target: OperationState) -> MockDaemon {
    MockDaemon::new(
        MockScript::new()
            .reply_operation(Method::Post, "/instances", target)
            .reply_operation(
                Method::Post,
                "/instances/src",
                OperationState::new("source", StatusCode::Running),
            ),
    )
}

#[tokio::test]
async fn falls_back_across_addresses_on_connection_errors() -> lxd_ops::Result<()> {
    let daemon = daemon_with(OperationState::new("copy", StatusCode::Success));
    let client = Client::new(daemon);
    let attempts = Attempts::default();

    let remote = RemoteOperation::try_create(
        "Failed remote copy",
        urls(&["a", "b", "c"]),
        None,
        creator(&client, &attempts, |url| {
            (!url.contains("//c:")).then(refused)
        }),
    )?;

    timeout(WAIT, remote.wait()).await.expect("wait")?;
    assert_eq!(*attempts.lock().expect("attempts"), urls(&["a", "b", "c"]));
    assert_eq!(remote.get_target()?.id, "copy");
    Ok(())
}

#[tokio::test]
async fn other_failures_stop_the_attempts() -> lxd_ops::Result<()> {
    let daemon = daemon_with(OperationState::new("copy", StatusCode::Success));
    let client = Client::new(daemon);
    let attempts = Attempts::default();

    let remote = RemoteOperation::try_create(
        "Failed remote copy",
        urls(&["a", "b"]),
        None,
        creator(&client, &attempts, |_| {
            Some(Error::Server {
                status_code: 403,
                message: "not authorized".to_string(),
            })
        }),
    )?;

    let err = timeout(WAIT, remote.wait()).await.expect("wait").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Remote);
    assert_eq!(err.to_string(), "Failed remote copy: not authorized");
    assert_eq!(*attempts.lock().expect("attempts"), urls(&["a"]));
    Ok(())
}

#[tokio::test]
async fn distinct_failures_are_listed_per_address() -> lxd_ops::Result<()> {
    let mut failed = OperationState::new("copy", StatusCode::Failure);
    failed.err = "storage pool is full".to_string();
    let daemon = daemon_with(failed);
    let client = Client::new(daemon);
    let attempts = Attempts::default();

    let remote = RemoteOperation::try_create(
        "Failed remote copy",
        urls(&["a", "b"]),
        None,
        creator(&client, &attempts, |url| url.contains("//a:").then(refused)),
    )?;

    let err = timeout(WAIT, remote.wait()).await.expect("wait").unwrap_err();
    let text = err.to_string();
    assert!(text.starts_with("Failed remote copy:\n - "), "{text}");
    assert!(text.contains("https://a:8443: connection error: connection refused"));
    assert!(text.contains("https://b:8443: storage pool is full"));
    Ok(())
}

#[tokio::test]
async fn total_failure_cancels_the_source_operation() -> lxd_ops::Result<()> {
    let daemon = daemon_with(OperationState::new("copy", StatusCode::Success));
    let client = Client::new(daemon.clone());
    let (source, _) = client
        .query_operation(Method::Post, "/instances/src", None, "")
        .await?;
    let attempts = Attempts::default();

    let remote = RemoteOperation::try_create(
        "Failed remote copy",
        urls(&["a", "b"]),
        Some(source),
        creator(&client, &attempts, |_| Some(refused())),
    )?;

    let err = timeout(WAIT, remote.wait()).await.expect("wait").unwrap_err();
    assert_eq!(err.to_string(), "Failed remote copy: connection error: connection refused");
    assert_eq!(
        daemon.operation("source").map(|op| op.status_code),
        Some(StatusCode::Cancelled)
    );
    Ok(())
}

#[tokio::test]
async fn no_addresses_is_invalid_input() {
    let client = Client::new(MockDaemon::default());
    let attempts = Attempts::default();

    let err = RemoteOperation::try_create(
        "Failed remote copy",
        Vec::new(),
        None,
        creator(&client, &attempts, |_| None),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(err.to_string(), "the source server isn't listening on the network");
}

#[tokio::test]
async fn unbound_remote_has_no_target() -> lxd_ops::Result<()> {
    let remote = RemoteOperation::try_create(
        "Failed remote copy",
        urls(&["a"]),
        None,
        |_url: String| std::future::pending::<lxd_ops::Result<Operation>>(),
    )?;

    assert!(matches!(remote.get_target(), Err(Error::NoTarget)));
    assert!(matches!(remote.cancel_target().await, Err(Error::NoTarget)));

    let placeholder = remote.add_handler(|_| {}).await?.expect("placeholder");
    assert!(placeholder.matches("operation"));

    let err = remote
        .wait_with(lxd_ops::CallOptions::timeout(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    Ok(())
}

#[tokio::test]
async fn early_handlers_follow_the_bound_target() -> lxd_ops::Result<()> {
    let daemon = daemon_with(OperationState::new("copy", StatusCode::Running));
    let client = Client::new(daemon.clone());
    let (go_tx, go_rx) = oneshot::channel::<()>();
    let go_rx = Arc::new(tokio::sync::Mutex::new(Some(go_rx)));

    let create_client = client.clone();
    let remote = RemoteOperation::try_create("Failed remote copy", urls(&["a"]), None, move |_url| {
        let client = create_client.clone();
        let go_rx = Arc::clone(&go_rx);
        async move {
            if let Some(rx) = go_rx.lock().await.take() {
                let _ = rx.await;
            }
            let (op, _) = client
                .query_operation(Method::Post, "/instances", None, "")
                .await?;
            Ok(op)
        }
    })?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    remote
        .add_handler(move |state| {
            let _ = tx.send(state.status_code);
        })
        .await?;
    let _ = go_tx.send(());

    for _ in 0..100 {
        if remote.get_target().is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Let the replayed handler bind before the operation moves.
    tokio::time::sleep(Duration::from_millis(50)).await;
    daemon.complete_operation("copy");

    let code = timeout(WAIT, rx.recv()).await.expect("recv");
    assert_eq!(code, Some(StatusCode::Success));
    timeout(WAIT, remote.wait()).await.expect("wait")?;
    Ok(())
}

#[tokio::test]
async fn post_processing_runs_after_success() -> lxd_ops::Result<()> {
    let client = Client::new(MockDaemon::default());
    let remote = RemoteOperation::track(client.completed_operation());

    let ran = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&ran);
    remote.post_process(async move {
        *flag.lock().expect("flag") = true;
        Err(Error::Remote {
            message: "failed to apply profiles".to_string(),
        })
    });

    let err = timeout(WAIT, remote.wait()).await.expect("wait").unwrap_err();
    assert_eq!(err.to_string(), "failed to apply profiles");
    assert!(*ran.lock().expect("flag"));
    Ok(())
}

#[tokio::test]
async fn post_processing_is_skipped_after_failure() -> lxd_ops::Result<()> {
    let client = Client::new(MockDaemon::default());
    let mut failed = OperationState::new("copy", StatusCode::Failure);
    failed.err = "copy failed".to_string();
    let remote = RemoteOperation::track(client.operation(failed));

    let ran = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&ran);
    remote.post_process(async move {
        *flag.lock().expect("flag") = true;
        Ok(())
    });

    let err = timeout(WAIT, remote.wait()).await.expect("wait").unwrap_err();
    assert_eq!(err.to_string(), "copy failed");
    assert!(!*ran.lock().expect("flag"));
    Ok(())
}
