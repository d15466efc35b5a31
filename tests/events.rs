use std::time::Duration;

use lxd_ops::error::ErrorKind;
use lxd_ops::mock::MockDaemon;
use lxd_ops::types::{Event, EVENT_TYPE_LIFECYCLE, EVENT_TYPE_LOGGING};
use lxd_ops::{Client, Error, Scope, SharedSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn project_scope() -> Scope {
    Scope::Project("default".to_string())
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn concurrent_subscribers_share_one_connection() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon.clone());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.get_events().await }));
    }

    let mut listeners = Vec::new();
    for task in tasks {
        listeners.push(task.await.expect("join")?);
    }

    assert_eq!(daemon.event_connections(), 1);
    assert_eq!(client.events_manager().connection_count(), 1);
    assert_eq!(client.events_manager().listener_count(&project_scope()), 8);
    assert!(listeners.iter().all(|l| l.is_active()));
    Ok(())
}

#[tokio::test]
async fn scopes_get_separate_connections() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon.clone());

    let _project = client.get_events().await?;
    let _all = client.get_events_all_projects().await?;

    assert_eq!(daemon.event_connections(), 2);
    assert_eq!(client.events_manager().listener_count(&Scope::AllProjects), 1);
    Ok(())
}

#[tokio::test]
async fn open_scope_is_joined_while_another_scope_dials() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon.clone());
    let _first = client.get_events().await?;

    let manager = client.events_manager().clone();
    let dialing = tokio::spawn(async move {
        manager
            .subscribe(Scope::AllProjects, || {
                std::future::pending::<lxd_ops::Result<SharedSocket>>()
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = timeout(WAIT, client.get_events()).await.expect("attach")?;
    assert!(second.is_active());
    assert_eq!(daemon.event_connections(), 1);
    assert_eq!(client.events_manager().listener_count(&project_scope()), 2);

    dialing.abort();
    Ok(())
}

#[tokio::test]
async fn handlers_added_and_removed_concurrently() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon);
    let listener = client.get_events().await?;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let listener = listener.clone();
        tasks.push(tokio::spawn(async move {
            let target = listener.add_handler([EVENT_TYPE_LOGGING], |_| {});
            tokio::task::yield_now().await;
            listener.remove_handler(&target).map(|()| target)
        }));
    }

    let mut removed = Vec::new();
    for task in tasks {
        removed.push(task.await.expect("join")?);
    }

    assert_eq!(listener.handler_count(), 0);
    let err = listener.remove_handler(&removed[0]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn disconnect_twice_is_harmless() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon);
    let listener = client.get_events().await?;
    let other = client.get_events().await?;

    listener.disconnect();
    listener.disconnect();

    assert!(!listener.is_active());
    assert!(other.is_active());
    timeout(WAIT, listener.wait()).await.expect("wait")?;
    assert_eq!(client.events_manager().listener_count(&project_scope()), 1);
    Ok(())
}

#[tokio::test]
async fn read_failure_reaches_every_listener() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon.clone());
    let first = client.get_events().await?;
    let second = client.get_events().await?;
    let mut stream = second.stream([EVENT_TYPE_LIFECYCLE]);

    daemon.fail_event_streams("stream reset by peer");

    for listener in [&first, &second] {
        let err = timeout(WAIT, listener.wait())
            .await
            .expect("wait")
            .unwrap_err();
        assert!(err.is_connection());
        assert!(err.to_string().contains("stream reset by peer"));
    }

    let err = timeout(WAIT, stream.recv()).await.expect("recv").unwrap_err();
    assert!(err.to_string().contains("stream reset by peer"));
    assert_eq!(client.events_manager().connection_count(), 0);

    // The next subscriber dials a fresh connection.
    let _again = client.get_events().await?;
    assert_eq!(daemon.event_connections(), 2);
    Ok(())
}

#[tokio::test]
async fn stream_delivers_only_requested_types_in_order() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon.clone());
    let listener = client.get_events().await?;
    let mut stream = listener.stream([EVENT_TYPE_LIFECYCLE]);

    daemon.emit(&Event::new(EVENT_TYPE_LOGGING, serde_json::json!({"message": "noise"})));
    for n in 0..5 {
        daemon.emit(&Event::new(EVENT_TYPE_LIFECYCLE, serde_json::json!({"n": n})));
    }

    for n in 0..5 {
        let ev = timeout(WAIT, stream.recv()).await.expect("recv")?;
        assert_eq!(ev.event_type, EVENT_TYPE_LIFECYCLE);
        assert_eq!(ev.metadata["n"], n);
    }
    Ok(())
}

#[tokio::test]
async fn callback_handlers_receive_matching_events() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon.clone());
    let listener = client.get_events().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let target = listener.add_handler(Vec::<String>::new(), move |ev| {
        let _ = tx.send(ev.event_type);
    });
    assert!(target.matches("anything"));

    daemon.emit(&Event::new(EVENT_TYPE_LOGGING, serde_json::json!({})));
    let got = timeout(WAIT, rx.recv()).await.expect("recv");
    assert_eq!(got.as_deref(), Some(EVENT_TYPE_LOGGING));
    Ok(())
}

#[tokio::test]
async fn malformed_frames_are_skipped() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon.clone());
    let listener = client.get_events().await?;
    let mut stream = listener.stream(Vec::<String>::new());

    daemon.emit_frame("not json at all");
    daemon.emit_frame(r#"{"type": "", "metadata": {}}"#);
    daemon.emit(&Event::new(EVENT_TYPE_LIFECYCLE, serde_json::json!({"ok": true})));

    let ev = timeout(WAIT, stream.recv()).await.expect("recv")?;
    assert_eq!(ev.event_type, EVENT_TYPE_LIFECYCLE);
    assert!(listener.is_active());
    Ok(())
}

#[tokio::test]
async fn publish_needs_an_open_connection() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon.clone());
    let event = Event::new(EVENT_TYPE_LOGGING, serde_json::json!({"message": "hello"}));

    let err = client.send_event(&event).await.unwrap_err();
    assert!(matches!(err, Error::NoConnection));

    let _listener = client.get_events().await?;
    client.send_event(&event).await?;

    assert!(eventually(|| daemon.received_events().contains(&event)).await);
    Ok(())
}

#[tokio::test]
async fn idle_connection_is_closed_after_last_listener_leaves() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::builder(daemon.clone())
        .event_idle_timeout(Duration::from_millis(30))
        .build();

    let listener = client.get_events().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(daemon.open_event_streams(), 1, "busy connection must stay open");

    listener.disconnect();
    assert!(eventually(|| daemon.open_event_streams() == 0).await);
    assert_eq!(client.events_manager().connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn shutdown_ends_listeners_without_error() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon.clone());
    let listener = client.get_events().await?;
    let mut stream = listener.stream(Vec::<String>::new());

    client.disconnect();

    timeout(WAIT, listener.wait()).await.expect("wait")?;
    let err = timeout(WAIT, stream.recv()).await.expect("recv").unwrap_err();
    assert!(matches!(err, Error::Disconnected));
    assert!(eventually(|| daemon.open_event_streams() == 0).await);

    let err = client.get_events().await.unwrap_err();
    assert!(matches!(err, Error::Disconnected));
    Ok(())
}

#[tokio::test]
async fn refused_connection_is_reported_and_not_cached() -> lxd_ops::Result<()> {
    let daemon = MockDaemon::default();
    let client = Client::new(daemon.clone());

    daemon.refuse_event_streams(Some("connection refused"));
    let err = client.get_events().await.unwrap_err();
    assert!(err.is_connection());

    daemon.refuse_event_streams(None);
    let listener = client.get_events().await?;
    assert!(listener.is_active());
    Ok(())
}

#[tokio::test]
async fn disabled_listeners_are_unsupported() {
    let client = Client::builder(MockDaemon::default())
        .skip_event_listener(true)
        .build();

    let err = client.get_events().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}
