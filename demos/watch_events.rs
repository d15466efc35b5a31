use lxd_ops::types::{EVENT_TYPE_LIFECYCLE, EVENT_TYPE_OPERATION};
use lxd_ops::{Client, HttpTransport};

#[tokio::main(flavor = "current_thread")]
async fn main() -> lxd_ops::Result<()> {
    let client = Client::new(HttpTransport::new("https://127.0.0.1:8443")?);

    let listener = client.get_events_all_projects().await?;
    let mut events = listener.stream([EVENT_TYPE_LIFECYCLE, EVENT_TYPE_OPERATION]);

    loop {
        let ev = events.recv().await?;
        println!("[{}] {} {}", ev.project, ev.event_type, ev.metadata);
    }
}
