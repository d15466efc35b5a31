use lxd_ops::{Client, HttpTransport, Method};

#[tokio::main(flavor = "current_thread")]
async fn main() -> lxd_ops::Result<()> {
    // Adjust the address to your environment; the daemon must trust this client.
    let client = Client::new(HttpTransport::new("https://127.0.0.1:8443")?);

    let body = serde_json::json!({
        "name": "demo",
        "source": {"type": "image", "alias": "alpine/edge"},
    });
    let (op, _) = client
        .query_operation(Method::Post, "/instances", Some(&body), "")
        .await?;

    op.add_handler(|state| println!("{}: {}", state.id, state.status))
        .await?;
    op.wait().await?;

    println!("created, final state = {:?}", op.current_state().status_code);
    Ok(())
}
