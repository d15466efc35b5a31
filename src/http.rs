//! HTTP(S) transport.
//!
//! Requests go through `reqwest`; socket upgrades through
//! `tokio-tungstenite`. A daemon that checks client certificates needs
//! [`HttpTransport::with_tls`], which hands the same [`rustls::ClientConfig`]
//! to both. A client passed to [`HttpTransport::with_client`] only covers
//! plain requests.

use std::{fmt, sync::Arc, time::Duration};

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::Value;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{tungstenite::Message, Connector, MaybeTlsStream, WebSocketStream};

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    transport::{BoxFuture, Frame, Method, SharedSocket, Socket, Transport},
    types::Response,
};

/// Upper bound on a websocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport talking to a daemon over HTTP(S).
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    ws_url: String,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl HttpTransport {
    /// Transport for `base_url` (e.g. `https://10.0.0.1:8443`) with a default client.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Transport for `base_url` authenticating requests and socket upgrades
    /// with `tls`.
    pub fn with_tls(base_url: &str, tls: Arc<rustls::ClientConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(rustls::ClientConfig::clone(&tls))
            .build()
            .map_err(|e| Error::invalid_input(format!("failed to build HTTP client: {e}")))?;

        let mut transport = Self::with_client(client, base_url)?;
        transport.tls = Some(tls);
        Ok(transport)
    }

    /// Transport for `base_url` using a preconfigured client.
    ///
    /// Socket upgrades use the default TLS setup without a client identity.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let ws_url = if let Some(rest) = base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if base_url.starts_with("unix:") {
            return Err(Error::unsupported(
                "unix socket endpoints need a custom transport",
            ));
        } else {
            return Err(Error::invalid_input(format!(
                "unsupported daemon URL: {base_url}"
            )));
        };

        Ok(Self {
            client,
            base_url,
            ws_url,
            tls: None,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        etag: &str,
    ) -> Result<(Response, String)> {
        let method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut req = self
            .client
            .request(method, format!("{}/1.0{path}", self.base_url));
        if let Some(body) = body {
            req = req.json(body);
        }
        if !etag.is_empty() {
            req = req.header(reqwest::header::IF_MATCH, etag);
        }

        let resp = req.send().await.map_err(|e| Error::connection(e.to_string()))?;
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::connection(e.to_string()))?;

        let mut deserializer = serde_json::Deserializer::from_slice(&bytes);
        let envelope: Response = serde_path_to_error::deserialize(&mut deserializer)
            .map_err(|e| Error::protocol(format!("failed to decode response: {e}")))?;

        Ok((envelope.check()?, etag))
    }

    async fn connect(&self, path: &str) -> Result<SharedSocket> {
        let url = format!("{}/1.0{path}", self.ws_url);
        let handshake =
            tokio_tungstenite::connect_async_tls_with_config(url, None, false, self.connector());
        let (stream, _resp) = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(res) => res.map_err(|e| Error::connection(e.to_string()))?,
            Err(_) => {
                return Err(Error::connection(format!(
                    "websocket handshake timed out after {HANDSHAKE_TIMEOUT:?}"
                )))
            }
        };

        let (writer, reader) = stream.split();
        Ok(Arc::new(WsSocket {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancelToken::new(),
        }))
    }
}

impl HttpTransport {
    fn connector(&self) -> Option<Connector> {
        self.tls.as_ref().map(|tls| Connector::Rustls(Arc::clone(tls)))
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("client_tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl Transport for HttpTransport {
    fn query<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        body: Option<&'a Value>,
        etag: &'a str,
    ) -> BoxFuture<'a, Result<(Response, String)>> {
        Box::pin(self.send(method, path, body, etag))
    }

    fn open_socket<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<SharedSocket>> {
        Box::pin(self.connect(path))
    }
}

struct WsSocket {
    reader: Mutex<SplitStream<WsStream>>,
    writer: Mutex<SplitSink<WsStream, Message>>,
    closed: CancelToken,
}

impl WsSocket {
    async fn next_frame(&self) -> Result<Option<Frame>> {
        let mut reader = self.reader.lock().await;
        loop {
            let msg = tokio::select! {
                biased;
                () = self.closed.cancelled() => return Ok(None),
                msg = reader.next() => msg,
            };

            match msg {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Frame::Binary(data))),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Error::connection(e.to_string())),
            }
        }
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Disconnected);
        }

        let msg = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.writer
            .lock()
            .await
            .send(msg)
            .await
            .map_err(|e| Error::connection(e.to_string()))
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        let _ = self.writer.lock().await.close().await;
        Ok(())
    }
}

impl Socket for WsSocket {
    fn recv(&self) -> BoxFuture<'_, Result<Option<Frame>>> {
        Box::pin(self.next_frame())
    }

    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.write(frame))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.shutdown())
    }
}
