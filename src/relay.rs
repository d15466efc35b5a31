//! Migration relay.
//!
//! Pairs each websocket of a source operation with the matching websocket of
//! a target operation and copies frames both ways until either side closes.

use std::{collections::HashMap, fmt};

use tokio::task::JoinHandle;

use crate::{
    error::{Error, Result},
    operation::Operation,
    transport::SharedSocket,
    types::SECRET_NAME_CONTROL,
};

/// A running relay between two migration operations.
pub struct RelaySession {
    channels: Vec<String>,
    teardown: JoinHandle<()>,
}

struct Proxy {
    source: SharedSocket,
    target: SharedSocket,
    forward: JoinHandle<()>,
}

impl Proxy {
    fn spawn(_name: String, source: SharedSocket, target: SharedSocket) -> Self {
        let (from, to) = (source.clone(), target.clone());
        let forward = tokio::spawn(async move {
            let _res = tokio::select! {
                r = copy_frames(&from, &to) => r,
                r = copy_frames(&to, &from) => r,
            };

            #[cfg(feature = "tracing")]
            tracing::debug!(channel = %_name, error = ?_res.err(), "relay channel ended");
        });

        Self {
            source,
            target,
            forward,
        }
    }

    /// Wait for the copy to end, then close both sockets.
    async fn finish(self) {
        let _ = self.forward.await;
        let _ = self.source.close().await;
        let _ = self.target.close().await;
    }
}

async fn copy_frames(from: &SharedSocket, to: &SharedSocket) -> Result<()> {
    while let Some(frame) = from.recv().await? {
        to.send(frame).await?;
    }
    Ok(())
}

impl RelaySession {
    /// Relay between `source` and `target` using the websocket secrets each
    /// operation currently exposes.
    pub async fn between(source: &Operation, target: &Operation) -> Result<Self> {
        let source_secrets = source.current_state().websocket_secrets()?;
        let target_secrets = target.current_state().websocket_secrets()?;
        Self::start(source, &source_secrets, target, &target_secrets).await
    }

    /// Open the control channel, then every data channel both sides expose.
    ///
    /// Every channel the target expects must be offered by the source, and the
    /// target must expose a control channel; both are checked before any
    /// socket is opened. Data channels that fail to open are skipped along
    /// with the ones after them.
    pub async fn start(
        source: &Operation,
        source_secrets: &HashMap<String, String>,
        target: &Operation,
        target_secrets: &HashMap<String, String>,
    ) -> Result<Self> {
        if let Some(name) = target_secrets
            .keys()
            .find(|name| !source_secrets.contains_key(*name))
        {
            return Err(Error::migration(format!(
                "migration target expects the \"{name}\" socket but source isn't providing it"
            )));
        }

        let target_control = target_secrets
            .get(SECRET_NAME_CONTROL)
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| {
                Error::migration("migration target didn't set up the required \"control\" socket")
            })?;
        let source_control = source_secrets
            .get(SECRET_NAME_CONTROL)
            .ok_or_else(|| Error::migration("migration source didn't set up the \"control\" socket"))?;

        let source_conn = source.websocket(source_control).await?;
        let target_conn = match target.websocket(target_control).await {
            Ok(conn) => conn,
            Err(err) => {
                let _ = source_conn.close().await;
                return Err(err);
            }
        };
        let control = Proxy::spawn(SECRET_NAME_CONTROL.to_string(), source_conn, target_conn);

        let mut names: Vec<&String> = source_secrets
            .keys()
            .filter(|name| name.as_str() != SECRET_NAME_CONTROL && target_secrets.contains_key(*name))
            .collect();
        names.sort();

        let mut channels = vec![SECRET_NAME_CONTROL.to_string()];
        let mut data = Vec::new();
        for name in names {
            let source_conn = match source.websocket(&source_secrets[name]).await {
                Ok(conn) => conn,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(channel = %name, error = %_err, "failed to open source migration socket");
                    break;
                }
            };
            let target_conn = match target.websocket(&target_secrets[name]).await {
                Ok(conn) => conn,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(channel = %name, error = %_err, "failed to open target migration socket");
                    let _ = source_conn.close().await;
                    break;
                }
            };

            channels.push(name.clone());
            data.push(Proxy::spawn(name.clone(), source_conn, target_conn));
        }

        let teardown = tokio::spawn(async move {
            control.finish().await;
            for proxy in data {
                proxy.finish().await;
            }
        });

        Ok(Self { channels, teardown })
    }

    /// Names of the relayed channels, control first.
    #[must_use]
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Whether every channel has been torn down.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.teardown.is_finished()
    }

    /// Wait until every channel has been torn down.
    pub async fn finished(self) {
        let _ = self.teardown.await;
    }
}

impl fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySession")
            .field("channels", &self.channels)
            .field("finished", &self.is_finished())
            .finish()
    }
}
