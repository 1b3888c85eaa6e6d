//! Metric source client: one request per entity, answered with raw rows.
//!
//! The gateway speaks JSON over WebSocket. Each request opens its own connection so a
//! fan-out cycle can run its fetches concurrently.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::error::SourceError;
use crate::types::{EntityId, RawSample, RoleReply};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads telemetry rows for one entity, optionally only those newer than `since`.
pub trait MetricSource: Send + Sync {
    fn fetch_samples<'a>(
        &'a self,
        entity: &'a EntityId,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<Vec<RawSample>, SourceError>>;
}

/// Provisioning side of the gateway, used by the install tracker.
pub trait RoleSource: Send + Sync {
    /// Initial connection attempt that kicks off agent installation on `address`.
    fn begin_install<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<(), SourceError>>;

    /// Current provisioning role of `address`, if the server has one yet.
    fn fetch_role<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, SourceError>>;
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Samples {
        entity: &'a EntityId,
        since: Option<DateTime<Utc>>,
    },
    Role {
        address: &'a str,
    },
    Install {
        address: &'a str,
    },
}

#[derive(Debug, Deserialize)]
struct Ack {
    #[serde(default)]
    ok: bool,
}

#[derive(Debug, Clone)]
pub struct WsSource {
    url: Url,
    timeout: Duration,
}

impl WsSource {
    /// `token`, when given, is passed as the `token` query parameter.
    pub fn new(url: &str, token: Option<&str>) -> Result<Self, SourceError> {
        let mut url = Url::parse(url).map_err(|e| SourceError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SourceError::InvalidUrl(format!(
                "expected ws:// or wss://, got {}://",
                url.scheme()
            )));
        }
        if let Some(t) = token.filter(|t| !t.is_empty()) {
            url.query_pairs_mut().append_pair("token", t);
        }
        Ok(Self {
            url,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn exchange(&self, req: &Request<'_>) -> Result<String, SourceError> {
        let body = serde_json::to_string(req)?;
        let round_trip = async {
            let (mut ws, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| SourceError::Connect {
                    url: self.url.to_string(),
                    reason: e.to_string(),
                })?;
            ws.send(Message::Text(body)).await?;
            let reply = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(t))) => break t,
                    Some(Ok(Message::Binary(b))) => break String::from_utf8_lossy(&b).into_owned(),
                    Some(Ok(Message::Close(_))) | None => return Err(SourceError::Closed),
                    Some(Ok(_)) => continue, // ping/pong
                    Some(Err(e)) => return Err(e.into()),
                }
            };
            let _ = ws.close(None).await;
            Ok::<String, SourceError>(reply)
        };
        tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| SourceError::Timeout(self.timeout))?
    }
}

/// Decode a reply, turning `{"error": "..."}` into a remote failure.
pub fn decode_reply<T: DeserializeOwned>(text: &str) -> Result<T, SourceError> {
    let v: serde_json::Value = serde_json::from_str(text)?;
    if let Some(msg) = v.get("error").and_then(|e| e.as_str()) {
        return Err(SourceError::Remote(msg.to_string()));
    }
    Ok(serde_json::from_value(v)?)
}

impl MetricSource for WsSource {
    fn fetch_samples<'a>(
        &'a self,
        entity: &'a EntityId,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<Vec<RawSample>, SourceError>> {
        Box::pin(async move {
            let text = self.exchange(&Request::Samples { entity, since }).await?;
            decode_reply(&text)
        })
    }
}

impl RoleSource for WsSource {
    fn begin_install<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<(), SourceError>> {
        Box::pin(async move {
            let text = self.exchange(&Request::Install { address }).await?;
            let ack: Ack = decode_reply(&text)?;
            if ack.ok {
                Ok(())
            } else {
                Err(SourceError::Remote("installation was not acknowledged".into()))
            }
        })
    }

    fn fetch_role<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, SourceError>> {
        Box::pin(async move {
            let text = self.exchange(&Request::Role { address }).await?;
            let reply: RoleReply = decode_reply(&text)?;
            Ok(reply.role.filter(|r| !r.is_empty()))
        })
    }
}
