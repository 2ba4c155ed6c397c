//! Publish/subscribe abstraction over a set of bus endpoints.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::crypto::{Identity, SealedMessage};
use crate::{Error, Result};

/// Default bound on waiting for the first endpoint acknowledgement
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

const SUBSCRIPTION_BUFFER: usize = 256;

/// One independent delivery point of the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Parse a comma-separated endpoint list, skipping blanks
pub fn parse_endpoints(list: &str) -> Vec<Endpoint> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Endpoint::from)
        .collect()
}

/// Transport adapter consumed by the agent and the client
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hand `message` to a single endpoint; returns once that endpoint acknowledges.
    async fn send(&self, endpoint: &Endpoint, message: SealedMessage) -> Result<()>;

    /// Watch `endpoints` for messages addressed to `recipient`.
    async fn subscribe(&self, endpoints: &[Endpoint], recipient: Identity) -> Result<Subscription>;
}

/// Stream of inbound messages. Dropping or closing it cancels delivery.
pub struct Subscription {
    inbound: mpsc::Receiver<SealedMessage>,
}

/// Producer side of a [`Subscription`], handed to per-endpoint readers
#[derive(Clone)]
pub struct SubscriptionFeed {
    tx: mpsc::Sender<SealedMessage>,
}

impl Subscription {
    pub fn channel() -> (Self, SubscriptionFeed) {
        let (tx, inbound) = mpsc::channel(SUBSCRIPTION_BUFFER);
        (Self { inbound }, SubscriptionFeed { tx })
    }

    /// Next inbound message; `None` once every endpoint reader has stopped.
    pub async fn next(&mut self) -> Option<SealedMessage> {
        self.inbound.recv().await
    }

    pub fn close(mut self) {
        self.inbound.close();
    }
}

impl SubscriptionFeed {
    /// Returns false once the subscription is gone.
    pub async fn deliver(&self, message: SealedMessage) -> bool {
        self.tx.send(message).await.is_ok()
    }

    /// Resolves when the subscription is closed or dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A transport bound to the configured endpoints
#[derive(Clone)]
pub struct Bus {
    transport: Arc<dyn Transport>,
    endpoints: Vec<Endpoint>,
    publish_timeout: Duration,
}

impl Bus {
    pub fn new(transport: Arc<dyn Transport>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            transport,
            endpoints,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Publish to every endpoint; succeeds with the first one to acknowledge.
    ///
    /// Sends to the slower endpoints keep running after the first ack, each
    /// bounded by the publish timeout.
    pub async fn publish(&self, message: SealedMessage) -> Result<Endpoint> {
        if self.endpoints.is_empty() {
            return Err(Error::PublishFailed("no endpoints configured".into()));
        }

        let (tx, mut rx) = mpsc::channel(self.endpoints.len());
        for endpoint in &self.endpoints {
            let transport = self.transport.clone();
            let endpoint = endpoint.clone();
            let message = message.clone();
            let tx = tx.clone();
            let limit = self.publish_timeout;
            tokio::spawn(async move {
                let result = match tokio::time::timeout(limit, transport.send(&endpoint, message)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Transport("no acknowledgement".into())),
                };
                let _ = tx.send((endpoint, result)).await;
            });
        }
        drop(tx);

        let race = async {
            let mut failures = Vec::new();
            while let Some((endpoint, result)) = rx.recv().await {
                match result {
                    Ok(()) => return Ok(endpoint),
                    Err(e) => {
                        debug!("Publish to {} failed: {}", endpoint, e);
                        failures.push(format!("{}: {}", endpoint, e));
                    }
                }
            }
            Err(Error::PublishFailed(failures.join("; ")))
        };

        match tokio::time::timeout(self.publish_timeout, race).await {
            Ok(result) => result,
            Err(_) => Err(Error::PublishFailed(format!(
                "no endpoint acknowledged within {}ms",
                self.publish_timeout.as_millis()
            ))),
        }
    }

    pub async fn subscribe(&self, recipient: Identity) -> Result<Subscription> {
        self.transport.subscribe(&self.endpoints, recipient).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        let eps = parse_endpoints(" ws://a:1 ,, ws://b:2,");
        assert_eq!(eps, vec![Endpoint::from("ws://a:1"), Endpoint::from("ws://b:2")]);
        assert!(parse_endpoints("").is_empty());
    }

    #[tokio::test]
    async fn test_subscription_close_is_observed() {
        let (subscription, feed) = Subscription::channel();
        assert!(!feed.is_closed());
        subscription.close();
        feed.closed().await;
        assert!(feed.is_closed());
    }
}
