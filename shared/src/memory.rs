//! In-process multi-endpoint bus.
//!
//! Each endpoint is a broadcast channel. A subscriber watching several
//! endpoints receives one copy per endpoint a message was published to, which
//! is the duplicate delivery a real multi-relay bus produces.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

use crate::crypto::{Identity, SealedMessage};
use crate::transport::{Endpoint, Subscription, Transport};
use crate::{Error, Result};

const ENDPOINT_CAPACITY: usize = 1024;

/// How an endpoint reacts to a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    Online,
    /// Rejects every publish
    Failing,
    /// Never acknowledges
    Unresponsive,
}

struct EndpointState {
    tx: broadcast::Sender<SealedMessage>,
    mode: EndpointMode,
}

impl EndpointState {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(ENDPOINT_CAPACITY);
        Self {
            tx,
            mode: EndpointMode::Online,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    endpoints: Arc<DashMap<Endpoint, EndpointState>>,
    accepted: Arc<AtomicU64>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&self, endpoint: &Endpoint, mode: EndpointMode) {
        self.endpoints
            .entry(endpoint.clone())
            .or_insert_with(EndpointState::new)
            .mode = mode;
    }

    /// Number of per-endpoint sends acknowledged so far
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    fn state(&self, endpoint: &Endpoint) -> (broadcast::Sender<SealedMessage>, EndpointMode) {
        let entry = self
            .endpoints
            .entry(endpoint.clone())
            .or_insert_with(EndpointState::new);
        (entry.tx.clone(), entry.mode)
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn send(&self, endpoint: &Endpoint, message: SealedMessage) -> Result<()> {
        let (tx, mode) = self.state(endpoint);
        match mode {
            EndpointMode::Online => {
                // No receivers is not an error: the message is simply not stored
                let _ = tx.send(message);
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            EndpointMode::Failing => Err(Error::Transport(format!(
                "endpoint {} rejected message",
                endpoint
            ))),
            EndpointMode::Unresponsive => std::future::pending().await,
        }
    }

    async fn subscribe(&self, endpoints: &[Endpoint], recipient: Identity) -> Result<Subscription> {
        let (subscription, feed) = Subscription::channel();

        for endpoint in endpoints {
            let (tx, _) = self.state(endpoint);
            let mut rx = tx.subscribe();
            let feed = feed.clone();
            let endpoint = endpoint.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = feed.closed() => break,
                        msg = rx.recv() => match msg {
                            Ok(message) => {
                                if message.recipient == recipient && !feed.deliver(message).await {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Subscriber on {} lagged, skipped {} messages", endpoint, n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }

        Ok(subscription)
    }
}
