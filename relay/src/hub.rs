//! Subscription routing and the replay backlog.
//!
//! Every accepted message is stored (oldest evicted first) and copied to each
//! live subscription whose recipient matches. A new subscription first gets
//! the stored matches, then an end-of-stored-events marker.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use ntunnel_shared::crypto::{Identity, SealedMessage};
use ntunnel_shared::frame::{RelayFrame, WireMessage};
use ntunnel_shared::protocol::MAX_MESSAGE_SIZE;

use crate::metrics::Metrics;

/// Default number of messages kept for replay
pub const DEFAULT_BACKLOG: usize = 1000;

/// (connection, subscription id)
type SubKey = (u64, String);

struct Subscriber {
    recipient: Identity,
    tx: mpsc::Sender<RelayFrame>,
}

struct Stored {
    id: String,
    recipient: Identity,
    message: WireMessage,
}

struct Backlog {
    order: VecDeque<Stored>,
    ids: HashSet<String>,
    capacity: usize,
}

impl Backlog {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, stored: Stored) {
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest.id);
            }
        }
        self.ids.insert(stored.id.clone());
        self.order.push_back(stored);
    }
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    subscribers: DashMap<SubKey, Subscriber>,
    backlog: Mutex<Backlog>,
    next_conn: AtomicU64,
    metrics: Metrics,
}

impl Hub {
    pub fn new(backlog_capacity: usize, metrics: Metrics) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: DashMap::new(),
                backlog: Mutex::new(Backlog::new(backlog_capacity)),
                next_conn: AtomicU64::new(1),
                metrics,
            }),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Messages currently held for replay
    pub async fn stored(&self) -> usize {
        self.inner.backlog.lock().await.order.len()
    }

    /// Register a client connection
    pub fn connect(&self) -> u64 {
        self.inner.metrics.connection_opened();
        self.inner.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop a connection and all of its subscriptions
    pub fn disconnect(&self, conn: u64) {
        let before = self.inner.subscribers.len();
        self.inner.subscribers.retain(|(c, _), _| *c != conn);
        let removed = before.saturating_sub(self.inner.subscribers.len());
        self.inner.metrics.subscriptions_closed(removed as u64);
        self.inner.metrics.connection_closed();
    }

    /// Store and fan out one message; returns the frame to answer the publisher with.
    pub async fn publish(&self, wire: WireMessage) -> RelayFrame {
        let started = Instant::now();
        let metrics = &self.inner.metrics;

        let sealed = match SealedMessage::try_from(&wire) {
            Ok(sealed) => sealed,
            Err(e) => {
                metrics.record_rejected();
                return RelayFrame::Ok {
                    id: wire.id(),
                    accepted: false,
                    reason: Some(format!("invalid message: {}", e)),
                };
            }
        };
        let id = sealed.id();

        if sealed.payload.len() > MAX_MESSAGE_SIZE {
            metrics.record_rejected();
            return RelayFrame::Ok {
                id,
                accepted: false,
                reason: Some(format!(
                    "message of {} bytes exceeds limit of {}",
                    sealed.payload.len(),
                    MAX_MESSAGE_SIZE
                )),
            };
        }

        {
            let mut backlog = self.inner.backlog.lock().await;
            if backlog.ids.contains(&id) {
                metrics.record_duplicate();
                return RelayFrame::Ok {
                    id,
                    accepted: true,
                    reason: Some("duplicate".into()),
                };
            }
            backlog.push(Stored {
                id: id.clone(),
                recipient: sealed.recipient,
                message: wire.clone(),
            });
        }

        let mut delivered = 0;
        for entry in self.inner.subscribers.iter() {
            if entry.recipient != sealed.recipient {
                continue;
            }
            let frame = RelayFrame::Message {
                sub: entry.key().1.clone(),
                message: wire.clone(),
            };
            match entry.tx.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Subscriber {} is behind, dropped {}", entry.key().1, &id[..12]);
                    metrics.record_dropped();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        debug!("Stored {} for {}, {} live copies", &id[..12], sealed.recipient.short(), delivered);

        metrics.record_delivered(delivered);
        metrics
            .record_publish(sealed.payload.len() as u64, started.elapsed().as_micros() as u64)
            .await;

        RelayFrame::Ok {
            id,
            accepted: true,
            reason: None,
        }
    }

    /// Open (or replace) `sub` on `conn`; returns the stored matches followed by EOSE.
    pub async fn subscribe(
        &self,
        conn: u64,
        sub: String,
        recipient: &str,
        tx: mpsc::Sender<RelayFrame>,
    ) -> Vec<RelayFrame> {
        let recipient: Identity = match recipient.parse() {
            Ok(recipient) => recipient,
            Err(e) => {
                return vec![RelayFrame::Notice {
                    message: format!("invalid recipient for {}: {}", sub, e),
                }]
            }
        };

        let previous = self
            .inner
            .subscribers
            .insert((conn, sub.clone()), Subscriber { recipient, tx });
        if previous.is_none() {
            self.inner.metrics.subscription_opened();
        }

        let mut frames: Vec<RelayFrame> = {
            let backlog = self.inner.backlog.lock().await;
            backlog
                .order
                .iter()
                .filter(|stored| stored.recipient == recipient)
                .map(|stored| RelayFrame::Message {
                    sub: sub.clone(),
                    message: stored.message.clone(),
                })
                .collect()
        };
        self.inner.metrics.record_delivered(frames.len() as u64);
        debug!("{} subscribed for {}, replaying {}", sub, recipient.short(), frames.len());

        frames.push(RelayFrame::Eose { sub });
        frames
    }

    pub fn close(&self, conn: u64, sub: &str) {
        if self
            .inner
            .subscribers
            .remove(&(conn, sub.to_string()))
            .is_some()
        {
            self.inner.metrics.subscriptions_closed(1);
        }
    }
}
