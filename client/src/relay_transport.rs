//! Transport over relay endpoints speaking the WebSocket frame protocol.
//!
//! One connection per relay is shared by every publish and subscription.
//! A dead connection is re-dialled on next use, and each subscription keeps
//! re-attaching to any relay it has lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use ntunnel_shared::crypto::{Identity, SealedMessage};
use ntunnel_shared::frame::{ClientFrame, RelayFrame, WireMessage};
use ntunnel_shared::transport::{Endpoint, Subscription, SubscriptionFeed, Transport};
use ntunnel_shared::{Error, Result};

const OUTBOUND_BUFFER: usize = 256;

/// Default pause before re-attaching to a relay that dropped a subscription
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Relay verdict on one published message
type Ack = std::result::Result<(), String>;

type AckTable = Arc<DashMap<String, oneshot::Sender<Ack>>>;
type SubTable = Arc<DashMap<String, SubscriptionFeed>>;

/// Handle to one live relay connection
#[derive(Clone)]
struct Connection {
    outbound: mpsc::Sender<ClientFrame>,
    acks: AckTable,
    subs: SubTable,
}

impl Connection {
    async fn open(endpoint: &Endpoint) -> Result<Self> {
        info!("Connecting to relay: {}", endpoint);
        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to {}: {}", endpoint, e)))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound, mut rx) = mpsc::channel::<ClientFrame>(OUTBOUND_BUFFER);
        let acks: AckTable = Arc::new(DashMap::new());
        let subs: SubTable = Arc::new(DashMap::new());
        let conn = Connection {
            outbound,
            acks: acks.clone(),
            subs: subs.clone(),
        };

        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            let text = match serde_json::to_string(&frame) {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!("Cannot encode frame for {}: {}", endpoint, e);
                                    continue;
                                }
                            };
                            if let Err(e) = write.send(Message::Text(text)).await {
                                warn!("Send to {} failed: {}", endpoint, e);
                                break;
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => handle_frame(&endpoint, &text, &acks, &subs).await,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("Relay {} error: {}", endpoint, e);
                            break;
                        }
                        _ => {}
                    },
                }
            }

            info!("Relay connection to {} closed", endpoint);
            // Waiting publishers see their ack dropped; subscriptions lose this endpoint
            acks.clear();
            subs.clear();
        });

        Ok(conn)
    }

    async fn send(&self, frame: ClientFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::Transport("relay connection closed".into()))
    }

    fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

async fn handle_frame(endpoint: &Endpoint, text: &str, acks: &AckTable, subs: &SubTable) {
    let frame = match serde_json::from_str::<RelayFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Ignoring unreadable frame from {}: {}", endpoint, e);
            return;
        }
    };

    match frame {
        RelayFrame::Ok {
            id,
            accepted,
            reason,
        } => {
            if let Some((_, tx)) = acks.remove(&id) {
                let verdict = if accepted {
                    Ok(())
                } else {
                    Err(reason.unwrap_or_else(|| "rejected".into()))
                };
                let _ = tx.send(verdict);
            }
        }
        RelayFrame::Message { sub, message } => {
            let feed = subs.get(&sub).map(|f| f.clone());
            let Some(feed) = feed else {
                return;
            };
            match SealedMessage::try_from(&message) {
                Ok(sealed) => {
                    if !feed.deliver(sealed).await {
                        subs.remove(&sub);
                    }
                }
                Err(e) => debug!("Dropping bad message from {}: {}", endpoint, e),
            }
        }
        RelayFrame::Eose { sub } => debug!("{} caught up on {}", endpoint, sub),
        RelayFrame::Notice { message } => warn!("Relay {} notice: {}", endpoint, message),
    }
}

/// Removes an ack slot if the publish is abandoned before the relay answers
struct AckGuard<'a> {
    acks: &'a AckTable,
    id: String,
}

impl Drop for AckGuard<'_> {
    fn drop(&mut self) {
        self.acks.remove(&self.id);
    }
}

#[derive(Clone)]
pub struct RelayTransport {
    connections: Arc<DashMap<Endpoint, Connection>>,
    next_sub: Arc<AtomicU64>,
    retry_delay: Duration,
}

impl Default for RelayTransport {
    fn default() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            next_sub: Arc::new(AtomicU64::new(0)),
            retry_delay: RESUBSCRIBE_DELAY,
        }
    }
}

/// A subscription registered on one relay connection
struct Attached {
    conn: Connection,
    sub: String,
}

impl RelayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between attempts to restore a lost per-relay subscription
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn connection(&self, endpoint: &Endpoint) -> Result<Connection> {
        let existing = self.connections.get(endpoint).map(|c| c.clone());
        if let Some(conn) = existing {
            if !conn.is_closed() {
                return Ok(conn);
            }
            debug!("Re-dialling {}", endpoint);
        }

        let conn = Connection::open(endpoint).await?;
        self.connections.insert(endpoint.clone(), conn.clone());
        Ok(conn)
    }

    async fn attach(
        &self,
        endpoint: &Endpoint,
        recipient: Identity,
        feed: &SubscriptionFeed,
    ) -> Result<Attached> {
        let conn = self.connection(endpoint).await?;
        let sub = format!("sub-{}", self.next_sub.fetch_add(1, Ordering::Relaxed));

        conn.subs.insert(sub.clone(), feed.clone());
        if let Err(e) = conn
            .send(ClientFrame::Subscribe {
                sub: sub.clone(),
                recipient: recipient.to_string(),
            })
            .await
        {
            conn.subs.remove(&sub);
            return Err(e);
        }
        debug!("Subscribed {} on {} for {}", sub, endpoint, recipient.short());

        Ok(Attached { conn, sub })
    }

    /// Keep one relay attached for as long as the subscription lives.
    ///
    /// A relay that was down at subscribe time, or drops later, is re-dialled
    /// every `retry_delay`. The relay replays its backlog on re-attach.
    async fn supervise(
        self,
        endpoint: Endpoint,
        recipient: Identity,
        feed: SubscriptionFeed,
        mut attached: Option<Attached>,
    ) {
        loop {
            if let Some(Attached { conn, sub }) = attached.take() {
                tokio::select! {
                    _ = feed.closed() => {
                        conn.subs.remove(&sub);
                        let _ = conn.send(ClientFrame::Close { sub }).await;
                        return;
                    }
                    _ = conn.outbound.closed() => {
                        conn.subs.remove(&sub);
                    }
                }
                warn!(
                    "Lost subscription on {}. Reconnecting in {}ms...",
                    endpoint,
                    self.retry_delay.as_millis()
                );
            }

            tokio::select! {
                _ = feed.closed() => return,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }

            match self.attach(&endpoint, recipient, &feed).await {
                Ok(restored) => {
                    info!("Subscription restored on {}", endpoint);
                    attached = Some(restored);
                }
                Err(e) => debug!("Relay {} still unavailable: {}", endpoint, e),
            }
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send(&self, endpoint: &Endpoint, message: SealedMessage) -> Result<()> {
        let conn = self.connection(endpoint).await?;
        let wire = WireMessage::from(&message);
        let id = wire.id();

        let (tx, rx) = oneshot::channel();
        conn.acks.insert(id.clone(), tx);
        let _guard = AckGuard {
            acks: &conn.acks,
            id,
        };

        conn.send(ClientFrame::Publish { message: wire }).await?;

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(Error::Transport(format!(
                "{} rejected message: {}",
                endpoint, reason
            ))),
            Err(_) => Err(Error::Transport(format!(
                "connection to {} closed before acknowledgement",
                endpoint
            ))),
        }
    }

    async fn subscribe(&self, endpoints: &[Endpoint], recipient: Identity) -> Result<Subscription> {
        let (subscription, feed) = Subscription::channel();

        let mut initial = Vec::with_capacity(endpoints.len());
        let mut last_error = None;
        for endpoint in endpoints {
            match self.attach(endpoint, recipient, &feed).await {
                Ok(attached) => initial.push((endpoint.clone(), Some(attached))),
                Err(e) => {
                    warn!("Cannot subscribe on {}: {}", endpoint, e);
                    last_error = Some(e);
                    initial.push((endpoint.clone(), None));
                }
            }
        }

        if initial.iter().all(|(_, attached)| attached.is_none()) {
            return Err(last_error
                .unwrap_or_else(|| Error::Transport("no endpoints to subscribe to".into())));
        }

        for (endpoint, attached) in initial {
            tokio::spawn(self.clone().supervise(endpoint, recipient, feed.clone(), attached));
        }
        Ok(subscription)
    }
}
