//! Agent: receives sealed requests, forwards them locally and answers the sender.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use ntunnel_shared::crypto::{self, Identity, Keypair, SealedMessage};
use ntunnel_shared::dedup::SeenCache;
use ntunnel_shared::protocol;
use ntunnel_shared::transport::{Bus, Endpoint, Subscription};

use crate::forward::Forwarder;

/// Pause before re-subscribing after the bus drops us
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// A failure while handling one inbound message. The message is dropped.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot open message: {0}")]
    Unwrap(#[source] ntunnel_shared::Error),

    #[error("malformed request from {sender}: {source}")]
    Parse {
        sender: String,
        #[source]
        source: ntunnel_shared::Error,
    },

    #[error("cannot seal response {id}: {source}")]
    Seal {
        id: String,
        #[source]
        source: ntunnel_shared::Error,
    },

    #[error("cannot publish response {id}: {source}")]
    Publish {
        id: String,
        #[source]
        source: ntunnel_shared::Error,
    },
}

impl DispatchError {
    pub fn stage(&self) -> &'static str {
        match self {
            DispatchError::Unwrap(_) => "unwrap",
            DispatchError::Parse { .. } => "parse",
            DispatchError::Seal { .. } => "seal",
            DispatchError::Publish { .. } => "publish",
        }
    }
}

/// Outcome of a fully handled request
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub id: String,
    pub status: u16,
    pub endpoint: Endpoint,
}

struct AgentContext {
    keypair: Keypair,
    bus: Bus,
    forwarder: Forwarder,
}

pub struct Agent {
    ctx: Arc<AgentContext>,
    seen: SeenCache,
}

impl Agent {
    pub fn new(keypair: Keypair, bus: Bus, forwarder: Forwarder) -> Self {
        Self {
            ctx: Arc::new(AgentContext {
                keypair,
                bus,
                forwarder,
            }),
            seen: SeenCache::default(),
        }
    }

    pub fn with_seen_capacity(mut self, capacity: usize) -> Self {
        self.seen = SeenCache::new(capacity);
        self
    }

    pub fn identity(&self) -> Identity {
        self.ctx.keypair.identity()
    }

    /// Number of message ids currently remembered
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// First sighting of `message`? Later copies return false.
    pub fn accept(&mut self, message: &SealedMessage) -> bool {
        let id = message.id();
        if self.seen.insert(&id) {
            true
        } else {
            debug!("Duplicate message {} dropped", &id[..12]);
            false
        }
    }

    pub fn print_banner(&self) {
        let target = self.ctx.forwarder.target().to_string();
        println!("\n╔══════════════════════════════════════════════════════════════════════════╗");
        println!("║  🚀 NTunnel Agent Active                                                 ║");
        println!("╠══════════════════════════════════════════════════════════════════════════╣");
        println!("║  Identity: {:<62}║", self.identity().to_string());
        println!("║  Target:   {:<62}║", target);
        for endpoint in self.ctx.bus.endpoints() {
            println!("║  Relay:    {:<62}║", endpoint.as_str());
        }
        println!("║  Max response: {:<58}║", format!("{} bytes", self.ctx.forwarder.max_response_size()));
        println!("╚══════════════════════════════════════════════════════════════════════════╝\n");
        println!("Press Ctrl+C to stop the agent\n");
    }

    /// Serve until `shutdown` resolves. Re-subscribes whenever the bus drops us.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            let subscription = tokio::select! {
                _ = &mut shutdown => break,
                sub = self.ctx.bus.subscribe(self.identity()) => sub,
            };

            match subscription {
                Ok(subscription) => {
                    info!(
                        "Listening for requests on {} endpoint(s)",
                        self.ctx.bus.endpoints().len()
                    );
                    if self.dispatch(subscription, &mut shutdown).await {
                        break;
                    }
                    warn!("Subscription ended. Resubscribing in {}s...", RESUBSCRIBE_DELAY.as_secs());
                }
                Err(e) => {
                    error!("Subscribe failed: {}. Retrying in {}s...", e, RESUBSCRIBE_DELAY.as_secs());
                }
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }

        info!("Agent stopped");
    }

    /// Returns true when stopped by `shutdown`, false when the subscription ended.
    async fn dispatch<F>(&mut self, mut subscription: Subscription, shutdown: &mut std::pin::Pin<&mut F>) -> bool
    where
        F: Future<Output = ()>,
    {
        loop {
            tokio::select! {
                _ = shutdown.as_mut() => {
                    subscription.close();
                    return true;
                }
                msg = subscription.next() => match msg {
                    Some(message) => {
                        if !self.accept(&message) {
                            continue;
                        }
                        let ctx = self.ctx.clone();
                        tokio::spawn(async move {
                            report(ctx.process(message).await);
                        });
                    }
                    None => return false,
                },
            }
        }
    }
}

impl AgentContext {
    async fn process(&self, message: SealedMessage) -> Result<Dispatched, DispatchError> {
        let (plaintext, sender) =
            crypto::unwrap(&self.keypair, &message).map_err(DispatchError::Unwrap)?;

        let request = protocol::parse_request(&plaintext).map_err(|source| DispatchError::Parse {
            sender: sender.short(),
            source,
        })?;
        info!(
            "📥 {} {} from {} (id: {})",
            request.method,
            request.path,
            sender.short(),
            request.id
        );

        let response = self.forwarder.forward(&request).await;
        let status = response.status();

        let sealed = protocol::serialize(&response)
            .and_then(|payload| crypto::wrap(&self.keypair, &sender, &payload))
            .map_err(|source| DispatchError::Seal {
                id: request.id.clone(),
                source,
            })?;

        let endpoint = self
            .bus
            .publish(sealed)
            .await
            .map_err(|source| DispatchError::Publish {
                id: request.id.clone(),
                source,
            })?;

        Ok(Dispatched {
            id: request.id,
            status,
            endpoint,
        })
    }
}

fn report(result: Result<Dispatched, DispatchError>) {
    match result {
        Ok(done) => info!("📤 {} → {} via {}", done.id, done.status, done.endpoint),
        Err(e) => warn!(stage = e.stage(), "Dropped message: {}", e),
    }
}
