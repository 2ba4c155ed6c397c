//! Client side of the tunnel: send a request, wait for the matching response.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use ntunnel_shared::crypto::{self, Identity, Keypair};
use ntunnel_shared::protocol::{self, Headers, HttpMethod, TunnelRequest, TunnelResponseMessage};
use ntunnel_shared::transport::{Bus, Subscription};
use ntunnel_shared::{Error, Result};

/// Default per-call timeout (30 seconds)
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One outstanding call
struct PendingCall {
    slot: oneshot::Sender<TunnelResponseMessage>,
    deadline: Instant,
    watcher: Option<AbortHandle>,
}

type PendingCalls = Arc<DashMap<String, PendingCall>>;

/// Issues calls through the tunnel to a single agent
#[derive(Clone)]
pub struct TunnelClient {
    keypair: Arc<Keypair>,
    agent: Identity,
    bus: Bus,
    pending: PendingCalls,
    timeout: Duration,
}

impl TunnelClient {
    pub fn new(keypair: Keypair, agent: Identity, bus: Bus) -> Self {
        Self {
            keypair: Arc::new(keypair),
            agent,
            bus,
            pending: Arc::new(DashMap::new()),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn agent(&self) -> Identity {
        self.agent
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Calls currently waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// [`call`](Self::call) with the client's default timeout
    pub async fn fetch(
        &self,
        method: HttpMethod,
        path: &str,
        headers: Headers,
        body: Option<Vec<u8>>,
    ) -> Result<TunnelResponseMessage> {
        self.call(method, path, headers, body, self.timeout).await
    }

    /// Send one request and wait up to `timeout` for its response.
    ///
    /// The response subscription is opened before the request is published.
    /// Whatever happens, the call's table entry and subscription are gone when
    /// this returns.
    pub async fn call(
        &self,
        method: HttpMethod,
        path: &str,
        headers: Headers,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<TunnelResponseMessage> {
        let started = Instant::now();
        let deadline = started + timeout;

        let request = TunnelRequest::new(method, path, headers, body);
        let id = request.id.clone();
        let sealed = crypto::wrap(&self.keypair, &self.agent, &protocol::serialize(&request)?)?;
        let timed_out = || Error::Timeout {
            id: id.clone(),
            elapsed: started.elapsed(),
        };

        let subscription = timeout_at(deadline, self.bus.subscribe(self.keypair.identity()))
            .await
            .map_err(|_| timed_out())??;

        // Registered before the watcher runs so its cleanup always finds the entry
        let (slot, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingCall {
                slot,
                deadline,
                watcher: None,
            },
        );
        let _guard = CallGuard {
            id: id.clone(),
            pending: self.pending.clone(),
        };

        let watcher = tokio::spawn(watch(
            subscription,
            id.clone(),
            self.agent,
            self.keypair.clone(),
            self.pending.clone(),
        ));
        if let Some(mut call) = self.pending.get_mut(&id) {
            call.watcher = Some(watcher.abort_handle());
        }

        debug!("→ {} {} (id: {})", request.method, request.path, id);
        let endpoint = timeout_at(deadline, self.bus.publish(sealed))
            .await
            .map_err(|_| timed_out())??;
        debug!("Request {} accepted by {}", id, endpoint);

        match timeout_at(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "subscription ended before response to {}",
                id
            ))),
            Err(_) => Err(timed_out()),
        }
    }
}

/// Clears the call's entry and stops its watcher on every exit path
struct CallGuard {
    id: String,
    pending: PendingCalls,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if let Some(watcher) = self.pending.remove(&self.id).and_then(|(_, call)| call.watcher) {
            watcher.abort();
        }
    }
}

/// Resolve `id` with the first matching response from `agent`.
async fn watch(
    mut subscription: Subscription,
    id: String,
    agent: Identity,
    keypair: Arc<Keypair>,
    pending: PendingCalls,
) {
    while let Some(message) = subscription.next().await {
        let Ok((plaintext, sender)) = crypto::unwrap(&keypair, &message) else {
            continue;
        };
        if sender != agent {
            debug!("Ignoring message from {}", sender.short());
            continue;
        }
        let response = match protocol::parse_response(&plaintext) {
            Ok(response) => response,
            Err(e) => {
                debug!("Ignoring unreadable response: {}", e);
                continue;
            }
        };
        if response.id() != id {
            continue;
        }

        if let Some((_, call)) = pending.remove(&id) {
            let left = call.deadline.saturating_duration_since(Instant::now());
            debug!("← {} {} ({}ms to spare)", response.status(), id, left.as_millis());
            let _ = call.slot.send(response);
        }
        break;
    }

    // Subscription over or call resolved; a still-waiting caller sees the slot drop
    pending.remove(&id);
    subscription.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntunnel_shared::crypto::SealedMessage;
    use ntunnel_shared::memory::{EndpointMode, MemoryBus};
    use ntunnel_shared::protocol::{TunnelErrorResponse, TunnelResponse};
    use ntunnel_shared::transport::{Endpoint, Transport};

    fn endpoints() -> Vec<Endpoint> {
        vec![Endpoint::from("a"), Endpoint::from("b")]
    }

    /// Stand-in agent: answers each request with `replies(request)`.
    fn spawn_fake_agent<F>(memory: &MemoryBus, keys: Keypair, replies: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&TunnelRequest) -> Vec<TunnelResponseMessage> + Send + 'static,
    {
        let memory = memory.clone();
        tokio::spawn(async move {
            let mut inbox = memory.subscribe(&endpoints(), keys.identity()).await.unwrap();
            let bus = Bus::new(Arc::new(memory.clone()), endpoints());
            let mut seen = std::collections::HashSet::new();
            while let Some(message) = inbox.next().await {
                if !seen.insert(message.id()) {
                    continue;
                }
                let (plaintext, sender) = crypto::unwrap(&keys, &message).unwrap();
                let request = protocol::parse_request(&plaintext).unwrap();
                for reply in replies(&request) {
                    let payload = protocol::serialize(&reply).unwrap();
                    bus.publish(crypto::wrap(&keys, &sender, &payload).unwrap())
                        .await
                        .unwrap();
                }
            }
        })
    }

    fn client(memory: &MemoryBus, agent: Identity) -> TunnelClient {
        TunnelClient::new(
            Keypair::generate(),
            agent,
            Bus::new(Arc::new(memory.clone()), endpoints()),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_call_resolves_with_matching_response() {
        let memory = MemoryBus::new();
        let agent = Keypair::generate();
        let agent_id = agent.identity();
        let _agent = spawn_fake_agent(&memory, agent, |req| {
            vec![TunnelResponseMessage::from(TunnelResponse::new(
                req.id.clone(),
                200,
                Headers::new(),
                Some(req.path.clone().into_bytes()),
            ))]
        });
        settle().await;

        let client = client(&memory, agent_id);
        let res = client
            .fetch(HttpMethod::Get, "/hello", Headers::new(), None)
            .await
            .unwrap();
        match res {
            TunnelResponseMessage::Success(r) => {
                assert_eq!(r.status, 200);
                assert_eq!(r.body_text(), "/hello");
            }
            TunnelResponseMessage::Error(e) => panic!("unexpected error: {}", e.error),
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_non_matching_responses_ignored() {
        let memory = MemoryBus::new();
        let agent = Keypair::generate();
        let agent_id = agent.identity();
        let _agent = spawn_fake_agent(&memory, agent, |req| {
            vec![
                TunnelResponseMessage::from(TunnelErrorResponse::new("someone-else", 500, "not yours")),
                TunnelResponseMessage::from(TunnelResponse::new(req.id.clone(), 201, Headers::new(), None)),
            ]
        });
        settle().await;

        let client = client(&memory, agent_id);
        let res = client
            .fetch(HttpMethod::Post, "/x", Headers::new(), Some(b"body".to_vec()))
            .await
            .unwrap();
        assert_eq!(res.status(), 201);
        assert!(!res.is_error());
    }

    #[tokio::test]
    async fn test_error_envelope_returned() {
        let memory = MemoryBus::new();
        let agent = Keypair::generate();
        let agent_id = agent.identity();
        let _agent = spawn_fake_agent(&memory, agent, |req| {
            vec![TunnelResponseMessage::from(TunnelErrorResponse::new(
                req.id.clone(),
                502,
                "Upstream error: refused",
            ))]
        });
        settle().await;

        let res = client(&memory, agent_id)
            .fetch(HttpMethod::Get, "/", Headers::new(), None)
            .await
            .unwrap();
        match res {
            TunnelResponseMessage::Error(e) => {
                assert_eq!(e.status, 502);
                assert_eq!(e.error, "Upstream error: refused");
            }
            TunnelResponseMessage::Success(_) => panic!("expected error envelope"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_correlated() {
        let memory = MemoryBus::new();
        let agent = Keypair::generate();
        let agent_id = agent.identity();
        let _agent = spawn_fake_agent(&memory, agent, |req| {
            vec![TunnelResponseMessage::from(TunnelResponse::new(
                req.id.clone(),
                200,
                Headers::new(),
                Some(req.path.clone().into_bytes()),
            ))]
        });
        settle().await;

        let client = client(&memory, agent_id);
        let calls = (0..8).map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let path = format!("/item/{}", i);
                let res = client
                    .fetch(HttpMethod::Get, &path, Headers::new(), None)
                    .await
                    .unwrap();
                (path, res)
            })
        });

        for call in calls.collect::<Vec<_>>() {
            let (path, res) = call.await.unwrap();
            match res {
                TunnelResponseMessage::Success(r) => assert_eq!(r.body_text(), path),
                TunnelResponseMessage::Error(e) => panic!("unexpected error: {}", e.error),
            }
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_timeout_without_agent() {
        let memory = MemoryBus::new();
        let client = client(&memory, Keypair::generate().identity());

        let start = Instant::now();
        let err = client
            .call(HttpMethod::Get, "/", Headers::new(), None, Duration::from_millis(300))
            .await
            .unwrap_err();

        match err {
            Error::Timeout { id, elapsed } => {
                assert!(!id.is_empty());
                assert!(elapsed >= Duration::from_millis(300));
            }
            other => panic!("expected timeout, got {}", other),
        }
        assert!(start.elapsed() < Duration::from_millis(1300));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_clears_entry() {
        let memory = MemoryBus::new();
        for ep in endpoints() {
            memory.set_mode(&ep, EndpointMode::Failing);
        }
        let client = client(&memory, Keypair::generate().identity());

        let err = client
            .fetch(HttpMethod::Get, "/", Headers::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PublishFailed(_)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_response_from_wrong_identity_ignored() {
        let memory = MemoryBus::new();
        let agent = Keypair::generate();
        let impostor = Keypair::generate();
        let client = client(&memory, agent.identity());
        let client_id = client.identity();

        // Answers everything, but is not the agent the client is talking to
        let _impostor = {
            let memory = memory.clone();
            tokio::spawn(async move {
                let mut inbox = memory.subscribe(&endpoints(), agent.identity()).await.unwrap();
                let bus = Bus::new(Arc::new(memory.clone()), endpoints());
                while let Some(message) = inbox.next().await {
                    let (plaintext, _) = crypto::unwrap(&agent, &message).unwrap();
                    let request = protocol::parse_request(&plaintext).unwrap();
                    let reply: TunnelResponseMessage =
                        TunnelResponse::new(request.id, 200, Headers::new(), None).into();
                    let payload = protocol::serialize(&reply).unwrap();
                    let _ = bus
                        .publish(crypto::wrap(&impostor, &client_id, &payload).unwrap())
                        .await;
                }
            })
        };
        settle().await;

        let err = client
            .call(HttpMethod::Get, "/", Headers::new(), None, Duration::from_millis(400))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
    #[tokio::test]
    async fn test_unreadable_messages_skipped_until_match() {
        let memory = MemoryBus::new();
        let agent = Keypair::generate();
        let client = client(&memory, agent.identity());
        let client_id = client.identity();

        let _agent = {
            let memory = memory.clone();
            tokio::spawn(async move {
                let mut inbox = memory.subscribe(&endpoints(), agent.identity()).await.unwrap();
                let bus = Bus::new(Arc::new(memory.clone()), endpoints());
                let mut seen = std::collections::HashSet::new();
                while let Some(message) = inbox.next().await {
                    if !seen.insert(message.id()) {
                        continue;
                    }
                    let (plaintext, _) = crypto::unwrap(&agent, &message).unwrap();
                    let request = protocol::parse_request(&plaintext).unwrap();

                    // Sealed for someone else, then relabelled for the client
                    let mut foreign =
                        crypto::wrap(&agent, &Keypair::generate().identity(), b"{}").unwrap();
                    foreign.recipient = client_id;
                    let truncated = SealedMessage {
                        recipient: client_id,
                        payload: vec![1, 2, 3],
                    };
                    let not_json = crypto::wrap(&agent, &client_id, b"<html>oops</html>").unwrap();

                    let reply = TunnelResponseMessage::from(TunnelResponse::new(
                        request.id,
                        200,
                        Headers::new(),
                        Some(b"finally".to_vec()),
                    ));
                    let valid =
                        crypto::wrap(&agent, &client_id, &protocol::serialize(&reply).unwrap()).unwrap();

                    for message in [foreign, truncated, not_json, valid] {
                        bus.publish(message).await.unwrap();
                    }
                }
            })
        };
        settle().await;

        let res = client
            .call(HttpMethod::Get, "/", Headers::new(), None, Duration::from_secs(5))
            .await
            .unwrap();
        match res {
            TunnelResponseMessage::Success(r) => assert_eq!(r.body_text(), "finally"),
            TunnelResponseMessage::Error(e) => panic!("unexpected error: {}", e.error),
        }
        assert_eq!(client.pending_calls(), 0);
    }

    /// Accepts every publish; every subscription ends immediately
    struct HangUpTransport;

    #[async_trait::async_trait]
    impl Transport for HangUpTransport {
        async fn send(&self, _endpoint: &Endpoint, _message: SealedMessage) -> Result<()> {
            Ok(())
        }

        async fn subscribe(&self, _endpoints: &[Endpoint], _recipient: Identity) -> Result<Subscription> {
            let (subscription, _feed) = Subscription::channel();
            Ok(subscription)
        }
    }

    #[tokio::test]
    async fn test_ended_subscription_fails_fast() {
        let client = TunnelClient::new(
            Keypair::generate(),
            Keypair::generate().identity(),
            Bus::new(Arc::new(HangUpTransport), endpoints()),
        );

        let start = Instant::now();
        let err = client
            .call(HttpMethod::Get, "/", Headers::new(), None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "{}", err);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(client.pending_calls(), 0);
    }
}
