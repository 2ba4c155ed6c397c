//! NTunnel relay: a store-and-forward WebSocket endpoint for sealed messages.

pub mod hub;
pub mod metrics;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::header::CONTENT_TYPE,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ntunnel_shared::frame::{ClientFrame, RelayFrame};
use ntunnel_shared::protocol::MAX_MESSAGE_SIZE;

use hub::Hub;

/// Largest accepted WebSocket frame: a base64 payload at the message limit plus framing
pub const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE / 3 * 4 + 64 * 1024;

const CONNECTION_BUFFER: usize = 256;

#[derive(Clone)]
pub struct AppState {
    hub: Hub,
}

impl AppState {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stored = state.hub.stored().await;
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.hub.metrics().to_prometheus(stored).await,
    )
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn = state.hub.connect();
    info!("Client {} connected", conn);

    let (tx, mut rx) = mpsc::channel::<RelayFrame>(CONNECTION_BUFFER);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let replies = match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Publish { message }) => vec![state.hub.publish(message).await],
                            Ok(ClientFrame::Subscribe { sub, recipient }) => {
                                state.hub.subscribe(conn, sub, &recipient, tx.clone()).await
                            }
                            Ok(ClientFrame::Close { sub }) => {
                                state.hub.close(conn, &sub);
                                Vec::new()
                            }
                            Err(e) => vec![RelayFrame::Notice { message: format!("unreadable frame: {}", e) }],
                        };
                        if !send_all(&mut sender, replies).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(d))) => { let _ = sender.send(Message::Pong(d)).await; }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Client {} error: {}", conn, e);
                        break;
                    }
                    _ => {}
                }
            }
            Some(frame) = rx.recv() => {
                if !send_all(&mut sender, vec![frame]).await { break; }
            }
        }
    }

    state.hub.disconnect(conn);
    info!("Client {} disconnected", conn);
}

async fn send_all(sender: &mut SplitSink<WebSocket, Message>, frames: Vec<RelayFrame>) -> bool {
    for frame in frames {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Cannot encode frame: {}", e);
                continue;
            }
        };
        if sender.send(Message::Text(text)).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use ntunnel_shared::crypto::{wrap, Keypair};
    use ntunnel_shared::frame::WireMessage;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn spawn_relay() -> SocketAddr {
        let state = AppState::new(Hub::new(hub::DEFAULT_BACKLOG, Metrics::new()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr) -> Client {
        connect_async(format!("ws://{}", addr)).await.unwrap().0
    }

    async fn send(ws: &mut Client, frame: ClientFrame) {
        ws.send(WsMessage::Text(serde_json::to_string(&frame).unwrap()))
            .await
            .unwrap();
    }

    async fn recv(ws: &mut Client) -> RelayFrame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("relay went quiet")
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe_over_websocket() {
        let addr = spawn_relay().await;
        let alice = Keypair::generate();
        let sealed = wrap(&Keypair::generate(), &alice.identity(), b"hello").unwrap();
        let wire = WireMessage::from(&sealed);

        let mut subscriber = connect(addr).await;
        send(
            &mut subscriber,
            ClientFrame::Subscribe {
                sub: "s1".into(),
                recipient: alice.identity().to_string(),
            },
        )
        .await;
        assert_eq!(recv(&mut subscriber).await, RelayFrame::Eose { sub: "s1".into() });

        let mut publisher = connect(addr).await;
        send(&mut publisher, ClientFrame::Publish { message: wire.clone() }).await;
        assert_eq!(
            recv(&mut publisher).await,
            RelayFrame::Ok {
                id: sealed.id(),
                accepted: true,
                reason: None
            }
        );

        assert_eq!(
            recv(&mut subscriber).await,
            RelayFrame::Message {
                sub: "s1".into(),
                message: wire
            }
        );
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_backlog() {
        let addr = spawn_relay().await;
        let alice = Keypair::generate();
        let wire = WireMessage::from(&wrap(&Keypair::generate(), &alice.identity(), b"early").unwrap());

        let mut publisher = connect(addr).await;
        send(&mut publisher, ClientFrame::Publish { message: wire.clone() }).await;
        assert!(matches!(recv(&mut publisher).await, RelayFrame::Ok { accepted: true, .. }));

        let mut late = connect(addr).await;
        send(
            &mut late,
            ClientFrame::Subscribe {
                sub: "late".into(),
                recipient: alice.identity().to_string(),
            },
        )
        .await;
        assert_eq!(
            recv(&mut late).await,
            RelayFrame::Message {
                sub: "late".into(),
                message: wire
            }
        );
        assert_eq!(recv(&mut late).await, RelayFrame::Eose { sub: "late".into() });
    }

    #[tokio::test]
    async fn test_garbage_frame_gets_notice() {
        let addr = spawn_relay().await;
        let mut ws = connect(addr).await;
        ws.send(WsMessage::Text("{\"type\":\"dance\"}".into())).await.unwrap();
        assert!(matches!(recv(&mut ws).await, RelayFrame::Notice { .. }));
    }

    #[tokio::test]
    async fn test_undecodable_publish_is_refused() {
        let addr = spawn_relay().await;
        let mut ws = connect(addr).await;
        let wire = WireMessage {
            recipient: Keypair::generate().identity().to_string(),
            payload: "%%% not base64 %%%".into(),
        };
        send(&mut ws, ClientFrame::Publish { message: wire.clone() }).await;
        match recv(&mut ws).await {
            RelayFrame::Ok { id, accepted, .. } => {
                assert_eq!(id, wire.id());
                assert!(!accepted);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
