//! Local HTTP fixtures for tests.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::Path;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Echo server: replies with the request it received as JSON.
///
/// `/status/:code` answers with that status, `/big` with a 1 MB body and
/// `/stream` with 64 KB in chunks of unknown total length.
pub async fn spawn_echo_server() -> (SocketAddr, JoinHandle<()>) {
    let app = Router::new()
        .route("/status/:code", any(status))
        .route("/big", get(big))
        .route("/stream", get(stream))
        .fallback(echo);

    serve(app).await
}

pub async fn serve(app: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let headers: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                serde_json::Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
            )
        })
        .collect();

    let echoed = serde_json::json!({
        "method": method.as_str(),
        "url": uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });

    ([("x-echo", "true")], Json(echoed))
}

async fn status(Path(code): Path<u16>) -> impl IntoResponse {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

async fn big() -> impl IntoResponse {
    vec![b'x'; 1024 * 1024]
}

async fn stream() -> impl IntoResponse {
    let chunks = (0..64).map(|_| Ok::<_, Infallible>(Bytes::from(vec![b'y'; 1024])));
    Body::from_stream(futures_util::stream::iter(chunks))
}
