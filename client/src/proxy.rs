//! Local HTTP proxy: every inbound request becomes one tunnel call.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Response, StatusCode},
    response::IntoResponse,
    Json, Router,
};
use tokio::time::Instant;
use tracing::{info, warn};

use ntunnel_shared::protocol::{Headers, HttpMethod, TunnelResponse, TunnelResponseMessage, MAX_MESSAGE_SIZE};
use ntunnel_shared::Error;

use crate::correlator::TunnelClient;
use crate::headers::HeaderRewriter;

#[derive(Clone)]
pub struct ProxyState {
    client: TunnelClient,
    rewriter: Arc<HeaderRewriter>,
}

pub fn router(client: TunnelClient, rewriter: HeaderRewriter) -> Router {
    Router::new().fallback(proxy_handler).with_state(ProxyState {
        client,
        rewriter: Arc::new(rewriter),
    })
}

pub fn print_banner(client: &TunnelClient, port: u16) {
    println!("\n╔══════════════════════════════════════════════════════════════════════════╗");
    println!("║  🚀 NTunnel Proxy Active                                                 ║");
    println!("╠══════════════════════════════════════════════════════════════════════════╣");
    println!("║  Local:    {:<62}║", format!("http://localhost:{}", port));
    println!("║  Agent:    {:<62}║", client.agent().to_string());
    println!("║  Client:   {:<62}║", client.identity().to_string());
    println!("║  Timeout:  {:<62}║", format!("{}ms", client.timeout().as_millis()));
    println!("╚══════════════════════════════════════════════════════════════════════════╝\n");
}

async fn proxy_handler(State(state): State<ProxyState>, req: Request) -> Response<Body> {
    let method = match req.method().as_str().parse::<HttpMethod>() {
        Ok(method) => method,
        Err(_) => {
            return error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("Unsupported method: {}", req.method()),
            )
        }
    };
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = Headers::new();
    for (name, value) in req.headers() {
        let Ok(value) = value.to_str() else { continue };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    state.rewriter.rewrite_request(&mut headers);

    // Read request body BEFORE dropping the request
    let body = match axum::body::to_bytes(req.into_body(), MAX_MESSAGE_SIZE).await {
        Ok(b) if !b.is_empty() => Some(b.to_vec()),
        Ok(_) => None,
        Err(e) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Cannot read request body: {}", e),
            )
        }
    };

    let started = Instant::now();
    match state.client.fetch(method, &path, headers, body).await {
        Ok(TunnelResponseMessage::Success(resp)) => {
            info!("{} {} → {} ({}ms)", method, path, resp.status, started.elapsed().as_millis());
            build_response(resp, &state.rewriter)
        }
        Ok(TunnelResponseMessage::Error(err)) => {
            warn!("{} {} → {} {}", method, path, err.status, err.error);
            error_response(
                StatusCode::from_u16(err.status).unwrap_or(StatusCode::BAD_GATEWAY),
                err.error,
            )
        }
        Err(e @ Error::Timeout { .. }) => {
            warn!("{} {}: {}", method, path, e);
            error_response(StatusCode::GATEWAY_TIMEOUT, e.to_string())
        }
        Err(e) => {
            warn!("{} {}: {}", method, path, e);
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

fn build_response(resp: TunnelResponse, rewriter: &HeaderRewriter) -> Response<Body> {
    let mut headers = resp.headers;
    rewriter.rewrite_response(&mut headers);

    let mut builder =
        Response::builder().status(StatusCode::from_u16(resp.status).unwrap_or(StatusCode::OK));
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in headers {
            if let (Ok(hn), Ok(hv)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(&v)) {
                headers_mut.insert(hn, hv);
            }
        }
    }

    let body = resp.body.unwrap_or_default();
    match builder.body(Body::from(body)) {
        Ok(r) => r,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}

fn error_response(status: StatusCode, message: String) -> Response<Body> {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
