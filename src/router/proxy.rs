//! The wake-on-connect HTTP reverse proxy. Resolution order, per request:
//! explicit instance header, then path-alias prefix, then (if exactly one
//! instance exists) that instance by default, otherwise 503.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router as AxumRouter;
use futures_util::{SinkExt, StreamExt};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use super::Router;
use crate::error::{ApiErrorCode, Error};
use crate::instance::Instance;

const INSTANCE_HEADER: &str = "x-aegisvm-instance";
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

type HttpClient = Client<HttpConnector, Body>;

/// Build the axum app served on [`DaemonConfig::proxy_addr`].
pub fn app(router: Arc<Router>) -> AxumRouter {
    AxumRouter::new().fallback(any(handle)).with_state(router)
}

enum Resolution {
    Found(Arc<Instance>),
    NotFound(String),
    NoDefault,
}

async fn resolve_instance(router: &Arc<Router>, headers: &HeaderMap, uri: &Uri) -> Resolution {
    if let Some(v) = headers.get(INSTANCE_HEADER).and_then(|v| v.to_str().ok()) {
        if let Some(instance) = router.manager().lookup(v).await {
            return Resolution::Found(instance);
        }
        if let Some(instance) = router.manager().lookup_by_handle(v).await {
            return Resolution::Found(instance);
        }
        return Resolution::NotFound(v.to_string());
    }

    let mut segments = uri.path().trim_start_matches('/').splitn(2, '/');
    if let Some(first) = segments.next() {
        if !first.is_empty() {
            if let Some(instance) = router.manager().lookup_by_handle(first).await {
                return Resolution::Found(instance);
            }
        }
    }

    let all = router.manager().list().await;
    if all.len() == 1 {
        return Resolution::Found(all.into_iter().next().expect("len checked"));
    }
    Resolution::NoDefault
}

async fn handle(State(router): State<Arc<Router>>, req: Request<Body>) -> Response {
    let uri = req.uri().clone();
    let headers = req.headers().clone();
    let (mut parts, body) = req.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &router).await.ok();
    let req = Request::from_parts(parts, body);
    let instance = match resolve_instance(&router, &headers, &uri).await {
        Resolution::Found(i) => i,
        Resolution::NotFound(id) => return error_response(Error::NotFound(id)),
        Resolution::NoDefault => {
            return (StatusCode::SERVICE_UNAVAILABLE, "no instance resolved for this request").into_response()
        }
    };

    let ensured = match router.manager().ensure(&instance.id).await {
        Ok(i) => i,
        Err(e) => return error_response(e),
    };

    let host_port = {
        let inner = ensured.lock().await;
        inner.endpoints.first().map(|e| e.host_port)
    };
    let Some(host_port) = host_port else {
        return error_response(Error::BackendUnsupported("instance exposes no ports".into()));
    };

    router.manager().on_connection_open(&ensured.id).await;
    let response = if let Some(ws) = ws {
        forward_websocket(ws, host_port, &uri).await
    } else {
        forward_http(host_port, req).await
    };
    let manager = router.manager().clone();
    let id = ensured.id.clone();
    tokio::spawn(async move {
        manager.on_connection_close(&id).await;
    });
    response
}

async fn forward_http(host_port: u16, req: Request<Body>) -> Response {
    let client: HttpClient = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

    let (mut parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => return error_response(Error::Internal(format!("failed to buffer request body: {e}"))),
    };

    let path_and_query = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let upstream_uri = match format!("http://127.0.0.1:{host_port}{path_and_query}").parse() {
        Ok(u) => u,
        Err(e) => return error_response(Error::Internal(format!("bad upstream uri: {e}"))),
    };
    parts.uri = upstream_uri;

    let upstream_req = axum::http::Request::from_parts(parts, Body::from(bytes));
    match client.request(upstream_req).await {
        Ok(resp) => resp.into_response(),
        Err(e) => error_response(Error::Transport(format!("upstream request failed: {e}"))),
    }
}

/// Accept the client-side WebSocket, dial the guest's endpoint as a
/// WebSocket client, and pump frames in both directions until either side
/// closes. The client-side future is cancelled if the proxy task itself is
/// dropped, matching the "write cancellation" design note for the
/// reverse-proxy path.
async fn forward_websocket(ws: WebSocketUpgrade, host_port: u16, uri: &Uri) -> Response {
    let path_and_query = uri.path_and_query().map(|p| p.as_str().to_string()).unwrap_or_else(|| "/".to_string());
    let upstream_url = format!("ws://127.0.0.1:{host_port}{path_and_query}");

    ws.on_upgrade(move |socket| async move {
        match tokio_tungstenite::connect_async(upstream_url).await {
            Ok((upstream, _response)) => bridge(socket, upstream).await,
            Err(e) => {
                tracing::warn!(error = %e, "failed to connect upstream websocket");
            }
        }
    })
}

async fn bridge(client: WebSocket, upstream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let converted = match msg {
                AxumMessage::Text(t) => TungsteniteMessage::Text(t.to_string().into()),
                AxumMessage::Binary(b) => TungsteniteMessage::Binary(b),
                AxumMessage::Ping(p) => TungsteniteMessage::Ping(p),
                AxumMessage::Pong(p) => TungsteniteMessage::Pong(p),
                AxumMessage::Close(_) => break,
            };
            if upstream_tx.send(converted).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let converted = match msg {
                TungsteniteMessage::Text(t) => AxumMessage::Text(t.to_string().into()),
                TungsteniteMessage::Binary(b) => AxumMessage::Binary(b),
                TungsteniteMessage::Ping(p) => AxumMessage::Ping(p),
                TungsteniteMessage::Pong(p) => AxumMessage::Pong(p),
                TungsteniteMessage::Close(_) | TungsteniteMessage::Frame(_) => break,
            };
            if client_tx.send(converted).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::join!(to_upstream, to_client);
}

fn error_response(e: Error) -> Response {
    let api = e.api_error();
    let status = StatusCode::from_u16(api.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, api.to_json()).into_response();
    if api.code == ApiErrorCode::Starting {
        if let Some(secs) = api.retry_after_secs {
            response
                .headers_mut()
                .insert("retry-after", secs.to_string().parse().expect("numeric header value"));
        }
    }
    response
}
