//! HTTP handlers and the subscriber session lifecycle.
//!
//! A publish request appends to the store and hands the same message to the
//! broker; the SSE handler bridges one connection to one broker subscription
//! and releases it on every exit path.

use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::{self, SessionMetricsGuard};
use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::Stream;
use ripple_core::{Broker, Message, MessageStore, StreamEvent, Subscription};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::{debug, error, info};

/// Shared server state.
pub struct AppState {
    /// The bounded message log.
    pub store: MessageStore,
    /// The broadcast broker.
    pub broker: Broker,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            store: MessageStore::with_capacity(config.store.capacity),
            broker: Broker::new(),
            config,
        }
    }
}

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    let static_dir = state.config.static_dir.clone();

    Router::new()
        .route("/api/messages", get(list_messages).post(create_message))
        .route("/sse", get(sse_handler))
        .route("/health", get(health_handler))
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state)
}

/// Run the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Keepalives run for the broker's lifetime
    state.broker.spawn_keepalive(state.config.keepalive.interval());

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("ripple server listening on {}", addr);
    info!("SSE endpoint: http://{}/sse", addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// `POST /api/messages`: store a message, then fan it out to subscribers.
async fn create_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Message>, JsonRejection>,
) -> Result<Json<Message>, ApiError> {
    let Json(message) = payload?;

    state.store.append(message.clone());
    state.broker.publish(StreamEvent::Message(message.clone()));

    metrics::record_message();
    metrics::set_stored_messages(state.store.len());

    debug!(id = %message.id, sender = %message.sender, "Message created");

    Ok(Json(message))
}

/// `GET /api/messages`: the full store snapshot, oldest first.
async fn list_messages(State(state): State<Arc<AppState>>) -> Json<Vec<Message>> {
    Json(state.store.snapshot())
}

/// `GET /sse`: long-lived event stream bridging this connection to one
/// broker subscription.
async fn sse_handler(State(state): State<Arc<AppState>>) -> Sse<EventStream> {
    let subscription = state.broker.subscribe();
    debug!(subscriber = subscription.id(), "SSE session opened");

    Sse::new(EventStream {
        subscription,
        _guard: SessionMetricsGuard::new(),
    })
}

/// Adapts a broker subscription into the SSE response stream.
///
/// Each queued event becomes one `data:` frame carrying its JSON encoding,
/// flushed as soon as it is written. Dropping the stream (the client went
/// away, or the response future was cancelled) drops the subscription, whose
/// guard unsubscribes from the broker; that removal is idempotent.
struct EventStream {
    subscription: Subscription,
    _guard: SessionMetricsGuard,
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.subscription.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let payload = serde_json::to_string(event.as_ref()).unwrap_or_default();
                Poll::Ready(Some(Ok(Event::default().data(payload))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        debug!(subscriber = self.subscription.id(), "SSE session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeepaliveConfig, MetricsConfig, StoreConfig};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config(capacity: usize) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            store: StoreConfig { capacity },
            keepalive: KeepaliveConfig {
                interval_ms: 10_000,
            },
            metrics: MetricsConfig {
                enabled: false,
                port: 0,
            },
            static_dir: "ui".to_string(),
        }
    }

    async fn spawn_app(config: Config) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(Arc::clone(&state));

        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        (addr, state)
    }

    /// One-shot request over a raw socket; returns the full response text.
    async fn http_request(addr: SocketAddr, request: String) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        timeout(READ_TIMEOUT, stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8(response).unwrap()
    }

    async fn post_message(addr: SocketAddr, body: &str) -> String {
        http_request(
            addr,
            format!(
                "POST /api/messages HTTP/1.1\r\nHost: ripple\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            ),
        )
        .await
    }

    async fn list_messages(addr: SocketAddr) -> Vec<Message> {
        let response = http_request(
            addr,
            "GET /api/messages HTTP/1.1\r\nHost: ripple\r\nConnection: close\r\n\r\n".to_string(),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        serde_json::from_str(body).unwrap()
    }

    /// Open an SSE connection and consume the response headers.
    async fn open_sse(addr: SocketAddr) -> BufReader<TcpStream> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /sse HTTP/1.1\r\nHost: ripple\r\nAccept: text/event-stream\r\n\r\n",
            )
            .await
            .unwrap();

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        timeout(READ_TIMEOUT, reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert!(line.starts_with("HTTP/1.1 200"), "{line}");

        let mut saw_event_stream = false;
        loop {
            line.clear();
            timeout(READ_TIMEOUT, reader.read_line(&mut line))
                .await
                .unwrap()
                .unwrap();
            if line.to_ascii_lowercase().contains("text/event-stream") {
                saw_event_stream = true;
            }
            if line == "\r\n" {
                break;
            }
        }
        assert!(saw_event_stream);

        reader
    }

    /// Read frames until a `data:` payload arrives.
    async fn next_event(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        loop {
            line.clear();
            timeout(READ_TIMEOUT, reader.read_line(&mut line))
                .await
                .unwrap()
                .unwrap();
            if let Some(payload) = line.strip_prefix("data: ") {
                return payload.trim_end().to_string();
            }
        }
    }

    #[tokio::test]
    async fn test_post_then_list_roundtrip() {
        let (addr, _state) = spawn_app(test_config(64)).await;

        let body = r#"{"id":"1","sender":"a","content":"hi","timestamp":100}"#;
        let response = post_message(addr, body).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");

        let messages = list_messages(addr).await;
        assert_eq!(
            messages,
            vec![Message {
                id: "1".to_string(),
                sender: "a".to_string(),
                content: "hi".to_string(),
                timestamp: 100,
            }]
        );
    }

    #[tokio::test]
    async fn test_subscriber_receives_posted_message() {
        let (addr, state) = spawn_app(test_config(64)).await;

        let mut sse = open_sse(addr).await;
        // The response headers arriving means the handler ran and its
        // subscription is queued ahead of any later publish.
        assert_eq!(state.broker.subscriber_count().await, 1);

        let body = r#"{"id":"1","sender":"a","content":"hi","timestamp":100}"#;
        post_message(addr, body).await;

        let event = next_event(&mut sse).await;
        let received: Message = serde_json::from_str(&event).unwrap();
        assert_eq!(received.id, "1");
        assert_eq!(received.content, "hi");
    }

    #[tokio::test]
    async fn test_subscribers_share_publish_order() {
        let (addr, _state) = spawn_app(test_config(64)).await;

        let mut first = open_sse(addr).await;
        let mut second = open_sse(addr).await;

        for id in 1..=3 {
            let body = format!(
                r#"{{"id":"{id}","sender":"a","content":"m{id}","timestamp":{id}}}"#
            );
            post_message(addr, &body).await;
        }

        for id in 1..=3 {
            let from_first: Message =
                serde_json::from_str(&next_event(&mut first).await).unwrap();
            let from_second: Message =
                serde_json::from_str(&next_event(&mut second).await).unwrap();
            assert_eq!(from_first.id, id.to_string());
            assert_eq!(from_second.id, id.to_string());
        }
    }

    #[tokio::test]
    async fn test_capacity_one_retains_newest() {
        let (addr, _state) = spawn_app(test_config(1)).await;

        post_message(addr, r#"{"id":"1","sender":"a","content":"first","timestamp":1}"#).await;
        post_message(addr, r#"{"id":"2","sender":"a","content":"second","timestamp":2}"#).await;

        let messages = list_messages(addr).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "2");
    }

    #[tokio::test]
    async fn test_malformed_body_yields_client_error() {
        let (addr, _state) = spawn_app(test_config(64)).await;

        let response = post_message(addr, "not json").await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");

        // The serving process survives and the store is untouched.
        assert!(list_messages(addr).await.is_empty());
        let response =
            post_message(addr, r#"{"id":"1","sender":"a","content":"ok","timestamp":1}"#).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    }

    #[tokio::test]
    async fn test_disconnect_unsubscribes() {
        let (addr, state) = spawn_app(test_config(64)).await;

        let sse = open_sse(addr).await;
        assert_eq!(state.broker.subscriber_count().await, 1);

        drop(sse);

        // Give the server a moment to observe the closed socket.
        let mut remaining = state.broker.subscriber_count().await;
        for _ in 0..50 {
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            remaining = state.broker.subscriber_count().await;
        }
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_keepalive_payload_on_the_wire() {
        let (addr, state) = spawn_app(test_config(64)).await;

        let mut sse = open_sse(addr).await;
        state.broker.spawn_keepalive(Duration::from_millis(10));

        let event = next_event(&mut sse).await;
        assert_eq!(event, r#"{"keepalive":true}"#);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (addr, _state) = spawn_app(test_config(64)).await;

        let response = http_request(
            addr,
            "GET /health HTTP/1.1\r\nHost: ripple\r\nConnection: close\r\n\r\n".to_string(),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        let health: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(health["status"], "ok");
    }
}
