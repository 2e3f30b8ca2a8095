//! HTTP/WebSocket front end and the central dispatch loop.
//!
//! Architecture:
//! ```text
//! GET /connect/{room}/{user} ── upgrade ── RoomRegistry::add_user
//!                                               │
//!   ConnectionActor (read loop) ── Event ──► dispatch loop
//!                                               │
//!                        broadcast / remove_user ┘
//!                                               ▼
//!                       ConnectionActor (write loop) ── socket
//! ```
//!
//! `GET /ping` and `GET /stats` are plain JSON endpoints. Every route is also
//! served under `/api` for clients built against the old URL layout.

use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::future::{self, join_all};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::actor::{Event, Frame, DEFAULT_OUTBOUND_CAPACITY};
use crate::error::RelayError;
use crate::registry::{RoomRegistry, RoomStats};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How long shutdown waits for each connection to flush its close frame
    pub drain_timeout: Duration,
    /// Frames buffered per connection before a slow client is evicted
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            drain_timeout: Duration::from_secs(2),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<RoomRegistry>,
}

/// The status relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    events: mpsc::UnboundedReceiver<Event>,
}

impl RelayServer {
    /// Create a server with an empty room registry.
    pub fn new(config: ServerConfig) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            registry: Arc::new(RoomRegistry::new(events_tx, config.outbound_capacity)),
            config,
            events,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Shared room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Serve until the process is killed.
    pub async fn run(self) -> Result<(), RelayError> {
        self.run_until(future::pending()).await
    }

    /// Serve until `shutdown` resolves, then stop accepting connections and
    /// close every live one.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            config,
            registry,
            events,
        } = self;

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        log::info!("Status relay listening on {}", config.bind_addr);

        let dispatcher = tokio::spawn(dispatch(registry.clone(), events));
        let serve = axum::serve(listener, router(registry.clone())).into_future();

        tokio::select! {
            result = serve => {
                dispatcher.abort();
                return result.map_err(RelayError::Serve);
            }
            () = shutdown => {
                log::info!("Shutdown requested, no longer accepting connections");
            }
        }

        let closing = registry.close_all().await;
        let waits = closing
            .iter()
            .map(|actor| tokio::time::timeout(config.drain_timeout, actor.closed()));
        let stuck = join_all(waits)
            .await
            .into_iter()
            .filter(Result::is_err)
            .count();
        if stuck > 0 {
            log::warn!(
                "{stuck} connections did not close within {:?}",
                config.drain_timeout
            );
        }

        dispatcher.abort();
        log::info!("Status relay stopped");
        Ok(())
    }
}

/// Single consumer of the actor event queue.
///
/// Processing events one at a time keeps each connection's updates in the
/// order they were read.
pub async fn dispatch(registry: Arc<RoomRegistry>, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Message(msg) => {
                registry.broadcast(&msg).await;
            }
            Event::Evict(actor) => {
                registry.remove_user(&actor).await;
            }
        }
    }
    log::debug!("Event queue closed, dispatcher exiting");
}

/// Build the HTTP router around a registry.
pub fn router(registry: Arc<RoomRegistry>) -> Router {
    let routes = Router::new()
        .route("/connect/{room}/{user}", get(connect))
        .route("/ping", get(ping))
        .route("/stats", get(stats));

    Router::new()
        .merge(routes.clone())
        .nest("/api", routes)
        .with_state(AppState { registry })
}

async fn connect(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(u64, u64)>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let reader = stream.map(|item| item.map(Frame::from));
        let writer = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(WsMessage::from(frame))));

        if let Err(e) = state.registry.add_user(room_id, user_id, reader, writer).await {
            log::debug!("Connection refused: {e}");
        }
    })
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

async fn stats(State(state): State<AppState>) -> Json<RoomStats> {
    Json(state.registry.stats().await)
}

impl From<WsMessage> for Frame {
    fn from(msg: WsMessage) -> Self {
        match msg {
            WsMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
            WsMessage::Close(_) => Frame::Close,
            _ => Frame::Other,
        }
    }
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Close => WsMessage::Close(None),
            Frame::Other => WsMessage::Binary(Vec::new().into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, MessageKind};
    use crate::registry::RegistryError;
    use crate::test_support::TestConnection;
    use tokio::time::timeout;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8000");
        assert_eq!(config.drain_timeout, Duration::from_secs(2));
        assert_eq!(config.outbound_capacity, 256);
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:9000".to_string(),
            drain_timeout: Duration::from_millis(100),
            outbound_capacity: 8,
        };
        let server = RelayServer::new(config);
        assert_eq!(server.bind_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_frame_conversions() {
        assert_eq!(
            Frame::from(WsMessage::Text("hi".into())),
            Frame::Text("hi".to_string())
        );
        assert_eq!(Frame::from(WsMessage::Close(None)), Frame::Close);
        assert_eq!(Frame::from(WsMessage::Binary(vec![1].into())), Frame::Other);
        assert!(matches!(
            WsMessage::from(Frame::Text("x".into())),
            WsMessage::Text(t) if t.as_str() == "x"
        ));
        assert!(matches!(WsMessage::from(Frame::Close), WsMessage::Close(None)));
    }

    #[tokio::test]
    async fn test_dispatch_broadcasts_and_evicts() {
        let server = RelayServer::with_defaults();
        let registry = server.registry().clone();
        tokio::spawn(dispatch(registry.clone(), server.events));

        let (a_conn, reader, writer) = TestConnection::new();
        registry.add_user(5, 1, reader, writer).await.unwrap();
        let (mut b_conn, reader, writer) = TestConnection::new();
        registry.add_user(5, 2, reader, writer).await.unwrap();
        b_conn.drain_messages().await;

        a_conn.push_text(r#"{"type":"typing","value":7}"#);
        assert_eq!(
            b_conn.next_message().await,
            Some(Message::new(5, 1, MessageKind::Typing, 7))
        );

        a_conn.push_error("connection reset");
        assert_eq!(b_conn.next_message().await, Some(Message::quit(5, 1)));
        assert_eq!(
            registry.stats().await,
            RoomStats {
                num_rooms: 1,
                num_users: 1
            }
        );
    }

    #[tokio::test]
    async fn test_run_until_closes_live_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = RelayServer::new(ServerConfig {
            bind_addr: format!("127.0.0.1:{port}"),
            drain_timeout: Duration::from_millis(500),
            ..ServerConfig::default()
        });
        let registry = server.registry().clone();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = stop_rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (mut conn, reader, writer) = TestConnection::new();
        registry.add_user(1, 1, reader, writer).await.unwrap();

        stop_tx.send(()).unwrap();
        let result = timeout(Duration::from_secs(2), handle)
            .await
            .expect("server stops")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(conn.next_frame().await, Some(Frame::Close));
        assert_eq!(registry.stats().await, RoomStats::default());

        // An upgrade that completes after shutdown is turned away
        let (mut late, reader, writer) = TestConnection::new();
        assert_eq!(
            registry.add_user(1, 2, reader, writer).await.unwrap_err(),
            RegistryError::ShuttingDown
        );
        assert_eq!(late.next_frame().await, Some(Frame::Close));
        assert_eq!(registry.stats().await, RoomStats::default());
    }
}
