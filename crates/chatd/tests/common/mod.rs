#![allow(dead_code)]

use chat_common::{Message, ServerFrame};
use chatd::config::ServerConfig;
use chatd::filter::ContentFilter;
use chatd::hub::Hub;
use chatd::server::ServerState;
use chatd::store::MessageStore;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        database: PathBuf::from(":memory:"),
        max_conns: 1000,
        max_payload: 1024,
        send_queue: 256,
        history_limit: 100,
        conn_rate: 100,
        conn_window: 60,
        ping_interval: 54,
        pong_wait: 60,
        write_timeout: 10,
        retention_days: 30,
        sweep_interval: 86_400,
    }
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(
    adjust: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    adjust(&mut config);

    let store = Arc::new(MessageStore::in_memory().unwrap());
    let filter = Arc::new(ContentFilter::with_default_blocklist());
    let hub = Hub::spawn(store, filter, config.history_limit);
    let state = Arc::new(ServerState::new(config, hub));

    let server_state = Arc::clone(&state);
    tokio::spawn(async move {
        chatd::run(listener, server_state).await.unwrap();
    });
    (addr, state)
}

pub struct ShutdownHandle {
    pub shutdown_tx: tokio::sync::watch::Sender<()>,
    pub server: tokio::task::JoinHandle<Result<(), chatd::error::ChatdError>>,
}

pub async fn start_server_with_shutdown() -> (SocketAddr, Arc<ServerState>, ShutdownHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = test_config(addr);

    let store = Arc::new(MessageStore::in_memory().unwrap());
    let filter = Arc::new(ContentFilter::with_default_blocklist());
    let hub = Hub::spawn(store, filter, config.history_limit);
    let state = Arc::new(ServerState::new(config, hub));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let server = tokio::spawn(chatd::run_with_shutdown(
        listener,
        Arc::clone(&state),
        shutdown_rx,
    ));
    (addr, state, ShutdownHandle { shutdown_tx, server })
}

/// Polls `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub struct TestClient {
    pub ws_tx: SplitSink<Ws, WsMessage>,
    pub ws_rx: SplitStream<Ws>,
}

impl TestClient {
    pub async fn try_connect(
        addr: &SocketAddr,
        query: &str,
        forwarded_for: Option<&str>,
    ) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let url = if query.is_empty() {
            format!("ws://{addr}/ws")
        } else {
            format!("ws://{addr}/ws?{query}")
        };
        let mut req = url.into_client_request()?;
        if let Some(origin) = forwarded_for {
            req.headers_mut()
                .insert("X-Forwarded-For", origin.parse().unwrap());
        }
        let (ws, _) = tokio_tungstenite::connect_async(req).await?;
        let (ws_tx, ws_rx) = ws.split();
        Ok(Self { ws_tx, ws_rx })
    }

    /// Connects and consumes the join history.
    pub async fn join(addr: &SocketAddr, query: &str) -> (Self, Vec<Message>) {
        let mut client = Self::try_connect(addr, query, None).await.unwrap();
        match client.recv_frame().await {
            ServerFrame::RecentMessages(history) => (client, history),
            other => panic!("expected history, got {other:?}"),
        }
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(WsMessage::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn say(&mut self, content: &str) {
        let body = serde_json::json!({ "message": content });
        self.send_text(&body.to_string()).await;
    }

    pub async fn recv_frame(&mut self) -> ServerFrame {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.ws_rx.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            match msg {
                WsMessage::Text(text) => return ServerFrame::parse(text.as_bytes()).unwrap(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected websocket message: {other:?}"),
            }
        }
    }

    pub async fn recv_message(&mut self) -> Message {
        match self.recv_frame().await {
            ServerFrame::Message(msg) => msg,
            other => panic!("expected chat message, got {other:?}"),
        }
    }

    /// Waits for the server to end the connection.
    pub async fn expect_closed(&mut self) {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.ws_rx.next())
                .await
                .expect("connection was not closed");
            match next {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    }
}
