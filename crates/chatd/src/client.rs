//! Per-connection actor: handshake, admission, and the inbound and outbound pumps.

use crate::config::ServerConfig;
use crate::error::ChatdError;
use crate::hub::{ClientHandle, Hub, Identity, Outbound};
use crate::metrics::counters;
use crate::server::ServerState;
use chat_common::frame::parse_inbound;
use chat_common::types::DEFAULT_USERNAME;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Timing and size limits applied to one connection.
#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    /// Largest accepted inbound message in bytes.
    pub max_payload: usize,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// How long the read side waits for a pong before giving up.
    pub pong_wait: Duration,
    /// Deadline for each outbound write.
    pub write_timeout: Duration,
}

impl From<&ServerConfig> for ClientSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_payload: config.max_payload,
            ping_interval: config.ping_interval(),
            pong_wait: config.pong_wait(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// What the handshake learned about a connecting client.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Admission {
    origin: String,
    user_id: Option<String>,
    username: String,
}

impl Admission {
    fn from_request(req: &Request, origin: String) -> Self {
        let mut user_id = None;
        let mut username = None;
        if let Some(query) = req.uri().query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "user_id" if !value.is_empty() => user_id = Some(value.into_owned()),
                    "username" if !value.is_empty() => username = Some(value.into_owned()),
                    _ => {}
                }
            }
        }
        Self {
            origin,
            user_id,
            username: username.unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
        }
    }
}

/// Originating address used as the rate-limit key.
///
/// First entry of `X-Forwarded-For`, then `X-Real-IP`, then the peer IP.
fn extract_client_addr(req: &Request, peer_addr: &SocketAddr) -> String {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    if let Some(real_ip) = header("x-real-ip") {
        return real_ip.to_string();
    }
    peer_addr.ip().to_string()
}

fn rate_limited_response() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("too many connection attempts".to_string()));
    *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    resp
}

/// Upgrades one TCP connection and runs it until either side ends.
///
/// # Errors
///
/// Returns an error if the handshake is refused or fails, or if the
/// connection ends abnormally.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), ChatdError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_payload),
        max_frame_size: Some(state.config.max_payload),
        ..WebSocketConfig::default()
    };

    let admission = Arc::new(OnceLock::new());
    let admission_cell = Arc::clone(&admission);
    let limiter_state = Arc::clone(&state);
    let accepted = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, resp: Response| {
            let origin = extract_client_addr(req, &peer_addr);
            if !limiter_state.rate_limiter.check(&origin) {
                counters::admissions_total("rate_limited");
                warn!(origin = %origin, "connection rate limit exceeded");
                return Err(rate_limited_response());
            }
            let _ = admission_cell.set(Admission::from_request(req, origin));
            Ok(resp)
        },
        Some(ws_config),
    )
    .await;

    let ws_stream = match accepted {
        Ok(ws) => ws,
        Err(tungstenite::Error::Http(resp)) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
            return Err(ChatdError::RateLimited);
        }
        Err(e) => return Err(ChatdError::WebSocket(e)),
    };
    let Some(admission) = admission.get().cloned() else {
        return Err(ChatdError::ConnectionClosed);
    };
    counters::admissions_total("admitted");

    let (handle, queue) =
        ClientHandle::new(admission.user_id, admission.username, state.config.send_queue);
    let identity = handle.identity().clone();
    info!(
        client = %identity.id,
        origin = %admission.origin,
        username = %identity.username,
        "client admitted"
    );
    state.hub.register(handle).await?;

    let (ws_tx, ws_rx) = ws_stream.split();
    run_client(
        ws_tx,
        ws_rx,
        queue,
        &identity,
        &state.hub,
        &ClientSettings::from(&state.config),
    )
    .await
}

/// Runs the inbound and outbound pumps of a registered client.
///
/// Whichever pump ends first unregisters the client. When the inbound side
/// ends, the outbound side is given one write deadline to flush the queue
/// and send a close frame.
///
/// # Errors
///
/// Returns the error that ended the first pump to finish.
pub async fn run_client<T, S>(
    mut ws_tx: T,
    mut ws_rx: S,
    mut queue: mpsc::Receiver<Outbound>,
    identity: &Identity,
    hub: &Hub,
    settings: &ClientSettings,
) -> Result<(), ChatdError>
where
    T: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let inbound = read_pump(&mut ws_rx, hub, identity, settings);
    let outbound = write_pump(&mut ws_tx, &mut queue, settings);
    tokio::pin!(inbound);
    tokio::pin!(outbound);

    let result = tokio::select! {
        result = &mut inbound => {
            unregister(hub, identity).await;
            if timeout(settings.write_timeout, &mut outbound).await.is_err() {
                debug!(client = %identity.id, "outbound pump did not finish after disconnect");
            }
            result
        }
        result = &mut outbound => {
            unregister(hub, identity).await;
            result
        }
    };

    match &result {
        Ok(()) => debug!(client = %identity.id, "connection closed"),
        Err(e) => debug!(client = %identity.id, error = %e, "connection ended"),
    }
    result
}

async fn unregister(hub: &Hub, identity: &Identity) {
    if let Err(e) = hub.unregister(identity.id).await {
        debug!(client = %identity.id, error = %e, "unregister skipped");
    }
}

/// Reads client messages and forwards them to the hub.
///
/// The read deadline starts at `pong_wait` and is pushed forward only by
/// pongs. Returns `Ok` when the peer closes and an error on the first frame
/// that does not decode.
async fn read_pump<S>(
    ws_rx: &mut S,
    hub: &Hub,
    identity: &Identity,
    settings: &ClientSettings,
) -> Result<(), ChatdError>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let mut deadline = Instant::now() + settings.pong_wait;
    loop {
        let next = timeout_at(deadline, ws_rx.next())
            .await
            .map_err(|_| ChatdError::ReadTimeout)?;
        match next {
            Some(Ok(WsMessage::Text(text))) => {
                forward(text.as_bytes(), hub, identity, settings).await?;
            }
            Some(Ok(WsMessage::Binary(data))) => {
                forward(&data, hub, identity, settings).await?;
            }
            Some(Ok(WsMessage::Pong(_))) => {
                deadline = Instant::now() + settings.pong_wait;
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Frame(_))) => {}
            Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn forward(
    data: &[u8],
    hub: &Hub,
    identity: &Identity,
    settings: &ClientSettings,
) -> Result<(), ChatdError> {
    let msg = parse_inbound(data, settings.max_payload).map_err(|e| {
        warn!(client = %identity.id, error = %e, "undecodable client message");
        e
    })?;
    hub.broadcast(identity.stamp(msg)).await
}

/// Writes queued frames and keepalive pings until the queue closes.
async fn write_pump<T>(
    ws_tx: &mut T,
    queue: &mut mpsc::Receiver<Outbound>,
    settings: &ClientSettings,
) -> Result<(), ChatdError>
where
    T: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let mut ping = interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => {
                    send_with_deadline(ws_tx, WsMessage::Text(frame.to_string()), settings).await?;
                }
                None => {
                    let _ = send_with_deadline(ws_tx, WsMessage::Close(None), settings).await;
                    return Ok(());
                }
            },
            _ = ping.tick() => {
                send_with_deadline(ws_tx, WsMessage::Ping(Vec::new()), settings).await?;
            }
        }
    }
}

async fn send_with_deadline<T>(
    ws_tx: &mut T,
    msg: WsMessage,
    settings: &ClientSettings,
) -> Result<(), ChatdError>
where
    T: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    timeout(settings.write_timeout, ws_tx.send(msg))
        .await
        .map_err(|_| ChatdError::WriteTimeout)?
        .map_err(ChatdError::WebSocket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ContentFilter;
    use crate::store::MessageStore;
    use chat_common::{MessageType, ServerFrame};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn settings() -> ClientSettings {
        ClientSettings {
            max_payload: 512 * 1024,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    fn peer_addr() -> SocketAddr {
        "10.0.0.7:54321".parse().unwrap()
    }

    fn test_hub() -> Hub {
        let store = Arc::new(MessageStore::in_memory().unwrap());
        Hub::spawn(store, Arc::new(ContentFilter::new(["bc"])), 100)
    }

    fn identity() -> Identity {
        Identity {
            id: Uuid::new_v4(),
            user_id: Some("u-1".to_string()),
            username: "alice".to_string(),
        }
    }

    async fn watcher(hub: &Hub) -> mpsc::Receiver<Outbound> {
        let (handle, mut rx) = ClientHandle::new(None, "watcher".to_string(), 16);
        hub.register(handle).await.unwrap();
        let history = rx.recv().await.unwrap();
        assert!(matches!(
            ServerFrame::parse(history.as_bytes()).unwrap(),
            ServerFrame::RecentMessages(_)
        ));
        rx
    }

    async fn next_message(rx: &mut mpsc::Receiver<Outbound>) -> chat_common::Message {
        let raw = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match ServerFrame::parse(raw.as_bytes()).unwrap() {
            ServerFrame::Message(msg) => msg,
            other => panic!("expected chat message, got {other:?}"),
        }
    }

    type Recorded = Arc<Mutex<Vec<WsMessage>>>;

    fn recording_sink(
        log: &Recorded,
    ) -> impl Sink<WsMessage, Error = tungstenite::Error> + Unpin + Send + 'static {
        let log = Arc::clone(log);
        Box::pin(futures_util::sink::unfold((), move |(), msg: WsMessage| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(msg);
                Ok::<_, tungstenite::Error>(())
            }
        }))
    }

    #[test]
    fn forwarded_for_first_entry_wins() {
        let req = request(
            "/ws",
            &[("X-Forwarded-For", " 203.0.113.9 , 10.0.0.1"), ("X-Real-IP", "198.51.100.2")],
        );
        assert_eq!(extract_client_addr(&req, &peer_addr()), "203.0.113.9");
    }

    #[test]
    fn real_ip_used_without_forwarded_for() {
        let req = request("/ws", &[("X-Real-IP", "198.51.100.2")]);
        assert_eq!(extract_client_addr(&req, &peer_addr()), "198.51.100.2");
    }

    #[test]
    fn peer_ip_without_port_is_fallback() {
        let req = request("/ws", &[("X-Forwarded-For", "  ")]);
        assert_eq!(extract_client_addr(&req, &peer_addr()), "10.0.0.7");
    }

    #[test]
    fn admission_reads_query_identity() {
        let req = request("/ws?user_id=u-42&username=Jane%20Doe", &[]);
        let admission = Admission::from_request(&req, "1.2.3.4".to_string());
        assert_eq!(admission.user_id.as_deref(), Some("u-42"));
        assert_eq!(admission.username, "Jane Doe");
        assert_eq!(admission.origin, "1.2.3.4");
    }

    #[test]
    fn admission_defaults_missing_identity() {
        let req = request("/ws?user_id=&other=1", &[]);
        let admission = Admission::from_request(&req, "1.2.3.4".to_string());
        assert_eq!(admission.user_id, None);
        assert_eq!(admission.username, DEFAULT_USERNAME);

        let bare = Admission::from_request(&request("/", &[]), "x".to_string());
        assert_eq!(bare.username, DEFAULT_USERNAME);
    }

    #[test]
    fn rate_limited_response_is_429() {
        let resp = rate_limited_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.body().is_some());
    }

    #[tokio::test]
    async fn read_pump_stamps_and_forwards_until_peer_closes() {
        let hub = test_hub();
        let mut rx = watcher(&hub).await;
        let me = identity();

        let mut inbound = futures_util::stream::iter(vec![
            Ok(WsMessage::Text(
                r#"{"message":"hi bc","user_id":"root","username":"mallory"}"#.to_string(),
            )),
            Ok(WsMessage::Pong(Vec::new())),
            Ok(WsMessage::Binary(br#"{"type":"sticker","message":"cat"}"#.to_vec())),
        ]);
        read_pump(&mut inbound, &hub, &me, &settings()).await.unwrap();

        let first = next_message(&mut rx).await;
        assert_eq!(first.content, "hi ***");
        assert_eq!(first.user_id.as_deref(), Some("u-1"));
        assert_eq!(first.username.as_deref(), Some("alice"));
        assert_eq!(first.kind, MessageType::Text);

        let second = next_message(&mut rx).await;
        assert_eq!(second.kind, MessageType::Sticker);
        assert_eq!(second.content, "cat");
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn read_pump_stops_on_close_frame() {
        let hub = test_hub();
        let mut inbound = futures_util::stream::iter(vec![
            Ok(WsMessage::Close(None)),
            Ok(WsMessage::Text(r#"{"message":"after close"}"#.to_string())),
        ]);
        read_pump(&mut inbound, &hub, &identity(), &settings())
            .await
            .unwrap();
        assert!(inbound.next().await.is_some());
    }

    #[tokio::test]
    async fn read_pump_fails_on_malformed_frame() {
        let hub = test_hub();
        let mut rx = watcher(&hub).await;

        let mut inbound = futures_util::stream::iter(vec![
            Ok(WsMessage::Text("not json".to_string())),
            Ok(WsMessage::Text(r#"{"message":"never sent"}"#.to_string())),
        ]);
        let err = read_pump(&mut inbound, &hub, &identity(), &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatdError::Frame(_)));

        hub.broadcast(chat_common::Message::text("sentinel"))
            .await
            .unwrap();
        assert_eq!(next_message(&mut rx).await.content, "sentinel");
    }

    #[tokio::test]
    async fn read_pump_rejects_unknown_type() {
        let hub = test_hub();
        let mut inbound = futures_util::stream::iter(vec![Ok(WsMessage::Text(
            r#"{"type":"poll","message":"?"}"#.to_string(),
        ))]);
        let err = read_pump(&mut inbound, &hub, &identity(), &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatdError::Frame(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn read_pump_times_out_without_pong() {
        let hub = test_hub();
        let mut inbound = futures_util::stream::pending::<Result<WsMessage, tungstenite::Error>>();
        let err = read_pump(&mut inbound, &hub, &identity(), &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatdError::ReadTimeout));
    }

    #[tokio::test]
    async fn write_pump_sends_frames_then_close() {
        let log = Recorded::default();
        let mut sink = recording_sink(&log);
        let (tx, mut rx) = mpsc::channel(4);
        tx.try_send(Outbound::from("first")).unwrap();
        tx.try_send(Outbound::from("second")).unwrap();
        drop(tx);

        write_pump(&mut sink, &mut rx, &settings()).await.unwrap();

        let sent = log.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                WsMessage::Text("first".to_string()),
                WsMessage::Text("second".to_string()),
                WsMessage::Close(None),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn write_pump_pings_on_interval() {
        let log = Recorded::default();
        let mut sink = recording_sink(&log);
        let (tx, mut rx) = mpsc::channel::<Outbound>(4);
        let config = settings();

        let pump = tokio::spawn(async move { write_pump(&mut sink, &mut rx, &config).await });
        tokio::time::sleep(config.ping_interval + Duration::from_secs(1)).await;
        drop(tx);
        pump.await.unwrap().unwrap();

        let sent = log.lock().unwrap().clone();
        assert_eq!(sent, vec![WsMessage::Ping(Vec::new()), WsMessage::Close(None)]);
    }

    #[tokio::test]
    async fn peer_close_unregisters_and_flushes_queue() {
        let hub = test_hub();
        let (handle, queue) = ClientHandle::new(Some("u-1".to_string()), "alice".to_string(), 8);
        let me = handle.identity().clone();
        hub.register(handle).await.unwrap();

        let log = Recorded::default();
        let inbound = futures_util::stream::iter(Vec::<Result<WsMessage, tungstenite::Error>>::new());
        run_client(recording_sink(&log), inbound, queue, &me, &hub, &settings())
            .await
            .unwrap();

        assert_eq!(hub.connected_clients(), 0);
        let sent = log.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], WsMessage::Text(t) if t.contains("recent_messages")));
        assert_eq!(sent[1], WsMessage::Close(None));
    }

    #[tokio::test]
    async fn failed_write_unregisters_client() {
        let hub = test_hub();
        let (handle, queue) = ClientHandle::new(None, "alice".to_string(), 8);
        let me = handle.identity().clone();
        hub.register(handle).await.unwrap();

        let broken = Box::pin(futures_util::sink::unfold((), |(), _msg: WsMessage| async {
            Err::<(), _>(tungstenite::Error::ConnectionClosed)
        }));
        let inbound = futures_util::stream::pending::<Result<WsMessage, tungstenite::Error>>();
        let err = run_client(broken, inbound, queue, &me, &hub, &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatdError::WebSocket(_)));

        for _ in 0..100 {
            if hub.connected_clients() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.connected_clients(), 0);
    }
}
