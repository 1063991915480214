// core/node-client/src/pool.rs
// Shared HTTP client and per-URL WebSocket registry

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval_at, Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, warn};

pub const USER_AGENT: &str = "BlockchainModule/2.0.0";
const INBOUND_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to connect to WebSocket {url} after {attempts} attempts: {reason}")]
    Connection {
        url: String,
        attempts: u32,
        reason: String,
    },
    #[error("HTTP client error: {0}")]
    Http(String),
    #[error("WebSocket {0} is closed")]
    Closed(String),
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub ws_connect_attempts: u32,
    /// Sleep after failed attempt `n` is `ws_backoff_base * 2^n`.
    pub ws_backoff_base: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            ws_connect_attempts: 3,
            ws_backoff_base: Duration::from_secs(1),
        }
    }
}

impl PoolSettings {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_ws_backoff_base(mut self, base: Duration) -> Self {
        self.ws_backoff_base = base;
        self
    }
}

/// Reply computed from an inbound text frame, sent once per socket.
pub type FrameResponder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Per-call WebSocket options. Unset fields fall back to the pool settings.
///
/// `heartbeat` and `responder` only take effect when the call opens a new
/// socket; an already open one keeps the options it was created with.
#[derive(Clone, Default)]
pub struct WsOptions {
    pub connect_timeout: Option<Duration>,
    pub connect_attempts: Option<u32>,
    pub heartbeat: Option<Duration>,
    pub responder: Option<FrameResponder>,
}

impl WsOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = Some(attempts);
        self
    }

    /// Sends a transport ping every `interval`.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    /// Answers matching inbound frames from the socket's reader task, so a
    /// request seen by many borrowers is answered once.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_requests: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub open_websockets: usize,
    pub http_session_active: bool,
    pub created_at: DateTime<Utc>,
}

/// One WebSocket shared by every borrower of its URL.
///
/// Inbound text frames fan out through a broadcast channel; outbound frames
/// go through a writer task. Address subscriptions are reference-counted so
/// only the first borrower subscribes on the wire and only the last one
/// unsubscribes.
pub struct WsConnection {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    inbound: broadcast::Sender<String>,
    closed: CancellationToken,
    subscriptions: StdMutex<HashMap<String, usize>>,
}

impl WsConnection {
    /// Takes ownership of an open stream and starts its reader and writer tasks.
    pub fn spawn<S>(url: &str, stream: WebSocketStream<S>, options: &WsOptions) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut source) = stream.split();
        let mut heartbeat = options
            .heartbeat
            .map(|period| interval_at(Instant::now() + period, period));
        let responder = options.responder.clone();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound, _) = broadcast::channel(INBOUND_BUFFER);
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        let writer_url = url.to_string();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = writer_closed.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    reply = reply_rx.recv() => reply,
                    _ = heartbeat_tick(&mut heartbeat) => Some(Message::Ping(Vec::new())),
                    message = outbound_rx.recv() => match message {
                        Some(message) => Some(message),
                        // every handle dropped
                        None => break,
                    },
                };

                if let Some(message) = next {
                    if let Err(e) = sink.send(message).await {
                        warn!(url = %writer_url, error = %e, "WebSocket send failed");
                        break;
                    }
                }
            }
            writer_closed.cancel();
        });

        let reader_closed = closed.clone();
        let reader_inbound = inbound.clone();
        let reader_url = url.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    frame = source.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let reply = responder
                                .as_ref()
                                .and_then(|respond| respond(text.as_str()));
                            if let Some(reply) = reply {
                                let _ = reply_tx.send(Message::Text(reply));
                            }
                            // no receivers is fine
                            let _ = reader_inbound.send(text);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = reply_tx.send(Message::Pong(payload));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(url = %reader_url, ?frame, "WebSocket closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(url = %reader_url, error = %e, "WebSocket read failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
            reader_closed.cancel();
        });

        Arc::new(Self {
            url: url.to_string(),
            outbound,
            inbound,
            closed,
            subscriptions: StdMutex::new(HashMap::new()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// New receiver for inbound text frames. Frames sent before this call are not seen.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }

    pub fn send_text(&self, text: String) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed(self.url.clone()));
        }
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| PoolError::Closed(self.url.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the socket is gone, whoever closed it.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Returns true when this borrower is the first to watch `address`.
    pub fn retain_subscription(&self, address: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        let count = subscriptions.entry(address.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true when this borrower was the last one watching `address`.
    pub fn release_subscription(&self, address: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        match subscriptions.get_mut(address) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                subscriptions.remove(address);
                true
            }
            None => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

struct PoolInner {
    http: Option<reqwest::Client>,
    sockets: HashMap<String, Arc<WsConnection>>,
    closed: bool,
    total_requests: u64,
    successful_connections: u64,
    failed_connections: u64,
}

/// Connection pool shared by every monitor and client of one coin.
pub struct ConnectionPool {
    settings: PoolSettings,
    inner: Mutex<PoolInner>,
    created_at: DateTime<Utc>,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings) -> Self {
        info!(
            max_connections = settings.max_connections,
            "Connection pool initialized"
        );
        Self {
            settings,
            inner: Mutex::new(PoolInner {
                http: None,
                sockets: HashMap::new(),
                closed: false,
                total_requests: 0,
                successful_connections: 0,
                failed_connections: 0,
            }),
            created_at: Utc::now(),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// The shared HTTP client, created on first use.
    pub async fn acquire_http_session(&self) -> Result<reqwest::Client, PoolError> {
        let mut inner = self.inner.lock().await;

        if inner.http.is_none() {
            let client = reqwest::Client::builder()
                .pool_max_idle_per_host(self.settings.max_connections)
                .timeout(self.settings.request_timeout)
                .user_agent(USER_AGENT)
                .build()
                .map_err(|e| PoolError::Http(e.to_string()))?;
            inner.http = Some(client);
            inner.closed = false;
            info!("HTTP session created");
        }

        inner.total_requests += 1;
        inner
            .http
            .clone()
            .ok_or_else(|| PoolError::Http("client unavailable".to_string()))
    }

    /// Returns the open socket for `url`, connecting with bounded retries if needed.
    pub async fn acquire_websocket(
        &self,
        url: &str,
        options: &WsOptions,
    ) -> Result<Arc<WsConnection>, PoolError> {
        if let Some(existing) = self.open_socket(url).await {
            return Ok(existing);
        }

        let max_attempts = options
            .connect_attempts
            .unwrap_or(self.settings.ws_connect_attempts)
            .max(1);
        let connect_timeout = options
            .connect_timeout
            .unwrap_or(self.settings.connect_timeout);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = std::time::Instant::now();

            let outcome = match tokio::time::timeout(connect_timeout, connect_async(url)).await {
                Ok(Ok((stream, _response))) => Ok(stream),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("connect timed out".to_string()),
            };

            match outcome {
                Ok(stream) => {
                    let connection = WsConnection::spawn(url, stream, options);
                    let mut inner = self.inner.lock().await;

                    // Someone else may have connected while we were not holding the lock
                    if let Some(existing) = inner.sockets.get(url) {
                        if !existing.is_closed() {
                            let existing = existing.clone();
                            connection.close();
                            inner.total_requests += 1;
                            return Ok(existing);
                        }
                    }

                    inner.sockets.insert(url.to_string(), connection.clone());
                    inner.closed = false;
                    inner.total_requests += 1;
                    inner.successful_connections += 1;
                    info!(
                        url = %url,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "WebSocket connected"
                    );
                    return Ok(connection);
                }
                Err(reason) => {
                    {
                        let mut inner = self.inner.lock().await;
                        inner.failed_connections += 1;
                    }
                    warn!(
                        url = %url,
                        attempt,
                        max_attempts,
                        error = %reason,
                        "WebSocket connection failed"
                    );

                    if attempt >= max_attempts {
                        error!(url = %url, attempts = attempt, "Giving up on WebSocket connection");
                        return Err(PoolError::Connection {
                            url: url.to_string(),
                            attempts: attempt,
                            reason,
                        });
                    }

                    tokio::time::sleep(self.settings.ws_backoff_base * 2u32.pow(attempt)).await;
                }
            }
        }
    }

    async fn open_socket(&self, url: &str) -> Option<Arc<WsConnection>> {
        let mut inner = self.inner.lock().await;
        match inner.sockets.get(url) {
            Some(existing) if !existing.is_closed() => {
                let existing = existing.clone();
                inner.total_requests += 1;
                Some(existing)
            }
            Some(_) => {
                inner.sockets.remove(url);
                None
            }
            None => None,
        }
    }

    /// Closes and forgets the socket for `url`. Idempotent.
    pub async fn release_websocket(&self, url: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(connection) = inner.sockets.remove(url) {
            connection.close();
            info!(url = %url, "WebSocket connection released");
        }
    }

    /// Closes every socket and drops the HTTP client. Later acquires start fresh.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        for (_, connection) in inner.sockets.drain() {
            connection.close();
        }
        inner.http = None;
        inner.closed = true;
        info!("Connection pool closed");
    }

    pub async fn is_healthy(&self) -> bool {
        let inner = self.inner.lock().await;
        if inner.http.is_none() || inner.closed {
            return false;
        }
        (inner.failed_connections as f64) <= inner.successful_connections as f64 * 0.5
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            total_requests: inner.total_requests,
            successful_connections: inner.successful_connections,
            failed_connections: inner.failed_connections,
            open_websockets: inner.sockets.values().filter(|c| !c.is_closed()).count(),
            http_session_active: inner.http.is_some(),
            created_at: self.created_at,
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Local server that echoes text frames, pings on request and reports
    /// client pings as a `heartbeat` text frame.
    async fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = match accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };
                    while let Some(Ok(message)) = ws.next().await {
                        match message {
                            Message::Text(text) if text == "ping-me" => {
                                let _ = ws.send(Message::Ping(vec![7, 7])).await;
                            }
                            Message::Text(text) => {
                                let _ = ws.send(Message::Text(format!("echo:{}", text))).await;
                            }
                            Message::Ping(_) => {
                                let _ = ws.send(Message::Text("heartbeat".to_string())).await;
                            }
                            Message::Pong(payload) => {
                                let _ = ws
                                    .send(Message::Text(format!("pong:{:?}", payload)))
                                    .await;
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });
            }
        });
        format!("ws://{}", addr)
    }

    fn fast_pool() -> ConnectionPool {
        ConnectionPool::new(PoolSettings::default().with_ws_backoff_base(Duration::from_millis(1)))
    }

    async fn next_text(rx: &mut broadcast::Receiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_same_url_returns_same_handle() {
        let url = spawn_server().await;
        let pool = fast_pool();

        let first = pool.acquire_websocket(&url, &WsOptions::default()).await.unwrap();
        let second = pool.acquire_websocket(&url, &WsOptions::default()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        let stats = pool.stats().await;
        assert_eq!(stats.successful_connections, 1);
        assert_eq!(stats.open_websockets, 1);
    }

    #[tokio::test]
    async fn test_inbound_frames_fan_out() {
        let url = spawn_server().await;
        let pool = fast_pool();
        let connection = pool.acquire_websocket(&url, &WsOptions::default()).await.unwrap();

        let mut a = connection.subscribe();
        let mut b = connection.subscribe();
        connection.send_text("hello".to_string()).unwrap();

        assert_eq!(next_text(&mut a).await, "echo:hello");
        assert_eq!(next_text(&mut b).await, "echo:hello");
    }

    #[tokio::test]
    async fn test_transport_ping_is_answered() {
        let url = spawn_server().await;
        let pool = fast_pool();
        let connection = pool.acquire_websocket(&url, &WsOptions::default()).await.unwrap();
        let mut rx = connection.subscribe();

        connection.send_text("ping-me".to_string()).unwrap();
        assert_eq!(next_text(&mut rx).await, "pong:[7, 7]");
    }

    #[tokio::test]
    async fn test_release_closes_and_reconnects() {
        let url = spawn_server().await;
        let pool = fast_pool();

        let first = pool.acquire_websocket(&url, &WsOptions::default()).await.unwrap();
        pool.release_websocket(&url).await;
        pool.release_websocket(&url).await;
        assert!(first.is_closed());
        assert!(first.send_text("late".to_string()).is_err());

        let second = pool.acquire_websocket(&url, &WsOptions::default()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.stats().await.successful_connections, 2);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_three_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let pool = fast_pool();
        match pool.acquire_websocket(&url, &WsOptions::default()).await {
            Err(PoolError::Connection { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected connection error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(pool.stats().await.failed_connections, 3);
    }

    #[tokio::test]
    async fn test_per_call_attempts_override_pool_setting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let pool = fast_pool();
        let options = WsOptions::default()
            .with_connect_attempts(1)
            .with_connect_timeout(Duration::from_secs(2));
        match pool.acquire_websocket(&url, &options).await {
            Err(PoolError::Connection { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected connection error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(pool.stats().await.failed_connections, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_pings_the_server() {
        let url = spawn_server().await;
        let pool = fast_pool();
        let options = WsOptions::default().with_heartbeat(Duration::from_millis(50));
        let connection = pool.acquire_websocket(&url, &options).await.unwrap();
        let mut rx = connection.subscribe();

        assert_eq!(next_text(&mut rx).await, "heartbeat");
    }

    #[tokio::test]
    async fn test_responder_answers_once_per_socket() {
        let url = spawn_server().await;
        let pool = fast_pool();
        let options = WsOptions::default()
            .with_responder(|text| (text == "echo:hello").then(|| "ack".to_string()));
        let connection = pool.acquire_websocket(&url, &options).await.unwrap();

        let mut a = connection.subscribe();
        let mut b = connection.subscribe();
        connection.send_text("hello".to_string()).unwrap();

        for rx in [&mut a, &mut b] {
            assert_eq!(next_text(rx).await, "echo:hello");
            assert_eq!(next_text(rx).await, "echo:ack");
        }
        // one reply on the wire even with two borrowers
        let extra = tokio::time::timeout(Duration::from_millis(200), a.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_health_follows_failure_ratio() {
        let pool = fast_pool();
        assert!(!pool.is_healthy().await);

        pool.acquire_http_session().await.unwrap();
        assert!(pool.is_healthy().await);

        {
            let mut inner = pool.inner.lock().await;
            inner.successful_connections = 2;
            inner.failed_connections = 1;
        }
        assert!(pool.is_healthy().await);

        pool.inner.lock().await.failed_connections = 2;
        assert!(!pool.is_healthy().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_recoverable() {
        let url = spawn_server().await;
        let pool = fast_pool();
        let connection = pool.acquire_websocket(&url, &WsOptions::default()).await.unwrap();
        pool.acquire_http_session().await.unwrap();

        pool.close().await;
        pool.close().await;
        assert!(connection.is_closed());
        assert!(!pool.is_healthy().await);

        pool.acquire_http_session().await.unwrap();
        assert!(pool.stats().await.http_session_active);
    }

    #[test]
    fn test_subscription_refcounting() {
        tokio_test::block_on(async {
            let url = spawn_server().await;
            let pool = fast_pool();
            let connection = pool.acquire_websocket(&url, &WsOptions::default()).await.unwrap();

            assert!(connection.retain_subscription("addr-1"));
            assert!(!connection.retain_subscription("addr-1"));
            assert_eq!(connection.subscription_count(), 1);

            assert!(!connection.release_subscription("addr-1"));
            assert!(connection.release_subscription("addr-1"));
            assert!(!connection.release_subscription("addr-1"));
            assert_eq!(connection.subscription_count(), 0);
        });
    }
}
