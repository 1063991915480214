// core/blockchain-monitor/src/monitor.rs
// Per-(tenant, coin) WebSocket monitor with reconnect/backoff and a command handle

use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use coinwatch_common::{
    sanitize_for_logging, short, validate_monitored_address, CoinConfig, MetricsSink,
    MonitorSettings, MonitorStatus, NoopMetrics, Persistence, StoreError, TenantId,
    TransactionRecord, ValidationError,
};
use coinwatch_node::{ConnectionPool, NodeApi, PoolError, WsConnection, WsOptions};

use crate::callback::{TransactionCallback, TransactionNotification};
use crate::protocol::{
    parse_inbound, ping_reply, subscribe_frame, unsubscribe_frame, InboundMessage, ProtocolError,
    TransactionEvent,
};

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("WebSocket connection failed: {0}")]
    Connection(String),
    #[error("WebSocket closed: {0}")]
    Disconnected(String),
    #[error("Node client not configured")]
    NoNodeClient,
    #[error("Monitor is not running")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Idle,
    Connecting,
    Subscribed,
    Listening,
    Reconnecting,
    Closed,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Idle => "idle",
            MonitorState::Connecting => "connecting",
            MonitorState::Subscribed => "subscribed",
            MonitorState::Listening => "listening",
            MonitorState::Reconnecting => "reconnecting",
            MonitorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub tenant_id: TenantId,
    pub coin: String,
    pub state: MonitorState,
    pub connected: bool,
    pub is_running: bool,
    pub monitored_addresses: usize,
    pub messages_received: u64,
    pub transactions_processed: u64,
    pub errors: u64,
    pub reconnect_attempts: u32,
    pub uptime_seconds: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

pub enum MonitorCommand {
    AddAddress {
        address: String,
        label: Option<String>,
        reply: oneshot::Sender<Result<(), MonitorError>>,
    },
    RemoveAddress {
        address: String,
        reply: oneshot::Sender<Result<(), MonitorError>>,
    },
    Stats {
        reply: oneshot::Sender<MonitorStats>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a monitor running in its own task.
#[derive(Clone)]
pub struct MonitorHandle {
    tenant_id: TenantId,
    coin: String,
    commands: mpsc::Sender<MonitorCommand>,
    cancel: CancellationToken,
}

impl MonitorHandle {
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn coin(&self) -> &str {
        &self.coin
    }

    pub async fn add_address(
        &self,
        address: &str,
        label: Option<&str>,
    ) -> Result<(), MonitorError> {
        let address = address.to_string();
        let label = label.map(str::to_string);
        self.request(|reply| MonitorCommand::AddAddress {
            address,
            label,
            reply,
        })
        .await?
    }

    pub async fn remove_address(&self, address: &str) -> Result<(), MonitorError> {
        let address = address.to_string();
        self.request(|reply| MonitorCommand::RemoveAddress { address, reply })
            .await?
    }

    pub async fn stats(&self) -> Result<MonitorStats, MonitorError> {
        self.request(|reply| MonitorCommand::Stats { reply }).await
    }

    /// Asks the monitor to close and waits until it has. No-op once stopped.
    pub async fn close(&self) {
        let _ = self.request(|reply| MonitorCommand::Close { reply }).await;
    }

    /// Cancels without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> MonitorCommand,
    ) -> Result<T, MonitorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| MonitorError::Stopped)?;
        response.await.map_err(|_| MonitorError::Stopped)
    }
}

enum ListenExit {
    Cancelled,
    CloseRequested,
}

/// Watches one tenant's addresses on one coin.
///
/// The watch set is owned here; other tasks change it through a
/// [`MonitorHandle`]. Without a pool the monitor opens and owns its socket.
pub struct Monitor {
    tenant_id: TenantId,
    coin: CoinConfig,
    ws_url: String,
    ws_options: WsOptions,
    settings: MonitorSettings,
    store: Arc<dyn Persistence>,
    pool: Option<Arc<ConnectionPool>>,
    node: Option<Arc<dyn NodeApi>>,
    metrics: Arc<dyn MetricsSink>,
    callback: Option<Arc<dyn TransactionCallback>>,

    state: MonitorState,
    running: bool,
    watched: HashSet<String>,
    connection: Option<Arc<WsConnection>>,
    owns_connection: bool,
    // addresses this monitor holds a subscription reference for
    subscribed: HashSet<String>,

    cancel: CancellationToken,
    commands: mpsc::Receiver<MonitorCommand>,
    command_tx: mpsc::Sender<MonitorCommand>,
    close_waiters: Vec<oneshot::Sender<()>>,

    messages_received: u64,
    transactions_processed: u64,
    errors: u64,
    reconnect_attempts: u32,
    started_at: Option<Instant>,
    last_activity: Option<DateTime<Utc>>,
}

impl Monitor {
    pub fn new(tenant_id: TenantId, coin: CoinConfig, store: Arc<dyn Persistence>) -> Self {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let ws_url = coin.ws_url();
        Self {
            tenant_id,
            coin,
            ws_url,
            // pings are answered by the socket so shared sockets reply once
            ws_options: WsOptions::default().with_responder(ping_reply),
            settings: MonitorSettings::default(),
            store,
            pool: None,
            node: None,
            metrics: Arc::new(NoopMetrics),
            callback: None,
            state: MonitorState::Idle,
            running: false,
            watched: HashSet::new(),
            connection: None,
            owns_connection: false,
            subscribed: HashSet::new(),
            cancel: CancellationToken::new(),
            commands,
            command_tx,
            close_waiters: Vec::new(),
            messages_received: 0,
            transactions_processed: 0,
            errors: 0,
            reconnect_attempts: 0,
            started_at: None,
            last_activity: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_node(mut self, node: Arc<dyn NodeApi>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn TransactionCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_settings(mut self, settings: MonitorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides the URL derived from the coin's Blockbook endpoint.
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            tenant_id: self.tenant_id,
            coin: self.coin.symbol.clone(),
            commands: self.command_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn watched_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.watched.iter().cloned().collect();
        addresses.sort();
        addresses
    }

    fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|conn| !conn.is_closed())
            .unwrap_or(false)
    }

    fn report_address_count(&self) {
        self.metrics.monitored_addresses(
            &self.coin.symbol,
            &self.tenant_id.to_string(),
            self.watched.len(),
        );
    }

    /// Loads the tenant's active addresses into the watch set.
    pub async fn initialize(&mut self) -> bool {
        match self
            .store
            .get_active_addresses(self.tenant_id, &self.coin.symbol)
            .await
        {
            Ok(addresses) => {
                self.watched = addresses.into_iter().collect();
                self.report_address_count();
                info!(
                    tenant_id = %self.tenant_id,
                    coin = %self.coin.symbol,
                    addresses = self.watched.len(),
                    "Monitor initialized"
                );
                true
            }
            Err(e) => {
                error!(
                    tenant_id = %self.tenant_id,
                    coin = %self.coin.symbol,
                    error = %e,
                    "Failed to load monitored addresses"
                );
                false
            }
        }
    }

    pub async fn add_address(
        &mut self,
        address: &str,
        label: Option<&str>,
    ) -> Result<(), MonitorError> {
        validate_monitored_address(address)?;

        self.store
            .add_address(self.tenant_id, &self.coin.symbol, address, label)
            .await?;
        self.watched.insert(address.to_string());

        if matches!(self.state, MonitorState::Subscribed | MonitorState::Listening) {
            if let Some(conn) = self.connection.clone() {
                if let Err(e) = self.subscribe_address(&conn, address) {
                    warn!(
                        coin = %self.coin.symbol,
                        address = %short(address),
                        error = %e,
                        "Subscribe failed, will retry on reconnect"
                    );
                }
            }
        }

        self.report_address_count();
        info!(
            tenant_id = %self.tenant_id,
            coin = %self.coin.symbol,
            address = %short(address),
            "Address added to monitoring"
        );
        Ok(())
    }

    pub async fn remove_address(&mut self, address: &str) -> Result<(), MonitorError> {
        validate_monitored_address(address)?;

        self.store
            .deactivate_address(self.tenant_id, &self.coin.symbol, address)
            .await?;
        self.watched.remove(address);

        if let Some(conn) = self.connection.clone() {
            self.unsubscribe_address(&conn, address);
        } else {
            self.subscribed.remove(address);
        }

        self.report_address_count();
        info!(
            tenant_id = %self.tenant_id,
            coin = %self.coin.symbol,
            address = %short(address),
            "Address removed from monitoring"
        );
        Ok(())
    }

    fn subscribe_address(&mut self, conn: &WsConnection, address: &str) -> Result<(), PoolError> {
        if !self.subscribed.insert(address.to_string()) {
            return Ok(());
        }
        if conn.retain_subscription(address) {
            conn.send_text(subscribe_frame(address))?;
        }
        Ok(())
    }

    fn unsubscribe_address(&mut self, conn: &WsConnection, address: &str) {
        if !self.subscribed.remove(address) {
            return;
        }
        if conn.release_subscription(address) && !conn.is_closed() {
            if let Err(e) = conn.send_text(unsubscribe_frame(address)) {
                debug!(address = %short(address), error = %e, "Unsubscribe not sent");
            }
        }
    }

    /// Main loop. Returns once the monitor is closed, cancelled or out of
    /// reconnect attempts.
    pub async fn start(&mut self) -> MonitorStatus {
        if self.state == MonitorState::Closed {
            warn!(
                tenant_id = %self.tenant_id,
                coin = %self.coin.symbol,
                "Monitor already closed, not restarting"
            );
            return MonitorStatus::Stopped;
        }

        self.running = true;
        self.started_at = Some(Instant::now());
        info!(
            tenant_id = %self.tenant_id,
            coin = %self.coin.symbol,
            url = %self.ws_url,
            "Starting blockchain monitor"
        );

        let outcome = loop {
            if !self.running || self.cancel.is_cancelled() {
                break MonitorStatus::Stopped;
            }

            self.state = MonitorState::Connecting;
            let cancel = self.cancel.clone();
            let connected = tokio::select! {
                _ = cancel.cancelled() => None,
                connected = self.connect() => Some(connected),
            };
            let Some(connected) = connected else {
                break MonitorStatus::Stopped;
            };
            let result = match connected {
                Ok((conn, inbound)) => {
                    self.reconnect_attempts = 0;
                    self.listen(conn, inbound).await
                }
                Err(e) => Err(e),
            };

            let reason = match result {
                Ok(ListenExit::Cancelled) | Ok(ListenExit::CloseRequested) => {
                    break MonitorStatus::Stopped;
                }
                Err(e) => e,
            };

            self.errors += 1;
            self.detach_connection();

            if self.reconnect_attempts >= self.settings.max_reconnect_attempts {
                error!(
                    tenant_id = %self.tenant_id,
                    coin = %self.coin.symbol,
                    attempts = self.reconnect_attempts,
                    error = %reason,
                    "Max reconnection attempts reached, giving up"
                );
                break MonitorStatus::Failed;
            }

            let delay = self.settings.reconnect_delay(self.reconnect_attempts);
            self.state = MonitorState::Reconnecting;
            self.metrics
                .websocket_reconnect(&self.coin.symbol, reconnect_reason(&reason));
            warn!(
                tenant_id = %self.tenant_id,
                coin = %self.coin.symbol,
                error = %reason,
                delay_ms = delay.as_millis() as u64,
                attempt = self.reconnect_attempts + 1,
                "Connection lost, reconnecting"
            );

            if !self.backoff(delay).await {
                break MonitorStatus::Stopped;
            }
            self.reconnect_attempts += 1;
        };

        self.close().await;
        outcome
    }

    async fn connect(
        &mut self,
    ) -> Result<(Arc<WsConnection>, broadcast::Receiver<String>), MonitorError> {
        let conn = match &self.pool {
            Some(pool) => {
                self.owns_connection = false;
                pool.acquire_websocket(&self.ws_url, &self.ws_options).await?
            }
            None => {
                let (stream, _) = tokio_tungstenite::connect_async(self.ws_url.as_str())
                    .await
                    .map_err(|e| MonitorError::Connection(e.to_string()))?;
                self.owns_connection = true;
                WsConnection::spawn(&self.ws_url, stream, &self.ws_options)
            }
        };

        // receiver first so nothing sent in reply to our subscribes is missed
        let inbound = conn.subscribe();
        self.connection = Some(conn.clone());
        self.last_activity = Some(Utc::now());
        self.metrics.websocket_connected(&self.coin.symbol);
        info!(
            tenant_id = %self.tenant_id,
            coin = %self.coin.symbol,
            "WebSocket connected"
        );

        let addresses: Vec<String> = self.watched.iter().cloned().collect();
        for address in &addresses {
            self.subscribe_address(&conn, address)?;
        }
        self.state = MonitorState::Subscribed;
        info!(
            tenant_id = %self.tenant_id,
            coin = %self.coin.symbol,
            addresses = addresses.len(),
            "Subscribed to addresses"
        );

        Ok((conn, inbound))
    }

    async fn listen(
        &mut self,
        conn: Arc<WsConnection>,
        mut inbound: broadcast::Receiver<String>,
    ) -> Result<ListenExit, MonitorError> {
        self.state = MonitorState::Listening;
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(ListenExit::Cancelled),
                _ = conn.closed() => {
                    return Err(MonitorError::Disconnected(conn.url().to_string()));
                }
                Some(command) = self.commands.recv() => {
                    if !self.apply_command(command).await {
                        return Ok(ListenExit::CloseRequested);
                    }
                }
                frame = inbound.recv() => match frame {
                    Ok(text) => self.handle_message(&text).await,
                    Err(RecvError::Lagged(skipped)) => {
                        self.errors += 1;
                        warn!(coin = %self.coin.symbol, skipped, "Monitor fell behind, frames dropped");
                    }
                    Err(RecvError::Closed) => {
                        return Err(MonitorError::Disconnected(conn.url().to_string()));
                    }
                },
            }
        }
    }

    /// Sleeps for `delay` while still serving commands. False when the
    /// monitor should stop instead of reconnecting.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let cancel = self.cancel.clone();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(command) = self.commands.recv() => {
                    if !self.apply_command(command).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Returns false for a close request.
    async fn apply_command(&mut self, command: MonitorCommand) -> bool {
        match command {
            MonitorCommand::AddAddress {
                address,
                label,
                reply,
            } => {
                let result = self.add_address(&address, label.as_deref()).await;
                let _ = reply.send(result);
                true
            }
            MonitorCommand::RemoveAddress { address, reply } => {
                let result = self.remove_address(&address).await;
                let _ = reply.send(result);
                true
            }
            MonitorCommand::Stats { reply } => {
                let _ = reply.send(self.get_stats());
                true
            }
            MonitorCommand::Close { reply } => {
                self.running = false;
                self.close_waiters.push(reply);
                false
            }
        }
    }

    async fn handle_message(&mut self, text: &str) {
        self.messages_received += 1;
        self.last_activity = Some(Utc::now());

        let message = match parse_inbound(text) {
            Ok(message) => message,
            Err(ProtocolError::InvalidJson(e)) => {
                warn!(
                    coin = %self.coin.symbol,
                    error = %e,
                    frame = %sanitize_for_logging(text),
                    "Invalid JSON message"
                );
                self.metrics.websocket_message(&self.coin.symbol, "invalid");
                return;
            }
            Err(e) => {
                self.errors += 1;
                error!(coin = %self.coin.symbol, error = %e, "Error processing WebSocket message");
                self.metrics.websocket_message(&self.coin.symbol, "invalid");
                return;
            }
        };

        self.metrics
            .websocket_message(&self.coin.symbol, message.kind());

        match message {
            InboundMessage::Transaction(event) => self.process_transaction(event).await,
            InboundMessage::Incomplete => {
                debug!(coin = %self.coin.symbol, "Transaction event without txid or address dropped");
            }
            InboundMessage::Ping(_) => {
                debug!(coin = %self.coin.symbol, "Ping answered by connection");
            }
            InboundMessage::Other(method) => {
                debug!(coin = %self.coin.symbol, method = ?method, "Ignoring message");
            }
        }
    }

    async fn process_transaction(&mut self, event: TransactionEvent) {
        if !self.watched.contains(&event.address) {
            debug!(
                tenant_id = %self.tenant_id,
                coin = %self.coin.symbol,
                address = %event.address,
                "Transaction for unmonitored address"
            );
            return;
        }

        let record = TransactionRecord::observed(
            self.tenant_id,
            &self.coin.symbol,
            &event.txid,
            &event.address,
            event.amount_satoshis,
            event.confirmations,
            event.timestamp,
        );

        let stored = match self.store.upsert_transaction(&record).await {
            Ok(stored) => stored,
            Err(e) => {
                self.errors += 1;
                self.metrics
                    .transaction_processed(&self.coin.symbol, "error");
                error!(
                    tenant_id = %self.tenant_id,
                    coin = %self.coin.symbol,
                    txid = %event.txid,
                    error = %e,
                    "Failed to save transaction"
                );
                return;
            }
        };

        self.transactions_processed += 1;
        self.metrics
            .transaction_processed(&self.coin.symbol, stored.status.as_str());
        info!(
            tenant_id = %self.tenant_id,
            coin = %self.coin.symbol,
            txid = %short(&stored.txid),
            address = %short(&stored.address),
            amount = stored.amount_satoshis,
            confirmations = stored.confirmations,
            status = %stored.status,
            "Transaction processed"
        );

        if let Some(callback) = &self.callback {
            let notification = TransactionNotification::from(&stored);
            match AssertUnwindSafe(callback.on_transaction(&notification))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(txid = %short(&notification.txid), error = %e, "Transaction callback failed");
                }
                Err(_) => {
                    error!(txid = %short(&notification.txid), "Transaction callback panicked");
                }
            }
        }
    }

    /// Records the node's current UTXO set for every watched address.
    /// Callbacks are not invoked. Returns the number of records written.
    pub async fn backfill(&mut self) -> Result<usize, MonitorError> {
        let node = self.node.clone().ok_or(MonitorError::NoNodeClient)?;
        let mut written = 0;

        for address in self.watched_addresses() {
            let utxos = match node.get_utxos(&address).await {
                Ok(utxos) => utxos,
                Err(e) => {
                    warn!(
                        coin = %self.coin.symbol,
                        address = %short(&address),
                        error = %e,
                        "Backfill failed for address"
                    );
                    continue;
                }
            };

            for utxo in utxos {
                let record = TransactionRecord::observed(
                    self.tenant_id,
                    &self.coin.symbol,
                    &utxo.txid,
                    &address,
                    utxo.amount_satoshis,
                    utxo.confirmations,
                    Utc::now(),
                );
                match self.store.upsert_transaction(&record).await {
                    Ok(_) => written += 1,
                    Err(e) => {
                        self.errors += 1;
                        warn!(txid = %short(&utxo.txid), error = %e, "Backfill save failed");
                    }
                }
            }
        }

        info!(
            tenant_id = %self.tenant_id,
            coin = %self.coin.symbol,
            records = written,
            "Backfill complete"
        );
        Ok(written)
    }

    /// Drops this monitor's subscriptions; closes the socket only if it owns it.
    fn detach_connection(&mut self) {
        let Some(conn) = self.connection.take() else {
            return;
        };

        let addresses: Vec<String> = self.subscribed.iter().cloned().collect();
        for address in &addresses {
            self.unsubscribe_address(&conn, address);
        }
        self.subscribed.clear();

        if self.owns_connection {
            conn.close();
        }
        self.metrics.websocket_disconnected(&self.coin.symbol);
    }

    /// Idempotent.
    pub async fn close(&mut self) {
        if self.state != MonitorState::Closed {
            self.running = false;
            self.detach_connection();
            self.state = MonitorState::Closed;
            info!(
                tenant_id = %self.tenant_id,
                coin = %self.coin.symbol,
                "Monitor closed"
            );
        }

        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    pub fn get_stats(&self) -> MonitorStats {
        MonitorStats {
            tenant_id: self.tenant_id,
            coin: self.coin.symbol.clone(),
            state: self.state,
            connected: self.is_connected(),
            is_running: self.running,
            monitored_addresses: self.watched.len(),
            messages_received: self.messages_received,
            transactions_processed: self.transactions_processed,
            errors: self.errors,
            reconnect_attempts: self.reconnect_attempts,
            uptime_seconds: self
                .started_at
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            last_activity: self.last_activity,
        }
    }
}

fn reconnect_reason(error: &MonitorError) -> &'static str {
    match error {
        MonitorError::Disconnected(_) => "closed",
        MonitorError::Connection(_) | MonitorError::Pool(_) => "connect_failed",
        _ => "error",
    }
}
