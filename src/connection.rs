//! Chat-socket lifecycle manager.
//!
//! Owns the socket exclusively: creation, teardown, pairing, and the
//! reconnect policy all happen on this manager's control loop. Everyone
//! else reaches the socket through `get_socket()`, which returns `None`
//! unless the connection is actually up.
//!
//! Disconnect policy by provider code:
//! - 401 logged-out   → wipe credentials, re-pair immediately
//! - 403 forbidden    → wipe credentials, re-pair immediately
//! - 440 replaced     → terminal; another client owns the session
//! - 515 restart      → reconnect with zero delay
//! - anything else    → exponential backoff with ±20% jitter

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::chat::{AccountIdentity, AckStatus, ChatClient, ChatTransport, ConnectionEvent};
use crate::config::ConnectionConfig;
use crate::events::{AccountInfo, BusEvent, ConnectionHealth, DisconnectInfo, EventBus};
use crate::store::{Store, CREDS_KEY};
use crate::vault::{CredentialVault, VaultError};

// ── Disconnect policy ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Session is gone for good; wipe credentials and pair again.
    PermanentLoggedOut,
    /// Another client took over; stop reconnecting.
    ReplacedByAnotherClient,
    /// Provider asked for an immediate restart.
    RestartRequired,
    /// Credentials rejected; wipe and pair again.
    Forbidden,
    /// Everything else: back off and retry.
    TransientDefault,
}

impl ReconnectPolicy {
    pub fn for_code(code: u16) -> Self {
        match code {
            401 => Self::PermanentLoggedOut,
            403 => Self::Forbidden,
            440 => Self::ReplacedByAnotherClient,
            515 => Self::RestartRequired,
            _ => Self::TransientDefault,
        }
    }
}

/// Delay before reconnect attempt `attempt`:
/// `min(base × 2^attempt, max) × U(0.8, 1.2)`.
pub(crate) fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> std::time::Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20)).min(max_ms);
    let jitter: f64 = rand::thread_rng().gen_range(0.8..1.2);
    std::time::Duration::from_millis((exp as f64 * jitter) as u64)
}

// ── State ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Pairing,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pairing => "pairing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

struct Inner {
    state: ConnState,
    socket: Option<Arc<dyn ChatClient>>,
    reconnect_attempts: u32,
    retry_started_at: Option<DateTime<Utc>>,
    connected_at: Option<DateTime<Utc>>,
    last_disconnect: Option<DisconnectInfo>,
    account: Option<AccountIdentity>,
}

type OnConnectedHook = Arc<dyn Fn(&Arc<dyn ChatClient>) + Send + Sync>;

/// Receives delivery acknowledgements forwarded off the socket stream.
#[async_trait::async_trait]
pub trait AckHandler: Send + Sync {
    async fn on_delivery_ack(&self, provider_message_id: &str, status: AckStatus);
}

pub struct ConnectionManager {
    transport: Arc<dyn ChatTransport>,
    store: Store,
    vault: CredentialVault,
    bus: EventBus,
    config: ConnectionConfig,
    inner: Mutex<Inner>,
    hooks: Mutex<Vec<OnConnectedHook>>,
    ack_handlers: Mutex<Vec<Arc<dyn AckHandler>>>,
    started_at: std::time::Instant,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Store,
        vault: CredentialVault,
        bus: EventBus,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            store,
            vault,
            bus,
            config,
            inner: Mutex::new(Inner {
                state: ConnState::Pairing,
                socket: None,
                reconnect_attempts: 0,
                retry_started_at: None,
                connected_at: None,
                last_disconnect: None,
                account: None,
            }),
            hooks: Mutex::new(Vec::new()),
            ack_handlers: Mutex::new(Vec::new()),
            started_at: std::time::Instant::now(),
        })
    }

    /// Register a hook invoked on every successful connect (reconnects
    /// included).
    pub fn on_connected(&self, hook: impl Fn(&Arc<dyn ChatClient>) + Send + Sync + 'static) {
        self.hooks.lock().push(Arc::new(hook));
    }

    pub fn add_ack_handler(&self, handler: Arc<dyn AckHandler>) {
        self.ack_handlers.lock().push(handler);
    }

    /// The live socket, or `None` unless connected.
    pub fn get_socket(&self) -> Option<Arc<dyn ChatClient>> {
        let inner = self.inner.lock();
        if inner.state == ConnState::Connected {
            inner.socket.clone()
        } else {
            None
        }
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    pub fn health(&self) -> ConnectionHealth {
        let inner = self.inner.lock();
        ConnectionHealth {
            status: inner.state.as_str().to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            connected_at: inner.connected_at,
            last_disconnect: inner.last_disconnect.clone(),
            reconnect_attempts: inner.reconnect_attempts,
            account: inner.account.as_ref().map(|a| AccountInfo {
                phone_number: a.phone_number.clone(),
                name: a.name.clone(),
            }),
        }
    }

    /// Stop the socket and timers. Credentials stay in the store.
    pub async fn destroy(&self) {
        let socket = {
            let mut inner = self.inner.lock();
            inner.state = ConnState::Disconnected;
            inner.socket.take()
        };
        if let Some(socket) = socket {
            socket.stop().await;
        }
    }

    // ── Credentials ───────────────────────────────────────────────

    /// Decrypt the stored session blob. Integrity failures are permanent:
    /// the vault rows are wiped and pairing starts over.
    fn load_credentials(&self) -> Result<Option<Vec<u8>>> {
        let Some(ciphertext) = self.store.get_credential(CREDS_KEY)? else {
            return Ok(None);
        };
        match self.vault.decrypt(&ciphertext) {
            Ok(blob) => Ok(Some(blob)),
            Err(VaultError::Integrity | VaultError::Malformed(_)) => {
                tracing::error!(
                    "Stored credentials failed integrity check; wiping and re-pairing"
                );
                self.store.clear_credentials()?;
                Ok(None)
            }
            Err(VaultError::Other(e)) => Err(e),
        }
    }

    fn persist_credential(&self, key: &str, blob: &[u8]) -> Result<()> {
        let ciphertext = self
            .vault
            .encrypt(blob)
            .map_err(|e| anyhow::anyhow!("credential encryption failed: {e}"))?;
        self.store.put_credential(key, &ciphertext)
    }

    // ── Control loop ──────────────────────────────────────────────

    /// Own the socket until shutdown. Spawn exactly once.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let credentials = match self.load_credentials() {
                Ok(creds) => creds,
                Err(e) => {
                    tracing::error!("Credential load failed: {e:#}");
                    None
                }
            };

            self.set_state(if credentials.is_some() {
                ConnState::Connecting
            } else {
                ConnState::Pairing
            });

            // Any previous socket is torn down before a new one exists.
            let old_socket = self.inner.lock().socket.take();
            if let Some(old) = old_socket {
                old.stop().await;
            }

            let (events_tx, events_rx) = mpsc::channel::<ConnectionEvent>(64);
            let session = match self.transport.connect(credentials, events_tx).await {
                Ok(client) => {
                    self.inner.lock().socket = Some(client);
                    self.consume_events(events_rx, &mut shutdown).await
                }
                Err(e) => {
                    tracing::warn!("Socket creation failed: {e:#}");
                    SessionEnd::Transient
                }
            };

            match session {
                SessionEnd::Shutdown => break,
                SessionEnd::Terminal => {
                    // Replaced by another client: park until shutdown.
                    self.set_state(ConnState::Disconnected);
                    let _ = shutdown.changed().await;
                    break;
                }
                SessionEnd::Repair => {
                    if let Err(e) = self.store.clear_credentials() {
                        tracing::error!("Failed to clear credentials: {e:#}");
                    }
                    self.reset_retry_counters();
                    // Immediate reconnect for a fresh pairing code.
                }
                SessionEnd::Immediate => {
                    // Zero-delay reconnect (restart-required).
                }
                SessionEnd::Transient => {
                    if !self.backoff_or_give_up(&mut shutdown).await {
                        // Retry window exhausted: wipe and re-pair.
                        if let Err(e) = self.store.clear_credentials() {
                            tracing::error!("Failed to clear credentials: {e:#}");
                        }
                        self.reset_retry_counters();
                    }
                }
            }
        }

        self.destroy().await;
        tracing::info!("Connection manager stopped");
    }

    /// Drain socket events until the session ends one way or another.
    async fn consume_events(
        &self,
        mut events: mpsc::Receiver<ConnectionEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return SessionEnd::Shutdown,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                // Stream closed without a disconnect event; treat as transient.
                tracing::warn!("Connection stream closed unexpectedly");
                return SessionEnd::Transient;
            };

            match event {
                ConnectionEvent::Connected { account } => self.handle_connected(account),
                ConnectionEvent::PairingCode { code } => self.handle_pairing_code(&code),
                ConnectionEvent::CredentialsUpdate { key, blob } => {
                    if let Err(e) = self.persist_credential(&key, &blob) {
                        tracing::error!("Failed to persist credential delta '{key}': {e:#}");
                    }
                }
                ConnectionEvent::DeliveryAck {
                    provider_message_id,
                    status,
                } => {
                    let handlers: Vec<_> = self.ack_handlers.lock().clone();
                    for handler in handlers {
                        handler.on_delivery_ack(&provider_message_id, status).await;
                    }
                }
                ConnectionEvent::Disconnected { code, reason } => {
                    return self.handle_disconnected(code, &reason);
                }
            }
        }
    }

    fn handle_connected(&self, account: Option<AccountIdentity>) {
        {
            let mut inner = self.inner.lock();
            inner.state = ConnState::Connected;
            inner.reconnect_attempts = 0;
            inner.retry_started_at = None;
            inner.connected_at = Some(Utc::now());
            if account.is_some() {
                inner.account = account;
            }
        }
        tracing::info!("Chat socket connected");
        self.emit_status();

        let socket = self.inner.lock().socket.clone();
        if let Some(socket) = socket {
            let hooks: Vec<_> = self.hooks.lock().clone();
            for hook in hooks {
                hook(&socket);
            }
        }
    }

    fn handle_pairing_code(&self, code: &str) {
        self.set_state(ConnState::Pairing);

        // Terminal sink for CLI pairing.
        tracing::info!("┌──────────────────────────────────────┐");
        tracing::info!("│  Pairing code: {code:<21} │");
        tracing::info!("│  Enter it under Linked Devices.      │");
        tracing::info!("└──────────────────────────────────────┘");

        // Data-URL sink for network clients.
        let data_url = format!("data:text/plain;base64,{}", B64.encode(code));
        self.bus.emit(&BusEvent::PairingCode {
            code: code.to_string(),
            data_url,
        });
    }

    fn handle_disconnected(&self, code: u16, reason: &str) -> SessionEnd {
        let policy = ReconnectPolicy::for_code(code);
        tracing::warn!("Chat socket disconnected (code {code}, {reason}); policy {policy:?}");
        {
            let mut inner = self.inner.lock();
            inner.last_disconnect = Some(DisconnectInfo {
                reason: reason.to_string(),
                code,
                at: Utc::now(),
            });
            inner.connected_at = None;
            inner.state = ConnState::Disconnected;
        }
        self.emit_status();

        match policy {
            ReconnectPolicy::PermanentLoggedOut | ReconnectPolicy::Forbidden => SessionEnd::Repair,
            ReconnectPolicy::ReplacedByAnotherClient => SessionEnd::Terminal,
            ReconnectPolicy::RestartRequired => SessionEnd::Immediate,
            ReconnectPolicy::TransientDefault => SessionEnd::Transient,
        }
    }

    /// Sleep out the backoff for this attempt. Returns false when the retry
    /// window is exhausted and the caller should fall back to pairing.
    async fn backoff_or_give_up(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let (attempt, window_exceeded) = {
            let mut inner = self.inner.lock();
            let attempt = inner.reconnect_attempts;
            inner.reconnect_attempts += 1;
            let started = *inner.retry_started_at.get_or_insert_with(Utc::now);
            let exceeded = (Utc::now() - started).num_seconds()
                > self.config.max_retry_window_secs as i64;
            (attempt, exceeded)
        };

        if window_exceeded {
            tracing::warn!(
                "No successful connect within {}s; giving up this attempt stream",
                self.config.max_retry_window_secs
            );
            return false;
        }

        let delay = backoff_delay(
            self.config.reconnect_base_ms,
            self.config.reconnect_max_ms,
            attempt,
        );
        tracing::info!(
            "Reconnect attempt {} in {}ms",
            attempt + 1,
            delay.as_millis()
        );
        tokio::select! {
            _ = shutdown.changed() => {}
            () = tokio::time::sleep(delay) => {}
        }
        true
    }

    fn reset_retry_counters(&self) {
        let mut inner = self.inner.lock();
        inner.reconnect_attempts = 0;
        inner.retry_started_at = None;
    }

    fn set_state(&self, state: ConnState) {
        self.inner.lock().state = state;
        self.emit_status();
    }

    fn emit_status(&self) {
        self.bus.emit(&BusEvent::ConnectionStatus(self.health()));
    }
}

enum SessionEnd {
    /// Process shutdown requested.
    Shutdown,
    /// 440: stop reconnecting entirely.
    Terminal,
    /// 401/403: wipe credentials, pair again immediately.
    Repair,
    /// 515: reconnect with zero delay.
    Immediate,
    /// Transient failure: exponential backoff applies.
    Transient,
}
