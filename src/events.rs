//! Real-time event fan-out.
//!
//! A single-process pub/sub bus. Producers (rate limiter, connection
//! manager, delivery listener, dispatcher) emit typed events; subscribers
//! receive pre-serialized JSON envelopes `{type, data, timestamp}` over an
//! unbounded channel. Broadcast never blocks a producer; a subscriber whose
//! channel is gone is dropped from the active set.
//!
//! The bus is constructed first at boot and handed to each producer as a
//! plain cloneable capability.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

// ── Event payloads ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A fresh pairing code is available for device linking.
    PairingCode { code: String, data_url: String },
    /// Connection state change with a health snapshot.
    ConnectionStatus(ConnectionHealth),
    /// An intent reached `sent`.
    IntentSent {
        intent_id: String,
        provider_message_id: String,
        sent_at: DateTime<Utc>,
    },
    /// An intent reached `failed`.
    IntentFailed { intent_id: String, reason: String },
    /// An intent reached `delivered`.
    IntentDelivered {
        intent_id: String,
        delivered_at: DateTime<Utc>,
    },
    RateLimitWarning {
        sent_today: u32,
        cap: u32,
        remaining: u32,
    },
    RateLimitReached {
        sent_today: u32,
        cap: u32,
        reset_at: DateTime<Utc>,
    },
}

/// Snapshot of the socket's health, pushed on every state change.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionHealth {
    pub status: String,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_disconnect: Option<DisconnectInfo>,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountInfo>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DisconnectInfo {
    pub reason: String,
    pub code: u16,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountInfo {
    pub phone_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl BusEvent {
    /// Wire name used in the `{type, data}` envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PairingCode { .. } => "qr",
            Self::ConnectionStatus(_) => "status",
            Self::IntentSent { .. } => "message:sent",
            Self::IntentFailed { .. } => "message:failed",
            Self::IntentDelivered { .. } => "message:status",
            Self::RateLimitWarning { .. } => "rate-limit:warning",
            Self::RateLimitReached { .. } => "rate-limit:reached",
        }
    }

    fn data(&self) -> Value {
        match self {
            Self::PairingCode { code, data_url } => json!({
                "code": code,
                "dataUrl": data_url,
            }),
            Self::ConnectionStatus(health) => {
                serde_json::to_value(health).unwrap_or_default()
            }
            Self::IntentSent {
                intent_id,
                provider_message_id,
                sent_at,
            } => json!({
                "messageId": intent_id,
                "providerMessageId": provider_message_id,
                "sentAt": sent_at.to_rfc3339(),
            }),
            Self::IntentFailed { intent_id, reason } => json!({
                "messageId": intent_id,
                "reason": reason,
            }),
            Self::IntentDelivered {
                intent_id,
                delivered_at,
            } => json!({
                "messageId": intent_id,
                "status": "delivered",
                "deliveredAt": delivered_at.to_rfc3339(),
            }),
            Self::RateLimitWarning {
                sent_today,
                cap,
                remaining,
            } => json!({
                "sentToday": sent_today,
                "cap": cap,
                "remaining": remaining,
            }),
            Self::RateLimitReached {
                sent_today,
                cap,
                reset_at,
            } => json!({
                "sentToday": sent_today,
                "cap": cap,
                "resetAt": reset_at.to_rfc3339(),
            }),
        }
    }

    /// Full envelope as sent to subscribers.
    pub fn envelope(&self) -> String {
        json!({
            "type": self.kind(),
            "data": self.data(),
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string()
    }
}

// ── Bus ───────────────────────────────────────────────────────────

type SubscriberMap = HashMap<u64, UnboundedSender<String>>;

struct Inner {
    subscribers: Mutex<SubscriberMap>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> (u64, UnboundedReceiver<String>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded_channel();
        self.inner.subscribers.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.subscribers.lock().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Best-effort broadcast. Subscribers that fail to receive are dropped.
    pub fn emit(&self, event: &BusEvent) {
        let payload = event.envelope();

        let mut stale: Vec<u64> = Vec::new();
        {
            let guard = self.inner.subscribers.lock();
            for (id, tx) in guard.iter() {
                if tx.send(payload.clone()).is_err() {
                    stale.push(*id);
                }
            }
        }
        if !stale.is_empty() {
            let mut guard = self.inner.subscribers.lock();
            for id in stale {
                guard.remove(&id);
            }
        }
    }
}
