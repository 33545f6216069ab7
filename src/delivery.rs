//! Delivery tracking.
//!
//! Best-effort promotion of intents from `sent` to `delivered` off the
//! provider's acknowledgement stream. Installed through the connection
//! manager so it survives reconnects; every error is swallowed after a log
//! line, a lost ack only costs us a status upgrade.

use chrono::Utc;
use std::sync::Arc;

use crate::chat::AckStatus;
use crate::connection::{AckHandler, ConnectionManager};
use crate::events::{BusEvent, EventBus};
use crate::store::Store;

pub struct DeliveryListener {
    store: Store,
    bus: EventBus,
}

impl DeliveryListener {
    pub fn new(store: Store, bus: EventBus) -> Arc<Self> {
        Arc::new(Self { store, bus })
    }

    /// Wire this listener into the connection manager: the ack stream feeds
    /// it directly, and an on-connected hook confirms re-attachment after
    /// every reconnect.
    pub fn install(self: &Arc<Self>, manager: &ConnectionManager) {
        manager.add_ack_handler(self.clone());
        manager.on_connected(|_socket| {
            tracing::debug!("Delivery listener attached to socket");
        });
    }
}

#[async_trait::async_trait]
impl AckHandler for DeliveryListener {
    async fn on_delivery_ack(&self, provider_message_id: &str, status: AckStatus) {
        if status != AckStatus::Delivered {
            return;
        }

        let intent = match self.store.find_by_provider_message_id(provider_message_id) {
            Ok(Some(intent)) => intent,
            Ok(None) => {
                tracing::debug!("Delivery ack for unknown message {provider_message_id}");
                return;
            }
            Err(e) => {
                tracing::warn!("Delivery ack lookup failed: {e:#}");
                return;
            }
        };

        let delivered_at = Utc::now();
        match self.store.mark_intent_delivered(&intent.id, delivered_at) {
            Ok(true) => {
                self.bus.emit(&BusEvent::IntentDelivered {
                    intent_id: intent.id,
                    delivered_at,
                });
            }
            // Second ack for the same message, or a status raced past us.
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Failed to mark intent {} delivered: {e:#}", intent.id);
            }
        }
    }
}
