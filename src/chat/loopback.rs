//! Loopback transport.
//!
//! A development socket that never leaves the process: pairing succeeds
//! after one emitted code, sends are logged and acknowledged back on the
//! event stream a moment later. Useful for demos and for exercising the
//! full dispatch path without a linked device.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    AccountIdentity, AckStatus, ChatClient, ChatTransport, ConnectionEvent, OutgoingPayload,
    SendError,
};

/// Credential blob the loopback "provider" hands out after pairing.
const LOOPBACK_CREDS: &[u8] = b"loopback-session-v1";

pub struct LoopbackTransport;

impl LoopbackTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChatTransport for LoopbackTransport {
    async fn connect(
        &self,
        credentials: Option<Vec<u8>>,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> anyhow::Result<Arc<dyn ChatClient>> {
        // An unpaired socket goes through the pairing handshake first and
        // hands back session material, exactly like a real link flow.
        if credentials.is_none() {
            let code = format!("LOOP-{}", &Uuid::new_v4().to_string()[..8].to_uppercase());
            let _ = events.send(ConnectionEvent::PairingCode { code }).await;
            let _ = events
                .send(ConnectionEvent::CredentialsUpdate {
                    key: crate::store::CREDS_KEY.to_string(),
                    blob: LOOPBACK_CREDS.to_vec(),
                })
                .await;
        }

        let _ = events
            .send(ConnectionEvent::Connected {
                account: Some(AccountIdentity {
                    phone_number: "loopback".into(),
                    name: Some("Loopback".into()),
                }),
            })
            .await;

        Ok(Arc::new(LoopbackClient {
            events: Mutex::new(events),
            stopped: AtomicBool::new(false),
        }))
    }
}

struct LoopbackClient {
    events: Mutex<mpsc::Sender<ConnectionEvent>>,
    stopped: AtomicBool,
}

#[async_trait]
impl ChatClient for LoopbackClient {
    async fn send(&self, address: &str, payload: &OutgoingPayload) -> Result<String, SendError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SendError::NotConnected);
        }

        let provider_id = Uuid::new_v4().simple().to_string().to_uppercase();
        tracing::info!("loopback send to {address}: {payload:?} (id {provider_id})");

        // Ack our own send shortly after, like a well-behaved provider.
        let events = self.events.lock().clone();
        let acked_id = provider_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let _ = events
                .send(ConnectionEvent::DeliveryAck {
                    provider_message_id: acked_id,
                    status: AckStatus::Delivered,
                })
                .await;
        });

        Ok(provider_id)
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unpaired_connect_emits_pairing_then_connected() {
        let (tx, mut rx) = mpsc::channel(16);
        let client = LoopbackTransport::new().connect(None, tx).await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            ConnectionEvent::PairingCode { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ConnectionEvent::CredentialsUpdate { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ConnectionEvent::Connected { .. }
        ));

        client.stop().await;
    }

    #[tokio::test]
    async fn paired_connect_skips_pairing() {
        let (tx, mut rx) = mpsc::channel(16);
        let _client = LoopbackTransport::new()
            .connect(Some(LOOPBACK_CREDS.to_vec()), tx)
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            ConnectionEvent::Connected { .. }
        ));
    }

    #[tokio::test]
    async fn send_returns_id_and_acks_back() {
        let (tx, mut rx) = mpsc::channel(16);
        let client = LoopbackTransport::new()
            .connect(Some(LOOPBACK_CREDS.to_vec()), tx)
            .await
            .unwrap();
        let _ = rx.recv().await; // connected

        let id = client
            .send(
                "919876543210@s.whatsapp.net",
                &OutgoingPayload::Text { text: "hi".into() },
            )
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ConnectionEvent::DeliveryAck {
                provider_message_id,
                status,
            } => {
                assert_eq!(provider_message_id, id);
                assert_eq!(status, AckStatus::Delivered);
            }
            other => panic!("expected delivery ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stopped_client_refuses_sends() {
        let (tx, _rx) = mpsc::channel(16);
        let client = LoopbackTransport::new()
            .connect(Some(LOOPBACK_CREDS.to_vec()), tx)
            .await
            .unwrap();
        client.stop().await;

        let err = client
            .send("x@s.whatsapp.net", &OutgoingPayload::Text { text: "hi".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }
}
