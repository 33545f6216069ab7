//! Chat transport abstraction.
//!
//! The wire protocol itself lives outside the core. A transport hands the
//! connection manager a [`ChatClient`] plus a stream of
//! [`ConnectionEvent`]s; everything the core knows about the upstream
//! provider goes through these two seams.

pub mod loopback;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::store::{MediaKind, MediaRef};

// ── Addresses ─────────────────────────────────────────────────────

/// Provider address for a direct contact: `<digits>@s.whatsapp.net`.
pub fn contact_address(digits: &str) -> String {
    format!("{digits}@s.whatsapp.net")
}

/// Provider address for a group. Ids that already carry a JID domain are
/// used verbatim.
pub fn group_address(group_id: &str) -> String {
    if group_id.contains('@') {
        group_id.to_string()
    } else {
        format!("{group_id}@g.us")
    }
}

// ── Payloads ──────────────────────────────────────────────────────

/// What actually goes over the socket, shaped by media kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingPayload {
    Text {
        text: String,
    },
    Image {
        url: String,
        caption: String,
    },
    Video {
        url: String,
        caption: String,
    },
    Audio {
        url: String,
    },
    Document {
        url: String,
        caption: String,
        file_name: String,
    },
}

impl OutgoingPayload {
    /// Build the payload for an intent's content and optional media.
    pub fn build(content: &str, media: Option<&MediaRef>) -> Self {
        match media {
            None => Self::Text {
                text: content.to_string(),
            },
            Some(m) => match m.kind {
                MediaKind::Image => Self::Image {
                    url: m.url.clone(),
                    caption: content.to_string(),
                },
                MediaKind::Video => Self::Video {
                    url: m.url.clone(),
                    caption: content.to_string(),
                },
                MediaKind::Audio => Self::Audio { url: m.url.clone() },
                MediaKind::Document => Self::Document {
                    url: m.url.clone(),
                    caption: content.to_string(),
                    file_name: file_name_from_url(&m.url),
                },
            },
        }
    }
}

/// Derive a document file name from the last URL path segment.
fn file_name_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .filter(|seg| !seg.is_empty() && !seg.contains(':'))
        .unwrap_or("file")
        .to_string()
}

// ── Connection events ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub phone_number: String,
    pub name: Option<String>,
}

/// Provider-side message acknowledgement levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Server,
    Delivered,
    Read,
    Played,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Socket is up. Carries the account identity when known.
    Connected { account: Option<AccountIdentity> },
    /// Socket dropped with a provider status code.
    Disconnected { code: u16, reason: String },
    /// A fresh pairing code for device linking.
    PairingCode { code: String },
    /// A delivery acknowledgement for a previously sent message.
    DeliveryAck {
        provider_message_id: String,
        status: AckStatus,
    },
    /// The provider rotated session material; persist it.
    CredentialsUpdate { key: String, blob: Vec<u8> },
}

// ── Errors ────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("socket not connected")]
    NotConnected,

    /// Network-level failure; the job runtime retries these.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Upstream rejected the message; no retry will help.
    #[error("fatal send failure: {0}")]
    Fatal(String),
}

// ── Traits ────────────────────────────────────────────────────────

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Hand a payload to the provider. Returns the provider message id.
    async fn send(&self, address: &str, payload: &OutgoingPayload) -> Result<String, SendError>;

    /// Close the socket. Idempotent.
    async fn stop(&self);
}

/// Builds a live socket from a credential blob. Implemented by wire
/// adapters; the built-in [`loopback`] transport covers development and
/// tests.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn connect(
        &self,
        credentials: Option<Vec<u8>>,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> anyhow::Result<Arc<dyn ChatClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_and_group_addresses() {
        assert_eq!(contact_address("919876543210"), "919876543210@s.whatsapp.net");
        assert_eq!(group_address("120363041234"), "120363041234@g.us");
        assert_eq!(group_address("120363041234@g.us"), "120363041234@g.us");
    }

    #[test]
    fn text_payload_without_media() {
        let payload = OutgoingPayload::build("hello", None);
        assert_eq!(
            payload,
            OutgoingPayload::Text {
                text: "hello".into()
            }
        );
    }

    #[test]
    fn image_and_video_carry_captions() {
        let media = MediaRef {
            url: "https://cdn.example/a.png".into(),
            kind: MediaKind::Image,
        };
        assert_eq!(
            OutgoingPayload::build("look", Some(&media)),
            OutgoingPayload::Image {
                url: "https://cdn.example/a.png".into(),
                caption: "look".into()
            }
        );

        let video = MediaRef {
            url: "https://cdn.example/v.mp4".into(),
            kind: MediaKind::Video,
        };
        assert!(matches!(
            OutgoingPayload::build("clip", Some(&video)),
            OutgoingPayload::Video { .. }
        ));
    }

    #[test]
    fn audio_drops_caption() {
        let media = MediaRef {
            url: "https://cdn.example/note.ogg".into(),
            kind: MediaKind::Audio,
        };
        assert_eq!(
            OutgoingPayload::build("ignored", Some(&media)),
            OutgoingPayload::Audio {
                url: "https://cdn.example/note.ogg".into()
            }
        );
    }

    #[test]
    fn document_derives_file_name() {
        let media = MediaRef {
            url: "https://cdn.example/files/invoice-42.pdf?sig=abc".into(),
            kind: MediaKind::Document,
        };
        let payload = OutgoingPayload::build("invoice attached", Some(&media));
        assert_eq!(
            payload,
            OutgoingPayload::Document {
                url: media.url.clone(),
                caption: "invoice attached".into(),
                file_name: "invoice-42.pdf".into()
            }
        );
    }

    #[test]
    fn file_name_falls_back_on_bare_urls() {
        assert_eq!(file_name_from_url("https://cdn.example/"), "file");
        assert_eq!(file_name_from_url("not a url"), "not a url");
        assert_eq!(file_name_from_url(""), "file");
    }
}
