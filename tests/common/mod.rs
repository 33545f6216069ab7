//! Shared fixture for the end-to-end scenario tests: a fully wired core
//! (store, bus, limiter, runtime, connection manager, dispatcher, service)
//! over a scripted mock transport.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use chatpace::chat::{
    AccountIdentity, ChatClient, ChatTransport, ConnectionEvent, OutgoingPayload, SendError,
};
use chatpace::config::{ConnectionConfig, PacingConfig, RecurrenceConfig};
use chatpace::connection::ConnectionManager;
use chatpace::delivery::DeliveryListener;
use chatpace::dispatch::Dispatcher;
use chatpace::events::EventBus;
use chatpace::jobs::JobRuntime;
use chatpace::ratelimit::RateLimiter;
use chatpace::service::SchedulingService;
use chatpace::store::Store;
use chatpace::vault::CredentialVault;

/// What the next send should do.
#[derive(Debug, Clone)]
pub enum SendScript {
    Ok,
    Transient(&'static str),
    Fatal(&'static str),
}

#[derive(Default)]
struct MockState {
    /// Scripted outcomes, consumed per send; empty means success.
    send_script: VecDeque<SendScript>,
    /// Every (address, payload) that reached the provider.
    sends: Vec<(String, OutgoingPayload)>,
    /// Event senders per connect call, newest last.
    event_taps: Vec<mpsc::Sender<ConnectionEvent>>,
    connect_count: u32,
}

/// A transport whose behavior each test scripts up front.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_sends(&self, script: impl IntoIterator<Item = SendScript>) {
        self.state.lock().send_script.extend(script);
    }

    pub fn sends(&self) -> Vec<(String, OutgoingPayload)> {
        self.state.lock().sends.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().connect_count
    }

    /// Inject a provider event into the live socket's stream.
    pub async fn inject(&self, event: ConnectionEvent) {
        let tap = self
            .state
            .lock()
            .event_taps
            .last()
            .cloned()
            .expect("no live socket to inject into");
        tap.send(event).await.expect("socket stream closed");
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn connect(
        &self,
        _credentials: Option<Vec<u8>>,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> anyhow::Result<Arc<dyn ChatClient>> {
        {
            let mut state = self.state.lock();
            state.connect_count += 1;
            state.event_taps.push(events.clone());
        }
        events
            .send(ConnectionEvent::Connected {
                account: Some(AccountIdentity {
                    phone_number: "919999999999".into(),
                    name: Some("Test Account".into()),
                }),
            })
            .await
            .ok();
        Ok(Arc::new(MockClient {
            state: self.state.clone(),
        }))
    }
}

struct MockClient {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl ChatClient for MockClient {
    async fn send(&self, address: &str, payload: &OutgoingPayload) -> Result<String, SendError> {
        let script = self.state.lock().send_script.pop_front();
        match script {
            Some(SendScript::Transient(reason)) => Err(SendError::Transient(reason.into())),
            Some(SendScript::Fatal(reason)) => Err(SendError::Fatal(reason.into())),
            Some(SendScript::Ok) | None => {
                let id = Uuid::new_v4().simple().to_string().to_uppercase();
                self.state
                    .lock()
                    .sends
                    .push((address.to_string(), payload.clone()));
                Ok(id)
            }
        }
    }

    async fn stop(&self) {}
}

/// Everything a scenario needs, wired the way `serve` wires it.
pub struct Harness {
    pub store: Store,
    pub bus: EventBus,
    pub service: SchedulingService,
    pub manager: Arc<ConnectionManager>,
    pub transport: MockTransport,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Harness {
    pub async fn start(daily_cap: u32) -> Self {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new();
        let limiter = RateLimiter::new(store.clone(), bus.clone(), daily_cap, 80);
        let runtime = JobRuntime::new(store.clone());
        let transport = MockTransport::new();

        let manager = ConnectionManager::new(
            Arc::new(transport.clone()),
            store.clone(),
            CredentialVault::new(b"harness-key".to_vec()),
            bus.clone(),
            ConnectionConfig::default(),
        );
        DeliveryListener::new(store.clone(), bus.clone()).install(&manager);

        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(store.clone()),
            limiter.clone(),
            manager.clone(),
            runtime.clone(),
            bus.clone(),
            PacingConfig {
                min_delay_ms: 0,
                max_delay_ms: 1,
            },
            30,
        );
        let service = SchedulingService::new(
            store.clone(),
            Arc::new(store.clone()),
            limiter,
            runtime.clone(),
            RecurrenceConfig::default(),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn({
                let runtime = runtime.clone();
                let shutdown_rx = shutdown_rx.clone();
                async move { runtime.run(dispatcher, shutdown_rx).await }
            }),
            tokio::spawn(manager.clone().run(shutdown_rx)),
        ];

        let harness = Self {
            store,
            bus,
            service,
            manager,
            transport,
            shutdown,
            tasks,
        };
        harness.wait_connected().await;
        harness
    }

    pub async fn wait_connected(&self) {
        wait_for(|| self.manager.get_socket().is_some(), 5_000).await;
    }

    /// Force every queued job due right now, skipping pending retry delays.
    pub fn fast_forward_jobs(&self) {
        self.store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE jobs SET run_at = ?1 WHERE status = 'queued'",
                    [(Utc::now() - chrono::Duration::seconds(1)).to_rfc3339()],
                )?;
                Ok(())
            })
            .unwrap();
    }

    pub async fn stop(self) {
        self.shutdown.send(true).ok();
        for task in self.tasks {
            task.await.ok();
        }
    }
}

/// Poll until `predicate` holds, panicking after `timeout_ms`.
pub async fn wait_for(predicate: impl Fn() -> bool, timeout_ms: u64) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while !predicate() {
        assert!(
            std::time::Instant::now() < deadline,
            "condition not reached within {timeout_ms}ms"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
