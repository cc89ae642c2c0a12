// Shared fakes and helpers for the softphone-core integration tests
//
// The fakes stand in for the protocol engine, the status service and the
// persistence backend, recording what the core asked of them.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use softphone_core::{
    AgentStatus, AgentStatusProbe, ConnectionConfig, CoreConfig, CoreEvent, MemoryStateStore,
    Notification, ProbeError, Registrar, SessionSignaling, SignalingTransport, SoftphoneClient,
    SoftphoneComponents, SoftphoneError, SoftphoneResult,
};
use tokio::sync::broadcast;

pub const SERVER_URI: &str = "wss://pbx.example.com/ws";
pub const USERNAME: &str = "1001";

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig::new(SERVER_URI, USERNAME)
        .with_credential("secret")
        .with_display_name("Front Desk")
}

/// Short bounds so tests finish quickly
pub fn fast_config() -> CoreConfig {
    CoreConfig::new()
        .with_connect_timeout(Duration::from_millis(200))
        .with_register_timeout(Duration::from_millis(200))
        .with_probe_timeout(Duration::from_millis(100))
        .with_graceful_termination_timeout(Duration::from_millis(100))
        .with_settle_delay(Duration::from_millis(10))
}

#[derive(Default)]
pub struct FakeTransport {
    pub opens: AtomicUsize,
    pub closes: Mutex<Vec<(u16, String)>>,
    pub opened_with: Mutex<Vec<ConnectionConfig>>,
    pub fail_with: Mutex<Option<SoftphoneError>>,
    pub open_delay: Option<Duration>,
}

impl FakeTransport {
    pub fn failing(error: SoftphoneError) -> Self {
        Self {
            fail_with: Mutex::new(Some(error)),
            ..Default::default()
        }
    }

    /// Handshake that takes `delay` before the server answers
    pub fn slow(delay: Duration) -> Self {
        Self {
            open_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn open(&self, config: &ConnectionConfig) -> SoftphoneResult<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.opened_with.lock().push(config.clone());
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        match self.fail_with.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn close(&self, code: u16, reason: &str) -> SoftphoneResult<()> {
        self.closes.lock().push((code, reason.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRegistrar {
    pub registers: AtomicUsize,
    pub unregisters: AtomicUsize,
    pub fail_with: Mutex<Option<SoftphoneError>>,
    pub response_delay: Option<Duration>,
}

impl FakeRegistrar {
    pub fn failing(error: SoftphoneError) -> Self {
        Self {
            fail_with: Mutex::new(Some(error)),
            ..Default::default()
        }
    }

    /// Registrar that answers REGISTER only after `delay`
    pub fn slow(delay: Duration) -> Self {
        Self {
            response_delay: Some(delay),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Registrar for FakeRegistrar {
    async fn register(&self, _config: &ConnectionConfig) -> SoftphoneResult<()> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.response_delay {
            tokio::time::sleep(delay).await;
        }
        match self.fail_with.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn unregister(&self) -> SoftphoneResult<()> {
        self.unregisters.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Signaling engine; `hang_hangup` makes every hangup stall far past any bound
#[derive(Default)]
pub struct FakeSignaling {
    pub hang_hangup: AtomicBool,
    pub release_delay: Option<Duration>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeSignaling {
    pub fn hanging() -> Self {
        Self {
            hang_hangup: AtomicBool::new(true),
            ..Default::default()
        }
    }

    /// Media teardown that takes `delay`
    pub fn slow_release(delay: Duration) -> Self {
        Self {
            release_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SessionSignaling for FakeSignaling {
    async fn hangup(&self, session_id: &str) -> SoftphoneResult<()> {
        self.calls.lock().push(format!("hangup:{}", session_id));
        if self.hang_hangup.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(())
    }

    async fn cancel(&self, session_id: &str) -> SoftphoneResult<()> {
        self.calls.lock().push(format!("cancel:{}", session_id));
        Ok(())
    }

    async fn release(&self, session_id: &str) -> SoftphoneResult<()> {
        self.calls.lock().push(format!("release:{}", session_id));
        if let Some(delay) = self.release_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// Probe that answers with a fixed result and records the device ids asked about
pub struct RecordingProbe {
    answer: Result<AgentStatus, ProbeError>,
    delay: Option<Duration>,
    pub queried: Mutex<Vec<String>>,
}

impl RecordingProbe {
    pub fn answering(answer: Result<AgentStatus, ProbeError>) -> Self {
        Self {
            answer,
            delay: None,
            queried: Mutex::new(Vec::new()),
        }
    }

    pub fn logged_in(agent_number: &str) -> Self {
        Self::answering(Ok(AgentStatus::LoggedIn {
            agent_number: agent_number.to_string(),
        }))
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            answer: Ok(AgentStatus::NotLoggedIn),
            delay: Some(delay),
            queried: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentStatusProbe for RecordingProbe {
    async fn query(&self, device_id: &str) -> Result<AgentStatus, ProbeError> {
        self.queried.lock().push(device_id.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answer.clone()
    }
}

pub struct TestHarness {
    pub client: SoftphoneClient,
    pub transport: Arc<FakeTransport>,
    pub registrar: Arc<FakeRegistrar>,
    pub signaling: Arc<FakeSignaling>,
    pub store: Arc<MemoryStateStore>,
    pub probe: Arc<dyn AgentStatusProbe>,
}

pub struct HarnessBuilder {
    config: CoreConfig,
    transport: FakeTransport,
    registrar: FakeRegistrar,
    signaling: FakeSignaling,
    store: MemoryStateStore,
    probe: Arc<dyn AgentStatusProbe>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: fast_config(),
            transport: FakeTransport::default(),
            registrar: FakeRegistrar::default(),
            signaling: FakeSignaling::default(),
            store: MemoryStateStore::new(),
            probe: Arc::new(RecordingProbe::answering(Ok(AgentStatus::NotLoggedIn))),
        }
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: FakeTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn registrar(mut self, registrar: FakeRegistrar) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn signaling(mut self, signaling: FakeSignaling) -> Self {
        self.signaling = signaling;
        self
    }

    pub fn store(mut self, store: MemoryStateStore) -> Self {
        self.store = store;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn AgentStatusProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn build(self) -> TestHarness {
        let transport = Arc::new(self.transport);
        let registrar = Arc::new(self.registrar);
        let signaling = Arc::new(self.signaling);
        let store = Arc::new(self.store);

        let client = SoftphoneClient::new(
            self.config,
            SoftphoneComponents {
                transport: transport.clone(),
                registrar: registrar.clone(),
                signaling: signaling.clone(),
                store: store.clone(),
                probe: self.probe.clone(),
            },
        )
        .expect("valid test config");

        TestHarness {
            client,
            transport,
            registrar,
            signaling,
            store,
            probe: self.probe,
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drain every event currently buffered in `rx`
pub fn drain(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn notifications(events: &[CoreEvent]) -> Vec<Notification> {
    events
        .iter()
        .filter_map(|e| e.as_notification().cloned())
        .collect()
}

/// Enable log output for a test run; repeated calls are harmless
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("softphone_core=debug")),
        )
        .with_test_writer()
        .try_init();
}
