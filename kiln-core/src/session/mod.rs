//! Per-connection worker session management.
//!
//! A session is ephemeral state owned by the master that accepted the
//! connection: identity, the negotiated RPC channel, keepalive bookkeeping,
//! the last observed shutdown-signal value, and a monotonically advancing
//! lifecycle state. Nothing here is persisted; the claim binding a worker
//! to its master lives in the relational store.

pub mod signal;
pub mod transport;
pub mod worker;

use crate::bus::{Event, EventBus, EventKind};
use crate::claims::{ClaimStore, ResourceKind};
use crate::error::{KilnError, Result};
use crate::realm::Realm;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use signal::SignalSource;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use transport::{RpcChannel, RpcHandler};
use ulid::Ulid;

/// Session lifecycle. Transitions only move forward:
/// `Connecting → Authenticated → Active → ShutdownRequested → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Active,
    ShutdownRequested,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticated => "authenticated",
            SessionState::Active => "active",
            SessionState::ShutdownRequested => "shutdown_requested",
        }
    }
}

/// How a session target is addressed: a host/port pair, or a single
/// connection descriptor string. Never both, never a partial mix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    HostPort(String, u16),
    Descriptor(String),
}

impl ConnectTarget {
    pub fn connect_addr(&self) -> String {
        match self {
            ConnectTarget::HostPort(host, port) => format!("{}:{}", host, port),
            ConnectTarget::Descriptor(descriptor) => descriptor
                .strip_prefix("tcp:")
                .unwrap_or(descriptor)
                .to_string(),
        }
    }
}

/// Graceful-shutdown trigger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShutdownTrigger {
    #[default]
    Disabled,
    /// Shutdown is requested only through the API.
    Api,
    /// Shutdown is requested when the file's mtime strictly increases.
    SignalFile(PathBuf),
}

/// Validated connection configuration. Only the builder can produce one,
/// so no partially-initialized session ever exists.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub target: ConnectTarget,
    pub worker_name: String,
    pub secret: String,
    pub base_directory: PathBuf,
    /// Seconds between keepalive pings; 0 disables the loop.
    pub keepalive_interval: u64,
    /// Seconds to wait for a keepalive ack before reporting a timeout.
    pub keepalive_timeout: u64,
    pub umask: Option<u32>,
    pub protocol: String,
    pub shutdown: ShutdownTrigger,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    connection_string: Option<String>,
    worker_name: Option<String>,
    secret: Option<String>,
    base_directory: Option<PathBuf>,
    keepalive_interval: u64,
    keepalive_timeout: Option<u64>,
    umask: Option<u32>,
    protocol: Option<String>,
    shutdown: ShutdownTrigger,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn connection_string(mut self, descriptor: impl Into<String>) -> Self {
        self.connection_string = Some(descriptor.into());
        self
    }

    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = Some(name.into());
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn base_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_directory = Some(dir.into());
        self
    }

    pub fn keepalive_interval(mut self, seconds: u64) -> Self {
        self.keepalive_interval = seconds;
        self
    }

    pub fn keepalive_timeout(mut self, seconds: u64) -> Self {
        self.keepalive_timeout = Some(seconds);
        self
    }

    pub fn umask(mut self, umask: u32) -> Self {
        self.umask = Some(umask);
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn shutdown(mut self, trigger: ShutdownTrigger) -> Self {
        self.shutdown = trigger;
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        let target = match (self.host, self.port, self.connection_string) {
            (Some(host), Some(port), None) => ConnectTarget::HostPort(host, port),
            (None, None, Some(descriptor)) => {
                if descriptor.trim().is_empty() {
                    return Err(KilnError::Validation(
                        "connection string cannot be empty".to_string(),
                    ));
                }
                ConnectTarget::Descriptor(descriptor)
            }
            (None, None, None) => {
                return Err(KilnError::Validation(
                    "either host/port or a connection string is required".to_string(),
                ));
            }
            (_, _, Some(_)) => {
                return Err(KilnError::Validation(
                    "host/port and a connection string are mutually exclusive".to_string(),
                ));
            }
            _ => {
                return Err(KilnError::Validation(
                    "host and port must be supplied together".to_string(),
                ));
            }
        };

        let worker_name = self
            .worker_name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| KilnError::Validation("worker name is required".to_string()))?;
        let base_directory = self
            .base_directory
            .ok_or_else(|| KilnError::Validation("base directory is required".to_string()))?;

        let protocol = self.protocol.unwrap_or_else(|| "kiln".to_string());
        if protocol != "kiln" {
            return Err(KilnError::Validation(format!(
                "unsupported protocol '{}'",
                protocol
            )));
        }

        Ok(SessionConfig {
            target,
            worker_name,
            secret: self.secret.unwrap_or_default(),
            base_directory,
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout.unwrap_or(30),
            umask: self.umask,
            protocol,
            shutdown: self.shutdown,
        })
    }
}

/// Hooks through which a session surfaces conditions it detects but does
/// not decide on.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// A keepalive ping got no response within the timeout. Reconnect or
    /// drop is the caller's call.
    async fn on_keepalive_timeout(&self, _worker: &str) {}
}

pub struct NoopHooks;

#[async_trait]
impl SessionHooks for NoopHooks {}

/// Master-side state machine for one accepted worker connection.
pub struct WorkerSession {
    session_id: Ulid,
    master_id: String,
    claims: ClaimStore,
    bus: EventBus,
    state: Mutex<SessionState>,
    worker_name: Mutex<Option<String>>,
    resource_id: Mutex<Option<i64>>,
    channel: Mutex<Option<Arc<dyn RpcChannel>>>,
    last_keepalive: Mutex<Option<DateTime<Utc>>>,
    last_signal: Mutex<u64>,
}

impl WorkerSession {
    /// A new session in `Connecting`, entered on inbound transport accept.
    pub fn new(master_id: impl Into<String>, claims: ClaimStore, bus: EventBus) -> Self {
        let session_id = Ulid::new();
        tracing::debug!("session {} connecting", session_id);
        Self {
            session_id,
            master_id: master_id.into(),
            claims,
            bus,
            state: Mutex::new(SessionState::Connecting),
            worker_name: Mutex::new(None),
            resource_id: Mutex::new(None),
            channel: Mutex::new(None),
            last_keepalive: Mutex::new(None),
            last_signal: Mutex::new(0),
        }
    }

    pub fn session_id(&self) -> Ulid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn worker_name(&self) -> Option<String> {
        self.worker_name.lock().unwrap().clone()
    }

    pub fn last_keepalive(&self) -> Option<DateTime<Utc>> {
        *self.last_keepalive.lock().unwrap()
    }

    /// Validate the worker's credentials against the realm.
    ///
    /// Returns `Ok(false)` on bad credentials; the session stays in
    /// `Connecting` and the caller drops the connection.
    pub async fn authenticate(
        &self,
        realm: &dyn Realm,
        worker: &str,
        secret: &str,
    ) -> Result<bool> {
        if !realm.authenticate(worker, secret).await {
            tracing::info!("session {}: authentication failed for '{}'", self.session_id, worker);
            return Ok(false);
        }
        *self.worker_name.lock().unwrap() = Some(worker.to_string());
        self.set_state(SessionState::Authenticated);
        Ok(true)
    }

    /// Bind the authenticated worker to this master and go `Active`.
    ///
    /// Claims the worker's resource through the claim store; losing that
    /// race to another master surfaces as `AlreadyClaimed` and the session
    /// never activates.
    pub fn attach(&self, channel: Arc<dyn RpcChannel>) -> Result<()> {
        if self.state() != SessionState::Authenticated {
            return Err(KilnError::Validation(
                "session must authenticate before attaching".to_string(),
            ));
        }
        let worker = self
            .worker_name()
            .ok_or_else(|| KilnError::Internal("authenticated session has no name".to_string()))?;

        let resource_id = self.claims.find_resource_id(ResourceKind::Worker, &worker)?;
        self.claims.claim(resource_id, &self.master_id)?;
        *self.resource_id.lock().unwrap() = Some(resource_id);
        self.publish_claim_event(EventKind::Claimed, resource_id, Some(&self.master_id));

        *self.channel.lock().unwrap() = Some(channel);
        *self.last_keepalive.lock().unwrap() = Some(Utc::now());
        self.set_state(SessionState::Active);
        tracing::info!(
            "session {}: worker '{}' attached to master '{}'",
            self.session_id,
            worker,
            self.master_id
        );
        self.publish_worker_event(EventKind::Attached);
        Ok(())
    }

    /// Ask the worker to shut down gracefully and await its ack.
    ///
    /// Fails with `NotAttached` when no RPC channel has been established.
    /// There is no ack deadline; transport teardown unblocks the call if
    /// the peer vanishes.
    pub async fn request_shutdown(&self) -> Result<()> {
        let channel = self
            .channel
            .lock()
            .unwrap()
            .clone()
            .ok_or(KilnError::NotAttached)?;
        channel.call("shutdown", json!([])).await?;
        self.set_state(SessionState::ShutdownRequested);
        self.publish_worker_event(EventKind::ShutdownRequested);
        Ok(())
    }

    /// Poll the external shutdown signal, triggering `request_shutdown`
    /// only on a strict increase over the last observed value.
    pub async fn poll_shutdown_signal(&self, source: &dyn SignalSource) -> Result<bool> {
        let Some(value) = source.current_value() else {
            return Ok(false);
        };
        {
            let mut last = self.last_signal.lock().unwrap();
            if value <= *last {
                return Ok(false);
            }
            // Record before awaiting so concurrent polls deduplicate.
            *last = value;
        }
        tracing::info!(
            "session {}: shutdown signal advanced to {}",
            self.session_id,
            value
        );
        self.request_shutdown().await?;
        Ok(true)
    }

    /// Send one keepalive ping. `Ok(false)` means the ack did not arrive
    /// within `timeout`; deciding what to do about that is the caller's
    /// job.
    pub async fn keepalive(&self, timeout: Duration) -> Result<bool> {
        let channel = self
            .channel
            .lock()
            .unwrap()
            .clone()
            .ok_or(KilnError::NotAttached)?;
        match tokio::time::timeout(timeout, channel.call("keepalive", json!([]))).await {
            Ok(Ok(_)) => {
                *self.last_keepalive.lock().unwrap() = Some(Utc::now());
                Ok(true)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    /// Start the keepalive loop, or return `None` when the interval is 0
    /// (disabled).
    pub fn spawn_keepalive(
        self: Arc<Self>,
        interval_secs: u64,
        timeout_secs: u64,
        hooks: Arc<dyn SessionHooks>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if interval_secs == 0 {
            return None;
        }
        let session = self;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match session.state() {
                    SessionState::Disconnected => break,
                    SessionState::Active | SessionState::ShutdownRequested => {}
                    _ => continue,
                }
                match session.keepalive(Duration::from_secs(timeout_secs)).await {
                    Ok(true) => {}
                    Ok(false) => {
                        let worker = session.worker_name().unwrap_or_default();
                        tracing::warn!(
                            "session {}: keepalive timed out for '{}'",
                            session.session_id,
                            worker
                        );
                        hooks.on_keepalive_timeout(&worker).await;
                    }
                    Err(KilnError::ConnectionClosed) | Err(KilnError::NotAttached) => break,
                    Err(e) => {
                        tracing::warn!("session {}: keepalive failed: {}", session.session_id, e);
                    }
                }
            }
        }))
    }

    /// Tear the session down: release the worker's claim, close the
    /// transport, and go `Disconnected`. Idempotent; errors are swallowed
    /// because teardown must always finish.
    pub async fn detach(&self) {
        let channel = self.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            channel.close().await;
        }

        let resource_id = self.resource_id.lock().unwrap().take();
        if let Some(resource_id) = resource_id {
            match self.claims.release(resource_id) {
                Ok(()) => self.publish_claim_event(EventKind::Released, resource_id, None),
                Err(e) => {
                    tracing::warn!(
                        "session {}: releasing claim on resource {} failed: {}",
                        self.session_id,
                        resource_id,
                        e
                    );
                }
            }
        }

        let previous = {
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut *state, SessionState::Disconnected)
        };
        if previous != SessionState::Disconnected {
            tracing::info!("session {} disconnected", self.session_id);
            self.publish_worker_event(EventKind::Detached);
        }
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap();
        tracing::debug!(
            "session {}: {} -> {}",
            self.session_id,
            state.as_str(),
            next.as_str()
        );
        *state = next;
    }

    fn snapshot(&self) -> Value {
        json!({
            "name": self.worker_name(),
            "sessionid": self.session_id.to_string(),
            "masterid": self.master_id,
            "state": self.state().as_str(),
        })
    }

    fn publish_worker_event(&self, kind: EventKind) {
        let Some(worker) = self.worker_name() else {
            return;
        };
        self.bus.publish(Event {
            topics: vec![format!("/workers/{}", worker)],
            kind,
            snapshot: self.snapshot(),
        });
    }

    fn publish_claim_event(&self, kind: EventKind, resource_id: i64, master_id: Option<&str>) {
        self.bus.publish(Event {
            topics: vec![format!("/claims/{}", resource_id)],
            kind,
            snapshot: json!({
                "resourceid": resource_id,
                "masterid": master_id,
            }),
        });
    }
}

/// Inbound-call dispatcher for the master side of a worker connection.
///
/// The channel is bound after construction because the transport needs a
/// handler at spawn time.
pub struct MasterSessionHandler {
    session: Arc<WorkerSession>,
    realm: Arc<dyn Realm>,
    channel: Mutex<Option<Arc<dyn RpcChannel>>>,
}

impl MasterSessionHandler {
    pub fn new(session: Arc<WorkerSession>, realm: Arc<dyn Realm>) -> Arc<Self> {
        Arc::new(Self {
            session,
            realm,
            channel: Mutex::new(None),
        })
    }

    pub fn bind(&self, channel: Arc<dyn RpcChannel>) {
        *self.channel.lock().unwrap() = Some(channel);
    }
}

#[async_trait]
impl RpcHandler for MasterSessionHandler {
    async fn handle(&self, method: &str, args: Value) -> Result<Value> {
        match method {
            "auth" => {
                let (name, secret) = match (args.get(0).and_then(Value::as_str), args.get(1).and_then(Value::as_str)) {
                    (Some(name), Some(secret)) => (name, secret),
                    _ => {
                        return Err(KilnError::Transport(
                            "auth expects [name, secret]".to_string(),
                        ));
                    }
                };
                if !self.session.authenticate(&*self.realm, name, secret).await? {
                    return Err(KilnError::Transport("authentication failed".to_string()));
                }
                let channel = self
                    .channel
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or(KilnError::NotAttached)?;
                self.session.attach(channel)?;
                Ok(json!("ok"))
            }
            "print" => {
                let message = args.get(0).and_then(Value::as_str).unwrap_or_default();
                tracing::info!(
                    "message from worker '{}': {}",
                    self.session.worker_name().unwrap_or_default(),
                    message
                );
                Ok(json!("ack"))
            }
            other => Err(KilnError::Transport(format!("unknown method '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::realm::InMemoryRealm;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockChannel {
        calls: Mutex<Vec<String>>,
        closed: AtomicBool,
        respond: bool,
    }

    impl MockChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                respond: true,
            })
        }

        fn silent() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                respond: false,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RpcChannel for MockChannel {
        async fn call(&self, method: &str, _args: Value) -> Result<Value> {
            self.calls.lock().unwrap().push(method.to_string());
            if !self.respond {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(json!("ack"))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct MockSignal {
        value: Mutex<Option<u64>>,
    }

    impl MockSignal {
        fn new() -> Self {
            Self {
                value: Mutex::new(None),
            }
        }

        fn set(&self, value: u64) {
            *self.value.lock().unwrap() = Some(value);
        }
    }

    impl SignalSource for MockSignal {
        fn current_value(&self) -> Option<u64> {
            *self.value.lock().unwrap()
        }
    }

    fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
            .worker_name("testy")
            .secret("westy")
            .base_directory("/tmp/worker")
    }

    #[test]
    fn test_config_host_port() {
        let config = builder().host("127.0.0.1").port(9010).build().unwrap();
        assert_eq!(
            config.target,
            ConnectTarget::HostPort("127.0.0.1".to_string(), 9010)
        );
        assert_eq!(config.target.connect_addr(), "127.0.0.1:9010");
        assert_eq!(config.protocol, "kiln");
        assert_eq!(config.keepalive_timeout, 30);
    }

    #[test]
    fn test_config_connection_string() {
        let config = builder()
            .connection_string("tcp:localhost:9010")
            .build()
            .unwrap();
        assert_eq!(config.target.connect_addr(), "localhost:9010");
    }

    #[test]
    fn test_config_both_styles_rejected() {
        let err = builder()
            .host("127.0.0.1")
            .port(9010)
            .connection_string("tcp:anything")
            .build()
            .unwrap_err();
        assert!(matches!(err, KilnError::Validation(_)));
    }

    #[test]
    fn test_config_partial_mixes_rejected() {
        // host alongside a connection string
        let err = builder()
            .host("127.0.0.1")
            .connection_string("tcp:anything")
            .build()
            .unwrap_err();
        assert!(matches!(err, KilnError::Validation(_)));

        // port alongside a connection string
        let err = builder()
            .port(9010)
            .connection_string("tcp:anything")
            .build()
            .unwrap_err();
        assert!(matches!(err, KilnError::Validation(_)));

        // host without port
        let err = builder().host("127.0.0.1").build().unwrap_err();
        assert!(matches!(err, KilnError::Validation(_)));

        // nothing at all
        let err = builder().build().unwrap_err();
        assert!(matches!(err, KilnError::Validation(_)));
    }

    #[test]
    fn test_config_unknown_protocol_rejected() {
        let err = builder()
            .host("127.0.0.1")
            .port(9010)
            .protocol("pb")
            .build()
            .unwrap_err();
        assert!(matches!(err, KilnError::Validation(_)));
    }

    fn session() -> (tempfile::TempDir, Arc<WorkerSession>, ClaimStore, EventBus) {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Db::open(temp_dir.path().join("kiln.db")).unwrap();
        let claims = ClaimStore::new(db);
        let bus = EventBus::new();
        let session = Arc::new(WorkerSession::new(
            "master-a",
            claims.clone(),
            bus.clone(),
        ));
        (temp_dir, session, claims, bus)
    }

    async fn activate(session: &Arc<WorkerSession>) -> Arc<MockChannel> {
        let realm = InMemoryRealm::with_credentials([("testy".to_string(), "westy".to_string())]);
        assert!(session.authenticate(&realm, "testy", "westy").await.unwrap());
        let channel = MockChannel::new();
        session.attach(channel.clone()).unwrap();
        channel
    }

    #[tokio::test]
    async fn test_lifecycle_and_events() {
        let (_t, session, claims, bus) = session();
        let mut rx = bus.subscribe();
        assert_eq!(session.state(), SessionState::Connecting);

        let channel = activate(&session).await;
        assert_eq!(session.state(), SessionState::Active);

        let resource = claims
            .find_resource_id(ResourceKind::Worker, "testy")
            .unwrap();
        assert_eq!(claims.get_claim(resource).unwrap().as_deref(), Some("master-a"));

        let claimed = rx.try_recv().unwrap();
        assert_eq!(claimed.kind, EventKind::Claimed);
        assert!(claimed.has_topic(&format!("/claims/{}", resource)));
        assert_eq!(claimed.snapshot["masterid"], "master-a");

        let attached = rx.try_recv().unwrap();
        assert_eq!(attached.kind, EventKind::Attached);
        assert!(attached.has_topic("/workers/testy"));
        assert_eq!(attached.snapshot["masterid"], "master-a");

        session.detach().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(channel.is_closed());
        assert_eq!(claims.get_claim(resource).unwrap(), None);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Released);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Detached);

        // Second detach is a no-op: no duplicate event, no error.
        session.detach().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_authentication() {
        let (_t, session, _claims, _bus) = session();
        let realm = InMemoryRealm::with_credentials([("testy".to_string(), "westy".to_string())]);
        assert!(!session.authenticate(&realm, "testy", "wrong").await.unwrap());
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_attach_loses_claim_race() {
        let (_t, session, claims, _bus) = session();
        let resource = claims
            .find_resource_id(ResourceKind::Worker, "testy")
            .unwrap();
        claims.claim(resource, "master-b").unwrap();

        let realm = InMemoryRealm::with_credentials([("testy".to_string(), "westy".to_string())]);
        assert!(session.authenticate(&realm, "testy", "westy").await.unwrap());
        let err = session.attach(MockChannel::new()).unwrap_err();
        assert!(matches!(err, KilnError::AlreadyClaimed { .. }));
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_request_shutdown_requires_attachment() {
        let (_t, session, _claims, _bus) = session();
        let err = session.request_shutdown().await.unwrap_err();
        assert!(matches!(err, KilnError::NotAttached));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_calls_remote() {
        let (_t, session, _claims, bus) = session();
        let mut rx = bus.subscribe();
        let channel = activate(&session).await;
        // Drain the Claimed and Attached events from activation.
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        session.request_shutdown().await.unwrap();
        assert_eq!(channel.calls(), vec!["shutdown"]);
        assert_eq!(session.state(), SessionState::ShutdownRequested);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::ShutdownRequested);
    }

    #[tokio::test]
    async fn test_shutdown_signal_dedup() {
        let (_t, session, _claims, _bus) = session();
        let channel = activate(&session).await;
        let signal = MockSignal::new();

        // No signal at all: nothing happens.
        assert!(!session.poll_shutdown_signal(&signal).await.unwrap());
        assert!(channel.calls().is_empty());

        // First observed value triggers once.
        signal.set(2);
        assert!(session.poll_shutdown_signal(&signal).await.unwrap());
        assert!(!session.poll_shutdown_signal(&signal).await.unwrap());
        assert_eq!(channel.calls().len(), 1);

        // A strict increase triggers again; repeats still deduplicate.
        signal.set(3);
        assert!(session.poll_shutdown_signal(&signal).await.unwrap());
        assert!(!session.poll_shutdown_signal(&signal).await.unwrap());
        assert_eq!(channel.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_keepalive_success_and_timeout() {
        let (_t, session, _claims, _bus) = session();
        let channel = activate(&session).await;

        assert!(session.keepalive(Duration::from_secs(5)).await.unwrap());
        assert_eq!(channel.calls(), vec!["keepalive"]);
        assert!(session.last_keepalive().is_some());

        // Swap in a channel that never answers; the ping times out and
        // the session reports it without deciding anything.
        *session.channel.lock().unwrap() = Some(MockChannel::silent());
        assert!(!session.keepalive(Duration::from_millis(50)).await.unwrap());
    }

    #[tokio::test]
    async fn test_keepalive_timeout_reaches_hook() {
        struct CountingHooks {
            timeouts: AtomicUsize,
        }

        #[async_trait]
        impl SessionHooks for CountingHooks {
            async fn on_keepalive_timeout(&self, _worker: &str) {
                self.timeouts.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (_t, session, _claims, _bus) = session();
        activate(&session).await;
        *session.channel.lock().unwrap() = Some(MockChannel::silent());

        let hooks = Arc::new(CountingHooks {
            timeouts: AtomicUsize::new(0),
        });
        // Interval 0 disables the loop entirely.
        assert!(session.clone().spawn_keepalive(0, 1, hooks.clone()).is_none());

        let handle = session.clone().spawn_keepalive(1, 0, hooks.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        session.detach().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

        assert!(hooks.timeouts.load(Ordering::SeqCst) >= 1);
    }
}
