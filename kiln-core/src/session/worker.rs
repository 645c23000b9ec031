//! Worker-side connection: dial the master, authenticate, answer its
//! keepalive and shutdown commands.

use crate::error::{KilnError, Result};
use crate::session::SessionConfig;
use crate::session::transport::{JsonChannel, RpcChannel, RpcHandler};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Answers master→worker commands and exposes the shutdown request to the
/// worker's main loop.
pub struct WorkerCommandHandler {
    shutdown_requested: AtomicBool,
    shutdown_notify: Notify,
}

impl WorkerCommandHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shutdown_requested: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Resolve once the master has requested a graceful shutdown.
    pub async fn wait_shutdown(&self) {
        loop {
            let notified = self.shutdown_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shutdown_requested() {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl RpcHandler for WorkerCommandHandler {
    async fn handle(&self, method: &str, _args: Value) -> Result<Value> {
        match method {
            "keepalive" => Ok(json!("ack")),
            "shutdown" => {
                tracing::info!("master requested graceful shutdown");
                self.shutdown_requested.store(true, Ordering::SeqCst);
                self.shutdown_notify.notify_waiters();
                Ok(json!("ack"))
            }
            other => Err(KilnError::Transport(format!("unknown method '{}'", other))),
        }
    }
}

/// A live, authenticated connection to a master.
pub struct WorkerConnection {
    config: SessionConfig,
    channel: Arc<JsonChannel>,
}

impl std::fmt::Debug for WorkerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConnection")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkerConnection {
    /// Prepare the base directory, record the hostname, dial the target
    /// from the validated config, and authenticate.
    pub async fn connect(config: SessionConfig, handler: Arc<dyn RpcHandler>) -> Result<Self> {
        prepare_base_directory(&config)?;
        record_hostname(&config.base_directory)?;

        let addr = config.target.connect_addr();
        let channel = JsonChannel::connect(&addr, handler).await?;
        if let Err(e) = channel
            .call("auth", json!([config.worker_name, config.secret]))
            .await
        {
            channel.close().await;
            return Err(e);
        }
        tracing::info!("worker '{}' attached to {}", config.worker_name, addr);
        Ok(Self { config, channel })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn channel(&self) -> Arc<JsonChannel> {
        self.channel.clone()
    }

    /// Send a `print` message to the master.
    pub async fn print(&self, message: &str) -> Result<()> {
        self.channel.call("print", json!([message])).await?;
        Ok(())
    }

    pub async fn wait_closed(&self) {
        self.channel.wait_closed().await;
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}

fn prepare_base_directory(config: &SessionConfig) -> Result<()> {
    std::fs::create_dir_all(&config.base_directory)?;
    #[cfg(unix)]
    if let Some(umask) = config.umask {
        use std::os::unix::fs::PermissionsExt;
        let mode = 0o777 & !umask;
        std::fs::set_permissions(
            &config.base_directory,
            std::fs::Permissions::from_mode(mode),
        )?;
    }
    Ok(())
}

/// Record the local hostname in `<base_dir>/kiln.hostname`.
pub fn record_hostname(base_dir: &Path) -> Result<String> {
    let hostname = std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "localhost".to_string());
    std::fs::write(base_dir.join("kiln.hostname"), format!("{}\n", hostname))?;
    Ok(hostname)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::claims::ClaimStore;
    use crate::db::Db;
    use crate::realm::InMemoryRealm;
    use crate::session::{MasterSessionHandler, SessionConfigBuilder, SessionState, WorkerSession};
    use tokio::net::TcpListener;

    struct Master {
        _temp_dir: tempfile::TempDir,
        session: Arc<WorkerSession>,
        port: u16,
    }

    /// Minimal master: one listener, one session, credentials testy/westy.
    async fn start_master() -> Master {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Db::open(temp_dir.path().join("kiln.db")).unwrap();
        let claims = ClaimStore::new(db);
        let bus = EventBus::new();
        let session = Arc::new(WorkerSession::new("master-test", claims, bus));
        let realm = Arc::new(InMemoryRealm::with_credentials([(
            "testy".to_string(),
            "westy".to_string(),
        )]));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept_session = session.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let handler = MasterSessionHandler::new(accept_session.clone(), realm);
            let channel = JsonChannel::from_stream(stream, handler.clone());
            handler.bind(channel.clone());
            channel.wait_closed().await;
            accept_session.detach().await;
        });

        Master {
            _temp_dir: temp_dir,
            session,
            port,
        }
    }

    fn worker_config(base: &Path, port: u16) -> SessionConfig {
        SessionConfigBuilder::new()
            .host("127.0.0.1")
            .port(port)
            .worker_name("testy")
            .secret("westy")
            .base_directory(base)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_worker_print() {
        let master = start_master().await;
        let base = tempfile::tempdir().unwrap();

        let handler = WorkerCommandHandler::new();
        let worker = WorkerConnection::connect(
            worker_config(base.path(), master.port),
            handler,
        )
        .await
        .unwrap();

        worker.print("Hi, master.").await.unwrap();
        assert_eq!(master.session.state(), SessionState::Active);
        assert_eq!(master.session.worker_name().as_deref(), Some("testy"));

        worker.close().await;
    }

    #[tokio::test]
    async fn test_worker_bad_credentials_rejected() {
        let master = start_master().await;
        let base = tempfile::tempdir().unwrap();

        let config = SessionConfigBuilder::new()
            .host("127.0.0.1")
            .port(master.port)
            .worker_name("testy")
            .secret("wrong")
            .base_directory(base.path())
            .build()
            .unwrap();

        let err = WorkerConnection::connect(config, WorkerCommandHandler::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Transport(_)));
        assert_ne!(master.session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_round_trip() {
        let master = start_master().await;
        let base = tempfile::tempdir().unwrap();

        let handler = WorkerCommandHandler::new();
        let worker = WorkerConnection::connect(
            worker_config(base.path(), master.port),
            handler.clone(),
        )
        .await
        .unwrap();

        master.session.request_shutdown().await.unwrap();
        assert_eq!(master.session.state(), SessionState::ShutdownRequested);

        tokio::time::timeout(std::time::Duration::from_secs(5), handler.wait_shutdown())
            .await
            .unwrap();
        assert!(handler.shutdown_requested());

        worker.close().await;
    }

    #[tokio::test]
    async fn test_worker_disconnect_releases_claim() {
        let master = start_master().await;
        let base = tempfile::tempdir().unwrap();

        let worker = WorkerConnection::connect(
            worker_config(base.path(), master.port),
            WorkerCommandHandler::new(),
        )
        .await
        .unwrap();
        assert_eq!(master.session.state(), SessionState::Active);

        worker.close().await;

        // The accept task observes the closed transport and detaches.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while master.session.state() != SessionState::Disconnected {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_record_hostname() {
        let base = tempfile::tempdir().unwrap();
        let hostname = record_hostname(base.path()).unwrap();
        assert!(!hostname.is_empty());

        let recorded = std::fs::read_to_string(base.path().join("kiln.hostname")).unwrap();
        assert_eq!(recorded.trim(), hostname);
    }
}
