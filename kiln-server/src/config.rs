use kiln_core::{KilnError, Result, SessionConfig, SessionConfigBuilder, ShutdownTrigger};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub master: Option<MasterConfig>,
    pub worker: Option<WorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Identity this master claims resources under.
    pub master_id: String,
    pub db_path: PathBuf,
    pub api_addr: String,
    pub worker_addr: String,
    #[serde(default)]
    pub keepalive_interval: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: u64,
    #[serde(default = "default_shutdown_poll_interval")]
    pub shutdown_poll_interval: u64,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub worker: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub secret: String,
    pub base_directory: PathBuf,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub keepalive_interval: u64,
    #[serde(default)]
    pub umask: Option<u32>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default)]
    pub mode: ShutdownMode,
    #[serde(default)]
    pub signal_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    #[default]
    Disabled,
    Api,
    File,
}

fn default_keepalive_timeout() -> u64 {
    30
}

fn default_shutdown_poll_interval() -> u64 {
    10
}

fn default_protocol() -> String {
    "kiln".to_string()
}

impl ShutdownConfig {
    pub fn to_trigger(&self) -> Result<ShutdownTrigger> {
        match self.mode {
            ShutdownMode::Disabled => Ok(ShutdownTrigger::Disabled),
            ShutdownMode::Api => Ok(ShutdownTrigger::Api),
            ShutdownMode::File => {
                let path = self.signal_file.clone().ok_or_else(|| {
                    KilnError::Config(
                        "shutdown.signal_file is required for file mode".to_string(),
                    )
                })?;
                Ok(ShutdownTrigger::SignalFile(path))
            }
        }
    }
}

impl WorkerConfig {
    /// Run the raw fields through the session constructor's validation.
    pub fn to_session_config(&self) -> Result<SessionConfig> {
        let mut builder = SessionConfigBuilder::new()
            .worker_name(&self.name)
            .secret(&self.secret)
            .base_directory(&self.base_directory)
            .keepalive_interval(self.keepalive_interval)
            .protocol(&self.protocol)
            .shutdown(self.shutdown.to_trigger()?);

        if let Some(host) = &self.host {
            builder = builder.host(host);
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(descriptor) = &self.connection_string {
            builder = builder.connection_string(descriptor);
        }
        if let Some(umask) = self.umask {
            builder = builder.umask(umask);
        }
        builder.build()
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("KILN").separator("__"))
            .build()
            .map_err(|e| KilnError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| KilnError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn master(&self) -> Result<&MasterConfig> {
        self.master
            .as_ref()
            .ok_or_else(|| KilnError::Config("config has no [master] section".to_string()))
    }

    pub fn worker(&self) -> Result<&WorkerConfig> {
        self.worker
            .as_ref()
            .ok_or_else(|| KilnError::Config("config has no [worker] section".to_string()))
    }
}
