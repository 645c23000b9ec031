use async_trait::async_trait;
use std::collections::HashMap;

/// Authentication authority consulted when a worker connects.
///
/// Credential storage and validation mechanics live behind this seam; the
/// session layer only sees ok/fail.
#[async_trait]
pub trait Realm: Send + Sync {
    async fn authenticate(&self, worker: &str, secret: &str) -> bool;
}

/// Fixed credential set, for servers configured from a file and for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRealm {
    credentials: HashMap<String, String>,
}

impl InMemoryRealm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(
        credentials: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            credentials: credentials.into_iter().collect(),
        }
    }

    pub fn add(&mut self, worker: impl Into<String>, secret: impl Into<String>) {
        self.credentials.insert(worker.into(), secret.into());
    }
}

#[async_trait]
impl Realm for InMemoryRealm {
    async fn authenticate(&self, worker: &str, secret: &str) -> bool {
        self.credentials
            .get(worker)
            .is_some_and(|expected| expected == secret)
    }
}
