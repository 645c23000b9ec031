use thiserror::Error;

pub type Result<T> = std::result::Result<T, KilnError>;

#[derive(Error, Debug)]
pub enum KilnError {
    /// A claim attempt lost the race to another master. Recoverable; the
    /// caller decides whether to retry elsewhere or treat the resource as
    /// owned.
    #[error("resource {resource_id} already claimed by master '{master_id}'")]
    AlreadyClaimed { resource_id: i64, master_id: String },

    /// Append attempted on a finished log.
    #[error("log {0} is already complete")]
    AlreadyComplete(i64),

    /// A remote call was issued before the session established its RPC
    /// channel.
    #[error("session is not attached to a remote peer")]
    NotAttached,

    /// The transport went away; broadcast to every call pending on it.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The request path matches no declared pattern. This is a programming
    /// or configuration error, distinct from a resource that resolved to
    /// absence.
    #[error("no declared path pattern matches '{0}'")]
    UnknownPath(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
