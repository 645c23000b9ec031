use std::path::PathBuf;
use std::time::UNIX_EPOCH;

/// An external signal a session polls to decide on graceful shutdown.
///
/// The session keeps the last observed value and triggers only on a strict
/// increase, so repeated polls of an unchanged signal deduplicate. What
/// produces the signal is irrelevant to that contract.
pub trait SignalSource: Send + Sync {
    /// The signal's current value, or `None` when no signal exists yet.
    fn current_value(&self) -> Option<u64>;
}

/// Signal backed by a file's modification time, in whole seconds since the
/// epoch. Touching the file requests shutdown; a missing file never does.
#[derive(Debug, Clone)]
pub struct FileMtimeSignal {
    path: PathBuf,
}

impl FileMtimeSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SignalSource for FileMtimeSignal {
    fn current_value(&self) -> Option<u64> {
        let mtime = std::fs::metadata(&self.path).ok()?.modified().ok()?;
        Some(mtime.duration_since(UNIX_EPOCH).ok()?.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_has_no_value() {
        let temp_dir = tempfile::tempdir().unwrap();
        let signal = FileMtimeSignal::new(temp_dir.path().join("shutdown"));
        assert_eq!(signal.current_value(), None);
    }

    #[test]
    fn test_existing_file_reports_mtime() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("shutdown");
        std::fs::write(&path, b"").unwrap();

        let signal = FileMtimeSignal::new(&path);
        let value = signal.current_value().unwrap();
        assert!(value > 0);
        assert_eq!(signal.current_value(), Some(value));
    }
}
