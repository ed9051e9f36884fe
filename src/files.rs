//! YAML-backed files with change watching
//!
//! Used for the global configuration, list-file target providers and cached
//! auth keys. The watcher detects writes, creates and symlink retargets by
//! polling the file metadata and the resolved symlink target.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Load a YAML file into a value
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = std::fs::read_to_string(path)?;
    let value = serde_yaml::from_str(&data)?;
    Ok(value)
}

/// Save a value as YAML, creating parent directories as needed
pub fn save_yaml<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let data = serde_yaml::to_string(value)?;
    std::fs::write(path, data)?;
    Ok(())
}

/// Snapshot of the observable state of a watched path
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileState {
    exists: bool,
    modified: Option<SystemTime>,
    /// Fully resolved path; changes when a symlink is retargeted
    resolved: Option<PathBuf>,
}

impl FileState {
    fn capture(path: &Path) -> Self {
        let metadata = std::fs::metadata(path).ok();
        Self {
            exists: metadata.is_some(),
            modified: metadata.and_then(|m| m.modified().ok()),
            resolved: std::fs::canonicalize(path).ok(),
        }
    }
}

/// Watches a file for changes, firing a callback from a background task.
///
/// The watcher stops when the handle is dropped.
pub struct FileWatcher {
    shutdown_tx: watch::Sender<bool>,
}

impl FileWatcher {
    /// Start watching `path`, invoking `on_change` whenever the file is
    /// written, created, or its symlink is retargeted.
    pub fn spawn<F>(path: PathBuf, on_change: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::spawn_with_interval(path, Duration::from_secs(1), on_change)
    }

    pub fn spawn_with_interval<F>(path: PathBuf, interval: Duration, on_change: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            debug!(path = %path.display(), "Start watching file");
            let mut last = FileState::capture(&path);

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let current = FileState::capture(&path);
                        if current != last {
                            let appeared = current.exists && !last.exists;
                            let retargeted = current.resolved != last.resolved;
                            last = current;

                            if !last.exists {
                                // Removed; wait for it to come back
                                warn!(path = %path.display(), "Watched file removed");
                                continue;
                            }

                            debug!(
                                path = %path.display(),
                                appeared,
                                retargeted,
                                "Watched file changed"
                            );
                            on_change();
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!(path = %path.display(), "Stop watching file");
                            break;
                        }
                    }
                }
            }
        });

        Self { shutdown_tx }
    }

    /// Stop the watcher task
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("data.yaml");

        let mut value = HashMap::new();
        value.insert("a".to_string(), 1u32);
        value.insert("b".to_string(), 2u32);

        save_yaml(&path, &value).unwrap();
        let loaded: HashMap<String, u32> = load_yaml(&path).unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_load_missing_file() {
        let result: anyhow::Result<HashMap<String, u32>> =
            load_yaml(Path::new("/nonexistent/meshgate-test.yaml"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_watcher_fires_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.yaml");
        std::fs::write(&path, "a: 1\n").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let _watcher = FileWatcher::spawn_with_interval(
            path.clone(),
            Duration::from_millis(20),
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        // Let the watcher capture the initial state, then modify
        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::write(&path, "a: 2\n").unwrap();

        let mut waited = Duration::ZERO;
        while fired.load(Ordering::SeqCst) == 0 && waited < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watcher_fires_on_symlink_retarget() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.yaml");
        let second = dir.path().join("second.yaml");
        let link = dir.path().join("current.yaml");
        std::fs::write(&first, "a: 1\n").unwrap();
        std::fs::write(&second, "a: 2\n").unwrap();
        std::os::unix::fs::symlink(&first, &link).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let _watcher = FileWatcher::spawn_with_interval(
            link.clone(),
            Duration::from_millis(20),
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::remove_file(&link).unwrap();
        std::os::unix::fs::symlink(&second, &link).unwrap();

        let mut waited = Duration::ZERO;
        while fired.load(Ordering::SeqCst) == 0 && waited < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }
}
