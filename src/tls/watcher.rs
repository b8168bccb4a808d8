//! Certificate path watcher for TLS hot reload.
//!
//! # Responsibilities
//! - Track on-disk certificate files and the configs that read them
//! - Accept a change only when the file's modified time strictly increases
//! - Flag every subscribing config and swap the change token on a real change
//!
//! # Data Flow
//! ```text
//! notify event (watcher thread)
//!     → on_file_changed(path)
//!     → stat under the records lock, compare with last known modified time
//!     → mark subscribers changed → swap token → signal the old token
//!     → server reload task wakes and rebuilds flagged endpoints
//! ```
//!
//! # Design Decisions
//! - One mutex guards the record map and the token swap
//! - A missing file counts as "never modified" and still arms a watch, so
//!   creating it later is a real change
//! - Stat failures are logged and treated as unmodified; a transient signal
//!   never triggers a reload
//! - Subscribers are identified by `Arc` pointer, not by value

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;

use crate::observability::metrics;
use crate::tls::certificate::CertificateConfig;

/// Errors from establishing an OS-level file watch.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("directory {} does not exist", .0.display())]
    MissingDirectory(PathBuf),

    #[error("file watch failed")]
    Notify(#[from] notify::Error),
}

/// A one-shot "something changed" signal.
///
/// Readers poll [`ChangeToken::has_changed`] or await [`ChangeToken::changed`];
/// after it fires they fetch the next token from the watcher.
#[derive(Debug, Default)]
pub struct ChangeToken {
    changed: AtomicBool,
    notify: Notify,
}

impl ChangeToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Resolves once this token has been signalled.
    pub async fn changed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_changed() {
                return;
            }
            notified.await;
        }
    }

    fn signal(&self) {
        self.changed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Callback the file system invokes with the path that changed.
pub type ChangeCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// An active OS watch; dropping it stops watching.
pub trait WatchHandle: Send {}

/// File-system operations the watcher needs.
pub trait WatchedFileSystem: Send + Sync + 'static {
    /// Last-modified time; `Ok(None)` when the file does not exist.
    fn modified(&self, path: &Path) -> io::Result<Option<SystemTime>>;

    /// Start watching `path` (which may not exist yet).
    fn watch(&self, path: &Path, on_change: ChangeCallback) -> Result<Box<dyn WatchHandle>, WatchError>;
}

/// [`WatchedFileSystem`] over the real disk using `notify`.
///
/// Each watched file gets a non-recursive watch on its parent directory so
/// the file can be created or atomically replaced after the watch starts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyFileSystem;

struct NotifyHandle {
    _watcher: RecommendedWatcher,
}

impl WatchHandle for NotifyHandle {}

impl WatchedFileSystem for NotifyFileSystem {
    fn modified(&self, path: &Path) -> io::Result<Option<SystemTime>> {
        match std::fs::metadata(path) {
            Ok(metadata) => metadata.modified().map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn watch(&self, path: &Path, on_change: ChangeCallback) -> Result<Box<dyn WatchHandle>, WatchError> {
        let directory = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        if !directory.is_dir() {
            return Err(WatchError::MissingDirectory(directory));
        }

        let target = path.to_path_buf();
        let file_name = path.file_name().map(|name| name.to_os_string());
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant && !event.kind.is_access() {
                        on_change(&target);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "Certificate watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&directory, RecursiveMode::NonRecursive)?;
        Ok(Box::new(NotifyHandle { _watcher: watcher }))
    }
}

struct WatchRecord {
    subscribers: Vec<Arc<CertificateConfig>>,
    last_modified: Option<SystemTime>,
    handle: Option<Box<dyn WatchHandle>>,
}

struct WatcherInner {
    content_root: PathBuf,
    fs: Arc<dyn WatchedFileSystem>,
    records: Mutex<HashMap<PathBuf, WatchRecord>>,
    token: ArcSwap<ChangeToken>,
}

/// Watches certificate files and signals when any of them really changes.
#[derive(Clone)]
pub struct CertificatePathWatcher {
    inner: Arc<WatcherInner>,
}

impl CertificatePathWatcher {
    pub fn new(content_root: impl Into<PathBuf>, fs: Arc<dyn WatchedFileSystem>) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                content_root: content_root.into(),
                fs,
                records: Mutex::new(HashMap::new()),
                token: ArcSwap::from_pointee(ChangeToken::new()),
            }),
        }
    }

    /// Watcher over the real file system.
    pub fn with_notify(content_root: impl Into<PathBuf>) -> Self {
        Self::new(content_root, Arc::new(NotifyFileSystem))
    }

    /// The token that fires on the next real change.
    pub fn change_token(&self) -> Arc<ChangeToken> {
        self.inner.token.load_full()
    }

    /// Replace one set of subscriptions with another.
    ///
    /// Configs present in both sets are only added, never removed and
    /// re-added. Adds run before removes so shared paths keep their OS watch.
    pub fn update_watches(&self, to_remove: &[Arc<CertificateConfig>], to_add: &[Arc<CertificateConfig>]) {
        for config in to_add {
            self.add_watch(config);
        }
        for config in to_remove {
            if to_add.iter().any(|added| Arc::ptr_eq(added, config)) {
                continue;
            }
            self.remove_watch(config);
        }
    }

    /// Subscribe `config` to its certificate and key files.
    pub fn add_watch(&self, config: &Arc<CertificateConfig>) {
        if !config.is_file_cert() {
            return;
        }
        let paths = config.watched_paths(&self.inner.content_root);
        let mut records = self.lock();
        for path in paths {
            let record = records.entry(path.clone()).or_insert_with(|| self.new_record(&path));
            if record.subscribers.iter().any(|existing| Arc::ptr_eq(existing, config)) {
                tracing::debug!(path = %path.display(), "Certificate already watched by this config");
                continue;
            }
            record.subscribers.push(Arc::clone(config));
            tracing::debug!(
                path = %path.display(),
                subscribers = record.subscribers.len(),
                "Added certificate watch"
            );
        }
    }

    /// Unsubscribe `config`; a path's watch is disposed with its last subscriber.
    pub fn remove_watch(&self, config: &Arc<CertificateConfig>) {
        if !config.is_file_cert() {
            return;
        }
        let paths = config.watched_paths(&self.inner.content_root);
        // Handles are dropped after the lock is released; a watch callback may
        // be waiting on it.
        let mut disposed = Vec::new();
        let mut records = self.lock();
        for path in paths {
            let Some(record) = records.get_mut(&path) else {
                tracing::debug!(path = %path.display(), "Removing watch for untracked certificate path");
                continue;
            };
            record.subscribers.retain(|existing| !Arc::ptr_eq(existing, config));
            if record.subscribers.is_empty() {
                disposed.extend(records.remove(&path));
                tracing::debug!(path = %path.display(), "Removed last certificate watch, disposing");
            } else {
                tracing::debug!(
                    path = %path.display(),
                    subscribers = record.subscribers.len(),
                    "Removed certificate watch"
                );
            }
        }
        drop(records);
        drop(disposed);
    }

    /// Handle a change notification for `path`.
    pub fn on_file_changed(&self, path: &Path) {
        Self::handle_change(&self.inner, path);
    }

    /// Number of configs subscribed to `path`.
    pub fn subscriber_count(&self, path: &Path) -> usize {
        self.lock()
            .get(path)
            .map(|record| record.subscribers.len())
            .unwrap_or(0)
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    fn new_record(&self, path: &Path) -> WatchRecord {
        let last_modified = match self.inner.fs.modified(path) {
            Ok(modified) => modified,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Unable to read certificate modified time");
                None
            }
        };

        let weak: Weak<WatcherInner> = Arc::downgrade(&self.inner);
        let callback: ChangeCallback = Arc::new(move |changed: &Path| {
            if let Some(inner) = weak.upgrade() {
                Self::handle_change(&inner, changed);
            }
        });

        let handle = match self.inner.fs.watch(path, callback) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Unable to watch certificate path");
                None
            }
        };

        WatchRecord {
            subscribers: Vec::new(),
            last_modified,
            handle,
        }
    }

    fn handle_change(inner: &WatcherInner, path: &Path) {
        let previous = {
            let mut records = inner.records.lock().expect("certificate watcher mutex poisoned");
            let Some(record) = records.get_mut(path) else {
                tracing::debug!(path = %path.display(), "Ignoring change for untracked path");
                return;
            };

            let modified = match inner.fs.modified(path) {
                Ok(modified) => modified,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "Unable to stat changed certificate, treating as unmodified");
                    return;
                }
            };
            if modified <= record.last_modified {
                tracing::debug!(path = %path.display(), "Modified time did not advance, ignoring event");
                return;
            }
            record.last_modified = modified;

            for config in &record.subscribers {
                config.mark_file_changed();
            }
            tracing::info!(
                path = %path.display(),
                subscribers = record.subscribers.len(),
                watching = record.handle.is_some(),
                "Certificate file changed"
            );
            inner.token.swap(Arc::new(ChangeToken::new()))
        };

        metrics::record_certificate_change();
        previous.signal();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, WatchRecord>> {
        self.inner.records.lock().expect("certificate watcher mutex poisoned")
    }
}
