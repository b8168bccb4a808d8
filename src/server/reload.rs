//! Endpoint diffing for configuration reloads.
//!
//! An endpoint is identified by its name. It is unchanged only if its
//! resolved configuration is equal by value and none of the certificates it
//! is running with has been flagged as changed on disk.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::EndpointConfig;
use crate::tls::{CertificatePathWatcher, ChangeToken};

/// Which named endpoints a reload has to touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointDiff {
    pub unchanged: Vec<String>,
    pub changed: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl EndpointDiff {
    /// True when no endpoint has to be stopped or started.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// Endpoints whose listeners must be stopped.
    pub fn to_stop(&self) -> impl Iterator<Item = &String> {
        self.removed.iter().chain(self.changed.iter())
    }

    /// Endpoints whose listeners must be (re)bound.
    pub fn to_start(&self) -> impl Iterator<Item = &String> {
        self.changed.iter().chain(self.added.iter())
    }
}

pub fn diff_endpoints(
    running: &BTreeMap<String, EndpointConfig>,
    desired: &BTreeMap<String, EndpointConfig>,
) -> EndpointDiff {
    let mut diff = EndpointDiff::default();

    for (name, current) in running {
        match desired.get(name) {
            None => diff.removed.push(name.clone()),
            Some(next) if next != current || current.has_changed_certificate() => diff.changed.push(name.clone()),
            Some(_) => diff.unchanged.push(name.clone()),
        }
    }
    for name in desired.keys() {
        if !running.contains_key(name) {
            diff.added.push(name.clone());
        }
    }

    diff
}

/// Stream of certificate change notifications.
///
/// The next token is taken as soon as one fires, so a change that lands while
/// the previous one is being handled is reported by the following call.
pub struct CertificateChanges {
    watcher: CertificatePathWatcher,
    token: Arc<ChangeToken>,
}

impl CertificateChanges {
    pub fn new(watcher: CertificatePathWatcher) -> Self {
        let token = watcher.change_token();
        Self { watcher, token }
    }

    /// Resolves on the next certificate change since the previous call.
    pub async fn next(&mut self) {
        self.token.changed().await;
        self.token = self.watcher.change_token();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::watcher::{ChangeCallback, WatchHandle};
    use crate::tls::{CertificateConfig, WatchError, WatchedFileSystem};
    use std::io;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};

    fn endpoint(url: &str) -> EndpointConfig {
        EndpointConfig {
            url: url.to_string(),
            ..EndpointConfig::default()
        }
    }

    fn https(url: &str, cert: &str) -> EndpointConfig {
        EndpointConfig {
            url: url.to_string(),
            certificate: Some(Arc::new(CertificateConfig::from_files(cert, None))),
            ..EndpointConfig::default()
        }
    }

    fn map(entries: &[(&str, EndpointConfig)]) -> BTreeMap<String, EndpointConfig> {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn classifies_every_endpoint() {
        let running = map(&[
            ("keep", endpoint("http://127.0.0.1:5000")),
            ("move", endpoint("http://127.0.0.1:5001")),
            ("drop", endpoint("http://127.0.0.1:5002")),
        ]);
        let desired = map(&[
            ("keep", endpoint("http://127.0.0.1:5000")),
            ("move", endpoint("http://127.0.0.1:6001")),
            ("new", endpoint("http://127.0.0.1:5003")),
        ]);

        let diff = diff_endpoints(&running, &desired);
        assert_eq!(diff.unchanged, vec!["keep"]);
        assert_eq!(diff.changed, vec!["move"]);
        assert_eq!(diff.removed, vec!["drop"]);
        assert_eq!(diff.added, vec!["new"]);
        assert_eq!(diff.to_stop().collect::<Vec<_>>(), vec!["drop", "move"]);
        assert_eq!(diff.to_start().collect::<Vec<_>>(), vec!["move", "new"]);
    }

    #[test]
    fn equal_values_in_distinct_instances_are_unchanged() {
        let running = map(&[("tls", https("https://127.0.0.1:5001", "a.pem"))]);
        let desired = map(&[("tls", https("https://127.0.0.1:5001", "a.pem"))]);
        let diff = diff_endpoints(&running, &desired);
        assert!(diff.is_empty());
        assert_eq!(diff.unchanged, vec!["tls"]);
    }

    #[test]
    fn flagged_certificate_counts_as_changed() {
        let running = map(&[("tls", https("https://127.0.0.1:5001", "a.pem"))]);
        let desired = map(&[("tls", https("https://127.0.0.1:5001", "a.pem"))]);
        running["tls"].certificate.as_ref().unwrap().mark_file_changed();

        let diff = diff_endpoints(&running, &desired);
        assert_eq!(diff.changed, vec!["tls"]);
    }

    #[test]
    fn flagged_sni_certificate_counts_as_changed() {
        let mut config = https("https://127.0.0.1:5001", "a.pem");
        config.sni.insert(
            "*.example.org".to_string(),
            crate::config::SniConfig {
                certificate: Some(Arc::new(CertificateConfig::from_files("b.pem", None))),
                ..Default::default()
            },
        );
        let running = map(&[("tls", config.clone())]);
        let desired = map(&[("tls", config)]);
        running["tls"].sni["*.example.org"].certificate.as_ref().unwrap().mark_file_changed();

        assert_eq!(diff_endpoints(&running, &desired).changed, vec!["tls"]);
    }

    /// File system whose only file reports a settable modified time.
    #[derive(Default)]
    struct TouchedFile(Mutex<u64>);

    struct NoWatch;

    impl WatchHandle for NoWatch {}

    impl TouchedFile {
        fn touch(&self, secs: u64) {
            *self.0.lock().unwrap() = secs;
        }
    }

    impl WatchedFileSystem for TouchedFile {
        fn modified(&self, _path: &Path) -> io::Result<Option<SystemTime>> {
            Ok(Some(SystemTime::UNIX_EPOCH + Duration::from_secs(*self.0.lock().unwrap())))
        }

        fn watch(&self, _path: &Path, _on_change: ChangeCallback) -> Result<Box<dyn WatchHandle>, WatchError> {
            Ok(Box::new(NoWatch))
        }
    }

    #[tokio::test]
    async fn change_during_handling_is_not_lost() {
        let fs = Arc::new(TouchedFile::default());
        let watcher = CertificatePathWatcher::new("/srv", fs.clone());
        watcher.add_watch(&Arc::new(CertificateConfig::from_files("/certs/site.pem", None)));
        let path = Path::new("/certs/site.pem");
        let mut changes = CertificateChanges::new(watcher.clone());

        fs.touch(1);
        watcher.on_file_changed(path);
        tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .expect("first change reported");

        // Lands while the first change is still being handled.
        fs.touch(2);
        watcher.on_file_changed(path);
        tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .expect("second change reported");
    }

    #[tokio::test]
    async fn no_change_keeps_waiting() {
        let fs = Arc::new(TouchedFile::default());
        let watcher = CertificatePathWatcher::new("/srv", fs.clone());
        watcher.add_watch(&Arc::new(CertificateConfig::from_files("/certs/site.pem", None)));
        let mut changes = CertificateChanges::new(watcher.clone());

        watcher.on_file_changed(Path::new("/certs/site.pem"));
        assert!(tokio::time::timeout(Duration::from_millis(50), changes.next()).await.is_err());
    }
}
