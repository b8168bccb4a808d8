//! Periodic connection heartbeat.
//!
//! Once per interval every registered connection gets a tick with the same
//! timestamp; connections use it to evaluate their armed timeouts. A tick that
//! takes longer than the interval means timeouts are being evaluated late, so
//! it is reported.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::lifecycle::shutdown::Shutdown;
use crate::net::connection::ConnectionRegistry;
use crate::observability::metrics;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

pub struct Heartbeat {
    shutdown: Shutdown,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(registry: Arc<ConnectionRegistry>, interval: Duration) -> Self {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = signal.recv() => break,
                }

                let now = Instant::now();
                registry.tick_all(now);
                let elapsed = now.elapsed();
                metrics::record_heartbeat(elapsed);
                if elapsed > interval {
                    tracing::warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        interval_ms = interval.as_millis() as u64,
                        connections = registry.len(),
                        "Heartbeat took longer than its interval"
                    );
                }
            }
            tracing::debug!("Heartbeat stopped");
        });

        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::{ConnectionId, ConnectionLifetime};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn ticks_registered_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let lifetime = Arc::new(ConnectionLifetime::new(ConnectionId::new(), Arc::from("test")));
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        lifetime.on_heartbeat(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        registry.register(lifetime);

        let heartbeat = Heartbeat::start(registry, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        heartbeat.stop().await;

        let observed = ticks.load(Ordering::SeqCst);
        assert!(observed >= 2, "only {} ticks", observed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), observed);
    }
}
