use std::sync::Arc;
use std::time::Instant;

use butler_core::config::BufferConfig;
use butler_db::Db;
use butler_telemetry::ButlerMetrics;
use chrono::{Duration, Utc};
use dashmap::DashSet;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// One routed message travelling through the buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub request_id: String,
    pub message_inbox_id: String,
    pub message_text: String,
    /// Source channel ("telegram", "email", …).
    pub source: String,
    /// Event block JSON (thread identity, observed_at) carried verbatim.
    pub event: String,
    pub sender: String,
    /// Set when deterministic triage already chose a destination; the
    /// routing pipeline then skips the LLM classifier.
    #[serde(default)]
    pub triage_target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueuePath {
    /// Accepted into the in-memory ring.
    Hot,
    /// Ring full: the durable row stands and the scanner will pick it up.
    Cold,
}

/// Handler applied by buffer workers. An `Err` leaves the durable row in
/// place for the scanner to retry — the buffer itself enforces no retry
/// budget.
pub type ProcessFn =
    Arc<dyn Fn(QueueItem) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// Per-butler message queue with a persistent `route_inbox` mirror.
///
/// Invariants: at-least-once delivery to the process fn; a request_id is held
/// by at most one in-flight worker (ring membership + row lease); queue-depth
/// gauge counts pending + active.
pub struct DurableBuffer {
    db: Db,
    butler_name: String,
    config: BufferConfig,
    metrics: ButlerMetrics,
    tx: mpsc::Sender<QueueItem>,
    rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
    in_ring: Arc<DashSet<String>>,
}

impl DurableBuffer {
    pub fn new(db: Db, butler_name: &str, config: BufferConfig, metrics: ButlerMetrics) -> Self {
        let (tx, rx) = mpsc::channel(config.ring_capacity.max(1));
        Self {
            db,
            butler_name: butler_name.to_string(),
            config,
            metrics,
            tx,
            rx: Mutex::new(Some(rx)),
            in_ring: Arc::new(DashSet::new()),
        }
    }

    /// Admit a message. The caller has already persisted the message to
    /// `message_inbox`; this writes the durable queue mirror and then tries
    /// the hot path. `Cold` means the ring rejected it — backpressure is the
    /// caller's signal to slow the producer; the cold-path scanner guarantees
    /// eventual delivery either way.
    pub async fn enqueue(&self, item: QueueItem) -> Result<EnqueuePath> {
        let now = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(&item)?;
        let (inbox_id, butler, request_id) = (
            item.message_inbox_id.clone(),
            self.butler_name.clone(),
            item.request_id.clone(),
        );
        self.db.with(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO route_inbox
                 (message_inbox_id, butler_name, request_id, payload, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![inbox_id, butler, request_id, payload, now],
            )
        })?;

        match self.tx.try_send(item.clone()) {
            Ok(()) => {
                self.in_ring.insert(item.request_id);
                self.metrics.buffer_depth_add(1);
                Ok(EnqueuePath::Hot)
            }
            Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.backpressure_inc();
                debug!(request_id = %item.request_id, "ring full; message takes the cold path");
                Ok(EnqueuePath::Cold)
            }
        }
    }

    /// Queue depth = pending + active.
    pub fn depth(&self) -> i64 {
        self.metrics.buffer_depth()
    }

    /// Start `worker_count` workers and the recovery scanner.
    ///
    /// The scanner runs one immediate startup pass (every durable row not in
    /// the ring is re-eligible, regardless of lease or grace) so messages
    /// that were in flight at crash time re-enter the queue.
    pub async fn run(
        self: &Arc<Self>,
        process_fn: ProcessFn,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let receiver = self
            .rx
            .lock()
            .await
            .take()
            .expect("DurableBuffer::run called twice");
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::new();
        for worker_id in 0..self.config.worker_count.max(1) {
            let buffer = self.clone();
            let receiver = receiver.clone();
            let process_fn = process_fn.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let item = {
                        let mut rx = receiver.lock().await;
                        tokio::select! {
                            maybe = rx.recv() => match maybe {
                                Some(item) => item,
                                None => break,
                            },
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() { break; }
                                continue;
                            }
                        }
                    };
                    buffer.process_one(worker_id, item, &process_fn).await;
                }
                debug!(worker_id, "buffer worker stopped");
            }));
        }

        // Startup recovery pass before the periodic scanner cadence begins.
        if let Err(e) = self.scan(true) {
            warn!(error = %e, "startup route_inbox recovery scan failed");
        }

        let buffer = self.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                buffer.config.scanner_interval_s.max(1),
            ));
            interval.tick().await; // immediate first tick consumed
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = buffer.scan(false) {
                            warn!(error = %e, "route_inbox scan failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("buffer scanner stopped");
                            break;
                        }
                    }
                }
            }
        }));
        handles
    }

    async fn process_one(&self, worker_id: usize, item: QueueItem, process_fn: &ProcessFn) {
        let lease_owner = format!("{}-worker-{worker_id}", self.butler_name);
        let lease_until =
            (Utc::now() + Duration::seconds(self.config.scanner_grace_s as i64)).to_rfc3339();
        let inbox_id = item.message_inbox_id.clone();
        let lease = self.db.with(move |conn| {
            conn.execute(
                "UPDATE route_inbox SET lease_owner = ?1, lease_expires_at = ?2
                 WHERE message_inbox_id = ?3",
                rusqlite::params![lease_owner, lease_until, inbox_id],
            )
        });
        if let Err(e) = lease {
            warn!(error = %e, "lease write failed; processing anyway");
        }

        let t0 = Instant::now();
        let outcome = process_fn(item.clone()).await;
        self.metrics
            .record_process_latency(t0.elapsed().as_millis() as u64);
        self.in_ring.remove(&item.request_id);
        self.metrics.buffer_depth_add(-1);

        match outcome {
            Ok(()) => {
                let inbox_id = item.message_inbox_id.clone();
                let deleted = self.db.with(move |conn| {
                    conn.execute(
                        "DELETE FROM route_inbox WHERE message_inbox_id = ?1",
                        [inbox_id.as_str()],
                    )
                });
                if let Err(e) = deleted {
                    warn!(error = %e, "route_inbox delete failed; scanner may redeliver");
                }
            }
            Err(e) => {
                // Leave the row; its lease expires and the scanner retries.
                warn!(request_id = %item.request_id, error = %e, "process_fn failed; will retry");
            }
        }
    }

    /// Re-enqueue recoverable durable rows. `startup` ignores lease and grace
    /// entirely — after a restart nothing is genuinely in flight.
    pub fn scan(&self, startup: bool) -> Result<usize> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let cutoff = (now - Duration::seconds(self.config.scanner_grace_s as i64)).to_rfc3339();
        let batch = self.config.scanner_batch_size;

        let rows: Vec<String> = self.db.with(move |conn| {
            let sql = if startup {
                "SELECT payload FROM route_inbox ORDER BY enqueued_at LIMIT ?3".to_string()
            } else {
                "SELECT payload FROM route_inbox
                 WHERE (lease_expires_at IS NOT NULL AND lease_expires_at < ?1)
                    OR enqueued_at < ?2
                 ORDER BY enqueued_at LIMIT ?3"
                    .to_string()
            };
            let mut stmt = conn.prepare(&sql)?;
            let mapped = if startup {
                stmt.query_map(
                    rusqlite::params![Option::<String>::None, Option::<String>::None, batch as i64],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()
            } else {
                stmt.query_map(rusqlite::params![now_str, cutoff, batch as i64], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()
            };
            mapped
        })?;

        let mut recovered = 0usize;
        for payload in rows {
            let item: QueueItem = match serde_json::from_str(&payload) {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "unreadable route_inbox payload skipped");
                    continue;
                }
            };
            if self.in_ring.contains(&item.request_id) {
                continue;
            }
            let request_id = item.request_id.clone();
            match self.tx.try_send(item) {
                Ok(()) => {
                    self.in_ring.insert(request_id);
                    self.metrics.buffer_depth_add(1);
                    recovered += 1;
                }
                Err(_) => break, // ring full again; next pass continues
            }
        }
        if recovered > 0 {
            self.metrics.scanner_recovered_inc(recovered as u64);
            info!(recovered, startup, "route_inbox rows re-enqueued");
        }
        Ok(recovered)
    }

    /// Durable rows currently mirrored (pending, leased, or orphaned).
    pub fn durable_len(&self) -> Result<i64> {
        Ok(self
            .db
            .with(|conn| conn.query_row("SELECT count(*) FROM route_inbox", [], |r| r.get(0)))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SWITCHBOARD_CHAIN;
    use butler_db::run_migrations;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn item(n: u32) -> QueueItem {
        QueueItem {
            request_id: format!("req-{n}"),
            message_inbox_id: format!("inbox-{n}"),
            message_text: format!("message {n}"),
            source: "telegram".to_string(),
            event: "{}".to_string(),
            sender: "user-1".to_string(),
            triage_target: None,
        }
    }

    fn buffer(ring_capacity: usize, workers: usize) -> Arc<DurableBuffer> {
        let db = Db::open_in_memory().unwrap();
        run_migrations(&db, &SWITCHBOARD_CHAIN).unwrap();
        let config = BufferConfig {
            ring_capacity,
            worker_count: workers,
            scanner_interval_s: 3600, // periodic cadence irrelevant in tests
            scanner_grace_s: 60,
            scanner_batch_size: 50,
        };
        Arc::new(DurableBuffer::new(
            db,
            "switchboard",
            config,
            ButlerMetrics::new("switchboard"),
        ))
    }

    fn counting_process(counter: Arc<AtomicUsize>) -> ProcessFn {
        Arc::new(move |_item| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn hot_path_processes_and_clears_durable_row() {
        let buffer = buffer(8, 1);
        assert_eq!(buffer.enqueue(item(1)).await.unwrap(), EnqueuePath::Hot);
        assert_eq!(buffer.depth(), 1);
        assert_eq!(buffer.durable_len().unwrap(), 1);

        let processed = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = buffer.run(counting_process(processed.clone()), shutdown_rx).await;

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.depth(), 0);
        assert_eq!(buffer.durable_len().unwrap(), 0);

        shutdown_tx.send(true).unwrap();
        for h in handles {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), h).await;
        }
    }

    #[tokio::test]
    async fn full_ring_takes_cold_path_and_counts_backpressure() {
        let buffer = buffer(1, 1);
        assert_eq!(buffer.enqueue(item(1)).await.unwrap(), EnqueuePath::Hot);
        assert_eq!(buffer.enqueue(item(2)).await.unwrap(), EnqueuePath::Cold);

        assert_eq!(
            buffer
                .metrics
                .registry()
                .counter_value("route.backpressure_total"),
            1
        );
        // Both messages are durable regardless of path.
        assert_eq!(buffer.durable_len().unwrap(), 2);
    }

    #[tokio::test]
    async fn startup_scan_recovers_orphaned_rows() {
        let buffer = buffer(8, 1);
        // Simulate a crash: durable row exists but nothing is in the ring.
        let orphan = item(9);
        let payload = serde_json::to_string(&orphan).unwrap();
        buffer
            .db
            .with(|conn| {
                conn.execute(
                    "INSERT INTO route_inbox
                     (message_inbox_id, butler_name, request_id, payload, enqueued_at)
                     VALUES (?1, 'switchboard', ?2, ?3, ?4)",
                    rusqlite::params![
                        orphan.message_inbox_id,
                        orphan.request_id,
                        payload,
                        Utc::now().to_rfc3339()
                    ],
                )
            })
            .unwrap();

        let processed = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = buffer.run(counting_process(processed.clone()), shutdown_rx).await;

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 1);
        assert!(
            buffer
                .metrics
                .registry()
                .counter_value("route.scanner_recovered_total")
                >= 1
        );

        shutdown_tx.send(true).unwrap();
        for h in handles {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), h).await;
        }
    }

    #[tokio::test]
    async fn failed_processing_leaves_row_for_retry() {
        let buffer = buffer(8, 1);
        buffer.enqueue(item(5)).await.unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let flaky: ProcessFn = Arc::new(move |_item| {
            let counter = counter.clone();
            async move {
                // First attempt fails, later attempts succeed.
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("transient".to_string())
                } else {
                    Ok(())
                }
            }
            .boxed()
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = buffer.run(flaky, shutdown_rx).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // Failure consumed once; the durable row survives for the scanner.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.durable_len().unwrap(), 1);

        // A manual startup-style scan re-enqueues it; the retry succeeds.
        buffer.scan(true).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(buffer.durable_len().unwrap(), 0);

        shutdown_tx.send(true).unwrap();
        for h in handles {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), h).await;
        }
    }

    #[tokio::test]
    async fn scan_skips_items_already_in_ring() {
        let buffer = buffer(8, 1);
        buffer.enqueue(item(7)).await.unwrap();
        // No workers running: the item sits in the ring. A startup scan must
        // not duplicate it.
        assert_eq!(buffer.scan(true).unwrap(), 0);
        assert_eq!(buffer.depth(), 1);
    }
}
