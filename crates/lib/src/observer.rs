//! Delivery observer: read a user's delivery log once, or watch it for new records.
//!
//! Store failures never escape: a failed check returns an empty list, a failed watch poll is
//! logged and retried on the next tick.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::StoreConfig;
use crate::store::{DeliveryLog, DeliveryRecord};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_WATCH_LIMIT: u32 = 10;

/// Reads delivery records for external user ids.
#[derive(Clone)]
pub struct DeliveryObserver {
    log: Arc<dyn DeliveryLog>,
    poll_interval: Duration,
    watch_limit: u32,
}

impl DeliveryObserver {
    pub fn new(log: Arc<dyn DeliveryLog>) -> Self {
        Self {
            log,
            poll_interval: DEFAULT_POLL_INTERVAL,
            watch_limit: DEFAULT_WATCH_LIMIT,
        }
    }

    pub fn from_config(log: Arc<dyn DeliveryLog>, store: &StoreConfig) -> Self {
        Self::new(log)
            .with_poll_interval(Duration::from_millis(store.poll_interval_ms.max(1)))
            .with_watch_limit(store.watch_limit)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_watch_limit(mut self, limit: u32) -> Self {
        self.watch_limit = limit.max(1);
        self
    }

    /// Up to `limit` records for `external_id`, newest first. Empty on `limit == 0`, on a
    /// missing log, and on any store error.
    pub async fn check_messages(&self, external_id: &str, limit: u32) -> Vec<DeliveryRecord> {
        if limit == 0 {
            return Vec::new();
        }
        match self.log.recent(external_id, limit).await {
            Ok(mut records) => {
                records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                records.truncate(limit as usize);
                records
            }
            Err(e) => {
                log::warn!("checking delivery log for {} failed: {}", external_id, e);
                Vec::new()
            }
        }
    }

    /// Start watching `external_id`. Records appended after the watch's first successful poll are
    /// passed to `on_record` once each, in append order. `on_record` runs on the watch task and
    /// should not block; forward into a channel for heavy work.
    ///
    /// The watch runs on a spawned tokio task, so this must be called from inside a tokio
    /// runtime; it panics otherwise. Await [`WatchHandle::ready`] before producing records that
    /// must be reported.
    pub fn watch<F>(&self, external_id: &str, on_record: F) -> WatchHandle
    where
        F: FnMut(DeliveryRecord) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = watch::channel(false);
        log::info!("watching delivery log for {}", external_id);
        let task = tokio::spawn(run_watch(
            self.log.clone(),
            external_id.to_string(),
            self.watch_limit,
            self.poll_interval,
            running.clone(),
            ready_tx,
            on_record,
        ));
        WatchHandle {
            running,
            ready: ready_rx,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Ids of the last polled window. Records come back newest first, so anything not in the previous
/// window is new, and reversing the fresh ones gives append order.
#[derive(Debug, Default)]
struct PollWindow {
    seen: Option<HashSet<String>>,
}

impl PollWindow {
    fn has_baseline(&self) -> bool {
        self.seen.is_some()
    }

    /// Take the next window. The first call only records the baseline.
    fn advance(&mut self, records: Vec<DeliveryRecord>) -> Vec<DeliveryRecord> {
        let window: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let fresh = match &self.seen {
            None => Vec::new(),
            Some(seen) => {
                let mut fresh: Vec<DeliveryRecord> =
                    records.into_iter().filter(|r| !seen.contains(&r.id)).collect();
                fresh.reverse();
                fresh
            }
        };
        self.seen = Some(window);
        fresh
    }
}

/// Log level for poll failures: the first failure after a success is a warning, repeats are debug.
#[derive(Debug, Default)]
struct PollHealth {
    failing: bool,
}

impl PollHealth {
    fn failed(&mut self) -> log::Level {
        if std::mem::replace(&mut self.failing, true) {
            log::Level::Debug
        } else {
            log::Level::Warn
        }
    }

    /// True when this success ends a run of failures.
    fn succeeded(&mut self) -> bool {
        std::mem::replace(&mut self.failing, false)
    }
}

async fn run_watch<F>(
    store: Arc<dyn DeliveryLog>,
    external_id: String,
    limit: u32,
    interval: Duration,
    running: Arc<AtomicBool>,
    ready: watch::Sender<bool>,
    mut on_record: F,
) where
    F: FnMut(DeliveryRecord) + Send + 'static,
{
    let mut window = PollWindow::default();
    let mut health = PollHealth::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while running.load(Ordering::SeqCst) {
        ticker.tick().await;
        let records = match store.recent(&external_id, limit).await {
            Ok(r) => r,
            Err(e) => {
                let stage = if window.has_baseline() { "poll" } else { "baseline" };
                log::log!(health.failed(), "watch {} for {} failed: {}", stage, external_id, e);
                continue;
            }
        };
        if health.succeeded() {
            log::warn!("watch for {} recovered", external_id);
        }
        if !window.has_baseline() {
            log::debug!("watch baseline for {}: {} records", external_id, records.len());
            window.advance(records);
            let _ = ready.send(true);
            continue;
        }

        let fresh = window.advance(records);
        if fresh.len() as u32 >= limit {
            log::warn!(
                "watch for {}: {} new records in one poll, older ones may have been missed",
                external_id,
                fresh.len()
            );
        }
        for record in fresh {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            on_record(record);
        }
    }
    log::info!("watch for {} stopped", external_id);
}

/// Handle to a running watch. `stop` is idempotent, and a default handle is an inert watch that
/// was never started. Dropping the handle stops the watch.
pub struct WatchHandle {
    running: Arc<AtomicBool>,
    ready: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for WatchHandle {
    fn default() -> Self {
        let (_, ready) = watch::channel(false);
        Self {
            running: Arc::new(AtomicBool::new(false)),
            ready,
            task: Mutex::new(None),
        }
    }
}

impl WatchHandle {
    /// Wait until the baseline poll has succeeded. Records appended after this returns `true` are
    /// reported. Returns `false` if the watch stopped (or never started) first.
    pub async fn ready(&self) -> bool {
        let mut ready = self.ready.clone();
        let established = ready.wait_for(|r| *r).await.is_ok();
        established
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self
                .task
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .as_ref()
                .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{normalize_timestamp, MessageSource, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct MemoryLog {
        records: Mutex<Vec<DeliveryRecord>>,
        queries: AtomicUsize,
        fail: AtomicBool,
    }

    impl MemoryLog {
        fn append(&self, id: &str, created_at: i64) {
            self.records.lock().unwrap().push(DeliveryRecord {
                id: id.to_string(),
                server_message_id: format!("srv-{}", id),
                body: format!("body {}", id),
                source: MessageSource::Outbound,
                created_at,
                is_poll: false,
                poll_options: None,
            });
        }
    }

    #[async_trait]
    impl DeliveryLog for MemoryLog {
        async fn recent(&self, _external_id: &str, limit: u32) -> Result<Vec<DeliveryRecord>, StoreError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Api("boom".to_string()));
            }
            // Newest first; within one second the later append comes first, as the millisecond
            // ordering of the real store gives.
            let mut v = self.records.lock().unwrap().clone();
            v.reverse();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            v.truncate(limit as usize);
            Ok(v)
        }
    }

    async fn wait_for_queries(log: &MemoryLog, n: usize) {
        for _ in 0..200 {
            if log.queries.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watch did not poll {} times", n);
    }

    #[tokio::test]
    async fn check_returns_newest_first_and_respects_limit() {
        let log = Arc::new(MemoryLog::default());
        log.append("a", 1_700_000_000);
        log.append("b", 1_700_000_100);
        log.append("c", 1_700_000_050);
        let observer = DeliveryObserver::new(log.clone());

        let got = observer.check_messages("ext", 2).await;
        let ids: Vec<&str> = got.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);

        assert!(observer.check_messages("ext", 0).await.is_empty());
    }

    #[tokio::test]
    async fn check_swallows_store_errors() {
        let log = Arc::new(MemoryLog::default());
        log.append("a", 1);
        log.fail.store(true, Ordering::SeqCst);
        let observer = DeliveryObserver::new(log);
        assert!(observer.check_messages("ext", 5).await.is_empty());
    }

    #[tokio::test]
    async fn watch_delivers_new_records_in_append_order_once() {
        let log = Arc::new(MemoryLog::default());
        log.append("old", 1_700_000_000);
        let observer = DeliveryObserver::new(log.clone()).with_poll_interval(Duration::from_millis(10));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = observer.watch("ext", move |r| {
            let _ = tx.send(r.id);
        });
        wait_for_queries(&log, 1).await;

        log.append("r1", 1_700_000_010);
        log.append("r2", 1_700_000_020);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("r1"));
        assert_eq!(second.as_deref(), Some("r2"));

        // A few more polls must not redeliver anything.
        let polled = log.queries.load(Ordering::SeqCst);
        wait_for_queries(&log, polled + 3).await;
        assert!(rx.try_recv().is_err());

        assert!(handle.is_active());
        handle.stop();
        handle.stop();
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn watch_retries_failed_baseline() {
        let log = Arc::new(MemoryLog::default());
        log.append("old", 1);
        log.fail.store(true, Ordering::SeqCst);
        let observer = DeliveryObserver::new(log.clone()).with_poll_interval(Duration::from_millis(10));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = observer.watch("ext", move |r| {
            let _ = tx.send(r.id);
        });
        wait_for_queries(&log, 2).await;
        log.fail.store(false, Ordering::SeqCst);
        let polled = log.queries.load(Ordering::SeqCst);
        wait_for_queries(&log, polled + 2).await;

        log.append("new", 2);
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn watch_keeps_append_order_within_one_second() {
        let log = Arc::new(MemoryLog::default());
        log.append("seed", 1_699_999_990);
        let observer = DeliveryObserver::new(log.clone()).with_poll_interval(Duration::from_millis(10));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = observer.watch("ext", move |r| {
            let _ = tx.send(r.id);
        });
        assert!(handle.ready().await);

        // 100 ms and 400 ms into the same second; the later record has the smaller id.
        log.append("zQ8welcome", normalize_timestamp(1_700_000_000_100));
        log.append("Ab3pollq", normalize_timestamp(1_700_000_000_400));

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(
            (first.as_deref(), second.as_deref()),
            (Some("zQ8welcome"), Some("Ab3pollq"))
        );
    }

    #[tokio::test]
    async fn ready_waits_for_a_successful_baseline() {
        let log = Arc::new(MemoryLog::default());
        log.append("old", 1);
        log.fail.store(true, Ordering::SeqCst);
        let observer = DeliveryObserver::new(log.clone()).with_poll_interval(Duration::from_millis(10));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = observer.watch("ext", move |r| {
            let _ = tx.send(r.id);
        });
        wait_for_queries(&log, 3).await;
        assert!(tokio::time::timeout(Duration::from_millis(50), handle.ready()).await.is_err());

        log.fail.store(false, Ordering::SeqCst);
        let ready = tokio::time::timeout(Duration::from_secs(2), handle.ready()).await.unwrap();
        assert!(ready);

        // Appended right after the baseline: must be reported, not absorbed into it.
        log.append("reply", 2);
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("reply"));
    }

    #[tokio::test]
    async fn ready_is_false_for_stopped_or_inert_watch() {
        assert!(!WatchHandle::default().ready().await);

        let log = Arc::new(MemoryLog::default());
        log.fail.store(true, Ordering::SeqCst);
        let observer = DeliveryObserver::new(log.clone()).with_poll_interval(Duration::from_millis(10));
        let handle = observer.watch("ext", |_| {});
        handle.stop();
        let ready = tokio::time::timeout(Duration::from_secs(2), handle.ready()).await.unwrap();
        assert!(!ready);
    }

    fn record(id: &str) -> DeliveryRecord {
        DeliveryRecord {
            id: id.to_string(),
            server_message_id: String::new(),
            body: String::new(),
            source: MessageSource::Outbound,
            created_at: 0,
            is_poll: false,
            poll_options: None,
        }
    }

    fn ids(records: &[DeliveryRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn poll_window_reports_new_ids_oldest_first_and_forgets_old_ones() {
        let mut window = PollWindow::default();
        assert!(window.advance(vec![record("b"), record("a")]).is_empty());
        assert!(window.has_baseline());

        let fresh = window.advance(vec![record("d"), record("c"), record("b")]);
        assert_eq!(ids(&fresh), ["c", "d"]);

        // "a" slid out of the window and is no longer tracked.
        let seen = window.seen.as_ref().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains("a"));

        assert!(window.advance(vec![record("d"), record("c"), record("b")]).is_empty());
    }

    #[test]
    fn poll_failures_warn_once_per_outage() {
        let mut health = PollHealth::default();
        assert_eq!(health.failed(), log::Level::Warn);
        assert_eq!(health.failed(), log::Level::Debug);
        assert_eq!(health.failed(), log::Level::Debug);
        assert!(health.succeeded());
        assert!(!health.succeeded());
        assert_eq!(health.failed(), log::Level::Warn);
    }

    #[test]
    fn stopping_a_never_started_watch_is_a_noop() {
        let handle = WatchHandle::default();
        assert!(!handle.is_active());
        handle.stop();
        handle.stop();
    }
}
