//! Polling change detector.
//!
//! Each tick fetches the data-status document and compares it with the
//! previous one. The first observation only records a baseline. Afterwards
//! every collection whose stamp differs fires its callback once. A tick that
//! arrives while a check is still in flight is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::handlers::ChangeHandlers;
use super::SyncResult;
use crate::model::Collection;
use crate::status::CollectionStatus;

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(15_000);

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self) -> SyncResult<CollectionStatus>;
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub handlers: ChangeHandlers,
    pub polling_interval: Duration,
    pub enabled: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { handlers: ChangeHandlers::default(), polling_interval: DEFAULT_POLLING_INTERVAL, enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another check was in flight.
    Skipped,
    /// First observation stored; nothing fired.
    Baseline,
    Unchanged,
    Changed(Vec<Collection>),
    /// Fetch failed; baseline kept.
    Failed(String),
    /// Detector was torn down while the fetch was in flight.
    Discarded,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ChangeDetector {
    source: Arc<dyn StatusSource>,
    handlers: ChangeHandlers,
    baseline: Mutex<Option<CollectionStatus>>,
    in_flight: AtomicBool,
    torn_down: AtomicBool,
}

impl ChangeDetector {
    pub fn new(source: Arc<dyn StatusSource>, handlers: ChangeHandlers) -> Self {
        Self {
            source,
            handlers,
            baseline: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn baseline(&self) -> Option<CollectionStatus> {
        *self.baseline.lock()
    }

    pub fn is_checking(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// One detection pass.
    pub async fn check(&self) -> TickOutcome {
        if self.is_torn_down() {
            return TickOutcome::Discarded;
        }
        if self.in_flight.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return TickOutcome::Skipped;
        }
        let _slot = InFlight(&self.in_flight);

        let fetched = self.source.fetch_status().await;
        if self.is_torn_down() {
            return TickOutcome::Discarded;
        }
        let status = match fetched {
            Ok(s) => s,
            Err(e) => {
                warn!("data status check failed: {}", e);
                return TickOutcome::Failed(e.to_string());
            }
        };

        let changed = {
            let mut baseline = self.baseline.lock();
            let Some(previous) = baseline.replace(status) else {
                debug!(?status, "data status baseline recorded");
                return TickOutcome::Baseline;
            };
            status.changed_since(&previous)
        };
        if changed.is_empty() {
            return TickOutcome::Unchanged;
        }
        for collection in &changed {
            debug!(%collection, "collection changed");
            self.handlers.fire(*collection);
        }
        TickOutcome::Changed(changed)
    }

    /// Stop firing callbacks; an in-flight check completes but its result is dropped.
    pub fn tear_down(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }

    /// Run the detector on a timer. A disabled config yields a handle with no task.
    pub fn start(source: Arc<dyn StatusSource>, config: DetectorConfig) -> DetectorHandle {
        let detector = Arc::new(ChangeDetector::new(source, config.handlers));
        let (visible, visible_rx) = watch::channel(true);
        let task = config
            .enabled
            .then(|| tokio::spawn(poll_loop(detector.clone(), config.polling_interval, visible_rx)));
        DetectorHandle { detector, visible, task }
    }
}

fn spawn_check(detector: &Arc<ChangeDetector>) {
    let d = detector.clone();
    tokio::spawn(async move {
        let outcome = d.check().await;
        debug!(?outcome, "detector tick");
    });
}

async fn poll_loop(detector: Arc<ChangeDetector>, interval: Duration, mut visible: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if *visible.borrow() {
                    spawn_check(&detector);
                }
            }
            changed = visible.changed() => {
                if changed.is_err() {
                    break;
                }
                // Becoming visible checks right away.
                if *visible.borrow_and_update() {
                    spawn_check(&detector);
                }
            }
        }
        if detector.is_torn_down() {
            break;
        }
    }
}

/// Owner of a running detector. Dropping it tears the detector down.
pub struct DetectorHandle {
    detector: Arc<ChangeDetector>,
    visible: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl DetectorHandle {
    pub fn detector(&self) -> &Arc<ChangeDetector> {
        &self.detector
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Hidden views do not poll; the baseline is kept.
    pub fn set_visible(&self, visible: bool) {
        self.visible.send_if_modified(|v| {
            let changed = *v != visible;
            *v = visible;
            changed
        });
    }

    pub fn shutdown(&mut self) {
        self.detector.tear_down();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SyncError;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Scripted {
        answers: Mutex<VecDeque<SyncResult<CollectionStatus>>>,
        calls: AtomicUsize,
        hold: Option<Arc<Notify>>,
    }

    impl Scripted {
        fn new(answers: Vec<SyncResult<CollectionStatus>>) -> Arc<Self> {
            Arc::new(Self { answers: Mutex::new(answers.into()), ..Default::default() })
        }

        fn held(answers: Vec<SyncResult<CollectionStatus>>, hold: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self { answers: Mutex::new(answers.into()), hold: Some(hold), ..Default::default() })
        }
    }

    #[async_trait]
    impl StatusSource for Scripted {
        async fn fetch_status(&self) -> SyncResult<CollectionStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            let next = self.answers.lock().pop_front();
            next.unwrap_or_else(|| Err(SyncError::Transport("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct Counters {
        weapons: AtomicUsize,
        types: AtomicUsize,
        users: AtomicUsize,
    }

    impl Counters {
        fn snapshot(&self) -> (usize, usize, usize) {
            (self.weapons.load(Ordering::SeqCst), self.types.load(Ordering::SeqCst), self.users.load(Ordering::SeqCst))
        }
    }

    fn counting() -> (Arc<Counters>, ChangeHandlers) {
        let c = Arc::new(Counters::default());
        let (a, b, d) = (c.clone(), c.clone(), c.clone());
        let handlers = ChangeHandlers::new()
            .on_weapons(move || {
                a.weapons.fetch_add(1, Ordering::SeqCst);
            })
            .on_weapon_types(move || {
                b.types.fetch_add(1, Ordering::SeqCst);
            })
            .on_users(move || {
                d.users.fetch_add(1, Ordering::SeqCst);
            });
        (c, handlers)
    }

    fn status(weapons: i64, weapon_types: i64, users: i64) -> CollectionStatus {
        CollectionStatus { weapons, weapon_types, users }
    }

    #[tokio::test]
    async fn first_poll_never_fires() {
        let (counts, handlers) = counting();
        let detector = ChangeDetector::new(Scripted::new(vec![Ok(status(1000, 500, 250))]), handlers);
        assert_eq!(detector.check().await, TickOutcome::Baseline);
        assert_eq!(counts.snapshot(), (0, 0, 0));
        assert_eq!(detector.baseline(), Some(status(1000, 500, 250)));
    }

    #[tokio::test]
    async fn unchanged_statuses_fire_nothing() {
        let (counts, handlers) = counting();
        let detector = ChangeDetector::new(
            Scripted::new(vec![Ok(status(1000, 500, 250)), Ok(status(1000, 500, 250))]),
            handlers,
        );
        detector.check().await;
        assert_eq!(detector.check().await, TickOutcome::Unchanged);
        assert_eq!(counts.snapshot(), (0, 0, 0));
    }

    #[tokio::test]
    async fn one_changed_collection_fires_once() {
        let (counts, handlers) = counting();
        let detector = ChangeDetector::new(
            Scripted::new(vec![Ok(status(1000, 500, 250)), Ok(status(1000, 900, 250))]),
            handlers,
        );
        detector.check().await;
        assert_eq!(detector.check().await, TickOutcome::Changed(vec![Collection::WeaponTypes]));
        assert_eq!(counts.snapshot(), (0, 1, 0));
    }

    #[tokio::test]
    async fn failure_keeps_the_baseline() {
        let (counts, handlers) = counting();
        let detector = ChangeDetector::new(
            Scripted::new(vec![
                Ok(status(1, 1, 1)),
                Err(SyncError::Status { status: 500, message: "db down".into() }),
                Ok(status(2, 1, 3)),
            ]),
            handlers,
        );
        detector.check().await;
        assert!(matches!(detector.check().await, TickOutcome::Failed(_)));
        assert_eq!(detector.baseline(), Some(status(1, 1, 1)));
        assert_eq!(detector.check().await, TickOutcome::Changed(vec![Collection::Weapons, Collection::Users]));
        assert_eq!(counts.snapshot(), (1, 0, 1));
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let hold = Arc::new(Notify::new());
        let source = Scripted::held(vec![Ok(status(1, 1, 1))], hold.clone());
        let (_counts, handlers) = counting();
        let detector = Arc::new(ChangeDetector::new(source.clone(), handlers));

        let first = tokio::spawn({
            let d = detector.clone();
            async move { d.check().await }
        });
        while !detector.is_checking() {
            tokio::task::yield_now().await;
        }
        assert_eq!(detector.check().await, TickOutcome::Skipped);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        hold.notify_one();
        assert_eq!(first.await.unwrap(), TickOutcome::Baseline);
        assert!(!detector.is_checking());
    }

    #[tokio::test]
    async fn teardown_discards_in_flight_result() {
        let hold = Arc::new(Notify::new());
        let source = Scripted::held(vec![Ok(status(1, 1, 1)), Ok(status(2, 2, 2))], hold.clone());
        let (counts, handlers) = counting();
        let detector = Arc::new(ChangeDetector::new(source, handlers));
        hold.notify_one();
        detector.check().await;

        let pending = tokio::spawn({
            let d = detector.clone();
            async move { d.check().await }
        });
        while !detector.is_checking() {
            tokio::task::yield_now().await;
        }
        detector.tear_down();
        hold.notify_one();
        assert_eq!(pending.await.unwrap(), TickOutcome::Discarded);
        assert_eq!(counts.snapshot(), (0, 0, 0));
    }

    #[tokio::test]
    async fn timer_polls_until_shutdown() {
        let answers = (0..200).map(|i| Ok(status(i, 0, 0))).collect();
        let source = Scripted::new(answers);
        let (counts, handlers) = counting();
        let mut handle = ChangeDetector::start(
            source.clone(),
            DetectorConfig { handlers, polling_interval: Duration::from_millis(20), enabled: true },
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(source.calls.load(Ordering::SeqCst) >= 2);
        assert!(counts.snapshot().0 >= 1);

        handle.shutdown();
        assert!(!handle.is_running());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after = source.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn hidden_view_does_not_poll() {
        let source = Scripted::new((0..50).map(|_| Ok(status(1, 1, 1))).collect());
        let (_counts, handlers) = counting();
        let handle = ChangeDetector::start(
            source.clone(),
            DetectorConfig { handlers, polling_interval: Duration::from_millis(20), enabled: true },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.set_visible(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let hidden_at = source.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), hidden_at);

        handle.set_visible(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(source.calls.load(Ordering::SeqCst) > hidden_at);
        assert_eq!(handle.detector().baseline(), Some(status(1, 1, 1)));
    }

    #[tokio::test]
    async fn disabled_detector_never_starts() {
        let source = Scripted::new(vec![]);
        let handle = ChangeDetector::start(source.clone(), DetectorConfig { enabled: false, ..Default::default() });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_running());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
