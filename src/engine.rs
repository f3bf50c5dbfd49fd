//! Deadline engine — the single timer that notices late canaries.
//!
//! One background task owns the timer. It parks on
//! `tokio::time::sleep_until` until the soonest persisted deadline, wakes,
//! marks every elapsed canary late (in deadline order), notifies, and
//! rearms on the next future deadline. Lifecycle operations ask for a
//! rearm through [`EngineHandle`] after every store commit.
//!
//! The timer is refreshed on every rearm even when the target instant has
//! not changed; only the log line is deduplicated. A rearm is cheap, and a
//! lost wakeup would otherwise leave a late canary unnoticed.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{NaiveDateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::notify::{Notifier, NotifyKind};
use crate::store::{Canary, CanaryPatch, Store};

/// Delay before retrying after a failed deadline query.
const STORE_RETRY: StdDuration = StdDuration::from_secs(1);

enum EngineCommand {
    Rearm,
}

/// Cheap, cloneable handle for requesting a rearm.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Ask the engine to re-evaluate the soonest deadline. Never blocks:
    /// a full queue already implies a pending rearm, and a closed channel
    /// means no engine is running in this process mode.
    pub fn rearm(&self) {
        match self.tx.try_send(EngineCommand::Rearm) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => debug!("deadline engine not running, rearm ignored"),
        }
    }

    /// A handle wired to nothing — used in web-only mode where the engine
    /// task is not started.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

pub struct DeadlineEngine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    shutdown: CancellationToken,
    /// Deadline instant the timer is currently set for.
    armed_for: Option<NaiveDateTime>,
    /// Monotonic wakeup target; `None` parks the task until a command.
    timer: Option<Instant>,
}

impl DeadlineEngine {
    /// Start the engine task. The timer is armed immediately from whatever
    /// deadlines are already persisted.
    pub fn spawn(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> EngineHandle {
        let (tx, cmd_rx) = mpsc::channel(16);
        let engine = Self {
            store,
            notifier,
            cmd_rx,
            shutdown,
            armed_for: None,
            timer: None,
        };
        tokio::spawn(engine.run());
        EngineHandle { tx }
    }

    async fn run(mut self) {
        info!("deadline engine running");
        self.rearm();

        loop {
            let timer = self.timer;

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("deadline engine shutting down");
                    break;
                }

                Some(cmd) = self.cmd_rx.recv() => {
                    match cmd {
                        EngineCommand::Rearm => self.rearm(),
                    }
                }

                _ = wait_until(timer) => {
                    self.on_fire();
                }
            }
        }
    }

    /// Point the timer at the soonest upcoming deadline, or cancel it when
    /// there is none.
    fn rearm(&mut self) {
        let upcoming = match self.store.upcoming_deadlines() {
            Ok(upcoming) => upcoming,
            Err(e) => {
                error!(error = %e, "cannot query upcoming deadlines, will retry");
                self.timer = Some(Instant::now() + STORE_RETRY);
                return;
            }
        };

        for canary in upcoming {
            let Some(deadline) = canary.deadline else {
                warn!(canary = %canary.id, "unpaused canary without a deadline, skipping");
                continue;
            };
            self.arm_for(&canary, deadline);
            return;
        }

        self.timer = None;
        self.armed_for = None;
    }

    fn arm_for(&mut self, canary: &Canary, deadline: NaiveDateTime) {
        let now = Utc::now().naive_utc();
        let wait = (deadline - now)
            .to_std()
            .unwrap_or(StdDuration::ZERO)
            .max(StdDuration::from_secs(1));
        self.timer = Some(Instant::now() + wait);

        // The timer itself was refreshed above regardless; only skip the
        // repeat log noise when the target is unchanged.
        if self.armed_for != Some(deadline) {
            info!(
                canary = %canary.id,
                name = %canary.name,
                %deadline,
                "deadline timer armed"
            );
            self.armed_for = Some(deadline);
        }
    }

    /// Mark every elapsed canary late in ascending deadline order, then
    /// rearm on the first future deadline.
    fn on_fire(&mut self) {
        self.timer = None;
        self.armed_for = None;
        let now = Utc::now().naive_utc();

        let upcoming = match self.store.upcoming_deadlines() {
            Ok(upcoming) => upcoming,
            Err(e) => {
                error!(error = %e, "cannot query deadlines on timer fire, will retry");
                self.timer = Some(Instant::now() + STORE_RETRY);
                return;
            }
        };

        for canary in upcoming {
            let Some(deadline) = canary.deadline else {
                warn!(canary = %canary.id, "unpaused canary without a deadline, skipping");
                continue;
            };

            if deadline > now {
                self.arm_for(&canary, deadline);
                return;
            }

            let patch = CanaryPatch { late: Some(true), ..Default::default() };
            if let Err(e) = self.store.update(&canary.id, &patch) {
                error!(canary = %canary.id, error = %e, "cannot mark canary late");
                continue;
            }
            info!(canary = %canary.id, name = %canary.name, %deadline, "canary is late");

            let mut late_canary = canary;
            late_canary.late = true;
            self.notifier.notify(&late_canary, NotifyKind::Late);
        }
    }
}

async fn wait_until(target: Option<Instant>) {
    match target {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::tests_support::canary;
    use chrono::Duration;
    use std::sync::Mutex;

    struct RecordingNotifier {
        events: Mutex<Vec<(String, NotifyKind)>>,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self { events: Mutex::new(Vec::new()) }
        }

        fn ids(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, canary: &Canary, kind: NotifyKind) {
            self.events.lock().unwrap().push((canary.id.clone(), kind));
        }
    }

    #[tokio::test]
    async fn elapsed_canaries_go_late_in_deadline_order() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let now = Utc::now().naive_utc();

        // Both already elapsed; the second elapsed first.
        store.create(&canary("aaaaaaaa", "second", now - Duration::seconds(2))).unwrap();
        store.create(&canary("bbbbbbbb", "first", now - Duration::seconds(5))).unwrap();

        let shutdown = CancellationToken::new();
        let _handle = DeadlineEngine::spawn(store.clone(), notifier.clone(), shutdown.clone());

        // Elapsed deadlines still honor the 1-second minimum arm.
        tokio::time::sleep(StdDuration::from_millis(1500)).await;
        shutdown.cancel();

        assert!(store.get("aaaaaaaa").unwrap().late);
        assert!(store.get("bbbbbbbb").unwrap().late);
        assert_eq!(notifier.ids(), vec!["bbbbbbbb", "aaaaaaaa"]);
    }

    #[tokio::test]
    async fn future_deadline_is_not_marked_late() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let now = Utc::now().naive_utc();

        store.create(&canary("aaaaaaaa", "soon", now - Duration::seconds(3))).unwrap();
        store.create(&canary("bbbbbbbb", "later", now + Duration::seconds(3600))).unwrap();

        let shutdown = CancellationToken::new();
        let _handle = DeadlineEngine::spawn(store.clone(), notifier.clone(), shutdown.clone());
        tokio::time::sleep(StdDuration::from_millis(1500)).await;
        shutdown.cancel();

        assert!(store.get("aaaaaaaa").unwrap().late);
        assert!(!store.get("bbbbbbbb").unwrap().late);
        assert_eq!(notifier.ids(), vec!["aaaaaaaa"]);
    }

    #[tokio::test]
    async fn rearm_notices_newly_created_canary() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let shutdown = CancellationToken::new();
        let handle = DeadlineEngine::spawn(store.clone(), notifier.clone(), shutdown.clone());

        // Nothing to watch yet; the engine parks.
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        let now = Utc::now().naive_utc();
        store.create(&canary("aaaaaaaa", "quickie", now + Duration::milliseconds(200))).unwrap();
        handle.rearm();

        tokio::time::sleep(StdDuration::from_millis(1500)).await;
        shutdown.cancel();

        assert!(store.get("aaaaaaaa").unwrap().late);
        assert_eq!(notifier.ids(), vec!["aaaaaaaa"]);
    }

    #[tokio::test]
    async fn disconnected_handle_is_a_no_op() {
        let handle = EngineHandle::disconnected();
        handle.rearm();
        handle.rearm();
    }
}
