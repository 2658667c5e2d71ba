use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use crate::bus::EventBus;
use crate::job::{JobProgress, JobStatus, StageId};
use crate::registry::JobRegistry;

/// Minimum improvement in global progress before a new snapshot is written
/// and published. Keeps chatty stages from flooding the bus.
const PUBLISH_HYSTERESIS: f64 = 0.5;

/// Non-terminal reports never reach 100: the terminal transition owns that
/// value, so observers can treat 100 as "done".
const NON_TERMINAL_CAP: f64 = 99.9;

/// Maps stage-local progress into the stage's global band, keeps the global
/// number monotonic, and pushes snapshots to the registry and bus.
///
/// One accountant per job, owned by the pipeline; stage workers only ever
/// see a `StageProgress` handle scoped to their own stage.
pub struct ProgressAccountant {
    registry: JobRegistry,
    bus: EventBus,
    state: Mutex<AccountantState>,
}

struct AccountantState {
    snapshot: JobProgress,
    /// Last value that went out to the registry and bus; the hysteresis
    /// threshold is measured against this, not against every tiny report.
    last_published: f64,
}

impl ProgressAccountant {
    pub fn new(job_id: &str, registry: JobRegistry, bus: EventBus) -> Self {
        Self {
            registry,
            bus,
            state: Mutex::new(AccountantState {
                snapshot: JobProgress::new(job_id),
                last_published: 0.0,
            }),
        }
    }

    /// Transition to `Processing` and persist the initial snapshot.
    pub async fn start(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.snapshot.status = JobStatus::Processing;
            touch(&mut state.snapshot);
            state.snapshot.clone()
        };
        self.registry.write_progress(&snapshot).await;
        self.bus
            .publish_progress(&snapshot.job_id, snapshot.global_progress, None)
            .await;
    }

    /// Handle passed into a stage worker. Keeps the worker unable to report
    /// for any stage but its own.
    pub fn stage(&self, stage: StageId) -> StageProgress<'_> {
        StageProgress {
            accountant: self,
            stage,
        }
    }

    /// Record entry into `stage`: local progress starts at zero.
    pub async fn enter_stage(&self, stage: StageId) {
        let mut state = self.state.lock().await;
        state.snapshot.current_stage = stage;
        state.snapshot.per_stage_progress.insert(stage, 0.0);
        touch(&mut state.snapshot);
    }

    async fn report(&self, stage: StageId, local: f64) {
        let local = local.clamp(0.0, 100.0);
        let (start, end) = stage.band();
        let mapped = (start + (end - start) * local / 100.0).min(NON_TERMINAL_CAP);

        let published = {
            let mut state = self.state.lock().await;
            state.snapshot.per_stage_progress.insert(stage, local);

            // Monotonic: a straggling lower report never moves us backwards.
            let global = mapped.max(state.snapshot.global_progress);
            state.snapshot.global_progress = global;
            touch(&mut state.snapshot);

            let improvement = global - state.last_published;
            if improvement >= PUBLISH_HYSTERESIS || (local >= 100.0 && improvement > 0.0) {
                state.last_published = global;
                Some(state.snapshot.clone())
            } else {
                None
            }
        };

        if let Some(snapshot) = published {
            self.registry.write_progress(&snapshot).await;
            self.bus
                .publish_progress(
                    &snapshot.job_id,
                    snapshot.global_progress,
                    Some(stage.as_str()),
                )
                .await;
        }
    }

    /// Terminal success: everything at 100, status `Completed`.
    pub async fn complete(&self) -> JobProgress {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.snapshot.status = JobStatus::Completed;
            state.snapshot.global_progress = 100.0;
            for stage in StageId::ALL {
                state.snapshot.per_stage_progress.insert(stage, 100.0);
            }
            touch(&mut state.snapshot);
            state.last_published = 100.0;
            state.snapshot.clone()
        };
        self.registry.write_progress(&snapshot).await;
        self.bus
            .publish_progress(&snapshot.job_id, 100.0, None)
            .await;
        snapshot
    }

    /// Terminal failure: progress freezes where it was.
    pub async fn fail(&self, error: &str) -> JobProgress {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.snapshot.status = JobStatus::Failed;
            state.snapshot.error = Some(error.to_owned());
            touch(&mut state.snapshot);
            state.snapshot.clone()
        };
        self.registry.write_progress(&snapshot).await;
        snapshot
    }

    /// Terminal cancellation. Nothing is published; the snapshot records
    /// the state for status queries.
    pub async fn cancel(&self) -> JobProgress {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.snapshot.status = JobStatus::Cancelled;
            touch(&mut state.snapshot);
            state.snapshot.clone()
        };
        self.registry.write_progress(&snapshot).await;
        snapshot
    }

    pub async fn snapshot(&self) -> JobProgress {
        self.state.lock().await.snapshot.clone()
    }
}

/// `updated_at` must strictly increase even when the clock doesn't.
fn touch(state: &mut JobProgress) {
    let now = Utc::now();
    state.updated_at = if now > state.updated_at {
        now
    } else {
        state.updated_at + ChronoDuration::milliseconds(1)
    };
}

/// The reporting half of the stage worker contract.
pub struct StageProgress<'a> {
    accountant: &'a ProgressAccountant,
    stage: StageId,
}

impl StageProgress<'_> {
    /// Report stage-local progress in [0, 100]. Reports are monotonic at
    /// the global level; out-of-order calls are clamped, not rejected.
    pub async fn report(&self, local: f64) {
        self.accountant.report(self.stage, local).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusChannels;
    use crate::registry::RegistryConfig;
    use docflow_common::kv::MockKvClient;
    use std::sync::Arc;

    fn accountant(kv: &MockKvClient) -> ProgressAccountant {
        let registry = JobRegistry::new(Arc::new(kv.clone()), RegistryConfig::default());
        let bus = EventBus::new(Arc::new(kv.clone()), BusChannels::default());
        ProgressAccountant::new("j1", registry, bus)
    }

    fn published_values(kv: &MockKvClient) -> Vec<f64> {
        kv.published_on("progress-channel")
            .iter()
            .map(|m| {
                serde_json::from_str::<serde_json::Value>(m).unwrap()["progress"]
                    .as_f64()
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn local_progress_maps_into_stage_band() {
        let kv = MockKvClient::new();
        let acct = accountant(&kv);

        acct.enter_stage(StageId::Transformation).await;
        acct.stage(StageId::Transformation).report(50.0).await;

        // TRANSFORMATION owns 25..60, so 50% local is 42.5 global.
        let snapshot = acct.snapshot().await;
        assert_eq!(snapshot.global_progress, 42.5);
        assert_eq!(
            snapshot.per_stage_progress.get(&StageId::Transformation),
            Some(&50.0)
        );
    }

    #[tokio::test]
    async fn global_progress_is_monotonic() {
        let kv = MockKvClient::new();
        let acct = accountant(&kv);

        acct.stage(StageId::Transformation).report(80.0).await;
        let high = acct.snapshot().await.global_progress;

        // A stale lower report can't move the number backwards.
        acct.stage(StageId::Transformation).report(10.0).await;
        assert_eq!(acct.snapshot().await.global_progress, high);

        let values = published_values(&kv);
        for pair in values.windows(2) {
            assert!(pair[1] >= pair[0], "{values:?}");
        }
    }

    #[tokio::test]
    async fn hysteresis_suppresses_noise() {
        let kv = MockKvClient::new();
        let acct = accountant(&kv);

        // INITIALIZATION's band is 5 points wide; 1% local steps move the
        // global needle by 0.05, far below the publish threshold.
        for i in 1..=20 {
            acct.stage(StageId::Initialization).report(f64::from(i)).await;
        }

        assert!(published_values(&kv).len() <= 2);
    }

    #[tokio::test]
    async fn stage_completion_always_publishes() {
        let kv = MockKvClient::new();
        let acct = accountant(&kv);

        acct.stage(StageId::Initialization).report(99.0).await;
        let before = published_values(&kv).len();
        acct.stage(StageId::Initialization).report(100.0).await;
        assert_eq!(published_values(&kv).len(), before + 1);
    }

    #[tokio::test]
    async fn terminal_complete_is_the_only_path_to_100() {
        let kv = MockKvClient::new();
        let acct = accountant(&kv);

        acct.stage(StageId::Notification).report(100.0).await;
        assert!(acct.snapshot().await.global_progress < 100.0);

        let snapshot = acct.complete().await;
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.global_progress, 100.0);
        assert_eq!(published_values(&kv).last(), Some(&100.0));
    }

    #[tokio::test]
    async fn cancel_publishes_nothing() {
        let kv = MockKvClient::new();
        let acct = accountant(&kv);

        let before = published_values(&kv).len();
        let snapshot = acct.cancel().await;

        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert_eq!(published_values(&kv).len(), before);
    }

    #[tokio::test]
    async fn updated_at_strictly_increases() {
        let kv = MockKvClient::new();
        let acct = accountant(&kv);

        acct.stage(StageId::Initialization).report(50.0).await;
        let first = acct.snapshot().await.updated_at;
        acct.stage(StageId::Initialization).report(51.0).await;
        let second = acct.snapshot().await.updated_at;

        assert!(second > first);
    }
}
