use std::time::Duration;

use beacon_lifecycle::ServerState;
use chrono::{DateTime, Utc};

use crate::controller::{LifecycleController, Outcome, SequenceGuard};
use crate::maintenance::MaintenanceScheduler;

/// A sequence a tick decided to run. It already holds the sequence slot, so
/// nothing else can start one between the decision and the run.
pub enum PendingSequence {
    AutoStop { guard: SequenceGuard, idle_minutes: i64 },
    Maintenance { guard: SequenceGuard },
}

impl PendingSequence {
    pub fn name(&self) -> &'static str {
        match self {
            PendingSequence::AutoStop { .. } => "auto_stop",
            PendingSequence::Maintenance { .. } => "maintenance",
        }
    }

    pub async fn run(self, controller: &LifecycleController) -> Outcome {
        match self {
            PendingSequence::AutoStop {
                guard,
                idle_minutes,
            } => controller.auto_stop(guard, idle_minutes).await,
            PendingSequence::Maintenance { guard } => {
                controller.maintenance_sequence(guard, None).await
            }
        }
    }
}

/// Fixed-interval driver: polls the cloud and the game server, feeds the idle
/// tracker and the maintenance window, and hands sequences to the controller.
#[derive(Clone)]
pub struct Reconciler {
    controller: LifecycleController,
    scheduler: MaintenanceScheduler,
    interval: Duration,
}

impl Reconciler {
    pub fn new(controller: LifecycleController, scheduler: MaintenanceScheduler, interval: Duration) -> Self {
        Self {
            controller,
            scheduler,
            interval,
        }
    }

    /// Ticks never overlap: the next one waits for the current tick's polling,
    /// and missed ticks are skipped. Sequences run in their own task so a long
    /// stop does not hold up the schedule.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(interval_secs = self.interval.as_secs(), "reconciler started");
            loop {
                ticker.tick().await;
                if let Some(pending) = self.tick().await {
                    let controller = self.controller.clone();
                    tokio::spawn(async move {
                        let name = pending.name();
                        let outcome = pending.run(&controller).await;
                        tracing::info!(sequence = name, outcome = outcome.code(), "scheduled sequence finished");
                    });
                }
            }
        })
    }

    pub async fn tick(&self) -> Option<PendingSequence> {
        self.tick_at(self.controller.now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> Option<PendingSequence> {
        match self.controller.describe().await {
            Ok(info) => self.controller.observe_cloud(&info).await,
            Err(err) => {
                tracing::warn!(%err, "reconcile: describe failed");
                return None;
            }
        }

        let window = self.scheduler.window_at(now);
        if window.just_closed && self.controller.maintenance_done().await {
            tracing::debug!("maintenance window closed; re-armed");
            self.controller.set_maintenance_done(false).await;
        }

        if self.controller.state().await != ServerState::Running {
            if window.open && !self.controller.maintenance_done().await {
                tracing::info!("maintenance window opened while not running; skipping today");
                self.controller.set_maintenance_done(true).await;
            }
            return None;
        }

        let participants = match self.controller.query_stats().await {
            Ok(stats) => Some(stats.participant_count),
            Err(err) => {
                tracing::warn!(%err, "reconcile: stats query failed");
                None
            }
        };
        let check = self.controller.record_stats(participants, now).await?;

        if check.timed_out {
            let guard = self.controller.try_begin()?;
            tracing::info!(idle_minutes = check.idle_minutes, "idle timeout reached");
            return Some(PendingSequence::AutoStop {
                guard,
                idle_minutes: check.idle_minutes,
            });
        }

        if window.open && !self.controller.maintenance_done().await {
            // Busy: leave the flag unset and try again next tick.
            let guard = self.controller.try_begin()?;
            self.controller.set_maintenance_done(true).await;
            tracing::info!(hour = self.scheduler.hour(), "maintenance window opened");
            return Some(PendingSequence::Maintenance { guard });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Zone;
    use crate::testing::{FakeCloud, FakeLauncher, Harness, noon};
    use beacon_lifecycle::CloudState;
    use chrono::{FixedOffset, TimeZone};

    fn reconciler(h: &Harness) -> Reconciler {
        let utc = Zone::Fixed(FixedOffset::east_opt(0).unwrap());
        Reconciler::new(
            h.controller.clone(),
            MaintenanceScheduler::new(4, utc),
            Duration::from_secs(60),
        )
    }

    fn minutes(m: i64) -> DateTime<Utc> {
        noon() + chrono::Duration::minutes(m)
    }

    fn hour(h: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, h, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn sixth_empty_tick_stops_server() {
        let h = Harness::running().await;
        let r = reconciler(&h);

        for m in 0..5 {
            assert!(r.tick_at(minutes(m)).await.is_none(), "minute {m}");
        }
        let pending = r.tick_at(minutes(5)).await.expect("idle timeout");
        assert!(matches!(
            pending,
            PendingSequence::AutoStop { idle_minutes: 5, .. }
        ));

        assert_eq!(pending.run(&h.controller).await, Outcome::Stopped);
        assert_eq!(h.controller.state().await, ServerState::Stopped);
        assert_eq!(h.cloud.stops(), 1);
        assert!(h.notifier.any_contains("Nobody has been online for 5 minutes"));

        // A stopped server yields nothing further.
        assert!(r.tick_at(minutes(6)).await.is_none());
    }

    #[tokio::test]
    async fn participant_restarts_idle_episode() {
        let h = Harness::running().await;
        let r = reconciler(&h);

        for m in 0..3 {
            assert!(r.tick_at(minutes(m)).await.is_none());
        }
        h.stats.set(Some(2));
        assert!(r.tick_at(minutes(3)).await.is_none());
        h.stats.set(Some(0));
        for m in 4..9 {
            assert!(r.tick_at(minutes(m)).await.is_none(), "minute {m}");
        }
        assert!(r.tick_at(minutes(9)).await.is_some());
    }

    #[tokio::test]
    async fn failed_query_never_counts_as_idle() {
        let h = Harness::running().await;
        h.stats.set(None);
        let r = reconciler(&h);

        for m in 0..10 {
            assert!(r.tick_at(minutes(m)).await.is_none());
        }
        assert!(h.controller.snapshot().await.idle.idle_since().is_none());
    }

    #[tokio::test]
    async fn maintenance_runs_once_per_window() {
        let h = Harness::running().await;
        h.stats.set(Some(1));
        let r = reconciler(&h);

        let pending = r.tick_at(hour(4, 0)).await.expect("window open");
        assert!(matches!(pending, PendingSequence::Maintenance { .. }));
        assert!(h.controller.maintenance_done().await);
        assert_eq!(pending.run(&h.controller).await, Outcome::Restarted);

        assert!(r.tick_at(hour(4, 1)).await.is_none());
        assert_eq!(h.launcher.launches(), 1);

        assert!(r.tick_at(hour(5, 0)).await.is_none());
        assert!(!h.controller.maintenance_done().await);
    }

    #[tokio::test]
    async fn window_opening_while_stopped_still_marks_done() {
        let h = Harness::stopped().await;
        let r = reconciler(&h);

        assert!(r.tick_at(hour(4, 0)).await.is_none());
        assert!(h.controller.maintenance_done().await);

        // Started mid-window: no restart until tomorrow.
        h.controller.request_start(None).await;
        h.stats.set(Some(1));
        assert!(r.tick_at(hour(4, 30)).await.is_none());
        assert_eq!(h.console.stops(), 0);
    }

    #[tokio::test]
    async fn busy_controller_defers_maintenance() {
        let h = Harness::running().await;
        h.stats.set(Some(1));
        let r = reconciler(&h);

        let guard = h.controller.try_begin().unwrap();
        assert!(r.tick_at(hour(4, 0)).await.is_none());
        assert!(!h.controller.maintenance_done().await);
        drop(guard);

        assert!(r.tick_at(hour(4, 1)).await.is_some());
    }

    #[tokio::test]
    async fn adopts_instance_stopped_out_of_band() {
        let h = Harness::running().await;
        let r = reconciler(&h);

        h.cloud.set_state(CloudState::Stopped);
        assert!(r.tick_at(minutes(0)).await.is_none());
        assert_eq!(h.controller.state().await, ServerState::Stopped);
        assert_eq!(h.cloud.stops(), 0);
    }

    #[tokio::test]
    async fn describe_failure_is_harmless() {
        let h = Harness::running().await;
        let r = reconciler(&h);

        *h.cloud.fail_describe.lock().unwrap() = true;
        for m in 0..10 {
            assert!(r.tick_at(minutes(m)).await.is_none());
        }
        assert_eq!(h.controller.state().await, ServerState::Running);
    }

    #[tokio::test]
    async fn tick_recovers_abandoned_start() {
        let launcher = FakeLauncher::emitting(&["Loading libraries"], true);
        let h = Harness::new(FakeCloud::with_state(CloudState::Stopped), launcher).await;
        let r = reconciler(&h);
        let _ = tokio::time::timeout(Duration::from_millis(50), h.controller.request_start(None)).await;
        assert_eq!(h.controller.state().await, ServerState::Starting);

        assert!(r.tick_at(minutes(0)).await.is_none());
        assert_eq!(h.controller.state().await, ServerState::Running);

        // Back under idle supervision: the adopted instance is reclaimed.
        for m in 1..5 {
            assert!(r.tick_at(minutes(m)).await.is_none(), "minute {m}");
        }
        assert!(matches!(
            r.tick_at(minutes(5)).await,
            Some(PendingSequence::AutoStop { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_runs_sequences_off_the_ticker() {
        let h = Harness::running().await;
        let handle = reconciler(&h).spawn();

        // First tick fires immediately and opens the idle episode.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.controller.snapshot().await.idle.idle_since().is_some());

        h.clock.set(minutes(5));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.controller.state().await, ServerState::Stopped);
        assert_eq!(h.cloud.stops(), 1);
        assert!(h.notifier.any_contains("Nobody has been online for 5 minutes"));

        // Later ticks see a stopped server and leave it alone.
        h.clock.set(minutes(20));
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(h.cloud.stops(), 1);
        assert!(!handle.is_finished());
        handle.abort();
    }
}
