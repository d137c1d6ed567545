//! Time-driven backups: an explicit `idle → running → idle` machine
//! driven by a coarse tick, with the clock injected so `next_run_at`
//! computation is testable without real time passing.

use crate::error::EngineError;
use crate::models::schedule;
use crate::services::{retention, snapshot};
use crate::state::AppState;
use chrono::{DateTime, Duration, Months, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// First run strictly after `after` for the given cadence. The time of
/// day anchors every occurrence; daily advances one day, weekly seven,
/// monthly one calendar month.
pub fn compute_next_run(
    frequency: &str,
    time_of_day: &str,
    after: DateTime<Utc>,
) -> anyhow::Result<DateTime<Utc>> {
    let tod = NaiveTime::parse_from_str(time_of_day, "%H:%M")
        .map_err(|e| anyhow::anyhow!("invalid time_of_day '{time_of_day}': {e}"))?;

    let candidate = Utc.from_utc_datetime(&after.date_naive().and_time(tod));
    if candidate > after {
        return Ok(candidate);
    }
    match frequency {
        "daily" => Ok(candidate + Duration::days(1)),
        "weekly" => Ok(candidate + Duration::days(7)),
        "monthly" => candidate
            .checked_add_months(Months::new(1))
            .ok_or_else(|| anyhow::anyhow!("next monthly run out of range")),
        other => anyhow::bail!("invalid frequency '{other}'"),
    }
}

/// What a single tick did: the machine's observable transition.
#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// `next_run_at` lies in the future.
    NotDue,
    /// `next_run_at` was unset (first boot or reschedule); computed and
    /// persisted, no backup run.
    Rescheduled,
    /// A manual backup or restore holds the engine; try again next tick.
    Deferred,
    /// Ran the scheduled backup and retention sweep.
    Ran,
}

pub struct Scheduler {
    state: Arc<AppState>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>, clock: Arc<dyn Clock>) -> Self {
        Self { state, clock }
    }

    /// Periodic driver; stops when the shutdown token fires.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let cancel: CancellationToken = self.state.shutdown.clone();
        let tick = std::time::Duration::from_secs(self.state.config.scheduler_tick_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel.cancelled() => {
                        tracing::info!("[Scheduler] Shutting down");
                        return;
                    }
                }
                if let Err(e) = self.tick().await {
                    tracing::error!(error = %e, "[Scheduler] Tick failed");
                }
            }
        })
    }

    pub async fn tick(&self) -> anyhow::Result<TickOutcome> {
        let db = self.state.db.clone();
        let cfg = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            schedule::get(&conn)
        })
        .await??;

        let now = self.clock.now();
        let next = cfg
            .next_run_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        let Some(next) = next else {
            let next = compute_next_run(&cfg.frequency, &cfg.time_of_day, now)?;
            self.persist_next_run(next).await?;
            tracing::info!(next_run_at = %next.to_rfc3339(), "[Scheduler] Schedule armed");
            return Ok(TickOutcome::Rescheduled);
        };

        if now < next {
            return Ok(TickOutcome::NotDue);
        }

        // idle → running
        tracing::info!("[Scheduler] Starting scheduled backup");
        match snapshot::create_backup(
            self.state.clone(),
            None,
            None,
            "scheduled",
            self.state.shutdown.clone(),
        )
        .await
        {
            Ok(descriptor) => {
                tracing::info!(backup_id = %descriptor.id, "[Scheduler] Scheduled backup complete");
            }
            Err(EngineError::Busy) => {
                // A manual operation holds the engine; do not queue
                // behind it, just come back on the next tick.
                tracing::info!("[Scheduler] Engine busy, deferring scheduled backup");
                return Ok(TickOutcome::Deferred);
            }
            Err(e) => {
                // No retries here: the failed run is recorded in the
                // catalog and the slot moves to the next occurrence.
                tracing::error!(error = %e, "[Scheduler] Scheduled backup failed");
            }
        }

        match retention::sweep(&self.state).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(deleted = n, "[Scheduler] Retention sweep done"),
            Err(e) => tracing::error!(error = %e, "[Scheduler] Retention sweep failed"),
        }

        // running → idle
        let next = compute_next_run(&cfg.frequency, &cfg.time_of_day, self.clock.now())?;
        self.persist_next_run(next).await?;
        Ok(TickOutcome::Ran)
    }

    async fn persist_next_run(&self, next: DateTime<Utc>) -> anyhow::Result<()> {
        let db = self.state.db.clone();
        let when = next.to_rfc3339();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            schedule::set_next_run_at(&conn, &when)
        })
        .await??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn daily_next_run_lands_on_today_or_tomorrow() {
        let next = compute_next_run("daily", "02:00", at("2026-08-06T01:00:00Z")).unwrap();
        assert_eq!(next, at("2026-08-06T02:00:00Z"));

        let next = compute_next_run("daily", "02:00", at("2026-08-06T02:00:00Z")).unwrap();
        assert_eq!(next, at("2026-08-07T02:00:00Z"));
    }

    #[test]
    fn weekly_advances_seven_days_after_a_run() {
        let next = compute_next_run("weekly", "03:30", at("2026-08-06T03:30:00Z")).unwrap();
        assert_eq!(next, at("2026-08-13T03:30:00Z"));
    }

    #[test]
    fn monthly_handles_month_length_and_year_boundaries() {
        let next = compute_next_run("monthly", "02:00", at("2026-01-31T02:00:00Z")).unwrap();
        assert_eq!(next, at("2026-02-28T02:00:00Z"));

        let next = compute_next_run("monthly", "23:00", at("2026-12-15T23:00:00Z")).unwrap();
        assert_eq!(next, at("2027-01-15T23:00:00Z"));
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(compute_next_run("hourly", "02:00", Utc::now()).is_err());
        assert!(compute_next_run("daily", "25:99", Utc::now()).is_err());
    }

    mod machine {
        use crate::models::descriptor::{self, ListFilter};
        use crate::models::schedule;
        use crate::services::scheduler::{Clock, Scheduler, TickOutcome};
        use crate::test_support::engine_with_sources;
        use chrono::{DateTime, Utc};
        use std::sync::{Arc, Mutex};

        struct MockClock {
            now: Mutex<DateTime<Utc>>,
        }

        impl MockClock {
            fn at(s: &str) -> Arc<Self> {
                Arc::new(Self {
                    now: Mutex::new(super::at(s)),
                })
            }
            fn advance_to(&self, s: &str) {
                *self.now.lock().unwrap() = super::at(s);
            }
        }

        impl Clock for MockClock {
            fn now(&self) -> DateTime<Utc> {
                *self.now.lock().unwrap()
            }
        }

        #[tokio::test]
        async fn first_tick_arms_the_schedule_without_running() {
            let h = engine_with_sources(1).await;
            let clock = MockClock::at("2026-08-06T01:00:00Z");
            let scheduler = Scheduler::new(h.state.clone(), clock.clone());

            assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Rescheduled);

            let conn = h.state.db.get().unwrap();
            let cfg = schedule::get(&conn).unwrap();
            // Default cadence is daily at 02:00.
            assert_eq!(cfg.next_run_at.as_deref(), Some("2026-08-06T02:00:00+00:00"));
        }

        #[tokio::test]
        async fn due_tick_runs_a_scheduled_backup_and_advances_next_run() {
            let h = engine_with_sources(1).await;
            let clock = MockClock::at("2026-08-06T01:00:00Z");
            let scheduler = Scheduler::new(h.state.clone(), clock.clone());

            scheduler.tick().await.unwrap();
            assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::NotDue);

            clock.advance_to("2026-08-06T02:00:05Z");
            assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Ran);

            let conn = h.state.db.get().unwrap();
            let backups = descriptor::list(&conn, &ListFilter::default()).unwrap();
            assert_eq!(backups.len(), 1);
            assert_eq!(backups[0].kind, "scheduled");
            assert_eq!(backups[0].status, "complete");
            assert!(backups[0].created_by.is_none(), "scheduled runs have no actor");

            let cfg = schedule::get(&conn).unwrap();
            assert_eq!(cfg.next_run_at.as_deref(), Some("2026-08-07T02:00:00+00:00"));
        }

        #[tokio::test]
        async fn due_tick_defers_while_a_manual_operation_holds_the_engine() {
            let h = engine_with_sources(1).await;
            let clock = MockClock::at("2026-08-06T01:00:00Z");
            let scheduler = Scheduler::new(h.state.clone(), clock.clone());
            scheduler.tick().await.unwrap();
            clock.advance_to("2026-08-06T02:00:05Z");

            let guard = h.state.try_begin_operation().unwrap();
            assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Deferred);
            // Deferral leaves next_run_at untouched so the next tick
            // retries instead of skipping a cadence slot.
            {
                let conn = h.state.db.get().unwrap();
                let cfg = schedule::get(&conn).unwrap();
                assert_eq!(cfg.next_run_at.as_deref(), Some("2026-08-06T02:00:00+00:00"));
            }

            drop(guard);
            assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Ran);
        }

        #[tokio::test]
        async fn reschedule_rearms_from_the_new_cadence() {
            let h = engine_with_sources(1).await;
            let clock = MockClock::at("2026-08-06T01:00:00Z");
            let scheduler = Scheduler::new(h.state.clone(), clock.clone());
            scheduler.tick().await.unwrap();

            {
                let conn = h.state.db.get().unwrap();
                schedule::set(&conn, "weekly", "05:15", 7).unwrap();
            }
            assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Rescheduled);

            let conn = h.state.db.get().unwrap();
            let cfg = schedule::get(&conn).unwrap();
            assert_eq!(cfg.next_run_at.as_deref(), Some("2026-08-06T05:15:00+00:00"));
        }
    }
}
