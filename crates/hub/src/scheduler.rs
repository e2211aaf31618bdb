//! Job scheduler: owns the mapping from active schedule records to live
//! timer tasks and keeps it in step with the schedule store.
//!
//! Every change goes through [`JobScheduler::reconcile`], a full
//! cancel-and-rebuild pass:
//!
//! ```text
//! cancel all live jobs ─▶ purge expired one-shots ─▶ load active records
//!        ─▶ build one job per valid record (skip + warn the rest)
//!        ─▶ install the new job map
//! ```
//!
//! The job map's mutex is held for the whole pass, so passes never overlap.
//! A job fires by spawning a detached execution: `WATER_ON` on the control
//! topic, wait `duration`, `WATER_OFF`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use irrigation_proto::{Channel, Clock, Command, TOPIC_CONTROL};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::ScheduleStore;
use crate::error::{SchedulerError, StoreError};
use crate::schedule::{NewSchedule, Plan, ScheduleStatus, ScheduleType};
use crate::state::SharedState;
use crate::trigger::Trigger;

// ---------------------------------------------------------------------------
// Live jobs
// ---------------------------------------------------------------------------

struct JobHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

enum Job {
    OneShot(JobHandle),
    Recurring(JobHandle),
}

impl Job {
    fn handle(&self) -> &JobHandle {
        match self {
            Self::OneShot(h) | Self::Recurring(h) => h,
        }
    }

    fn cancel(&self) {
        let h = self.handle();
        h.token.cancel();
        h.task.abort();
    }

    fn is_live(&self) -> bool {
        !self.handle().task.is_finished()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Inner {
    store: Arc<dyn ScheduleStore>,
    channel: Arc<dyn Channel>,
    clock: Arc<dyn Clock>,
    tz: FixedOffset,
    jobs: Mutex<HashMap<i64, Job>>,
    /// Set when the last reconcile pass failed on the store.
    dirty: AtomicBool,
    shutdown: CancellationToken,
    events: Option<SharedState>,
}

/// Cheap to clone; every clone drives the same job map.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        channel: Arc<dyn Channel>,
        clock: Arc<dyn Clock>,
        tz: FixedOffset,
    ) -> Self {
        Self::build(store, channel, clock, tz, None)
    }

    /// Like [`JobScheduler::new`], also recording schedule activity in the
    /// status snapshot.
    pub fn with_events(
        store: Arc<dyn ScheduleStore>,
        channel: Arc<dyn Channel>,
        clock: Arc<dyn Clock>,
        tz: FixedOffset,
        events: SharedState,
    ) -> Self {
        Self::build(store, channel, clock, tz, Some(events))
    }

    fn build(
        store: Arc<dyn ScheduleStore>,
        channel: Arc<dyn Channel>,
        clock: Arc<dyn Clock>,
        tz: FixedOffset,
        events: Option<SharedState>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                channel,
                clock,
                tz,
                jobs: Mutex::new(HashMap::new()),
                dirty: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                events,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.inner.store
    }

    /// Current wall-clock time in the scheduler's offset.
    pub fn now_local(&self) -> NaiveDateTime {
        self.inner
            .clock
            .now()
            .with_timezone(&self.inner.tz)
            .naive_local()
    }

    /// Ids of jobs that can still fire, ascending.
    pub async fn live_jobs(&self) -> Vec<i64> {
        let jobs = self.inner.jobs.lock().await;
        let mut ids: Vec<i64> = jobs
            .iter()
            .filter(|(_, job)| job.is_live())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    // ----------------------------
    // Reconciliation
    // ----------------------------

    /// Rebuild the live job set from the store.  Returns the number of
    /// jobs installed.
    ///
    /// On a store error the previous jobs stay cancelled, the map is left
    /// empty and the scheduler is marked dirty for [`Self::run_resync`].
    pub async fn reconcile(&self) -> Result<usize, StoreError> {
        let inner = &self.inner;
        let mut jobs = inner.jobs.lock().await;

        for (_, job) in jobs.drain() {
            job.cancel();
        }

        if inner.shutdown.is_cancelled() {
            return Ok(0);
        }

        let now = inner.clock.now();
        let now_local = now.with_timezone(&inner.tz).naive_local();

        let records = match self.load(now_local).await {
            Ok(r) => r,
            Err(e) => {
                inner.dirty.store(true, Ordering::SeqCst);
                error!("reconcile aborted, no schedules live: {e}");
                self.record_error(format!("reconcile failed: {e}")).await;
                return Err(e);
            }
        };

        let mut fresh = HashMap::with_capacity(records.len());
        for record in records {
            let plan = match record.plan() {
                Ok(p) => p,
                Err(e) => {
                    warn!(schedule_id = record.id, "skipping malformed schedule: {e}");
                    continue;
                }
            };
            let trigger = match Trigger::new(&plan.recurrence, inner.tz) {
                Ok(t) => t,
                Err(e) => {
                    warn!(schedule_id = plan.id, "skipping schedule: {e}");
                    continue;
                }
            };
            let Some(first) = trigger.next_after(now) else {
                debug!(schedule_id = plan.id, "one-shot time already passed, not scheduling");
                continue;
            };

            debug!(
                schedule_id = plan.id,
                kind = %plan.kind,
                cron = trigger.pattern().unwrap_or("-"),
                next = %first.with_timezone(&inner.tz),
                "job scheduled"
            );

            let token = inner.shutdown.child_token();
            let recurring = trigger.is_recurring();
            let task = tokio::spawn(self.clone().run_trigger(plan, trigger, token.clone()));
            let handle = JobHandle { token, task };
            let job = if recurring {
                Job::Recurring(handle)
            } else {
                Job::OneShot(handle)
            };
            fresh.insert(record.id, job);
        }

        *jobs = fresh;
        inner.dirty.store(false, Ordering::SeqCst);

        let live = jobs.len();
        info!(live, "schedules reconciled");
        Ok(live)
    }

    async fn load(
        &self,
        now_local: NaiveDateTime,
    ) -> Result<Vec<crate::schedule::ScheduleRecord>, StoreError> {
        let purged = self.inner.store.delete_expired_once(now_local).await?;
        if purged > 0 {
            info!(purged, "removed expired one-shot schedules");
        }
        self.inner.store.list_active().await
    }

    /// Re-run a failed reconcile on every tick of `interval` until it
    /// succeeds.  Runs until [`Self::shutdown`].
    pub async fn run_resync(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.is_dirty() {
                info!("retrying schedule reconcile");
                if let Err(e) = self.reconcile().await {
                    warn!("resync failed, will retry: {e}");
                }
            }
        }
    }

    /// Cancel every live job and cut short in-flight executions.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut jobs = self.inner.jobs.lock().await;
        for (_, job) in jobs.drain() {
            job.cancel();
        }
        info!("scheduler stopped");
    }

    // ----------------------------
    // Mutations
    // ----------------------------

    /// Validate, persist, reconcile.  Returns the new record's id.
    pub async fn create(&self, req: NewSchedule) -> Result<i64, SchedulerError> {
        let valid = req.validate(self.now_local())?;
        let id = self.inner.store.insert(&valid).await?;
        info!(schedule_id = id, kind = %valid.kind, "schedule created");
        self.record_schedule(format!("schedule {id} ({}) created", valid.kind))
            .await;
        self.reconcile().await?;
        Ok(id)
    }

    pub async fn remove(&self, id: i64) -> Result<(), SchedulerError> {
        if !self.inner.store.delete(id).await? {
            return Err(SchedulerError::NotFound(id));
        }
        info!(schedule_id = id, "schedule deleted");
        self.record_schedule(format!("schedule {id} deleted")).await;
        self.reconcile().await?;
        Ok(())
    }

    pub async fn set_status(&self, id: i64, status: ScheduleStatus) -> Result<(), SchedulerError> {
        if !self.inner.store.set_status(id, status).await? {
            return Err(SchedulerError::NotFound(id));
        }
        info!(schedule_id = id, status = status.as_str(), "schedule status changed");
        self.record_schedule(format!("schedule {id} set {}", status.as_str()))
            .await;
        self.reconcile().await?;
        Ok(())
    }

    // ----------------------------
    // Triggers & execution
    // ----------------------------

    async fn run_trigger(self, plan: Plan, trigger: Trigger, token: CancellationToken) {
        let clock = Arc::clone(&self.inner.clock);
        let mut last_fired: Option<DateTime<Utc>> = None;

        loop {
            let now = clock.now();
            let after = last_fired.map_or(now, |last| last.max(now));
            let Some(next) = trigger.next_after(after) else {
                return;
            };
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if token.is_cancelled() {
                return;
            }

            last_fired = Some(next);
            tokio::spawn(self.clone().execute(plan.clone()));

            if !trigger.is_recurring() {
                return;
            }
        }
    }

    /// Boxed so the execute -> reconcile -> trigger -> execute spawn cycle
    /// has a nameable future type.
    fn execute(self, plan: Plan) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { self.run_execution(plan).await })
    }

    async fn run_execution(&self, plan: Plan) {
        let inner = &self.inner;
        let minutes = plan.duration.as_secs() / 60;

        info!(schedule_id = plan.id, kind = %plan.kind, minutes, "irrigation started");
        self.record_schedule(format!(
            "schedule {} watering for {minutes} min",
            plan.id
        ))
        .await;
        self.send(Command::WaterOn, plan.id).await;

        tokio::select! {
            _ = tokio::time::sleep(plan.duration) => {}
            _ = inner.shutdown.cancelled() => {
                warn!(schedule_id = plan.id, "shutdown during irrigation, stopping early");
            }
        }

        self.send(Command::WaterOff, plan.id).await;
        info!(schedule_id = plan.id, "irrigation finished");

        if plan.kind != ScheduleType::Once || plan.keep_after_run {
            return;
        }
        match inner.store.delete(plan.id).await {
            Ok(_) => {
                info!(schedule_id = plan.id, "one-shot schedule removed after run");
                if let Err(e) = self.reconcile().await {
                    error!(schedule_id = plan.id, "reconcile after one-shot failed: {e}");
                }
            }
            Err(e) => {
                error!(schedule_id = plan.id, "failed to remove one-shot schedule: {e}");
            }
        }
    }

    async fn send(&self, cmd: Command, schedule_id: i64) {
        let wire = cmd.as_wire();
        if let Err(e) = self
            .inner
            .channel
            .publish(TOPIC_CONTROL, wire.clone().into_bytes())
            .await
        {
            error!(schedule_id, command = %wire, "failed to publish: {e}");
            self.record_error(format!("schedule {schedule_id}: {wire} not sent: {e}"))
                .await;
        }
    }

    async fn record_schedule(&self, detail: String) {
        if let Some(events) = &self.inner.events {
            events.write().await.record_schedule(detail);
        }
    }

    async fn record_error(&self, detail: String) {
        if let Some(events) = &self.inner.events {
            events.write().await.record_error(detail);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{FormValue, ScheduleRecord, ValidSchedule, WeekdayList};
    use async_trait::async_trait;
    use crate::db::Db;
    use chrono::TimeZone;
    use irrigation_proto::{AnchoredClock, MemoryChannel};
    use std::sync::Mutex as StdMutex;

    // -- In-memory store ---------------------------------------------------

    #[derive(Default)]
    struct MemStore {
        rows: StdMutex<Vec<ScheduleRecord>>,
        next_id: StdMutex<i64>,
        fail: AtomicBool,
        inserts: StdMutex<usize>,
    }

    impl MemStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(StoreError::Db(sqlx::Error::PoolClosed))
            } else {
                Ok(())
            }
        }

        fn push(&self, mut rec: ScheduleRecord) -> i64 {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            rec.id = *next;
            self.rows.lock().unwrap().push(rec);
            *next
        }

        fn ids(&self) -> Vec<i64> {
            self.rows.lock().unwrap().iter().map(|r| r.id).collect()
        }
    }

    #[async_trait]
    impl ScheduleStore for MemStore {
        async fn list_all(&self) -> Result<Vec<ScheduleRecord>, StoreError> {
            self.check()?;
            let mut rows = self.rows.lock().unwrap().clone();
            rows.reverse();
            Ok(rows)
        }

        async fn list_active(&self) -> Result<Vec<ScheduleRecord>, StoreError> {
            self.check()?;
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.status == "active")
                .cloned()
                .collect())
        }

        async fn get(&self, id: i64) -> Result<Option<ScheduleRecord>, StoreError> {
            self.check()?;
            Ok(self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned())
        }

        async fn insert(&self, s: &ValidSchedule) -> Result<i64, StoreError> {
            self.check()?;
            *self.inserts.lock().unwrap() += 1;
            Ok(self.push(ScheduleRecord {
                id: 0,
                kind: s.kind.as_str().into(),
                datetime: s.datetime.clone(),
                duration: Some(s.duration.to_string()),
                repeat_interval: s.repeat_interval.map(|n| n.to_string()),
                weekday: s.weekday.clone(),
                keep_after_run: s.keep_after_run,
                status: "active".into(),
            }))
        }

        async fn delete(&self, id: i64) -> Result<bool, StoreError> {
            self.check()?;
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|r| r.id != id);
            Ok(rows.len() != before)
        }

        async fn set_status(&self, id: i64, status: ScheduleStatus) -> Result<bool, StoreError> {
            self.check()?;
            let mut rows = self.rows.lock().unwrap();
            match rows.iter_mut().find(|r| r.id == id) {
                Some(r) => {
                    r.status = status.as_str().into();
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn delete_expired_once(&self, now_local: NaiveDateTime) -> Result<u64, StoreError> {
            self.check()?;
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|r| {
                let expired = r.kind.trim().eq_ignore_ascii_case("once")
                    && !r.keep_after_run
                    && r.datetime
                        .as_deref()
                        .and_then(|s| crate::schedule::parse_once(s).ok())
                        .is_some_and(|at| at < now_local);
                !expired
            });
            Ok((before - rows.len()) as u64)
        }
    }

    // -- Fixtures ----------------------------------------------------------

    struct Harness {
        store: Arc<MemStore>,
        channel: Arc<MemoryChannel>,
        scheduler: JobScheduler,
    }

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    /// 2026-10-18 10:00 local (+07:00), a Sunday.
    fn harness() -> Harness {
        let store = Arc::new(MemStore::default());
        let channel = Arc::new(MemoryChannel::new());
        let clock = AnchoredClock::starting_at(Utc.with_ymd_and_hms(2026, 10, 18, 3, 0, 0).unwrap());
        let scheduler = JobScheduler::new(store.clone(), channel.clone(), Arc::new(clock), tz());
        Harness {
            store,
            channel,
            scheduler,
        }
    }

    fn record(kind: &str) -> ScheduleRecord {
        ScheduleRecord {
            id: 0,
            kind: kind.into(),
            datetime: None,
            duration: Some("1".into()),
            repeat_interval: None,
            weekday: None,
            keep_after_run: false,
            status: "active".into(),
        }
    }

    fn once_at(datetime: &str, keep: bool) -> ScheduleRecord {
        ScheduleRecord {
            datetime: Some(datetime.into()),
            keep_after_run: keep,
            ..record("once")
        }
    }

    fn daily_at(time: &str) -> ScheduleRecord {
        ScheduleRecord {
            datetime: Some(time.into()),
            ..record("daily")
        }
    }

    fn hourly_every(n: i64) -> ScheduleRecord {
        ScheduleRecord {
            repeat_interval: Some(n.to_string()),
            ..record("hourly")
        }
    }

    async fn advance(d: Duration) {
        tokio::time::sleep(d).await;
        // Let spawned executions run up to their next await.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn mins(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    // -- Reconcile ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn reconcile_with_empty_store() {
        let h = harness();
        assert_eq!(h.scheduler.reconcile().await.unwrap(), 0);
        assert!(h.scheduler.live_jobs().await.is_empty());
        // Safe to repeat with nothing live.
        assert_eq!(h.scheduler.reconcile().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_is_idempotent() {
        let h = harness();
        let a = h.store.push(hourly_every(15));
        let b = h.store.push(daily_at("18:00"));
        let c = h.store.push(once_at("2026-10-18 12:00", false));

        h.scheduler.reconcile().await.unwrap();
        let first = h.scheduler.live_jobs().await;
        h.scheduler.reconcile().await.unwrap();
        let second = h.scheduler.live_jobs().await;
        assert_eq!(first, vec![a, b, c]);
        assert_eq!(first, second);

        // 10:00 -> 10:17: the hourly job fires exactly once (at 10:15).
        advance(mins(17)).await;
        assert_eq!(h.channel.published_on(TOPIC_CONTROL), vec!["WATER_ON", "WATER_OFF"]);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_record_is_isolated() {
        let h = harness();
        h.store.push(hourly_every(10));
        h.store.push(daily_at("06:00"));
        h.store.push(ScheduleRecord {
            weekday: Some("Mon,Fri".into()),
            datetime: Some("07:30".into()),
            ..record("weekly")
        });
        h.store.push(once_at("2026-10-19 08:00", false));
        let bad = h.store.push(record("weekly"));

        assert_eq!(h.scheduler.reconcile().await.unwrap(), 4);
        let live = h.scheduler.live_jobs().await;
        assert_eq!(live.len(), 4);
        assert!(!live.contains(&bad));
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_records_not_scheduled() {
        let h = harness();
        h.store.push(ScheduleRecord {
            status: "inactive".into(),
            ..hourly_every(5)
        });
        assert_eq!(h.scheduler.reconcile().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn past_once_purged_on_reconcile() {
        let h = harness();
        let stale = h.store.push(once_at("2026-10-18 09:00", false));
        let kept = h.store.push(once_at("2026-10-18 09:00", true));

        assert_eq!(h.scheduler.reconcile().await.unwrap(), 0);
        assert_eq!(h.store.ids(), vec![kept]);
        assert!(!h.store.ids().contains(&stale));
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_leaves_scheduler_empty() {
        let h = harness();
        h.store.push(hourly_every(10));
        h.scheduler.reconcile().await.unwrap();
        assert_eq!(h.scheduler.live_jobs().await.len(), 1);

        h.store.fail.store(true, Ordering::SeqCst);
        assert!(h.scheduler.reconcile().await.is_err());
        assert!(h.scheduler.live_jobs().await.is_empty());
        assert!(h.scheduler.is_dirty());

        // Nothing fires while empty.
        advance(mins(30)).await;
        assert!(h.channel.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resync_recovers_after_store_failure() {
        let h = harness();
        h.store.push(hourly_every(10));
        h.store.fail.store(true, Ordering::SeqCst);
        assert!(h.scheduler.reconcile().await.is_err());

        let sched = h.scheduler.clone();
        let resync = tokio::spawn(async move { sched.run_resync(Duration::from_secs(30)).await });

        advance(Duration::from_secs(31)).await;
        assert!(h.scheduler.is_dirty());

        h.store.fail.store(false, Ordering::SeqCst);
        advance(Duration::from_secs(30)).await;
        assert!(!h.scheduler.is_dirty());
        assert_eq!(h.scheduler.live_jobs().await.len(), 1);

        h.scheduler.shutdown().await;
        resync.await.unwrap();
    }

    // -- Firing ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn deleted_schedule_never_fires() {
        let h = harness();
        let id = h.store.push(once_at("2026-10-18 10:05", false));
        h.scheduler.reconcile().await.unwrap();
        assert_eq!(h.scheduler.live_jobs().await, vec![id]);

        h.scheduler.remove(id).await.unwrap();
        assert!(h.scheduler.live_jobs().await.is_empty());

        advance(mins(10)).await;
        assert!(h.channel.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deactivated_recurring_stops_firing() {
        let h = harness();
        let id = h.store.push(hourly_every(5));
        h.scheduler.reconcile().await.unwrap();

        advance(mins(7)).await;
        assert_eq!(h.channel.published_on(TOPIC_CONTROL), vec!["WATER_ON", "WATER_OFF"]);

        h.scheduler
            .set_status(id, ScheduleStatus::Inactive)
            .await
            .unwrap();
        h.channel.clear();
        advance(mins(30)).await;
        assert!(h.channel.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn once_job_runs_and_cleans_up() {
        let h = harness();
        let id = h.store.push(ScheduleRecord {
            duration: Some("3".into()),
            ..once_at("2026-10-18 10:05", false)
        });
        h.scheduler.reconcile().await.unwrap();

        advance(mins(5) + Duration::from_secs(1)).await;
        assert_eq!(h.channel.published_on(TOPIC_CONTROL), vec!["WATER_ON"]);
        assert!(h.store.ids().contains(&id));

        advance(mins(3)).await;
        assert_eq!(h.channel.published_on(TOPIC_CONTROL), vec!["WATER_ON", "WATER_OFF"]);
        assert!(!h.store.ids().contains(&id));
        assert!(h.scheduler.live_jobs().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn kept_once_job_not_recreated() {
        let h = harness();
        let id = h.store.push(once_at("2026-10-18 10:05", true));
        h.scheduler.reconcile().await.unwrap();

        advance(mins(7)).await;
        assert_eq!(h.channel.published_on(TOPIC_CONTROL), vec!["WATER_ON", "WATER_OFF"]);
        assert_eq!(h.store.ids(), vec![id]);

        assert_eq!(h.scheduler.reconcile().await.unwrap(), 0);
        assert!(h.scheduler.live_jobs().await.is_empty());

        h.channel.clear();
        advance(mins(60)).await;
        assert!(h.channel.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn daily_fires_at_local_time() {
        let h = harness();
        h.store.push(daily_at("10:30"));
        h.scheduler.reconcile().await.unwrap();

        advance(mins(29)).await;
        assert!(h.channel.published().is_empty());
        advance(Duration::from_secs(90)).await;
        assert_eq!(h.channel.published_on(TOPIC_CONTROL), vec!["WATER_ON"]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cuts_irrigation_short() {
        let h = harness();
        h.store.push(ScheduleRecord {
            duration: Some("30".into()),
            ..hourly_every(5)
        });
        h.scheduler.reconcile().await.unwrap();

        advance(mins(5) + Duration::from_secs(1)).await;
        assert_eq!(h.channel.published_on(TOPIC_CONTROL), vec!["WATER_ON"]);

        h.scheduler.shutdown().await;
        advance(Duration::from_secs(1)).await;
        assert_eq!(h.channel.published_on(TOPIC_CONTROL), vec!["WATER_ON", "WATER_OFF"]);
        assert!(h.scheduler.live_jobs().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_does_not_stop_job() {
        let h = harness();
        h.store.push(hourly_every(5));
        h.scheduler.reconcile().await.unwrap();

        h.channel.set_offline(true);
        advance(mins(6) + Duration::from_secs(30)).await;
        assert!(h.channel.published().is_empty());

        // Next run at 10:10 goes through.
        h.channel.set_offline(false);
        advance(mins(4)).await;
        assert_eq!(h.channel.published_on(TOPIC_CONTROL), vec!["WATER_ON"]);
    }

    fn hourly_request(every: i64) -> NewSchedule {
        NewSchedule {
            kind: Some("hourly".into()),
            duration: Some(FormValue::Int(1)),
            repeat_interval: Some(FormValue::Int(every)),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reconciles_are_serialised() {
        let h = harness();
        let a = h.store.push(hourly_every(15));
        let s = &h.scheduler;

        let (r1, c1, r2, c2, r3) = tokio::join!(
            s.reconcile(),
            s.create(hourly_request(20)),
            s.reconcile(),
            s.create(hourly_request(30)),
            s.reconcile(),
        );
        r1.unwrap();
        r2.unwrap();
        r3.unwrap();
        let (b, c) = (c1.unwrap(), c2.unwrap());

        let mut expected = vec![a, b, c];
        expected.sort_unstable();
        assert_eq!(s.live_jobs().await, expected);
        assert_eq!(s.inner.jobs.lock().await.len(), 3);

        // 10:00 -> 10:30:30: runs at 10:15, 10:20 and two at 10:30.
        advance(mins(30) + Duration::from_secs(30)).await;
        let ons = h
            .channel
            .published_on(TOPIC_CONTROL)
            .iter()
            .filter(|c| c.as_str() == "WATER_ON")
            .count();
        assert_eq!(ons, 4);
    }

    // -- Mutations ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn create_validates_before_insert() {
        let h = harness();
        let req = NewSchedule {
            kind: Some("weekly".into()),
            datetime: Some("07:00".into()),
            duration: Some(FormValue::Int(5)),
            ..Default::default()
        };
        match h.scheduler.create(req).await {
            Err(SchedulerError::Validation(e)) => assert_eq!(e.field, "weekday"),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(*h.store.inserts.lock().unwrap(), 0);
        assert!(h.store.ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn create_schedules_immediately() {
        let h = harness();
        let id = h
            .scheduler
            .create(NewSchedule {
                kind: Some("weekly".into()),
                datetime: Some("07:00".into()),
                duration: Some(FormValue::Int(5)),
                weekday: Some(WeekdayList::List(vec!["Monday".into()])),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(h.scheduler.live_jobs().await, vec![id]);

        let rec = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(rec.weekday.as_deref(), Some("Mon"));
    }

    #[tokio::test]
    async fn mistyped_row_in_db_is_skipped() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let clock = AnchoredClock::starting_at(Utc.with_ymd_and_hms(2026, 10, 18, 3, 0, 0).unwrap());
        let scheduler = JobScheduler::new(
            Arc::new(db.clone()),
            Arc::new(MemoryChannel::new()),
            Arc::new(clock),
            tz(),
        );

        let mut ids = Vec::new();
        for every in [5, 10, 15, 20] {
            ids.push(scheduler.create(hourly_request(every)).await.unwrap());
        }
        sqlx::query(
            "INSERT INTO irrigation_schedule (type, duration, repeat_interval) \
             VALUES ('hourly', 'ten', 5)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        assert_eq!(scheduler.reconcile().await.unwrap(), 4);
        assert_eq!(scheduler.live_jobs().await, ids);
        assert!(!scheduler.is_dirty());
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn remove_unknown_is_not_found() {
        let h = harness();
        assert!(matches!(
            h.scheduler.remove(42).await,
            Err(SchedulerError::NotFound(42))
        ));
        assert!(matches!(
            h.scheduler.set_status(42, ScheduleStatus::Active).await,
            Err(SchedulerError::NotFound(42))
        ));
    }
}
