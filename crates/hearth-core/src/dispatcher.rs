//! Deferred sends: claim, execute, retry, and re-arm recurring series.
//!
//! Due messages are claimed with a single read-and-mark statement, so any
//! number of dispatchers (tasks or processes) can poll the same store
//! without two of them executing the same id. A claim left behind by a
//! crashed worker is handed back to `PENDING` by [`ScheduledDispatcher::sweep`]
//! once it is older than the claim timeout.
//!
//! Status flow: `PENDING -> PROCESSING -> SENT`, `PROCESSING -> PENDING`
//! (retry, bounded by `max_retries`), `PROCESSING -> FAILED` (retries
//! exhausted), `PENDING -> CANCELLED`, `PENDING -> EXPIRED` (never attempted
//! within the grace window). A recurring series outlives a `FAILED` or
//! `EXPIRED` occurrence and only ends past its `end_date`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hearth_shared::constants::{
    DEFAULT_CLAIM_TIMEOUT_SECS, DEFAULT_DISPATCH_BATCH_SIZE, DEFAULT_EXPIRY_GRACE_SECS,
    DEFAULT_RETENTION_DAYS, DEFAULT_RETRY_DELAY_SECS,
};
use hearth_shared::error::ScheduleError;
use hearth_shared::protocol::{Notification, SendRequest};
use hearth_shared::recurrence::RecurrenceRule;
use hearth_shared::types::{RoomId, ScheduledStatus, UserId};
use hearth_store::{ScheduledMessage, SharedDatabase, StoreError};

use crate::delivery::Delivery;
use crate::error::{HearthError, Result};
use crate::pipeline::{planned_next, validate_schedule, MessageService};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Most messages claimed per poll.
    pub batch_size: u32,
    /// Delay before a failed attempt becomes due again.
    pub retry_delay: Duration,
    /// How long past `scheduled_for` a never-attempted message may wait.
    pub expiry_grace: Duration,
    /// Age after which a `PROCESSING` claim is presumed abandoned.
    pub claim_timeout: Duration,
    /// Terminal records older than this are purged.
    pub retention: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_DISPATCH_BATCH_SIZE,
            retry_delay: Duration::seconds(DEFAULT_RETRY_DELAY_SECS),
            expiry_grace: Duration::seconds(DEFAULT_EXPIRY_GRACE_SECS),
            claim_timeout: Duration::seconds(DEFAULT_CLAIM_TIMEOUT_SECS),
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }
}

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Sent {
        message_id: Uuid,
        /// False when delivery succeeded but the message row was not written.
        stored: bool,
        /// The re-armed instance, for recurring series that continue.
        next: Option<Uuid>,
    },
    Retrying {
        retry_count: u32,
        retry_at: DateTime<Utc>,
    },
    Failed {
        retry_count: u32,
        error: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollReport {
    pub claimed: usize,
    pub sent: usize,
    pub retrying: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub released: usize,
    pub expired: usize,
}

#[derive(Clone)]
pub struct ScheduledDispatcher {
    config: DispatcherConfig,
    db: SharedDatabase,
    service: MessageService,
    delivery: Arc<dyn Delivery>,
}

impl ScheduledDispatcher {
    pub fn new(
        config: DispatcherConfig,
        db: SharedDatabase,
        service: MessageService,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            config,
            db,
            service,
            delivery,
        }
    }

    // ---- Owner operations ----

    pub fn schedule(&self, request: SendRequest, now: DateTime<Utc>) -> Result<ScheduledMessage> {
        self.service.schedule(request, now)
    }

    /// Replace content and timing of a pending message. The room is fixed.
    pub fn update(
        &self,
        id: Uuid,
        user: UserId,
        request: SendRequest,
        now: DateTime<Utc>,
    ) -> Result<ScheduledMessage> {
        let current = self.owned_pending(id, user)?;

        let options = request
            .schedule
            .as_ref()
            .ok_or_else(|| HearthError::InvalidRequest("missing scheduling fields".into()))?;
        if request.room != current.room {
            return Err(HearthError::InvalidRequest(
                "a scheduled message cannot move rooms".into(),
            ));
        }
        self.service.validate_content(&request.content)?;
        validate_schedule(options, now)?;

        let updated = ScheduledMessage {
            content: request.content.clone(),
            message_type: request.message_type,
            encrypt: request.encrypt,
            scheduled_for: options.scheduled_for,
            max_retries: options.max_retries.unwrap_or(current.max_retries),
            recurrence_pattern: options.recurrence_pattern.clone(),
            is_recurring: options.recurrence_pattern.is_some(),
            next_execution: planned_next(options),
            end_date: options.end_date,
            ..current
        };

        if !self.db.with(|db| db.update_pending_scheduled(&updated))? {
            return Err(ScheduleError::NotPending.into());
        }
        info!(id = %id, scheduled_for = %updated.scheduled_for, "scheduled message updated");
        Ok(updated)
    }

    pub fn cancel(&self, id: Uuid, user: UserId) -> Result<()> {
        self.owned_pending(id, user)?;
        if !self.db.with(|db| db.cancel_pending_scheduled(id))? {
            return Err(ScheduleError::NotPending.into());
        }
        info!(id = %id, user = %user, "scheduled message cancelled");
        Ok(())
    }

    fn owned_pending(&self, id: Uuid, user: UserId) -> Result<ScheduledMessage> {
        let current = self.get(id)?;
        if current.sender != user {
            warn!(id = %id, user = %user, "scheduled message owner mismatch");
            return Err(ScheduleError::NotOwner.into());
        }
        if current.status != ScheduledStatus::Pending {
            return Err(ScheduleError::NotPending.into());
        }
        Ok(current)
    }

    // ---- Queries ----

    pub fn get(&self, id: Uuid) -> Result<ScheduledMessage> {
        self.db
            .with(|db| db.get_scheduled(id))
            .map_err(|e| match e {
                StoreError::NotFound => ScheduleError::NotFound.into(),
                other => other.into(),
            })
    }

    pub fn list_by_user(&self, user: UserId) -> Result<Vec<ScheduledMessage>> {
        Ok(self.db.with(|db| db.list_scheduled_by_sender(user))?)
    }

    pub fn list_by_room(&self, room: RoomId) -> Result<Vec<ScheduledMessage>> {
        Ok(self.db.with(|db| db.list_scheduled_by_room(room))?)
    }

    pub fn list_by_status(&self, status: ScheduledStatus) -> Result<Vec<ScheduledMessage>> {
        Ok(self.db.with(|db| db.list_scheduled_by_status(status))?)
    }

    pub fn list_series(&self, series_id: Uuid) -> Result<Vec<ScheduledMessage>> {
        Ok(self.db.with(|db| db.list_scheduled_series(series_id))?)
    }

    pub fn count_by_status(&self, status: ScheduledStatus) -> Result<u64> {
        Ok(self.db.with(|db| db.count_scheduled_by_status(status))?)
    }

    // ---- Execution ----

    /// Claim and execute everything due at `now`, up to one batch.
    pub async fn poll(&self, now: DateTime<Utc>) -> Result<PollReport> {
        let claimed = self
            .db
            .with(|db| db.claim_due_scheduled(now, self.config.batch_size))?;

        let mut report = PollReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        debug!(count = claimed.len(), "claimed due scheduled messages");

        for scheduled in &claimed {
            match self.execute_claimed(scheduled, now).await? {
                AttemptOutcome::Sent { .. } => report.sent += 1,
                AttemptOutcome::Retrying { .. } => report.retrying += 1,
                AttemptOutcome::Failed { .. } => report.failed += 1,
            }
        }
        Ok(report)
    }

    /// Execute one message now, provided it is pending and due.
    pub async fn execute_now(&self, id: Uuid, now: DateTime<Utc>) -> Result<AttemptOutcome> {
        let current = self.get(id)?;
        if current.status != ScheduledStatus::Pending {
            return Err(ScheduleError::NotPending.into());
        }
        if current.scheduled_for > now {
            return Err(ScheduleError::ScheduleNotDue.into());
        }

        let claimed = self
            .db
            .with(|db| db.claim_scheduled(id, now))?
            .ok_or(ScheduleError::NotPending)?;
        self.execute_claimed(&claimed, now).await
    }

    async fn execute_claimed(
        &self,
        scheduled: &ScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        match self.service.dispatch_scheduled(scheduled, now).await {
            Ok(dispatched) => {
                self.complete(scheduled, dispatched.message.id, dispatched.stored, now)
            }
            Err(e) => self.record_failure(scheduled, &e.to_string(), now),
        }
    }

    fn complete(
        &self,
        scheduled: &ScheduledMessage,
        message_id: Uuid,
        stored: bool,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let next_slot = self.next_slot(scheduled, None);

        let next = self.db.with(|db| {
            if !db.mark_scheduled_sent(scheduled.id, next_slot)? {
                return Ok(None);
            }
            let Some(slot) = next_slot else {
                return Ok(None);
            };
            let next = rearm(scheduled, slot, now);
            db.insert_scheduled(&next)?;
            Ok(Some(next))
        })?;

        info!(
            id = %scheduled.id,
            series = %scheduled.series_id,
            message = %message_id,
            attempt = scheduled.retry_count + 1,
            "scheduled message sent"
        );
        match &next {
            Some(next) => debug!(
                series = %scheduled.series_id,
                next = %next.id,
                scheduled_for = %next.scheduled_for,
                "recurring series re-armed"
            ),
            None if scheduled.is_recurring => {
                info!(series = %scheduled.series_id, "recurring series ended")
            }
            None => {}
        }

        Ok(AttemptOutcome::Sent {
            message_id,
            stored,
            next: next.map(|n| n.id),
        })
    }

    /// Next occurrence of a recurring series, unless it falls past the end.
    /// Slots earlier than `not_before` are skipped.
    fn next_slot(
        &self,
        scheduled: &ScheduledMessage,
        not_before: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        if !scheduled.is_recurring {
            return None;
        }

        let rule = match scheduled.recurrence_pattern.as_deref()?.parse::<RecurrenceRule>() {
            Ok(rule) => Some(rule),
            Err(e) => {
                error!(id = %scheduled.id, error = %e, "unusable recurrence pattern");
                None
            }
        };

        let mut slot = match scheduled.next_execution {
            Some(slot) => slot,
            None => rule.as_ref()?.next_after(scheduled.scheduled_for)?,
        };
        if let Some(floor) = not_before {
            while slot < floor {
                slot = rule.as_ref()?.next_after(slot)?;
                if scheduled.end_date.is_some_and(|end| slot > end) {
                    return None;
                }
            }
        }

        match scheduled.end_date {
            Some(end) if slot > end => None,
            _ => Some(slot),
        }
    }

    fn record_failure(
        &self,
        scheduled: &ScheduledMessage,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let retry_count = scheduled.retry_count + 1;

        if retry_count >= scheduled.max_retries {
            let error = format!("{}: {reason}", ScheduleError::RetriesExhausted(retry_count));
            let floor = window_start(now, self.config.expiry_grace);
            let next_slot = self.next_slot(scheduled, Some(floor));
            let next = self.db.with(|db| {
                if !db.mark_scheduled_failed(scheduled.id, retry_count, &error)? {
                    warn!(id = %scheduled.id, "claim lost before failure could be recorded");
                    return Ok(None);
                }
                let Some(slot) = next_slot else {
                    return Ok(None);
                };
                let next = rearm(scheduled, slot, now);
                db.insert_scheduled(&next)?;
                Ok(Some(next))
            })?;

            error!(
                id = %scheduled.id,
                sender = %scheduled.sender,
                retry_count,
                error = %reason,
                "scheduled message failed"
            );
            if let Some(next) = &next {
                info!(
                    series = %scheduled.series_id,
                    next = %next.id,
                    scheduled_for = %next.scheduled_for,
                    "recurring series continues after failed occurrence"
                );
            }
            self.delivery.notify(Notification::ScheduleFailed {
                scheduled_id: scheduled.id,
                sender: scheduled.sender,
                error: error.clone(),
            });
            return Ok(AttemptOutcome::Failed { retry_count, error });
        }

        let retry_at = now.checked_add_signed(self.config.retry_delay).unwrap_or(now);
        if !self
            .db
            .with(|db| db.mark_scheduled_retry(scheduled.id, retry_count, reason, retry_at))?
        {
            warn!(id = %scheduled.id, "claim lost before retry could be recorded");
        }

        warn!(
            id = %scheduled.id,
            retry_count,
            max_retries = scheduled.max_retries,
            retry_at = %retry_at,
            error = %reason,
            "scheduled delivery failed, will retry"
        );
        Ok(AttemptOutcome::Retrying {
            retry_count,
            retry_at,
        })
    }

    // ---- Maintenance ----

    /// Release abandoned claims and expire messages that missed their window.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let released = self
            .db
            .with(|db| db.release_stale_claims(window_start(now, self.config.claim_timeout)))?;
        if released > 0 {
            warn!(count = released, "released abandoned dispatcher claims");
        }

        let cutoff = window_start(now, self.config.expiry_grace);
        let expired = self.db.with(|db| db.expire_overdue_scheduled(cutoff))?;
        for scheduled in &expired {
            warn!(
                id = %scheduled.id,
                scheduled_for = %scheduled.scheduled_for,
                "scheduled message expired unsent"
            );
            // A missed occurrence does not end its series.
            if let Some(slot) = self.next_slot(scheduled, Some(cutoff)) {
                let next = rearm(scheduled, slot, now);
                self.db.with(|db| db.insert_scheduled(&next))?;
                info!(
                    series = %scheduled.series_id,
                    next = %next.id,
                    scheduled_for = %next.scheduled_for,
                    "recurring series continues after expired occurrence"
                );
            }
            self.delivery.notify(Notification::ScheduleFailed {
                scheduled_id: scheduled.id,
                sender: scheduled.sender,
                error: scheduled
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "expired".into()),
            });
        }

        Ok(SweepReport {
            released,
            expired: expired.len(),
        })
    }

    /// Delete terminal records older than the retention window.
    pub fn purge_terminal(&self, now: DateTime<Utc>) -> Result<usize> {
        let purged = self
            .db
            .with(|db| db.purge_terminal_scheduled(window_start(now, self.config.retention)))?;
        if purged > 0 {
            info!(count = purged, "purged terminal scheduled messages");
        }
        Ok(purged)
    }

    /// Poll on a fixed interval until `shutdown` flips to `true` (or its
    /// sender is dropped). A failing poll is logged and the loop continues.
    pub async fn run(&self, poll_interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = poll_interval.as_secs(), "dispatcher started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll(Utc::now()).await {
                        Ok(report) if report.claimed > 0 => {
                            info!(
                                claimed = report.claimed,
                                sent = report.sent,
                                retrying = report.retrying,
                                failed = report.failed,
                                "dispatcher poll finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "dispatcher poll failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }
}

/// Start of a look-back window ending at `now`, clamped to the earliest
/// representable instant.
fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The next `PENDING` instance of a series.
fn rearm(scheduled: &ScheduledMessage, slot: DateTime<Utc>, now: DateTime<Utc>) -> ScheduledMessage {
    let following = scheduled
        .recurrence_pattern
        .as_deref()
        .and_then(|p| p.parse::<RecurrenceRule>().ok())
        .and_then(|rule| rule.next_after(slot));

    ScheduledMessage {
        id: Uuid::new_v4(),
        series_id: scheduled.series_id,
        room: scheduled.room,
        sender: scheduled.sender,
        content: scheduled.content.clone(),
        message_type: scheduled.message_type,
        encrypt: scheduled.encrypt,
        scheduled_for: slot,
        created_at: now,
        status: ScheduledStatus::Pending,
        retry_count: 0,
        max_retries: scheduled.max_retries,
        last_attempt: None,
        error_message: None,
        recurrence_pattern: scheduled.recurrence_pattern.clone(),
        is_recurring: true,
        next_execution: following,
        end_date: scheduled.end_date,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::RecordingDelivery;
    use crate::keys::KeyManager;
    use crate::pipeline::MessageServiceConfig;
    use crate::HearthError;
    use chrono::TimeZone;
    use hearth_shared::protocol::ScheduleOptions;
    use hearth_store::Database;
    use std::collections::HashSet;

    const ROOM: RoomId = RoomId(7);
    const OWNER: UserId = UserId(1);
    const OTHER: UserId = UserId(2);

    struct Fixture {
        _dir: tempfile::TempDir,
        db: SharedDatabase,
        delivery: Arc<RecordingDelivery>,
        dispatcher: ScheduledDispatcher,
    }

    fn fixture(delivery: RecordingDelivery) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db"))
            .unwrap()
            .into_shared();
        let delivery = Arc::new(delivery);
        let service = MessageService::new(
            MessageServiceConfig::default(),
            db.clone(),
            Arc::new(KeyManager::default()),
            delivery.clone(),
        );
        let dispatcher =
            ScheduledDispatcher::new(DispatcherConfig::default(), db.clone(), service, delivery.clone());
        Fixture {
            _dir: dir,
            db,
            delivery,
            dispatcher,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn request(content: &str, options: ScheduleOptions) -> SendRequest {
        SendRequest {
            schedule: Some(options),
            ..SendRequest::text(ROOM, OWNER, content)
        }
    }

    fn at(scheduled_for: DateTime<Utc>) -> ScheduleOptions {
        ScheduleOptions {
            scheduled_for,
            recurrence_pattern: None,
            end_date: None,
            max_retries: None,
        }
    }

    fn schedule_error(result: Result<impl std::fmt::Debug>) -> ScheduleError {
        match result {
            Err(HearthError::Schedule(e)) => e,
            other => panic!("expected a schedule error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let f = fixture(RecordingDelivery::failing(2));
        let due = t0() + Duration::minutes(5);
        let scheduled = f
            .dispatcher
            .schedule(
                request(
                    "happy birthday",
                    ScheduleOptions {
                        max_retries: Some(3),
                        ..at(due)
                    },
                ),
                t0(),
            )
            .unwrap();

        assert_eq!(f.dispatcher.poll(t0()).await.unwrap().claimed, 0);

        let first = f.dispatcher.poll(due).await.unwrap();
        assert_eq!(first.retrying, 1);
        let after_first = f.dispatcher.get(scheduled.id).unwrap();
        assert_eq!(after_first.retry_count, 1);
        assert_eq!(after_first.scheduled_for, due + Duration::minutes(5));

        // Not due again until the retry delay has passed.
        assert_eq!(f.dispatcher.poll(due).await.unwrap().claimed, 0);

        f.dispatcher.poll(due + Duration::minutes(5)).await.unwrap();
        let after_second = f.dispatcher.get(scheduled.id).unwrap();
        assert_eq!(after_second.retry_count, 2);
        assert_eq!(after_second.status, ScheduledStatus::Pending);
        assert!(after_second.error_message.is_some());

        let third = f.dispatcher.poll(due + Duration::minutes(10)).await.unwrap();
        assert_eq!(third.sent, 1);
        let done = f.dispatcher.get(scheduled.id).unwrap();
        assert_eq!(done.status, ScheduledStatus::Sent);
        assert_eq!(f.delivery.attempts(), 3);

        let delivered = f.delivery.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].scheduled_id, Some(scheduled.id));
    }

    #[tokio::test]
    async fn test_fails_after_max_retries() {
        let f = fixture(RecordingDelivery::failing(u32::MAX));
        let due = t0() + Duration::minutes(5);
        let scheduled = f
            .dispatcher
            .schedule(request("never arrives", at(due)), t0())
            .unwrap();
        assert_eq!(scheduled.max_retries, 3);

        let mut now = due;
        let mut last = None;
        for _ in 0..3 {
            let report = f.dispatcher.poll(now).await.unwrap();
            assert_eq!(report.claimed, 1);
            last = Some(report);
            now += Duration::minutes(5);
        }
        assert_eq!(last.unwrap().failed, 1);

        let failed = f.dispatcher.get(scheduled.id).unwrap();
        assert_eq!(failed.status, ScheduledStatus::Failed);
        assert_eq!(failed.retry_count, 3);
        assert_eq!(f.delivery.attempts(), 3);

        // Terminal: never picked up again.
        assert_eq!(f.dispatcher.poll(now + Duration::hours(1)).await.unwrap().claimed, 0);
        assert_eq!(f.delivery.attempts(), 3);

        assert!(matches!(
            f.delivery.notifications().as_slice(),
            [Notification::ScheduleFailed { scheduled_id, sender, .. }]
                if *scheduled_id == scheduled.id && *sender == OWNER
        ));
    }

    #[tokio::test]
    async fn test_recurring_series_stops_at_end_date() {
        let f = fixture(RecordingDelivery::default());
        let first = t0() + Duration::minutes(10);
        let scheduled = f
            .dispatcher
            .schedule(
                request(
                    "stand-up",
                    ScheduleOptions {
                        recurrence_pattern: Some("hourly".into()),
                        end_date: Some(first + Duration::minutes(90)),
                        ..at(first)
                    },
                ),
                t0(),
            )
            .unwrap();
        assert_eq!(scheduled.next_execution, Some(first + Duration::hours(1)));

        let outcome = f.dispatcher.execute_now(scheduled.id, first).await.unwrap();
        let next = match outcome {
            AttemptOutcome::Sent { next: Some(next), .. } => next,
            other => panic!("expected a re-armed series, got {other:?}"),
        };
        let rearmed = f.dispatcher.get(next).unwrap();
        assert_eq!(rearmed.series_id, scheduled.id);
        assert_eq!(rearmed.scheduled_for, first + Duration::hours(1));
        assert_eq!(rearmed.status, ScheduledStatus::Pending);

        let report = f.dispatcher.poll(first + Duration::hours(1)).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(f.dispatcher.poll(first + Duration::hours(5)).await.unwrap().claimed, 0);

        let series = f.dispatcher.list_series(scheduled.id).unwrap();
        assert_eq!(series.len(), 2);
        assert!(series.iter().all(|s| s.status == ScheduledStatus::Sent));
        assert_eq!(f.delivery.delivered().len(), 2);
    }

    #[tokio::test]
    async fn test_recurring_series_survives_failed_occurrence() {
        let f = fixture(RecordingDelivery::failing(3));
        let due = t0() + Duration::minutes(5);
        let scheduled = f
            .dispatcher
            .schedule(
                request(
                    "take your pills",
                    ScheduleOptions {
                        recurrence_pattern: Some("daily".into()),
                        end_date: Some(due + Duration::days(30)),
                        ..at(due)
                    },
                ),
                t0(),
            )
            .unwrap();

        f.dispatcher.poll(due).await.unwrap();
        f.dispatcher.poll(due + Duration::minutes(5)).await.unwrap();
        let last = f.dispatcher.poll(due + Duration::minutes(10)).await.unwrap();
        assert_eq!(last.failed, 1);
        assert_eq!(
            f.dispatcher.get(scheduled.id).unwrap().status,
            ScheduledStatus::Failed
        );

        let series = f.dispatcher.list_series(scheduled.id).unwrap();
        assert_eq!(series.len(), 2);
        let next = series
            .iter()
            .find(|s| s.status == ScheduledStatus::Pending)
            .unwrap();
        assert_eq!(next.scheduled_for, due + Duration::days(1));
        assert_eq!(next.retry_count, 0);

        let report = f.dispatcher.poll(due + Duration::days(1)).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(f.delivery.delivered().len(), 1);
        assert_eq!(f.dispatcher.list_series(scheduled.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_recurring_series_survives_expired_occurrence() {
        let f = fixture(RecordingDelivery::default());
        let first = t0() + Duration::minutes(10);
        let scheduled = f
            .dispatcher
            .schedule(
                request(
                    "check in",
                    ScheduleOptions {
                        recurrence_pattern: Some("hourly".into()),
                        end_date: Some(first + Duration::days(1)),
                        ..at(first)
                    },
                ),
                t0(),
            )
            .unwrap();

        // Offline for a while: slots older than the grace window are skipped.
        let report = f
            .dispatcher
            .sweep(first + Duration::hours(3) + Duration::minutes(30))
            .unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(
            f.dispatcher.get(scheduled.id).unwrap().status,
            ScheduledStatus::Expired
        );

        let pending = f.dispatcher.list_by_status(ScheduledStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].series_id, scheduled.id);
        assert_eq!(pending[0].scheduled_for, first + Duration::hours(3));

        let sent = f.dispatcher.poll(first + Duration::hours(3)).await.unwrap();
        assert_eq!(sent.sent, 1);
    }

    #[tokio::test]
    async fn test_failed_occurrence_after_end_date_ends_series() {
        let f = fixture(RecordingDelivery::failing(u32::MAX));
        let due = t0() + Duration::minutes(5);
        let scheduled = f
            .dispatcher
            .schedule(
                request(
                    "last one",
                    ScheduleOptions {
                        recurrence_pattern: Some("daily".into()),
                        end_date: Some(due + Duration::hours(12)),
                        max_retries: Some(1),
                        ..at(due)
                    },
                ),
                t0(),
            )
            .unwrap();

        assert_eq!(f.dispatcher.poll(due).await.unwrap().failed, 1);
        assert_eq!(f.dispatcher.list_series(scheduled.id).unwrap().len(), 1);
        assert_eq!(f.dispatcher.count_by_status(ScheduledStatus::Pending).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sent_outcome_reports_storage() {
        let f = fixture(RecordingDelivery::default());
        let due = t0() + Duration::minutes(5);
        let kept = f
            .dispatcher
            .schedule(request("kept", at(due)), t0())
            .unwrap();
        let lost = f
            .dispatcher
            .schedule(request("lost", at(due)), t0())
            .unwrap();

        let outcome = f.dispatcher.execute_now(kept.id, due).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Sent { stored: true, .. }));

        f.db.with(|db| {
            db.conn().execute_batch(
                "CREATE TRIGGER reject_messages BEFORE INSERT ON messages
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        // Already delivered, so it is not retried.
        let outcome = f.dispatcher.execute_now(lost.id, due).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Sent { stored: false, .. }));
        assert_eq!(f.dispatcher.get(lost.id).unwrap().status, ScheduledStatus::Sent);
        assert_eq!(f.delivery.delivered().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pollers_deliver_once() {
        let f = fixture(RecordingDelivery::default());
        let due = t0() + Duration::minutes(1);
        for i in 0..20 {
            f.dispatcher
                .schedule(request(&format!("note {i}"), at(due)), t0())
                .unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = f.dispatcher.clone();
                tokio::spawn(async move { dispatcher.poll(due).await.unwrap().sent })
            })
            .collect();
        let mut sent = 0;
        for handle in handles {
            sent += handle.await.unwrap();
        }

        assert_eq!(sent, 20);
        let delivered = f.delivery.delivered();
        assert_eq!(delivered.len(), 20);
        let unique: HashSet<_> = delivered.iter().map(|e| e.scheduled_id).collect();
        assert_eq!(unique.len(), 20);
        assert_eq!(f.dispatcher.count_by_status(ScheduledStatus::Sent).unwrap(), 20);
    }

    #[tokio::test]
    async fn test_owner_operations() {
        let f = fixture(RecordingDelivery::default());
        let due = t0() + Duration::hours(2);
        let scheduled = f
            .dispatcher
            .schedule(request("draft", at(due)), t0())
            .unwrap();

        assert_eq!(
            schedule_error(f.dispatcher.cancel(scheduled.id, OTHER)),
            ScheduleError::NotOwner
        );

        let moved_room = SendRequest {
            room: RoomId(99),
            ..request("elsewhere", at(due))
        };
        assert!(matches!(
            f.dispatcher.update(scheduled.id, OWNER, moved_room, t0()),
            Err(HearthError::InvalidRequest(_))
        ));

        let updated = f
            .dispatcher
            .update(
                scheduled.id,
                OWNER,
                request("final wording", at(due + Duration::hours(1))),
                t0(),
            )
            .unwrap();
        let stored = f.dispatcher.get(scheduled.id).unwrap();
        assert_eq!(stored.content, "final wording");
        assert_eq!(stored.scheduled_for, updated.scheduled_for);

        assert_eq!(
            schedule_error(f.dispatcher.execute_now(scheduled.id, due).await),
            ScheduleError::ScheduleNotDue
        );

        assert_eq!(f.dispatcher.list_by_user(OWNER).unwrap().len(), 1);
        assert_eq!(f.dispatcher.list_by_room(ROOM).unwrap().len(), 1);
        assert!(f.dispatcher.list_by_user(OTHER).unwrap().is_empty());

        f.dispatcher.cancel(scheduled.id, OWNER).unwrap();
        assert_eq!(
            f.dispatcher.get(scheduled.id).unwrap().status,
            ScheduledStatus::Cancelled
        );
        assert_eq!(
            schedule_error(f.dispatcher.cancel(scheduled.id, OWNER)),
            ScheduleError::NotPending
        );
        assert_eq!(
            schedule_error(f.dispatcher.execute_now(scheduled.id, due + Duration::hours(1)).await),
            ScheduleError::NotPending
        );
        assert_eq!(
            schedule_error(f.dispatcher.get(Uuid::new_v4())),
            ScheduleError::NotFound
        );
        assert_eq!(
            f.dispatcher.list_by_status(ScheduledStatus::Cancelled).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_sweep_expires_and_releases() {
        let f = fixture(RecordingDelivery::default());
        let due = t0() + Duration::minutes(5);
        let missed = f
            .dispatcher
            .schedule(request("missed", at(due)), t0())
            .unwrap();
        let abandoned = f
            .dispatcher
            .schedule(request("abandoned", at(due + Duration::minutes(1))), t0())
            .unwrap();

        // A worker claims the second message and dies.
        let claimed = f
            .db
            .with(|db| db.claim_scheduled(abandoned.id, due + Duration::minutes(1)))
            .unwrap();
        assert!(claimed.is_some());

        let report = f
            .dispatcher
            .sweep(due + Duration::hours(1) + Duration::minutes(1))
            .unwrap();
        assert_eq!(report, SweepReport { released: 1, expired: 1 });

        assert_eq!(
            f.dispatcher.get(missed.id).unwrap().status,
            ScheduledStatus::Expired
        );
        let released = f.dispatcher.get(abandoned.id).unwrap();
        assert_eq!(released.status, ScheduledStatus::Pending);
        assert_eq!(released.retry_count, 0);

        assert!(matches!(
            f.delivery.notifications().as_slice(),
            [Notification::ScheduleFailed { scheduled_id, .. }] if *scheduled_id == missed.id
        ));
    }

    #[tokio::test]
    async fn test_purge_terminal_respects_retention() {
        let f = fixture(RecordingDelivery::default());
        let due = t0() + Duration::minutes(5);
        f.dispatcher
            .schedule(request("old news", at(due)), t0())
            .unwrap();
        f.dispatcher.poll(due).await.unwrap();

        assert_eq!(f.dispatcher.purge_terminal(due + Duration::days(1)).unwrap(), 0);
        assert_eq!(f.dispatcher.purge_terminal(due + Duration::days(31)).unwrap(), 1);
        assert_eq!(f.dispatcher.count_by_status(ScheduledStatus::Sent).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(RecordingDelivery::default());
        let (tx, rx) = watch::channel(false);
        let dispatcher = f.dispatcher.clone();
        let task = tokio::spawn(async move {
            dispatcher
                .run(std::time::Duration::from_millis(10), rx)
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
