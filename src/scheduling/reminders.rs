use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::{Role, Session, Stores};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::scheduling::require_role;
use crate::Result;

const SHORTEST_PERIOD: std::time::Duration = std::time::Duration::from_millis(1);

/// How long a claim keeps other sweeps off a session before it counts as abandoned.
const CLAIM_LEASE_MINUTES: i64 = 10;

/// Outcome of one reminder sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Sessions whose reminders went out and whose flag was flipped.
    pub processed: usize,
    /// Sessions that will be retried on the next sweep.
    pub failed: usize,
    /// Set when the due sessions could not be loaded at all.
    pub error: Option<String>,
}

impl SweepReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed == 0
    }
}

/// Sends one reminder to each party of a confirmed session starting within
/// the lookahead. Delivery is at-least-once: the flag is flipped only after
/// both notifications went out.
///
/// Sweeps in one process run one at a time. Sweeps from separate processes
/// sharing a store are kept apart per session by a store-side claim.
pub struct ReminderScheduler {
    stores: Stores,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    lookahead: Duration,
    sweeping: Mutex<()>,
}

impl ReminderScheduler {
    pub fn new(stores: Stores, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>, lookahead: Duration) -> Self {
        Self {
            stores,
            notifier,
            clock,
            lookahead,
            sweeping: Mutex::new(()),
        }
    }

    pub async fn run_sweep(&self) -> SweepReport {
        let _sweeping = self.sweeping.lock().await;
        let now = self.clock.now();
        let due = match self.stores.sessions.due_for_reminder(now, now + self.lookahead).await {
            Ok(due) => due,
            Err(e) => {
                error!("Failed to load sessions due for a reminder: {}", e);
                return SweepReport {
                    error: Some(e.to_string()),
                    ..SweepReport::default()
                };
            }
        };

        let mut report = SweepReport::default();
        for session in &due {
            match self.remind(session).await {
                Ok(true) => report.processed += 1,
                Ok(false) => debug!(session = %session.id, "reminder handled by another sweep"),
                Err(e) => {
                    warn!(session = %session.id, error = %e, "failed to send session reminder");
                    report.failed += 1;
                }
            }
        }

        info!(
            due = due.len(),
            processed = report.processed,
            failed = report.failed,
            "reminder sweep finished"
        );
        report
    }

    /// `Ok(false)` when another sweep owns or already finished the session.
    async fn remind(&self, session: &Session) -> Result<bool> {
        let stale_before = self.clock.now() - Duration::minutes(CLAIM_LEASE_MINUTES);
        if !self.stores.sessions.claim_reminder(session.id, stale_before).await? {
            return Ok(false);
        }

        if let Err(e) = self.send_reminders(session).await {
            if let Err(release) = self.stores.sessions.release_reminder(session.id).await {
                warn!(session = %session.id, error = %release, "failed to release reminder claim");
            }
            return Err(e);
        }

        self.stores.sessions.mark_reminder_sent(session.id).await
    }

    async fn send_reminders(&self, session: &Session) -> Result<()> {
        let course = self.course_name(session.course_id).await.unwrap_or_else(|| "your course".to_string());
        let tutor = self.user_name(session.tutor_id).await.unwrap_or_else(|| "your tutor".to_string());
        let student = self.user_name(session.student_id).await.unwrap_or_else(|| "your student".to_string());

        for (recipient, other) in [(session.student_id, &tutor), (session.tutor_id, &student)] {
            self.notifier
                .notify(Notification::about_session(
                    recipient,
                    NotificationKind::SessionReminder,
                    "Upcoming Session Reminder",
                    format!(
                        "Your session for {} with {} is scheduled in less than {} hours.",
                        course,
                        other,
                        self.lookahead.num_hours()
                    ),
                    session.id,
                ))
                .await?;
        }
        Ok(())
    }

    async fn course_name(&self, id: Uuid) -> Option<String> {
        self.stores.directory.get_course(id).await.ok().flatten().map(|c| c.name)
    }

    async fn user_name(&self, id: Uuid) -> Option<String> {
        self.stores.directory.get_user(id).await.ok().flatten().map(|u| u.name)
    }

    /// Runs a sweep on behalf of an admin.
    pub async fn trigger(&self, caller_id: Uuid) -> Result<SweepReport> {
        require_role(
            self.stores.directory.as_ref(),
            caller_id,
            Role::Admin,
            "trigger reminders manually",
        )
        .await?;
        info!(admin = %caller_id, "manual reminder sweep");
        Ok(self.run_sweep().await)
    }

    /// Sweeps immediately, then once per `every`, until the handle is stopped
    /// or dropped.
    pub fn start(self: &Arc<Self>, every: std::time::Duration) -> ReminderHandle {
        let (shutdown, mut stopped) = oneshot::channel::<()>();
        let scheduler = Arc::clone(self);
        let every = every.max(SHORTEST_PERIOD);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Reminder scheduler started, sweeping every {:?}", every);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        scheduler.run_sweep().await;
                    }
                }
            }
            info!("Reminder scheduler stopped");
        });

        ReminderHandle {
            shutdown: Some(shutdown),
            task,
        }
    }
}

pub struct ReminderHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReminderHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signals the loop and waits for an in-flight sweep to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = self.task.await {
            error!("Reminder scheduler task failed: {}", e);
        }
    }
}
