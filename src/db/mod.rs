//! Database module for the scheduling service
//!
//! Storage traits used by the scheduling core, with a PostgreSQL
//! implementation (`DbOperations`) and an in-memory one (`MemoryStore`).
//! Implementations stamp `updated_at` themselves on every mutating call.

pub mod memory;
pub mod models;
pub mod operations;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::Result;

pub use memory::MemoryStore;
pub use models::{
    AvailabilityPatch, AvailabilityWindow, Course, Feedback, NewAvailability, Participant, Recurrence,
    Role, Session, SessionFilter, SessionStatus, User,
};
pub use operations::DbOperations;

/// User and course lookups owned by the wider platform.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;

    async fn get_course(&self, id: Uuid) -> Result<Option<Course>>;
}

#[async_trait]
pub trait AvailabilityStore: Send + Sync {
    async fn insert_window(&self, window: &AvailabilityWindow) -> Result<AvailabilityWindow>;

    async fn get_window(&self, id: Uuid) -> Result<Option<AvailabilityWindow>>;

    /// Replaces the stored window; `None` if it no longer exists.
    async fn update_window(&self, window: &AvailabilityWindow) -> Result<Option<AvailabilityWindow>>;

    /// Returns whether a window was deleted.
    async fn delete_window(&self, id: Uuid) -> Result<bool>;

    async fn windows_for_tutor(&self, tutor_id: Uuid) -> Result<Vec<AvailabilityWindow>>;

    /// Weekly windows on the date's day of week plus windows pinned to the date.
    async fn windows_for_date(&self, tutor_id: Uuid, date: NaiveDate) -> Result<Vec<AvailabilityWindow>>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts `session` unless an active session of the same tutor overlaps it.
    ///
    /// The check and the insert are atomic with respect to other callers;
    /// an overlap fails with `AppError::Conflict`.
    async fn insert_session_if_free(&self, session: &Session) -> Result<Session>;

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>>;

    async fn has_conflict(
        &self,
        tutor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> Result<bool>;

    /// Active sessions of the tutor overlapping `[from, to)`.
    async fn active_sessions_between(
        &self,
        tutor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    /// Sessions of one participant, ordered by start time.
    async fn sessions_for(&self, participant: Participant, filter: &SessionFilter) -> Result<Vec<Session>>;

    /// Moves the session from `from` to `to` only if it is still in `from`.
    ///
    /// `None` means the session was not in `from` (or is gone).
    async fn transition_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        meeting_link: Option<String>,
    ) -> Result<Option<Session>>;

    /// Attaches feedback only to a completed session that has none yet.
    async fn record_feedback(&self, id: Uuid, feedback: &Feedback) -> Result<Option<Session>>;

    async fn set_notes(&self, id: Uuid, notes: &str) -> Result<Option<Session>>;

    /// Confirmed sessions without a reminder whose start lies strictly inside `(after, before)`.
    async fn due_for_reminder(&self, after: DateTime<Utc>, before: DateTime<Utc>) -> Result<Vec<Session>>;

    /// Takes the reminder of a confirmed, unreminded session for one sweep.
    ///
    /// Fails when another sweep holds a claim taken after `stale_before`;
    /// returns whether this call took it.
    async fn claim_reminder(&self, id: Uuid, stale_before: DateTime<Utc>) -> Result<bool>;

    /// Drops a claim so the next sweep retries the session.
    async fn release_reminder(&self, id: Uuid) -> Result<()>;

    /// Flips `reminder_sent` if it is still false and clears any claim;
    /// returns whether this call flipped it.
    async fn mark_reminder_sent(&self, id: Uuid) -> Result<bool>;
}

/// Handles to every store the scheduling core needs.
#[derive(Clone)]
pub struct Stores {
    pub directory: Arc<dyn Directory>,
    pub availability: Arc<dyn AvailabilityStore>,
    pub sessions: Arc<dyn SessionStore>,
}

impl Stores {
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            directory: store.clone(),
            availability: store.clone(),
            sessions: store,
        }
    }

    pub fn postgres(store: Arc<DbOperations>) -> Self {
        Self {
            directory: store.clone(),
            availability: store.clone(),
            sessions: store,
        }
    }
}
