use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::models::{
    AvailabilityWindow, Course, Feedback, Participant, Session, SessionFilter, SessionStatus, User,
};
use crate::db::{AvailabilityStore, Directory, SessionStore};
use crate::error::AppError;
use crate::time::periods_overlap;
use crate::Result;

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    courses: HashMap<Uuid, Course>,
    windows: HashMap<Uuid, AvailabilityWindow>,
    sessions: HashMap<Uuid, Session>,
    reminder_claims: HashMap<Uuid, DateTime<Utc>>,
}

impl MemoryState {
    fn conflicts(&self, tutor_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>, exclude: Option<Uuid>) -> bool {
        self.sessions.values().any(|s| {
            s.tutor_id == tutor_id
                && s.status.is_active()
                && Some(s.id) != exclude
                && periods_overlap(s.start_time, s.end_time, start, end)
        })
    }
}

/// In-process store with the same semantics as the PostgreSQL one.
///
/// Every compound operation runs under a single write guard.
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            clock,
        }
    }

    pub async fn insert_user(&self, user: User) -> User {
        self.state.write().await.users.insert(user.id, user.clone());
        user
    }

    pub async fn insert_course(&self, course: Course) -> Course {
        self.state.write().await.courses.insert(course.id, course.clone());
        course
    }

    /// Stores a session as-is, bypassing booking rules.
    pub async fn put_session(&self, session: Session) -> Session {
        self.state.write().await.sessions.insert(session.id, session.clone());
        session
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn all_sessions(&self) -> Vec<Session> {
        self.state.read().await.sessions.values().cloned().collect()
    }
}

#[async_trait]
impl Directory for MemoryStore {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn get_course(&self, id: Uuid) -> Result<Option<Course>> {
        Ok(self.state.read().await.courses.get(&id).cloned())
    }
}

#[async_trait]
impl AvailabilityStore for MemoryStore {
    async fn insert_window(&self, window: &AvailabilityWindow) -> Result<AvailabilityWindow> {
        let mut window = window.clone();
        let now = self.clock.now();
        window.created_at = now;
        window.updated_at = now;
        self.state.write().await.windows.insert(window.id, window.clone());
        Ok(window)
    }

    async fn get_window(&self, id: Uuid) -> Result<Option<AvailabilityWindow>> {
        Ok(self.state.read().await.windows.get(&id).cloned())
    }

    async fn update_window(&self, window: &AvailabilityWindow) -> Result<Option<AvailabilityWindow>> {
        let mut state = self.state.write().await;
        let Some(stored) = state.windows.get_mut(&window.id) else {
            return Ok(None);
        };
        stored.recurrence = window.recurrence;
        stored.start_time = window.start_time;
        stored.end_time = window.end_time;
        stored.updated_at = self.clock.now();
        Ok(Some(stored.clone()))
    }

    async fn delete_window(&self, id: Uuid) -> Result<bool> {
        Ok(self.state.write().await.windows.remove(&id).is_some())
    }

    async fn windows_for_tutor(&self, tutor_id: Uuid) -> Result<Vec<AvailabilityWindow>> {
        let state = self.state.read().await;
        let mut windows: Vec<_> = state
            .windows
            .values()
            .filter(|w| w.tutor_id == tutor_id)
            .cloned()
            .collect();
        windows.sort_by_key(|w| (w.created_at, w.id));
        Ok(windows)
    }

    async fn windows_for_date(&self, tutor_id: Uuid, date: NaiveDate) -> Result<Vec<AvailabilityWindow>> {
        let state = self.state.read().await;
        Ok(state
            .windows
            .values()
            .filter(|w| w.tutor_id == tutor_id && w.recurrence.applies_to(date))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session_if_free(&self, session: &Session) -> Result<Session> {
        let mut state = self.state.write().await;
        if state.conflicts(session.tutor_id, session.start_time, session.end_time, None) {
            return Err(AppError::Conflict(
                "The selected time conflicts with another booking".to_string(),
            ));
        }
        let mut session = session.clone();
        session.updated_at = self.clock.now();
        state.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.state.read().await.sessions.get(&id).cloned())
    }

    async fn has_conflict(
        &self,
        tutor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> Result<bool> {
        Ok(self.state.read().await.conflicts(tutor_id, start, end, exclude))
    }

    async fn active_sessions_between(
        &self,
        tutor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let state = self.state.read().await;
        let mut sessions: Vec<_> = state
            .sessions
            .values()
            .filter(|s| {
                s.tutor_id == tutor_id
                    && s.status.is_active()
                    && periods_overlap(s.start_time, s.end_time, from, to)
            })
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.start_time);
        Ok(sessions)
    }

    async fn sessions_for(&self, participant: Participant, filter: &SessionFilter) -> Result<Vec<Session>> {
        let state = self.state.read().await;
        let mut sessions: Vec<_> = state
            .sessions
            .values()
            .filter(|s| participant.matches(s) && filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| (s.start_time, s.id));
        Ok(sessions)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        meeting_link: Option<String>,
    ) -> Result<Option<Session>> {
        let mut state = self.state.write().await;
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if session.status != from {
            return Ok(None);
        }
        session.status = to;
        if let Some(link) = meeting_link {
            session.meeting_link = Some(link);
        }
        session.updated_at = self.clock.now();
        Ok(Some(session.clone()))
    }

    async fn record_feedback(&self, id: Uuid, feedback: &Feedback) -> Result<Option<Session>> {
        let mut state = self.state.write().await;
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if session.status != SessionStatus::Completed || session.feedback.is_some() {
            return Ok(None);
        }
        session.feedback = Some(feedback.clone());
        session.updated_at = self.clock.now();
        Ok(Some(session.clone()))
    }

    async fn set_notes(&self, id: Uuid, notes: &str) -> Result<Option<Session>> {
        let mut state = self.state.write().await;
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(None);
        };
        session.notes = Some(notes.to_string());
        session.updated_at = self.clock.now();
        Ok(Some(session.clone()))
    }

    async fn due_for_reminder(&self, after: DateTime<Utc>, before: DateTime<Utc>) -> Result<Vec<Session>> {
        let state = self.state.read().await;
        let mut sessions: Vec<_> = state
            .sessions
            .values()
            .filter(|s| {
                s.status == SessionStatus::Confirmed
                    && !s.reminder_sent
                    && s.start_time > after
                    && s.start_time < before
            })
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.start_time);
        Ok(sessions)
    }

    async fn claim_reminder(&self, id: Uuid, stale_before: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        let claimable = match state.sessions.get(&id) {
            Some(session) => session.status == SessionStatus::Confirmed && !session.reminder_sent,
            None => false,
        };
        let held = state
            .reminder_claims
            .get(&id)
            .map_or(false, |claimed_at| *claimed_at >= stale_before);
        if !claimable || held {
            return Ok(false);
        }
        state.reminder_claims.insert(id, self.clock.now());
        Ok(true)
    }

    async fn release_reminder(&self, id: Uuid) -> Result<()> {
        self.state.write().await.reminder_claims.remove(&id);
        Ok(())
    }

    async fn mark_reminder_sent(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        state.reminder_claims.remove(&id);
        match state.sessions.get_mut(&id) {
            Some(session) if !session.reminder_sent => {
                session.reminder_sent = true;
                session.updated_at = self.clock.now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
