use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, DatabaseError};
use crate::time::{self, WallClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Tutor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Tutor => "tutor",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(name: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            role,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: Uuid,
    pub tutor_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Course {
    pub fn new(tutor_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tutor_id,
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// When an availability window applies: every week on a given day, or on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "recurrence", rename_all = "snake_case")]
pub enum Recurrence {
    Weekly {
        #[serde(rename = "dayOfWeek")]
        day_of_week: u8,
    },
    OnDate {
        date: NaiveDate,
    },
}

impl Recurrence {
    pub fn is_recurring(&self) -> bool {
        matches!(self, Recurrence::Weekly { .. })
    }

    pub fn applies_to(&self, date: NaiveDate) -> bool {
        match *self {
            Recurrence::Weekly { day_of_week } => time::day_of_week(date) == day_of_week,
            Recurrence::OnDate { date: on } => on == date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityWindow {
    pub id: Uuid,
    pub tutor_id: Uuid,
    #[serde(flatten)]
    pub recurrence: Recurrence,
    pub start_time: WallClock,
    pub end_time: WallClock,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AvailabilityWindow {
    /// Inclusive containment of a single time-of-day, `[start, end]`.
    pub fn contains_time(&self, t: WallClock) -> bool {
        self.start_time <= t && t <= self.end_time
    }

    /// The whole `[start, end]` wall-clock span lies inside the window.
    pub fn contains_span(&self, start: WallClock, end: WallClock) -> bool {
        self.start_time <= start && end <= self.end_time
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct AvailabilityRow {
    pub id: Uuid,
    pub tutor_id: Uuid,
    pub is_recurring: bool,
    pub day_of_week: Option<i16>,
    pub on_date: Option<NaiveDate>,
    pub start_minute: i16,
    pub end_minute: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AvailabilityRow> for AvailabilityWindow {
    type Error = AppError;

    fn try_from(row: AvailabilityRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str| {
            AppError::DatabaseError(DatabaseError::CorruptRow(format!(
                "availability window {}: {}",
                row.id, what
            )))
        };
        let recurrence = match (row.is_recurring, row.day_of_week, row.on_date) {
            (true, Some(day), None) if (0..=6).contains(&day) => Recurrence::Weekly { day_of_week: day as u8 },
            (false, None, Some(date)) => Recurrence::OnDate { date },
            _ => return Err(corrupt("inconsistent recurrence")),
        };
        let minute = |m: i16| {
            u16::try_from(m)
                .ok()
                .and_then(WallClock::from_minutes)
                .ok_or_else(|| corrupt("time out of range"))
        };
        Ok(Self {
            id: row.id,
            tutor_id: row.tutor_id,
            recurrence,
            start_time: minute(row.start_minute)?,
            end_time: minute(row.end_minute)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Body of an availability creation request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAvailability {
    pub day_of_week: Option<i64>,
    pub date: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub is_recurring: Option<bool>,
}

/// Partial update of an availability window; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityPatch {
    pub day_of_week: Option<i64>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub is_recurring: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "session_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl SessionStatus {
    /// Active sessions hold their slot on the tutor's calendar.
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Cancelled | SessionStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Confirmed => "confirmed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub rating: u8,
    pub comment: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub course_id: Uuid,
    pub tutor_id: Uuid,
    pub student_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SessionStatus,
    pub meeting_link: Option<String>,
    pub notes: Option<String>,
    pub feedback: Option<Feedback>,
    pub reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new_pending(
        course_id: Uuid,
        tutor_id: Uuid,
        student_id: Uuid,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            course_id,
            tutor_id,
            student_id,
            start_time,
            end_time,
            status: SessionStatus::Pending,
            meeting_link: None,
            notes: None,
            feedback: None,
            reminder_sent: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end_time - self.start_time).num_minutes()
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.tutor_id == user_id || self.student_id == user_id
    }

    /// The other party of the session, from `actor`'s point of view.
    pub fn counterparty(&self, actor: Uuid) -> Uuid {
        if actor == self.tutor_id {
            self.student_id
        } else {
            self.tutor_id
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct SessionRow {
    pub id: Uuid,
    pub course_id: Uuid,
    pub tutor_id: Uuid,
    pub student_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SessionStatus,
    pub meeting_link: Option<String>,
    pub notes: Option<String>,
    pub feedback_rating: Option<i16>,
    pub feedback_comment: Option<String>,
    pub feedback_submitted_at: Option<DateTime<Utc>>,
    pub reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        let feedback = match (row.feedback_rating, row.feedback_submitted_at) {
            (Some(rating), Some(submitted_at)) => Some(Feedback {
                rating: rating.clamp(1, 5) as u8,
                comment: row.feedback_comment,
                submitted_at,
            }),
            _ => None,
        };
        Self {
            id: row.id,
            course_id: row.course_id,
            tutor_id: row.tutor_id,
            student_id: row.student_id,
            start_time: row.start_time,
            end_time: row.end_time,
            status: row.status,
            meeting_link: row.meeting_link,
            notes: row.notes,
            feedback,
            reminder_sent: row.reminder_sent,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Which side of a session a listing is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participant {
    Tutor(Uuid),
    Student(Uuid),
}

impl Participant {
    pub fn matches(&self, session: &Session) -> bool {
        match *self {
            Participant::Tutor(id) => session.tutor_id == id,
            Participant::Student(id) => session.student_id == id,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl SessionFilter {
    pub fn matches(&self, session: &Session) -> bool {
        self.status.map_or(true, |s| session.status == s)
            && self.from.map_or(true, |from| session.start_time >= from)
            && self.to.map_or(true, |to| session.start_time <= to)
    }
}
