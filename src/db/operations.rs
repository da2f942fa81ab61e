use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::models::{
    AvailabilityRow, AvailabilityWindow, Course, Feedback, Participant, Recurrence, Session, SessionFilter,
    SessionRow, SessionStatus, User,
};
use crate::db::{AvailabilityStore, Directory, SessionStore};
use crate::error::{AppError, DatabaseError};
use crate::time;
use crate::Result;

const SESSION_COLUMNS: &str = "id, course_id, tutor_id, student_id, start_time, end_time, status, \
    meeting_link, notes, feedback_rating, feedback_comment, feedback_submitted_at, reminder_sent, \
    created_at, updated_at";

const WINDOW_COLUMNS: &str =
    "id, tutor_id, is_recurring, day_of_week, on_date, start_minute, end_minute, created_at, updated_at";

pub struct DbOperations {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl DbOperations {
    pub fn new(pool: Arc<PgPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| AppError::DatabaseError(DatabaseError::ConnectionError(e.to_string())))?;

        Ok(Self::new(Arc::new(pool), clock))
    }

    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;
        Ok(())
    }

    pub async fn get_pool_status(&self) -> Result<DbPoolStatus> {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        let active = size.saturating_sub(idle);

        Ok(DbPoolStatus {
            total_connections: size,
            active_connections: active,
            idle_connections: idle,
        })
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.pool.as_ref().begin().await?)
    }

    /// Serializes bookings per tutor until the transaction ends.
    async fn lock_tutor(&self, tutor_id: Uuid, transaction: &mut Transaction<'_, Postgres>) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_key(tutor_id))
            .execute(&mut **transaction)
            .await?;
        Ok(())
    }

    async fn conflict_exists_with_transaction(
        &self,
        tutor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM sessions
                WHERE tutor_id = $1
                  AND status IN ('pending', 'confirmed')
                  AND start_time < $3
                  AND end_time > $2
            )
            "#,
        )
        .bind(tutor_id)
        .bind(start)
        .bind(end)
        .fetch_one(&mut **transaction)
        .await?;

        Ok(exists)
    }

    async fn create_session_with_transaction(
        &self,
        session: &Session,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<Session> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            INSERT INTO sessions (id, course_id, tutor_id, student_id, start_time, end_time, status,
                                  meeting_link, notes, reminder_sent, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(session.id)
        .bind(session.course_id)
        .bind(session.tutor_id)
        .bind(session.student_id)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.status)
        .bind(&session.meeting_link)
        .bind(&session.notes)
        .bind(session.reminder_sent)
        .bind(session.created_at)
        .bind(self.clock.now())
        .fetch_one(&mut **transaction)
        .await?;

        Ok(row.into())
    }

    /// Locks the tutor, re-checks for overlap and inserts, all inside `transaction`.
    async fn create_free_session_with_transaction(
        &self,
        session: &Session,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<Session> {
        self.lock_tutor(session.tutor_id, transaction).await?;
        if self
            .conflict_exists_with_transaction(session.tutor_id, session.start_time, session.end_time, transaction)
            .await?
        {
            return Err(AppError::Conflict(
                "The selected time conflicts with another booking".to_string(),
            ));
        }
        self.create_session_with_transaction(session, transaction).await
    }

    async fn fetch_session_where(&self, clause: &str, id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE {clause}"
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(Session::from))
    }
}

/// Stable 64-bit advisory lock key for a tutor.
fn advisory_key(tutor_id: Uuid) -> i64 {
    let (high, low) = tutor_id.as_u64_pair();
    (high ^ low) as i64
}

fn recurrence_columns(recurrence: &Recurrence) -> (bool, Option<i16>, Option<NaiveDate>) {
    match *recurrence {
        Recurrence::Weekly { day_of_week } => (true, Some(day_of_week as i16), None),
        Recurrence::OnDate { date } => (false, None, Some(date)),
    }
}

#[async_trait]
impl Directory for DbOperations {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, name, email, role, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(user)
    }

    async fn get_course(&self, id: Uuid) -> Result<Option<Course>> {
        let course = sqlx::query_as::<_, Course>(
            "SELECT id, tutor_id, name, created_at FROM courses WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(course)
    }
}

#[async_trait]
impl AvailabilityStore for DbOperations {
    async fn insert_window(&self, window: &AvailabilityWindow) -> Result<AvailabilityWindow> {
        let (is_recurring, day_of_week, on_date) = recurrence_columns(&window.recurrence);
        let now = self.clock.now();
        let row = sqlx::query_as::<_, AvailabilityRow>(&format!(
            r#"
            INSERT INTO availability_windows
                (id, tutor_id, is_recurring, day_of_week, on_date, start_minute, end_minute, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING {WINDOW_COLUMNS}
            "#
        ))
        .bind(window.id)
        .bind(window.tutor_id)
        .bind(is_recurring)
        .bind(day_of_week)
        .bind(on_date)
        .bind(window.start_time.minutes() as i16)
        .bind(window.end_time.minutes() as i16)
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await?;

        row.try_into()
    }

    async fn get_window(&self, id: Uuid) -> Result<Option<AvailabilityWindow>> {
        let row = sqlx::query_as::<_, AvailabilityRow>(&format!(
            "SELECT {WINDOW_COLUMNS} FROM availability_windows WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(AvailabilityWindow::try_from).transpose()
    }

    async fn update_window(&self, window: &AvailabilityWindow) -> Result<Option<AvailabilityWindow>> {
        let (is_recurring, day_of_week, on_date) = recurrence_columns(&window.recurrence);
        let row = sqlx::query_as::<_, AvailabilityRow>(&format!(
            r#"
            UPDATE availability_windows
            SET is_recurring = $2, day_of_week = $3, on_date = $4,
                start_minute = $5, end_minute = $6, updated_at = $7
            WHERE id = $1
            RETURNING {WINDOW_COLUMNS}
            "#
        ))
        .bind(window.id)
        .bind(is_recurring)
        .bind(day_of_week)
        .bind(on_date)
        .bind(window.start_time.minutes() as i16)
        .bind(window.end_time.minutes() as i16)
        .bind(self.clock.now())
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(AvailabilityWindow::try_from).transpose()
    }

    async fn delete_window(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM availability_windows WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn windows_for_tutor(&self, tutor_id: Uuid) -> Result<Vec<AvailabilityWindow>> {
        let rows = sqlx::query_as::<_, AvailabilityRow>(&format!(
            "SELECT {WINDOW_COLUMNS} FROM availability_windows WHERE tutor_id = $1 ORDER BY created_at, id"
        ))
        .bind(tutor_id)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter().map(AvailabilityWindow::try_from).collect()
    }

    async fn windows_for_date(&self, tutor_id: Uuid, date: NaiveDate) -> Result<Vec<AvailabilityWindow>> {
        let rows = sqlx::query_as::<_, AvailabilityRow>(&format!(
            r#"
            SELECT {WINDOW_COLUMNS} FROM availability_windows
            WHERE tutor_id = $1
              AND ((is_recurring AND day_of_week = $2) OR (NOT is_recurring AND on_date = $3))
            "#
        ))
        .bind(tutor_id)
        .bind(time::day_of_week(date) as i16)
        .bind(date)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter().map(AvailabilityWindow::try_from).collect()
    }
}

#[async_trait]
impl SessionStore for DbOperations {
    async fn insert_session_if_free(&self, session: &Session) -> Result<Session> {
        let mut transaction = self.begin_transaction().await?;

        let result = self.create_free_session_with_transaction(session, &mut transaction).await;

        match result {
            Ok(session) => {
                transaction.commit().await?;
                Ok(session)
            }
            Err(e) => {
                transaction.rollback().await?;
                Err(e)
            }
        }
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.fetch_session_where("id = $1", id).await
    }

    async fn has_conflict(
        &self,
        tutor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM sessions
                WHERE tutor_id = $1
                  AND status IN ('pending', 'confirmed')
                  AND start_time < $3
                  AND end_time > $2
                  AND ($4::uuid IS NULL OR id <> $4)
            )
            "#,
        )
        .bind(tutor_id)
        .bind(start)
        .bind(end)
        .bind(exclude)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(exists)
    }

    async fn active_sessions_between(
        &self,
        tutor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE tutor_id = $1
              AND status IN ('pending', 'confirmed')
              AND start_time < $3
              AND end_time > $2
            ORDER BY start_time
            "#
        ))
        .bind(tutor_id)
        .bind(from)
        .bind(to)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(Session::from).collect())
    }

    async fn sessions_for(&self, participant: Participant, filter: &SessionFilter) -> Result<Vec<Session>> {
        let (column, user_id) = match participant {
            Participant::Tutor(id) => ("tutor_id", id),
            Participant::Student(id) => ("student_id", id),
        };
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE {column} = $1
              AND ($2::session_status IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR start_time >= $3)
              AND ($4::timestamptz IS NULL OR start_time <= $4)
            ORDER BY start_time, id
            "#
        ))
        .bind(user_id)
        .bind(filter.status)
        .bind(filter.from)
        .bind(filter.to)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(Session::from).collect())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        meeting_link: Option<String>,
    ) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            UPDATE sessions
            SET status = $3, meeting_link = COALESCE($4, meeting_link), updated_at = $5
            WHERE id = $1 AND status = $2
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(meeting_link)
        .bind(self.clock.now())
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(Session::from))
    }

    async fn record_feedback(&self, id: Uuid, feedback: &Feedback) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            UPDATE sessions
            SET feedback_rating = $2, feedback_comment = $3, feedback_submitted_at = $4, updated_at = $5
            WHERE id = $1 AND status = 'completed' AND feedback_submitted_at IS NULL
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(feedback.rating as i16)
        .bind(&feedback.comment)
        .bind(feedback.submitted_at)
        .bind(self.clock.now())
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(Session::from))
    }

    async fn set_notes(&self, id: Uuid, notes: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "UPDATE sessions SET notes = $2, updated_at = $3 WHERE id = $1 RETURNING {SESSION_COLUMNS}"
        ))
        .bind(id)
        .bind(notes)
        .bind(self.clock.now())
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(Session::from))
    }

    async fn due_for_reminder(&self, after: DateTime<Utc>, before: DateTime<Utc>) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE status = 'confirmed'
              AND NOT reminder_sent
              AND start_time > $1
              AND start_time < $2
            ORDER BY start_time
            "#
        ))
        .bind(after)
        .bind(before)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(Session::from).collect())
    }

    async fn claim_reminder(&self, id: Uuid, stale_before: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET reminder_claimed_at = $2
            WHERE id = $1
              AND status = 'confirmed'
              AND NOT reminder_sent
              AND (reminder_claimed_at IS NULL OR reminder_claimed_at < $3)
            "#,
        )
        .bind(id)
        .bind(self.clock.now())
        .bind(stale_before)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_reminder(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET reminder_claimed_at = NULL WHERE id = $1 AND NOT reminder_sent")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn mark_reminder_sent(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET reminder_sent = TRUE, reminder_claimed_at = NULL, updated_at = $2
            WHERE id = $1 AND NOT reminder_sent
            "#,
        )
        .bind(id)
        .bind(self.clock.now())
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
pub struct DbPoolStatus {
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
}
