use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::{
    Course, Feedback, Participant, Role, Session, SessionFilter, SessionStatus, Stores, User,
};
use crate::error::AppError;
use crate::notify::{notify_best_effort, Notification, NotificationKind, Notifier};
use crate::scheduling::availability::AvailabilityService;
use crate::scheduling::{load_caller, require_role};
use crate::time::{self, at_wall_clock, WallClock};
use crate::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub course_id: Uuid,
    pub start_date: String,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub status: SessionStatus,
    pub meeting_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    pub rating: i64,
    pub comment: Option<String>,
}

/// Booking and the session lifecycle.
///
/// ```text
/// pending ──> confirmed ──> completed
///    │            │
///    └────────────┴──> cancelled
/// ```
///
/// `completed` and `cancelled` are terminal.
pub struct SessionService {
    stores: Stores,
    availability: Arc<AvailabilityService>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl SessionService {
    pub fn new(
        stores: Stores,
        availability: Arc<AvailabilityService>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            stores,
            availability,
            notifier,
            clock,
        }
    }

    pub async fn book(&self, student_id: Uuid, request: BookingRequest) -> Result<Session> {
        let invalid_time = || AppError::Validation("Invalid time format. Use HH:MM in 24-hour format.".to_string());
        let start: WallClock = request.start_time.parse().map_err(|_| invalid_time())?;
        let end: WallClock = request.end_time.parse().map_err(|_| invalid_time())?;
        let date = time::parse_date(&request.start_date)?;
        if !time::is_end_after_start(start, end) {
            return Err(AppError::Validation("End time must be after start time.".to_string()));
        }

        let offset = self.availability.rules().offset;
        let start_time = at_wall_clock(date, start, offset);
        let end_time = at_wall_clock(date, end, offset);
        if start_time <= self.clock.now() {
            return Err(AppError::Validation("Session must be scheduled for the future.".to_string()));
        }

        require_role(self.stores.directory.as_ref(), student_id, Role::Student, "book sessions").await?;

        let course = self.course(request.course_id).await?;
        match self.stores.directory.get_user(course.tutor_id).await? {
            Some(tutor) if tutor.role == Role::Tutor => {}
            _ => return Err(AppError::NotFound("Tutor not found".to_string())),
        }

        if !self.availability.is_available(course.tutor_id, start_time, end_time).await? {
            warn!(tutor = %course.tutor_id, %start_time, %end_time, "booking outside availability");
            return Err(AppError::NotAvailable(
                "The selected time is not within the tutor's available hours.".to_string(),
            ));
        }

        let session = Session::new_pending(
            course.id,
            course.tutor_id,
            student_id,
            start_time,
            end_time,
            self.clock.now(),
        );
        let session = match self.stores.sessions.insert_session_if_free(&session).await {
            Ok(session) => session,
            Err(e) => {
                if matches!(e, AppError::Conflict(_)) {
                    warn!(tutor = %course.tutor_id, %start_time, %end_time, "booking conflicts with another session");
                }
                return Err(e);
            }
        };
        info!(session = %session.id, tutor = %session.tutor_id, student = %student_id, "session booked");

        notify_best_effort(
            self.notifier.as_ref(),
            Notification::about_session(
                session.tutor_id,
                NotificationKind::SessionRequest,
                "New Session Request",
                format!(
                    "You have a new session request for {} on {} at {}.",
                    course.name, request.start_date, request.start_time
                ),
                session.id,
            ),
        )
        .await;

        Ok(session)
    }

    pub async fn update_status(&self, actor_id: Uuid, session_id: Uuid, change: StatusChange) -> Result<Session> {
        let (actor, session) = self.participant_session(actor_id, session_id, "update").await?;
        let from = session.status;
        let to = change.status;

        if from.is_terminal() || to == SessionStatus::Pending {
            return Err(AppError::InvalidTransition { from, to });
        }

        let is_tutor = session.tutor_id == actor.id && actor.role == Role::Tutor;
        match to {
            SessionStatus::Confirmed => {
                if !is_tutor {
                    return Err(AppError::Forbidden("Only tutors can confirm sessions".to_string()));
                }
                if from != SessionStatus::Pending {
                    return Err(AppError::InvalidTransition { from, to });
                }
            }
            SessionStatus::Completed => {
                if !is_tutor {
                    return Err(AppError::Forbidden("Only tutors can mark sessions as completed".to_string()));
                }
                if from != SessionStatus::Confirmed {
                    return Err(AppError::InvalidTransition { from, to });
                }
                if self.clock.now() < session.end_time {
                    return Err(AppError::Validation(
                        "Cannot mark a future session as completed.".to_string(),
                    ));
                }
            }
            SessionStatus::Cancelled | SessionStatus::Pending => {}
        }

        let meeting_link = change.meeting_link.filter(|link| !link.trim().is_empty());
        let updated = match self
            .stores
            .sessions
            .transition_status(session_id, from, to, meeting_link)
            .await?
        {
            Some(updated) => updated,
            None => {
                // Someone else moved the session first
                let current = self.find_session(session_id).await?;
                warn!(session = %session_id, expected = %from, found = %current.status, "lost status race");
                return Err(AppError::InvalidTransition { from: current.status, to });
            }
        };
        info!(session = %session_id, actor = %actor_id, %from, %to, "session status changed");

        let course_name = self.course_name(updated.course_id).await;
        let (title, message) = match to {
            SessionStatus::Confirmed => (
                "Session Confirmed",
                format!("Your session for {} has been confirmed by the tutor.", course_name),
            ),
            SessionStatus::Completed => (
                "Session Completed",
                format!(
                    "Your session for {} has been marked as completed. Please provide feedback.",
                    course_name
                ),
            ),
            _ => (
                "Session Cancelled",
                format!(
                    "Your session for {} has been cancelled by the {}.",
                    course_name,
                    if updated.tutor_id == actor_id { "tutor" } else { "student" }
                ),
            ),
        };
        notify_best_effort(
            self.notifier.as_ref(),
            Notification::about_session(
                updated.counterparty(actor_id),
                NotificationKind::SessionUpdate,
                title,
                message,
                updated.id,
            ),
        )
        .await;

        Ok(updated)
    }

    pub async fn submit_feedback(&self, student_id: Uuid, session_id: Uuid, request: FeedbackRequest) -> Result<Session> {
        let rating = u8::try_from(request.rating)
            .ok()
            .filter(|r| (1..=5).contains(r))
            .ok_or_else(|| AppError::Validation("Rating must be between 1 and 5.".to_string()))?;

        load_caller(self.stores.directory.as_ref(), student_id).await?;
        let session = self.find_session(session_id).await?;
        if session.student_id != student_id {
            return Err(AppError::Forbidden(
                "Only the student can submit feedback for a session".to_string(),
            ));
        }
        if session.status != SessionStatus::Completed {
            return Err(AppError::Validation(
                "Feedback can only be submitted for completed sessions.".to_string(),
            ));
        }
        if session.feedback.is_some() {
            return Err(AppError::AlreadySubmitted);
        }

        let feedback = Feedback {
            rating,
            comment: request.comment.filter(|c| !c.trim().is_empty()),
            submitted_at: self.clock.now(),
        };
        let updated = self
            .stores
            .sessions
            .record_feedback(session_id, &feedback)
            .await?
            .ok_or(AppError::AlreadySubmitted)?;
        info!(session = %session_id, rating, "feedback submitted");

        notify_best_effort(
            self.notifier.as_ref(),
            Notification::about_session(
                updated.tutor_id,
                NotificationKind::SessionFeedback,
                "Session Feedback Received",
                "You've received feedback for your session.",
                updated.id,
            ),
        )
        .await;

        Ok(updated)
    }

    /// Whether an active session of the tutor overlaps `[start, end)`.
    pub async fn check_conflict(
        &self,
        tutor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> Result<bool> {
        self.stores.sessions.has_conflict(tutor_id, start, end, exclude).await
    }

    pub async fn list_mine(&self, user_id: Uuid, filter: &SessionFilter) -> Result<Vec<Session>> {
        let user = load_caller(self.stores.directory.as_ref(), user_id).await?;
        let participant = match user.role {
            Role::Tutor => Participant::Tutor(user.id),
            Role::Student => Participant::Student(user.id),
            Role::Admin => {
                return Err(AppError::Forbidden("Only tutors and students have sessions".to_string()))
            }
        };
        self.stores.sessions.sessions_for(participant, filter).await
    }

    pub async fn get(&self, user_id: Uuid, session_id: Uuid) -> Result<Session> {
        let (_, session) = self.participant_session(user_id, session_id, "access").await?;
        Ok(session)
    }

    pub async fn add_notes(&self, user_id: Uuid, session_id: Uuid, notes: &str) -> Result<Session> {
        if notes.trim().is_empty() {
            return Err(AppError::Validation("Notes are required.".to_string()));
        }
        self.participant_session(user_id, session_id, "update").await?;
        let updated = self
            .stores
            .sessions
            .set_notes(session_id, notes)
            .await?
            .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;
        info!(session = %session_id, user = %user_id, "session notes updated");
        Ok(updated)
    }

    async fn find_session(&self, id: Uuid) -> Result<Session> {
        self.stores
            .sessions
            .get_session(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Session not found".to_string()))
    }

    async fn participant_session(&self, user_id: Uuid, session_id: Uuid, action: &str) -> Result<(User, Session)> {
        let user = load_caller(self.stores.directory.as_ref(), user_id).await?;
        let session = self.find_session(session_id).await?;
        if !session.is_participant(user_id) {
            warn!(user = %user_id, session = %session_id, "rejected non-participant");
            return Err(AppError::Forbidden(format!("Not authorized to {} this session", action)));
        }
        Ok((user, session))
    }

    async fn course(&self, id: Uuid) -> Result<Course> {
        self.stores
            .directory
            .get_course(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Course not found".to_string()))
    }

    async fn course_name(&self, id: Uuid) -> String {
        match self.stores.directory.get_course(id).await {
            Ok(Some(course)) => course.name,
            _ => "your course".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{MemoryStore, NewAvailability, SessionStore};
    use crate::notify::{MockNotifier, RecordingNotifier};
    use crate::scheduling::SchedulingRules;
    use chrono::{Duration, TimeZone};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
        service: SessionService,
        tutor: User,
        student: User,
        course: Course,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let tutor = store.insert_user(User::new("Ada", "ada@example.com", Role::Tutor)).await;
        let student = store.insert_user(User::new("Sam", "sam@example.com", Role::Student)).await;
        let course = store.insert_course(Course::new(tutor.id, "Algebra")).await;

        let stores = Stores::memory(store.clone());
        let availability = Arc::new(AvailabilityService::new(stores.clone(), clock.clone(), SchedulingRules::default()));
        availability
            .add(
                tutor.id,
                NewAvailability {
                    day_of_week: Some(1),
                    start_time: "09:00".to_string(),
                    end_time: "17:00".to_string(),
                    is_recurring: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let notifier = Arc::new(RecordingNotifier::new());
        let service = SessionService::new(stores, availability, notifier.clone(), clock.clone());
        Fixture { store, clock, notifier, service, tutor, student, course }
    }

    fn monday(course_id: Uuid, start: &str, end: &str) -> BookingRequest {
        BookingRequest {
            course_id,
            start_date: "2026-10-19".to_string(),
            start_time: start.to_string(),
            end_time: end.to_string(),
        }
    }

    fn change(status: SessionStatus) -> StatusChange {
        StatusChange { status, meeting_link: None }
    }

    #[tokio::test]
    async fn test_book_scenario() {
        let f = fixture().await;
        let other = f.store.insert_user(User::new("Kim", "kim@example.com", Role::Student)).await;

        let session = f.service.book(f.student.id, monday(f.course.id, "10:00", "11:00")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.tutor_id, f.tutor.id);
        assert_eq!(session.duration_minutes(), 60);

        let err = f.service.book(other.id, monday(f.course.id, "10:30", "11:30")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let err = f.service.book(other.id, monday(f.course.id, "08:00", "08:30")).await.unwrap_err();
        assert!(matches!(err, AppError::NotAvailable(_)));

        // Touching the existing session is fine
        f.service.book(other.id, monday(f.course.id, "11:00", "11:30")).await.unwrap();

        let requests = f.notifier.delivered_to(f.tutor.id).await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].kind, NotificationKind::SessionRequest);
        assert_eq!(
            requests[0].message,
            "You have a new session request for Algebra on 2026-10-19 at 10:00."
        );
    }

    #[tokio::test]
    async fn test_book_validation() {
        let f = fixture().await;

        let err = f.service.book(f.student.id, monday(f.course.id, "25:00", "26:00")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = f.service.book(f.student.id, monday(f.course.id, "11:00", "10:00")).await.unwrap_err();
        assert_eq!(err.to_string(), "Validation error: End time must be after start time.");

        let past = BookingRequest { start_date: "2026-10-12".to_string(), ..monday(f.course.id, "10:00", "11:00") };
        let err = f.service.book(f.student.id, past).await.unwrap_err();
        assert_eq!(err.to_string(), "Validation error: Session must be scheduled for the future.");

        let err = f.service.book(f.tutor.id, monday(f.course.id, "10:00", "11:00")).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = f.service.book(f.student.id, monday(Uuid::new_v4(), "10:00", "11:00")).await.unwrap_err();
        assert_eq!(err.to_string(), "Not found: Course not found");

        assert_eq!(f.store.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_booking_fails_when_tutor_missing() {
        let f = fixture().await;
        let orphan = f.store.insert_course(Course::new(Uuid::new_v4(), "Orphaned")).await;
        let err = f.service.book(f.student.id, monday(orphan.id, "10:00", "11:00")).await.unwrap_err();
        assert_eq!(err.to_string(), "Not found: Tutor not found");
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let f = fixture().await;
        let session = f.service.book(f.student.id, monday(f.course.id, "10:00", "11:00")).await.unwrap();

        let err = f.service.update_status(f.student.id, session.id, change(SessionStatus::Confirmed)).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let confirmed = f
            .service
            .update_status(
                f.tutor.id,
                session.id,
                StatusChange {
                    status: SessionStatus::Confirmed,
                    meeting_link: Some("https://meet.example.com/abc".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(confirmed.status, SessionStatus::Confirmed);
        assert_eq!(confirmed.meeting_link.as_deref(), Some("https://meet.example.com/abc"));

        let err = f.service.update_status(f.tutor.id, session.id, change(SessionStatus::Confirmed)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        let err = f.service.update_status(f.tutor.id, session.id, change(SessionStatus::Completed)).await.unwrap_err();
        assert_eq!(err.to_string(), "Validation error: Cannot mark a future session as completed.");

        f.clock.set(Utc.with_ymd_and_hms(2026, 10, 19, 11, 0, 0).unwrap());
        let completed = f.service.update_status(f.tutor.id, session.id, change(SessionStatus::Completed)).await.unwrap();
        assert_eq!(completed.status, SessionStatus::Completed);

        for status in [SessionStatus::Cancelled, SessionStatus::Confirmed, SessionStatus::Completed, SessionStatus::Pending] {
            let err = f.service.update_status(f.tutor.id, session.id, change(status)).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidTransition { from: SessionStatus::Completed, .. }));
        }

        let updates = f.notifier.delivered_to(f.student.id).await;
        let titles: Vec<&str> = updates.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["Session Confirmed", "Session Completed"]);
    }

    #[tokio::test]
    async fn test_cancel_by_either_party() {
        let f = fixture().await;
        let outsider = f.store.insert_user(User::new("Eve", "eve@example.com", Role::Student)).await;
        let session = f.service.book(f.student.id, monday(f.course.id, "10:00", "11:00")).await.unwrap();

        let err = f.service.update_status(outsider.id, session.id, change(SessionStatus::Cancelled)).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let cancelled = f.service.update_status(f.student.id, session.id, change(SessionStatus::Cancelled)).await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);

        let notice = f.notifier.delivered_to(f.tutor.id).await;
        let last = notice.last().unwrap();
        assert_eq!(last.kind, NotificationKind::SessionUpdate);
        assert_eq!(last.message, "Your session for Algebra has been cancelled by the student.");

        // The slot is free again
        f.service.book(outsider.id, monday(f.course.id, "10:00", "11:00")).await.unwrap();
    }

    #[tokio::test]
    async fn test_feedback() {
        let f = fixture().await;
        let session = f.service.book(f.student.id, monday(f.course.id, "10:00", "11:00")).await.unwrap();
        let feedback = |rating| FeedbackRequest { rating, comment: Some("Great".to_string()) };

        let err = f.service.submit_feedback(f.student.id, session.id, feedback(4)).await.unwrap_err();
        assert_eq!(err.to_string(), "Validation error: Feedback can only be submitted for completed sessions.");

        f.service.update_status(f.tutor.id, session.id, change(SessionStatus::Confirmed)).await.unwrap();
        f.clock.advance(Duration::days(4));
        f.service.update_status(f.tutor.id, session.id, change(SessionStatus::Completed)).await.unwrap();

        for rating in [0, 6, -1] {
            let err = f.service.submit_feedback(f.student.id, session.id, feedback(rating)).await.unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }
        let err = f.service.submit_feedback(f.tutor.id, session.id, feedback(5)).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let rated = f.service.submit_feedback(f.student.id, session.id, feedback(5)).await.unwrap();
        assert_eq!(rated.feedback.as_ref().map(|fb| fb.rating), Some(5));

        let err = f.service.submit_feedback(f.student.id, session.id, feedback(3)).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadySubmitted));

        assert_eq!(f.notifier.count_of(NotificationKind::SessionFeedback).await, 1);
    }

    #[tokio::test]
    async fn test_listing_access_and_notes() {
        let f = fixture().await;
        let admin = f.store.insert_user(User::new("Root", "root@example.com", Role::Admin)).await;
        let first = f.service.book(f.student.id, monday(f.course.id, "13:00", "14:00")).await.unwrap();
        let second = f.service.book(f.student.id, monday(f.course.id, "10:00", "11:00")).await.unwrap();

        let mine = f.service.list_mine(f.student.id, &SessionFilter::default()).await.unwrap();
        assert_eq!(mine.iter().map(|s| s.id).collect::<Vec<_>>(), vec![second.id, first.id]);
        assert_eq!(f.service.list_mine(f.tutor.id, &SessionFilter::default()).await.unwrap().len(), 2);
        assert!(matches!(
            f.service.list_mine(admin.id, &SessionFilter::default()).await,
            Err(AppError::Forbidden(_))
        ));

        f.service.update_status(f.tutor.id, first.id, change(SessionStatus::Confirmed)).await.unwrap();
        let filter = SessionFilter { status: Some(SessionStatus::Confirmed), ..Default::default() };
        assert_eq!(f.service.list_mine(f.tutor.id, &filter).await.unwrap().len(), 1);

        assert!(matches!(f.service.get(admin.id, first.id).await, Err(AppError::Forbidden(_))));
        assert_eq!(f.service.get(f.tutor.id, first.id).await.unwrap().id, first.id);
        assert!(matches!(f.service.get(f.tutor.id, Uuid::new_v4()).await, Err(AppError::NotFound(_))));

        assert!(matches!(f.service.add_notes(f.tutor.id, first.id, "  ").await, Err(AppError::Validation(_))));
        let noted = f.service.add_notes(f.tutor.id, first.id, "Bring worksheet 3").await.unwrap();
        assert_eq!(noted.notes.as_deref(), Some("Bring worksheet 3"));
    }

    #[tokio::test]
    async fn test_check_conflict() {
        let f = fixture().await;
        let session = f.service.book(f.student.id, monday(f.course.id, "10:00", "11:00")).await.unwrap();
        let at = |h, m| Utc.with_ymd_and_hms(2026, 10, 19, h, m, 0).unwrap();

        assert!(f.service.check_conflict(f.tutor.id, at(10, 30), at(11, 30), None).await.unwrap());
        assert!(!f.service.check_conflict(f.tutor.id, at(11, 0), at(12, 0), None).await.unwrap());
        assert!(!f.service.check_conflict(f.tutor.id, at(10, 30), at(11, 30), Some(session.id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_booking() {
        let f = fixture().await;
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .times(1)
            .returning(|_| Err(AppError::InternalError("sink down".to_string())));

        let stores = Stores::memory(f.store.clone());
        let availability = Arc::new(AvailabilityService::new(stores.clone(), f.clock.clone(), SchedulingRules::default()));
        let service = SessionService::new(stores, availability, Arc::new(notifier), f.clock.clone());

        let session = service.book(f.student.id, monday(f.course.id, "10:00", "11:00")).await.unwrap();
        assert_eq!(f.store.get_session(session.id).await.unwrap().map(|s| s.status), Some(SessionStatus::Pending));
    }
}
