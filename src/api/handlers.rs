use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::api::Caller;
use crate::db::{AvailabilityPatch, NewAvailability, Session, SessionFilter};
use crate::scheduling::{BookingRequest, FeedbackRequest, StatusChange};
use crate::{AppState, Result};

/// A session as returned to clients, with its derived length.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub duration_minutes: i64,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        let duration_minutes = session.duration_minutes();
        Self {
            session,
            duration_minutes,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NotesRequest {
    pub notes: String,
}

#[derive(Debug, Serialize)]
pub struct ReminderResponse {
    pub success: bool,
    pub count: usize,
    pub failed: usize,
    pub message: String,
}

pub async fn create_availability(
    caller: Caller,
    state: web::Data<AppState>,
    body: web::Json<NewAvailability>,
) -> Result<HttpResponse> {
    info!("Received availability request from {}", caller.id());
    let window = state.availability.add(caller.id(), body.into_inner()).await?;
    Ok(HttpResponse::Created().json(window))
}

pub async fn my_availability(caller: Caller, state: web::Data<AppState>) -> Result<HttpResponse> {
    let windows = state.availability.list_mine(caller.id()).await?;
    Ok(HttpResponse::Ok().json(windows))
}

pub async fn tutor_availability(state: web::Data<AppState>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let windows = state.availability.list_for_tutor(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(windows))
}

pub async fn update_availability(
    caller: Caller,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<AvailabilityPatch>,
) -> Result<HttpResponse> {
    let window = state
        .availability
        .update(caller.id(), path.into_inner(), body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(window))
}

pub async fn delete_availability(
    caller: Caller,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    state.availability.remove(caller.id(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "Availability removed" })))
}

pub async fn available_slots(
    state: web::Data<AppState>,
    path: web::Path<(Uuid, String)>,
) -> Result<HttpResponse> {
    let (tutor_id, date) = path.into_inner();
    let slots = state.availability.list_slots_for_date(tutor_id, &date).await?;
    Ok(HttpResponse::Ok().json(slots))
}

pub async fn book_session(
    caller: Caller,
    state: web::Data<AppState>,
    body: web::Json<BookingRequest>,
) -> Result<HttpResponse> {
    info!("Received booking request from {} for course {}", caller.id(), body.course_id);
    let session = state.sessions.book(caller.id(), body.into_inner()).await?;
    Ok(HttpResponse::Created().json(SessionView::from(session)))
}

pub async fn my_sessions(
    caller: Caller,
    state: web::Data<AppState>,
    filter: web::Query<SessionFilter>,
) -> Result<HttpResponse> {
    let sessions = state.sessions.list_mine(caller.id(), &filter).await?;
    let views: Vec<SessionView> = sessions.into_iter().map(SessionView::from).collect();
    Ok(HttpResponse::Ok().json(views))
}

pub async fn get_session(caller: Caller, state: web::Data<AppState>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let session = state.sessions.get(caller.id(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(SessionView::from(session)))
}

pub async fn update_session_status(
    caller: Caller,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<StatusChange>,
) -> Result<HttpResponse> {
    let session_id = path.into_inner();
    info!("Received status change to {} for session {} from {}", body.status, session_id, caller.id());
    let session = state
        .sessions
        .update_status(caller.id(), session_id, body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(SessionView::from(session)))
}

pub async fn submit_feedback(
    caller: Caller,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<FeedbackRequest>,
) -> Result<HttpResponse> {
    let session = state
        .sessions
        .submit_feedback(caller.id(), path.into_inner(), body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(SessionView::from(session)))
}

pub async fn add_session_notes(
    caller: Caller,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<NotesRequest>,
) -> Result<HttpResponse> {
    let session = state
        .sessions
        .add_notes(caller.id(), path.into_inner(), &body.notes)
        .await?;
    Ok(HttpResponse::Ok().json(SessionView::from(session)))
}

pub async fn send_reminders(caller: Caller, state: web::Data<AppState>) -> Result<HttpResponse> {
    let report = state.reminders.trigger(caller.id()).await?;
    let message = match &report.error {
        Some(e) => format!("Reminder sweep failed: {}", e),
        None => format!("Sent {} session reminders.", report.processed),
    };
    Ok(HttpResponse::Ok().json(ReminderResponse {
        success: report.is_success(),
        count: report.processed,
        failed: report.failed,
        message,
    }))
}
