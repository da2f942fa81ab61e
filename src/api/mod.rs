//! HTTP surface of the scheduling service
//!
//! Authentication happens upstream; the gateway forwards the caller's id in
//! the `X-User-Id` header.

pub mod handlers;

use actix_web::dev::Payload;
use actix_web::{web, FromRequest, HttpRequest};
use futures::future::{ready, Ready};
use uuid::Uuid;

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "X-User-Id";

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Uuid);

impl Caller {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

fn caller_from(req: &HttpRequest) -> Result<Caller, AppError> {
    let raw = req
        .headers()
        .get(USER_ID_HEADER)
        .ok_or_else(|| AppError::Unauthorized("Missing caller identity".to_string()))?;
    raw.to_str()
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .map(Caller)
        .ok_or_else(|| AppError::Unauthorized("Invalid caller identity".to_string()))
}

impl FromRequest for Caller {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(caller_from(req))
    }
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _| AppError::Validation(format!("Invalid request body: {}", err)).into())
}

fn path_config() -> web::PathConfig {
    web::PathConfig::default()
        .error_handler(|err, _| AppError::Validation(format!("Invalid path: {}", err)).into())
}

fn query_config() -> web::QueryConfig {
    web::QueryConfig::default()
        .error_handler(|err, _| AppError::Validation(format!("Invalid query: {}", err)).into())
}

/// Registers every scheduling route; `AppState` must be provided as app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .app_data(path_config())
        .app_data(query_config())
        .service(
            web::scope("/availability")
                .route("", web::post().to(handlers::create_availability))
                .route("/me", web::get().to(handlers::my_availability))
                .route("/tutor/{tutor_id}", web::get().to(handlers::tutor_availability))
                .route("/slots/{tutor_id}/{date}", web::get().to(handlers::available_slots))
                .service(
                    web::resource("/{id}")
                        .route(web::put().to(handlers::update_availability))
                        .route(web::delete().to(handlers::delete_availability)),
                ),
        )
        .service(
            web::scope("/sessions")
                .service(
                    web::resource("")
                        .route(web::post().to(handlers::book_session))
                        .route(web::get().to(handlers::my_sessions)),
                )
                // Before "/{id}" so it is not read as a session id
                .route("/send-reminders", web::post().to(handlers::send_reminders))
                .route("/{id}", web::get().to(handlers::get_session))
                .route("/{id}/status", web::put().to(handlers::update_session_status))
                .route("/{id}/feedback", web::post().to(handlers::submit_feedback))
                .route("/{id}/notes", web::put().to(handlers::add_session_notes)),
        );
}
