use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tutor_scheduler::api::{self, USER_ID_HEADER};
use tutor_scheduler::db::{Course, Role, User};
use tutor_scheduler::notify::NotificationKind;
use tutor_scheduler::{AppState, ManualClock, MemoryStore, RecordingNotifier, Settings, Stores};
use uuid::Uuid;

struct TestApp {
    state: web::Data<AppState>,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
    tutor: User,
    student: User,
    admin: User,
    course: Course,
}

async fn setup() -> TestApp {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap()));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let tutor = store.insert_user(User::new("Ada", "ada@example.com", Role::Tutor)).await;
    let student = store.insert_user(User::new("Sam", "sam@example.com", Role::Student)).await;
    let admin = store.insert_user(User::new("Root", "root@example.com", Role::Admin)).await;
    let course = store.insert_course(Course::new(tutor.id, "Algebra")).await;

    let notifier = Arc::new(RecordingNotifier::new());
    let config = Settings::new_for_test().expect("Failed to load test config");
    let state = AppState::with_parts(config, Stores::memory(store), notifier.clone(), clock.clone())
        .expect("Failed to build state");

    TestApp {
        state: web::Data::new(state),
        clock,
        notifier,
        tutor,
        student,
        admin,
        course,
    }
}

macro_rules! init_app {
    ($t:expr) => {
        test::init_service(App::new().app_data($t.state.clone()).configure(api::configure)).await
    };
}

fn as_user(req: test::TestRequest, user: &User) -> test::TestRequest {
    req.insert_header((USER_ID_HEADER, user.id.to_string()))
}

fn monday_window() -> Value {
    json!({
        "dayOfWeek": 1,
        "startTime": "09:00",
        "endTime": "17:00",
        "isRecurring": true
    })
}

fn booking(course_id: Uuid, start: &str, end: &str) -> Value {
    json!({
        "courseId": course_id,
        "startDate": "2026-10-19",
        "startTime": start,
        "endTime": end
    })
}

#[actix_web::test]
async fn test_availability_and_booking_flow() {
    let t = setup().await;
    let app = init_app!(t);

    let req = as_user(test::TestRequest::post().uri("/availability"), &t.tutor)
        .set_json(monday_window())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let window: Value = test::read_body_json(resp).await;
    assert_eq!(window["recurrence"], "weekly");
    assert_eq!(window["dayOfWeek"], 1);

    let slots_uri = format!("/availability/slots/{}/2026-10-19", t.tutor.id);
    let req = test::TestRequest::get().uri(&slots_uri).to_request();
    let slots: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(slots.len(), 16);
    assert_eq!(slots[0], json!({"time": "09:00", "available": true}));

    let req = as_user(test::TestRequest::post().uri("/sessions"), &t.student)
        .set_json(booking(t.course.id, "10:00", "11:00"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let session: Value = test::read_body_json(resp).await;
    assert_eq!(session["status"], "pending");
    assert_eq!(session["durationMinutes"], 60);
    assert_eq!(session["tutorId"], t.tutor.id.to_string());

    let req = test::TestRequest::get().uri(&slots_uri).to_request();
    let slots: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    let taken: Vec<&str> = slots
        .iter()
        .filter(|s| s["available"] == false)
        .filter_map(|s| s["time"].as_str())
        .collect();
    assert_eq!(taken, vec!["10:00", "10:30"]);

    let req = as_user(test::TestRequest::post().uri("/sessions"), &t.student)
        .set_json(booking(t.course.id, "10:30", "11:30"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "conflict");

    let req = as_user(test::TestRequest::post().uri("/sessions"), &t.student)
        .set_json(booking(t.course.id, "08:00", "08:30"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "not_available");

    assert_eq!(t.notifier.count_of(NotificationKind::SessionRequest).await, 1);

    let req = as_user(test::TestRequest::get().uri("/sessions"), &t.tutor).to_request();
    let mine: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(mine.len(), 1);
}

#[actix_web::test]
async fn test_identity_and_roles() {
    let t = setup().await;
    let app = init_app!(t);

    let req = test::TestRequest::post()
        .uri("/availability")
        .set_json(monday_window())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "unauthorized");

    let req = test::TestRequest::get()
        .uri("/sessions")
        .insert_header((USER_ID_HEADER, Uuid::new_v4().to_string()))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

    let req = as_user(test::TestRequest::post().uri("/availability"), &t.student)
        .set_json(monday_window())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let malformed = json!({ "dayOfWeek": 9, "startTime": "25:00", "endTime": "09:00", "isRecurring": true });
    let req = as_user(test::TestRequest::post().uri("/availability"), &t.student)
        .set_json(malformed)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = as_user(test::TestRequest::get().uri("/sessions"), &t.admin).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    let uri = format!("/availability/tutor/{}", t.student.id);
    let req = test::TestRequest::get().uri(&uri).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_malformed_requests() {
    let t = setup().await;
    let app = init_app!(t);

    let req = as_user(test::TestRequest::post().uri("/sessions"), &t.student)
        .set_json(json!({"courseId": "not-a-uuid", "startDate": "2026-10-19"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "validation_error");

    let req = as_user(test::TestRequest::post().uri("/availability"), &t.tutor)
        .set_json(json!({"dayOfWeek": 1, "startTime": "9am", "endTime": "17:00"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(
        body["error"]["message"],
        "Validation error: Invalid time format. Use HH:MM in 24-hour format."
    );

    let uri = format!("/availability/slots/{}/tomorrow", t.tutor.id);
    let req = test::TestRequest::get().uri(&uri).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_session_lifecycle_over_http() {
    let t = setup().await;
    let app = init_app!(t);

    let req = as_user(test::TestRequest::post().uri("/availability"), &t.tutor)
        .set_json(monday_window())
        .to_request();
    test::call_service(&app, req).await;

    let req = as_user(test::TestRequest::post().uri("/sessions"), &t.student)
        .set_json(booking(t.course.id, "13:00", "14:00"))
        .to_request();
    let session: Value = test::call_and_read_body_json(&app, req).await;
    let id = session["id"].as_str().unwrap().to_string();

    let req = as_user(test::TestRequest::put().uri(&format!("/sessions/{}/status", id)), &t.student)
        .set_json(json!({"status": "confirmed"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    let req = as_user(test::TestRequest::put().uri(&format!("/sessions/{}/status", id)), &t.tutor)
        .set_json(json!({"status": "confirmed", "meetingLink": "https://meet.example.com/x"}))
        .to_request();
    let confirmed: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(confirmed["status"], "confirmed");
    assert_eq!(confirmed["meetingLink"], "https://meet.example.com/x");

    let req = as_user(test::TestRequest::put().uri(&format!("/sessions/{}/notes", id)), &t.student)
        .set_json(json!({"notes": "Chapter 4 please"}))
        .to_request();
    let noted: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(noted["notes"], "Chapter 4 please");

    t.clock.set(Utc.with_ymd_and_hms(2026, 10, 19, 14, 0, 0).unwrap());
    let req = as_user(test::TestRequest::put().uri(&format!("/sessions/{}/status", id)), &t.tutor)
        .set_json(json!({"status": "completed"}))
        .to_request();
    let completed: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(completed["status"], "completed");

    let req = as_user(test::TestRequest::put().uri(&format!("/sessions/{}/status", id)), &t.student)
        .set_json(json!({"status": "cancelled"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "invalid_transition");

    let feedback_uri = format!("/sessions/{}/feedback", id);
    let req = as_user(test::TestRequest::post().uri(&feedback_uri), &t.student)
        .set_json(json!({"rating": 5, "comment": "Very clear"}))
        .to_request();
    let rated: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(rated["feedback"]["rating"], 5);

    let req = as_user(test::TestRequest::post().uri(&feedback_uri), &t.student)
        .set_json(json!({"rating": 4}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "already_submitted");

    let req = as_user(test::TestRequest::get().uri(&format!("/sessions/{}", id)), &t.admin).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);
}

#[actix_web::test]
async fn test_send_reminders_endpoint() {
    let t = setup().await;
    let app = init_app!(t);

    let req = as_user(test::TestRequest::post().uri("/availability"), &t.tutor)
        .set_json(monday_window())
        .to_request();
    test::call_service(&app, req).await;
    let req = as_user(test::TestRequest::post().uri("/sessions"), &t.student)
        .set_json(booking(t.course.id, "10:00", "11:00"))
        .to_request();
    let session: Value = test::call_and_read_body_json(&app, req).await;
    let id = session["id"].as_str().unwrap().to_string();
    let req = as_user(test::TestRequest::put().uri(&format!("/sessions/{}/status", id)), &t.tutor)
        .set_json(json!({"status": "confirmed"}))
        .to_request();
    test::call_service(&app, req).await;

    let req = as_user(test::TestRequest::post().uri("/sessions/send-reminders"), &t.student).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    // 23 hours before the session
    t.clock.set(Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap() - Duration::hours(23));
    let req = as_user(test::TestRequest::post().uri("/sessions/send-reminders"), &t.admin).to_request();
    let result: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(result["success"], true);
    assert_eq!(result["count"], 1);
    assert_eq!(result["message"], "Sent 1 session reminders.");

    let req = as_user(test::TestRequest::post().uri("/sessions/send-reminders"), &t.admin).to_request();
    let result: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(result["count"], 0);

    assert_eq!(t.notifier.count_of(NotificationKind::SessionReminder).await, 2);
}

#[actix_web::test]
async fn test_availability_management_over_http() {
    let t = setup().await;
    let app = init_app!(t);

    let req = as_user(test::TestRequest::post().uri("/availability"), &t.tutor)
        .set_json(json!({"date": "2026-10-21", "startTime": "14:00", "endTime": "16:00", "isRecurring": false}))
        .to_request();
    let window: Value = test::call_and_read_body_json(&app, req).await;
    let id = window["id"].as_str().unwrap().to_string();
    assert_eq!(window["recurrence"], "on_date");
    assert_eq!(window["date"], "2026-10-21");

    let req = as_user(test::TestRequest::put().uri(&format!("/availability/{}", id)), &t.tutor)
        .set_json(json!({"endTime": "18:00"}))
        .to_request();
    let updated: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(updated["endTime"], "18:00");

    let req = as_user(test::TestRequest::get().uri("/availability/me"), &t.tutor).to_request();
    let mine: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(mine.len(), 1);

    let req = as_user(test::TestRequest::delete().uri(&format!("/availability/{}", id)), &t.student).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    let req = as_user(test::TestRequest::delete().uri(&format!("/availability/{}", id)), &t.tutor).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

    let uri = format!("/availability/tutor/{}", t.tutor.id);
    let req = test::TestRequest::get().uri(&uri).to_request();
    let listed: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert!(listed.is_empty());
}
