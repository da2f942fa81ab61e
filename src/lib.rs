pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod notify;
pub mod scheduling;
pub mod time;

use actix_web::{web, HttpResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use clock::{Clock, ManualClock, SystemClock};
pub use db::{DbOperations, MemoryStore, Stores};
pub use notify::{Notifier, PgNotifier, RecordingNotifier, TracingNotifier};
pub use scheduling::{AvailabilityService, ReminderHandle, ReminderScheduler, SchedulingRules, SessionService};

use config::StorageBackend;

/// Health check endpoint handler
/// Returns a JSON response with server status, timestamp and pool usage
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let database = match &state.db {
        Some(db) => match db.get_pool_status().await {
            Ok(status) => serde_json::json!({
                "total": status.total_connections,
                "active": status.active_connections,
                "idle": status.idle_connections,
            }),
            Err(_) => serde_json::Value::Null,
        },
        None => serde_json::Value::Null,
    };

    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "database": database,
    }))
}

/// Application state shared across all workers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub db: Option<Arc<DbOperations>>,
    pub availability: Arc<AvailabilityService>,
    pub sessions: Arc<SessionService>,
    pub reminders: Arc<ReminderScheduler>,
}

impl AppState {
    pub async fn new(config: Settings) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        match config.storage.backend {
            StorageBackend::Postgres => {
                let db = DbOperations::new_with_options(
                    &config.database.url,
                    config.database.max_connections,
                    Duration::from_secs(config.database.acquire_timeout_secs),
                    clock.clone(),
                )
                .await?;
                if config.database.run_migrations {
                    db.run_migrations().await?;
                    info!("Database migrations applied");
                }

                let db = Arc::new(db);
                let notifier = Arc::new(PgNotifier::new(db.pool(), clock.clone()));
                let mut state = Self::with_parts(config, Stores::postgres(db.clone()), notifier, clock)?;
                state.db = Some(db);
                Ok(state)
            }
            StorageBackend::Memory => {
                warn!("Using in-memory storage; data is lost on restart");
                let store = Arc::new(MemoryStore::new(clock.clone()));
                Self::with_parts(config, Stores::memory(store), Arc::new(TracingNotifier), clock)
            }
        }
    }

    /// Wires the services over the given stores and collaborators.
    pub fn with_parts(
        config: Settings,
        stores: Stores,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let rules = SchedulingRules::from_config(&config.scheduling)?;
        let availability = Arc::new(AvailabilityService::new(stores.clone(), clock.clone(), rules));
        let sessions = Arc::new(SessionService::new(
            stores.clone(),
            availability.clone(),
            notifier.clone(),
            clock.clone(),
        ));
        let reminders = Arc::new(ReminderScheduler::new(
            stores,
            notifier,
            clock,
            chrono::Duration::hours(config.reminders.lookahead_hours),
        ));

        Ok(Self {
            config: Arc::new(config),
            db: None,
            availability,
            sessions,
            reminders,
        })
    }

    /// Starts the periodic reminder sweep if it is enabled.
    pub fn start_reminders(&self) -> Option<ReminderHandle> {
        if !self.config.reminders.enabled {
            info!("Reminder scheduler disabled");
            return None;
        }
        let every = Duration::from_secs(self.config.reminders.interval_secs);
        Some(self.reminders.start(every))
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(db) = &self.db {
            db.pool().close().await;
        }
        Ok(())
    }
}
