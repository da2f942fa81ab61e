use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use std::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tutor_scheduler::config::CorsConfig;
use tutor_scheduler::{api, health_check, AppError, AppState, Settings};

fn cors_from(config: &CorsConfig) -> Cors {
    if !config.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors = if config.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .expose_any_header()
    } else {
        config
            .allowed_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE"])
            .allowed_headers(vec!["Content-Type", api::USER_ID_HEADER])
    };

    cors.max_age(config.max_age as usize)
}

#[actix_web::main]
async fn main() -> tutor_scheduler::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    // Load configuration
    let config = Settings::new()?;
    info!("Configuration loaded for {} environment", config.environment);

    let state = AppState::new(config.clone()).await?;
    let reminders = state.start_reminders();
    let state = web::Data::new(state);
    let shared = state.clone();

    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Starting server at {}:{}", config.server.host, config.server.port);

    let cors_config = config.cors.clone();
    let served = HttpServer::new(move || {
        App::new()
            .wrap(cors_from(&cors_config))
            .app_data(state.clone())
            .route("/health", web::get().to(health_check))
            .configure(api::configure)
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await;

    if let Some(handle) = reminders {
        handle.stop().await;
    }
    shared.shutdown().await?;
    if let Err(e) = served {
        warn!("Server stopped with error: {}", e);
        return Err(AppError::InternalError(e.to_string()));
    }

    info!("Server stopped");
    Ok(())
}
