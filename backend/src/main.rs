use std::sync::Arc;

use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{App, HttpServer, web};
use autotagger::TaggerError;
use autotagger::config::AppConfig;
use autotagger::dispatch::DispatchPool;
use autotagger::model::{self, Vocabulary};
use autotagger::routes::{AppState, configure_routes};

fn build_state(config: &AppConfig) -> Result<AppState, TaggerError> {
    let vocabulary = Arc::new(Vocabulary::load(&config.tags_path)?);
    let loader = model::build_loader(config)?;
    let pool = DispatchPool::start(loader, vocabulary, config.gpu_parallelism)?;
    Ok(AppState::new(
        Arc::new(pool),
        config.max_inflight,
        config.max_upload_bytes(),
    ))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.describe())
    })?;

    let state = build_state(&config).map_err(|e| {
        log::error!("Failed to start the inference pool: {}", e.describe());
        std::io::Error::new(std::io::ErrorKind::Other, e.describe())
    })?;
    log::info!(
        "Inference pool ready: mode={}, replicas={}",
        state.pool.mode(),
        state.pool.replica_count()
    );

    let state = web::Data::new(state);
    let bind_address = config.bind_address();
    log::info!("Starting server on {}", bind_address);

    let app_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(app_state.clone())
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run();

    state.attach_server(server.handle());
    server.await?;

    match state.halted() {
        Some(reason) => Err(std::io::Error::other(reason)),
        None => Ok(()),
    }
}
