use std::{io, net::SocketAddr};

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::{
    api::health_checks::ok,
    app::{App, ReadinessError},
    config::{Config, ExecutorConfig},
    database::setup_database,
    environment::Environment,
    jobs::{executor::executor_from_config, supervisor::job_supervisor},
    router::router,
};

pub async fn handle_serve_command(environment: Environment, config: Config) {
    let port = config.server.port;

    // Kubernetes sees the process alive while migrations run
    let liveness_server_task = tokio::spawn(start_liveness_server(port));

    let (db, migration_receiver) = match setup_database(&config.database).await {
        Ok(setup) => setup,
        Err(e) => {
            error!("❌ Could not connect to the database: {e}");
            liveness_server_task.abort();
            return;
        }
    };

    match migration_receiver.await {
        Ok(Ok(())) => {
            info!("✅ Database is ready!");
        }
        Ok(Err(e)) => {
            error!("❌ Database setup failed: {e}");
            liveness_server_task.abort();
            return;
        }
        Err(_) => {
            error!("❌ Database setup channel closed unexpectedly");
            liveness_server_task.abort();
            return;
        }
    }

    if environment.is_production() && matches!(config.executor, ExecutorConfig::Mock { .. }) {
        warn!("⚠️ Running in production with the mock training executor");
    }

    let executor = executor_from_config(&config.executor);
    let (app, executor_events) = App::new(config, environment, db, executor);

    tokio::spawn(job_supervisor(app.clone(), executor_events));

    // Stop the temporary liveness server
    liveness_server_task.abort();
    let _ = liveness_server_task.await;

    if let Err(e) = start_server(router(app), port).await {
        error!("❌ Server stopped: {e}");
    }
}

/// Liveness only; readiness reports migrations in progress.
async fn start_liveness_server(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let migration_router = Router::new().route("/liveness", get(ok)).route(
        "/readiness",
        get(|| async { Err::<(), _>(ReadinessError::MigrationsInProgress) }),
    );

    if let Err(e) = serve(migration_router, addr).await {
        error!("❌ Liveness server failed: {e}");
    }
}

async fn start_server(router: Router, port: u16) -> io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("🌐 Server starting on http://{}", addr);
    serve(router, addr).await
}

async fn serve(router: Router, addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}
