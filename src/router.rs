use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::{api, app::App};

pub fn router(app: App) -> Router {
    Router::new()
        .route("/liveness", get(api::health_checks::ok))
        .route("/readiness", get(api::health_checks::readiness))
        .nest("/api", api::routes())
        .with_state(app)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use crate::tests::setup_test::setup_test;

    #[tokio::test]
    async fn test_health_checks_respond_ok() {
        let test = setup_test().await;

        for path in ["/liveness", "/readiness"] {
            let response = test.server.get(path).await;
            response.assert_status_ok();
            response.assert_text("OK");
        }
    }
}
