use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::{
    api::{api_error::ApiError, validated_json::ValidatedJson},
    app::App,
    coordinator,
    database::models::model_artifact,
    deployment::Deployment,
};

#[derive(Debug, Deserialize, Validate)]
pub struct ActivateModel {
    pub model_artifact_id: Uuid,
}

/// The user's active model, or `null` when none has been activated yet.
pub async fn active(
    State(app): State<App>,
    Path(user_id): Path<String>,
) -> Result<Json<Option<model_artifact::Model>>, ApiError> {
    Ok(Json(coordinator::get_active_model(&app, &user_id).await?))
}

pub async fn activate(
    State(app): State<App>,
    Path(user_id): Path<String>,
    ValidatedJson(body): ValidatedJson<ActivateModel>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment = coordinator::activate_model(&app, &user_id, body.model_artifact_id).await?;
    Ok(Json(deployment))
}

/// Every artifact recorded for the user, newest first.
pub async fn list(
    State(app): State<App>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<model_artifact::Model>>, ApiError> {
    Ok(Json(coordinator::list_models(&app, &user_id).await?))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    use crate::tests::fixtures::insert_artifact;
    use crate::tests::setup_test::setup_test;

    #[tokio::test]
    async fn test_user_without_deployment_has_null_active_model() {
        let test = setup_test().await;

        let response = test.server.get("/api/users/user-1/active-model").await;

        response.assert_status_ok();
        assert!(response.json::<Value>().is_null());
    }

    #[tokio::test]
    async fn test_activating_an_older_artifact_rolls_back() {
        let test = setup_test().await;
        let older = insert_artifact(&test.app.db, "user-1", "m-1").await;
        let newer = insert_artifact(&test.app.db, "user-1", "m-2").await;

        for artifact in [&newer, &older] {
            test.server
                .put("/api/users/user-1/active-model")
                .json(&json!({"model_artifact_id": artifact.id}))
                .await
                .assert_status_ok();
        }

        let active: Value = test.server.get("/api/users/user-1/active-model").await.json();
        assert_eq!(active["storage_location"], "m-1");

        let listed: Vec<Value> = test.server.get("/api/users/user-1/models").await.json();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn test_activating_another_users_artifact_is_not_found() {
        let test = setup_test().await;
        let foreign = insert_artifact(&test.app.db, "user-2", "m-9").await;

        let response = test
            .server
            .put("/api/users/user-1/active-model")
            .json(&json!({"model_artifact_id": foreign.id}))
            .await;

        response.assert_status(StatusCode::NOT_FOUND);
        let active = test.server.get("/api/users/user-1/active-model").await;
        assert!(active.json::<Value>().is_null());
    }

    #[tokio::test]
    async fn test_activation_requires_an_artifact_id() {
        let test = setup_test().await;

        test.server
            .put("/api/users/user-1/active-model")
            .json(&json!({}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }
}
