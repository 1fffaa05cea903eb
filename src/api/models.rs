use super::{ApiError, AppState};
use crate::ports::ModelVersion;
use axum::{extract::State, Json};

pub async fn current_model(State(state): State<AppState>) -> Json<ModelVersion> {
    Json(state.models.current().version.clone())
}

/// Runs already in flight keep the model they started with.
pub async fn reload_model(State(state): State<AppState>) -> Result<Json<ModelVersion>, ApiError> {
    let models = state.models.clone();
    let handle = tokio::task::spawn_blocking(move || models.reload())
        .await
        .map_err(|e| ApiError::Internal(format!("model reload panicked: {}", e)))??;
    Ok(Json(handle.version.clone()))
}

#[cfg(test)]
mod tests {
    use crate::api::routes::tests::{json_body, send, test_state};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_reload_installs_new_version() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let before = json_body(send(&state, "GET", "/api/models/current", None).await).await;
        assert_eq!(before["name"], "wp-linear-ref");

        let response = send(&state, "POST", "/api/models/reload", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let reloaded = json_body(response).await;
        assert_eq!(reloaded["name"], "wp-linear-ref");
        assert_ne!(reloaded["id"], before["id"]);

        let after = json_body(send(&state, "GET", "/api/models/current", None).await).await;
        assert_eq!(after["id"], reloaded["id"]);
    }
}
