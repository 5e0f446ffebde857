//! HTTP route handlers.
//!
//! Anything that is not a control endpoint is a render: the request path and
//! query become the route, the body becomes the payload.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, Uri},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;

use crate::dispatcher::DispatchError;
use crate::service::{HealthSnapshot, RenderService, ServiceError};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::CodeSource { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        ServiceError::Dispatch(e) => match e {
            DispatchError::Launch(_) | DispatchError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::Render(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Kill(_) | DispatchError::RenderAndKill { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        },
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

async fn health_check(State(service): State<Arc<RenderService>>) -> Json<HealthSnapshot> {
    Json(service.health())
}

async fn shutdown(State(service): State<Arc<RenderService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

async fn render(
    State(service): State<Arc<RenderService>>,
    uri: Uri,
    payload: String,
) -> Result<Html<String>, ServiceError> {
    let route = uri.path_and_query().map_or("/", |pq| pq.as_str());
    match service.render(route, &payload).await {
        Ok(html) => Ok(Html(html)),
        Err(e) => {
            tracing::warn!(route, error = %e, "Render request failed");
            Err(e)
        }
    }
}

pub fn routes(service: Arc<RenderService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .fallback(render)
        .with_state(service)
}
