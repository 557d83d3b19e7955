// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Read-only status API.
//!
//! | Path | Response |
//! |---|---|
//! | `GET /healthz` | `ok` |
//! | `GET /metrics` | Prometheus text format |
//! | `GET /api/v1/namespaces/{ns}/manager` | Manager state of the namespace |
//! | `GET /api/v1/namespaces/{ns}/requesters` | Requesters of the namespace |

use std::{sync::Arc, time::Duration};

use address_manager::manager::dto::ManagerStateDto;
use axum::{
    Json, Router,
    error_handling::HandleErrorLayer,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use ipam_observability::{info_trace_layer, metrics::MetricsRegistry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::{
    BoxError, ServiceBuilder,
    limit::GlobalConcurrencyLimitLayer,
    load_shed::error::Overloaded,
    timeout::{TimeoutLayer, error::Elapsed},
};
use tracing::{error, info};

use crate::{
    model::{Requester, RequesterObject, manager_key},
    store::{Object, Store, StoreError},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_CONCURRENT_REQUESTS: usize = 32;

/// Shared state of the status API handlers.
#[derive(Clone)]
pub struct StatusApiState {
    pub managers: Arc<dyn Store<ManagerStateDto>>,
    pub requesters: Arc<dyn Store<Requester>>,
    pub manager_name: String,
    pub metrics_registry: MetricsRegistry,
}

/// Builds the status API router.
pub fn router(state: StatusApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/v1/namespaces/{namespace}/manager", get(get_manager))
        .route(
            "/api/v1/namespaces/{namespace}/requesters",
            get(list_requesters),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(info_trace_layer())
                .layer(HandleErrorLayer::new(map_box_error_to_response))
                .load_shed()
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
                .layer(GlobalConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS)),
        )
}

/// Serves the status API on `listener` until `cancellation_token` is cancelled.
pub async fn start(
    cancellation_token: CancellationToken,
    listener: TcpListener,
    state: StatusApiState,
) -> std::io::Result<()> {
    info!(addr=?listener.local_addr(), "Starting status API");
    if let Err(e) = axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(cancellation_token.cancelled_owned())
        .await
    {
        error!(error=%e, "Status API server unexpectedly stopped");
    } else {
        info!("Status API server stopped gracefully");
    }
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<StatusApiState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_registry.render(),
    )
}

async fn get_manager(
    State(state): State<StatusApiState>,
    Path(namespace): Path<String>,
) -> Result<Json<Object<ManagerStateDto>>, ApiError> {
    let key = manager_key(&namespace, &state.manager_name);
    Ok(Json(state.managers.get(&key).await?))
}

async fn list_requesters(
    State(state): State<StatusApiState>,
    Path(namespace): Path<String>,
) -> Result<Json<Vec<RequesterObject>>, ApiError> {
    Ok(Json(state.requesters.list(&namespace).await?))
}

struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::AlreadyExists(_) | StoreError::VersionConflict { .. } => {
                StatusCode::CONFLICT
            }
        };
        (status, self.0.to_string()).into_response()
    }
}

async fn map_box_error_to_response(err: BoxError) -> (StatusCode, String) {
    if err.is::<Overloaded>() {
        (
            StatusCode::TOO_MANY_REQUESTS,
            "The service is overloaded.".to_string(),
        )
    } else if err.is::<Elapsed>() {
        (
            StatusCode::GATEWAY_TIMEOUT,
            "Request took longer than the deadline.".to_string(),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Unexpected error: {err}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use address_manager::manager::ManagerState;
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use test_log::test;
    use tower::ServiceExt;

    use super::*;
    use crate::store::{ObjectKey, memory::InMemoryStore};

    async fn state() -> StatusApiState {
        let managers = InMemoryStore::<ManagerStateDto>::new();
        managers
            .create(Object::new(
                ObjectKey::new("openstack", "ipmanager"),
                ManagerStateDto::from(&ManagerState::default()),
            ))
            .await
            .unwrap();
        let requesters = InMemoryStore::<Requester>::new();
        requesters
            .create(Object::new(
                ObjectKey::new("openstack", "compute-0"),
                Requester::default(),
            ))
            .await
            .unwrap();

        StatusApiState {
            managers: Arc::new(managers),
            requesters: Arc::new(requesters),
            manager_name: "ipmanager".to_string(),
            metrics_registry: MetricsRegistry::new(),
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test(tokio::test)]
    async fn should_serve_manager_state() {
        let router = router(state().await);

        let (status, body) = get(router.clone(), "/api/v1/namespaces/openstack/manager").await;
        assert_eq!(status, StatusCode::OK);
        let manager: Object<ManagerStateDto> = serde_json::from_str(&body).unwrap();
        assert_eq!(manager.meta.key.name, "ipmanager");

        let (status, _) = get(router, "/api/v1/namespaces/other/manager").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test(tokio::test)]
    async fn should_list_requesters() {
        let (status, body) = get(
            router(state().await),
            "/api/v1/namespaces/openstack/requesters",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let requesters: Vec<RequesterObject> = serde_json::from_str(&body).unwrap();
        assert_eq!(requesters.len(), 1);
    }

    #[test(tokio::test)]
    async fn should_answer_health_check() {
        let (status, body) = get(router(state().await), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
