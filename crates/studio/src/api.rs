// SPDX-License-Identifier: PolyForm-Shield-1.0

//! HTTP interface for image generation clients.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use model_runtime::{Image, ModelBackend};
use protocol::{GenerateParams, ModelName};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info};

use crate::error::{GenerateError, UnloadError};
use crate::manager::LifecycleManager;

/// Seconds a client is told to wait after a `Busy` answer.
pub const RETRY_AFTER_SECS: u64 = 5;

type SharedManager<B> = Arc<LifecycleManager<B>>;

#[derive(Debug, Serialize)]
struct GenerateResponse {
    image_urls: Vec<String>,
    model: String,
    success: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: String,
    model: &'a str,
    retryable: bool,
    success: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    models_loaded: Vec<ModelName>,
    total_models: usize,
    active_model: Option<ModelName>,
}

fn data_url(image: &Image) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(&image.bytes))
}

fn failure(status: StatusCode, model: &str, error: String, retryable: bool) -> Response {
    let body = Json(ErrorBody {
        error,
        model,
        retryable,
        success: false,
    });
    if retryable {
        (
            status,
            [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())],
            body,
        )
            .into_response()
    } else {
        (status, body).into_response()
    }
}

fn generate_failure(model: &str, err: &GenerateError) -> Response {
    let status = match err {
        GenerateError::UnknownModel(_) => StatusCode::NOT_FOUND,
        GenerateError::Busy(_)
        | GenerateError::LoadFailed { .. }
        | GenerateError::ShuttingDown(_) => StatusCode::SERVICE_UNAVAILABLE,
        GenerateError::RenderFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    failure(status, model, err.to_string(), err.is_retryable())
}

fn unload_failure(model: &str, err: &UnloadError) -> Response {
    let status = match err {
        UnloadError::UnknownModel(_) | UnloadError::NotResident(_) => StatusCode::NOT_FOUND,
        UnloadError::TeardownFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    failure(status, model, err.to_string(), false)
}

async fn index() -> impl IntoResponse {
    Json(json!({ "message": "easel image generation server is running" }))
}

async fn generate<B: ModelBackend>(
    State(manager): State<SharedManager<B>>,
    Path(model): Path<String>,
    body: Bytes,
) -> Response {
    // An empty body means "all defaults".
    let params = if body.iter().all(u8::is_ascii_whitespace) {
        GenerateParams::default()
    } else {
        match serde_json::from_slice::<GenerateParams>(&body) {
            Ok(params) => params,
            Err(e) => {
                return failure(
                    StatusCode::BAD_REQUEST,
                    &model,
                    format!("invalid request body: {e}"),
                    false,
                )
            }
        }
    };

    match manager.generate(&model, &params).await {
        Ok(images) => {
            info!(
                "studio::api: {} generated {} image(s)",
                model,
                images.len()
            );
            Json(GenerateResponse {
                image_urls: images.iter().map(data_url).collect(),
                model,
                success: true,
            })
            .into_response()
        }
        Err(e) => {
            error!("studio::api: generate on {model} failed: {e}");
            generate_failure(&model, &e)
        }
    }
}

async fn unload<B: ModelBackend>(
    State(manager): State<SharedManager<B>>,
    Path(model): Path<String>,
) -> Response {
    match manager.unload(&model).await {
        Ok(()) => Json(json!({
            "message": format!("Unloaded {model}"),
            "success": true,
        }))
        .into_response(),
        Err(e) => unload_failure(&model, &e),
    }
}

async fn health<B: ModelBackend>(State(manager): State<SharedManager<B>>) -> impl IntoResponse {
    let status = manager.status();
    Json(HealthResponse {
        status: "healthy",
        total_models: status.resident.len(),
        models_loaded: status.resident,
        active_model: status.active,
    })
}

async fn status<B: ModelBackend>(State(manager): State<SharedManager<B>>) -> impl IntoResponse {
    Json(manager.status())
}

/// Does `origin` match `pattern`? A single `*` in the pattern matches any run
/// of characters, so `https://*.example.com` covers preview deployments.
pub fn origin_matches(pattern: &str, origin: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == origin,
        Some((prefix, suffix)) => {
            origin.len() >= prefix.len() + suffix.len()
                && origin.starts_with(prefix)
                && origin.ends_with(suffix)
        }
    }
}

/// CORS layer for the configured origins; empty or `*` allows any origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let patterns: Arc<[String]> = origins.iter().cloned().collect();
    layer.allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _parts: &axum::http::request::Parts| {
            origin
                .to_str()
                .map(|origin| patterns.iter().any(|p| origin_matches(p, origin)))
                .unwrap_or(false)
        },
    ))
}

pub fn router<B: ModelBackend>(manager: SharedManager<B>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health::<B>))
        .route("/status", get(status::<B>))
        .route("/:model/generate", post(generate::<B>))
        .route("/:model/unload", post(unload::<B>))
        .layer(cors)
        .with_state(manager)
}

/// Bind the API listener and serve it in the background until `stop`
/// resolves. After that no new connections are accepted and the returned
/// task finishes once in-flight requests have been answered.
///
/// Returns the bound address, which differs from `addr` when port 0 was
/// requested.
pub async fn spawn_api_server<B: ModelBackend>(
    addr: SocketAddr,
    manager: SharedManager<B>,
    cors_origins: &[String],
    stop: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let app = router(manager, cors_layer(cors_origins));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    info!("studio::api: listening on http://{bound}");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(stop)
            .await
        {
            error!("studio::api: server error: {e}");
        }
        info!("studio::api: listener closed");
    });

    Ok((bound, server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::manager::LifecycleSettings;
    use crate::testing::FakeBackend;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    fn app() -> (Arc<FakeBackend>, SharedManager<FakeBackend>, Router) {
        let backend = Arc::new(FakeBackend::new());
        let manager = Arc::new(LifecycleManager::new(
            backend.clone(),
            LifecycleSettings::default(),
            EventBus::default(),
        ));
        let app = router(manager.clone(), cors_layer(&[]));
        (backend, manager, app)
    }

    async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Response) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn generate_returns_png_data_urls() {
        let (_backend, _manager, app) = app();
        let (status, response) = call(
            app,
            "POST",
            "/flux-schnell/generate",
            r#"{"prompt": "a red kite", "num_images": 2}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["model"], "flux-schnell");
        let urls = body["image_urls"].as_array().unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls[0]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn empty_body_uses_defaults() {
        let (backend, _manager, app) = app();
        let (status, _) = call(app, "POST", "/stable-turbo/generate", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(backend.render_count(), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let (backend, _manager, app) = app();
        let (status, response) = call(app, "POST", "/stable-turbo/generate", "{nope").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["success"], false);
        assert!(backend.constructs().is_empty());
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let (_backend, _manager, app) = app();
        let (status, response) = call(app, "POST", "/imagen/generate", "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["model"], "imagen");
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn busy_maps_to_503_with_retry_after() {
        let (backend, manager, app) = app();
        backend.hold_constructs();

        let loading = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .generate("stable-large", &GenerateParams::default())
                    .await
            })
        };
        backend.construct_started.notified().await;

        let (status, response) = call(app, "POST", "/stable-large/generate", "{}").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers()[header::RETRY_AFTER],
            RETRY_AFTER_SECS.to_string().as_str()
        );
        assert_eq!(json_body(response).await["retryable"], true);

        backend.release_constructs(1);
        loading.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn load_and_render_failures_map_to_distinct_statuses() {
        let (backend, _manager, app) = app();
        backend.fail_construct(ModelName::StableMedium, true);
        backend.fail_render(ModelName::FluxDev);

        let (status, _) = call(app.clone(), "POST", "/stable-medium/generate", "{}").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, response) = call(app, "POST", "/flux-dev/generate", "{}").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn unload_reports_success_and_not_resident() {
        let (_backend, manager, app) = app();
        manager
            .generate("stable-xl", &GenerateParams::default())
            .await
            .unwrap();

        let (status, response) = call(app.clone(), "POST", "/stable-xl/unload", "").await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["message"], "Unloaded stable-xl");
        assert_eq!(body["success"], true);

        let (status, _) = call(app, "POST", "/stable-xl/unload", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn teardown_failure_on_unload_is_a_server_error() {
        let (backend, manager, app) = app();
        backend.fail_destruct(ModelName::FluxDev);
        manager
            .generate("flux-dev", &GenerateParams::default())
            .await
            .unwrap();

        let (status, _) = call(app, "POST", "/flux-dev/unload", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn health_and_status_reflect_the_active_model() {
        let (_backend, manager, app) = app();
        manager
            .generate("flux-dev", &GenerateParams::default())
            .await
            .unwrap();

        let (status, response) = call(app.clone(), "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["models_loaded"], json!(["flux-dev"]));
        assert_eq!(body["total_models"], 1);
        assert_eq!(body["active_model"], "flux-dev");

        let (_, response) = call(app, "GET", "/status", "").await;
        let report = json_body(response).await;
        assert_eq!(report["active"], "flux-dev");
        assert_eq!(report["resident"], json!(["flux-dev"]));
        assert_eq!(report["models"]["flux-dev"], "resident");
        assert_eq!(
            report["models"].as_object().unwrap().len(),
            ModelName::ALL.len()
        );
    }

    #[tokio::test]
    async fn server_stops_accepting_after_stop_signal() {
        let (_backend, manager, _app) = app();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let (addr, server) = spawn_api_server(
            "127.0.0.1:0".parse().unwrap(),
            manager,
            &[],
            async move {
                let _ = stop_rx.await;
            },
        )
        .await
        .unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");

        stop_tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server task did not finish after the stop signal")
            .unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn shutting_down_maps_to_503_without_retry() {
        let (backend, manager, app) = app();
        manager.shutdown().await;

        let (status, response) = call(app, "POST", "/flux-dev/generate", "{}").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
        assert_eq!(json_body(response).await["retryable"], false);
        assert!(backend.constructs().is_empty());
    }

    #[tokio::test]
    async fn index_answers() {
        let (_backend, _manager, app) = app();
        let (status, response) = call(app, "GET", "/", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json_body(response).await["message"].is_string());
    }

    #[test]
    fn origin_patterns() {
        assert!(origin_matches("http://localhost:3000", "http://localhost:3000"));
        assert!(!origin_matches("http://localhost:3000", "http://localhost:3001"));
        assert!(origin_matches(
            "https://*.vercel.app",
            "https://preview-42.vercel.app"
        ));
        assert!(!origin_matches("https://*.vercel.app", "https://vercel.app"));
        assert!(!origin_matches(
            "https://*.vercel.app",
            "https://evil.example.com"
        ));
    }
}
