//! Idempotency middleware for write-side entry points.
//!
//! First request with a key executes normally and its terminal response is
//! buffered; any later request with the same key gets the buffered response
//! byte-for-byte plus a replay marker header. Requests without a key pass
//! through unprotected unless auto-generation is enabled. On a cache
//! backend error the middleware fails open and the request proceeds
//! unprotected.

use axum::{
    body::Body,
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use uuid::Uuid;

use maestro_state::{CachedResponse, IdempotencyStore};

/// Request header carrying the caller's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Response header marking a replayed response.
pub const REPLAY_HEADER: &str = "idempotency-replayed";

#[derive(Clone)]
pub struct IdempotencyState {
    pub store: IdempotencyStore,
    /// Generate a fresh key for requests that arrive without one. Off by
    /// default: a generated key never matches a retry, so it only buys the
    /// response buffering.
    pub auto_generate: bool,
}

pub async fn idempotency_middleware(
    State(state): State<Arc<IdempotencyState>>,
    request: Request,
    next: Next,
) -> Response {
    if !is_write_method(request.method()) {
        return next.run(request).await;
    }

    let key = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from);

    let key = match key {
        Some(key) => key,
        None if state.auto_generate => Uuid::new_v4().to_string(),
        // Documented risk: no key, no protection.
        None => return next.run(request).await,
    };

    match state.store.get(&key).await {
        Ok(Some(cached)) => {
            tracing::debug!(key = %key, status = cached.status, "Replaying cached response");
            return replay(cached);
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Idempotency lookup failed, proceeding unprotected");
            return next.run(request).await;
        }
    }

    let response = next.run(request).await;

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(key = %key, error = %e, "Could not buffer response for idempotency cache");
            return Response::from_parts(parts, Body::empty());
        }
    };

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let cached = CachedResponse::new(parts.status.as_u16(), headers, bytes.to_vec());

    if let Err(e) = state.store.store(&key, &cached).await {
        tracing::warn!(key = %key, error = %e, "Could not cache response, request stays unprotected");
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn is_write_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn replay(cached: CachedResponse) -> Response {
    let mut builder = Response::builder().status(cached.status);
    for (name, value) in &cached.headers {
        builder = builder.header(name, value);
    }
    builder = builder.header(REPLAY_HEADER, "true");
    builder
        .body(Body::from(cached.body))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Could not rebuild cached response");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use axum_test::TestServer;
    use maestro_state::MemoryStateBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct SideEffects {
        count: AtomicUsize,
    }

    fn test_app(auto_generate: bool) -> (TestServer, Arc<SideEffects>, MemoryStateBackend) {
        let backend = MemoryStateBackend::new();
        let store = IdempotencyStore::new(Arc::new(backend.clone()), Duration::from_secs(3600));
        let state = Arc::new(IdempotencyState {
            store,
            auto_generate,
        });
        let effects = Arc::new(SideEffects::default());

        let effects_for_create = effects.clone();
        let effects_for_fail = effects.clone();
        let app = Router::new()
            .route(
                "/tasks",
                post(move || {
                    let effects = effects_for_create.clone();
                    async move {
                        let n = effects.count.fetch_add(1, Ordering::SeqCst) + 1;
                        Json(serde_json::json!({"taskId": format!("task-{n}")}))
                    }
                }),
            )
            .route(
                "/flaky",
                post(move || {
                    let effects = effects_for_fail.clone();
                    async move {
                        effects.count.fetch_add(1, Ordering::SeqCst);
                        (
                            axum::http::StatusCode::SERVICE_UNAVAILABLE,
                            "try again later",
                        )
                    }
                }),
            )
            .route("/status", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                state,
                idempotency_middleware,
            ));

        (TestServer::new(app).unwrap(), effects, backend)
    }

    #[tokio::test]
    async fn same_key_produces_one_side_effect_and_identical_responses() {
        let (server, effects, _) = test_app(false);

        let first = server
            .post("/tasks")
            .add_header(IDEMPOTENCY_KEY_HEADER, "key-1")
            .await;
        first.assert_status_ok();
        assert!(first.headers().get(REPLAY_HEADER).is_none());

        let second = server
            .post("/tasks")
            .add_header(IDEMPOTENCY_KEY_HEADER, "key-1")
            .await;
        second.assert_status_ok();
        assert_eq!(second.headers().get(REPLAY_HEADER).unwrap(), "true");
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(effects.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_execute_independently() {
        let (server, effects, _) = test_app(false);
        server
            .post("/tasks")
            .add_header(IDEMPOTENCY_KEY_HEADER, "key-a")
            .await
            .assert_status_ok();
        server
            .post("/tasks")
            .add_header(IDEMPOTENCY_KEY_HEADER, "key-b")
            .await
            .assert_status_ok();
        assert_eq!(effects.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_key_passes_through_unprotected() {
        let (server, effects, _) = test_app(false);
        server.post("/tasks").await.assert_status_ok();
        server.post("/tasks").await.assert_status_ok();
        assert_eq!(effects.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_errors_are_not_replayed() {
        let (server, effects, _) = test_app(false);
        server
            .post("/flaky")
            .add_header(IDEMPOTENCY_KEY_HEADER, "key-1")
            .await;
        let second = server
            .post("/flaky")
            .add_header(IDEMPOTENCY_KEY_HEADER, "key-1")
            .await;
        // 5xx is presumed transient: the retry executed for real.
        assert!(second.headers().get(REPLAY_HEADER).is_none());
        assert_eq!(effects.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_methods_are_not_intercepted() {
        let (server, _, _) = test_app(false);
        let response = server.get("/status").await;
        response.assert_status_ok();
        assert!(response.headers().get(REPLAY_HEADER).is_none());
    }

    #[tokio::test]
    async fn backend_outage_fails_open() {
        let (server, effects, backend) = test_app(false);
        backend.set_failing(true);
        server
            .post("/tasks")
            .add_header(IDEMPOTENCY_KEY_HEADER, "key-1")
            .await
            .assert_status_ok();
        server
            .post("/tasks")
            .add_header(IDEMPOTENCY_KEY_HEADER, "key-1")
            .await
            .assert_status_ok();
        // Both executed: the cache outage never blocked the service.
        assert_eq!(effects.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auto_generated_keys_buffer_without_replaying() {
        let (server, effects, _) = test_app(true);
        server.post("/tasks").await.assert_status_ok();
        server.post("/tasks").await.assert_status_ok();
        // Fresh key per request: both executed.
        assert_eq!(effects.count.load(Ordering::SeqCst), 2);
    }
}
