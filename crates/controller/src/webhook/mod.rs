// The two HTTP surfaces (§6): the admission webhook (`/mutate`,
// `/validate`) and the allocation endpoint consumed by remote clusters
// forwarding a `GameServerAllocation` (§4.E multi-cluster routing). Built
// on `axum`, the way the teacher's proxy crate serves its own HTTP API,
// with a shared token-bucket limiter (`rate_limiter`) guarding both
// listeners from a runaway caller.
pub mod allocate;
pub mod mutate;
pub mod validate;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;

use crate::globals::Globals;

async fn rate_limit(State(globals): State<Globals>, request: Request, next: Next) -> Response {
    if globals.http_rate_limiter.try_acquire_token().is_err() {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }
    next.run(request).await
}

/// `/mutate` and `/validate`, the admission surface a record's create (and
/// update) path goes through before the reconciler ever sees it.
pub fn webhook_router(globals: Globals) -> Router {
    Router::new()
        .route("/mutate", post(mutate::handle))
        .route("/validate", post(validate::handle))
        .layer(middleware::from_fn_with_state(globals.clone(), rate_limit))
        .with_state(globals)
}

/// The remote-allocation listener other clusters' allocation engines call
/// into when a policy names this cluster as a connection target.
pub fn allocation_router(globals: Globals) -> Router {
    Router::new()
        .route("/allocate", post(allocate::handle))
        .layer(middleware::from_fn_with_state(globals.clone(), rate_limit))
        .with_state(globals)
}
