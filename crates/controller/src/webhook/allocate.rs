// The remote-allocation listener (§6 "Allocation endpoint"): receives a
// `GameServerAllocation` envelope from another cluster's allocation engine
// (multi-cluster flag already cleared by the sender per
// `AllocationRequest::as_local_forward`) and attempts a local match.
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use common::errors::AllocationError;

use crate::allocation::allocate_with_retry;
use crate::domain::GameServerAllocation;
use crate::globals::Globals;

pub async fn handle(
    State(globals): State<Globals>,
    Json(mut envelope): Json<GameServerAllocation>,
) -> Response {
    let Some(handle) = globals.allocation_handle() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "allocation engine not started").into_response();
    };
    // The id is the retry/backoff correlation id in logs (§4.E); a remote
    // caller that forgot to set one still gets distinct log lines per call.
    if envelope.request.id.is_empty() {
        envelope.request.id = uuid::Uuid::new_v4().to_string();
    }
    let request = envelope.request.clone();
    let result = allocate_with_retry(&handle, &globals.substrate, &globals.ready_cache, request).await;
    match result {
        Ok(status) => Json(GameServerAllocation {
            request: envelope.request,
            status: Some(status),
        })
        .into_response(),
        Err(AllocationError::NoReady) => (StatusCode::NOT_FOUND, "no ready game server").into_response(),
        Err(AllocationError::Contention) => {
            (StatusCode::CONFLICT, "lost race to a concurrent allocator").into_response()
        }
        Err(AllocationError::Shutdown) => {
            (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response()
        }
        Err(AllocationError::RemoteRejected(body)) => {
            (StatusCode::BAD_GATEWAY, body).into_response()
        }
    }
}
