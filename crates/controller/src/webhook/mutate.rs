// `POST /mutate` (§6): applies health-probe defaults to a freshly-created
// spec and hands back a JSON patch, or an empty patch if the spec was
// already a fixed point (`admission::apply_defaults`'s contract).
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::domain::GameServerSpec;
use crate::globals::Globals;
use crate::reconciler::admission;

#[derive(Debug, Deserialize)]
pub struct MutateRequest {
    pub spec: GameServerSpec,
}

#[derive(Debug, Serialize)]
pub struct MutateResponse {
    /// `false` when the incoming spec was already fully defaulted; callers
    /// can skip applying an empty patch.
    pub patched: bool,
    pub spec: GameServerSpec,
}

pub async fn handle(
    State(_globals): State<Globals>,
    Json(req): Json<MutateRequest>,
) -> Json<MutateResponse> {
    let mut spec = req.spec;
    let patched = admission::apply_defaults(&mut spec);
    Json(MutateResponse { patched, spec })
}
