// `POST /validate` (§6): allowed/denied with structured failure causes,
// backed by `admission::validate`'s pure check against the configured port
// range.
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::domain::GameServerSpec;
use crate::globals::Globals;
use crate::reconciler::admission;

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub spec: GameServerSpec,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub allowed: bool,
    pub reasons: Vec<String>,
}

pub async fn handle(
    State(globals): State<Globals>,
    Json(req): Json<ValidateRequest>,
) -> Json<ValidateResponse> {
    let min_port = globals.config.min_port;
    let max_port = globals.config.max_port;
    match admission::validate(&req.spec, min_port, max_port) {
        Ok(()) => Json(ValidateResponse {
            allowed: true,
            reasons: Vec::new(),
        }),
        Err(failures) => Json(ValidateResponse {
            allowed: false,
            reasons: failures.iter().map(ToString::to_string).collect(),
        }),
    }
}
