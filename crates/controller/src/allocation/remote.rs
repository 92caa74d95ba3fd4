// Multi-cluster routing (§4.E, §6): forwards an allocation request to a
// remote cluster's allocation endpoint over an mTLS client built from a
// secret-provided certificate and CA chain. Client certs are rebuilt on
// every call; caching is explicitly out of scope per the design notes.
use reqwest::{Client, Identity};

use common::errors::AllocationError;

use crate::domain::{AllocationPolicy, ClusterConnection, GameServerAllocation};
use crate::substrate::Substrate;

/// Builds an mTLS-capable client from the secret named on `conn`, or a
/// plain client (system roots) if no secret is configured.
async fn client_for(substrate: &Substrate, conn: &ClusterConnection) -> anyhow::Result<Client> {
    let mut builder = Client::builder();
    if let Some(secret_key) = &conn.secret {
        let secret = substrate.lister.get_tls_secret(secret_key).await?;
        let mut identity_pem = secret.cert_pem.clone();
        identity_pem.extend_from_slice(b"\n");
        identity_pem.extend_from_slice(&secret.key_pem);
        let identity = Identity::from_pem(&identity_pem)?;
        builder = builder.identity(identity);
        if let Some(ca_pem) = &secret.ca_pem {
            let ca = reqwest::Certificate::from_pem(ca_pem)?;
            builder = builder.add_root_certificate(ca);
        }
    }
    Ok(builder.build()?)
}

/// Tries each connection in order for the first policy whose selector
/// matches. Returns on the first 2xx; on 5xx with endpoints remaining,
/// tries the next; any other non-2xx is surfaced as an error. A failed
/// attempt is logged; a success on any iteration is not (§9).
pub async fn allocate_remote(
    substrate: &Substrate,
    local_cluster_name: &str,
    policies: &[AllocationPolicy],
    request: &GameServerAllocation,
) -> Result<GameServerAllocation, AllocationError> {
    let mut candidates: Vec<&ClusterConnection> = Vec::new();
    for policy in policies {
        if policy.selector.matches(&request.request.metadata_patch.labels)
            || policy.selector.match_labels.is_empty()
        {
            candidates.extend(policy.connections.iter());
        }
    }

    let forward = GameServerAllocation {
        request: request.request.as_local_forward(),
        status: None,
    };

    let mut last_error: Option<String> = None;
    let remaining = candidates.len();
    for (i, conn) in candidates.into_iter().enumerate() {
        if conn.is_local(local_cluster_name) {
            // Local allocation is handled by the caller before reaching
            // here; this branch only exists so a policy mixing local and
            // remote connections is handled uniformly by the caller's
            // iteration, not by this function.
            continue;
        }
        let attempt_result = forward_once(substrate, conn, &forward).await;
        match attempt_result {
            Ok(allocation) => return Ok(allocation),
            Err(ForwardError::ServerError(status)) if i + 1 < remaining => {
                log::warn!("{}: remote allocation to {} failed with {status}, trying next endpoint", request.request.id, conn.endpoint);
                last_error = Some(format!("{status}"));
                continue;
            }
            Err(e) => {
                log::warn!("{}: remote allocation to {} failed: {e}", request.request.id, conn.endpoint);
                return Err(AllocationError::RemoteRejected(e.to_string()));
            }
        }
    }
    // Reached only when every candidate was local or none matched a policy;
    // no remote endpoint was actually tried.
    let _ = last_error;
    Err(AllocationError::NoReady)
}

enum ForwardError {
    ServerError(u16),
    Other(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::ServerError(s) => write!(f, "server error {s}"),
            ForwardError::Other(s) => write!(f, "{s}"),
        }
    }
}

async fn forward_once(
    substrate: &Substrate,
    conn: &ClusterConnection,
    request: &GameServerAllocation,
) -> Result<GameServerAllocation, ForwardError> {
    let client = client_for(substrate, conn)
        .await
        .map_err(|e| ForwardError::Other(e.to_string()))?;
    let response = client
        .post(&conn.endpoint)
        .json(request)
        .send()
        .await
        .map_err(|e| ForwardError::Other(e.to_string()))?;
    let status = response.status();
    if status.is_server_error() {
        return Err(ForwardError::ServerError(status.as_u16()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ForwardError::Other(format!("{status}: {body}")));
    }
    response
        .json()
        .await
        .map_err(|e| ForwardError::Other(e.to_string()))
}
