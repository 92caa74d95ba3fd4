// Pod construction for the `Creating` transition (§4.D): attaches the SDK
// sidecar, health probe, service account and owner reference. Only the
// *shape* is built here; dispatch through the substrate lives in
// `pipeline`.
use crate::domain::pod::{PodSpecTemplate, SidecarSpec};
use crate::domain::GameServer;

pub fn build_pod_spec(gs: &GameServer, sidecar: &SidecarSpec, default_service_account: &str) -> PodSpecTemplate {
    PodSpecTemplate {
        key: gs.key.clone(),
        owner: gs.key.clone(),
        container_image: gs.spec.container_image.clone(),
        ports: gs.spec.ports.clone(),
        health_check: gs.spec.health_check.clone(),
        service_account: Some(
            gs.spec
                .service_account
                .clone()
                .unwrap_or_else(|| default_service_account.to_string()),
        ),
        sidecar: sidecar.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GameServerSpec, HealthCheck, ObjectKey};

    fn sidecar() -> SidecarSpec {
        SidecarSpec {
            image: "sdk-sidecar:latest".into(),
            always_pull: false,
            cpu_request: "100m".into(),
            cpu_limit: "200m".into(),
        }
    }

    #[test]
    fn falls_back_to_default_service_account() {
        let gs = GameServer::new(
            ObjectKey::new("default", "gs-1"),
            GameServerSpec {
                container_image: "img".into(),
                ports: vec![],
                health_check: HealthCheck::default(),
                dev_address: None,
                service_account: None,
            },
        );
        let spec = build_pod_spec(&gs, &sidecar(), "sdk-default");
        assert_eq!(spec.service_account.as_deref(), Some("sdk-default"));
    }

    #[test]
    fn spec_service_account_overrides_default() {
        let mut gs = GameServer::new(
            ObjectKey::new("default", "gs-1"),
            GameServerSpec {
                container_image: "img".into(),
                ports: vec![],
                health_check: HealthCheck::default(),
                dev_address: None,
                service_account: Some("custom".into()),
            },
        );
        gs.spec.service_account = Some("custom".into());
        let spec = build_pod_spec(&gs, &sidecar(), "sdk-default");
        assert_eq!(spec.service_account.as_deref(), Some("custom"));
    }
}
