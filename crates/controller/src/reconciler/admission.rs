// Admission-time defaulting and validation (§4.D, §6 `/mutate` and
// `/validate`). Pure functions over the domain model; the HTTP framing
// (JSON patch construction, allow/deny response shape) lives in
// `webhook::mutate` / `webhook::validate`.
use std::collections::HashSet;

use crate::domain::{GameServerSpec, HealthCheck, PortPolicy};

/// Fills in empty health-probe fields. Returns whether anything changed, so
/// callers can skip emitting a patch for an already-defaulted spec (the
/// round-trip property in §8: defaults are a fixed point).
pub fn apply_defaults(spec: &mut GameServerSpec) -> bool {
    let defaults = HealthCheck::default();
    let mut changed = false;
    if spec.health_check.period_seconds == 0 {
        spec.health_check.period_seconds = defaults.period_seconds;
        changed = true;
    }
    if spec.health_check.failure_threshold == 0 {
        spec.health_check.failure_threshold = defaults.failure_threshold;
        changed = true;
    }
    changed
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    OverlappingStaticPorts(u16),
    StaticPortMissingHostPort(String),
    InvalidPortRange { min: u16, max: u16 },
    InvalidHealthCheck(String),
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationFailure::OverlappingStaticPorts(p) => {
                write!(f, "static port {p} is declared more than once")
            }
            ValidationFailure::StaticPortMissingHostPort(name) => {
                write!(f, "static port {name} has no host_port")
            }
            ValidationFailure::InvalidPortRange { min, max } => {
                write!(f, "invalid dynamic port range [{min}, {max}]")
            }
            ValidationFailure::InvalidHealthCheck(reason) => write!(f, "invalid health check: {reason}"),
        }
    }
}

/// Rejects malformed specs: overlapping static ports, static ports missing
/// their host port, and a zero failure threshold (an always-failing probe).
pub fn validate(spec: &GameServerSpec, min_port: u16, max_port: u16) -> Result<(), Vec<ValidationFailure>> {
    let mut failures = Vec::new();

    if min_port > max_port {
        failures.push(ValidationFailure::InvalidPortRange {
            min: min_port,
            max: max_port,
        });
    }

    let mut seen_static: HashSet<u16> = HashSet::new();
    for port in spec.static_ports() {
        match port.host_port {
            None => failures.push(ValidationFailure::StaticPortMissingHostPort(port.name.clone())),
            Some(host_port) if !seen_static.insert(host_port) => {
                failures.push(ValidationFailure::OverlappingStaticPorts(host_port))
            }
            Some(_) => {}
        }
    }
    debug_assert!(spec.ports.iter().all(|p| p.policy == PortPolicy::Static || p.host_port.is_none()));

    if spec.health_check.failure_threshold == 0 {
        failures.push(ValidationFailure::InvalidHealthCheck(
            "failure_threshold must be at least 1".into(),
        ));
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}
