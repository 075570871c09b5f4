//! Work units reachable from configuration.

pub mod http;

use std::time::Duration;

use pipewright_core::unit::{EchoUnit, UnitRegistry};
use pipewright_types::config::{ConfigError, EngineConfig, UnitKind};

pub use http::HttpWorkUnit;

/// Build the unit registry from the `[[units]]` table.
///
/// HTTP units share one client. A unit's `timeout_secs` overrides the tenant
/// default for that unit.
pub fn build_registry(config: &EngineConfig) -> Result<UnitRegistry, ConfigError> {
    let client = reqwest::Client::builder()
        .user_agent("pipewright-unit/0.1")
        .build()
        .unwrap_or_default();

    let mut registry = UnitRegistry::new();
    for endpoint in &config.units {
        let timeout = endpoint.timeout_secs.map(Duration::from_secs);
        match endpoint.kind {
            UnitKind::Echo => {
                let unit = EchoUnit::new(&endpoint.name);
                match timeout {
                    Some(t) => registry.register_with_timeout(unit, t),
                    None => registry.register(unit),
                }
            }
            UnitKind::Http => {
                let url = endpoint
                    .url
                    .as_deref()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| ConfigError::Invalid {
                        scope: endpoint.name.clone(),
                        field: "url",
                        reason: "is required for http units".to_string(),
                    })?;
                let unit = HttpWorkUnit::with_client(&endpoint.name, url, client.clone());
                match timeout {
                    Some(t) => registry.register_with_timeout(unit, t),
                    None => registry.register(unit),
                }
            }
        }
        tracing::debug!(unit = %endpoint.name, kind = ?endpoint.kind, "work unit registered");
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_types::config::UnitEndpoint;

    fn endpoint(name: &str, kind: UnitKind, url: Option<&str>, timeout_secs: Option<u64>) -> UnitEndpoint {
        UnitEndpoint {
            name: name.to_string(),
            kind,
            url: url.map(str::to_string),
            timeout_secs,
        }
    }

    #[test]
    fn registers_every_configured_unit() {
        let config = EngineConfig {
            units: vec![
                endpoint("echo", UnitKind::Echo, None, None),
                endpoint("coder", UnitKind::Http, Some("http://localhost:9000/coder"), Some(30)),
            ],
            ..EngineConfig::default()
        };
        let registry = build_registry(&config).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("echo"));
        assert_eq!(registry.timeout_for("coder"), Some(Duration::from_secs(30)));
        assert_eq!(registry.timeout_for("echo"), None);
    }

    #[test]
    fn http_unit_without_url_is_rejected() {
        let config = EngineConfig {
            units: vec![endpoint("coder", UnitKind::Http, None, None)],
            ..EngineConfig::default()
        };
        let err = build_registry(&config).unwrap_err();
        assert!(err.to_string().contains("url"));
    }
}
