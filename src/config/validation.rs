//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing pipelines)
//! - Validate every filter spec against its kind
//! - Validate value ranges (timeouts > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::GatewayConfig;
use crate::filters::{registry, FilterError};
use crate::pipeline::PipelineError;

/// A single semantic problem in the configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("listener.bind_address {0:?} is not a socket address")]
    BindAddress(String),

    #[error("listener.tls.require_client_cert needs listener.tls.client_ca_path")]
    ClientCertWithoutCa,

    #[error("observability.metrics_address {0:?} is not a socket address")]
    MetricsAddress(String),

    #[error("timeouts.request_secs must be greater than zero")]
    RequestTimeout,

    #[error("duplicate pipeline {0:?}")]
    DuplicatePipeline(String),

    #[error("duplicate route {0:?}")]
    DuplicateRoute(String),

    #[error("route {route:?} references unknown pipeline {pipeline:?}")]
    UnknownPipeline { route: String, pipeline: String },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("pipeline {pipeline:?}: {source}")]
    Filter {
        pipeline: String,
        #[source]
        source: FilterError,
    },
}

/// Check `config`, collecting every problem found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }
    if let Some(tls) = &config.listener.tls {
        if tls.require_client_cert && tls.client_ca_path.is_none() {
            errors.push(ValidationError::ClientCertWithoutCa);
        }
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::RequestTimeout);
    }

    let registry = registry();
    let mut pipelines = HashSet::new();
    for pipeline in &config.pipelines {
        if !pipelines.insert(pipeline.name.as_str()) {
            errors.push(ValidationError::DuplicatePipeline(pipeline.name.clone()));
            continue;
        }
        if let Err(e) = pipeline.validate(registry) {
            errors.push(e.into());
            continue;
        }
        for filter in &pipeline.filters {
            let Some(kind) = registry.get(&filter.kind) else {
                continue;
            };
            if let Err(source) = (kind.validate)(filter) {
                errors.push(ValidationError::Filter {
                    pipeline: pipeline.name.clone(),
                    source,
                });
            }
        }
    }

    let mut routes = HashSet::new();
    for route in &config.routes {
        if !routes.insert(route.name.as_str()) {
            errors.push(ValidationError::DuplicateRoute(route.name.clone()));
        }
        if !pipelines.contains(route.pipeline.as_str()) {
            errors.push(ValidationError::UnknownPipeline {
                route: route.name.clone(),
                pipeline: route.pipeline.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> GatewayConfig {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn test_reports_every_error() {
        let config = parse(
            r#"
            [listener]
            bind_address = "nowhere"

            [timeouts]
            request_secs = 0

            [[pipelines]]
            name = "p"
            [[pipelines.filters]]
            name = "agg"
            kind = "APIAggregator"
            maxBodyBytes = 99999999
            [[pipelines.filters.pipelines]]
            name = "x"

            [[pipelines]]
            name = "p"

            [[routes]]
            name = "r"
            pipeline = "ghost"
            "#,
        );
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5, "{:?}", errors);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::BindAddress(_))));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::RequestTimeout)));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::Filter { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicatePipeline(_))));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownPipeline { .. })));
    }

    #[test]
    fn test_unknown_kind_is_reported() {
        let config = parse(
            r#"
            [[pipelines]]
            name = "p"
            [[pipelines.filters]]
            name = "f"
            kind = "Teleport"
            "#,
        );
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::Pipeline(_)));
    }

    #[test]
    fn test_client_cert_requires_ca() {
        let config = parse(
            r#"
            [listener.tls]
            cert_path = "server.pem"
            key_path = "server.key"
            require_client_cert = true
            "#,
        );
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(errors[..], [ValidationError::ClientCertWithoutCa]));
    }
}
