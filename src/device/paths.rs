//! Telemetry path rendering
//!
//! Paths address list entries with equality predicates on both key fields:
//!
//! ```text
//! <root>.service{.service_name=="<name>"&&.namespace=="<ns>"}
//! <root>.service{...}.external_address{.address=="<addr>"&&.hostname=="<host>"}
//! ```

use crate::model::{EndpointIdentity, ServiceIdentity};

/// Path of a service list entry under `root`
pub fn service_path(root: &str, service: &ServiceIdentity) -> String {
    format!(
        "{}.service{{.service_name==\"{}\"&&.namespace==\"{}\"}}",
        root,
        escape(&service.name),
        escape(&service.namespace)
    )
}

/// Path of an endpoint list entry nested under its service
pub fn endpoint_path(root: &str, service: &ServiceIdentity, endpoint: &EndpointIdentity) -> String {
    format!(
        "{}.external_address{{.address==\"{}\"&&.hostname==\"{}\"}}",
        service_path(root, service),
        escape(&endpoint.external_address),
        escape(&endpoint.hostname)
    )
}

// Kubernetes names cannot contain quotes, but a hostname handed in by a lookup could.
fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
