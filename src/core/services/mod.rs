//! Probe services: the backend endpoints offering check-in, measurement
//! submission and test-helper discovery.

pub mod client;
pub mod model;
pub mod selector;
pub mod submitter;

pub use client::Client;
pub use model::{
    CheckInConfig, CheckInInfo, EndpointKind, Measurement, ServiceEndpoint,
};
pub use selector::{select_best, try_all, Candidate};
pub use submitter::{ProbeServicesSubmitter, Submitter};

/// Compiled-in candidate endpoints used when the host application does
/// not configure its own. Read-only, so thread-safe by construction.
pub fn default_probe_services() -> Vec<ServiceEndpoint> {
    vec![
        ServiceEndpoint {
            address: "https://api.ooni.io".to_string(),
            kind: EndpointKind::Https,
            front: None,
        },
        ServiceEndpoint {
            address: "https://d33d1gs9kpq1c5.cloudfront.net".to_string(),
            kind: EndpointKind::Cloudfront,
            front: Some("d33d1gs9kpq1c5.cloudfront.net".to_string()),
        },
    ]
}
