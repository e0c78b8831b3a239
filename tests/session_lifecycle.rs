//! Session lifecycle driven purely through the public API with fake
//! collaborators: no network, no real tunnels.

use std::sync::Arc;

use probe_engine::core::services::{CheckInConfig, EndpointKind, ServiceEndpoint};
use probe_engine::core::testsupport::{
    sample_location, MockLocationLookup, MockResolver, MockTunnelFactory,
};
use probe_engine::{EngineError, Session, SessionConfig};
use tokio_util::sync::CancellationToken;
use url::Url;

fn config(temp: &tempfile::TempDir) -> SessionConfig {
    SessionConfig {
        assets_dir: temp.path().join("assets"),
        software_name: "miniprobe".to_string(),
        software_version: "0.1.0".to_string(),
        temp_dir: temp.path().to_path_buf(),
        resolver: Some(Arc::new(MockResolver::failing("no dns in tests"))),
        location_lookup: Some(MockLocationLookup::returning(sample_location())),
        ..Default::default()
    }
}

#[tokio::test]
async fn full_lifecycle_without_network() {
    let temp = tempfile::tempdir().unwrap();
    let factory = MockTunnelFactory::new("socks5://127.0.0.1:9050");
    let mut session_config = config(&temp);
    session_config.tunnel_factory = Some(factory.clone());
    let session = Session::new(session_config).unwrap();
    let token = CancellationToken::new();

    // Identity accessors before any lookup: compile-time defaults.
    assert_eq!(session.probe_asn_string(), "AS0");
    assert_eq!(session.probe_cc(), "ZZ");
    assert!(session.selected_probe_service().is_none());
    assert!(session.get_test_helpers_by_name("web-connectivity").is_none());

    // Location caches on first success and is byte-identical afterwards.
    session.maybe_lookup_location(&token).await.unwrap();
    session.maybe_lookup_location(&token).await.unwrap();
    assert_eq!(session.probe_cc(), "IT");
    assert_eq!(session.probe_asn_string(), "AS30722");
    assert_eq!(session.location().unwrap(), &sample_location());

    // Tunnel state machine.
    session.maybe_start_tunnel(&token, "tor").await.unwrap();
    assert_eq!(
        session.proxy_url().await,
        Some(Url::parse("socks5://127.0.0.1:9050").unwrap())
    );
    let err = session
        .maybe_start_tunnel(&token, "psiphon")
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::AlreadyUsingProxy)
    ));

    // Close removes the temp dir, stops the tunnel, and is idempotent.
    let temp_dir = session.temp_dir().to_path_buf();
    assert!(temp_dir.exists());
    session.close().await.unwrap();
    session.close().await.unwrap();
    assert!(!temp_dir.exists());
    assert_eq!(factory.stop_count(), 1);
}

#[tokio::test]
async fn check_in_requires_a_live_backend() {
    let temp = tempfile::tempdir().unwrap();
    let mut session_config = config(&temp);
    session_config.available_probe_services = vec![ServiceEndpoint {
        address: "https://unreachable.invalid".to_string(),
        kind: EndpointKind::Https,
        front: None,
    }];
    let session = Session::new(session_config).unwrap();
    let token = CancellationToken::new();

    let err = session
        .check_in(&token, CheckInConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::AllProbeServicesFailed)
    ));
    session.close().await.unwrap();
}

#[tokio::test]
async fn submitter_needs_a_selected_backend_too() {
    let temp = tempfile::tempdir().unwrap();
    let mut session_config = config(&temp);
    session_config.available_probe_services = vec![ServiceEndpoint {
        address: "https://unreachable.invalid".to_string(),
        kind: EndpointKind::Https,
        front: None,
    }];
    let session = Session::new(session_config).unwrap();
    let token = CancellationToken::new();
    let err = session.new_submitter(&token).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::AllProbeServicesFailed)
    ));
    session.close().await.unwrap();
}

#[tokio::test]
async fn byte_totals_start_at_zero() {
    let temp = tempfile::tempdir().unwrap();
    let session = Session::new(config(&temp)).unwrap();
    assert_eq!(session.kibi_bytes_sent(), 0.0);
    assert_eq!(session.kibi_bytes_received(), 0.0);
    session.close().await.unwrap();
}
