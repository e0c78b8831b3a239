//! TLS client configuration for tactic-driven handshakes.
//!
//! When a tactic carries a decoy SNI, the ClientHello advertises a name
//! that is not the backend's. Certificate validation must then run against
//! the tactic's verify hostname, not against whatever went on the wire.

use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, ClientConfig, Error as TlsError, OwnedTrustAnchor, RootCertStore, ServerName};

/// Verifier that checks the peer chain against an expected hostname
/// independent of the connection's SNI. Without an override it behaves
/// exactly like the inner webpki verifier.
struct VerifyHostnameVerifier {
    inner: Arc<dyn ServerCertVerifier>,
    override_host: Option<String>,
}

impl ServerCertVerifier for VerifyHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if let Some(expected) = &self.override_host {
            if let Ok(expected_name) = ServerName::try_from(expected.as_str()) {
                return self.inner.verify_server_cert(
                    end_entity,
                    intermediates,
                    &expected_name,
                    scts,
                    ocsp_response,
                    now,
                );
            }
        }
        self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        )
    }
}

fn webpki_roots_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    root_store
}

fn build_config(override_host: Option<String>) -> ClientConfig {
    let root_store = webpki_roots_store();
    let inner = Arc::new(WebPkiVerifier::new(root_store.clone(), None));

    let mut cfg = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    cfg.dangerous()
        .set_certificate_verifier(Arc::new(VerifyHostnameVerifier {
            inner,
            override_host,
        }));
    cfg
}

/// Client config validating the chain against `verify_hostname`, whatever
/// name the handshake advertises.
pub fn client_config_with_verify_hostname(verify_hostname: &str) -> Arc<ClientConfig> {
    Arc::new(build_config(Some(verify_hostname.to_string())))
}

/// Plain client config: the advertised name is also the verified one. Used
/// on proxied connections, where no decoy SNI is ever sent.
pub fn client_config() -> Arc<ClientConfig> {
    Arc::new(build_config(None))
}
