//! Bridge policy: compiled-in addresses and decoy SNIs for the backend
//! domains we must reach even when DNS answers lie and the canonical SNI
//! is filtered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Policy, Tactic, TacticStream};

/// Addresses known to front the probe-services API.
fn bridge_addresses(domain: &str) -> &'static [&'static str] {
    match domain {
        "api.ooni.io" => &["162.55.247.208"],
        _ => &[],
    }
}

/// Domains hosting test helpers. For these the DNS answer wins the
/// address, but the SNI on the wire is still replaced with a decoy.
pub const TEST_HELPER_DOMAINS: &[&str] = &[
    "0.th.ooni.org",
    "1.th.ooni.org",
    "2.th.ooni.org",
    "3.th.ooni.org",
    "d33d1gs9kpq1c5.cloudfront.net",
];

/// Innocuous hostnames used as ClientHello server_name. An on-path censor
/// matching the backend SNI sees ordinary CDN traffic instead. The list is
/// ordered; tactic emission follows it deterministically.
const DECOY_SNIS: &[&str] = &[
    "ajax.aspnetcdn.com",
    "archive.org",
    "cdn.jsdelivr.net",
    "cdnjs.cloudflare.com",
    "fonts.gstatic.com",
    "registry.npmjs.org",
    "static.cloudflareinsights.com",
    "unpkg.com",
    "upload.wikimedia.org",
    "www.bing.com",
    "www.gstatic.com",
    "www.recaptcha.net",
];

fn is_test_helper_domain(domain: &str) -> bool {
    TEST_HELPER_DOMAINS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(domain))
}

/// Wraps a fallback policy (typically [`super::DnsPolicy`]) and injects
/// bridge tactics for the domains it knows about.
///
/// For a bridged domain the stream is the bridge-address × decoy-SNI cross
/// product followed by every fallback tactic unchanged, so readers always
/// see bridge tactics first and the DNS-derived ones last. For test-helper
/// domains each fallback tactic is rewritten across the decoy SNIs. Any
/// other domain passes straight through.
pub struct BridgesPolicy<P: Policy> {
    pub fallback: P,
}

impl<P: Policy> Policy for BridgesPolicy<P> {
    fn lookup_tactics(
        &self,
        token: &CancellationToken,
        domain: &str,
        port: u16,
    ) -> TacticStream {
        let bridges = bridge_addresses(domain);
        if !bridges.is_empty() {
            let fallback = self.fallback.lookup_tactics(token, domain, port);
            return bridged_stream(token, domain, port, bridges, fallback);
        }
        if is_test_helper_domain(domain) {
            let fallback = self.fallback.lookup_tactics(token, domain, port);
            return rewritten_stream(token, domain, fallback);
        }
        self.fallback.lookup_tactics(token, domain, port)
    }
}

fn decoys_for(domain: &str) -> impl Iterator<Item = &'static str> + '_ {
    // The decoy table never contains backend domains, but the requested
    // domain must not reach the wire no matter what the table says.
    DECOY_SNIS
        .iter()
        .copied()
        .filter(move |sni| !sni.eq_ignore_ascii_case(domain))
}

fn bridged_stream(
    token: &CancellationToken,
    domain: &str,
    port: u16,
    bridges: &'static [&'static str],
    mut fallback: TacticStream,
) -> TacticStream {
    let (sender, stream) = TacticStream::channel(token.clone());
    let domain = domain.to_string();
    tokio::spawn(async move {
        for address in bridges {
            for sni in decoys_for(&domain) {
                let tactic = Tactic {
                    address: address.to_string(),
                    port,
                    initial_delay: Duration::ZERO,
                    sni: sni.to_string(),
                    verify_hostname: domain.clone(),
                };
                if !sender.send(tactic).await {
                    return;
                }
            }
        }
        while let Some(tactic) = fallback.next().await {
            if !sender.send(tactic).await {
                return;
            }
        }
    });
    stream
}

fn rewritten_stream(
    token: &CancellationToken,
    domain: &str,
    mut fallback: TacticStream,
) -> TacticStream {
    let (sender, stream) = TacticStream::channel(token.clone());
    let domain = domain.to_string();
    tokio::spawn(async move {
        while let Some(tactic) = fallback.next().await {
            for sni in decoys_for(&domain) {
                let rewritten = Tactic {
                    address: tactic.address.clone(),
                    port: tactic.port,
                    initial_delay: Duration::ZERO,
                    sni: sni.to_string(),
                    verify_hostname: domain.clone(),
                };
                if !sender.send(rewritten).await {
                    return;
                }
            }
        }
    });
    stream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tactics::DnsPolicy;
    use crate::core::testsupport::MockResolver;
    use std::sync::Arc;

    fn policy_with_resolver(resolver: MockResolver) -> BridgesPolicy<DnsPolicy> {
        BridgesPolicy {
            fallback: DnsPolicy {
                resolver: Arc::new(resolver),
            },
        }
    }

    #[tokio::test]
    async fn unknown_domain_with_dns_failure_yields_nothing() {
        let policy = policy_with_resolver(MockResolver::failing("mocked error"));
        let token = CancellationToken::new();
        let tactics = policy
            .lookup_tactics(&token, "www.example.com", 443)
            .collect()
            .await;
        assert!(tactics.is_empty());
    }

    #[tokio::test]
    async fn unknown_domain_with_dns_success_passes_through() {
        let policy =
            policy_with_resolver(MockResolver::with_addresses(&["93.184.216.34"]));
        let token = CancellationToken::new();
        let tactics = policy
            .lookup_tactics(&token, "www.example.com", 443)
            .collect()
            .await;
        assert_eq!(tactics.len(), 1);
        let tactic = &tactics[0];
        assert_eq!(tactic.address, "93.184.216.34");
        assert_eq!(tactic.port, 443);
        assert_eq!(tactic.initial_delay, Duration::ZERO);
        assert_eq!(tactic.sni, "www.example.com");
        assert_eq!(tactic.verify_hostname, "www.example.com");
    }

    #[tokio::test]
    async fn bridged_domain_with_dns_failure_still_yields_bridge_tactics() {
        let policy = policy_with_resolver(MockResolver::failing("mocked error"));
        let token = CancellationToken::new();
        let tactics = policy
            .lookup_tactics(&token, "api.ooni.io", 443)
            .collect()
            .await;
        assert!(!tactics.is_empty());
        for tactic in &tactics {
            assert_eq!(tactic.address, "162.55.247.208");
            assert_eq!(tactic.port, 443);
            assert_eq!(tactic.initial_delay, Duration::ZERO);
            assert_ne!(tactic.sni, "api.ooni.io");
            assert_eq!(tactic.verify_hostname, "api.ooni.io");
        }
    }

    #[tokio::test]
    async fn bridged_domain_with_dns_success_puts_the_dns_tactic_last() {
        let policy =
            policy_with_resolver(MockResolver::with_addresses(&["130.192.91.211"]));
        let token = CancellationToken::new();
        let tactics = policy
            .lookup_tactics(&token, "api.ooni.io", 443)
            .collect()
            .await;
        assert!(tactics.len() >= 2);

        let mut bridge_count = 0usize;
        let mut dns_count = 0usize;
        for (index, tactic) in tactics.iter().enumerate() {
            assert_eq!(tactic.port, 443);
            assert_eq!(tactic.initial_delay, Duration::ZERO);
            assert_eq!(tactic.verify_hostname, "api.ooni.io");
            if tactic.address == "130.192.91.211" && tactic.sni == "api.ooni.io" {
                assert_eq!(index, tactics.len() - 1, "dns tactic must come last");
                dns_count += 1;
            } else {
                assert_eq!(tactic.address, "162.55.247.208");
                assert_ne!(tactic.sni, "api.ooni.io");
                bridge_count += 1;
            }
        }
        assert_eq!(dns_count, 1);
        assert!(bridge_count > 0);
    }

    #[tokio::test]
    async fn test_helper_domains_keep_the_dns_address_but_bridge_the_sni() {
        for domain in TEST_HELPER_DOMAINS {
            let policy =
                policy_with_resolver(MockResolver::with_addresses(&["164.92.180.7"]));
            let token = CancellationToken::new();
            let tactics = policy.lookup_tactics(&token, domain, 443).collect().await;
            assert!(!tactics.is_empty(), "no tactics for {domain}");
            for tactic in &tactics {
                assert_eq!(tactic.address, "164.92.180.7");
                assert_eq!(tactic.port, 443);
                assert_eq!(tactic.initial_delay, Duration::ZERO);
                assert_ne!(&tactic.sni, domain);
                assert_eq!(&tactic.verify_hostname, domain);
            }
        }
    }

    #[tokio::test]
    async fn bridge_tactic_order_is_deterministic() {
        let token = CancellationToken::new();
        let first = policy_with_resolver(MockResolver::failing("mocked error"))
            .lookup_tactics(&token, "api.ooni.io", 443)
            .collect()
            .await;
        let second = policy_with_resolver(MockResolver::failing("mocked error"))
            .lookup_tactics(&token, "api.ooni.io", 443)
            .collect()
            .await;
        assert_eq!(first, second);
    }
}
