//! Terminal fallback policy: plain DNS resolution.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::resolver::Resolver;

use super::{Policy, Tactic, TacticStream};

/// Emits one tactic per resolved address, SNI and verify hostname both set
/// to the requested domain. DNS failure is not an error here: the stream
/// just closes without producing anything.
pub struct DnsPolicy {
    pub resolver: Arc<dyn Resolver>,
}

impl Policy for DnsPolicy {
    fn lookup_tactics(
        &self,
        token: &CancellationToken,
        domain: &str,
        port: u16,
    ) -> TacticStream {
        let (sender, stream) = TacticStream::channel(token.clone());
        let token = token.clone();
        let resolver = self.resolver.clone();
        let domain = domain.to_string();
        tokio::spawn(async move {
            let addrs = match resolver.lookup_host(&token, &domain).await {
                Ok(addrs) => addrs,
                Err(err) => {
                    tracing::debug!(
                        target = "tactics",
                        domain = %domain,
                        error = %err,
                        "dns lookup failed, no fallback tactics"
                    );
                    return;
                }
            };
            for address in addrs {
                let tactic = Tactic {
                    address,
                    port,
                    initial_delay: Duration::ZERO,
                    sni: domain.clone(),
                    verify_hostname: domain.clone(),
                };
                if !sender.send(tactic).await {
                    return;
                }
            }
        });
        stream
    }
}
