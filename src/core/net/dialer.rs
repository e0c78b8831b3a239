//! Dialer racing connection tactics into an established TLS stream.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rustls::ServerName;
use tokio::net::TcpStream;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::bytecounter::ByteCounter;
use crate::core::errors::EngineError;
use crate::core::tactics::{Policy, Tactic};
use crate::core::tls;

use super::socks5::{self, ProxyEndpoint};
use super::CountingStream;

pub type TlsConn = tokio_rustls::client::TlsStream<CountingStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on simultaneous tactic attempts. Bridge policies may emit long
/// streams with zero initial delay; racing them all at once would stampede.
const MAX_PARALLEL_ATTEMPTS: usize = 8;

/// Turns `(domain, port)` into a TLS connection by consuming the policy's
/// tactic stream. Attempts start after their tactic's initial delay and
/// race; the first completed handshake wins and aborts the rest.
///
/// With a proxy configured the tactics machinery is bypassed entirely: the
/// destination goes to the proxy by name with the real SNI, since a decoy
/// handshake through a tunnel only adds fingerprint surface.
pub struct Dialer {
    policy: Arc<dyn Policy>,
    counter: Arc<ByteCounter>,
    proxy: Arc<RwLock<Option<Url>>>,
}

impl Dialer {
    pub fn new(
        policy: Arc<dyn Policy>,
        counter: Arc<ByteCounter>,
        proxy: Arc<RwLock<Option<Url>>>,
    ) -> Self {
        Self {
            policy,
            counter,
            proxy,
        }
    }

    pub async fn proxy_url(&self) -> Option<Url> {
        self.proxy.read().await.clone()
    }

    pub async fn dial_tls(
        &self,
        token: &CancellationToken,
        domain: &str,
        port: u16,
    ) -> Result<TlsConn> {
        if token.is_cancelled() {
            return Err(EngineError::Interrupted.into());
        }
        if let Some(proxy) = self.proxy_url().await {
            return self.dial_via_proxy(token, &proxy, domain, port).await;
        }
        self.dial_racing_tactics(token, domain, port).await
    }

    async fn dial_via_proxy(
        &self,
        token: &CancellationToken,
        proxy: &Url,
        domain: &str,
        port: u16,
    ) -> Result<TlsConn> {
        let endpoint = ProxyEndpoint::from_url(proxy)?;
        tracing::debug!(
            target = "dialer",
            proxy = %endpoint.sanitized(),
            domain,
            port,
            "dialing through proxy"
        );
        let attempt = async {
            let mut stream = timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
            )
            .await
            .context("proxy connect timeout")?
            .context("proxy connect")?;
            socks5::connect(&mut stream, &endpoint, domain, port).await?;
            let counted = CountingStream::new(stream, self.counter.clone());
            let server_name = server_name_for(domain)?;
            let connector = TlsConnector::from(tls::client_config());
            let conn = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, counted))
                .await
                .context("tls handshake timeout")?
                .context("tls handshake")?;
            Ok::<TlsConn, anyhow::Error>(conn)
        };
        tokio::select! {
            _ = token.cancelled() => Err(EngineError::Interrupted.into()),
            conn = attempt => conn,
        }
    }

    async fn dial_racing_tactics(
        &self,
        token: &CancellationToken,
        domain: &str,
        port: u16,
    ) -> Result<TlsConn> {
        let mut stream = self.policy.lookup_tactics(token, domain, port);
        let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_ATTEMPTS));
        let mut attempts: JoinSet<Result<TlsConn>> = JoinSet::new();
        let mut stream_open = true;
        let mut last_error: Option<anyhow::Error> = None;

        loop {
            if !stream_open && attempts.is_empty() {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => {
                    attempts.abort_all();
                    return Err(EngineError::Interrupted.into());
                }
                maybe = stream.next(), if stream_open => match maybe {
                    Some(tactic) => {
                        let counter = self.counter.clone();
                        let semaphore = semaphore.clone();
                        attempts.spawn(attempt_tactic(tactic, counter, semaphore));
                    }
                    None => stream_open = false,
                },
                joined = attempts.join_next(), if !attempts.is_empty() => {
                    match joined {
                        Some(Ok(Ok(conn))) => {
                            attempts.abort_all();
                            return Ok(conn);
                        }
                        Some(Ok(Err(err))) => {
                            tracing::debug!(
                                target = "dialer",
                                domain,
                                error = %err,
                                "tactic attempt failed"
                            );
                            last_error = Some(err);
                        }
                        Some(Err(join_err)) if join_err.is_cancelled() => {}
                        Some(Err(join_err)) => {
                            last_error = Some(anyhow!("tactic task failed: {join_err}"));
                        }
                        None => {}
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            EngineError::NoWorkingTactic {
                domain: domain.to_string(),
                port,
            }
            .into()
        }))
    }
}

async fn attempt_tactic(
    tactic: Tactic,
    counter: Arc<ByteCounter>,
    semaphore: Arc<Semaphore>,
) -> Result<TlsConn> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .context("dialer semaphore closed")?;
    if !tactic.initial_delay.is_zero() {
        sleep(tactic.initial_delay).await;
    }
    let ip: IpAddr = tactic
        .address
        .parse()
        .with_context(|| format!("tactic address is not an IP literal: {}", tactic.address))?;
    let addr = SocketAddr::new(ip, tactic.port);
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .with_context(|| format!("connect timeout for {addr}"))?
        .with_context(|| format!("connect {addr}"))?;
    let counted = CountingStream::new(stream, counter);

    let config = tls::client_config_with_verify_hostname(&tactic.verify_hostname);
    let connector = TlsConnector::from(config);
    let server_name = server_name_for(&tactic.sni)?;
    let conn = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, counted))
        .await
        .with_context(|| format!("tls handshake timeout with {addr} sni {}", tactic.sni))?
        .with_context(|| format!("tls handshake with {addr} sni {}", tactic.sni))?;
    Ok(conn)
}

fn server_name_for(host: &str) -> Result<ServerName> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip));
    }
    ServerName::try_from(host).with_context(|| format!("invalid server name: {host}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tactics::TacticStream;

    struct EmptyPolicy;

    impl Policy for EmptyPolicy {
        fn lookup_tactics(
            &self,
            _token: &CancellationToken,
            _domain: &str,
            _port: u16,
        ) -> TacticStream {
            TacticStream::empty()
        }
    }

    fn new_dialer(policy: Arc<dyn Policy>) -> Dialer {
        Dialer::new(
            policy,
            Arc::new(ByteCounter::new()),
            Arc::new(RwLock::new(None)),
        )
    }

    #[tokio::test]
    async fn empty_stream_reports_no_working_tactic() {
        let dialer = new_dialer(Arc::new(EmptyPolicy));
        let token = CancellationToken::new();
        let err = dialer
            .dial_tls(&token, "www.example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NoWorkingTactic { domain, port })
                if domain == "www.example.com" && *port == 443
        ));
    }

    #[tokio::test]
    async fn cancelled_token_interrupts_before_any_work() {
        let dialer = new_dialer(Arc::new(EmptyPolicy));
        let token = CancellationToken::new();
        token.cancel();
        let err = dialer
            .dial_tls(&token, "www.example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Interrupted)
        ));
    }

    #[test]
    fn server_name_accepts_hosts_and_ip_literals() {
        assert!(matches!(
            server_name_for("93.184.216.34").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name_for("api.ooni.io").unwrap(),
            ServerName::DnsName(_)
        ));
        assert!(server_name_for("not a host name").is_err());
    }
}
