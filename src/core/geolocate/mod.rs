//! Probe location discovery: public IP, ASN and country via the geo
//! databases shipped in the assets directory.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hyper::header::USER_AGENT;
use hyper::{Body, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::http::{read_body, HttpClient};
use crate::core::resolver::Resolver;

pub const DEFAULT_PROBE_ASN: u32 = 0;
pub const DEFAULT_PROBE_CC: &str = "ZZ";
pub const DEFAULT_PROBE_IP: &str = "127.0.0.1";
pub const DEFAULT_PROBE_NETWORK_NAME: &str = "";
pub const DEFAULT_RESOLVER_ASN: u32 = 0;
pub const DEFAULT_RESOLVER_IP: &str = "127.0.0.2";
pub const DEFAULT_RESOLVER_NETWORK_NAME: &str = "";

pub const ASN_DATABASE_NAME: &str = "asn.mmdb";
pub const COUNTRY_DATABASE_NAME: &str = "country.mmdb";

/// Service answering a plain-text key=value trace that includes our
/// public address.
const IP_LOOKUP_URL: &str = "https://www.cloudflare.com/cdn-cgi/trace";

/// Asking the right resolver-owned name reveals which resolver egress IP
/// actually answers our queries.
const RESOLVER_LOOKUP_DOMAIN: &str = "whoami.v4.powerdns.org";

/// Where the probe is, network-wise. Cached set-once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub asn: u32,
    pub country_code: String,
    pub network_name: String,
    pub probe_ip: String,
    pub resolver_asn: u32,
    pub resolver_ip: String,
    pub resolver_network_name: String,
}

/// Capability the session consumes to discover its location; tests
/// substitute fakes, production uses [`GeoLookup`].
#[async_trait]
pub trait LocationLookup: Send + Sync {
    async fn lookup(&self, token: &CancellationToken) -> Result<Location>;
}

/// Production lookup: public IP over the session transport, everything
/// else from the mmdb files under the assets directory.
pub struct GeoLookup {
    pub http: Arc<HttpClient>,
    pub resolver: Arc<dyn Resolver>,
    pub asn_db: PathBuf,
    pub country_db: PathBuf,
    /// Live view of the session proxy. Resolver-side queries are skipped
    /// while a proxy is set: they would leak the probe's un-proxied DNS
    /// identity.
    pub proxy: Arc<RwLock<Option<Url>>>,
    pub user_agent: String,
}

#[async_trait]
impl LocationLookup for GeoLookup {
    async fn lookup(&self, token: &CancellationToken) -> Result<Location> {
        let probe_ip = self.fetch_probe_ip(token).await?;
        let (asn, network_name) = lookup_asn(&self.asn_db, &probe_ip)
            .with_context(|| format!("asn lookup for {probe_ip}"))?;
        let country_code = lookup_country(&self.country_db, &probe_ip)
            .with_context(|| format!("country lookup for {probe_ip}"))?;

        let mut location = Location {
            asn,
            country_code,
            network_name,
            probe_ip: probe_ip.to_string(),
            resolver_asn: DEFAULT_RESOLVER_ASN,
            resolver_ip: DEFAULT_RESOLVER_IP.to_string(),
            resolver_network_name: DEFAULT_RESOLVER_NETWORK_NAME.to_string(),
        };
        let enable_resolver_lookup = self.proxy.read().await.is_none();
        if enable_resolver_lookup {
            match self.fetch_resolver_ip(token).await {
                Ok(resolver_ip) => {
                    location.resolver_ip = resolver_ip.to_string();
                    if let Ok((asn, name)) = lookup_asn(&self.asn_db, &resolver_ip) {
                        location.resolver_asn = asn;
                        location.resolver_network_name = name;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = "geolocate",
                        error = %err,
                        "resolver lookup failed, keeping defaults"
                    );
                }
            }
        }
        Ok(location)
    }
}

impl GeoLookup {
    async fn fetch_probe_ip(&self, token: &CancellationToken) -> Result<IpAddr> {
        let req = Request::get(IP_LOOKUP_URL)
            .header(USER_AGENT, self.user_agent.as_str())
            .body(Body::empty())
            .context("build ip lookup request")?;
        let response = self.http.request(token, req).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("ip lookup answered {status}"));
        }
        let body = read_body(response).await?;
        let text = String::from_utf8_lossy(&body);
        parse_trace_ip(&text).ok_or_else(|| anyhow!("no ip in lookup response"))
    }

    async fn fetch_resolver_ip(&self, token: &CancellationToken) -> Result<IpAddr> {
        let addrs = self
            .resolver
            .lookup_host(token, RESOLVER_LOOKUP_DOMAIN)
            .await?;
        addrs
            .first()
            .and_then(|addr| addr.parse().ok())
            .ok_or_else(|| anyhow!("resolver lookup returned no usable address"))
    }
}

/// Parse the `ip=<addr>` line of a cdn-cgi trace body.
fn parse_trace_ip(body: &str) -> Option<IpAddr> {
    body.lines()
        .find_map(|line| line.strip_prefix("ip="))
        .and_then(|value| value.trim().parse().ok())
}

fn lookup_asn(path: &Path, ip: &IpAddr) -> Result<(u32, String)> {
    let reader = maxminddb::Reader::open_readfile(path)
        .with_context(|| format!("open {}", path.display()))?;
    let record: maxminddb::geoip2::Asn = reader.lookup(*ip)?;
    let asn = record.autonomous_system_number.unwrap_or(DEFAULT_PROBE_ASN);
    let name = record
        .autonomous_system_organization
        .unwrap_or(DEFAULT_PROBE_NETWORK_NAME)
        .to_string();
    Ok((asn, name))
}

fn lookup_country(path: &Path, ip: &IpAddr) -> Result<String> {
    let reader = maxminddb::Reader::open_readfile(path)
        .with_context(|| format!("open {}", path.display()))?;
    let record: maxminddb::geoip2::Country = reader.lookup(*ip)?;
    let code = record
        .country
        .and_then(|country| country.iso_code)
        .unwrap_or(DEFAULT_PROBE_CC)
        .to_string();
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_body_parsing() {
        let body = "fl=123abc\nh=www.cloudflare.com\nip=93.184.216.34\nts=1700000000\n";
        assert_eq!(
            parse_trace_ip(body),
            Some("93.184.216.34".parse().unwrap())
        );
        assert_eq!(parse_trace_ip("h=x\nts=1\n"), None);
        assert_eq!(parse_trace_ip("ip=not-an-ip\n"), None);
        // IPv6 answers parse too.
        assert_eq!(
            parse_trace_ip("ip=2606:4700::1\n"),
            Some("2606:4700::1".parse().unwrap())
        );
    }

    #[test]
    fn missing_database_is_an_error() {
        let ip: IpAddr = "93.184.216.34".parse().unwrap();
        assert!(lookup_asn(Path::new("/nonexistent/asn.mmdb"), &ip).is_err());
        assert!(lookup_country(Path::new("/nonexistent/country.mmdb"), &ip).is_err());
    }
}
