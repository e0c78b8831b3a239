//! Closure-backed fakes for the engine's capability traits, shared by
//! unit tests and the integration suite.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::geolocate::{Location, LocationLookup};
use crate::core::resolver::Resolver;
use crate::core::tunnel::{Tunnel, TunnelContext, TunnelFactory};

type LookupFn = dyn Fn(&str) -> Result<Vec<String>> + Send + Sync;

/// Resolver whose behavior is the closure you hand it.
pub struct MockResolver {
    lookup: Box<LookupFn>,
}

impl MockResolver {
    pub fn new<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
        }
    }

    /// Always resolves to the given addresses.
    pub fn with_addresses(addrs: &[&str]) -> Self {
        let addrs: Vec<String> = addrs.iter().map(|s| s.to_string()).collect();
        Self::new(move |_| Ok(addrs.clone()))
    }

    /// Always fails with the given message.
    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |_| Err(anyhow!("{message}")))
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn lookup_host(
        &self,
        _token: &CancellationToken,
        domain: &str,
    ) -> Result<Vec<String>> {
        (self.lookup)(domain)
    }
}

/// Tunnel that only remembers how often it was stopped.
pub struct MockTunnel {
    proxy: Url,
    stops: Arc<AtomicUsize>,
}

impl Tunnel for MockTunnel {
    fn socks5_proxy_url(&self) -> Url {
        self.proxy.clone()
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory producing [`MockTunnel`]s and counting starts and stops.
pub struct MockTunnelFactory {
    proxy: Url,
    fail: bool,
    starts: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

impl MockTunnelFactory {
    pub fn new(proxy: &str) -> Arc<Self> {
        Arc::new(Self {
            proxy: Url::parse(proxy).expect("valid proxy url"),
            fail: false,
            starts: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            proxy: Url::parse("socks5://127.0.0.1:0").unwrap(),
            fail: true,
            starts: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelFactory for MockTunnelFactory {
    async fn start(
        &self,
        _token: &CancellationToken,
        name: &str,
        _ctx: &TunnelContext,
    ) -> Result<Box<dyn Tunnel>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("mocked tunnel failure: {name}"));
        }
        Ok(Box::new(MockTunnel {
            proxy: self.proxy.clone(),
            stops: self.stops.clone(),
        }))
    }
}

/// Location lookup returning a fixed result and counting invocations, so
/// tests can assert the set-once behavior.
pub struct MockLocationLookup {
    result: Result<Location, String>,
    calls: AtomicUsize,
}

impl MockLocationLookup {
    pub fn returning(location: Location) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(location),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Err(message.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationLookup for MockLocationLookup {
    async fn lookup(&self, _token: &CancellationToken) -> Result<Location> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            Ok(location) => Ok(location.clone()),
            Err(message) => Err(anyhow!("{message}")),
        }
    }
}

/// A plausible cached location for session tests.
pub fn sample_location() -> Location {
    Location {
        asn: 30722,
        country_code: "IT".to_string(),
        network_name: "Vodafone Italia".to_string(),
        probe_ip: "130.25.90.216".to_string(),
        resolver_asn: 30722,
        resolver_ip: "91.80.36.88".to_string(),
        resolver_network_name: "Vodafone Italia".to_string(),
    }
}
