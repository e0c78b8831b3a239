//! The measurement session: owns the probe's network identity, resolver,
//! transport and backend selection, and drives check-in and submission.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::core::bytecounter::ByteCounter;
use crate::core::errors::EngineError;
use crate::core::experiment::{self, ExperimentBuilder};
use crate::core::geolocate::{
    GeoLookup, Location, LocationLookup, ASN_DATABASE_NAME, COUNTRY_DATABASE_NAME,
    DEFAULT_PROBE_ASN, DEFAULT_PROBE_CC, DEFAULT_PROBE_IP, DEFAULT_PROBE_NETWORK_NAME,
    DEFAULT_RESOLVER_ASN, DEFAULT_RESOLVER_IP, DEFAULT_RESOLVER_NETWORK_NAME,
};
use crate::core::http::HttpClient;
use crate::core::kvstore::{KeyValueStore, MemoryKvStore};
use crate::core::net::Dialer;
use crate::core::resolver::{Resolver, SessionResolver};
use crate::core::services::{
    self, default_probe_services, select_best, try_all, CheckInConfig, CheckInInfo,
    ProbeServicesSubmitter, ServiceEndpoint, Submitter,
};
use crate::core::tactics::{BridgesPolicy, DnsPolicy};
use crate::core::tunnel::{NoTunnels, Tunnel, TunnelContext, TunnelFactory};
use crate::core::{ENGINE_NAME, ENGINE_VERSION};

/// Session construction parameters. Capability fields default to the
/// production implementations; tests substitute fakes.
pub struct SessionConfig {
    pub assets_dir: PathBuf,
    pub available_probe_services: Vec<ServiceEndpoint>,
    pub kv_store: Option<Arc<dyn KeyValueStore>>,
    pub proxy_url: Option<Url>,
    pub software_name: String,
    pub software_version: String,
    /// Base for the per-session scratch directory; system temp when empty.
    pub temp_dir: PathBuf,
    pub tor_args: Vec<String>,
    pub tor_binary: Option<PathBuf>,
    /// Tunnel the selector may start when every candidate fails on the
    /// first pass. `None` disables the circumvention retry.
    pub circumvention_tunnel: Option<String>,
    pub tunnel_factory: Option<Arc<dyn TunnelFactory>>,
    pub location_lookup: Option<Arc<dyn LocationLookup>>,
    pub resolver: Option<Arc<dyn Resolver>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::new(),
            available_probe_services: Vec::new(),
            kv_store: None,
            proxy_url: None,
            software_name: String::new(),
            software_version: String::new(),
            temp_dir: PathBuf::new(),
            tor_args: Vec::new(),
            tor_binary: None,
            circumvention_tunnel: None,
            tunnel_factory: None,
            location_lookup: None,
            resolver: None,
        }
    }
}

#[derive(Default)]
struct TunnelState {
    tunnel: Option<Box<dyn Tunnel>>,
    name: String,
}

struct SelectedServices {
    endpoint: ServiceEndpoint,
    test_helpers: HashMap<String, Vec<ServiceEndpoint>>,
}

/// A measurement session. Created once, used for many check-ins and
/// submissions, closed when done.
pub struct Session {
    assets_dir: PathBuf,
    temp_dir: PathBuf,
    software_name: String,
    software_version: String,
    tor_args: Vec<String>,
    tor_binary: Option<PathBuf>,
    available_probe_services: Vec<ServiceEndpoint>,
    circumvention_tunnel: Option<String>,
    kv_store: Arc<dyn KeyValueStore>,
    byte_counter: Arc<ByteCounter>,
    resolver: Arc<dyn Resolver>,
    http: Arc<HttpClient>,
    proxy: Arc<RwLock<Option<Url>>>,
    location_lookup: Arc<dyn LocationLookup>,
    tunnel_factory: Arc<dyn TunnelFactory>,

    // Set-once state: concurrent callers observe the first writer.
    location: OnceCell<Location>,
    backends: OnceCell<SelectedServices>,
    close_result: OnceCell<Result<(), String>>,

    tunnel: Mutex<TunnelState>,
    query_probe_services_count: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("software_name", &self.software_name)
            .field("software_version", &self.software_version)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self> {
        if config.assets_dir.as_os_str().is_empty() {
            return Err(EngineError::Config("assets_dir").into());
        }
        if config.software_name.is_empty() {
            return Err(EngineError::Config("software_name").into());
        }
        if config.software_version.is_empty() {
            return Err(EngineError::Config("software_version").into());
        }
        let kv_store: Arc<dyn KeyValueStore> = config
            .kv_store
            .unwrap_or_else(|| Arc::new(MemoryKvStore::new()));

        let temp_base = if config.temp_dir.as_os_str().is_empty() {
            std::env::temp_dir()
        } else {
            config.temp_dir.clone()
        };
        let temp_dir = temp_base.join(format!("ooniengine-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&temp_dir)
            .with_context(|| format!("create session temp dir {}", temp_dir.display()))?;

        let byte_counter = Arc::new(ByteCounter::new());
        let resolver: Arc<dyn Resolver> = config
            .resolver
            .unwrap_or_else(|| Arc::new(SessionResolver::new(kv_store.clone())));
        let proxy = Arc::new(RwLock::new(config.proxy_url));
        let policy = BridgesPolicy {
            fallback: DnsPolicy {
                resolver: resolver.clone(),
            },
        };
        let dialer = Dialer::new(Arc::new(policy), byte_counter.clone(), proxy.clone());
        let http = Arc::new(HttpClient::new(dialer));

        let user_agent = format!(
            "{}/{} {}/{}",
            config.software_name, config.software_version, ENGINE_NAME, ENGINE_VERSION
        );
        let location_lookup: Arc<dyn LocationLookup> =
            config.location_lookup.unwrap_or_else(|| {
                Arc::new(GeoLookup {
                    http: http.clone(),
                    resolver: resolver.clone(),
                    asn_db: config.assets_dir.join(ASN_DATABASE_NAME),
                    country_db: config.assets_dir.join(COUNTRY_DATABASE_NAME),
                    proxy: proxy.clone(),
                    user_agent,
                })
            });
        let tunnel_factory: Arc<dyn TunnelFactory> = config
            .tunnel_factory
            .unwrap_or_else(|| Arc::new(NoTunnels));

        Ok(Self {
            assets_dir: config.assets_dir,
            temp_dir,
            software_name: config.software_name,
            software_version: config.software_version,
            tor_args: config.tor_args,
            tor_binary: config.tor_binary,
            available_probe_services: config.available_probe_services,
            circumvention_tunnel: config.circumvention_tunnel,
            kv_store,
            byte_counter,
            resolver,
            http,
            proxy,
            location_lookup,
            tunnel_factory,
            location: OnceCell::new(),
            backends: OnceCell::new(),
            close_result: OnceCell::new(),
            tunnel: Mutex::new(TunnelState::default()),
            query_probe_services_count: AtomicU64::new(0),
        })
    }

    /// Call the check-in API. Looks up location and backends lazily and
    /// back-fills every config field the remote API wants populated.
    pub async fn check_in(
        &self,
        token: &CancellationToken,
        mut config: CheckInConfig,
    ) -> Result<CheckInInfo> {
        if token.is_cancelled() {
            return Err(EngineError::Interrupted.into());
        }
        self.maybe_lookup_location(token).await?;
        let client = self.new_probe_services_client(token).await?;
        self.finalize_check_in_config(&mut config);
        client.check_in(token, &config).await
    }

    fn finalize_check_in_config(&self, config: &mut CheckInConfig) {
        if config.platform.is_empty() {
            config.platform = Self::platform().to_string();
        }
        if config.probe_asn.is_empty() {
            config.probe_asn = self.probe_asn_string();
        }
        if config.probe_cc.is_empty() {
            config.probe_cc = self.probe_cc();
        }
        if config.run_type.is_empty() {
            // Most conservative choice.
            config.run_type = "timed".to_string();
        }
        if config.software_name.is_empty() {
            config.software_name = self.software_name.clone();
        }
        if config.software_version.is_empty() {
            config.software_version = self.software_version.clone();
        }
        if config.web_connectivity.category_codes.is_none() {
            // The remote API rejects nulls.
            config.web_connectivity.category_codes = Some(Vec::new());
        }
    }

    /// Caching location lookup. Fails fast on a cancelled token; a failed
    /// lookup is not cached, so the next call retries.
    pub async fn maybe_lookup_location(&self, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(EngineError::Interrupted.into());
        }
        self.location
            .get_or_try_init(|| async {
                let location = self.location_lookup.lookup(token).await?;
                tracing::info!(
                    target = "session",
                    asn = location.asn,
                    cc = %location.country_code,
                    "looked up probe location"
                );
                Ok::<Location, anyhow::Error>(location)
            })
            .await
            .map(|_| ())
    }

    /// Caching probe-services selection.
    pub async fn maybe_lookup_backends(&self, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(EngineError::Interrupted.into());
        }
        self.backends
            .get_or_try_init(|| self.lookup_backends(token))
            .await
            .map(|_| ())
    }

    async fn lookup_backends(&self, token: &CancellationToken) -> Result<SelectedServices> {
        let endpoints = if self.available_probe_services.is_empty() {
            default_probe_services()
        } else {
            self.available_probe_services.clone()
        };
        let user_agent = self.user_agent();

        self.query_probe_services_count.fetch_add(1, Ordering::SeqCst);
        let candidates = try_all(&self.http, &user_agent, &endpoints, token).await;
        if let Some(best) = select_best(candidates) {
            tracing::info!(
                target = "session",
                address = %best.endpoint.address,
                kind = %best.endpoint.kind,
                "using probe services"
            );
            return Ok(SelectedServices {
                endpoint: best.endpoint,
                test_helpers: best.test_helpers,
            });
        }

        // One circumvention pass: bring up the configured tunnel and
        // benchmark again through it.
        if let Some(tunnel_name) = self.circumvention_tunnel.clone() {
            tracing::warn!(
                target = "session",
                tunnel = %tunnel_name,
                "all probe services failed, retrying through tunnel"
            );
            if self.maybe_start_tunnel(token, &tunnel_name).await.is_ok() {
                self.query_probe_services_count.fetch_add(1, Ordering::SeqCst);
                let candidates = try_all(&self.http, &user_agent, &endpoints, token).await;
                if let Some(best) = select_best(candidates) {
                    tracing::info!(
                        target = "session",
                        address = %best.endpoint.address,
                        kind = %best.endpoint.kind,
                        "using probe services (via tunnel)"
                    );
                    return Ok(SelectedServices {
                        endpoint: best.endpoint,
                        test_helpers: best.test_helpers,
                    });
                }
            }
        }
        Err(EngineError::AllProbeServicesFailed.into())
    }

    /// Start the named tunnel unless the session already has a proxy.
    ///
    /// Silently succeeds for an empty name or when the same tunnel is
    /// already running; fails with [`EngineError::AlreadyUsingProxy`] when
    /// a caller-supplied proxy or a different tunnel is in place. After a
    /// successful start the session proxy is the tunnel's SOCKS5 URL.
    pub async fn maybe_start_tunnel(
        &self,
        token: &CancellationToken,
        name: &str,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(EngineError::Interrupted.into());
        }
        let mut state = self.tunnel.lock().await;
        if state.tunnel.is_some() && state.name == name {
            // Asked more than once for the same tunnel.
            return Ok(());
        }
        let proxy_configured = self.proxy.read().await.is_some();
        if proxy_configured && name.is_empty() {
            // A proxy is configured and nothing was asked for.
            return Ok(());
        }
        if proxy_configured || state.tunnel.is_some() {
            return Err(EngineError::AlreadyUsingProxy.into());
        }
        if name.is_empty() {
            return Ok(());
        }
        let ctx = TunnelContext {
            state_dir: self.temp_dir.join("tunnel"),
            tor_binary: self.tor_binary.clone(),
            tor_args: self.tor_args.clone(),
        };
        match self.tunnel_factory.start(token, name, &ctx).await {
            Ok(tunnel) => {
                let proxy_url = tunnel.socks5_proxy_url();
                state.tunnel = Some(tunnel);
                state.name = name.to_string();
                *self.proxy.write().await = Some(proxy_url.clone());
                tracing::info!(
                    target = "session",
                    tunnel = name,
                    proxy = %proxy_url,
                    "tunnel started"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    target = "session",
                    tunnel = name,
                    error = %err,
                    "cannot start tunnel"
                );
                Err(err)
            }
        }
    }

    /// Client for the selected probe service, selecting one if needed.
    /// Fails immediately when the token is already cancelled.
    pub async fn new_probe_services_client(
        &self,
        token: &CancellationToken,
    ) -> Result<services::Client> {
        if token.is_cancelled() {
            return Err(EngineError::Interrupted.into());
        }
        self.maybe_lookup_backends(token).await?;
        self.maybe_lookup_location(token).await?;
        let selected = self
            .backends
            .get()
            .ok_or_else(|| anyhow!("backend selection missing after lookup"))?;
        let proxied = self.proxy.read().await.is_some();
        services::Client::new(
            &selected.endpoint,
            self.http.clone(),
            self.user_agent(),
            proxied,
        )
    }

    /// Submitter bound to the selected probe service.
    pub async fn new_submitter(
        &self,
        token: &CancellationToken,
    ) -> Result<Box<dyn Submitter>> {
        let client = self.new_probe_services_client(token).await?;
        Ok(Box::new(ProbeServicesSubmitter::new(client)))
    }

    /// Builder for the named experiment, or an error for unknown names.
    pub fn new_experiment_builder(&self, name: &str) -> Result<ExperimentBuilder> {
        Ok(experiment::new_experiment_builder(name)?)
    }

    /// Close idle connections, stop the tunnel, release the temp dir.
    /// Safe to call any number of times; later calls return the first
    /// call's result without repeating the work.
    pub async fn close(&self) -> Result<()> {
        let result = self
            .close_result
            .get_or_init(|| self.close_impl())
            .await
            .clone();
        result.map_err(|message| anyhow!(message))
    }

    async fn close_impl(&self) -> Result<(), String> {
        self.http.close_idle_connections();
        self.resolver.close_idle_connections();
        let stats = self.resolver.stats();
        if !stats.is_empty() {
            tracing::info!(target = "session", "{stats}");
        }
        {
            let mut state = self.tunnel.lock().await;
            if let Some(tunnel) = state.tunnel.take() {
                tunnel.stop();
            }
            state.name.clear();
        }
        tokio::fs::remove_dir_all(&self.temp_dir)
            .await
            .map_err(|err| format!("remove {}: {err}", self.temp_dir.display()))
    }

    // Accessors. Location-derived ones fall back to compile-time defaults
    // until the first successful lookup.

    pub fn probe_asn(&self) -> u32 {
        self.location
            .get()
            .map(|location| location.asn)
            .unwrap_or(DEFAULT_PROBE_ASN)
    }

    pub fn probe_asn_string(&self) -> String {
        format!("AS{}", self.probe_asn())
    }

    pub fn probe_cc(&self) -> String {
        self.location
            .get()
            .map(|location| location.country_code.clone())
            .unwrap_or_else(|| DEFAULT_PROBE_CC.to_string())
    }

    pub fn probe_ip(&self) -> String {
        self.location
            .get()
            .map(|location| location.probe_ip.clone())
            .unwrap_or_else(|| DEFAULT_PROBE_IP.to_string())
    }

    pub fn probe_network_name(&self) -> String {
        self.location
            .get()
            .map(|location| location.network_name.clone())
            .unwrap_or_else(|| DEFAULT_PROBE_NETWORK_NAME.to_string())
    }

    pub fn resolver_asn(&self) -> u32 {
        self.location
            .get()
            .map(|location| location.resolver_asn)
            .unwrap_or(DEFAULT_RESOLVER_ASN)
    }

    pub fn resolver_asn_string(&self) -> String {
        format!("AS{}", self.resolver_asn())
    }

    pub fn resolver_ip(&self) -> String {
        self.location
            .get()
            .map(|location| location.resolver_ip.clone())
            .unwrap_or_else(|| DEFAULT_RESOLVER_IP.to_string())
    }

    pub fn resolver_network_name(&self) -> String {
        self.location
            .get()
            .map(|location| location.resolver_network_name.clone())
            .unwrap_or_else(|| DEFAULT_RESOLVER_NETWORK_NAME.to_string())
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.get()
    }

    /// The platform this probe runs on.
    pub fn platform() -> &'static str {
        if cfg!(target_os = "android") {
            "android"
        } else if cfg!(target_os = "ios") {
            "ios"
        } else if cfg!(target_os = "linux") {
            "linux"
        } else if cfg!(target_os = "macos") {
            "macos"
        } else if cfg!(target_os = "windows") {
            "windows"
        } else {
            "unknown"
        }
    }

    pub fn software_name(&self) -> &str {
        &self.software_name
    }

    pub fn software_version(&self) -> &str {
        &self.software_version
    }

    pub fn user_agent(&self) -> String {
        format!(
            "{}/{} {}/{}",
            self.software_name, self.software_version, ENGINE_NAME, ENGINE_VERSION
        )
    }

    pub fn asn_database_path(&self) -> PathBuf {
        self.assets_dir.join(ASN_DATABASE_NAME)
    }

    pub fn country_database_path(&self) -> PathBuf {
        self.assets_dir.join(COUNTRY_DATABASE_NAME)
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn tor_args(&self) -> &[String] {
        &self.tor_args
    }

    pub fn tor_binary(&self) -> Option<&Path> {
        self.tor_binary.as_deref()
    }

    pub fn key_value_store(&self) -> Arc<dyn KeyValueStore> {
        self.kv_store.clone()
    }

    pub fn http_client(&self) -> Arc<HttpClient> {
        self.http.clone()
    }

    pub fn resolver(&self) -> Arc<dyn Resolver> {
        self.resolver.clone()
    }

    pub async fn proxy_url(&self) -> Option<Url> {
        self.proxy.read().await.clone()
    }

    pub fn kibi_bytes_sent(&self) -> f64 {
        self.byte_counter.kibi_bytes_sent()
    }

    pub fn kibi_bytes_received(&self) -> f64 {
        self.byte_counter.kibi_bytes_received()
    }

    pub fn selected_probe_service(&self) -> Option<&ServiceEndpoint> {
        self.backends.get().map(|selected| &selected.endpoint)
    }

    /// Test helpers advertised by the selected probe service under the
    /// given name, if any.
    pub fn get_test_helpers_by_name(&self, name: &str) -> Option<Vec<ServiceEndpoint>> {
        self.backends
            .get()
            .and_then(|selected| selected.test_helpers.get(name).cloned())
    }

    /// How many probe-service selection attempts this session has made.
    pub fn probe_services_queries(&self) -> u64 {
        self.query_probe_services_count.load(Ordering::SeqCst)
    }
}

/// The slice of the session experiments are allowed to depend on:
/// identity accessors plus the capability providers they need to run.
pub trait ExperimentSession: Send + Sync {
    fn probe_asn_string(&self) -> String;
    fn probe_cc(&self) -> String;
    fn probe_ip(&self) -> String;
    fn probe_network_name(&self) -> String;
    fn resolver_ip(&self) -> String;
    fn software_name(&self) -> &str;
    fn software_version(&self) -> &str;
    fn user_agent(&self) -> String;
    fn temp_dir(&self) -> &Path;
    fn http_client(&self) -> Arc<HttpClient>;
    fn key_value_store(&self) -> Arc<dyn KeyValueStore>;
    fn get_test_helpers_by_name(&self, name: &str) -> Option<Vec<ServiceEndpoint>>;
}

impl ExperimentSession for Session {
    fn probe_asn_string(&self) -> String {
        Session::probe_asn_string(self)
    }

    fn probe_cc(&self) -> String {
        Session::probe_cc(self)
    }

    fn probe_ip(&self) -> String {
        Session::probe_ip(self)
    }

    fn probe_network_name(&self) -> String {
        Session::probe_network_name(self)
    }

    fn resolver_ip(&self) -> String {
        Session::resolver_ip(self)
    }

    fn software_name(&self) -> &str {
        Session::software_name(self)
    }

    fn software_version(&self) -> &str {
        Session::software_version(self)
    }

    fn user_agent(&self) -> String {
        Session::user_agent(self)
    }

    fn temp_dir(&self) -> &Path {
        Session::temp_dir(self)
    }

    fn http_client(&self) -> Arc<HttpClient> {
        Session::http_client(self)
    }

    fn key_value_store(&self) -> Arc<dyn KeyValueStore> {
        Session::key_value_store(self)
    }

    fn get_test_helpers_by_name(&self, name: &str) -> Option<Vec<ServiceEndpoint>> {
        Session::get_test_helpers_by_name(self, name)
    }
}
