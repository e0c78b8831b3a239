//! Tunnel capability: an out-of-band transport (tor, psiphon, …) whose
//! local SOCKS5 endpoint becomes the session proxy.

use std::path::PathBuf;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

/// A running tunnel. Stopped exactly once when the session closes.
pub trait Tunnel: Send + Sync {
    fn socks5_proxy_url(&self) -> Url;
    fn stop(&self);
}

impl std::fmt::Debug for dyn Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Tunnel").finish_non_exhaustive()
    }
}

/// Everything a tunnel implementation may need from the session to
/// bootstrap itself.
#[derive(Debug, Clone)]
pub struct TunnelContext {
    /// Scratch directory inside the session temp dir.
    pub state_dir: PathBuf,
    pub tor_binary: Option<PathBuf>,
    pub tor_args: Vec<String>,
}

/// Factory starting a tunnel by name. Implementations live outside the
/// engine; the session only drives the state machine around them.
#[async_trait]
pub trait TunnelFactory: Send + Sync {
    async fn start(
        &self,
        token: &CancellationToken,
        name: &str,
        ctx: &TunnelContext,
    ) -> Result<Box<dyn Tunnel>>;
}

/// Default factory for builds without tunnel support: every start fails.
pub struct NoTunnels;

#[async_trait]
impl TunnelFactory for NoTunnels {
    async fn start(
        &self,
        _token: &CancellationToken,
        name: &str,
        _ctx: &TunnelContext,
    ) -> Result<Box<dyn Tunnel>> {
        bail!("no tunnel support available for: {name}")
    }
}
