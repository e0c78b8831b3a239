//! Session resolver: maps hostnames to addresses through a ranked list of
//! DNS transports and remembers which transports actually work on the
//! current network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::{seq::SliceRandom, thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::core::errors::EngineError;
use crate::core::kvstore::KeyValueStore;

/// Capability the engine consumes wherever a hostname must become a list
/// of addresses. Mock implementations live in [`crate::core::testsupport`].
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_host(
        &self,
        token: &CancellationToken,
        domain: &str,
    ) -> Result<Vec<String>>;

    fn close_idle_connections(&self) {}

    fn stats(&self) -> String {
        String::new()
    }
}

/// Key-value store blob holding per-transport scores across sessions.
const STATE_KEY: &str = "sessionresolver.state";

/// Score given to a transport we have never tried. High on purpose so new
/// transports get exercised before the ranking settles.
const INITIAL_SCORE: f64 = 0.5;

/// Exponential moving average factor for score updates.
const EMA_ALPHA: f64 = 0.1;

/// How often a lookup ignores the ranking and tries transports in random
/// order, so the scores of rarely-used transports stay fresh.
const EXPLORATION_PROBABILITY: f64 = 0.1;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    System,
    DohCloudflare,
    DohGoogle,
}

#[derive(Debug, Clone, Copy)]
struct TransportEntry {
    id: &'static str,
    kind: TransportKind,
}

const TRANSPORTS: &[TransportEntry] = &[
    TransportEntry {
        id: "doh:cloudflare",
        kind: TransportKind::DohCloudflare,
    },
    TransportEntry {
        id: "doh:google",
        kind: TransportKind::DohGoogle,
    },
    TransportEntry {
        id: "system",
        kind: TransportKind::System,
    },
];

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    scores: HashMap<String, f64>,
}

/// Resolver used by the session for every engine-level lookup.
///
/// Transports are tried in decreasing score order; every attempt updates
/// the transport's moving average and the updated ranking is persisted
/// best-effort in the key-value store.
pub struct SessionResolver {
    kv_store: Arc<dyn KeyValueStore>,
    scores: Mutex<HashMap<String, f64>>,
    handles: Mutex<HashMap<&'static str, Arc<TokioAsyncResolver>>>,
}

impl SessionResolver {
    pub fn new(kv_store: Arc<dyn KeyValueStore>) -> Self {
        let scores = match kv_store
            .get(STATE_KEY)
            .ok()
            .and_then(|blob| serde_json::from_slice::<PersistedState>(&blob).ok())
        {
            Some(state) => state.scores,
            None => HashMap::new(),
        };
        Self {
            kv_store,
            scores: Mutex::new(scores),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn score_of(&self, id: &str) -> f64 {
        self.scores
            .lock()
            .ok()
            .and_then(|guard| guard.get(id).copied())
            .unwrap_or(INITIAL_SCORE)
    }

    fn record_outcome(&self, id: &str, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        let snapshot = {
            let mut guard = match self.scores.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let entry = guard.entry(id.to_string()).or_insert(INITIAL_SCORE);
            *entry = (1.0 - EMA_ALPHA) * *entry + EMA_ALPHA * sample;
            guard.clone()
        };
        let state = PersistedState { scores: snapshot };
        if let Ok(blob) = serde_json::to_vec(&state) {
            if let Err(err) = self.kv_store.set(STATE_KEY, &blob) {
                tracing::debug!(
                    target = "resolver",
                    error = %err,
                    "cannot persist resolver state"
                );
            }
        }
    }

    fn ranked_transports(&self) -> Vec<TransportEntry> {
        let mut ranked: Vec<TransportEntry> = TRANSPORTS.to_vec();
        ranked.sort_by(|a, b| {
            self.score_of(b.id)
                .partial_cmp(&self.score_of(a.id))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }

    fn transport_plan(&self) -> Vec<TransportEntry> {
        let mut plan = self.ranked_transports();
        let mut rng = thread_rng();
        if rng.gen::<f64>() < EXPLORATION_PROBABILITY {
            plan.shuffle(&mut rng);
        }
        plan
    }

    fn doh_handle(&self, entry: TransportEntry) -> Arc<TokioAsyncResolver> {
        let build = || {
            let group = match entry.kind {
                TransportKind::DohCloudflare => NameServerConfigGroup::cloudflare_https(),
                TransportKind::DohGoogle => NameServerConfigGroup::google_https(),
                TransportKind::System => NameServerConfigGroup::new(),
            };
            let config = ResolverConfig::from_parts(None, Vec::new(), group);
            Arc::new(TokioAsyncResolver::tokio(config, ResolverOpts::default()))
        };
        match self.handles.lock() {
            Ok(mut guard) => guard.entry(entry.id).or_insert_with(build).clone(),
            // Poisoned cache: serve an uncached handle for this lookup.
            Err(_) => build(),
        }
    }

    async fn lookup_with(
        &self,
        entry: TransportEntry,
        domain: &str,
    ) -> Result<Vec<String>> {
        match entry.kind {
            TransportKind::System => {
                let addrs = tokio::net::lookup_host((domain, 443))
                    .await
                    .with_context(|| format!("system dns lookup of {domain}"))?;
                let mut out: Vec<String> = Vec::new();
                for addr in addrs {
                    let ip = addr.ip().to_string();
                    if !out.contains(&ip) {
                        out.push(ip);
                    }
                }
                Ok(out)
            }
            TransportKind::DohCloudflare | TransportKind::DohGoogle => {
                let handle = self.doh_handle(entry);
                let response = handle
                    .lookup_ip(domain)
                    .await
                    .with_context(|| format!("{} lookup of {domain}", entry.id))?;
                Ok(response.iter().map(|ip| ip.to_string()).collect())
            }
        }
    }
}

#[async_trait]
impl Resolver for SessionResolver {
    async fn lookup_host(
        &self,
        token: &CancellationToken,
        domain: &str,
    ) -> Result<Vec<String>> {
        if token.is_cancelled() {
            return Err(EngineError::Interrupted.into());
        }
        let mut last_err: Option<anyhow::Error> = None;
        for entry in self.transport_plan() {
            let attempt = timeout(LOOKUP_TIMEOUT, self.lookup_with(entry, domain));
            let outcome = tokio::select! {
                _ = token.cancelled() => return Err(EngineError::Interrupted.into()),
                outcome = attempt => outcome,
            };
            match outcome {
                Ok(Ok(addrs)) if !addrs.is_empty() => {
                    self.record_outcome(entry.id, true);
                    tracing::debug!(
                        target = "resolver",
                        transport = entry.id,
                        domain,
                        count = addrs.len(),
                        "lookup succeeded"
                    );
                    return Ok(addrs);
                }
                Ok(Ok(_)) => {
                    self.record_outcome(entry.id, false);
                    last_err = Some(anyhow!("{}: empty answer for {domain}", entry.id));
                }
                Ok(Err(err)) => {
                    self.record_outcome(entry.id, false);
                    tracing::debug!(
                        target = "resolver",
                        transport = entry.id,
                        domain,
                        error = %err,
                        "lookup failed"
                    );
                    last_err = Some(err);
                }
                Err(_) => {
                    self.record_outcome(entry.id, false);
                    last_err = Some(anyhow!("{}: lookup of {domain} timed out", entry.id));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no DNS transport available")))
    }

    fn close_idle_connections(&self) {
        if let Ok(mut guard) = self.handles.lock() {
            guard.clear();
        }
    }

    fn stats(&self) -> String {
        let snapshot = self
            .scores
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        let mut entries: Vec<(String, f64)> = snapshot.into_iter().collect();
        entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let rendered: Vec<String> = entries
            .iter()
            .map(|(id, score)| format!("{id}={score:.3}"))
            .collect();
        format!("sessionresolver: {}", rendered.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kvstore::MemoryKvStore;

    fn new_resolver() -> SessionResolver {
        SessionResolver::new(Arc::new(MemoryKvStore::new()))
    }

    #[test]
    fn unseen_transports_share_the_initial_score() {
        let resolver = new_resolver();
        assert_eq!(resolver.score_of("doh:cloudflare"), INITIAL_SCORE);
        assert_eq!(resolver.score_of("system"), INITIAL_SCORE);
    }

    #[test]
    fn outcomes_move_the_ranking() {
        let resolver = new_resolver();
        resolver.record_outcome("system", true);
        resolver.record_outcome("doh:cloudflare", false);
        let ranked = resolver.ranked_transports();
        assert_eq!(ranked[0].id, "system");
        assert_eq!(ranked.last().unwrap().id, "doh:cloudflare");
    }

    #[test]
    fn state_round_trips_through_the_kvstore() {
        let store = Arc::new(MemoryKvStore::new());
        {
            let resolver = SessionResolver::new(store.clone());
            resolver.record_outcome("doh:google", true);
        }
        let resolver = SessionResolver::new(store);
        assert!(resolver.score_of("doh:google") > INITIAL_SCORE);
    }

    #[test]
    fn stats_render_sorted_scores() {
        let resolver = new_resolver();
        resolver.record_outcome("system", true);
        resolver.record_outcome("doh:google", false);
        let stats = resolver.stats();
        assert!(stats.starts_with("sessionresolver: "));
        let system_at = stats.find("system=").unwrap();
        let google_at = stats.find("doh:google=").unwrap();
        assert!(system_at < google_at);
    }

    #[tokio::test]
    async fn cancelled_token_interrupts_immediately() {
        let resolver = new_resolver();
        let token = CancellationToken::new();
        token.cancel();
        let err = resolver.lookup_host(&token, "www.example.com").await;
        let err = err.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Interrupted)
        ));
    }
}
