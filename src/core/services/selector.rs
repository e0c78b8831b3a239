//! Benchmarks candidate probe services and picks the fastest live one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::http::HttpClient;

use super::client::Client;
use super::model::ServiceEndpoint;

/// Upper bound on one benchmark probe; a service slower than this loses
/// to the competition anyway.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of benchmarking one endpoint.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub endpoint: ServiceEndpoint,
    pub duration: Duration,
    pub err: Option<String>,
    pub test_helpers: HashMap<String, Vec<ServiceEndpoint>>,
}

/// Probe every distinct candidate in parallel, preserving input order in
/// the result. Each probe fetches the test-helper index over the session
/// transport, so a candidate that cannot even complete that round trip is
/// out of the race.
pub async fn try_all(
    http: &Arc<HttpClient>,
    user_agent: &str,
    endpoints: &[ServiceEndpoint],
    token: &CancellationToken,
) -> Vec<Candidate> {
    let proxied = http.dialer().proxy_url().await.is_some();

    let mut seen = HashSet::new();
    let distinct: Vec<ServiceEndpoint> = endpoints
        .iter()
        .filter(|endpoint| seen.insert((*endpoint).clone()))
        .cloned()
        .collect();

    let mut tasks: JoinSet<(usize, Candidate)> = JoinSet::new();
    for (index, endpoint) in distinct.into_iter().enumerate() {
        let http = http.clone();
        let user_agent = user_agent.to_string();
        let token = token.clone();
        tasks.spawn(async move {
            let candidate = probe_one(&http, &user_agent, proxied, endpoint, &token).await;
            (index, candidate)
        });
    }

    let mut ordered: Vec<(usize, Candidate)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(entry) = joined {
            ordered.push(entry);
        }
    }
    ordered.sort_by_key(|(index, _)| *index);
    ordered.into_iter().map(|(_, candidate)| candidate).collect()
}

async fn probe_one(
    http: &Arc<HttpClient>,
    user_agent: &str,
    proxied: bool,
    endpoint: ServiceEndpoint,
    token: &CancellationToken,
) -> Candidate {
    let start = Instant::now();
    let outcome = async {
        let client = Client::new(&endpoint, http.clone(), user_agent.to_string(), proxied)?;
        client.fetch_test_helpers(token).await
    };
    let result = timeout(PROBE_TIMEOUT, outcome).await;
    let duration = start.elapsed();
    match result {
        Ok(Ok(test_helpers)) => {
            tracing::debug!(
                target = "services",
                address = %endpoint.address,
                elapsed_ms = duration.as_millis() as u64,
                "candidate answered"
            );
            Candidate {
                endpoint,
                duration,
                err: None,
                test_helpers,
            }
        }
        Ok(Err(err)) => {
            tracing::debug!(
                target = "services",
                address = %endpoint.address,
                error = %err,
                "candidate failed"
            );
            Candidate {
                endpoint,
                duration,
                err: Some(err.to_string()),
                test_helpers: HashMap::new(),
            }
        }
        Err(_) => Candidate {
            endpoint,
            duration,
            err: Some("benchmark probe timed out".to_string()),
            test_helpers: HashMap::new(),
        },
    }
}

/// Keep the healthy candidates, return the fastest; ties go to the one
/// that came first in the input. `None` when every candidate failed.
pub fn select_best(candidates: Vec<Candidate>) -> Option<Candidate> {
    candidates
        .into_iter()
        .filter(|candidate| candidate.err.is_none())
        .min_by_key(|candidate| candidate.duration)
}
